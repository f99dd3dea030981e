//! Cross-thread configuration commands.
//!
//! Foreign threads never touch a running stream's state directly. They
//! enqueue a `Command`; the capture thread drains the queue once per cycle
//! while it holds the pipeline lock and applies each command in FIFO order.

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender};

use crate::chain::StageSelector;
use crate::ingest::InputSource;
use crate::params::ParamValue;
use crate::persist::SourceDescriptor;
use crate::stage::SharedStage;
use crate::transform::Region;

/// One queued mutation of stream state.
pub enum Command {
    ResizeTo { width: u32, height: u32 },
    SetRoi(Region),
    SetOutputRegion(Region),
    SetUseRoi(bool),
    SetMirror { mirror: bool, flip: bool },
    /// Build a source through the registry and swap it in.
    SetInputSource(SourceDescriptor),
    /// Swap in an already constructed source.
    ReplaceInputSource(Box<dyn InputSource>),
    SetCaptureResolution { width: u32, height: u32 },
    /// Insert at `index`, or append when `None`.
    AddStage { stage: SharedStage, index: Option<usize> },
    RemoveStage(StageSelector),
    SwapStages(usize, usize),
    SetStageActive { stage: StageSelector, active: bool },
    SetStageParameter { stage: StageSelector, name: String, value: ParamValue },
    /// Replace the whole chain, keeping stage names verbatim.
    RestoreStages(Vec<SharedStage>),
}

impl Command {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Command::ResizeTo { .. } => "resize",
            Command::SetRoi(_) => "set-roi",
            Command::SetOutputRegion(_) => "set-output-region",
            Command::SetUseRoi(_) => "set-use-roi",
            Command::SetMirror { .. } => "set-mirror",
            Command::SetInputSource(_) => "set-input-source",
            Command::ReplaceInputSource(_) => "replace-input-source",
            Command::SetCaptureResolution { .. } => "set-capture-resolution",
            Command::AddStage { .. } => "add-stage",
            Command::RemoveStage(_) => "remove-stage",
            Command::SwapStages(..) => "swap-stages",
            Command::SetStageActive { .. } => "set-stage-active",
            Command::SetStageParameter { .. } => "set-stage-parameter",
            Command::RestoreStages(_) => "restore-stages",
        }
    }
}

/// Multi-producer handle for enqueuing commands. Cheap to clone and safe to
/// move to any thread.
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<Command>,
}

impl CommandSender {
    pub fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|err| anyhow!("command queue closed, dropped {}", err.0.label()))
    }
}

/// Unbounded FIFO of commands with a single consumer.
pub struct CommandQueue {
    tx: Sender<Command>,
    rx: Receiver<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> CommandSender {
        CommandSender {
            tx: self.tx.clone(),
        }
    }

    pub fn push(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|err| anyhow!("command queue closed, dropped {}", err.0.label()))
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Apply every command queued at the time of the call, oldest first.
    /// Commands that arrive meanwhile wait for the next drain.
    pub fn drain<F: FnMut(Command)>(&self, mut apply: F) -> usize {
        let pending = self.rx.len();
        let mut applied = 0;
        for _ in 0..pending {
            match self.rx.try_recv() {
                Ok(command) => {
                    apply(command);
                    applied += 1;
                }
                Err(_) => break,
            }
        }
        applied
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn drain_is_fifo_across_producers() -> Result<()> {
        let queue = CommandQueue::new();
        let sender = queue.sender();
        let worker = thread::spawn(move || -> Result<()> {
            for i in 0..5u32 {
                sender.send(Command::ResizeTo {
                    width: i + 1,
                    height: 1,
                })?;
            }
            Ok(())
        });
        worker.join().expect("producer thread")?;
        queue.push(Command::SetUseRoi(true))?;

        let mut seen = Vec::new();
        let applied = queue.drain(|command| match command {
            Command::ResizeTo { width, .. } => seen.push(width),
            other => {
                assert_eq!(other.label(), "set-use-roi");
                seen.push(0);
            }
        });

        assert_eq!(applied, 6);
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 0]);
        assert!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn commands_pushed_during_drain_wait() -> Result<()> {
        let queue = CommandQueue::new();
        let sender = queue.sender();
        queue.push(Command::SetUseRoi(false))?;

        let applied = queue.drain(|_| {
            sender
                .send(Command::SetUseRoi(true))
                .expect("queue open");
        });

        assert_eq!(applied, 1);
        assert_eq!(queue.len(), 1);
        Ok(())
    }
}
