//! Ordered stage chain.
//!
//! The chain owns the stage list for one stream and keeps three things in
//! step with it on every topology change:
//! - each stage's processing size and back-reference,
//! - the aggregate parameter view (one group per attached stage, in order),
//! - chain events for subscribers.
//!
//! The chain is not internally synchronized. The stream keeps it under its
//! pipeline lock, so every mutation happens on one thread at a time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, MutexGuard};

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender};

use crate::frame::FrameBundle;
use crate::params::{ParamValue, ParameterGroup};
use crate::stage::{SharedStage, Stage};

/// Name of the aggregate parameter group.
pub const AGGREGATE_GROUP: &str = "Video Processes";

/// Identity shared with attached stages through a weak back-reference.
#[derive(Debug)]
pub struct ChainContext {
    name: String,
    width: AtomicU32,
    height: AtomicU32,
}

impl ChainContext {
    pub fn new(name: &str, width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            width: AtomicU32::new(width),
            height: AtomicU32::new(height),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn processing_size(&self) -> (u32, u32) {
        (
            self.width.load(Ordering::Acquire),
            self.height.load(Ordering::Acquire),
        )
    }

    fn set_processing_size(&self, width: u32, height: u32) {
        self.width.store(width, Ordering::Release);
        self.height.store(height, Ordering::Release);
    }
}

/// Addresses a stage by position or by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageSelector {
    Index(usize),
    Name(String),
}

impl From<usize> for StageSelector {
    fn from(index: usize) -> Self {
        StageSelector::Index(index)
    }
}

impl From<&str> for StageSelector {
    fn from(name: &str) -> Self {
        StageSelector::Name(name.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    StageAdded { name: String, index: usize },
    StageRemoved { name: String, index: usize },
    OrderChanged { first: usize, second: usize },
}

fn lock_stage(stage: &SharedStage) -> Result<MutexGuard<'_, dyn Stage + 'static>> {
    stage.lock().map_err(|_| anyhow!("stage lock poisoned"))
}

fn same_stage(a: &SharedStage, b: &SharedStage) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Pick a unique name for a stage joining a chain whose stages are named
/// `existing`.
///
/// When any existing name is a substring of `candidate`, `_<n>` is appended,
/// with `n` starting at the chain length after insertion and counting up
/// until no existing stage carries the result.
pub(crate) fn resolve_name(existing: &[String], candidate: &str) -> String {
    if !existing.iter().any(|name| candidate.contains(name.as_str())) {
        return candidate.to_string();
    }
    let mut n = existing.len() + 1;
    loop {
        let renamed = format!("{}_{}", candidate, n);
        if !existing.contains(&renamed) {
            return renamed;
        }
        n += 1;
    }
}

pub struct StageChain {
    context: Arc<ChainContext>,
    stages: Vec<SharedStage>,
    view: ParameterGroup,
    subscribers: Vec<Sender<ChainEvent>>,
}

impl StageChain {
    pub fn new(context: Arc<ChainContext>) -> Self {
        Self {
            context,
            stages: Vec::new(),
            view: ParameterGroup::new(AGGREGATE_GROUP),
            subscribers: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<ChainContext> {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[SharedStage] {
        &self.stages
    }

    pub fn stage_at(&self, index: usize) -> Option<SharedStage> {
        self.stages.get(index).cloned()
    }

    pub fn stage_named(&self, name: &str) -> Option<SharedStage> {
        self.position(&StageSelector::Name(name.to_string()))
            .map(|index| self.stages[index].clone())
    }

    /// Stage names in chain order. Poisoned stages are skipped.
    pub fn names(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter_map(|stage| stage.lock().ok().map(|guard| guard.name().to_string()))
            .collect()
    }

    /// The aggregate parameter view as of the last sync.
    pub fn parameters(&self) -> &ParameterGroup {
        &self.view
    }

    pub fn subscribe(&mut self) -> Receiver<ChainEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: ChainEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn position(&self, selector: &StageSelector) -> Option<usize> {
        match selector {
            StageSelector::Index(index) => (*index < self.stages.len()).then_some(*index),
            StageSelector::Name(name) => self.stages.iter().position(|stage| {
                stage
                    .lock()
                    .map(|guard| guard.name() == name.as_str())
                    .unwrap_or(false)
            }),
        }
    }

    /// Insert `stage` at `index` (clamped to the chain length).
    ///
    /// The stage is sized and set up, renamed if its name collides, attached
    /// to this chain, and announced with `ChainEvent::StageAdded`.
    pub fn add_stage(&mut self, stage: SharedStage, index: usize) -> Result<()> {
        if self.stages.iter().any(|existing| same_stage(existing, &stage)) {
            return Err(anyhow!(
                "{}: stage is already attached to this chain",
                self.context.name()
            ));
        }
        let existing = self.names();
        let index = index.min(self.stages.len());
        let name = {
            let mut guard = lock_stage(&stage)?;
            let (width, height) = self.context.processing_size();
            guard.set_process_size(width, height);
            let resolved = resolve_name(&existing, guard.name());
            if resolved != guard.name() {
                log::debug!(
                    "{}: renamed stage '{}' to '{}'",
                    self.context.name(),
                    guard.name(),
                    resolved
                );
                guard.set_name(&resolved);
            }
            guard.core_mut().attach(&self.context);
            resolved
        };
        self.stages.insert(index, stage);
        self.sync_aggregate_view();
        log::info!("{}: added stage '{}' at {}", self.context.name(), name, index);
        self.emit(ChainEvent::StageAdded { name, index });
        Ok(())
    }

    pub fn push_stage(&mut self, stage: SharedStage) -> Result<()> {
        let index = self.stages.len();
        self.add_stage(stage, index)
    }

    /// Detach and return the selected stage. A missing target is logged and
    /// leaves the chain unchanged.
    pub fn remove_stage(&mut self, selector: &StageSelector) -> Option<SharedStage> {
        let Some(index) = self.position(selector) else {
            log::warn!(
                "{}: no stage matches {:?}, nothing removed",
                self.context.name(),
                selector
            );
            return None;
        };
        let stage = self.stages.remove(index);
        let name = match stage.lock() {
            Ok(mut guard) => {
                guard.core_mut().detach();
                guard.name().to_string()
            }
            Err(_) => String::new(),
        };
        self.sync_aggregate_view();
        log::info!("{}: removed stage '{}'", self.context.name(), name);
        self.emit(ChainEvent::StageRemoved { name, index });
        Some(stage)
    }

    /// Exchange two stages. Both are set up again before the swap.
    /// Out-of-range indices are rejected without touching the chain.
    pub fn swap(&mut self, first: usize, second: usize) -> Result<()> {
        let len = self.stages.len();
        if first >= len || second >= len {
            return Err(anyhow!(
                "{}: swap index out of range ({}, {}) for {} stages",
                self.context.name(),
                first,
                second,
                len
            ));
        }
        lock_stage(&self.stages[first])?.setup();
        lock_stage(&self.stages[second])?.setup();
        self.stages.swap(first, second);
        self.sync_aggregate_view();
        self.emit(ChainEvent::OrderChanged { first, second });
        Ok(())
    }

    /// Remove every stage, announcing each removal.
    pub fn clear(&mut self) {
        while !self.stages.is_empty() {
            let last = self.stages.len() - 1;
            self.remove_stage(&StageSelector::Index(last));
        }
    }

    /// Replace the chain with `stages`, keeping their names verbatim.
    pub fn restore(&mut self, stages: Vec<SharedStage>) -> Result<()> {
        self.clear();
        let (width, height) = self.context.processing_size();
        for stage in stages {
            let name = {
                let mut guard = lock_stage(&stage)?;
                guard.set_process_size(width, height);
                guard.core_mut().attach(&self.context);
                guard.name().to_string()
            };
            let index = self.stages.len();
            self.stages.push(stage);
            self.emit(ChainEvent::StageAdded { name, index });
        }
        self.sync_aggregate_view();
        Ok(())
    }

    pub fn set_stage_active(&mut self, selector: &StageSelector, active: bool) -> Result<()> {
        let index = self
            .position(selector)
            .ok_or_else(|| anyhow!("{}: no stage matches {:?}", self.context.name(), selector))?;
        lock_stage(&self.stages[index])?.set_active(active);
        self.sync_aggregate_view();
        Ok(())
    }

    pub fn set_stage_parameter(
        &mut self,
        selector: &StageSelector,
        name: &str,
        value: &ParamValue,
    ) -> Result<()> {
        let index = self
            .position(selector)
            .ok_or_else(|| anyhow!("{}: no stage matches {:?}", self.context.name(), selector))?;
        lock_stage(&self.stages[index])?.set_parameter(name, value)?;
        self.sync_aggregate_view();
        Ok(())
    }

    /// Resize every stage. Each one runs `setup()` again.
    pub fn set_process_size(&mut self, width: u32, height: u32) {
        self.context.set_processing_size(width, height);
        for stage in &self.stages {
            match stage.lock() {
                Ok(mut guard) => guard.set_process_size(width, height),
                Err(_) => log::error!("{}: stage lock poisoned on resize", self.context.name()),
            }
        }
    }

    /// Rebuild the aggregate view from the attached stages, in order.
    pub fn sync_aggregate_view(&mut self) {
        let mut view = ParameterGroup::new(AGGREGATE_GROUP);
        for stage in &self.stages {
            match stage.lock() {
                Ok(guard) => view.add_group(guard.describe()),
                Err(_) => log::error!("{}: stage lock poisoned", self.context.name()),
            }
        }
        self.view = view;
    }

    /// Run every active stage over `frame`, in order. Each stage notifies
    /// its listeners right after its own `process()`. A failing stage is
    /// logged and the next one still runs. Returns the number of stages run.
    pub fn run(&self, frame: &mut FrameBundle) -> usize {
        let mut ran = 0;
        for stage in &self.stages {
            let mut guard = match stage.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    log::error!("{}: skipping poisoned stage", self.context.name());
                    continue;
                }
            };
            if !guard.is_active() {
                continue;
            }
            if let Err(err) = guard.process(frame) {
                log::error!(
                    "{}: stage '{}' failed: {:#}",
                    self.context.name(),
                    guard.name(),
                    err
                );
                continue;
            }
            guard.notify_events();
            ran += 1;
        }
        ran
    }
}
