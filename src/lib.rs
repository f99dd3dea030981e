//! vidchain
//!
//! Live video ingestion with a reconfigurable frame-processing chain.
//!
//! # Architecture
//!
//! Each [`VideoStream`] runs one capture thread. Per cycle the thread takes
//! the pipeline lock, applies queued commands, polls its input source, and
//! pushes a new frame through the ordered stage chain:
//!
//! 1. **Prepare**: mirror/flip, resize to the processing size, and warp the
//!    ROI quad onto the processing rectangle when ROI mode is on.
//! 2. **Chain**: every active stage runs in order on a shared
//!    [`FrameBundle`], notifying its own listeners right after it finishes.
//! 3. **Publish**: the final result, the untouched capture and the current
//!    FPS go to the stream's listeners and the latest-frame slot.
//!
//! # Module Structure
//!
//! - `registry`: name to factory maps for stages and input sources
//! - `transform`: regions and the homographies between them
//! - `stage`: the stage contract and the built-in stages
//! - `chain`: ordered stage list, naming, aggregate parameters
//! - `command`: typed cross-thread commands and their queue
//! - `ingest`: input sources (synthetic, manual, V4L2)
//! - `stream`: the orchestrator and its capture thread
//! - `persist`: descriptors for saving and restoring a stream
//! - `config`: daemon configuration from file and environment

pub mod chain;
pub mod command;
pub mod config;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod params;
pub mod persist;
pub mod registry;
pub mod stage;
pub mod stream;
pub mod transform;

pub use chain::{ChainContext, ChainEvent, StageChain, StageSelector, AGGREGATE_GROUP};
pub use command::{Command, CommandQueue, CommandSender};
pub use events::{StageOutput, StageResult, StreamFrame, StreamOutput};
pub use frame::{FpsCounter, FrameBundle};
pub use ingest::{CaptureSettings, FrameFeeder, InputSource, ManualSource, SyntheticSource};
pub use params::{ParamValue, Parameter, ParameterGroup};
pub use persist::{SourceDescriptor, StageDescriptor, StreamDescriptor};
pub use registry::{Registry, SourceRegistry, StageRegistry};
pub use stage::{shared, SharedStage, Stage, StageCore};
pub use stream::{StreamOptions, StreamState, VideoStream};
pub use transform::{Region, TransformState};
