//! Stage contract.
//!
//! A stage is one named, independently configurable unit of work in a chain.
//! It mutates the cycle's `FrameBundle` in place and then publishes its own
//! output to listeners.
//!
//! Lifecycle: created, `setup()` at least once, toggled active/inactive any
//! number of times, removed. `setup()` runs again after every processing
//! size change before the next `process()`.

mod builtin;

use std::sync::{Arc, Mutex, Weak};

use anyhow::{anyhow, Result};
use image::{DynamicImage, GenericImageView};

use crate::chain::ChainContext;
use crate::events::{StageListeners, StageOutput};
use crate::frame::FrameBundle;
use crate::params::{ParamValue, Parameter, ParameterGroup};

pub use builtin::{ImageAdjustmentsStage, MorphologyMode, MorphologyStage, ThresholdStage};

/// Parameter key holding the stage type name in `describe()`.
pub const TYPE_KEY: &str = "type";
/// Parameter key holding the activation flag in `describe()`.
pub const ACTIVE_KEY: &str = "active";

/// Shared stage handle. The chain and any observers hold clones.
pub type SharedStage = Arc<Mutex<dyn Stage>>;

/// Wrap a concrete stage into a shared handle.
pub fn shared<S: Stage + 'static>(stage: S) -> SharedStage {
    Arc::new(Mutex::new(stage))
}

/// Unit of work applied to each frame.
///
/// Implementors provide access to their `StageCore` plus `type_name` and
/// `process`. Everything else has defaults built on the core.
pub trait Stage: Send {
    fn core(&self) -> &StageCore;
    fn core_mut(&mut self) -> &mut StageCore;

    /// Registry name of the stage type.
    fn type_name(&self) -> &'static str;

    /// Transform the bundle in place. Must write `result` on success.
    fn process(&mut self, frame: &mut FrameBundle) -> Result<()>;

    /// Stage-specific parameters, excluding name and activation.
    fn parameters(&self) -> Vec<Parameter> {
        Vec::new()
    }

    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        Err(anyhow!(
            "{} has no parameter '{}' (value {})",
            self.type_name(),
            name,
            value
        ))
    }

    /// Hook for stage-specific allocation, run at the end of `setup()`.
    fn on_setup(&mut self) {}

    /// (Re)allocate buffers for the current processing size. Idempotent.
    fn setup(&mut self) {
        self.core_mut().allocate();
        self.on_setup();
    }

    fn set_process_size(&mut self, width: u32, height: u32) {
        self.core_mut().set_size(width, height);
        self.setup();
    }

    /// Fire fast and safe output notifications for the last `process()`.
    fn notify_events(&mut self) {
        self.core_mut().notify();
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn set_name(&mut self, name: &str) {
        self.core_mut().name = name.to_string();
    }

    fn is_active(&self) -> bool {
        self.core().active
    }

    fn set_active(&mut self, active: bool) {
        self.core_mut().active = active;
    }

    /// Last output written by `process()`.
    fn output(&self) -> &DynamicImage {
        &self.core().output
    }

    /// Parameter group holding type, activation and stage parameters.
    fn describe(&self) -> ParameterGroup {
        let mut group = ParameterGroup::new(self.name());
        group.add(Parameter::new(TYPE_KEY, self.type_name()));
        group.add(Parameter::new(ACTIVE_KEY, self.is_active()));
        for parameter in self.parameters() {
            group.add(parameter);
        }
        group
    }

    /// Apply a list of parameters. Every entry is attempted; the first
    /// failure is returned after the rest were applied.
    fn apply_parameters(&mut self, parameters: &[Parameter]) -> Result<()> {
        let mut first_error = None;
        for parameter in parameters {
            let outcome = match parameter.name.as_str() {
                TYPE_KEY => Ok(()),
                ACTIVE_KEY => crate::params::expect_bool(ACTIVE_KEY, &parameter.value)
                    .map(|active| self.set_active(active)),
                name => self.set_parameter(name, &parameter.value),
            };
            if let Err(err) = outcome {
                log::warn!("{}: {:#}", self.name(), err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ----------------------------------------------------------------------------
// StageCore
// ----------------------------------------------------------------------------

/// State every stage carries: identity, activation, sized output buffer,
/// listeners and the back-reference to the owning chain.
pub struct StageCore {
    name: String,
    active: bool,
    width: u32,
    height: u32,
    output: DynamicImage,
    listeners: StageListeners,
    context: Weak<ChainContext>,
}

impl StageCore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            active: true,
            width: 0,
            height: 0,
            output: DynamicImage::new_luma8(0, 0),
            listeners: StageListeners::default(),
            context: Weak::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub(crate) fn set_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    /// Resize the output buffer when its dimensions differ from the
    /// processing size. A matching buffer is left as is.
    pub fn allocate(&mut self) {
        if self.output.dimensions() != (self.width, self.height) {
            self.output = DynamicImage::new_luma8(self.width, self.height);
        }
    }

    /// Store `image` as this stage's output and write it to the bundle.
    pub fn publish(&mut self, frame: &mut FrameBundle, image: DynamicImage) {
        frame.publish(&image);
        self.output = image;
    }

    pub fn listeners_mut(&mut self) -> &mut StageListeners {
        &mut self.listeners
    }

    /// The owning chain, while attached.
    pub fn context(&self) -> Option<Arc<ChainContext>> {
        self.context.upgrade()
    }

    pub(crate) fn attach(&mut self, context: &Arc<ChainContext>) {
        self.context = Arc::downgrade(context);
    }

    pub(crate) fn detach(&mut self) {
        self.context = Weak::new();
    }

    fn notify(&mut self) {
        let context = self.context.upgrade();
        let output = StageOutput {
            chain: context.as_deref().map(ChainContext::name).unwrap_or(""),
            stage: &self.name,
            image: &self.output,
        };
        self.listeners.notify(&output);
    }
}
