use anyhow::{anyhow, Result};
use image::DynamicImage;
use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate, erode};

use crate::frame::FrameBundle;
use crate::params::{expect_int_in, ParamValue, Parameter};
use crate::stage::{Stage, StageCore};

const KERNEL_SIZE: &str = "kernel_size";
const SHAPE: &str = "shape";
const MODE: &str = "mode";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MorphologyMode {
    Erode,
    Dilate,
}

/// Grayscale erosion or dilation with a square (`shape` 0) or diamond
/// (`shape` 1) structuring element of radius `kernel_size`.
pub struct MorphologyStage {
    core: StageCore,
    kernel_size: u8,
    norm: Norm,
    mode: MorphologyMode,
}

impl MorphologyStage {
    pub const TYPE_NAME: &'static str = "morphology";

    pub fn new() -> Self {
        Self {
            core: StageCore::new(Self::TYPE_NAME),
            kernel_size: 1,
            norm: Norm::LInf,
            mode: MorphologyMode::Erode,
        }
    }

    pub fn with_mode(mut self, mode: MorphologyMode) -> Self {
        self.mode = mode;
        self
    }

    fn shape_index(&self) -> i64 {
        match self.norm {
            Norm::L1 => 1,
            _ => 0,
        }
    }
}

impl Default for MorphologyStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for MorphologyStage {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mode = match self.mode {
            MorphologyMode::Erode => 0i64,
            MorphologyMode::Dilate => 1,
        };
        vec![
            Parameter::new(KERNEL_SIZE, self.kernel_size as i64).with_range(1i64, 25i64),
            Parameter::new(SHAPE, self.shape_index()).with_range(0i64, 1i64),
            Parameter::new(MODE, mode).with_range(0i64, 1i64),
        ]
    }

    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        match name {
            KERNEL_SIZE => self.kernel_size = expect_int_in(name, value, 1, 25)? as u8,
            SHAPE => {
                self.norm = match expect_int_in(name, value, 0, 1)? {
                    0 => Norm::LInf,
                    _ => Norm::L1,
                }
            }
            MODE => {
                self.mode = match expect_int_in(name, value, 0, 1)? {
                    0 => MorphologyMode::Erode,
                    _ => MorphologyMode::Dilate,
                }
            }
            _ => return Err(anyhow!("morphology has no parameter '{}'", name)),
        }
        Ok(())
    }

    fn process(&mut self, frame: &mut FrameBundle) -> Result<()> {
        let gray = frame.stream.to_luma8();
        let output = match self.mode {
            MorphologyMode::Erode => erode(&gray, self.norm, self.kernel_size),
            MorphologyMode::Dilate => dilate(&gray, self.norm, self.kernel_size),
        };
        self.core.publish(frame, DynamicImage::ImageLuma8(output));
        Ok(())
    }
}
