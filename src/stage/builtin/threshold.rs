use anyhow::Result;
use image::DynamicImage;
use imageproc::contrast::{threshold, ThresholdType};

use crate::frame::FrameBundle;
use crate::params::{expect_int_in, ParamValue, Parameter};
use crate::stage::{Stage, StageCore};

const LEVEL: &str = "level";

/// Binarizes the stream: pixels brighter than `level` become 255, all
/// others 0. Color input is converted to grayscale first.
pub struct ThresholdStage {
    core: StageCore,
    level: u8,
}

impl ThresholdStage {
    pub const TYPE_NAME: &'static str = "threshold";

    pub fn new() -> Self {
        Self::with_level(127)
    }

    pub fn with_level(level: u8) -> Self {
        Self {
            core: StageCore::new(Self::TYPE_NAME),
            level,
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }
}

impl Default for ThresholdStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for ThresholdStage {
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
        vec![Parameter::new(LEVEL, self.level as i64).with_range(0i64, 255i64)]
    }

    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        match name {
            LEVEL => {
                self.level = expect_int_in(name, value, 0, 255)? as u8;
                Ok(())
            }
            _ => Err(anyhow::anyhow!("threshold has no parameter '{}'", name)),
        }
    }

    fn process(&mut self, frame: &mut FrameBundle) -> Result<()> {
        let gray = frame.stream.to_luma8();
        let binary = threshold(&gray, self.level, ThresholdType::Binary);
        self.core.publish(frame, DynamicImage::ImageLuma8(binary));
        Ok(())
    }
}
