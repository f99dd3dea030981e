use anyhow::{anyhow, Result};
use image::DynamicImage;
use imageproc::contrast::equalize_histogram;

use crate::frame::FrameBundle;
use crate::params::{expect_bool, expect_float_in, ParamValue, Parameter};
use crate::stage::{Stage, StageCore};

const AUTO_LEVELS: &str = "auto_levels";
const GAMMA: &str = "gamma";
const BRIGHTNESS: &str = "brightness";
const CONTRAST: &str = "contrast";

/// Grayscale tone adjustments: optional histogram equalization followed by
/// a gamma curve and a brightness/contrast ramp, applied as one lookup table.
pub struct ImageAdjustmentsStage {
    core: StageCore,
    auto_levels: bool,
    gamma: f64,
    brightness: f64,
    contrast: f64,
    lut: [u8; 256],
}

impl ImageAdjustmentsStage {
    pub const TYPE_NAME: &'static str = "image_adjustments";

    pub fn new() -> Self {
        let mut stage = Self {
            core: StageCore::new(Self::TYPE_NAME),
            auto_levels: false,
            gamma: 1.0,
            brightness: 0.0,
            contrast: 0.0,
            lut: [0; 256],
        };
        stage.rebuild_lut();
        stage
    }

    /// Gamma is cubed so the 0..2 control range spans a useful curve.
    fn rebuild_lut(&mut self) {
        let exponent = self.gamma.powi(3);
        let gain = self.contrast + 1.0;
        let offset = self.brightness * 60.0;
        for (i, entry) in self.lut.iter_mut().enumerate() {
            let curved = saturate((i as f64 / 255.0).powf(exponent) * 255.0);
            *entry = saturate(gain * curved as f64 + offset);
        }
    }

    fn lut_is_identity(&self) -> bool {
        self.lut.iter().enumerate().all(|(i, v)| *v as usize == i)
    }
}

impl Default for ImageAdjustmentsStage {
    fn default() -> Self {
        Self::new()
    }
}

fn saturate(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

impl Stage for ImageAdjustmentsStage {
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
        vec![
            Parameter::new(AUTO_LEVELS, self.auto_levels),
            Parameter::new(GAMMA, self.gamma).with_range(0.0, 2.0),
            Parameter::new(BRIGHTNESS, self.brightness).with_range(-1.0, 1.0),
            Parameter::new(CONTRAST, self.contrast).with_range(-1.0, 1.0),
        ]
    }

    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        match name {
            AUTO_LEVELS => self.auto_levels = expect_bool(name, value)?,
            GAMMA => self.gamma = expect_float_in(name, value, 0.0, 2.0)?,
            BRIGHTNESS => self.brightness = expect_float_in(name, value, -1.0, 1.0)?,
            CONTRAST => self.contrast = expect_float_in(name, value, -1.0, 1.0)?,
            _ => return Err(anyhow!("image_adjustments has no parameter '{}'", name)),
        }
        self.rebuild_lut();
        Ok(())
    }

    fn process(&mut self, frame: &mut FrameBundle) -> Result<()> {
        let mut gray = frame.stream.to_luma8();
        if self.auto_levels {
            gray = equalize_histogram(&gray);
        }
        if !self.lut_is_identity() {
            for pixel in gray.pixels_mut() {
                pixel.0[0] = self.lut[pixel.0[0] as usize];
            }
        }
        self.core.publish(frame, DynamicImage::ImageLuma8(gray));
        Ok(())
    }
}
