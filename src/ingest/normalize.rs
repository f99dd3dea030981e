//! Raw buffers to images.
//!
//! Sources hand over tightly packed frames in one of a few layouts. Gray
//! stays single channel; everything else becomes RGB so stages see at most
//! two image kinds.

use anyhow::{anyhow, Result};
use image::{DynamicImage, GrayImage, RgbImage};

/// Raw pixel layouts sources may hand over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    /// Full-resolution luma plane followed by interleaved U/V at half
    /// resolution in both directions.
    Nv12,
}

impl PixelFormat {
    /// Bytes in one packed `width` x `height` frame.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let area = (width as usize).checked_mul(height as usize)?;
        match self {
            PixelFormat::Gray8 => Some(area),
            PixelFormat::Rgb24 => area.checked_mul(3),
            PixelFormat::Nv12 => area.checked_add(area / 2),
        }
    }
}

/// Wrap a packed frame into an image. Fails when the buffer length does not
/// match the dimensions.
pub fn to_image(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<DynamicImage> {
    if width == 0 || height == 0 {
        return Err(anyhow!("{:?} frame has zero size {}x{}", format, width, height));
    }
    if format == PixelFormat::Nv12 && (width % 2 != 0 || height % 2 != 0) {
        return Err(anyhow!("NV12 frame needs even dimensions, got {}x{}", width, height));
    }
    let expected = format
        .frame_len(width, height)
        .ok_or_else(|| anyhow!("{:?} frame of {}x{} is too large", format, width, height))?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "{:?} frame of {}x{} needs {} bytes, got {}",
            format,
            width,
            height,
            expected,
            pixels.len()
        ));
    }
    let image = match format {
        PixelFormat::Gray8 => {
            GrayImage::from_raw(width, height, pixels.to_vec()).map(DynamicImage::ImageLuma8)
        }
        PixelFormat::Rgb24 => {
            RgbImage::from_raw(width, height, pixels.to_vec()).map(DynamicImage::ImageRgb8)
        }
        PixelFormat::Nv12 => RgbImage::from_raw(width, height, nv12_to_rgb(pixels, width, height))
            .map(DynamicImage::ImageRgb8),
    };
    image.ok_or_else(|| anyhow!("{:?} buffer does not fit {}x{}", format, width, height))
}

/// BT.601 full-range conversion. `pixels` must already be length-checked.
fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (luma, chroma) = pixels.split_at(w * h);
    let mut rgb = Vec::with_capacity(w * h * 3);
    for (row, line) in luma.chunks_exact(w).enumerate().take(h) {
        let chroma_row = &chroma[(row / 2) * w..];
        for (col, &y) in line.iter().enumerate() {
            let pair = (col / 2) * 2;
            let u = chroma_row[pair] as f32 - 128.0;
            let v = chroma_row[pair + 1] as f32 - 128.0;
            let y = y as f32;
            rgb.push(to_channel(y + 1.402 * v));
            rgb.push(to_channel(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(to_channel(y + 1.772 * u));
        }
    }
    rgb
}

fn to_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
