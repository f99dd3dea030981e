//! Coordinate transforms among the ROI quad, the processing rectangle and the
//! output quad.
//!
//! Three spaces are involved:
//! - **capture space** after resize, where the ROI quad is drawn,
//! - **processing space**, the `[0,0]-[w,h]` rectangle every stage sees,
//! - **output space**, where the output quad places processed results.
//!
//! All matrices are recomputed together. A recomputation that cannot
//! produce a full set of valid homographies leaves the previous state
//! untouched.

use anyhow::{anyhow, Result};
use image::{DynamicImage, Luma, Rgb, Rgba};
use imageproc::geometric_transformations::{warp, Interpolation, Projection};
use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-9;

/// Closed polygon outline. Only outlines that resolve to four distinct,
/// convex vertices are usable as quads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Region {
    points: Vec<[f32; 2]>,
}

impl Region {
    pub fn new(points: Vec<[f32; 2]>) -> Self {
        Self { points }
    }

    /// Axis-aligned rectangle, clockwise from the top-left corner.
    pub fn rectangle(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            points: vec![
                [x, y],
                [x + width, y],
                [x + width, y + height],
                [x, y + height],
            ],
        }
    }

    pub fn points(&self) -> &[[f32; 2]] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            points: self.points.iter().map(|p| [p[0] * sx, p[1] * sy]).collect(),
        }
    }

    /// Resolve the outline into exactly four vertices.
    ///
    /// Consecutive duplicates and a closing vertex equal to the first are
    /// dropped before counting. Degenerate or non-convex quads are rejected.
    pub fn quad(&self) -> Result<[[f32; 2]; 4]> {
        let mut outline: Vec<[f32; 2]> = Vec::with_capacity(self.points.len());
        for point in &self.points {
            if !point[0].is_finite() || !point[1].is_finite() {
                return Err(anyhow!("region has a non-finite vertex"));
            }
            if outline.last() != Some(point) {
                outline.push(*point);
            }
        }
        if outline.len() > 1 && outline.first() == outline.last() {
            outline.pop();
        }
        if outline.len() != 4 {
            return Err(anyhow!(
                "region must resolve to 4 vertices, got {}",
                outline.len()
            ));
        }
        let quad = [outline[0], outline[1], outline[2], outline[3]];
        if !is_convex(&quad) {
            return Err(anyhow!("region is degenerate or not convex"));
        }
        Ok(quad)
    }
}

fn is_convex(quad: &[[f32; 2]; 4]) -> bool {
    let mut sign = 0.0f64;
    for i in 0..4 {
        let a = quad[i];
        let b = quad[(i + 1) % 4];
        let c = quad[(i + 2) % 4];
        let cross = (b[0] as f64 - a[0] as f64) * (c[1] as f64 - b[1] as f64)
            - (b[1] as f64 - a[1] as f64) * (c[0] as f64 - b[0] as f64);
        if cross.abs() <= EPS {
            return false;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    true
}

/// Solve the homography mapping `src[i]` onto `dst[i]` (four-point DLT with
/// `h33 = 1`). Returns `None` when the system is singular or the result is
/// not finite.
pub fn homography(src: &[[f32; 2]; 4], dst: &[[f32; 2]; 4]) -> Option<Matrix3<f64>> {
    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for i in 0..4 {
        let (x, y) = (src[i][0] as f64, src[i][1] as f64);
        let (u, v) = (dst[i][0] as f64, dst[i][1] as f64);
        let r = 2 * i;
        a[(r, 0)] = x;
        a[(r, 1)] = y;
        a[(r, 2)] = 1.0;
        a[(r, 6)] = -u * x;
        a[(r, 7)] = -u * y;
        b[r] = u;
        a[(r + 1, 3)] = x;
        a[(r + 1, 4)] = y;
        a[(r + 1, 5)] = 1.0;
        a[(r + 1, 6)] = -v * x;
        a[(r + 1, 7)] = -v * y;
        b[r + 1] = v;
    }
    let h = a.lu().solve(&b)?;
    let m = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
    if m.iter().any(|value| !value.is_finite()) || m.determinant().abs() <= EPS {
        return None;
    }
    Some(m)
}

/// Map one point through `h`. `None` when the point lands at infinity.
pub fn apply_homography(h: &Matrix3<f64>, point: [f32; 2]) -> Option<[f32; 2]> {
    let v = h * Vector3::new(point[0] as f64, point[1] as f64, 1.0);
    let w = v[2];
    if !w.is_finite() || w.abs() <= EPS || !v[0].is_finite() || !v[1].is_finite() {
        return None;
    }
    Some([(v[0] / w) as f32, (v[1] / w) as f32])
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Homographies {
    roi_to_process: Matrix3<f64>,
    process_to_output: Matrix3<f64>,
    output_to_process: Matrix3<f64>,
}

/// Regions, processing size and the homographies derived from them.
///
/// An empty output region tracks the processing rectangle.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformState {
    roi: Region,
    output_region: Region,
    use_roi: bool,
    width: u32,
    height: u32,
    matrices: Homographies,
}

impl TransformState {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let roi = Region::rectangle(0.0, 0.0, width as f32, height as f32);
        let matrices = solve(&roi, &Region::default(), false, width, height)?;
        Ok(Self {
            roi,
            output_region: Region::default(),
            use_roi: false,
            width,
            height,
            matrices,
        })
    }

    pub fn roi(&self) -> &Region {
        &self.roi
    }

    /// The output region, or the processing rectangle when none was set.
    pub fn output_region(&self) -> Region {
        if self.output_region.is_empty() {
            Region::rectangle(0.0, 0.0, self.width as f32, self.height as f32)
        } else {
            self.output_region.clone()
        }
    }

    /// The output region as set. Empty means it follows the processing
    /// rectangle through resizes.
    pub fn stored_output_region(&self) -> &Region {
        &self.output_region
    }

    pub fn use_roi(&self) -> bool {
        self.use_roi
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn roi_to_process(&self) -> &Matrix3<f64> {
        &self.matrices.roi_to_process
    }

    pub fn process_to_output(&self) -> &Matrix3<f64> {
        &self.matrices.process_to_output
    }

    pub fn output_to_process(&self) -> &Matrix3<f64> {
        &self.matrices.output_to_process
    }

    pub fn process_to_output_point(&self, point: [f32; 2]) -> Option<[f32; 2]> {
        apply_homography(&self.matrices.process_to_output, point)
    }

    pub fn output_to_process_point(&self, point: [f32; 2]) -> Option<[f32; 2]> {
        apply_homography(&self.matrices.output_to_process, point)
    }

    pub fn set_roi(&mut self, roi: Region) -> Result<()> {
        self.commit(roi, self.output_region.clone(), self.use_roi, self.width, self.height)
    }

    /// Set the output region. An empty region resets it to the processing
    /// rectangle.
    pub fn set_output_region(&mut self, region: Region) -> Result<()> {
        self.commit(self.roi.clone(), region, self.use_roi, self.width, self.height)
    }

    pub fn set_use_roi(&mut self, use_roi: bool) -> Result<()> {
        self.commit(
            self.roi.clone(),
            self.output_region.clone(),
            use_roi,
            self.width,
            self.height,
        )
    }

    /// Change the processing size, scaling the ROI so it covers the same
    /// image content at the new size.
    pub fn set_processing_size(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(anyhow!("processing size must be non-zero, got {}x{}", width, height));
        }
        let sx = width as f32 / self.width as f32;
        let sy = height as f32 / self.height as f32;
        let roi = self.roi.scaled(sx, sy);
        self.commit(roi, self.output_region.clone(), self.use_roi, width, height)
    }

    fn commit(
        &mut self,
        roi: Region,
        output_region: Region,
        use_roi: bool,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let matrices = solve(&roi, &output_region, use_roi, width, height)?;
        self.roi = roi;
        self.output_region = output_region;
        self.use_roi = use_roi;
        self.width = width;
        self.height = height;
        self.matrices = matrices;
        Ok(())
    }

    /// Warp `image` so the ROI quad fills the processing rectangle.
    ///
    /// `image` must already be at processing size. Returns `None` when ROI
    /// mapping is disabled.
    pub fn warp_roi(&self, image: &DynamicImage) -> Option<DynamicImage> {
        if !self.use_roi {
            return None;
        }
        let m = &self.matrices.roi_to_process;
        let mut flat = [0f32; 9];
        for r in 0..3 {
            for c in 0..3 {
                flat[r * 3 + c] = m[(r, c)] as f32;
            }
        }
        let projection = Projection::from_matrix(flat)?;
        let warped = match image {
            DynamicImage::ImageLuma8(gray) => DynamicImage::ImageLuma8(warp(
                gray,
                &projection,
                Interpolation::Bilinear,
                Luma([0]),
            )),
            DynamicImage::ImageRgb8(rgb) => DynamicImage::ImageRgb8(warp(
                rgb,
                &projection,
                Interpolation::Bilinear,
                Rgb([0, 0, 0]),
            )),
            other => DynamicImage::ImageRgba8(warp(
                &other.to_rgba8(),
                &projection,
                Interpolation::Bilinear,
                Rgba([0, 0, 0, 0]),
            )),
        };
        Some(warped)
    }
}

fn solve(
    roi: &Region,
    output_region: &Region,
    use_roi: bool,
    width: u32,
    height: u32,
) -> Result<Homographies> {
    if width == 0 || height == 0 {
        return Err(anyhow!("processing size must be non-zero, got {}x{}", width, height));
    }
    let process = Region::rectangle(0.0, 0.0, width as f32, height as f32).quad()?;
    let roi_quad = roi.quad().map_err(|e| anyhow!("invalid ROI: {}", e))?;
    let effective_roi = if use_roi { roi_quad } else { process };
    let output_quad = if output_region.is_empty() {
        process
    } else {
        output_region
            .quad()
            .map_err(|e| anyhow!("invalid output region: {}", e))?
    };

    let roi_to_process = homography(&effective_roi, &process)
        .ok_or_else(|| anyhow!("ROI homography is singular"))?;
    let process_to_output = homography(&process, &output_quad)
        .ok_or_else(|| anyhow!("output homography is singular"))?;
    let output_to_process = process_to_output
        .try_inverse()
        .ok_or_else(|| anyhow!("output homography is not invertible"))?;
    Ok(Homographies {
        roi_to_process,
        process_to_output,
        output_to_process,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: [f32; 2], b: [f32; 2]) -> bool {
        (a[0] - b[0]).abs() < 1e-3 && (a[1] - b[1]).abs() < 1e-3
    }

    #[test]
    fn roi_corners_map_to_processing_corners() -> Result<()> {
        let mut state = TransformState::new(320, 240)?;
        let roi = Region::new(vec![[10.0, 20.0], [300.0, 5.0], [310.0, 230.0], [0.0, 200.0]]);
        state.set_roi(roi.clone())?;
        state.set_use_roi(true)?;

        let targets = [[0.0, 0.0], [320.0, 0.0], [320.0, 240.0], [0.0, 240.0]];
        for (corner, target) in roi.points().iter().zip(targets) {
            let mapped = apply_homography(state.roi_to_process(), *corner).expect("finite");
            assert!(close(mapped, target), "{:?} -> {:?}", corner, mapped);
        }
        Ok(())
    }

    #[test]
    fn output_round_trip_is_identity() -> Result<()> {
        let mut state = TransformState::new(320, 240)?;
        state.set_output_region(Region::new(vec![
            [100.0, 50.0],
            [900.0, 80.0],
            [880.0, 700.0],
            [120.0, 650.0],
        ]))?;

        for point in [[0.0, 0.0], [160.0, 120.0], [320.0, 240.0], [17.5, 203.25]] {
            let out = state.process_to_output_point(point).expect("finite");
            let back = state.output_to_process_point(out).expect("finite");
            assert!(close(point, back), "{:?} -> {:?} -> {:?}", point, out, back);
        }
        let corner = state.process_to_output_point([320.0, 240.0]).expect("finite");
        assert!(close(corner, [880.0, 700.0]));
        Ok(())
    }

    #[test]
    fn rejected_region_leaves_state_untouched() -> Result<()> {
        let mut state = TransformState::new(320, 240)?;
        state.set_roi(Region::rectangle(10.0, 10.0, 100.0, 100.0))?;
        state.set_use_roi(true)?;
        let before = state.clone();

        assert!(state
            .set_roi(Region::new(vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0]]))
            .is_err());
        assert!(state
            .set_output_region(Region::new(vec![
                [0.0, 0.0],
                [10.0, 10.0],
                [10.0, 0.0],
                [0.0, 10.0],
            ]))
            .is_err());
        assert!(state.set_processing_size(0, 240).is_err());

        assert_eq!(state, before);
        Ok(())
    }

    #[test]
    fn closing_vertex_is_ignored() -> Result<()> {
        let region = Region::new(vec![
            [0.0, 0.0],
            [10.0, 0.0],
            [10.0, 0.0],
            [10.0, 10.0],
            [0.0, 10.0],
            [0.0, 0.0],
        ]);
        let quad = region.quad()?;
        assert_eq!(quad[2], [10.0, 10.0]);
        Ok(())
    }

    #[test]
    fn collinear_quad_is_rejected() {
        let region = Region::new(vec![[0.0, 0.0], [5.0, 0.0], [10.0, 0.0], [0.0, 10.0]]);
        assert!(region.quad().is_err());
    }

    #[test]
    fn resize_scales_roi() -> Result<()> {
        let mut state = TransformState::new(320, 240)?;
        state.set_roi(Region::rectangle(32.0, 24.0, 160.0, 120.0))?;
        state.set_processing_size(640, 480)?;

        assert_eq!(state.size(), (640, 480));
        assert_eq!(state.roi(), &Region::rectangle(64.0, 48.0, 320.0, 240.0));
        assert_eq!(state.output_region(), Region::rectangle(0.0, 0.0, 640.0, 480.0));
        Ok(())
    }

    #[test]
    fn disabled_roi_is_identity() -> Result<()> {
        let mut state = TransformState::new(4, 4)?;
        state.set_roi(Region::rectangle(1.0, 1.0, 2.0, 2.0))?;
        let mapped = apply_homography(state.roi_to_process(), [3.0, 1.0]).expect("finite");
        assert!(close(mapped, [3.0, 1.0]));
        assert!(state.warp_roi(&DynamicImage::new_luma8(4, 4)).is_none());
        Ok(())
    }

    #[test]
    fn explicit_output_region_survives_resize() -> Result<()> {
        let mut state = TransformState::new(320, 240)?;
        state.set_output_region(Region::rectangle(0.0, 0.0, 320.0, 240.0))?;
        state.set_processing_size(640, 480)?;

        assert_eq!(state.output_region(), Region::rectangle(0.0, 0.0, 320.0, 240.0));
        assert_eq!(state.stored_output_region(), &Region::rectangle(0.0, 0.0, 320.0, 240.0));
        Ok(())
    }
}
