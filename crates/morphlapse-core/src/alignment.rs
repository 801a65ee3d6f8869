//! Geometric alignment via 4-DOF similarity transform.
//!
//! Estimates the rotation, uniform scale and translation mapping one
//! landmark configuration onto another (closed-form Procrustes), and
//! resamples images into the reference coordinate system.

use crate::types::{LandmarkSet, Point};
use image::RgbImage;
use thiserror::Error;

/// Minimum point spread (RMS distance from centroid) accepted by the
/// estimator. Below this the configuration is effectively a single point.
const MIN_SPREAD: f32 = 1e-4;

/// Minimum ratio between the minor and major axis of the point scatter.
/// Below this the points are effectively collinear and the transform,
/// while formally computable, is not trustworthy.
const MIN_AXIS_RATIO: f32 = 1e-3;

#[derive(Error, Debug)]
pub enum AlignError {
    #[error("degenerate landmark configuration: {0}")]
    Degenerate(&'static str),
    #[error("point sets differ in length: {src} vs {dst}")]
    LengthMismatch { src: usize, dst: usize },
}

/// A similarity transform `[a -b tx; b a ty]`:
/// rotation and uniform scale encoded in (a, b), then translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    pub const IDENTITY: Self = Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    pub fn apply(&self, p: Point) -> Point {
        Point {
            x: self.a * p.x - self.b * p.y + self.tx,
            y: self.b * p.x + self.a * p.y + self.ty,
        }
    }

    /// Uniform scale factor of the transform.
    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    /// Inverse transform. The estimator guarantees a non-vanishing scale,
    /// so inversion of an estimated transform cannot fail.
    pub fn inverse(&self) -> SimilarityTransform {
        let det = self.a * self.a + self.b * self.b;
        let ia = self.a / det;
        let ib = -self.b / det;
        SimilarityTransform {
            a: ia,
            b: ib,
            tx: -(ia * self.tx - ib * self.ty),
            ty: -(ib * self.tx + ia * self.ty),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.a.is_finite() && self.b.is_finite() && self.tx.is_finite() && self.ty.is_finite()
    }
}

/// Estimate the similarity transform minimizing the sum of squared
/// distances from `transform(src[i])` to `dst[i]`.
///
/// Closed form: with both sets centered, `a` and `b` fall out of the
/// dot- and cross-sums over corresponding coordinates; no iteration and
/// no matrix decomposition. Degenerate inputs (near-zero spread or
/// near-collinear points, in either set) are rejected before any division
/// so the result is always finite.
pub fn estimate_similarity(src: &[Point], dst: &[Point]) -> Result<SimilarityTransform, AlignError> {
    if src.len() != dst.len() {
        return Err(AlignError::LengthMismatch { src: src.len(), dst: dst.len() });
    }
    if src.len() < 2 {
        return Err(AlignError::Degenerate("fewer than two points"));
    }

    check_spread(src)?;
    check_spread(dst)?;

    let n = src.len() as f64;
    let (scx, scy) = centroid(src);
    let (dcx, dcy) = centroid(dst);

    // Accumulate in f64: the sums mix coordinate magnitudes quadratically.
    let mut norm = 0.0f64;
    let mut dot = 0.0f64;
    let mut cross = 0.0f64;
    for (s, d) in src.iter().zip(dst) {
        let sx = s.x as f64 - scx;
        let sy = s.y as f64 - scy;
        let dx = d.x as f64 - dcx;
        let dy = d.y as f64 - dcy;
        norm += sx * sx + sy * sy;
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
    }

    if (norm / n).sqrt() < MIN_SPREAD as f64 {
        return Err(AlignError::Degenerate("source points coincide"));
    }

    let a = (dot / norm) as f32;
    let b = (cross / norm) as f32;
    let tx = dcx as f32 - (a * scx as f32 - b * scy as f32);
    let ty = dcy as f32 - (b * scx as f32 + a * scy as f32);

    let transform = SimilarityTransform { a, b, tx, ty };
    if !transform.is_finite() || transform.scale() < MIN_SPREAD {
        return Err(AlignError::Degenerate("vanishing scale"));
    }
    Ok(transform)
}

fn centroid(points: &[Point]) -> (f64, f64) {
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0f64, 0.0f64), |(sx, sy), p| (sx + p.x as f64, sy + p.y as f64));
    (sx / n, sy / n)
}

/// Reject point sets whose 2×2 scatter matrix is rank-deficient: a
/// near-zero minor/major eigenvalue ratio means the points sit on a line.
fn check_spread(points: &[Point]) -> Result<(), AlignError> {
    let (cx, cy) = centroid(points);
    let mut sxx = 0.0f64;
    let mut syy = 0.0f64;
    let mut sxy = 0.0f64;
    for p in points {
        let x = p.x as f64 - cx;
        let y = p.y as f64 - cy;
        sxx += x * x;
        syy += y * y;
        sxy += x * y;
    }
    let n = points.len() as f64;
    let spread = ((sxx + syy) / n).sqrt();
    if spread < MIN_SPREAD as f64 {
        return Err(AlignError::Degenerate("points coincide"));
    }

    // Eigenvalues of [[sxx, sxy], [sxy, syy]].
    let trace = sxx + syy;
    let det = sxx * syy - sxy * sxy;
    let disc = (trace * trace / 4.0 - det).max(0.0).sqrt();
    let major = trace / 2.0 + disc;
    let minor = trace / 2.0 - disc;
    if major <= 0.0 || minor / major < (MIN_AXIS_RATIO * MIN_AXIS_RATIO) as f64 {
        return Err(AlignError::Degenerate("points are collinear"));
    }
    Ok(())
}

/// Bilinear sample with clamp-to-edge fill.
///
/// Out-of-bounds coordinates replicate the nearest edge pixel; this is the
/// fixed resampling policy for the whole pipeline (no black borders on
/// aligned output).
pub(crate) fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> [f32; 3] {
    let w = image.width() as i64;
    let h = image.height() as i64;
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let at = |xi: i64, yi: i64| -> &image::Rgb<u8> {
        let cx = xi.clamp(0, w - 1) as u32;
        let cy = yi.clamp(0, h - 1) as u32;
        image.get_pixel(cx, cy)
    };

    let tl = at(x0, y0);
    let tr = at(x0 + 1, y0);
    let bl = at(x0, y0 + 1);
    let br = at(x0 + 1, y0 + 1);

    let mut out = [0.0f32; 3];
    for (c, v) in out.iter_mut().enumerate() {
        *v = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + tr[c] as f32 * fx * (1.0 - fy)
            + bl[c] as f32 * (1.0 - fx) * fy
            + br[c] as f32 * fx * fy;
    }
    out
}

/// Resample `image` through `transform` into a `width`×`height` canvas.
///
/// `transform` maps source coordinates to output coordinates; each output
/// pixel is pulled from the source through the inverse map with bilinear
/// interpolation and clamp-to-edge fill.
pub fn warp_into(image: &RgbImage, transform: &SimilarityTransform, width: u32, height: u32) -> RgbImage {
    let inv = transform.inverse();
    let mut out = RgbImage::new(width, height);
    for oy in 0..height {
        for ox in 0..width {
            let src = inv.apply(Point::new(ox as f32, oy as f32));
            let rgb = sample_bilinear(image, src.x, src.y);
            out.put_pixel(
                ox,
                oy,
                image::Rgb([
                    rgb[0].round().clamp(0.0, 255.0) as u8,
                    rgb[1].round().clamp(0.0, 255.0) as u8,
                    rgb[2].round().clamp(0.0, 255.0) as u8,
                ]),
            );
        }
    }
    out
}

/// Align a source image and its landmarks onto reference landmarks.
///
/// The transform is estimated over the stable alignment subset (brows,
/// eyes, nose, mouth), then applied to the full image and all 68 points.
pub fn align_to_reference(
    image: &RgbImage,
    landmarks: &LandmarkSet,
    reference: &LandmarkSet,
    width: u32,
    height: u32,
) -> Result<(RgbImage, LandmarkSet), AlignError> {
    let transform = estimate_similarity(&landmarks.alignment_points(), &reference.alignment_points())?;
    tracing::debug!(
        scale = transform.scale(),
        tx = transform.tx,
        ty = transform.ty,
        "similarity transform estimated"
    );

    let warped = warp_into(image, &transform, width, height);
    let moved: Vec<Point> = landmarks.points().iter().map(|&p| transform.apply(p)).collect();
    let moved = LandmarkSet::new(moved)
        .map_err(|_| AlignError::Degenerate("transformed landmarks not finite"))?;
    Ok((warped, moved))
}
