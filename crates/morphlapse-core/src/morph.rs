//! Frame rendering: easing, blending and piecewise-affine mesh warping.
//!
//! A frame at parameter `t` is produced by warping both endpoint images
//! into the mesh interpolated between their landmark sets, then combining
//! the two warps per pixel. Rendering is a pure function of its arguments,
//! so frames of one transition can be computed in parallel and repeated
//! calls are byte-identical.

use crate::alignment::sample_bilinear;
use crate::mesh::Triangulation;
use crate::types::{AlignedImage, Point};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Time-remapping curves for transitions. All map [0,1] → [0,1] with
/// f(0)=0 and f(1)=1; the applied value is clamped afterwards, which is
/// what keeps `Bounce`'s overshooting segments out of the blend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Easing {
    #[default]
    Linear,
    EaseIn,
    EaseOut,
    EaseInOut,
    Cubic,
    Bounce,
}

impl Easing {
    /// Remap a linear time to the eased interpolation parameter, clamped
    /// to [0,1].
    pub fn apply(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        let eased = match self {
            Easing::Linear => t,
            Easing::EaseIn => t * t,
            Easing::EaseOut => 1.0 - (1.0 - t) * (1.0 - t),
            Easing::EaseInOut => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    let u = -2.0 * t + 2.0;
                    1.0 - u * u / 2.0
                }
            }
            Easing::Cubic => t * t * t,
            Easing::Bounce => {
                // Piecewise parabolas with decaying amplitude.
                const N: f32 = 7.5625;
                const D: f32 = 2.75;
                if t < 1.0 / D {
                    N * t * t
                } else if t < 2.0 / D {
                    let u = t - 1.5 / D;
                    N * u * u + 0.75
                } else if t < 2.5 / D {
                    let u = t - 2.25 / D;
                    N * u * u + 0.9375
                } else {
                    let u = t - 2.625 / D;
                    N * u * u + 0.984375
                }
            }
        };
        eased.clamp(0.0, 1.0)
    }
}

/// Per-pixel combination of the two warped endpoint images.
///
/// Every mode reproduces image A exactly at t=0 and image B exactly at
/// t=1. `Alpha` is the straight lerp; the other modes travel through the
/// mode's combined image `c(a,b)` on the quadratic path
/// `(1−t)²·a + 2t(1−t)·c + t²·b`, which preserves the endpoints while
/// pushing the mid-transition look towards the combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    #[default]
    Alpha,
    /// Brighter mid-transition: combine is the clamped sum.
    Additive,
    /// Darker mid-transition: combine is the per-channel product.
    Multiply,
    /// Brighter mid-transition: combine is the inverse product
    /// `1 − (1−a)(1−b)`.
    Screen,
}

impl BlendMode {
    /// Blend one normalized channel pair. Inputs and output are in [0,1].
    #[inline]
    pub fn blend_channel(self, a: f32, b: f32, t: f32) -> f32 {
        let out = match self {
            BlendMode::Alpha => (1.0 - t) * a + t * b,
            BlendMode::Additive => quadratic_path(a, b, (a + b).min(1.0), t),
            BlendMode::Multiply => quadratic_path(a, b, a * b, t),
            BlendMode::Screen => quadratic_path(a, b, 1.0 - (1.0 - a) * (1.0 - b), t),
        };
        out.clamp(0.0, 1.0)
    }
}

#[inline]
fn quadratic_path(a: f32, b: f32, c: f32, t: f32) -> f32 {
    let u = 1.0 - t;
    u * u * a + 2.0 * u * t * c + t * t * b
}

/// Row-major RGB float buffer used between warp and blend.
struct FloatImage {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl FloatImage {
    fn from_rgb(image: &RgbImage) -> Self {
        let data = image.pixels().flat_map(|p| p.0.map(f32::from)).collect();
        Self { width: image.width(), height: image.height(), data }
    }

    #[inline]
    fn set(&mut self, x: u32, y: u32, rgb: [f32; 3]) {
        let idx = 3 * (y as usize * self.width as usize + x as usize);
        self.data[idx..idx + 3].copy_from_slice(&rgb);
    }

    #[inline]
    fn get(&self, x: u32, y: u32) -> [f32; 3] {
        let idx = 3 * (y as usize * self.width as usize + x as usize);
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }
}

/// Affine map `dst → src` solved from three point correspondences, used
/// for inverse sampling while rasterizing a destination triangle.
struct TriangleMap {
    m: [f32; 6],
}

impl TriangleMap {
    /// Solve the affine map taking each `dst[i]` to `src[i]`. Returns
    /// `None` when the destination triangle is degenerate.
    fn solve(src: &[Point; 3], dst: &[Point; 3]) -> Option<Self> {
        let d = (dst[1].x - dst[0].x) * (dst[2].y - dst[0].y)
            - (dst[2].x - dst[0].x) * (dst[1].y - dst[0].y);
        if d.abs() < 1e-8 {
            return None;
        }
        // Barycentric basis of dst expressed against src deltas.
        let inv = 1.0 / d;
        let u = (
            (dst[2].y - dst[0].y) * inv,
            -(dst[2].x - dst[0].x) * inv,
        );
        let v = (
            -(dst[1].y - dst[0].y) * inv,
            (dst[1].x - dst[0].x) * inv,
        );
        let e1 = (src[1].x - src[0].x, src[1].y - src[0].y);
        let e2 = (src[2].x - src[0].x, src[2].y - src[0].y);

        let a = e1.0 * u.0 + e2.0 * v.0;
        let b = e1.0 * u.1 + e2.0 * v.1;
        let c = e1.1 * u.0 + e2.1 * v.0;
        let dd = e1.1 * u.1 + e2.1 * v.1;
        let tx = src[0].x - a * dst[0].x - b * dst[0].y;
        let ty = src[0].y - c * dst[0].x - dd * dst[0].y;
        Some(Self { m: [a, b, tx, c, dd, ty] })
    }

    #[inline]
    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.m[0] * x + self.m[1] * y + self.m[2],
            self.m[3] * x + self.m[4] * y + self.m[5],
        )
    }
}

/// Edge-function inside test with a small tolerance so pixels on shared
/// triangle edges are claimed by at least one of the neighbors.
#[inline]
fn inside_triangle(px: f32, py: f32, t: &[Point; 3]) -> bool {
    let e = |a: Point, b: Point| (b.x - a.x) * (py - a.y) - (b.y - a.y) * (px - a.x);
    let d0 = e(t[0], t[1]);
    let d1 = e(t[1], t[2]);
    let d2 = e(t[2], t[0]);
    const EPS: f32 = 1e-4;
    (d0 >= -EPS && d1 >= -EPS && d2 >= -EPS) || (d0 <= EPS && d1 <= EPS && d2 <= EPS)
}

/// Warp `source` so that `src_points` land on `dst_points`, triangle by
/// triangle. The output starts as a copy of the source, so pixels missed
/// by rasterization rounding keep sensible values instead of holes.
/// Sampling is bilinear with clamp-to-edge fill.
fn warp_mesh(
    source: &RgbImage,
    src_points: &[Point],
    dst_points: &[Point],
    triangulation: &Triangulation,
) -> FloatImage {
    let mut out = FloatImage::from_rgb(source);
    let width = source.width();
    let height = source.height();

    for tri in &triangulation.triangles {
        let src = [src_points[tri[0]], src_points[tri[1]], src_points[tri[2]]];
        let dst = [dst_points[tri[0]], dst_points[tri[1]], dst_points[tri[2]]];
        let Some(map) = TriangleMap::solve(&src, &dst) else {
            continue;
        };

        let x0 = dst.iter().map(|p| p.x).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
        let y0 = dst.iter().map(|p| p.y).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
        let x1 = dst.iter().map(|p| p.x).fold(f32::NEG_INFINITY, f32::max).ceil() as i64;
        let y1 = dst.iter().map(|p| p.y).fold(f32::NEG_INFINITY, f32::max).ceil() as i64;
        let x1 = x1.clamp(0, width as i64 - 1) as u32;
        let y1 = y1.clamp(0, height as i64 - 1) as u32;

        for py in y0..=y1 {
            for px in x0..=x1 {
                let fx = px as f32;
                let fy = py as f32;
                if !inside_triangle(fx, fy, &dst) {
                    continue;
                }
                let (sx, sy) = map.apply(fx, fy);
                out.set(px, py, sample_bilinear(source, sx, sy));
            }
        }
    }
    out
}

/// Render the intermediate frame of a transition at eased parameter `t`.
///
/// The mesh vertices move linearly from A's extended points to B's; both
/// images are warped into the moved mesh and blended. `t` is expected to
/// be the *linear* time: easing is applied here, once, and drives both
/// the geometry and the blend.
pub fn render_frame(
    a: &AlignedImage,
    b: &AlignedImage,
    triangulation: &Triangulation,
    t: f32,
    easing: Easing,
    blend: BlendMode,
) -> RgbImage {
    let eased = easing.apply(t);

    let pts_a = a.extended_points();
    let pts_b = b.extended_points();
    let mid: Vec<Point> = pts_a
        .iter()
        .zip(&pts_b)
        .map(|(&pa, &pb)| pa.lerp(pb, eased))
        .collect();

    let warped_a = warp_mesh(&a.image, &pts_a, &mid, triangulation);
    let warped_b = warp_mesh(&b.image, &pts_b, &mid, triangulation);

    blend_to_rgb(&warped_a, &warped_b, eased, blend)
}

/// Plain cross-dissolve between two images, used when no usable mesh
/// exists for a pair. Same easing and blend contract as [`render_frame`].
pub fn render_dissolve(
    a: &RgbImage,
    b: &RgbImage,
    t: f32,
    easing: Easing,
    blend: BlendMode,
) -> RgbImage {
    let eased = easing.apply(t);
    let fa = FloatImage::from_rgb(a);
    let fb = FloatImage::from_rgb(b);
    blend_to_rgb(&fa, &fb, eased, blend)
}

fn blend_to_rgb(a: &FloatImage, b: &FloatImage, t: f32, blend: BlendMode) -> RgbImage {
    debug_assert_eq!(a.width, b.width);
    debug_assert_eq!(a.height, b.height);
    let mut out = RgbImage::new(a.width, a.height);
    for y in 0..a.height {
        for x in 0..a.width {
            let pa = a.get(x, y);
            let pb = b.get(x, y);
            let mut px = [0u8; 3];
            for c in 0..3 {
                let v = blend.blend_channel(pa[c] / 255.0, pb[c] / 255.0, t);
                px[c] = (v * 255.0).round().clamp(0.0, 255.0) as u8;
            }
            out.put_pixel(x, y, image::Rgb(px));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh;
    use crate::types::{LandmarkSet, LANDMARK_COUNT};

    const ALL_EASINGS: [Easing; 6] = [
        Easing::Linear,
        Easing::EaseIn,
        Easing::EaseOut,
        Easing::EaseInOut,
        Easing::Cubic,
        Easing::Bounce,
    ];

    const ALL_BLENDS: [BlendMode; 4] =
        [BlendMode::Alpha, BlendMode::Additive, BlendMode::Multiply, BlendMode::Screen];

    #[test]
    fn test_easing_endpoints() {
        for easing in ALL_EASINGS {
            assert!(easing.apply(0.0).abs() < 1e-6, "{easing:?} f(0)");
            assert!((easing.apply(1.0) - 1.0).abs() < 1e-6, "{easing:?} f(1)");
        }
    }

    #[test]
    fn test_easing_stays_in_unit_range() {
        for easing in ALL_EASINGS {
            for k in 0..=1000 {
                let t = k as f32 / 1000.0;
                let v = easing.apply(t);
                assert!((0.0..=1.0).contains(&v), "{easing:?}({t}) = {v}");
            }
        }
    }

    #[test]
    fn test_easing_clamps_out_of_range_input() {
        for easing in ALL_EASINGS {
            assert_eq!(easing.apply(-0.5), 0.0);
            assert_eq!(easing.apply(1.5), 1.0);
        }
    }

    #[test]
    fn test_ease_in_out_is_symmetric() {
        for k in 0..=50 {
            let t = k as f32 / 100.0;
            let lo = Easing::EaseInOut.apply(t);
            let hi = Easing::EaseInOut.apply(1.0 - t);
            assert!((lo + hi - 1.0).abs() < 1e-5, "t={t}: {lo} + {hi}");
        }
    }

    #[test]
    fn test_blend_endpoints_reproduce_inputs() {
        for blend in ALL_BLENDS {
            for (a, b) in [(0.0f32, 1.0f32), (0.25, 0.75), (0.9, 0.1), (1.0, 1.0)] {
                assert!((blend.blend_channel(a, b, 0.0) - a).abs() < 1e-6, "{blend:?} t=0");
                assert!((blend.blend_channel(a, b, 1.0) - b).abs() < 1e-6, "{blend:?} t=1");
            }
        }
    }

    #[test]
    fn test_blend_midpoint_character() {
        // Relative to the lerp midpoint, additive/screen brighten and
        // multiply darkens.
        let (a, b) = (0.4f32, 0.6f32);
        let lerp = BlendMode::Alpha.blend_channel(a, b, 0.5);
        assert!(BlendMode::Additive.blend_channel(a, b, 0.5) > lerp);
        assert!(BlendMode::Screen.blend_channel(a, b, 0.5) > lerp);
        assert!(BlendMode::Multiply.blend_channel(a, b, 0.5) < lerp);
    }

    #[test]
    fn test_blend_output_in_range() {
        for blend in ALL_BLENDS {
            for ka in 0..=10 {
                for kb in 0..=10 {
                    for kt in 0..=10 {
                        let v = blend.blend_channel(
                            ka as f32 / 10.0,
                            kb as f32 / 10.0,
                            kt as f32 / 10.0,
                        );
                        assert!((0.0..=1.0).contains(&v));
                    }
                }
            }
        }
    }

    fn grid_landmarks(w: f32, h: f32, jitter: f32) -> LandmarkSet {
        // 68 points spread over the interior of a w×h frame.
        let pts = (0..LANDMARK_COUNT)
            .map(|i| {
                let gx = (i % 9) as f32;
                let gy = (i / 9) as f32;
                Point::new(
                    w * 0.15 + gx / 8.0 * w * 0.7 + jitter * ((i % 3) as f32 - 1.0),
                    h * 0.15 + gy / 8.0 * h * 0.7 + jitter * ((i % 5) as f32 - 2.0),
                )
            })
            .collect();
        LandmarkSet::new(pts).unwrap()
    }

    fn gradient_image(w: u32, h: u32, seed: u8) -> RgbImage {
        let mut img = RgbImage::new(w, h);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = image::Rgb([(x * 7 + seed as u32) as u8, (y * 5) as u8, seed]);
        }
        img
    }

    fn test_pair(w: u32, h: u32) -> (AlignedImage, AlignedImage, Triangulation) {
        let a = AlignedImage {
            image: gradient_image(w, h, 10),
            landmarks: grid_landmarks(w as f32, h as f32, 0.0),
        };
        let b = AlignedImage {
            image: gradient_image(w, h, 200),
            landmarks: grid_landmarks(w as f32, h as f32, 1.5),
        };
        let pts_a = a.extended_points();
        let pts_b = b.extended_points();
        let mid: Vec<Point> = pts_a.iter().zip(&pts_b).map(|(&p, &q)| p.lerp(q, 0.5)).collect();
        let tri = mesh::triangulate(&mid).unwrap();
        (a, b, tri)
    }

    #[test]
    fn test_render_frame_deterministic() {
        let (a, b, tri) = test_pair(32, 32);
        let f1 = render_frame(&a, &b, &tri, 0.37, Easing::EaseInOut, BlendMode::Alpha);
        let f2 = render_frame(&a, &b, &tri, 0.37, Easing::EaseInOut, BlendMode::Alpha);
        assert_eq!(f1.as_raw(), f2.as_raw());
    }

    #[test]
    fn test_render_frame_t0_reproduces_a() {
        let (a, b, tri) = test_pair(32, 32);
        for blend in ALL_BLENDS {
            let f = render_frame(&a, &b, &tri, 0.0, Easing::Linear, blend);
            let diff = f
                .as_raw()
                .iter()
                .zip(a.image.as_raw())
                .map(|(&x, &y)| (x as i32 - y as i32).abs())
                .max()
                .unwrap();
            assert!(diff <= 1, "{blend:?}: max channel diff {diff}");
        }
    }

    #[test]
    fn test_render_frame_t1_reproduces_b() {
        let (a, b, tri) = test_pair(32, 32);
        for blend in ALL_BLENDS {
            let f = render_frame(&a, &b, &tri, 1.0, Easing::Linear, blend);
            let diff = f
                .as_raw()
                .iter()
                .zip(b.image.as_raw())
                .map(|(&x, &y)| (x as i32 - y as i32).abs())
                .max()
                .unwrap();
            assert!(diff <= 1, "{blend:?}: max channel diff {diff}");
        }
    }

    #[test]
    fn test_dissolve_endpoints() {
        let a = gradient_image(16, 16, 3);
        let b = gradient_image(16, 16, 77);
        let f0 = render_dissolve(&a, &b, 0.0, Easing::Linear, BlendMode::Alpha);
        let f1 = render_dissolve(&a, &b, 1.0, Easing::Linear, BlendMode::Alpha);
        assert_eq!(f0.as_raw(), a.as_raw());
        assert_eq!(f1.as_raw(), b.as_raw());
    }

    #[test]
    fn test_triangle_map_roundtrip() {
        let src = [Point::new(1.0, 1.0), Point::new(9.0, 2.0), Point::new(4.0, 8.0)];
        let dst = [Point::new(2.0, 0.0), Point::new(10.0, 3.0), Point::new(3.0, 9.0)];
        let map = TriangleMap::solve(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            let (x, y) = map.apply(d.x, d.y);
            assert!((x - s.x).abs() < 1e-4);
            assert!((y - s.y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_triangle_map_degenerate_is_none() {
        let src = [Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(2.0, 0.0)];
        let dst = src;
        assert!(TriangleMap::solve(&src, &dst).is_none());
    }
}
