use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Number of facial landmarks produced per face (dlib 68-point layout).
pub const LANDMARK_COUNT: usize = 68;

/// Synthetic boundary points appended to the landmarks before triangulation:
/// four inset corners and four edge midpoints.
pub const BOUNDARY_POINT_COUNT: usize = 8;

// Anatomical index groups within a 68-point landmark set.
pub const JAW: std::ops::Range<usize> = 0..17;
pub const RIGHT_BROW: std::ops::Range<usize> = 17..22;
pub const LEFT_BROW: std::ops::Range<usize> = 22..27;
pub const NOSE: std::ops::Range<usize> = 27..35;
pub const RIGHT_EYE: std::ops::Range<usize> = 36..42;
pub const LEFT_EYE: std::ops::Range<usize> = 42..48;
pub const OUTER_MOUTH: std::ops::Range<usize> = 48..61;
pub const INNER_MOUTH: std::ops::Range<usize> = 61..68;

/// A 2-D point in image coordinates (x right, y down).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Linear interpolation towards `other`: t=0 is self, t=1 is `other`.
    pub fn lerp(self, other: Point, t: f32) -> Point {
        Point {
            x: (1.0 - t) * self.x + t * other.x,
            y: (1.0 - t) * self.y + t * other.y,
        }
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// An ordered set of exactly [`LANDMARK_COUNT`] facial landmarks.
///
/// Point `i` always denotes the same anatomical feature across images, so
/// corresponding indices in two sets describe corresponding features. A
/// detection failure never produces a partial set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSet {
    points: Vec<Point>,
}

impl LandmarkSet {
    /// Build a landmark set, enforcing the fixed point count and finiteness.
    pub fn new(points: Vec<Point>) -> Result<Self, LandmarkSetError> {
        if points.len() != LANDMARK_COUNT {
            return Err(LandmarkSetError::WrongCount(points.len()));
        }
        if let Some(idx) = points.iter().position(|p| !p.is_finite()) {
            return Err(LandmarkSetError::NonFinite(idx));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// The subset of landmark indices used for similarity estimation:
    /// brows, eyes, nose and outer mouth. The jaw outline is excluded:
    /// it is the least stable group under expression changes.
    pub fn alignment_indices() -> impl Iterator<Item = usize> {
        LEFT_BROW
            .chain(RIGHT_EYE)
            .chain(LEFT_EYE)
            .chain(RIGHT_BROW)
            .chain(NOSE)
            .chain(OUTER_MOUTH)
    }

    /// Points of the alignment subset, in the fixed subset order.
    pub fn alignment_points(&self) -> Vec<Point> {
        Self::alignment_indices().map(|i| self.points[i]).collect()
    }

    pub fn centroid(&self) -> Point {
        let n = self.points.len() as f32;
        let (sx, sy) = self
            .points
            .iter()
            .fold((0.0f32, 0.0f32), |(sx, sy), p| (sx + p.x, sy + p.y));
        Point::new(sx / n, sy / n)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LandmarkSetError {
    #[error("expected {LANDMARK_COUNT} landmarks, got {0}")]
    WrongCount(usize),
    #[error("landmark {0} is not finite")]
    NonFinite(usize),
}

/// An image resampled into the reference coordinate system, together with
/// its landmarks transformed into the same system.
///
/// Produced once by the aligner and consumed read-only downstream.
#[derive(Debug, Clone)]
pub struct AlignedImage {
    pub image: RgbImage,
    pub landmarks: LandmarkSet,
}

impl AlignedImage {
    /// The 76-point extended set: landmarks followed by the 8 boundary
    /// points of the image frame, in a fixed order shared by all aligned
    /// images of a run.
    pub fn extended_points(&self) -> Vec<Point> {
        let mut pts = self.landmarks.points().to_vec();
        pts.extend_from_slice(&crate::mesh::boundary_points(
            self.image.width(),
            self.image.height(),
        ));
        pts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_points() -> Vec<Point> {
        (0..LANDMARK_COUNT)
            .map(|i| Point::new((i % 10) as f32, (i / 10) as f32))
            .collect()
    }

    #[test]
    fn test_landmark_set_count_enforced() {
        assert!(matches!(
            LandmarkSet::new(vec![Point::default(); 5]),
            Err(LandmarkSetError::WrongCount(5))
        ));
        assert!(LandmarkSet::new(grid_points()).is_ok());
    }

    #[test]
    fn test_landmark_set_rejects_non_finite() {
        let mut pts = grid_points();
        pts[12] = Point::new(f32::NAN, 0.0);
        assert!(matches!(
            LandmarkSet::new(pts),
            Err(LandmarkSetError::NonFinite(12))
        ));
    }

    #[test]
    fn test_alignment_subset_excludes_jaw() {
        let indices: Vec<usize> = LandmarkSet::alignment_indices().collect();
        assert!(indices.iter().all(|&i| i >= 17 && i < LANDMARK_COUNT));
        // brows + eyes + nose + outer mouth
        assert_eq!(indices.len(), 5 + 6 + 6 + 5 + 8 + 13);
    }

    #[test]
    fn test_point_lerp_endpoints() {
        let a = Point::new(1.0, 2.0);
        let b = Point::new(5.0, -2.0);
        assert_eq!(a.lerp(b, 0.0), a);
        assert_eq!(a.lerp(b, 1.0), b);
        let mid = a.lerp(b, 0.5);
        assert!((mid.x - 3.0).abs() < 1e-6);
        assert!((mid.y - 0.0).abs() < 1e-6);
    }

    #[test]
    fn test_centroid() {
        let set = LandmarkSet::new(grid_points()).unwrap();
        let c = set.centroid();
        // sum of i % 10 over 0..68 is 298
        assert!((c.x - 298.0 / 68.0).abs() < 1e-4);
        assert!(c.y > 0.0);
    }
}
