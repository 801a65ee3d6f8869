//! Landmark extraction via ONNX Runtime.
//!
//! Two-stage black box: an UltraFace-style face detector (normalized
//! score/box outputs, NMS post-processing) locates the face, then a
//! 68-point landmark regressor runs on the expanded face crop. The
//! pipeline only sees the [`LandmarkSource`] trait; detection failures
//! are errors, never partial landmark sets.

use crate::types::{LandmarkSet, Point, LANDMARK_COUNT};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DETECTOR_INPUT_WIDTH: u32 = 320;
const DETECTOR_INPUT_HEIGHT: u32 = 240;
const DETECTOR_MEAN: f32 = 127.0;
const DETECTOR_STD: f32 = 128.0;
const CONFIDENCE_THRESHOLD: f32 = 0.7;
const NMS_IOU_THRESHOLD: f32 = 0.3;

const LANDMARK_INPUT_SIZE: u32 = 112;
/// Crop margin around the detection box before landmark regression, as a
/// fraction of the box's larger side.
const CROP_MARGIN: f32 = 0.2;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("no face detected")]
    NoFace,
    #[error("expected exactly one face, found {0}")]
    MultipleFaces(usize),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Source of landmark sets for still images.
///
/// The pipeline depends on this seam, not on any model stack; tests
/// substitute scripted sources.
pub trait LandmarkSource {
    fn extract(&mut self, image: &RgbImage) -> Result<LandmarkSet, ExtractError>;
}

/// A face candidate in image coordinates, corner form.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Detection {
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
    score: f32,
}

/// ONNX-backed detector + 68-point landmark regressor.
pub struct OnnxLandmarkExtractor {
    detector: Session,
    landmarker: Session,
    /// Detector output indices (scores, boxes), discovered by name at load
    /// time with positional fallback.
    detector_outputs: (usize, usize),
}

impl OnnxLandmarkExtractor {
    /// Load both model files. Fails fast with the offending path when a
    /// file is missing.
    pub fn load(detector_path: &Path, landmark_path: &Path) -> Result<Self, ExtractError> {
        for path in [detector_path, landmark_path] {
            if !path.exists() {
                return Err(ExtractError::ModelNotFound(path.display().to_string()));
            }
        }

        let detector = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(detector_path)?;
        let landmarker = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(landmark_path)?;

        let names: Vec<String> = detector.outputs().iter().map(|o| o.name().to_string()).collect();
        let detector_outputs = (
            names.iter().position(|n| n == "scores").unwrap_or(0),
            names.iter().position(|n| n == "boxes").unwrap_or(1),
        );

        tracing::info!(
            detector = %detector_path.display(),
            landmarks = %landmark_path.display(),
            detector_output_names = ?names,
            "landmark extractor loaded"
        );
        Ok(Self { detector, landmarker, detector_outputs })
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, ExtractError> {
        let input = preprocess(
            image,
            DETECTOR_INPUT_WIDTH,
            DETECTOR_INPUT_HEIGHT,
            DETECTOR_MEAN,
            DETECTOR_STD,
        );
        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        // Two outputs: per-anchor [background, face] scores and normalized
        // corner boxes.
        let (score_idx, box_idx) = self.detector_outputs;

        let (_, scores) = outputs[score_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[box_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::InferenceFailed(format!("boxes: {e}")))?;

        let raw = decode_detections(
            scores,
            boxes,
            image.width() as f32,
            image.height() as f32,
            CONFIDENCE_THRESHOLD,
        );
        Ok(nms(raw, NMS_IOU_THRESHOLD))
    }

    fn regress_landmarks(
        &mut self,
        image: &RgbImage,
        face: &Detection,
    ) -> Result<LandmarkSet, ExtractError> {
        let crop = square_crop_box(face, image.width() as f32, image.height() as f32, CROP_MARGIN);
        let (cx, cy, cw, ch) = crop;

        let cropped = image::imageops::crop_imm(image, cx as u32, cy as u32, cw as u32, ch as u32)
            .to_image();
        let input = preprocess(
            &cropped,
            LANDMARK_INPUT_SIZE,
            LANDMARK_INPUT_SIZE,
            DETECTOR_MEAN,
            DETECTOR_STD,
        );
        let outputs = self
            .landmarker
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, values) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::InferenceFailed(format!("landmarks: {e}")))?;
        if values.len() < 2 * LANDMARK_COUNT {
            return Err(ExtractError::InferenceFailed(format!(
                "landmark head returned {} values, need {}",
                values.len(),
                2 * LANDMARK_COUNT
            )));
        }

        let points = map_crop_landmarks(&values[..2 * LANDMARK_COUNT], cx, cy, cw, ch);
        LandmarkSet::new(points)
            .map_err(|e| ExtractError::InferenceFailed(format!("landmark head: {e}")))
    }
}

impl LandmarkSource for OnnxLandmarkExtractor {
    /// Extract the 68 landmarks of the single expected face. Zero or
    /// multiple confident candidates fail; the pipeline skips the image
    /// rather than guessing which face the sequence is about.
    fn extract(&mut self, image: &RgbImage) -> Result<LandmarkSet, ExtractError> {
        let detections = self.detect(image)?;
        let face = match detections.as_slice() {
            [] => return Err(ExtractError::NoFace),
            [single] => *single,
            many => return Err(ExtractError::MultipleFaces(many.len())),
        };
        tracing::debug!(score = face.score, "face detected");
        self.regress_landmarks(image, &face)
    }
}

/// Resize to the model input, normalize, lay out as NCHW.
fn preprocess(image: &RgbImage, width: u32, height: u32, mean: f32, std: f32) -> Array4<f32> {
    let resized = if image.width() == width && image.height() == height {
        image.clone()
    } else {
        image::imageops::resize(image, width, height, FilterType::Triangle)
    };

    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - mean) / std;
        }
    }
    tensor
}

/// Decode UltraFace-style outputs: `scores` holds [background, face] pairs
/// per anchor, `boxes` holds normalized corner coordinates. Candidates
/// below `threshold` are discarded; the rest are scaled to pixel space.
fn decode_detections(
    scores: &[f32],
    boxes: &[f32],
    image_width: f32,
    image_height: f32,
    threshold: f32,
) -> Vec<Detection> {
    let count = (scores.len() / 2).min(boxes.len() / 4);
    let mut detections = Vec::new();
    for i in 0..count {
        let score = scores[i * 2 + 1];
        if score <= threshold {
            continue;
        }
        let b = &boxes[i * 4..i * 4 + 4];
        let det = Detection {
            x0: (b[0] * image_width).clamp(0.0, image_width - 1.0),
            y0: (b[1] * image_height).clamp(0.0, image_height - 1.0),
            x1: (b[2] * image_width).clamp(0.0, image_width - 1.0),
            y1: (b[3] * image_height).clamp(0.0, image_height - 1.0),
            score,
        };
        if det.x1 > det.x0 && det.y1 > det.y0 {
            detections.push(det);
        }
    }
    detections
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let ix0 = a.x0.max(b.x0);
    let iy0 = a.y0.max(b.y0);
    let ix1 = a.x1.min(b.x1);
    let iy1 = a.y1.min(b.y1);
    let inter = (ix1 - ix0).max(0.0) * (iy1 - iy0).max(0.0);
    let area_a = (a.x1 - a.x0) * (a.y1 - a.y0);
    let area_b = (b.x1 - b.x0) * (b.y1 - b.y0);
    let union = area_a + area_b - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Greedy NMS, highest score first.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Square crop around a detection with `margin` extra on each side,
/// clamped into the image. Returns (x, y, w, h) in pixels.
fn square_crop_box(det: &Detection, image_width: f32, image_height: f32, margin: f32) -> (f32, f32, f32, f32) {
    let w = det.x1 - det.x0;
    let h = det.y1 - det.y0;
    let side = w.max(h) * (1.0 + 2.0 * margin);
    let cx = (det.x0 + det.x1) / 2.0;
    let cy = (det.y0 + det.y1) / 2.0;

    let side = side.min(image_width).min(image_height).max(2.0);
    let x = (cx - side / 2.0).clamp(0.0, image_width - side);
    let y = (cy - side / 2.0).clamp(0.0, image_height - side);
    (x.floor(), y.floor(), side.floor(), side.floor())
}

/// Map crop-normalized landmark coordinates (x0,y0,x1,y1,... in [0,1])
/// back into image space.
fn map_crop_landmarks(values: &[f32], crop_x: f32, crop_y: f32, crop_w: f32, crop_h: f32) -> Vec<Point> {
    values
        .chunks_exact(2)
        .map(|xy| Point::new(crop_x + xy[0] * crop_w, crop_y + xy[1] * crop_h))
        .collect()
}
