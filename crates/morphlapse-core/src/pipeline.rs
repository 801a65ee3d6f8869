//! Pipeline orchestration: images in, ordered frames out.
//!
//! A run owns all of its state (reference frame, aligned images, per-pair
//! triangulations), so independent runs can coexist and teardown is just
//! dropping the context. The caller supplies the landmark source,
//! the frame sink, a progress callback and a cancellation token; the core
//! stays free of any UI or encoder technology.

use crate::alignment;
use crate::extractor::LandmarkSource;
use crate::mesh::{self, Triangulation};
use crate::morph::{self, BlendMode, Easing};
use crate::sequence::{FrameKind, FrameSpec, SequencePlan};
use crate::types::{AlignedImage, LandmarkSet, Point};
use image::RgbImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Frames rendered per parallel batch before being flushed, in order, to
/// the sink. Bounds memory: at most this many frames are in flight.
const RENDER_CHUNK: usize = 32;

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("{0} usable image(s) after filtering failures, need at least 2")]
    TooFewValidImages(usize),
    #[error("encoder failed at frame {index}: {source}")]
    Encoder { index: u64, source: SinkError },
    #[error("run cancelled")]
    Cancelled,
}

/// Morph parameters for a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MorphParams {
    /// Output frame width in pixels.
    pub width: u32,
    /// Output frame height in pixels.
    pub height: u32,
    pub fps: u32,
    pub transition_seconds: f32,
    pub pause_seconds: f32,
    #[serde(default)]
    pub easing: Easing,
    #[serde(default)]
    pub blend: BlendMode,
}

impl MorphParams {
    /// Surface bad parameters before any processing starts.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: String| Err(PipelineError::InvalidParameters(msg));
        if self.fps == 0 {
            return fail("fps must be positive".into());
        }
        if self.width == 0 || self.height == 0 {
            return fail(format!("output size {}x{} is empty", self.width, self.height));
        }
        if !self.transition_seconds.is_finite() || self.transition_seconds <= 0.0 {
            return fail(format!("transition length {} must be positive", self.transition_seconds));
        }
        if !self.pause_seconds.is_finite() || self.pause_seconds < 0.0 {
            return fail(format!("pause length {} must not be negative", self.pause_seconds));
        }
        Ok(())
    }
}

/// Cooperative cancellation flag, checked at image, pair and frame-batch
/// granularity. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Checkpoints reported to the caller while a run progresses.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Landmark extraction finished for one input image.
    ImageProcessed { index: usize, total: usize, ok: bool },
    /// All frames of one transition have been handed to the sink.
    TransitionCompleted { pair: usize, total_pairs: usize },
    /// One frame has been handed to the sink.
    FrameRendered { index: u64, total: u64 },
}

pub type ProgressFn<'a> = dyn Fn(ProgressEvent) + Send + Sync + 'a;

/// Ordered, single-consumer receiver of rendered frames.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), SinkError>;
}

/// An input image with a label used in skip reports (file name, usually).
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub label: String,
    pub image: RgbImage,
}

/// Stage at which an input was dropped from the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipStage {
    Detection,
    Alignment,
}

/// One recoverable per-image failure, reported in the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skip {
    pub label: String,
    pub stage: SkipStage,
    pub reason: String,
}

/// Run-level report: what was used, what was skipped and why, what was
/// produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub images_total: usize,
    pub images_used: usize,
    pub skips: Vec<Skip>,
    /// Pairs that fell back to a plain cross-dissolve because no usable
    /// mesh could be built.
    pub dissolve_pairs: Vec<usize>,
    pub frames_written: u64,
}

/// Per-pair geometry: a shared mesh, or the dissolve fallback.
enum PairGeometry {
    Mesh(Triangulation),
    Dissolve,
}

/// Run the whole pipeline: extract, align, triangulate, render, emit.
///
/// Frames reach `sink` in strictly increasing index order even though
/// rendering happens in parallel batches. Per-image failures are
/// collected into the summary; the run only aborts when fewer than two
/// usable images remain, on encoder failure, or on cancellation.
pub fn run(
    sources: &[SourceImage],
    extractor: &mut dyn LandmarkSource,
    sink: &mut dyn FrameSink,
    params: &MorphParams,
    progress: &ProgressFn,
    cancel: &CancelToken,
) -> Result<RunSummary, PipelineError> {
    params.validate()?;
    if sources.len() < 2 {
        return Err(PipelineError::InvalidParameters(format!(
            "need at least 2 input images, got {}",
            sources.len()
        )));
    }

    let mut skips: Vec<Skip> = Vec::new();

    // Landmark extraction. Sequential: the ONNX sessions are stateful and
    // internally threaded.
    let mut detected: Vec<(&SourceImage, LandmarkSet)> = Vec::with_capacity(sources.len());
    for (index, source) in sources.iter().enumerate() {
        cancel.checkpoint()?;
        let ok = match extractor.extract(&source.image) {
            Ok(landmarks) => {
                detected.push((source, landmarks));
                true
            }
            Err(err) => {
                tracing::warn!(image = %source.label, error = %err, "skipping image: no landmarks");
                skips.push(Skip {
                    label: source.label.clone(),
                    stage: SkipStage::Detection,
                    reason: err.to_string(),
                });
                false
            }
        };
        progress(ProgressEvent::ImageProcessed { index, total: sources.len(), ok });
    }

    if detected.len() < 2 {
        return Err(PipelineError::TooFewValidImages(detected.len()));
    }

    // Reference frame: the first valid image's landmarks, rescaled onto
    // the output canvas. Immutable for the rest of the run.
    let (first, first_landmarks) = &detected[0];
    let sx = params.width as f32 / first.image.width() as f32;
    let sy = params.height as f32 / first.image.height() as f32;
    let reference = LandmarkSet::new(
        first_landmarks
            .points()
            .iter()
            .map(|p| Point::new(p.x * sx, p.y * sy))
            .collect(),
    )
    .map_err(|e| PipelineError::InvalidParameters(format!("reference landmarks: {e}")))?;

    // Alignment into the reference frame.
    let mut aligned: Vec<AlignedImage> = Vec::with_capacity(detected.len());
    for (source, landmarks) in &detected {
        cancel.checkpoint()?;
        match alignment::align_to_reference(
            &source.image,
            landmarks,
            &reference,
            params.width,
            params.height,
        ) {
            Ok((image, landmarks)) => aligned.push(AlignedImage { image, landmarks }),
            Err(err) => {
                tracing::warn!(image = %source.label, error = %err, "skipping image: alignment failed");
                skips.push(Skip {
                    label: source.label.clone(),
                    stage: SkipStage::Alignment,
                    reason: err.to_string(),
                });
            }
        }
    }

    if aligned.len() < 2 {
        return Err(PipelineError::TooFewValidImages(aligned.len()));
    }
    tracing::info!(
        used = aligned.len(),
        skipped = skips.len(),
        "images aligned into reference frame"
    );

    // One shared mesh per adjacent pair, built over the midpoint of the
    // two extended landmark sets.
    let mut geometry: Vec<PairGeometry> = Vec::with_capacity(aligned.len() - 1);
    let mut dissolve_pairs: Vec<usize> = Vec::new();
    for pair in 0..aligned.len() - 1 {
        cancel.checkpoint()?;
        let pts_a = aligned[pair].extended_points();
        let pts_b = aligned[pair + 1].extended_points();
        let mid: Vec<Point> = pts_a.iter().zip(&pts_b).map(|(&a, &b)| a.lerp(b, 0.5)).collect();
        match mesh::triangulate(&mid) {
            Ok(tri) => geometry.push(PairGeometry::Mesh(tri)),
            Err(err) => {
                tracing::warn!(pair, error = %err, "triangulation failed, falling back to cross-dissolve");
                dissolve_pairs.push(pair);
                geometry.push(PairGeometry::Dissolve);
            }
        }
    }

    // Render and emit.
    let plan = SequencePlan::new(
        aligned.len(),
        params.fps,
        params.transition_seconds,
        params.pause_seconds,
    );
    let total_frames = plan.total_frames();
    let total_pairs = aligned.len() - 1;
    tracing::info!(total_frames, fps = params.fps, "rendering frame sequence");

    let render = |spec: &FrameSpec| -> RgbImage {
        match spec.kind {
            FrameKind::Hold { image } => aligned[image].image.clone(),
            FrameKind::Morph { pair, t } => match &geometry[pair] {
                PairGeometry::Mesh(tri) => morph::render_frame(
                    &aligned[pair],
                    &aligned[pair + 1],
                    tri,
                    t,
                    params.easing,
                    params.blend,
                ),
                PairGeometry::Dissolve => morph::render_dissolve(
                    &aligned[pair].image,
                    &aligned[pair + 1].image,
                    t,
                    params.easing,
                    params.blend,
                ),
            },
        }
    };

    let specs: Vec<FrameSpec> = plan.frames().collect();
    let mut frames_written: u64 = 0;
    let mut last_pair: Option<usize> = None;

    for chunk in specs.chunks(RENDER_CHUNK) {
        cancel.checkpoint()?;

        // Parallel render; collect() keeps chunk order, which is emission
        // order. This is the barrier that re-serializes for the encoder.
        let rendered: Vec<RgbImage> = chunk.par_iter().map(&render).collect();

        for (spec, frame) in chunk.iter().zip(&rendered) {
            cancel.checkpoint()?;
            sink.write_frame(frame).map_err(|source| PipelineError::Encoder {
                index: spec.index,
                source,
            })?;
            frames_written += 1;

            let pair = match spec.kind {
                FrameKind::Morph { pair, .. } => Some(pair),
                FrameKind::Hold { .. } => None,
            };
            if let Some(done) = last_pair {
                if pair != Some(done) {
                    progress(ProgressEvent::TransitionCompleted { pair: done, total_pairs });
                    last_pair = None;
                }
            }
            if pair.is_some() {
                last_pair = pair;
            }

            progress(ProgressEvent::FrameRendered { index: spec.index, total: total_frames });
        }
    }
    if let Some(done) = last_pair {
        progress(ProgressEvent::TransitionCompleted { pair: done, total_pairs });
    }

    let summary = RunSummary {
        images_total: sources.len(),
        images_used: aligned.len(),
        skips,
        dissolve_pairs,
        frames_written,
    };
    tracing::info!(
        frames = summary.frames_written,
        used = summary.images_used,
        skipped = summary.skips.len(),
        "run complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::ExtractError;
    use crate::types::LANDMARK_COUNT;

    /// Scripted landmark source: one entry per expected call.
    struct ScriptedSource {
        results: Vec<Option<LandmarkSet>>,
        calls: usize,
    }

    impl ScriptedSource {
        fn new(results: Vec<Option<LandmarkSet>>) -> Self {
            Self { results, calls: 0 }
        }
    }

    impl LandmarkSource for ScriptedSource {
        fn extract(&mut self, _image: &RgbImage) -> Result<LandmarkSet, ExtractError> {
            let result = self.results[self.calls].clone();
            self.calls += 1;
            result.ok_or(ExtractError::NoFace)
        }
    }

    /// Sink that counts frames, optionally failing at a given index.
    #[derive(Default)]
    struct CountingSink {
        frames: u64,
        fail_at: Option<u64>,
    }

    impl FrameSink for CountingSink {
        fn write_frame(&mut self, _frame: &RgbImage) -> Result<(), SinkError> {
            if Some(self.frames) == self.fail_at {
                return Err("pipe closed".into());
            }
            self.frames += 1;
            Ok(())
        }
    }

    fn landmarks(offset: f32) -> LandmarkSet {
        let pts = (0..LANDMARK_COUNT)
            .map(|i| {
                let gx = (i % 9) as f32;
                let gy = (i / 9) as f32;
                Point::new(6.0 + gx * 2.0 + offset, 6.0 + gy * 2.0 + offset)
            })
            .collect();
        LandmarkSet::new(pts).unwrap()
    }

    fn source(label: &str, shade: u8) -> SourceImage {
        SourceImage {
            label: label.into(),
            image: RgbImage::from_pixel(32, 32, image::Rgb([shade, shade / 2, 255 - shade])),
        }
    }

    fn params() -> MorphParams {
        MorphParams {
            width: 32,
            height: 32,
            fps: 5,
            transition_seconds: 1.0,
            pause_seconds: 0.0,
            easing: Easing::Linear,
            blend: BlendMode::Alpha,
        }
    }

    fn no_progress() -> Box<ProgressFn<'static>> {
        Box::new(|_| {})
    }

    #[test]
    fn test_invalid_fps_rejected_before_processing() {
        let mut extractor = ScriptedSource::new(vec![]);
        let mut sink = CountingSink::default();
        let sources = [source("a.jpg", 10), source("b.jpg", 200)];
        let mut p = params();
        p.fps = 0;
        let err = run(&sources, &mut extractor, &mut sink, &p, &no_progress(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameters(_)));
        assert_eq!(extractor.calls, 0, "no extraction before validation");
    }

    #[test]
    fn test_empty_image_list_rejected() {
        let mut extractor = ScriptedSource::new(vec![]);
        let mut sink = CountingSink::default();
        let err = run(&[], &mut extractor, &mut sink, &params(), &no_progress(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameters(_)));
    }

    #[test]
    fn test_happy_path_frame_count() {
        // 3 images, fps=5, transition=1s, pause=0 → 2 × 5 = 10 frames.
        let mut extractor = ScriptedSource::new(vec![
            Some(landmarks(0.0)),
            Some(landmarks(0.5)),
            Some(landmarks(1.0)),
        ]);
        let mut sink = CountingSink::default();
        let sources = [source("a.jpg", 10), source("b.jpg", 100), source("c.jpg", 200)];
        let summary =
            run(&sources, &mut extractor, &mut sink, &params(), &no_progress(), &CancelToken::new())
                .unwrap();
        assert_eq!(summary.frames_written, 10);
        assert_eq!(sink.frames, 10);
        assert_eq!(summary.images_used, 3);
        assert!(summary.skips.is_empty());
        assert!(summary.dissolve_pairs.is_empty());
    }

    #[test]
    fn test_one_detection_failure_is_recoverable() {
        // 4 inputs, one fails detection → 3-image sequence plus a report.
        let mut extractor = ScriptedSource::new(vec![
            Some(landmarks(0.0)),
            None,
            Some(landmarks(0.5)),
            Some(landmarks(1.0)),
        ]);
        let mut sink = CountingSink::default();
        let sources = [
            source("a.jpg", 10),
            source("b.jpg", 60),
            source("c.jpg", 120),
            source("d.jpg", 220),
        ];
        let summary =
            run(&sources, &mut extractor, &mut sink, &params(), &no_progress(), &CancelToken::new())
                .unwrap();
        assert_eq!(summary.images_total, 4);
        assert_eq!(summary.images_used, 3);
        assert_eq!(summary.skips.len(), 1);
        assert_eq!(summary.skips[0].label, "b.jpg");
        assert_eq!(summary.skips[0].stage, SkipStage::Detection);
        // 2 transitions at 5 fps × 1 s
        assert_eq!(summary.frames_written, 10);
    }

    #[test]
    fn test_too_few_valid_images_is_fatal() {
        let mut extractor = ScriptedSource::new(vec![Some(landmarks(0.0)), None, None]);
        let mut sink = CountingSink::default();
        let sources = [source("a.jpg", 10), source("b.jpg", 60), source("c.jpg", 120)];
        let err =
            run(&sources, &mut extractor, &mut sink, &params(), &no_progress(), &CancelToken::new())
                .unwrap_err();
        assert!(matches!(err, PipelineError::TooFewValidImages(1)));
        assert_eq!(sink.frames, 0, "no video output");
    }

    #[test]
    fn test_encoder_failure_is_fatal() {
        let mut extractor =
            ScriptedSource::new(vec![Some(landmarks(0.0)), Some(landmarks(1.0))]);
        let mut sink = CountingSink { frames: 0, fail_at: Some(3) };
        let sources = [source("a.jpg", 10), source("b.jpg", 200)];
        let err =
            run(&sources, &mut extractor, &mut sink, &params(), &no_progress(), &CancelToken::new())
                .unwrap_err();
        match err {
            PipelineError::Encoder { index, .. } => assert_eq!(index, 3),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_cancellation_stops_the_run() {
        let mut extractor =
            ScriptedSource::new(vec![Some(landmarks(0.0)), Some(landmarks(1.0))]);
        let mut sink = CountingSink::default();
        let sources = [source("a.jpg", 10), source("b.jpg", 200)];
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = run(&sources, &mut extractor, &mut sink, &params(), &no_progress(), &cancel)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(sink.frames, 0);
    }

    #[test]
    fn test_progress_events_cover_all_checkpoints() {
        use std::sync::Mutex;
        let events: Mutex<Vec<ProgressEvent>> = Mutex::new(Vec::new());
        let mut extractor = ScriptedSource::new(vec![
            Some(landmarks(0.0)),
            Some(landmarks(0.5)),
            Some(landmarks(1.0)),
        ]);
        let mut sink = CountingSink::default();
        let sources = [source("a.jpg", 10), source("b.jpg", 100), source("c.jpg", 200)];
        let progress = |e: ProgressEvent| events.lock().unwrap().push(e);
        run(&sources, &mut extractor, &mut sink, &params(), &progress, &CancelToken::new())
            .unwrap();

        let events = events.into_inner().unwrap();
        let images = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::ImageProcessed { .. }))
            .count();
        let transitions = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::TransitionCompleted { .. }))
            .count();
        let frames = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::FrameRendered { .. }))
            .count();
        assert_eq!(images, 3);
        assert_eq!(transitions, 2);
        assert_eq!(frames, 10);

        // frame events arrive in strict index order
        let indices: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::FrameRendered { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, (0..10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_first_frame_reproduces_first_aligned_image() {
        let mut extractor =
            ScriptedSource::new(vec![Some(landmarks(0.0)), Some(landmarks(1.0))]);

        struct CaptureSink {
            first: Option<RgbImage>,
        }
        impl FrameSink for CaptureSink {
            fn write_frame(&mut self, frame: &RgbImage) -> Result<(), SinkError> {
                if self.first.is_none() {
                    self.first = Some(frame.clone());
                }
                Ok(())
            }
        }

        let mut sink = CaptureSink { first: None };
        let sources = [source("a.jpg", 40), source("b.jpg", 200)];
        run(&sources, &mut extractor, &mut sink, &params(), &no_progress(), &CancelToken::new())
            .unwrap();
        // Uniform input stays uniform under alignment, so the first frame
        // must be a uniform image of a's color.
        let first = sink.first.unwrap();
        assert!(first.pixels().all(|p| p.0 == [40, 20, 215]));
    }
}
