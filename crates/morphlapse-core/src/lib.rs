//! morphlapse-core — landmark-driven face morphing engine.
//!
//! Turns an ordered set of face photographs into a morphing frame
//! sequence: 68-point landmark extraction (ONNX Runtime), similarity
//! alignment onto a shared reference frame, Delaunay mesh triangulation,
//! per-triangle affine warping with configurable easing and blending,
//! and ordered frame emission to a pluggable sink.

pub mod alignment;
pub mod extractor;
pub mod mesh;
pub mod morph;
pub mod pipeline;
pub mod sequence;
pub mod types;

pub use extractor::{ExtractError, LandmarkSource, OnnxLandmarkExtractor};
pub use morph::{BlendMode, Easing};
pub use pipeline::{
    CancelToken, FrameSink, MorphParams, PipelineError, ProgressEvent, RunSummary, SourceImage,
};
pub use types::{AlignedImage, LandmarkSet, Point};
