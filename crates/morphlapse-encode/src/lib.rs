//! morphlapse-encode — the video assembler boundary.
//!
//! Streams rendered frames, in strict order, into an external `ffmpeg`
//! process as raw RGB24 and turns its exit status into a per-run
//! success/failure. The encoder's own availability is probed up front so
//! a missing binary fails before any frame is rendered.

mod ffmpeg;

pub use ffmpeg::{probe_ffmpeg, EncodeError, EncoderSettings, FfmpegEncoder, Quality};
