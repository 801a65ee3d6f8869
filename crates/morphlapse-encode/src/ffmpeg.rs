//! ffmpeg child-process encoder.
//!
//! Frames arrive as raw RGB24 on the child's stdin; ffmpeg handles pixel
//! format conversion and the container. The output filter forces even
//! dimensions (H.264 requires them) regardless of input size.

use image::RgbImage;
use morphlapse_core::pipeline::{FrameSink, SinkError};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use thiserror::Error;

/// Tail of ffmpeg's stderr kept for error reporting.
const STDERR_TAIL: usize = 2048;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("ffmpeg not found on PATH, install ffmpeg to encode video")]
    FfmpegMissing,
    #[error("ffmpeg i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame size {got_w}x{got_h} does not match encoder size {want_w}x{want_h}")]
    FrameSizeMismatch { got_w: u32, got_h: u32, want_w: u32, want_h: u32 },
    #[error("ffmpeg exited with {status}: {stderr_tail}")]
    Failed { status: String, stderr_tail: String },
    #[error("encoder already finished")]
    Finished,
}

/// Encoding speed/size trade-off, mapped onto x264 presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Low,
    Medium,
    #[default]
    High,
    Ultra,
}

impl Quality {
    pub fn preset(self) -> &'static str {
        match self {
            Quality::Low => "ultrafast",
            Quality::Medium => "medium",
            Quality::High => "slow",
            Quality::Ultra => "slower",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: Quality,
}

/// Check that ffmpeg is callable. Run this before starting a pipeline so
/// a missing encoder fails the run up front, not after rendering.
pub fn probe_ffmpeg() -> Result<(), EncodeError> {
    let status = Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(s) if s.success() => Ok(()),
        _ => Err(EncodeError::FfmpegMissing),
    }
}

/// Build the ffmpeg argument list for one encoding run.
fn build_args(output: &Path, settings: &EncoderSettings) -> Vec<String> {
    vec![
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-s".into(),
        format!("{}x{}", settings.width, settings.height),
        "-r".into(),
        settings.fps.to_string(),
        "-i".into(),
        "-".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        settings.quality.preset().into(),
        // H.264 needs even dimensions
        "-vf".into(),
        "scale=trunc(iw/2)*2:trunc(ih/2)*2".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        output.display().to_string(),
    ]
}

/// A running ffmpeg encode. Frames must be written in presentation order;
/// [`finish`](FfmpegEncoder::finish) reaps the child and reports failure
/// with the stderr tail.
pub struct FfmpegEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    output: PathBuf,
    width: u32,
    height: u32,
    frames_written: u64,
}

impl FfmpegEncoder {
    pub fn start(output: &Path, settings: &EncoderSettings) -> Result<Self, EncodeError> {
        let args = build_args(output, settings);
        tracing::info!(output = %output.display(), ?settings, "starting ffmpeg");

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EncodeError::FfmpegMissing
                } else {
                    EncodeError::Io(e)
                }
            })?;

        let stdin = child.stdin.take();
        Ok(Self {
            child,
            stdin,
            output: output.to_path_buf(),
            width: settings.width,
            height: settings.height,
            frames_written: 0,
        })
    }

    /// Stream one frame. Frame dimensions must match the settings the
    /// encoder was started with.
    pub fn write(&mut self, frame: &RgbImage) -> Result<(), EncodeError> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(EncodeError::FrameSizeMismatch {
                got_w: frame.width(),
                got_h: frame.height(),
                want_w: self.width,
                want_h: self.height,
            });
        }
        let stdin = self.stdin.as_mut().ok_or(EncodeError::Finished)?;
        stdin.write_all(frame.as_raw())?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Close the stream and wait for ffmpeg. A non-zero exit is an error
    /// carrying the last part of stderr.
    pub fn finish(mut self) -> Result<(), EncodeError> {
        drop(self.stdin.take());

        let mut stderr = String::new();
        if let Some(mut pipe) = self.child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let status = self.child.wait()?;

        if status.success() {
            tracing::info!(
                output = %self.output.display(),
                frames = self.frames_written,
                "encoding finished"
            );
            Ok(())
        } else {
            let tail_start = stderr.len().saturating_sub(STDERR_TAIL);
            Err(EncodeError::Failed {
                status: status.to_string(),
                stderr_tail: stderr[tail_start..].to_string(),
            })
        }
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        // Normal completion goes through finish(); if the encoder is
        // dropped mid-run (error or cancellation upstream), reap the child
        // so it does not linger on a closed pipe.
        if self.stdin.take().is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl FrameSink for FfmpegEncoder {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), SinkError> {
        self.write(frame).map_err(|e| Box::new(e) as SinkError)
    }
}
