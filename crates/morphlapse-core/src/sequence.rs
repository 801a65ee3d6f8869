//! Frame sequencing: expands (image count, timing parameters) into an
//! ordered stream of frame specifications.
//!
//! A spec is cheap (which image to hold, or which pair to morph at which
//! `t`), so the plan can be walked lazily, restarted, or chunked for
//! parallel rendering without holding any pixels.

use serde::{Deserialize, Serialize};

/// What a single output frame shows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameKind {
    /// Repeat aligned image `image` unchanged (pause segments).
    Hold { image: usize },
    /// Morph between images `pair` and `pair + 1` at linear time `t`.
    Morph { pair: usize, t: f32 },
}

/// One frame of the output stream. Indices are assigned 0..total with no
/// gaps, in emission order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSpec {
    pub index: u64,
    pub kind: FrameKind,
}

/// Timing shape of a run, resolved to whole frame counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePlan {
    image_count: usize,
    frames_per_transition: u64,
    pause_frames: u64,
}

impl SequencePlan {
    /// Build the plan from timing parameters. The caller validates ranges
    /// (see the pipeline's parameter validation); here the only contract
    /// is `image_count >= 2` and at least one frame per transition.
    pub fn new(image_count: usize, fps: u32, transition_seconds: f32, pause_seconds: f32) -> Self {
        let frames_per_transition = ((fps as f32 * transition_seconds).round() as u64).max(1);
        let pause_frames = (fps as f32 * pause_seconds).round() as u64;
        Self { image_count, frames_per_transition, pause_frames }
    }

    pub fn frames_per_transition(&self) -> u64 {
        self.frames_per_transition
    }

    /// Total frames the plan will emit: the leading pause, then one
    /// transition plus trailing pause per adjacent pair.
    pub fn total_frames(&self) -> u64 {
        let pairs = (self.image_count - 1) as u64;
        self.pause_frames + pairs * (self.frames_per_transition + self.pause_frames)
    }

    /// Lazy, restartable walk over all frame specs in emission order.
    pub fn frames(&self) -> impl Iterator<Item = FrameSpec> + '_ {
        (0..self.total_frames()).map(|index| FrameSpec { index, kind: self.kind_at(index) })
    }

    /// Interpolation parameter of transition frame `k` (0-based) within
    /// pair `pair`.
    ///
    /// The first pair samples both endpoints: `t = k/(N−1)`. Every later
    /// pair starts one step in, `t = (k+1)/N`, because its `t = 0` frame
    /// would repeat the previous transition's final frame; the seam
    /// between transitions is exactly one image.
    fn t_value(&self, pair: usize, k: u64) -> f32 {
        let n = self.frames_per_transition;
        if pair == 0 {
            if n == 1 {
                1.0
            } else {
                k as f32 / (n - 1) as f32
            }
        } else {
            (k + 1) as f32 / n as f32
        }
    }

    fn kind_at(&self, index: u64) -> FrameKind {
        if index < self.pause_frames {
            return FrameKind::Hold { image: 0 };
        }
        let j = index - self.pause_frames;
        let block_len = self.frames_per_transition + self.pause_frames;
        let pair = (j / block_len) as usize;
        let within = j % block_len;
        if within < self.frames_per_transition {
            FrameKind::Morph { pair, t: self.t_value(pair, within) }
        } else {
            FrameKind::Hold { image: pair + 1 }
        }
    }
}
