use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use morphlapse_core::pipeline::{self, MorphParams, PipelineError, ProgressEvent, SourceImage};
use morphlapse_core::{BlendMode, CancelToken, Easing, OnnxLandmarkExtractor};
use morphlapse_encode::{probe_ffmpeg, EncodeError, EncoderSettings, FfmpegEncoder, Quality};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const EXIT_BAD_INPUT: i32 = 2;
const EXIT_TOO_FEW_FACES: i32 = 3;
const EXIT_ENCODER: i32 = 4;
const EXIT_CANCELLED: i32 = 130;

const DEFAULT_FPS: u32 = 25;
const DEFAULT_TRANSITION_SECONDS: f32 = 3.0;
const DEFAULT_PAUSE_SECONDS: f32 = 0.0;

const DETECTOR_MODEL_FILE: &str = "version-RFB-320.onnx";
const LANDMARK_MODEL_FILE: &str = "landmarks_68.onnx";

#[derive(Parser)]
#[command(name = "morphlapse", about = "Turn a folder of face photos into a morphing video")]
struct Cli {
    /// Directory of chronologically named face photos (jpg/jpeg/png)
    input_dir: PathBuf,

    /// Output video file [default: morphlapse_<timestamp>.mp4]
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Frames per second [default: 25]
    #[arg(long)]
    fps: Option<u32>,

    /// Transition length in seconds [default: 3.0]
    #[arg(long)]
    transition: Option<f32>,

    /// Pause on each photo in seconds [default: 0.0]
    #[arg(long)]
    pause: Option<f32>,

    /// Easing curve for transitions [default: linear]
    #[arg(long, value_enum)]
    easing: Option<EasingArg>,

    /// Blend mode for transitions [default: alpha]
    #[arg(long, value_enum)]
    blend: Option<BlendArg>,

    /// Encoding quality [default: high]
    #[arg(long, value_enum)]
    quality: Option<QualityArg>,

    /// Output resolution [default: original]
    #[arg(long, value_enum)]
    resolution: Option<Resolution>,

    /// Face detector model (default: $MORPHLAPSE_MODEL_DIR/version-RFB-320.onnx)
    #[arg(long)]
    detector_model: Option<PathBuf>,

    /// 68-point landmark model (default: $MORPHLAPSE_MODEL_DIR/landmarks_68.onnx)
    #[arg(long)]
    landmark_model: Option<PathBuf>,

    /// TOML preset file; explicit flags override its values
    #[arg(long)]
    params: Option<PathBuf>,

    /// Write the run summary (used/skipped images, frame count) as JSON
    #[arg(long)]
    report_json: Option<PathBuf>,

    /// Keep the partially written video on error or Ctrl-C
    #[arg(long)]
    keep_partial: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EasingArg {
    Linear,
    EaseIn,
    EaseOut,
    EaseInOut,
    Cubic,
    Bounce,
}

impl From<EasingArg> for Easing {
    fn from(value: EasingArg) -> Self {
        match value {
            EasingArg::Linear => Easing::Linear,
            EasingArg::EaseIn => Easing::EaseIn,
            EasingArg::EaseOut => Easing::EaseOut,
            EasingArg::EaseInOut => Easing::EaseInOut,
            EasingArg::Cubic => Easing::Cubic,
            EasingArg::Bounce => Easing::Bounce,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BlendArg {
    Alpha,
    Additive,
    Multiply,
    Screen,
}

impl From<BlendArg> for BlendMode {
    fn from(value: BlendArg) -> Self {
        match value {
            BlendArg::Alpha => BlendMode::Alpha,
            BlendArg::Additive => BlendMode::Additive,
            BlendArg::Multiply => BlendMode::Multiply,
            BlendArg::Screen => BlendMode::Screen,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum QualityArg {
    Low,
    Medium,
    High,
    Ultra,
}

impl From<QualityArg> for Quality {
    fn from(value: QualityArg) -> Self {
        match value {
            QualityArg::Low => Quality::Low,
            QualityArg::Medium => Quality::Medium,
            QualityArg::High => Quality::High,
            QualityArg::Ultra => Quality::Ultra,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
enum Resolution {
    #[value(name = "original")]
    #[serde(rename = "original")]
    Original,
    #[value(name = "480p")]
    #[serde(rename = "480p")]
    P480,
    #[value(name = "720p")]
    #[serde(rename = "720p")]
    P720,
    #[value(name = "1080p")]
    #[serde(rename = "1080p")]
    P1080,
}

/// Optional TOML preset. Every field may be omitted; explicit CLI flags
/// win over preset values.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParamsFile {
    fps: Option<u32>,
    transition_seconds: Option<f32>,
    pause_seconds: Option<f32>,
    easing: Option<Easing>,
    blend: Option<BlendMode>,
    quality: Option<Quality>,
    resolution: Option<Resolution>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            tracing::error!("{err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(pipeline_err) = err.downcast_ref::<PipelineError>() {
        return match pipeline_err {
            PipelineError::InvalidParameters(_) => EXIT_BAD_INPUT,
            PipelineError::TooFewValidImages(_) => EXIT_TOO_FEW_FACES,
            PipelineError::Encoder { .. } => EXIT_ENCODER,
            PipelineError::Cancelled => EXIT_CANCELLED,
        };
    }
    if err.downcast_ref::<EncodeError>().is_some() {
        return EXIT_ENCODER;
    }
    EXIT_BAD_INPUT
}

async fn run(cli: Cli) -> Result<()> {
    let preset = match &cli.params {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading preset {}", path.display()))?;
            toml::from_str::<ParamsFile>(&text)
                .with_context(|| format!("parsing preset {}", path.display()))?
        }
        None => ParamsFile::default(),
    };

    let image_paths = list_images(&cli.input_dir)?;
    tracing::info!(count = image_paths.len(), dir = %cli.input_dir.display(), "input images");

    let sources = load_images(&image_paths)?;
    if sources.len() < 2 {
        return Err(PipelineError::InvalidParameters(format!(
            "{} readable image(s) in {}, need at least 2",
            sources.len(),
            cli.input_dir.display()
        ))
        .into());
    }

    let resolution = cli.resolution.or(preset.resolution).unwrap_or(Resolution::Original);
    let first = &sources[0].image;
    let (width, height) = target_size(first.width(), first.height(), resolution);

    let params = MorphParams {
        width,
        height,
        fps: cli.fps.or(preset.fps).unwrap_or(DEFAULT_FPS),
        transition_seconds: cli
            .transition
            .or(preset.transition_seconds)
            .unwrap_or(DEFAULT_TRANSITION_SECONDS),
        pause_seconds: cli.pause.or(preset.pause_seconds).unwrap_or(DEFAULT_PAUSE_SECONDS),
        easing: cli.easing.map(Easing::from).or(preset.easing).unwrap_or_default(),
        blend: cli.blend.map(BlendMode::from).or(preset.blend).unwrap_or_default(),
    };
    params.validate()?;
    let quality = cli.quality.map(Quality::from).or(preset.quality).unwrap_or_default();

    // Fail fast on missing collaborators before any processing.
    probe_ffmpeg()?;
    let (detector_path, landmark_path) = model_paths(&cli);
    let extractor = OnnxLandmarkExtractor::load(&detector_path, &landmark_path)
        .context("loading landmark models")?;

    let output = cli.output.clone().unwrap_or_else(default_output_name);
    let encoder = FfmpegEncoder::start(
        &output,
        &EncoderSettings { width, height, fps: params.fps, quality },
    )?;

    let cancel = CancelToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current frame");
            signal_cancel.cancel();
        }
    });

    tracing::info!(
        output = %output.display(),
        width,
        height,
        fps = params.fps,
        transition = params.transition_seconds,
        pause = params.pause_seconds,
        easing = ?params.easing,
        blend = ?params.blend,
        "starting morph run"
    );

    let run_cancel = cancel.clone();
    let (result, encoder) = tokio::task::spawn_blocking(move || {
        let mut extractor = extractor;
        let mut encoder = encoder;
        let result = pipeline::run(
            &sources,
            &mut extractor,
            &mut encoder,
            &params,
            &report_progress,
            &run_cancel,
        );
        (result, encoder)
    })
    .await
    .context("pipeline worker panicked")?;

    match result {
        Ok(summary) => {
            encoder.finish()?;
            for skip in &summary.skips {
                tracing::warn!(image = %skip.label, stage = ?skip.stage, reason = %skip.reason, "image skipped");
            }
            for pair in &summary.dissolve_pairs {
                tracing::warn!(pair, "transition fell back to cross-dissolve");
            }
            tracing::info!(
                output = %output.display(),
                frames = summary.frames_written,
                used = summary.images_used,
                skipped = summary.skips.len(),
                "video written"
            );
            if let Some(path) = &cli.report_json {
                let file = std::fs::File::create(path)
                    .with_context(|| format!("creating report {}", path.display()))?;
                serde_json::to_writer_pretty(file, &summary)?;
                tracing::info!(report = %path.display(), "run summary written");
            }
            Ok(())
        }
        Err(err) => {
            // Encoder drop kills the ffmpeg child; the file on disk is
            // incomplete.
            drop(encoder);
            if !cli.keep_partial {
                if std::fs::remove_file(&output).is_ok() {
                    tracing::info!(output = %output.display(), "partial output removed");
                }
            }
            Err(err.into())
        }
    }
}

fn report_progress(event: ProgressEvent) {
    match event {
        ProgressEvent::ImageProcessed { index, total, ok } => {
            tracing::info!(image = index + 1, total, ok, "landmarks extracted");
        }
        ProgressEvent::TransitionCompleted { pair, total_pairs } => {
            tracing::info!(transition = pair + 1, total_pairs, "transition rendered");
        }
        ProgressEvent::FrameRendered { index, total } => {
            if (index + 1) % 50 == 0 || index + 1 == total {
                tracing::info!(frames = index + 1, total, "frames encoded");
            }
        }
    }
}

/// Image files of the input directory, sorted by file name (the
/// chronological ordering contract).
fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| PipelineError::InvalidParameters(format!("reading {}: {e}", dir.display())))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(PipelineError::InvalidParameters(format!(
            "no jpg/jpeg/png images in {}",
            dir.display()
        ))
        .into());
    }
    Ok(paths)
}

/// Decode every listed file; unreadable files are logged and dropped.
fn load_images(paths: &[PathBuf]) -> Result<Vec<SourceImage>> {
    let mut sources = Vec::with_capacity(paths.len());
    for path in paths {
        match image::open(path) {
            Ok(img) => sources.push(SourceImage {
                label: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string()),
                image: img.to_rgb8(),
            }),
            Err(err) => {
                tracing::warn!(image = %path.display(), error = %err, "unreadable image dropped");
            }
        }
    }
    Ok(sources)
}

fn model_paths(cli: &Cli) -> (PathBuf, PathBuf) {
    let model_dir = std::env::var("MORPHLAPSE_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("models"));
    let detector = cli
        .detector_model
        .clone()
        .unwrap_or_else(|| model_dir.join(DETECTOR_MODEL_FILE));
    let landmarks = cli
        .landmark_model
        .clone()
        .unwrap_or_else(|| model_dir.join(LANDMARK_MODEL_FILE));
    (detector, landmarks)
}

fn default_output_name() -> PathBuf {
    PathBuf::from(format!("morphlapse_{}.mp4", chrono::Local::now().format("%Y%m%d_%H%M%S")))
}

/// Output dimensions for a resolution choice, preserving the source
/// aspect ratio and rounding up to even values (H.264 requirement).
fn target_size(src_width: u32, src_height: u32, resolution: Resolution) -> (u32, u32) {
    let even = |v: u32| v + (v & 1);
    let target_height = match resolution {
        Resolution::Original => return (even(src_width), even(src_height)),
        Resolution::P480 => 480,
        Resolution::P720 => 720,
        Resolution::P1080 => 1080,
    };
    let aspect = src_width as f32 / src_height as f32;
    let target_width = (target_height as f32 * aspect).round() as u32;
    (even(target_width), even(target_height))
}
