mod demo_scorer;
#[cfg(feature = "opencv")]
mod cv_io;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use demo_scorer::{CLASS_NAMES, DemoScorer};
use image::RgbImage;
use lime3d::core_modules::dataset::DEFAULT_KERNEL_WIDTH;
use lime3d::core_modules::mask_sampler::DEFAULT_ACTIVATION_PROBABILITY;
use lime3d::core_modules::utils::video_io::video_io;
use lime3d::core_modules::visualizer::{self, DEFAULT_HIGHLIGHT_PERCENTILE};
use lime3d::pipeline::{DEFAULT_COMPACTNESS, DEFAULT_NUM_SAMPLES, DEFAULT_TARGET_REGION_COUNT};
use lime3d::{
    ExplainConfig, ExplainPipeline, Explanation, ParallelExplainPipeline, RenderMode, VideoVolume,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Colour every region by its importance
    Continuous,
    /// Colour only regions above the highlight percentile
    Highlight,
}

#[derive(Parser)]
#[command(name = "lime3d_tester")]
#[command(about = "Explains a demo video classifier with spatio-temporal LIME")]
#[command(version)]
struct Cli {
    /// Input video: an animated GIF or a directory of frames
    input: PathBuf,

    /// Output overlay: `.gif`, a directory for PNG frames, or `.avi` with the opencv feature
    output: PathBuf,

    #[arg(long, value_enum, default_value = "highlight")]
    mode: Mode,

    /// Score perturbations on a worker pool
    #[arg(long)]
    parallel: bool,

    /// Per-call scoring deadline in milliseconds (parallel only)
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long, default_value_t = DEFAULT_NUM_SAMPLES)]
    num_samples: usize,

    #[arg(long, default_value_t = DEFAULT_TARGET_REGION_COUNT)]
    regions: usize,

    #[arg(long, default_value_t = DEFAULT_COMPACTNESS)]
    compactness: f64,

    #[arg(long, default_value_t = DEFAULT_KERNEL_WIDTH)]
    kernel_width: f64,

    #[arg(long, default_value_t = DEFAULT_HIGHLIGHT_PERCENTILE)]
    highlight_percentile: f64,

    #[arg(long, default_value_t = DEFAULT_ACTIVATION_PROBABILITY)]
    activation_probability: f64,

    /// Class to explain; defaults to the top class of the unperturbed video
    #[arg(long)]
    target_class: Option<usize>,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Scoring workers (parallel only); defaults to the CPU count
    #[arg(long)]
    workers: Option<usize>,

    /// Also write the explanation as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

impl Cli {
    fn config(&self) -> ExplainConfig {
        let defaults = ExplainConfig::default();
        ExplainConfig {
            num_samples: self.num_samples,
            target_region_count: self.regions,
            compactness: self.compactness,
            kernel_width: self.kernel_width,
            highlight_percentile: self.highlight_percentile,
            activation_probability: self.activation_probability,
            target_class: self.target_class,
            seed: self.seed,
            workers: self.workers.unwrap_or(defaults.workers),
            score_timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lime3d=info,lime3d_tester=info")),
        )
        .init();

    // --- 1. Argument Parsing & Setup ---
    let cli = Cli::parse();
    let config = cli.config();
    config.validate().context("invalid configuration")?;

    // --- 2. Video Input ---
    let video = load_input(&cli.input)
        .with_context(|| format!("failed to load {}", cli.input.display()))?;
    let (frames, height, width) = video.volume_shape();
    info!(frames, width, height, channels = video.channels(), "video loaded");

    // --- 3. Explanation ---
    let explanation = if cli.parallel {
        ParallelExplainPipeline::new(config.clone())?
            .explain_instance(Arc::new(DemoScorer), Arc::new(video.clone()))
            .await?
    } else {
        ExplainPipeline::new(config.clone())?.explain_instance(&DemoScorer, &video)?
    };

    // --- 4. Visualization ---
    let mode = match cli.mode {
        Mode::Continuous => RenderMode::Continuous,
        Mode::Highlight => config.highlight_mode(),
    };
    let overlay = visualizer::render(&video, &explanation.importance, &explanation.labeling, mode)?;
    write_output(&cli.output, &overlay)
        .with_context(|| format!("failed to write {}", cli.output.display()))?;

    // --- 5. Report ---
    print_report(&explanation);
    if let Some(path) = &cli.report {
        std::fs::write(path, serde_json::to_string_pretty(&explanation)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    println!("Processing complete. Output saved to {}", cli.output.display());
    Ok(())
}

fn has_extension(path: &Path, wanted: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| wanted.contains(&ext.to_ascii_lowercase().as_str()))
}

#[cfg(feature = "opencv")]
fn load_input(path: &Path) -> Result<VideoVolume> {
    if path.is_file() && !has_extension(path, &["gif"]) {
        return cv_io::read_video(path);
    }
    Ok(video_io::load_video(path)?)
}

#[cfg(not(feature = "opencv"))]
fn load_input(path: &Path) -> Result<VideoVolume> {
    Ok(video_io::load_video(path)?)
}

fn write_output(path: &Path, frames: &[RgbImage]) -> Result<()> {
    if has_extension(path, &["gif"]) {
        video_io::write_gif(path, frames, video_io::DEFAULT_FPS)?;
        return Ok(());
    }
    #[cfg(feature = "opencv")]
    {
        if has_extension(path, &["avi", "mp4", "mkv"]) {
            return cv_io::write_video(path, frames, video_io::DEFAULT_FPS as f64);
        }
    }
    if path.extension().is_none() {
        video_io::write_frames(path, frames)?;
        return Ok(());
    }
    bail!("unsupported output format: {}", path.display())
}

fn print_report(explanation: &Explanation) {
    let class_name = CLASS_NAMES
        .get(explanation.target_class)
        .copied()
        .unwrap_or("unknown");
    println!(
        "Explained class {} ({class_name}), baseline {:?}",
        explanation.target_class, explanation.baseline
    );
    if explanation.degenerate {
        println!("Surrogate fit was degenerate: every region scored 0.");
    }
    println!("{:>8} {:>12} {:>10}", "region", "importance", "voxels");
    for region in explanation.ranking() {
        println!(
            "{:>8} {:>12.4} {:>10}",
            region, explanation.importance[region], explanation.region_sizes[region]
        );
    }
}
