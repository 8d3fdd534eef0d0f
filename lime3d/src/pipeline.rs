// THEORY:
// The `pipeline` module is the top-level API of the explainer. It wires the
// core modules into one call, `explain_instance`, that takes a video and a
// scorer and returns an `Explanation`:
//
//   segment → sample masks → score perturbations → weight → fit → normalize
//
// Nothing survives between calls. Every explanation segments, samples and
// fits from scratch, so the same pipeline can be reused for any number of
// videos and scorers. With a fixed seed and a deterministic scorer the result
// is reproducible bit for bit.
//
// All configuration is checked before the first scoring call. The one
// exception is the target class, whose range is only known once the baseline
// output exists.

use crate::core_modules::dataset::{Dataset, DatasetBuilder, DEFAULT_KERNEL_WIDTH};
use crate::core_modules::mask_sampler::{MaskSample, MaskSampler, DEFAULT_ACTIVATION_PROBABILITY};
use crate::core_modules::oracle::{OutputVector, Scorer};
use crate::core_modules::segmenter::{SegmentLabeling, Segmenter};
use crate::core_modules::surrogate::{self, ImportanceVector};
use crate::core_modules::utils::video_io::video_io;
use crate::core_modules::visualizer::{self, DEFAULT_HIGHLIGHT_PERCENTILE};
use crate::core_modules::video_volume::VideoVolume;
use crate::error::{LimeError, Result};
use image::RgbImage;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

// Re-export key data structures for the public API.
pub use crate::core_modules::visualizer::RenderMode;

pub const DEFAULT_NUM_SAMPLES: usize = 10;
pub const DEFAULT_TARGET_REGION_COUNT: usize = 20;
pub const DEFAULT_COMPACTNESS: f64 = 10.0;

/// Tunable parameters of one explanation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainConfig {
    /// Number of perturbed videos scored per explanation.
    pub num_samples: usize,
    /// Requested superpixel count. The segmenter may return a different number.
    pub target_region_count: usize,
    /// Colour vs. space trade-off of the segmenter. Higher means more regular regions.
    pub compactness: f64,
    pub kernel_width: f64,
    /// Percentile used by `RenderMode::Highlight` when built from this config.
    pub highlight_percentile: f64,
    /// Chance that a region is blacked out in a single draw.
    pub activation_probability: f64,
    /// Output component to explain. `None` picks the baseline's top class.
    pub target_class: Option<usize>,
    pub seed: Option<u64>,
    /// Scoring workers of the parallel pipeline.
    pub workers: usize,
    /// Per-call scoring deadline of the parallel pipeline.
    pub score_timeout: Option<Duration>,
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self {
            num_samples: DEFAULT_NUM_SAMPLES,
            target_region_count: DEFAULT_TARGET_REGION_COUNT,
            compactness: DEFAULT_COMPACTNESS,
            kernel_width: DEFAULT_KERNEL_WIDTH,
            highlight_percentile: DEFAULT_HIGHLIGHT_PERCENTILE,
            activation_probability: DEFAULT_ACTIVATION_PROBABILITY,
            target_class: None,
            seed: None,
            workers: num_cpus::get(),
            score_timeout: None,
        }
    }
}

impl ExplainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_samples == 0 {
            return Err(LimeError::validation("num_samples must be at least 1"));
        }
        if self.target_region_count == 0 {
            return Err(LimeError::validation("target_region_count must be at least 1"));
        }
        if !(self.compactness.is_finite() && self.compactness > 0.0) {
            return Err(LimeError::validation(format!(
                "compactness must be positive, got {}",
                self.compactness
            )));
        }
        if !(self.kernel_width.is_finite() && self.kernel_width > 0.0) {
            return Err(LimeError::validation(format!(
                "kernel_width must be positive, got {}",
                self.kernel_width
            )));
        }
        if !(0.0..=100.0).contains(&self.highlight_percentile) {
            return Err(LimeError::validation(format!(
                "highlight_percentile must lie in [0, 100], got {}",
                self.highlight_percentile
            )));
        }
        if !(self.activation_probability > 0.0 && self.activation_probability < 1.0) {
            return Err(LimeError::validation(format!(
                "activation_probability must lie in (0, 1), got {}",
                self.activation_probability
            )));
        }
        if self.workers == 0 {
            return Err(LimeError::validation("workers must be at least 1"));
        }
        if self.score_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(LimeError::validation("score_timeout must be non-zero"));
        }
        Ok(())
    }

    /// Highlight mode at the configured percentile.
    pub fn highlight_mode(&self) -> RenderMode {
        RenderMode::Highlight {
            percentile: self.highlight_percentile,
        }
    }
}

/// Everything one `explain_instance` call produced.
#[derive(Debug, Clone, Serialize)]
pub struct Explanation {
    #[serde(skip)]
    pub labeling: SegmentLabeling,
    #[serde(skip)]
    pub dataset: Dataset,
    pub region_count: usize,
    pub region_sizes: Vec<usize>,
    pub baseline: OutputVector,
    pub target_class: usize,
    /// Raw surrogate coefficients on the blackout indicators.
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub importance: ImportanceVector,
    /// `true` when the uniform fallback replaced the importance.
    pub degenerate: bool,
}

impl Explanation {
    /// Region IDs ordered from most to least important.
    pub fn ranking(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.importance.len()).collect();
        order.sort_by(|&a, &b| self.importance[b].total_cmp(&self.importance[a]));
        order
    }
}

pub(crate) fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Stages shared by both pipelines before any scoring happens.
pub(crate) fn prepare(
    config: &ExplainConfig,
    video: &VideoVolume,
) -> Result<(SegmentLabeling, Vec<MaskSample>)> {
    config.validate()?;

    // Stage 1: Spatio-temporal segmentation
    let labeling = Segmenter::new(config.target_region_count, config.compactness)?.segment(video)?;
    info!(
        requested = config.target_region_count,
        regions = labeling.region_count(),
        "video segmented"
    );

    // Stage 2: Perturbation sampling
    let sampler = MaskSampler::new(config.activation_probability)?;
    let masks = sampler.sample(&labeling, config.num_samples, &mut make_rng(config.seed));
    Ok((labeling, masks))
}

/// Stages shared by both pipelines once the dataset is complete.
pub(crate) fn finish(
    config: &ExplainConfig,
    labeling: SegmentLabeling,
    dataset: Dataset,
) -> Result<Explanation> {
    // Stage 4: Local surrogate
    let fit = surrogate::fit(&dataset, config.target_class)?;
    info!(
        target_class = fit.target_class,
        degenerate = fit.degenerate,
        "surrogate fitted"
    );

    Ok(Explanation {
        region_count: labeling.region_count(),
        region_sizes: labeling.region_sizes(),
        labeling,
        baseline: dataset.baseline.clone(),
        dataset,
        target_class: fit.target_class,
        coefficients: fit.coefficients,
        intercept: fit.intercept,
        importance: fit.importance,
        degenerate: fit.degenerate,
    })
}

/// The sequential explainer. Scores one perturbation at a time.
pub struct ExplainPipeline {
    config: ExplainConfig,
}

impl ExplainPipeline {
    pub fn new(config: ExplainConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExplainConfig {
        &self.config
    }

    pub fn explain_instance<S: Scorer + ?Sized>(
        &self,
        scorer: &S,
        video: &VideoVolume,
    ) -> Result<Explanation> {
        let (labeling, masks) = prepare(&self.config, video)?;

        // Stage 3: Black-box queries
        let dataset = DatasetBuilder::new(self.config.kernel_width)?.build(video, &masks, scorer)?;
        info!(samples = dataset.len(), "perturbations scored");

        finish(&self.config, labeling, dataset)
    }

    /// Overlays the explanation's heat map on `video`.
    pub fn render(
        &self,
        video: &VideoVolume,
        explanation: &Explanation,
        mode: RenderMode,
    ) -> Result<Vec<RgbImage>> {
        visualizer::render(video, &explanation.importance, &explanation.labeling, mode)
    }

    /// Loads `input`, explains it and writes the overlay to `output` as a GIF.
    pub fn explain_file<S: Scorer + ?Sized>(
        &self,
        scorer: &S,
        input: &Path,
        output: &Path,
        mode: RenderMode,
    ) -> Result<Explanation> {
        let video = video_io::load_video(input)?;
        let explanation = self.explain_instance(scorer, &video)?;
        let frames = self.render(&video, &explanation, mode)?;
        video_io::write_gif(output, &frames, video_io::DEFAULT_FPS)?;
        info!(output = %output.display(), frames = frames.len(), "overlay written");
        Ok(explanation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn bars_video() -> VideoVolume {
        VideoVolume::new(Array4::from_shape_fn((2, 6, 6, 1), |(_, _, x, _)| {
            if x < 3 { 60 } else { 200 }
        }))
        .unwrap()
    }

    fn bright_left(video: &VideoVolume) -> std::result::Result<OutputVector, String> {
        let data = video.data();
        let (mut left, mut right) = (0.0, 0.0);
        for ((_, _, x, _), &value) in data.indexed_iter() {
            if x < 3 {
                left += value as f64;
            } else {
                right += value as f64;
            }
        }
        let total = (left + right).max(1.0);
        Ok(vec![left / total, right / total])
    }

    #[test]
    fn default_config_is_valid() {
        let config = ExplainConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_samples, 10);
        assert_eq!(config.target_region_count, 20);
        assert_eq!(config.kernel_width, 0.25);
        assert_eq!(config.highlight_percentile, 80.0);
        assert!(config.workers >= 1);
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        let bad = [
            ExplainConfig { num_samples: 0, ..Default::default() },
            ExplainConfig { target_region_count: 0, ..Default::default() },
            ExplainConfig { compactness: 0.0, ..Default::default() },
            ExplainConfig { kernel_width: -0.1, ..Default::default() },
            ExplainConfig { highlight_percentile: 101.0, ..Default::default() },
            ExplainConfig { activation_probability: 1.0, ..Default::default() },
            ExplainConfig { workers: 0, ..Default::default() },
            ExplainConfig { score_timeout: Some(Duration::ZERO), ..Default::default() },
        ];
        for config in bad {
            assert!(ExplainPipeline::new(config).is_err());
        }
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ExplainConfig =
            serde_json::from_str(r#"{ "num_samples": 25, "seed": 7 }"#).unwrap();
        assert_eq!(config.num_samples, 25);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.target_region_count, DEFAULT_TARGET_REGION_COUNT);
    }

    #[test]
    fn same_seed_same_explanation() {
        let config = ExplainConfig {
            num_samples: 12,
            target_region_count: 4,
            seed: Some(11),
            ..Default::default()
        };
        let pipeline = ExplainPipeline::new(config).unwrap();
        let first = pipeline.explain_instance(&bright_left, &bars_video()).unwrap();
        let second = pipeline.explain_instance(&bright_left, &bars_video()).unwrap();
        assert_eq!(first.importance, second.importance);
        assert_eq!(first.labeling, second.labeling);
        assert_eq!(first.region_count, first.importance.len());
        assert_eq!(first.target_class, 1);
    }

    #[test]
    fn out_of_range_target_class_is_rejected() {
        let config = ExplainConfig {
            target_region_count: 2,
            target_class: Some(5),
            seed: Some(1),
            ..Default::default()
        };
        let err = ExplainPipeline::new(config)
            .unwrap()
            .explain_instance(&bright_left, &bars_video())
            .unwrap_err();
        assert!(matches!(err, LimeError::Validation(_)));
    }

    #[test]
    fn ranking_orders_by_importance() {
        let config = ExplainConfig {
            num_samples: 4,
            target_region_count: 2,
            seed: Some(2),
            ..Default::default()
        };
        let pipeline = ExplainPipeline::new(config).unwrap();
        let explanation = pipeline.explain_instance(&bright_left, &bars_video()).unwrap();
        let ranking = explanation.ranking();
        assert_eq!(ranking.len(), explanation.region_count);
        for pair in ranking.windows(2) {
            assert!(explanation.importance[pair[0]] >= explanation.importance[pair[1]]);
        }
    }
}
