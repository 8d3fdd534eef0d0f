// THEORY:
// The `DatasetBuilder` turns a list of mask samples into the regression
// dataset the surrogate is fitted on. It drives the oracle once for the
// unperturbed baseline and once per mask, and attaches a locality weight to
// every sample.
//
// Locality is measured in input space: the cosine distance between the
// flattened perturbed video and the flattened original. A perturbation that
// barely changes the video sits close to the instance being explained and
// gets a weight near 1; heavy blackouts drift away and get down-weighted by
// the kernel
//
//     weight = sqrt(exp(-d² / kernel_width²)) = exp(-d² / (2·kernel_width²))
//
// The second form keeps twice the exponent range before underflow, and the
// result is floored at the smallest positive f64 so every weight stays in
// (0, 1] even for a very narrow kernel.
//
// The three arrays (activations, outputs, weights) are index-aligned: entry
// `i` of each belongs to mask sample `i`. Nothing is cached, so a dataset over
// `n` masks costs exactly `n + 1` scorer calls.

use crate::core_modules::mask_sampler::{ActivationVector, MaskSample};
use crate::core_modules::oracle::{OutputVector, PerturbationOracle, Scorer};
use crate::core_modules::video_volume::VideoVolume;
use crate::error::{LimeError, Result};
use ndarray::Array4;
use tracing::debug;

pub const DEFAULT_KERNEL_WIDTH: f64 = 0.25;

/// Index-aligned samples for the surrogate fit.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub activations: Vec<ActivationVector>,
    pub outputs: Vec<OutputVector>,
    pub weights: Vec<f64>,
    pub distances: Vec<f64>,
    pub baseline: OutputVector,
}

impl Dataset {
    /// Assembles a dataset from already-scored samples, computing the weights.
    pub fn from_parts(
        activations: Vec<ActivationVector>,
        outputs: Vec<OutputVector>,
        distances: Vec<f64>,
        baseline: OutputVector,
        kernel_width: f64,
    ) -> Result<Self> {
        let weights = distances
            .iter()
            .map(|&distance| kernel_weight(distance, kernel_width))
            .collect();
        let dataset = Self {
            activations,
            outputs,
            weights,
            distances,
            baseline,
        };
        dataset.validate()?;
        Ok(dataset)
    }

    /// Checks that the arrays are index-aligned and every row has the same shape.
    pub fn validate(&self) -> Result<()> {
        let samples = self.activations.len();
        if self.outputs.len() != samples
            || self.weights.len() != samples
            || self.distances.len() != samples
        {
            return Err(LimeError::validation(format!(
                "dataset arrays disagree: {} activations, {} outputs, {} weights, {} distances",
                samples,
                self.outputs.len(),
                self.weights.len(),
                self.distances.len()
            )));
        }
        let regions = self.region_count();
        if let Some(index) = self.activations.iter().position(|a| a.len() != regions) {
            return Err(LimeError::validation(format!(
                "activation {index} has {} regions, expected {regions}",
                self.activations[index].len()
            )));
        }
        if let Some(index) = self
            .outputs
            .iter()
            .position(|output| output.len() != self.baseline.len())
        {
            return Err(LimeError::validation(format!(
                "output {index} has length {}, baseline has {}",
                self.outputs[index].len(),
                self.baseline.len()
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Number of regions per activation vector.
    pub fn region_count(&self) -> usize {
        self.activations.first().map_or(0, ActivationVector::len)
    }
}

/// Cosine distance between two videos flattened over every sample.
///
/// A zero-norm side has no direction, so its similarity is taken as 0 and the
/// distance as 1. The result is clamped to `[0, 2]`.
pub fn cosine_distance(a: &Array4<u8>, b: &Array4<u8>) -> f64 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 2.0)
}

/// Exponential locality kernel over a distance, always in `(0, 1]`.
pub fn kernel_weight(distance: f64, kernel_width: f64) -> f64 {
    (-(distance * distance) / (2.0 * kernel_width * kernel_width))
        .exp()
        .max(f64::MIN_POSITIVE)
}

#[derive(Debug, Clone)]
pub struct DatasetBuilder {
    kernel_width: f64,
}

impl Default for DatasetBuilder {
    fn default() -> Self {
        Self {
            kernel_width: DEFAULT_KERNEL_WIDTH,
        }
    }
}

impl DatasetBuilder {
    pub fn new(kernel_width: f64) -> Result<Self> {
        if !(kernel_width.is_finite() && kernel_width > 0.0) {
            return Err(LimeError::validation(format!(
                "kernel_width must be positive, got {kernel_width}"
            )));
        }
        Ok(Self { kernel_width })
    }

    pub fn kernel_width(&self) -> f64 {
        self.kernel_width
    }

    /// Scores the baseline and every mask, in order. The first failure aborts.
    pub fn build<S: Scorer + ?Sized>(
        &self,
        video: &VideoVolume,
        masks: &[MaskSample],
        scorer: &S,
    ) -> Result<Dataset> {
        let mut oracle = PerturbationOracle::new(video, scorer);
        let baseline = oracle.baseline()?;
        debug!(outputs = baseline.len(), "baseline scored");

        let mut outputs = Vec::with_capacity(masks.len());
        let mut distances = Vec::with_capacity(masks.len());
        for (index, sample) in masks.iter().enumerate() {
            let (output, perturbed) = oracle.score(index, &sample.mask)?;
            let distance = cosine_distance(perturbed.data(), video.data());
            debug!(
                sample = index,
                blacked_out = sample.activation.blacked_out_count(),
                distance,
                "perturbation scored"
            );
            outputs.push(output);
            distances.push(distance);
        }

        let activations = masks.iter().map(|sample| sample.activation.clone()).collect();
        Dataset::from_parts(activations, outputs, distances, baseline, self.kernel_width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::mask_sampler::{MaskSampler, PerturbationMask};
    use crate::core_modules::segmenter::SegmentLabeling;
    use ndarray::Array3;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::cell::Cell;

    fn striped_video() -> (VideoVolume, SegmentLabeling) {
        let video =
            VideoVolume::new(Array4::from_shape_fn((2, 4, 6, 1), |(_, y, x, _)| {
                (40 + 10 * x + y) as u8
            }))
            .unwrap();
        let labels = Array3::from_shape_fn((2, 4, 6), |(_, _, x)| x / 2);
        (video, SegmentLabeling::from_labels(labels).unwrap())
    }

    #[test]
    fn identical_videos_have_zero_distance() {
        let a = Array4::from_elem((1, 2, 2, 3), 9u8);
        assert!(cosine_distance(&a, &a).abs() < 1e-12);
        assert!((kernel_weight(0.0, DEFAULT_KERNEL_WIDTH) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_norm_distance_is_one() {
        let zeros = Array4::<u8>::zeros((1, 2, 2, 1));
        let ones = Array4::from_elem((1, 2, 2, 1), 1u8);
        assert_eq!(cosine_distance(&zeros, &ones), 1.0);
        assert_eq!(cosine_distance(&zeros, &zeros), 1.0);
    }

    #[test]
    fn orthogonal_videos_have_unit_distance() {
        let a = Array4::from_shape_vec((1, 1, 2, 1), vec![5u8, 0]).unwrap();
        let b = Array4::from_shape_vec((1, 1, 2, 1), vec![0u8, 7]).unwrap();
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn kernel_matches_closed_form() {
        // sqrt(exp(-(0.25²) / 0.25²)) = exp(-0.5)
        assert!((kernel_weight(0.25, 0.25) - (-0.5f64).exp()).abs() < 1e-12);
        assert!(kernel_weight(2.0, 0.25) > 0.0);
    }

    #[test]
    fn narrow_kernel_never_reaches_zero() {
        for distance in [0.1, 0.5, 1.0, 2.0] {
            let weight = kernel_weight(distance, 0.01);
            assert!(weight > 0.0 && weight <= 1.0, "weight {weight} at d={distance}");
        }
        assert_eq!(kernel_weight(0.0, 0.01), 1.0);
    }

    #[test]
    fn narrow_kernel_dataset_weights_stay_positive() {
        let (video, labeling) = striped_video();
        let masks = MaskSampler::default().sample(&labeling, 12, &mut StdRng::seed_from_u64(5));
        let scorer = |video: &VideoVolume| -> std::result::Result<OutputVector, String> {
            Ok(vec![video.data().iter().map(|&v| v as f64).sum::<f64>()])
        };
        let dataset = DatasetBuilder::new(0.01)
            .unwrap()
            .build(&video, &masks, &scorer)
            .unwrap();
        assert!(dataset.weights.iter().all(|&w| w > 0.0 && w <= 1.0));
    }

    #[test]
    fn from_parts_rejects_misaligned_rows() {
        let baseline = vec![0.5, 0.5];
        let ragged_activations = Dataset::from_parts(
            vec![
                ActivationVector::new(vec![true, false]),
                ActivationVector::new(vec![true]),
            ],
            vec![vec![0.4, 0.6], vec![0.3, 0.7]],
            vec![0.1, 0.2],
            baseline.clone(),
            DEFAULT_KERNEL_WIDTH,
        );
        assert!(matches!(ragged_activations, Err(LimeError::Validation(_))));

        let short_output = Dataset::from_parts(
            vec![ActivationVector::new(vec![true, false])],
            vec![vec![0.4]],
            vec![0.1],
            baseline.clone(),
            DEFAULT_KERNEL_WIDTH,
        );
        assert!(matches!(short_output, Err(LimeError::Validation(_))));

        let missing_distance = Dataset::from_parts(
            vec![ActivationVector::new(vec![true, false])],
            vec![vec![0.4, 0.6]],
            vec![],
            baseline,
            DEFAULT_KERNEL_WIDTH,
        );
        assert!(matches!(missing_distance, Err(LimeError::Validation(_))));
    }

    #[test]
    fn build_produces_aligned_arrays() {
        let (video, labeling) = striped_video();
        let masks = MaskSampler::default().sample(&labeling, 6, &mut StdRng::seed_from_u64(3));
        let scorer = |video: &VideoVolume| -> std::result::Result<OutputVector, String> {
            let lit = video.data().iter().filter(|&&v| v > 0).count() as f64;
            let total = video.data().len() as f64;
            Ok(vec![lit / total, 1.0 - lit / total])
        };
        let dataset = DatasetBuilder::default().build(&video, &masks, &scorer).unwrap();

        assert_eq!(dataset.len(), 6);
        assert_eq!(dataset.outputs.len(), 6);
        assert_eq!(dataset.weights.len(), 6);
        assert_eq!(dataset.region_count(), 3);
        assert_eq!(dataset.baseline, vec![1.0, 0.0]);
        for (sample, weight) in masks.iter().zip(&dataset.weights) {
            assert!(*weight > 0.0 && *weight <= 1.0);
            if sample.activation.blacked_out_count() == 0 {
                assert!((*weight - 1.0).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn build_calls_scorer_once_per_mask_plus_baseline() {
        let (video, labeling) = striped_video();
        let masks = MaskSampler::default().sample(&labeling, 4, &mut StdRng::seed_from_u64(8));
        let calls = Cell::new(0usize);
        let scorer = |_: &VideoVolume| -> std::result::Result<OutputVector, String> {
            calls.set(calls.get() + 1);
            Ok(vec![0.5])
        };
        DatasetBuilder::default().build(&video, &masks, &scorer).unwrap();
        assert_eq!(calls.get(), 5);
    }

    #[test]
    fn failure_aborts_with_sample_index() {
        let (video, labeling) = striped_video();
        let masks: Vec<MaskSample> = [[false, false, false], [true, false, false]]
            .iter()
            .map(|bits| {
                let activation = ActivationVector::new(bits.to_vec());
                MaskSample {
                    mask: PerturbationMask::from_activation(&activation, &labeling).unwrap(),
                    activation,
                }
            })
            .collect();
        let scorer = |video: &VideoVolume| -> std::result::Result<OutputVector, String> {
            if video.data().iter().any(|&v| v == 0) {
                Err("refused".into())
            } else {
                Ok(vec![1.0])
            }
        };
        let err = DatasetBuilder::default()
            .build(&video, &masks, &scorer)
            .unwrap_err();
        assert!(matches!(err, LimeError::Scoring { sample: Some(1), .. }));
    }

    #[test]
    fn rejects_bad_kernel_width() {
        assert!(DatasetBuilder::new(0.0).is_err());
        assert!(DatasetBuilder::new(-1.0).is_err());
        assert!(DatasetBuilder::new(f64::INFINITY).is_err());
    }
}
