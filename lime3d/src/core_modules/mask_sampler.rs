// THEORY:
// The `MaskSampler` decides which regions to black out for each probe of the
// model. Every draw is an `ActivationVector`: one independent coin flip per
// region, `true` meaning "zero this region". From an activation vector and
// the segment labeling, a `PerturbationMask` is derived voxel by voxel: a voxel
// is masked exactly when its region's bit is set.
//
// The all-off and all-on vectors are legitimate draws and are kept. They carry
// little information for the surrogate fit, and dropping them would skew the
// per-region blackout rate away from `activation_probability`.

use crate::core_modules::segmenter::SegmentLabeling;
use crate::error::{LimeError, Result};
use ndarray::Array3;
use rand::Rng;

/// Probability that a region is blacked out in a draw.
pub const DEFAULT_ACTIVATION_PROBABILITY: f64 = 0.5;

/// One bit per region; `true` means the region is blacked out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActivationVector(Vec<bool>);

impl ActivationVector {
    pub fn new(bits: Vec<bool>) -> Self {
        Self(bits)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_blacked_out(&self, region: usize) -> bool {
        self.0[region]
    }

    pub fn blacked_out_count(&self) -> usize {
        self.0.iter().filter(|&&bit| bit).count()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }

    /// The bits as 0.0 / 1.0 regression features.
    pub fn to_features(&self) -> Vec<f64> {
        self.0.iter().map(|&bit| if bit { 1.0 } else { 0.0 }).collect()
    }
}

/// Voxel-level view of an `ActivationVector` over a labeling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerturbationMask {
    mask: Array3<bool>,
}

impl PerturbationMask {
    pub fn from_activation(
        activation: &ActivationVector,
        labeling: &SegmentLabeling,
    ) -> Result<Self> {
        if activation.len() != labeling.region_count() {
            return Err(LimeError::validation(format!(
                "activation has {} regions, labeling has {}",
                activation.len(),
                labeling.region_count()
            )));
        }
        Ok(Self::expand(activation, labeling))
    }

    /// Caller guarantees `activation.len() == labeling.region_count()`.
    fn expand(activation: &ActivationVector, labeling: &SegmentLabeling) -> Self {
        Self {
            mask: labeling.labels().mapv(|region| activation.is_blacked_out(region)),
        }
    }

    pub fn is_masked(&self, t: usize, y: usize, x: usize) -> bool {
        self.mask[[t, y, x]]
    }

    pub fn masked_count(&self) -> usize {
        self.mask.iter().filter(|&&cell| cell).count()
    }

    pub fn as_array(&self) -> &Array3<bool> {
        &self.mask
    }
}

/// A single draw: the region bits and the voxel mask derived from them.
#[derive(Debug, Clone)]
pub struct MaskSample {
    pub activation: ActivationVector,
    pub mask: PerturbationMask,
}

#[derive(Debug, Clone)]
pub struct MaskSampler {
    activation_probability: f64,
}

impl Default for MaskSampler {
    fn default() -> Self {
        Self {
            activation_probability: DEFAULT_ACTIVATION_PROBABILITY,
        }
    }
}

impl MaskSampler {
    pub fn new(activation_probability: f64) -> Result<Self> {
        if !(activation_probability > 0.0 && activation_probability < 1.0) {
            return Err(LimeError::validation(format!(
                "activation_probability must lie in (0, 1), got {activation_probability}"
            )));
        }
        Ok(Self {
            activation_probability,
        })
    }

    /// Draws `num_samples` independent activation vectors of length `region_count`.
    pub fn sample_activations<R: Rng + ?Sized>(
        &self,
        region_count: usize,
        num_samples: usize,
        rng: &mut R,
    ) -> Vec<ActivationVector> {
        (0..num_samples)
            .map(|_| {
                ActivationVector::new(
                    (0..region_count)
                        .map(|_| rng.gen_bool(self.activation_probability))
                        .collect(),
                )
            })
            .collect()
    }

    /// Draws `num_samples` activation vectors over the labeling's actual
    /// region count and materializes their masks.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        labeling: &SegmentLabeling,
        num_samples: usize,
        rng: &mut R,
    ) -> Vec<MaskSample> {
        self.sample_activations(labeling.region_count(), num_samples, rng)
            .into_iter()
            .map(|activation| MaskSample {
                mask: PerturbationMask::expand(&activation, labeling),
                activation,
            })
            .collect()
    }
}
