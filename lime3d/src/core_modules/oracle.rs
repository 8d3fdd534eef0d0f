// THEORY:
// The oracle is the only place that talks to the black-box model. It takes a
// mask, blacks out the masked voxels on a private copy of the video and hands
// the copy to the caller's `Scorer`.
//
// The scorer is opaque: anything that maps a video to an output vector (for
// example class probabilities) qualifies, including plain closures. The oracle
// never retries. A failing call, or an output that cannot be regressed on
// (empty, non-finite, or a different length than the baseline), becomes a
// `LimeError::Scoring` carrying the index of the perturbation that failed.

use crate::core_modules::mask_sampler::PerturbationMask;
use crate::core_modules::video_volume::VideoVolume;
use crate::error::{LimeError, Result};
use std::fmt::Display;

/// One output of the black-box model, e.g. a class-probability vector.
pub type OutputVector = Vec<f64>;

/// The caller-supplied model capability.
pub trait Scorer {
    type Error: Display;

    fn score(&self, video: &VideoVolume) -> std::result::Result<OutputVector, Self::Error>;
}

impl<F, E> Scorer for F
where
    F: Fn(&VideoVolume) -> std::result::Result<OutputVector, E>,
    E: Display,
{
    type Error = E;

    fn score(&self, video: &VideoVolume) -> std::result::Result<OutputVector, E> {
        self(video)
    }
}

/// Copies `video` and zeroes every channel of each masked voxel.
pub fn perturb(video: &VideoVolume, mask: &PerturbationMask) -> VideoVolume {
    let mut perturbed = video.clone();
    for ((t, y, x, _), sample) in perturbed.data_mut().indexed_iter_mut() {
        if mask.is_masked(t, y, x) {
            *sample = 0;
        }
    }
    perturbed
}

/// Runs the scorer on `video` and checks the output is usable.
///
/// `sample` only labels errors; `expected_len` is the baseline length once known.
pub fn score_video<S: Scorer + ?Sized>(
    scorer: &S,
    video: &VideoVolume,
    sample: Option<usize>,
    expected_len: Option<usize>,
) -> Result<OutputVector> {
    let output = scorer
        .score(video)
        .map_err(|e| LimeError::scoring(sample, e.to_string()))?;
    validate_output(output, sample, expected_len)
}

fn validate_output(
    output: OutputVector,
    sample: Option<usize>,
    expected_len: Option<usize>,
) -> Result<OutputVector> {
    if output.is_empty() {
        return Err(LimeError::scoring(sample, "malformed output: empty vector"));
    }
    if let Some(position) = output.iter().position(|value| !value.is_finite()) {
        return Err(LimeError::scoring(
            sample,
            format!("malformed output: non-finite value at index {position}"),
        ));
    }
    if let Some(expected) = expected_len {
        if output.len() != expected {
            return Err(LimeError::scoring(
                sample,
                format!(
                    "malformed output: {} values, baseline had {expected}",
                    output.len()
                ),
            ));
        }
    }
    Ok(output)
}

/// Scores perturbations of one video against one scorer.
pub struct PerturbationOracle<'a, S: Scorer + ?Sized> {
    video: &'a VideoVolume,
    scorer: &'a S,
    baseline_len: Option<usize>,
}

impl<'a, S: Scorer + ?Sized> PerturbationOracle<'a, S> {
    pub fn new(video: &'a VideoVolume, scorer: &'a S) -> Self {
        Self {
            video,
            scorer,
            baseline_len: None,
        }
    }

    /// Scores the unperturbed video. Later outputs must match its length.
    pub fn baseline(&mut self) -> Result<OutputVector> {
        let output = score_video(self.scorer, self.video, None, None)?;
        self.baseline_len = Some(output.len());
        Ok(output)
    }

    /// Scores perturbation `index` and returns the perturbed copy alongside the output.
    pub fn score(
        &self,
        index: usize,
        mask: &PerturbationMask,
    ) -> Result<(OutputVector, VideoVolume)> {
        let perturbed = perturb(self.video, mask);
        let output = score_video(self.scorer, &perturbed, Some(index), self.baseline_len)?;
        Ok((output, perturbed))
    }
}

/// Blacks out `mask` on a copy of `video` and scores it.
pub fn score<S: Scorer + ?Sized>(
    video: &VideoVolume,
    mask: &PerturbationMask,
    scorer: &S,
) -> Result<OutputVector> {
    score_video(scorer, &perturb(video, mask), None, None)
}
