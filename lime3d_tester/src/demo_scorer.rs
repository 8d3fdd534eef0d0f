// THEORY:
// A stand-in for a real video classifier so the tester can run end to end
// without model weights. It reads three cues from the clip and turns them
// into a softmax over three made-up classes:
//   0 "dark scene"    high when the clip is dim overall
//   1 "centre object" high when the middle of the frame is brighter than the edges
//   2 "motion"        high when consecutive frames differ a lot
// Blacking out regions moves all three cues, which is all the explainer needs.

use lime3d::{OutputVector, VideoVolume};
use std::convert::Infallible;

pub const CLASS_NAMES: [&str; 3] = ["dark scene", "centre object", "motion"];

const TEMPERATURE: f64 = 0.1;

#[derive(Debug, Default, Clone, Copy)]
pub struct DemoScorer;

impl DemoScorer {
    fn cues(video: &VideoVolume) -> [f64; 3] {
        let (frames, height, width) = video.volume_shape();
        let data = video.data();

        let mut total = 0.0;
        let (mut centre, mut centre_count) = (0.0, 0usize);
        let mut motion = 0.0;
        for ((t, y, x, c), &value) in data.indexed_iter() {
            let level = value as f64 / 255.0;
            total += level;
            let in_centre =
                (height / 4..height - height / 4).contains(&y) && (width / 4..width - width / 4).contains(&x);
            if in_centre {
                centre += level;
                centre_count += 1;
            }
            if t > 0 {
                motion += (level - data[[t - 1, y, x, c]] as f64 / 255.0).abs();
            }
        }

        let mean = total / data.len() as f64;
        let centre_mean = if centre_count == 0 { mean } else { centre / centre_count as f64 };
        let transitions = (frames.saturating_sub(1) * height * width * video.channels()).max(1);
        [1.0 - mean, centre_mean - mean, motion / transitions as f64]
    }
}

impl lime3d::Scorer for DemoScorer {
    type Error = Infallible;

    fn score(&self, video: &VideoVolume) -> Result<OutputVector, Infallible> {
        let logits = Self::cues(video).map(|cue| cue / TEMPERATURE);
        let top = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps = logits.map(|logit| (logit - top).exp());
        let sum: f64 = exps.iter().sum();
        Ok(exps.iter().map(|value| value / sum).collect())
    }
}
