// THEORY:
// The visualizer turns region importance back into pixels. Every voxel takes
// the heat colour of the region it belongs to, which gives a heat-map video
// with exactly the shape of the input. That video is then blended over the
// original frames with a fixed 0.7 / 0.3 split so the scene stays readable
// underneath the colour.
//
// Heat colours follow a "hot" ramp: black for 0, through red and yellow, to
// white for 1. Importance 0 therefore leaves only the dimmed original.
//
// Two render modes:
//   • Continuous: every region is coloured by its importance.
//   • Highlight:  only regions at or above a percentile of the importance
//                 distribution are coloured; everything else stays black.

use crate::core_modules::segmenter::SegmentLabeling;
use crate::core_modules::surrogate::ImportanceVector;
use crate::core_modules::video_volume::VideoVolume;
use crate::error::{LimeError, Result};
use image::{Rgb, RgbImage};
use ndarray::{Array4, Axis};
use serde::{Deserialize, Serialize};

pub const ORIGINAL_WEIGHT: f64 = 0.7;
pub const HEATMAP_WEIGHT: f64 = 0.3;
pub const DEFAULT_HIGHLIGHT_PERCENTILE: f64 = 80.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum RenderMode {
    #[default]
    Continuous,
    Highlight { percentile: f64 },
}

/// Maps an importance in `[0, 1]` onto the black → red → yellow → white ramp.
pub fn heat_color(importance: f64) -> [u8; 3] {
    let t = if importance.is_finite() {
        importance.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let channel = |offset: f64| ((3.0 * t - offset).clamp(0.0, 1.0) * 255.0).round() as u8;
    [channel(0.0), channel(1.0), channel(2.0)]
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(values: &[f64], percent: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = percent.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Per-voxel heat colours, `(frames, height, width, 3)`.
#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapVolume {
    data: Array4<u8>,
}

impl HeatmapVolume {
    pub fn frame_count(&self) -> usize {
        self.data.dim().0
    }

    pub fn data(&self) -> &Array4<u8> {
        &self.data
    }

    pub fn frame(&self, index: usize) -> RgbImage {
        let frame = self.data.index_axis(Axis(0), index);
        let (height, width, _) = frame.dim();
        RgbImage::from_fn(width as u32, height as u32, |x, y| {
            let (row, col) = (y as usize, x as usize);
            Rgb([frame[[row, col, 0]], frame[[row, col, 1]], frame[[row, col, 2]]])
        })
    }
}

/// Expands region importance into a heat-map volume over the labeling.
pub fn build_heatmap(
    importance: &ImportanceVector,
    labeling: &SegmentLabeling,
    mode: RenderMode,
) -> Result<HeatmapVolume> {
    if importance.len() != labeling.region_count() {
        return Err(LimeError::validation(format!(
            "importance has {} entries but the labeling has {} regions",
            importance.len(),
            labeling.region_count()
        )));
    }

    let palette: Vec<[u8; 3]> = match mode {
        RenderMode::Continuous => importance.iter().map(|&value| heat_color(value)).collect(),
        RenderMode::Highlight { percentile: percent } => {
            if !(0.0..=100.0).contains(&percent) {
                return Err(LimeError::validation(format!(
                    "highlight percentile must lie in [0, 100], got {percent}"
                )));
            }
            let threshold = percentile(importance, percent).unwrap_or(f64::INFINITY);
            importance
                .iter()
                .map(|&value| {
                    if value >= threshold {
                        heat_color(value)
                    } else {
                        [0, 0, 0]
                    }
                })
                .collect()
        }
    };

    let labels = labeling.labels();
    let (frames, height, width) = labeling.shape();
    let data = Array4::from_shape_fn((frames, height, width, 3), |(t, y, x, c)| {
        palette[labels[[t, y, x]]][c]
    });
    Ok(HeatmapVolume { data })
}

fn blend(original: u8, heat: u8) -> u8 {
    (ORIGINAL_WEIGHT * original as f64 + HEATMAP_WEIGHT * heat as f64)
        .round()
        .clamp(0.0, 255.0) as u8
}

/// Blends heat frames over video frames, frame by frame.
///
/// Stops when either sequence runs out.
pub fn composite(video: &VideoVolume, heatmap: &HeatmapVolume) -> Vec<RgbImage> {
    (0..video.frame_count().min(heatmap.frame_count()))
        .map(|index| {
            let mut frame = video.frame_to_rgb(index);
            let heat = heatmap.data.index_axis(Axis(0), index);
            for (x, y, pixel) in frame.enumerate_pixels_mut() {
                let (row, col) = (y as usize, x as usize);
                for c in 0..3 {
                    pixel.0[c] = blend(pixel.0[c], heat[[row, col, c]]);
                }
            }
            frame
        })
        .collect()
}

/// Renders the explanation overlay for every frame.
pub fn render(
    video: &VideoVolume,
    importance: &ImportanceVector,
    labeling: &SegmentLabeling,
    mode: RenderMode,
) -> Result<Vec<RgbImage>> {
    let heatmap = build_heatmap(importance, labeling, mode)?;
    let (_, height, width) = video.volume_shape();
    let (_, label_height, label_width) = labeling.shape();
    if (height, width) != (label_height, label_width) {
        return Err(LimeError::validation(format!(
            "labeling is {label_width}x{label_height} but the video is {width}x{height}"
        )));
    }
    Ok(composite(video, &heatmap))
}
