// THEORY:
// The `Segmenter` turns a video into the units an explanation talks about:
// spatio-temporal superpixels. It runs SLIC (simple linear iterative
// clustering) with time treated as a third spatial axis, so one region can
// follow the same patch of colour across several consecutive frames.
//
// Algorithm steps:
// 1.  **Feature space**: RGB samples are converted to CIE L*a*b*; greyscale
//     samples are scaled to 0..1. Features are divided by `compactness`, which
//     trades colour fidelity for spatial regularity.
// 2.  **Seeding**: cluster centres start on a regular `(t, y, x)` grid sized so
//     that roughly `target_region_count` of them fit in the volume.
// 3.  **Assignment / update**: for a fixed number of rounds, every voxel within
//     two grid steps of a centre is claimed by the centre with the smallest
//     combined colour + scaled spatial distance; centres then move to the mean
//     of what they claimed. Iteration stops early once nothing changes.
// 4.  **Connectivity**: clusters are not guaranteed to be connected. A region
//     growing pass (6-neighbourhood BFS) relabels connected components in scan
//     order and folds undersized fragments into an already-labeled neighbour.
//     The surviving labels are contiguous from zero.
//
// The target count is a request, not a promise. Everything downstream reads the
// actual region count from the `SegmentLabeling`.
//
// The whole transform is deterministic: no randomness, no dependence on thread
// scheduling.

use crate::core_modules::pixel::pixel::Pixel;
use crate::core_modules::video_volume::VideoVolume;
use crate::error::{LimeError, Result};
use ndarray::{Array3, Array4};
use tracing::debug;

const MAX_ITERATIONS: usize = 10;
const MIN_SIZE_FACTOR: f64 = 0.5;
const MAX_SIZE_FACTOR: f64 = 3.0;

/// The six face-adjacent neighbours in `(t, y, x)`.
const NEIGHBOURS: [(isize, isize, isize); 6] = [
    (0, 0, 1),
    (0, 0, -1),
    (0, 1, 0),
    (0, -1, 0),
    (1, 0, 0),
    (-1, 0, 0),
];

/// Region IDs per voxel, contiguous in `0..region_count`.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentLabeling {
    labels: Array3<usize>,
    region_count: usize,
}

impl SegmentLabeling {
    /// Validates that every ID in `0..=max` occurs at least once.
    pub fn from_labels(labels: Array3<usize>) -> Result<Self> {
        if labels.is_empty() {
            return Err(LimeError::validation("labeling is empty"));
        }
        let region_count = labels.iter().copied().max().map_or(0, |max| max + 1);
        let mut seen = vec![false; region_count];
        for &label in labels.iter() {
            seen[label] = true;
        }
        if let Some(missing) = seen.iter().position(|present| !present) {
            return Err(LimeError::validation(format!(
                "region ids are not contiguous: {missing} is missing from 0..{region_count}"
            )));
        }
        Ok(Self {
            labels,
            region_count,
        })
    }

    /// The actual number of regions, which may differ from the requested target.
    pub fn region_count(&self) -> usize {
        self.region_count
    }

    pub fn labels(&self) -> &Array3<usize> {
        &self.labels
    }

    /// `(frames, height, width)`
    pub fn shape(&self) -> (usize, usize, usize) {
        self.labels.dim()
    }

    /// Voxel count per region.
    pub fn region_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.region_count];
        for &label in self.labels.iter() {
            sizes[label] += 1;
        }
        sizes
    }
}

/// Per-axis seed placement: `(start, step)`.
type GridAxis = (usize, usize);

/// Spatio-temporal SLIC segmenter.
#[derive(Debug, Clone)]
pub struct Segmenter {
    target_region_count: usize,
    compactness: f64,
}

impl Segmenter {
    pub fn new(target_region_count: usize, compactness: f64) -> Result<Self> {
        if target_region_count == 0 {
            return Err(LimeError::validation("target_region_count must be at least 1"));
        }
        if !(compactness.is_finite() && compactness > 0.0) {
            return Err(LimeError::validation(format!(
                "compactness must be a positive number, got {compactness}"
            )));
        }
        Ok(Self {
            target_region_count,
            compactness,
        })
    }

    pub fn segment(&self, video: &VideoVolume) -> Result<SegmentLabeling> {
        let features = feature_volume(video, self.compactness);
        let (frames, height, width, channels) = features.dim();
        let grid = regular_grid([frames, height, width], self.target_region_count);
        let step = grid.iter().map(|&(_, step)| step).max().unwrap_or(1).max(1);

        let mut centres = seed_centres(&features, &grid);
        debug!(
            seeds = centres.len(),
            step, "seeded spatio-temporal superpixels"
        );

        let spatial_weight = 1.0 / (step * step) as f64;
        let mut nearest = Array3::<usize>::zeros((frames, height, width));
        let mut distance = Array3::<f64>::zeros((frames, height, width));

        for iteration in 0..MAX_ITERATIONS {
            distance.fill(f64::MAX);
            let mut changed = false;

            for (k, centre) in centres.iter().enumerate() {
                let [t_range, y_range, x_range] =
                    centre.window(2 * step, [frames, height, width]);
                for t in t_range.clone() {
                    let dt = centre.position[0] - t as f64;
                    for y in y_range.clone() {
                        let dy = centre.position[1] - y as f64;
                        for x in x_range.clone() {
                            let dx = centre.position[2] - x as f64;
                            let mut d = (dt * dt + dy * dy + dx * dx) * spatial_weight;
                            for c in 0..channels {
                                let diff = features[[t, y, x, c]] - centre.colour[c];
                                d += diff * diff;
                            }
                            if d < distance[[t, y, x]] {
                                distance[[t, y, x]] = d;
                                if nearest[[t, y, x]] != k {
                                    nearest[[t, y, x]] = k;
                                    changed = true;
                                }
                            }
                        }
                    }
                }
            }

            // The first round always assigns, even when every voxel lands on centre 0.
            if !changed && iteration > 0 {
                debug!(iteration, "superpixel assignment converged");
                break;
            }
            update_centres(&mut centres, &features, &nearest);
        }

        let voxels = frames * height * width;
        let segment_size = voxels as f64 / centres.len().max(1) as f64;
        let min_size = (MIN_SIZE_FACTOR * segment_size) as usize;
        let max_size = ((MAX_SIZE_FACTOR * segment_size) as usize).max(1);
        let labels = enforce_connectivity(&nearest, min_size, max_size);
        let labeling = SegmentLabeling::from_labels(labels)?;
        debug!(
            requested = self.target_region_count,
            actual = labeling.region_count(),
            "segmentation finished"
        );
        Ok(labeling)
    }
}

/// Segments `video` into roughly `target_region_count` spatio-temporal regions.
pub fn segment(
    video: &VideoVolume,
    target_region_count: usize,
    compactness: f64,
) -> Result<SegmentLabeling> {
    Segmenter::new(target_region_count, compactness)?.segment(video)
}

#[derive(Debug, Clone)]
struct Centre {
    position: [f64; 3],
    colour: Vec<f64>,
}

impl Centre {
    fn window(&self, radius: usize, shape: [usize; 3]) -> [std::ops::Range<usize>; 3] {
        std::array::from_fn(|axis| {
            let centre = self.position[axis];
            let low = (centre - radius as f64).max(0.0) as usize;
            let high = ((centre + radius as f64 + 1.0).max(0.0) as usize).min(shape[axis]);
            low..high
        })
    }
}

/// Clustering features scaled by `1 / compactness`.
fn feature_volume(video: &VideoVolume, compactness: f64) -> Array4<f64> {
    let (frames, height, width) = video.volume_shape();
    let data = video.data();
    let scale = 1.0 / compactness;

    if video.channels() == 3 {
        let mut features = Array4::<f64>::zeros((frames, height, width, 3));
        for t in 0..frames {
            for y in 0..height {
                for x in 0..width {
                    let lab = Pixel::new(data[[t, y, x, 0]], data[[t, y, x, 1]], data[[t, y, x, 2]])
                        .lab();
                    features[[t, y, x, 0]] = lab.l * scale;
                    features[[t, y, x, 1]] = lab.a * scale;
                    features[[t, y, x, 2]] = lab.b * scale;
                }
            }
        }
        features
    } else {
        data.mapv(|sample| sample as f64 / 255.0 * scale)
    }
}

/// Chooses per-axis seed steps so about `n_points` seeds fit in `shape`.
///
/// The step is the same on every axis unless an axis is shorter than it; such
/// axes collapse to a single seed and the remaining steps are recomputed.
fn regular_grid(shape: [usize; 3], n_points: usize) -> [GridAxis; 3] {
    let space_size: f64 = shape.iter().map(|&d| d as f64).product();
    if space_size <= n_points as f64 {
        return [(0, 1); 3];
    }

    let mut order = [0usize, 1, 2];
    order.sort_by_key(|&axis| shape[axis]);
    let sorted: [f64; 3] = std::array::from_fn(|i| shape[order[i]] as f64);

    let n = n_points as f64;
    let mut steps = [(space_size / n).powf(1.0 / 3.0); 3];
    if sorted.iter().zip(&steps).any(|(dim, step)| dim < step) {
        for dim in 0..3 {
            steps[dim] = sorted[dim];
            let remaining_axes = 3 - dim - 1;
            if remaining_axes > 0 {
                let rest: f64 = sorted[dim + 1..].iter().product();
                let step = (rest / n).powf(1.0 / remaining_axes as f64);
                for s in steps.iter_mut().skip(dim + 1) {
                    *s = step;
                }
            }
            if sorted.iter().zip(&steps).all(|(dim, step)| dim >= step) {
                break;
            }
        }
    }

    let mut grid = [(0usize, 1usize); 3];
    for (i, &axis) in order.iter().enumerate() {
        let start = (steps[i] / 2.0).floor() as usize;
        let step = (steps[i].round_ties_even() as usize).max(1);
        grid[axis] = (start, step);
    }
    grid
}

fn seed_centres(features: &Array4<f64>, grid: &[GridAxis; 3]) -> Vec<Centre> {
    let (frames, height, width, channels) = features.dim();
    let axis = |(start, step): GridAxis, len: usize| (start.min(len - 1)..len).step_by(step);

    let mut centres = Vec::new();
    for t in axis(grid[0], frames) {
        for y in axis(grid[1], height) {
            for x in axis(grid[2], width) {
                centres.push(Centre {
                    position: [t as f64, y as f64, x as f64],
                    colour: (0..channels).map(|c| features[[t, y, x, c]]).collect(),
                });
            }
        }
    }
    centres
}

/// Moves each centre to the mean position and colour of its voxels. Centres
/// that claimed nothing stay where they were.
fn update_centres(centres: &mut [Centre], features: &Array4<f64>, nearest: &Array3<usize>) {
    let channels = features.dim().3;
    let mut counts = vec![0usize; centres.len()];
    let mut position_sums = vec![[0.0f64; 3]; centres.len()];
    let mut colour_sums = vec![vec![0.0f64; channels]; centres.len()];

    for ((t, y, x), &k) in nearest.indexed_iter() {
        counts[k] += 1;
        position_sums[k][0] += t as f64;
        position_sums[k][1] += y as f64;
        position_sums[k][2] += x as f64;
        for c in 0..channels {
            colour_sums[k][c] += features[[t, y, x, c]];
        }
    }

    for (k, centre) in centres.iter_mut().enumerate() {
        if counts[k] == 0 {
            continue;
        }
        let count = counts[k] as f64;
        for axis in 0..3 {
            centre.position[axis] = position_sums[k][axis] / count;
        }
        for c in 0..channels {
            centre.colour[c] = colour_sums[k][c] / count;
        }
    }
}

/// Relabels 6-connected components in scan order.
///
/// A component smaller than `min_size` takes the label of an already-labeled
/// neighbour of its first voxel. A single component never grows past
/// `max_size`; the remainder becomes its own component.
fn enforce_connectivity(segments: &Array3<usize>, min_size: usize, max_size: usize) -> Array3<usize> {
    let (frames, height, width) = segments.dim();
    let mut connected: Array3<Option<usize>> = Array3::from_elem((frames, height, width), None);
    let mut component: Vec<(usize, usize, usize)> = Vec::with_capacity(max_size);
    let mut next_label = 0usize;

    let neighbour = |(t, y, x): (usize, usize, usize), (dt, dy, dx): (isize, isize, isize)| {
        let nt = t.checked_add_signed(dt)?;
        let ny = y.checked_add_signed(dy)?;
        let nx = x.checked_add_signed(dx)?;
        (nt < frames && ny < height && nx < width).then_some((nt, ny, nx))
    };

    for t in 0..frames {
        for y in 0..height {
            for x in 0..width {
                if connected[[t, y, x]].is_some() {
                    continue;
                }
                let seed = (t, y, x);
                let label = segments[[t, y, x]];

                let adjacent = NEIGHBOURS
                    .iter()
                    .filter_map(|&offset| neighbour(seed, offset))
                    .filter_map(|(nt, ny, nx)| connected[[nt, ny, nx]])
                    .last()
                    .unwrap_or(0);

                connected[[t, y, x]] = Some(next_label);
                component.clear();
                component.push(seed);

                let mut visited = 0;
                'grow: while visited < component.len() && component.len() < max_size {
                    let current = component[visited];
                    for &offset in &NEIGHBOURS {
                        if let Some((nt, ny, nx)) = neighbour(current, offset) {
                            if connected[[nt, ny, nx]].is_none() && segments[[nt, ny, nx]] == label {
                                connected[[nt, ny, nx]] = Some(next_label);
                                component.push((nt, ny, nx));
                                if component.len() >= max_size {
                                    break 'grow;
                                }
                            }
                        }
                    }
                    visited += 1;
                }

                if component.len() < min_size {
                    for &(ct, cy, cx) in &component {
                        connected[[ct, cy, cx]] = Some(adjacent);
                    }
                } else {
                    next_label += 1;
                }
            }
        }
    }

    connected.mapv(|label| label.unwrap_or(0))
}
