// THEORY:
// A `VideoVolume` is the stack of frames an explanation runs on, held as one
// 4D array indexed `(time, row, column, channel)`. Treating the clip as a
// single volume is what lets the segmenter grow regions across frames and lets
// the oracle black out a region in every frame it spans with one pass.
//
// It is a "dumb" container in the same spirit as a chunk of pixels: it
// validates its shape once on construction and is never mutated afterwards.
// Perturbation always produces a fresh copy.

use crate::error::{LimeError, Result};
use image::RgbImage;
use ndarray::{Array3, Array4, ArrayView3, Axis};

/// Number of channels accepted per sample: greyscale or RGB.
pub const SUPPORTED_CHANNELS: [usize; 2] = [1, 3];

#[derive(Debug, Clone, PartialEq)]
pub struct VideoVolume {
    data: Array4<u8>,
}

impl VideoVolume {
    /// Wraps a `(frames, height, width, channels)` array.
    pub fn new(data: Array4<u8>) -> Result<Self> {
        let (frames, height, width, channels) = data.dim();
        if frames == 0 {
            return Err(LimeError::validation("video has zero frames"));
        }
        if height == 0 || width == 0 {
            return Err(LimeError::validation(format!(
                "frames must be non-empty, got {width}x{height}"
            )));
        }
        if !SUPPORTED_CHANNELS.contains(&channels) {
            return Err(LimeError::validation(format!(
                "unsupported channel count {channels}, expected 1 or 3"
            )));
        }
        Ok(Self { data })
    }

    /// Stacks `(height, width, channels)` frames in order.
    pub fn from_frames(frames: &[Array3<u8>]) -> Result<Self> {
        let first = frames
            .first()
            .ok_or_else(|| LimeError::validation("video has zero frames"))?;
        let shape = first.dim();
        if let Some((index, frame)) = frames
            .iter()
            .enumerate()
            .find(|(_, frame)| frame.dim() != shape)
        {
            return Err(LimeError::validation(format!(
                "frame {index} has shape {:?}, expected {:?}",
                frame.dim(),
                shape
            )));
        }

        let views: Vec<ArrayView3<u8>> = frames.iter().map(|frame| frame.view()).collect();
        let data = ndarray::stack(Axis(0), &views)
            .map_err(|e| LimeError::validation(format!("cannot stack frames: {e}")))?;
        Self::new(data)
    }

    /// Builds an RGB volume from decoded image frames.
    pub fn from_rgb_frames(frames: &[RgbImage]) -> Result<Self> {
        let arrays = frames
            .iter()
            .enumerate()
            .map(|(index, frame)| {
                let (width, height) = frame.dimensions();
                Array3::from_shape_vec((height as usize, width as usize, 3), frame.as_raw().clone())
                    .map_err(|e| LimeError::validation(format!("frame {index}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_frames(&arrays)
    }

    pub fn frame_count(&self) -> usize {
        self.data.dim().0
    }

    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    pub fn channels(&self) -> usize {
        self.data.dim().3
    }

    /// `(frames, height, width)`, the shape shared with labelings and masks.
    pub fn volume_shape(&self) -> (usize, usize, usize) {
        let (frames, height, width, _) = self.data.dim();
        (frames, height, width)
    }

    pub fn data(&self) -> &Array4<u8> {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut Array4<u8> {
        &mut self.data
    }

    pub fn frame(&self, index: usize) -> ArrayView3<'_, u8> {
        self.data.index_axis(Axis(0), index)
    }

    /// Renders one frame as RGB, expanding greyscale samples to all three channels.
    pub fn frame_to_rgb(&self, index: usize) -> RgbImage {
        let frame = self.frame(index);
        let (height, width, channels) = frame.dim();
        RgbImage::from_fn(width as u32, height as u32, |x, y| {
            let (row, col) = (y as usize, x as usize);
            if channels == 1 {
                let level = frame[[row, col, 0]];
                image::Rgb([level, level, level])
            } else {
                image::Rgb([frame[[row, col, 0]], frame[[row, col, 1]], frame[[row, col, 2]]])
            }
        })
    }
}
