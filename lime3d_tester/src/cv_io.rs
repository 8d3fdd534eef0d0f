// Container formats the `image` crate cannot decode (mp4, avi, ...) go through
// OpenCV. Frames cross the boundary as RGB; OpenCV itself works in BGR.

use anyhow::{Context, Result, bail};
use image::RgbImage;
use lime3d::VideoVolume;
use opencv::{
    core::{self, Mat, Scalar},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};
use std::path::Path;

pub fn read_video(path: &Path) -> Result<VideoVolume> {
    let path_str = path.to_str().context("video path is not valid UTF-8")?;
    let mut cap = VideoCapture::from_file(path_str, videoio::CAP_ANY)?;
    if !cap.is_opened()? {
        bail!("cannot open video {}", path.display());
    }

    let mut frames = Vec::new();
    let mut frame = Mat::default();
    while cap.read(&mut frame)? {
        if frame.empty() {
            break;
        }
        let mut rgb_frame = Mat::default();
        imgproc::cvt_color(&frame, &mut rgb_frame, imgproc::COLOR_BGR2RGB, 0)?;
        let (width, height) = (rgb_frame.cols() as u32, rgb_frame.rows() as u32);
        let buffer = rgb_frame.data_bytes()?.to_vec();
        frames.push(
            RgbImage::from_raw(width, height, buffer)
                .with_context(|| format!("frame {} has an unexpected layout", frames.len()))?,
        );
    }
    Ok(VideoVolume::from_rgb_frames(&frames)?)
}

/// Writes an XVID-encoded video at `fps`.
pub fn write_video(path: &Path, frames: &[RgbImage], fps: f64) -> Result<()> {
    let first = frames.first().context("no frames to write")?;
    let (width, height) = first.dimensions();
    let path_str = path.to_str().context("video path is not valid UTF-8")?;

    let fourcc = VideoWriter::fourcc('X', 'V', 'I', 'D')?;
    let mut writer = VideoWriter::new(
        path_str,
        fourcc,
        fps,
        core::Size::new(width as i32, height as i32),
        true,
    )?;

    for frame in frames {
        let mut bgr_frame = Mat::new_rows_cols_with_default(
            height as i32,
            width as i32,
            core::CV_8UC3,
            Scalar::all(0.0),
        )?;
        let bytes = bgr_frame.data_bytes_mut()?;
        for (dst, src) in bytes.chunks_exact_mut(3).zip(frame.pixels()) {
            dst[0] = src.0[2];
            dst[1] = src.0[1];
            dst[2] = src.0[0];
        }
        writer.write(&bgr_frame)?;
    }
    writer.release()?;
    Ok(())
}
