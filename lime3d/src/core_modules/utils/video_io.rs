// THEORY:
// Thin bridge between files on disk and `VideoVolume`s. The core pipeline
// never touches the filesystem; callers that want to explain a file go through
// here. Everything runs on the `image` crate so no system codec is needed:
//
//   • animated GIF in, animated GIF out (looping, fixed frame delay)
//   • a directory of still images in (sorted by file name), PNGs out
//
// Decoded frames are always RGB. Alpha is dropped on the way in.

pub mod video_io {
    use crate::core_modules::video_volume::VideoVolume;
    use crate::error::{LimeError, Result};
    use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
    use image::{AnimationDecoder, Delay, DynamicImage, Frame, RgbImage};
    use std::fs::File;
    use std::io::BufReader;
    use std::path::{Path, PathBuf};
    use tracing::debug;

    /// Frame rate of rendered explanation videos.
    pub const DEFAULT_FPS: u32 = 10;

    const FRAME_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

    /// Loads a GIF file or a directory of frames.
    pub fn load_video(path: &Path) -> Result<VideoVolume> {
        if path.is_dir() {
            load_frame_directory(path)
        } else {
            load_gif(path)
        }
    }

    pub fn load_gif(path: &Path) -> Result<VideoVolume> {
        let decoder = GifDecoder::new(BufReader::new(File::open(path)?))?;
        let frames = decoder
            .into_frames()
            .collect_frames()?
            .into_iter()
            .map(|frame| DynamicImage::ImageRgba8(frame.into_buffer()).to_rgb8())
            .collect::<Vec<_>>();
        debug!(path = %path.display(), frames = frames.len(), "decoded gif");
        VideoVolume::from_rgb_frames(&frames)
    }

    /// Reads every image in `dir`, ordered by file name, as one frame each.
    pub fn load_frame_directory(dir: &Path) -> Result<VideoVolume> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| is_frame_file(path))
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(LimeError::validation(format!(
                "no image frames found in {}",
                dir.display()
            )));
        }

        let frames = paths
            .iter()
            .map(|path| -> Result<RgbImage> { Ok(image::open(path)?.to_rgb8()) })
            .collect::<Result<Vec<RgbImage>>>()?;
        debug!(dir = %dir.display(), frames = frames.len(), "loaded frame directory");
        VideoVolume::from_rgb_frames(&frames)
    }

    fn is_frame_file(path: &Path) -> bool {
        path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    }

    /// Writes `frames` as a looping animated GIF at `fps` frames per second.
    pub fn write_gif(path: &Path, frames: &[RgbImage], fps: u32) -> Result<()> {
        if fps == 0 {
            return Err(LimeError::validation("fps must be at least 1"));
        }
        let mut encoder = GifEncoder::new(File::create(path)?);
        encoder.set_repeat(Repeat::Infinite)?;
        let delay = Delay::from_numer_denom_ms(1000, fps);
        encoder.encode_frames(frames.iter().map(|frame| {
            Frame::from_parts(DynamicImage::ImageRgb8(frame.clone()).to_rgba8(), 0, 0, delay)
        }))?;
        Ok(())
    }

    /// Writes `frames` as `frame_00000.png`, `frame_00001.png`, ... under `dir`.
    pub fn write_frames(dir: &Path, frames: &[RgbImage]) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        frames
            .iter()
            .enumerate()
            .map(|(index, frame)| -> Result<PathBuf> {
                let path = dir.join(format!("frame_{index:05}.png"));
                frame.save(&path)?;
                Ok(path)
            })
            .collect()
    }
}
