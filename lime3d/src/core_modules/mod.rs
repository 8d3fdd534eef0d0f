// Leaf-first: each module only depends on the ones listed above it.
pub mod pixel;
pub mod video_volume;
pub mod segmenter;
pub mod mask_sampler;
pub mod oracle;
pub mod dataset;
pub mod surrogate;
pub mod visualizer;
pub mod utils;
