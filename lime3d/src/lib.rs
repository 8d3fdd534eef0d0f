// THEORY:
// This file is the main entry point for the `lime3d` library crate, a
// model-agnostic explainer for video classifiers. Given a video and any
// black-box scorer, it answers "which parts of which frames drove this
// prediction?" by blacking out spatio-temporal regions, watching how the
// score moves, and fitting a local linear surrogate to those observations.
//
// The public surface is the two orchestrators and their data structures:
//   • `pipeline::ExplainPipeline`: sequential, works with any scorer
//   • `parallel_pipeline::ParallelExplainPipeline`: async, scores on a worker pool
// plus `ExplainConfig`, `Explanation` and the `Scorer` trait. The stages
// themselves live in `core_modules` and can be driven one by one for
// experiments, but most callers never need to.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use core_modules::oracle::{OutputVector, Scorer};
pub use core_modules::video_volume::VideoVolume;
pub use error::{LimeError, Result};
pub use parallel_pipeline::ParallelExplainPipeline;
pub use pipeline::{ExplainConfig, ExplainPipeline, Explanation, RenderMode};
