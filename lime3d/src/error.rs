//! Error types shared by every stage of an explanation.

use thiserror::Error;

/// Errors raised while building an explanation.
///
/// A degenerate surrogate fit is not an error: the fitter recovers locally
/// and flags the result instead.
#[derive(Debug, Error)]
pub enum LimeError {
    /// Malformed video, inconsistent frame shapes or out-of-range configuration.
    #[error("validation error: {0}")]
    Validation(String),

    /// The caller's scoring capability failed, timed out or returned a malformed output.
    #[error("scoring failed for {}: {reason}", sample_label(.sample))]
    Scoring {
        /// Index of the perturbation being scored, `None` for the unperturbed baseline.
        sample: Option<usize>,
        reason: String,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// A blocking stage panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl LimeError {
    pub fn validation(message: impl Into<String>) -> Self {
        LimeError::Validation(message.into())
    }

    pub fn scoring(sample: Option<usize>, reason: impl Into<String>) -> Self {
        LimeError::Scoring {
            sample,
            reason: reason.into(),
        }
    }
}

fn sample_label(sample: &Option<usize>) -> String {
    match sample {
        Some(index) => format!("perturbation #{index}"),
        None => "the unperturbed baseline".to_string(),
    }
}

/// Result type for explanation operations.
pub type Result<T> = std::result::Result<T, LimeError>;
