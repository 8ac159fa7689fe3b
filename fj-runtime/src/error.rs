//! Error types for the FlipJump runtime.

use thiserror::Error;

use fj_spec::ImageError;

/// Runtime error taxonomy. A run that ends with one of these leaves the
/// VM inspectable: memory, ip and statistics stay readable.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The configured step limit was reached before the program halted.
    #[error("run exceeded the step limit of {limit} steps")]
    RunTimeExceeded { limit: u64 },

    /// The external cancellation flag was raised.
    #[error("run cancelled after {steps} steps")]
    Cancelled { steps: u64 },

    /// The image could not be loaded (corrupt, wrong version or a width
    /// other than the VM was configured for).
    #[error("image error: {0}")]
    Image(#[from] ImageError),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
