//! Pipeline-specific error types.

use framepipe_hal::HalError;
use thiserror::Error;

/// Pipeline-specific error type.
///
/// Usage errors (`BatchNotRecording`, `BatchBusy`, `AllocationTooLarge`)
/// are returned to the immediate caller and must not be retried blindly;
/// fatal synchronization failures arrive as [`HalError`] values and
/// terminate the render loop.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Device-boundary error, including fatal synchronization failures.
    #[error(transparent)]
    Hal(#[from] HalError),

    /// `enqueue` or `commit` called on a batch that has no open recording.
    #[error("upload batch is not recording")]
    BatchNotRecording,

    /// The batch has submitted work the device has not finished yet.
    #[error("upload batch has unresolved submitted work")]
    BatchBusy,

    /// A transient allocation request exceeded the configured block size.
    #[error("allocation of {requested} bytes exceeds the block size of {block_size} bytes")]
    AllocationTooLarge { requested: u64, block_size: u64 },

    /// Invalid pipeline configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
