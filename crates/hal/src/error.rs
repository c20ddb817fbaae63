//! HAL-specific error types.

use thiserror::Error;

/// HAL-specific error type.
#[derive(Error, Debug)]
pub enum HalError {
    /// Failed to create a synchronization primitive.
    ///
    /// Fatal: without a wait primitive no submitted work can ever be
    /// safely reclaimed.
    #[error("failed to create synchronization primitive: {0}")]
    SyncInit(String),

    /// A blocking wait reported failure distinct from success.
    ///
    /// Fatal: resource state after a failed wait cannot be trusted.
    #[error("synchronization wait failed: {0}")]
    SyncTimeout(String),

    /// No suitable adapter found
    #[error("no suitable adapter found")]
    NoAdapter,

    /// Invalid handle error
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Backend API error
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type alias for HAL operations.
pub type HalResult<T> = std::result::Result<T, HalError>;
