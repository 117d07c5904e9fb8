//! Client-level error types.

use crate::transport::SubmitError;

/// Errors surfaced by the telemetry client.
///
/// Only two paths hand an error back to the host: [`crate::Client::new`]
/// (configuration validation) and an explicitly awaited
/// [`crate::Client::flush`]. Everything else (admission failures, spool
/// write failures, ticker flush failures) is swallowed internally so the
/// host request path is never affected.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Submit(#[from] SubmitError),
}

impl ClientError {
    /// Whether a retry of the same batch is worthwhile.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Submit(err) => err.retryable(),
            Self::Config(_) | Self::Runtime(_) => false,
        }
    }
}
