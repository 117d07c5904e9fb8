//! HTTPS submitter: one POST per batch against the ingest endpoint.
//!
//! The pooled client is built once at construction and shared across
//! flushes; a small socket cap keeps a couple of keep-alive connections warm
//! without hogging the host's descriptor budget. Each request carries a
//! whole-request deadline that covers name resolution, connect, TLS, upload,
//! and the response, so a trickling server cannot stretch a flush beyond it.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use url::Url;

use crate::config::TlsOptions;
use crate::error::ClientError;
use crate::event::RequestEvent;
use crate::resolver::GuardedResolver;

/// Total per-request deadline: DNS + TCP + TLS + upload + response.
const REQUEST_DEADLINE: Duration = Duration::from_secs(5);
/// Upper bound on how much of an error response body is read back.
const MAX_ERROR_BODY_BYTES: usize = 1024;
/// Keep-alive connections shared across flushes.
const MAX_IDLE_CONNECTIONS: usize = 2;

/// Outcome of a failed batch submission.
///
/// Carries the two facts the flush engine classifies on: whether the same
/// batch is worth retrying, and the HTTP status (0 for transport-level
/// failures that never produced a response).
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Connect, TLS, timeout, or read failure. Always retryable.
    #[error("request to ingest endpoint failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The endpoint answered with a non-2xx status.
    #[error("{message}")]
    Status { status: u16, message: String },

    /// The batch could not be encoded. Not retryable; re-encoding the same
    /// data would fail again.
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    /// The transport was closed by shutdown.
    #[error("transport is closed")]
    Closed,
}

impl SubmitError {
    /// Retryable statuses are rate limiting and transient server errors;
    /// transport failures are always retryable.
    pub fn retryable(&self) -> bool {
        match self {
            SubmitError::Transport(_) => true,
            SubmitError::Status { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504)
            }
            SubmitError::Encode(_) | SubmitError::Closed => false,
        }
    }

    /// The HTTP status code, or 0 when no response was received.
    pub fn status_code(&self) -> u16 {
        match self {
            SubmitError::Status { status, .. } => *status,
            _ => 0,
        }
    }
}

pub(crate) struct Submitter {
    endpoint: Url,
    api_key: String,
    client: Mutex<Option<reqwest::Client>>,
}

impl Submitter {
    /// Builds the pooled client. The resolving dialer is installed unless
    /// the endpoint is the localhost development exception.
    pub(crate) fn new(
        endpoint: Url,
        api_key: String,
        localhost: bool,
        tls: Option<&TlsOptions>,
    ) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .tcp_keepalive(Some(Duration::from_secs(60)));

        if !localhost {
            builder = builder.dns_resolver(Arc::new(GuardedResolver::new()));
        }

        if let Some(tls) = tls {
            if let Some(pem) = &tls.ca_certificate_pem {
                let cert = reqwest::Certificate::from_pem(pem).map_err(|err| {
                    ClientError::Config(format!("invalid CA certificate: {err}"))
                })?;
                builder = builder.add_root_certificate(cert);
            }
            if let Some(pem) = &tls.identity_pem {
                let identity = reqwest::Identity::from_pem(pem).map_err(|err| {
                    ClientError::Config(format!("invalid client identity: {err}"))
                })?;
                builder = builder.identity(identity);
            }
            if !tls.reject_unauthorized {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        let client = builder
            .build()
            .map_err(|err| ClientError::Config(format!("failed to build HTTP transport: {err}")))?;

        Ok(Submitter {
            endpoint,
            api_key,
            client: Mutex::new(Some(client)),
        })
    }

    /// Sends one batch. On 2xx the response body is discarded; on anything
    /// else a bounded slice of the body is folded into the error.
    pub(crate) async fn submit(&self, events: &[RequestEvent]) -> Result<(), SubmitError> {
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SubmitError::Closed)?;

        let body = serde_json::to_vec(events)?;

        let response = client
            .post(self.endpoint.clone())
            .timeout(REQUEST_DEADLINE)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, body.len())
            .header("x-api-key", &self.api_key)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = read_bounded_body(response).await;

        let message = match retry_after {
            Some(retry_after) => format!(
                "ingest endpoint returned {} (retry-after: {retry_after}): {body}",
                status.as_u16()
            ),
            None => format!("ingest endpoint returned {}: {body}", status.as_u16()),
        };
        Err(SubmitError::Status {
            status: status.as_u16(),
            message,
        })
    }

    /// Drops the pooled client, closing its keep-alive connections. Further
    /// submissions fail with [`SubmitError::Closed`].
    pub(crate) fn close(&self) {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl std::fmt::Debug for Submitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter")
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

/// Reads at most [`MAX_ERROR_BODY_BYTES`] of a response body. A failed read
/// yields an empty body rather than a second error.
async fn read_bounded_body(mut response: reqwest::Response) -> String {
    let mut collected: Vec<u8> = Vec::new();
    while collected.len() < MAX_ERROR_BODY_BYTES {
        match response.chunk().await {
            Ok(Some(chunk)) => collected.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(_) => {
                collected.clear();
                break;
            }
        }
    }
    collected.truncate(MAX_ERROR_BODY_BYTES);
    String::from_utf8_lossy(&collected).into_owned()
}
