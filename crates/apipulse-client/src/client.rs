//! Client lifecycle: construction, the background flush ticker, signal
//! handling, and the two shutdown variants.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::buffer::EventBuffer;
use crate::config::{self, Options};
use crate::error::ClientError;
use crate::event::{self, RequestEvent};
use crate::flusher::{FlushEngine, Shared};
use crate::spool::Spool;
use crate::transport::Submitter;

/// Snapshot of the client's internal state, for diagnostics and tests.
#[derive(Debug, Clone, Copy)]
pub struct ClientStats {
    /// Events currently buffered in memory.
    pub buffered_events: usize,
    /// Retryable failures since the last success or spill.
    pub consecutive_failures: u32,
    /// Whether a backoff deadline is currently armed in the future.
    pub in_backoff: bool,
    /// Whether startup recovery loaded events that are not yet acknowledged.
    pub recovery_pending: bool,
}

/// The telemetry client. Cheap to clone; all clones share one buffer,
/// transport, and background tasks.
///
/// Construction validates the configuration eagerly, recovers any events a
/// previous process spooled to disk, and starts the periodic flush ticker
/// plus the SIGTERM/SIGINT listener. Must be created inside a tokio
/// runtime.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    engine: Arc<FlushEngine>,
    batch_size: usize,
    max_event_bytes: usize,
    debug_enabled: bool,
    shutdown_token: CancellationToken,
    in_flight_rx: watch::Receiver<bool>,
    shut_down: AtomicBool,
}

impl Client {
    /// Validates the configuration and starts the client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] for an unparsable or insecure
    /// endpoint, an invalid API key, or unusable TLS material, and
    /// [`ClientError::Runtime`] when called outside a tokio runtime.
    pub fn new(options: Options) -> Result<Self, ClientError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            ClientError::Runtime("the client must be created inside a tokio runtime".to_string())
        })?;

        let endpoint = config::validate_endpoint(&options.endpoint, options.debug)?;
        config::validate_api_key(&options.api_key)?;

        let submitter = Submitter::new(
            endpoint.url.clone(),
            options.api_key.clone(),
            endpoint.localhost,
            options.tls.as_ref(),
        )?;

        let spool_path = options
            .storage_path
            .clone()
            .unwrap_or_else(|| Spool::default_path(endpoint.url.as_str()));
        let spool = Spool::new(spool_path, options.max_storage_bytes, options.debug);

        let mut buffer = EventBuffer::new(options.max_buffer_size);
        let recovery_path = spool.recover(&mut buffer);

        let (in_flight_tx, in_flight_rx) = watch::channel(false);
        let engine = Arc::new(FlushEngine::new(
            Shared {
                buffer,
                consecutive_failures: 0,
                backoff_until: None,
                flush_in_flight: false,
                recovery_path,
            },
            in_flight_tx,
            submitter,
            spool,
            options.batch_size,
            options.on_error.clone(),
            options.debug,
        ));

        let inner = Arc::new(ClientInner {
            engine,
            batch_size: options.batch_size,
            max_event_bytes: options.max_event_bytes,
            debug_enabled: options.debug,
            shutdown_token: CancellationToken::new(),
            in_flight_rx,
            shut_down: AtomicBool::new(false),
        });

        inner.spawn_ticker(&handle, options.flush_interval);
        #[cfg(unix)]
        ClientInner::spawn_signal_listener(&inner, &handle);

        Ok(Client { inner })
    }

    /// Records one request observation. Non-blocking and infallible: the
    /// event is normalized, size-checked, and buffered; crossing the batch
    /// threshold schedules a flush on a background task. After shutdown, or
    /// when the buffer is full, the event is dropped.
    pub fn track(&self, event: RequestEvent) {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let Some(event) = event::admit(event, self.inner.max_event_bytes, self.inner.debug_enabled)
        else {
            return;
        };

        let (appended, should_flush) = {
            let mut shared = self.inner.engine.lock();
            let appended = shared.buffer.append(event);
            (appended, appended && shared.buffer.len() >= self.inner.batch_size)
        };

        if !appended {
            if self.inner.debug_enabled {
                debug!("buffer full, event dropped");
            }
            return;
        }

        if should_flush {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let engine = Arc::clone(&self.inner.engine);
                handle.spawn(async move {
                    let _ = engine.flush().await;
                });
            }
        }
    }

    /// Flushes one batch now. Idempotent: returns immediately when the
    /// buffer is empty, a flush is already in flight, or a backoff is
    /// active.
    ///
    /// # Errors
    ///
    /// Returns the submission error when the batch could not be delivered;
    /// the events have already been re-queued or spooled by then.
    pub async fn flush(&self) -> Result<(), ClientError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.engine.flush().await
    }

    /// Orderly shutdown: stops the ticker and signal listener, waits for an
    /// in-flight flush, sends one final batch, spills whatever is left to
    /// disk, and closes the transport. Idempotent; later [`Client::track`]
    /// calls drop their events.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown_token.cancel();

        // wait for any in-flight flush; racing it would spill a half-drained
        // buffer while the flush still owns part of it
        let mut in_flight = self.inner.in_flight_rx.clone();
        while *in_flight.borrow_and_update() {
            if in_flight.changed().await.is_err() {
                break;
            }
        }

        let _ = self.inner.engine.flush().await;

        let leftovers = {
            let mut shared = self.inner.engine.lock();
            shared.buffer.splice_all()
        };
        if !leftovers.is_empty() {
            self.inner.engine.spool.write_sync(&leftovers);
        }

        self.inner.engine.submitter.close();
        if self.inner.debug_enabled {
            debug!("client shut down");
        }
    }

    /// Point-in-time view of the internal counters.
    pub fn stats(&self) -> ClientStats {
        let shared = self.inner.engine.lock();
        ClientStats {
            buffered_events: shared.buffer.len(),
            consecutive_failures: shared.consecutive_failures,
            in_backoff: shared
                .backoff_until
                .is_some_and(|until| until > std::time::Instant::now()),
            recovery_pending: shared.recovery_path.is_some(),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    /// Periodic flusher. Cancelling the token tears it down; flush errors
    /// are suppressed so a dead endpoint never surfaces through the timer.
    fn spawn_ticker(&self, handle: &tokio::runtime::Handle, period: Duration) {
        let engine = Arc::clone(&self.engine);
        let token = self.shutdown_token.clone();
        handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick of a tokio interval fires immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let _ = engine.flush().await;
                    }
                    () = token.cancelled() => break,
                }
            }
        });
    }

    /// SIGTERM/SIGINT listener. On a signal the buffer is spilled to disk
    /// synchronously and the transport closed; no HTTP flush is attempted
    /// (the process may be torn down before async work completes) and the
    /// process is never exited here; that stays the host's decision.
    /// Orderly shutdown cancels the token, which drops the signal streams
    /// and releases the handler registrations.
    #[cfg(unix)]
    fn spawn_signal_listener(inner: &Arc<ClientInner>, handle: &tokio::runtime::Handle) {
        use tokio::signal::unix::{signal, SignalKind};

        let inner = Arc::clone(inner);
        let token = inner.shutdown_token.clone();
        handle.spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(error = %err, "failed to register SIGTERM handler");
                    return;
                }
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(error = %err, "failed to register SIGINT handler");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => inner.shutdown_sync("SIGTERM"),
                _ = sigint.recv() => inner.shutdown_sync("SIGINT"),
                () = token.cancelled() => {}
            }
        });
    }

    /// Signal-path shutdown: everything synchronous, nothing awaited.
    #[cfg(unix)]
    fn shutdown_sync(&self, signal_name: &str) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_token.cancel();

        let leftovers = {
            let mut shared = self.engine.lock();
            shared.buffer.splice_all()
        };
        let spilled = leftovers.len();
        if !leftovers.is_empty() {
            self.engine.spool.write_sync(&leftovers);
        }
        self.engine.submitter.close();
        debug!(signal = signal_name, events = spilled, "spilled buffer on signal");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn construction_rejects_bad_config() {
        let mut options = Options::new("key");
        options.endpoint = "http://example.com/ingest".to_string();
        assert!(matches!(
            Client::new(options),
            Err(ClientError::Config(_))
        ));

        let mut options = Options::new("bad\nkey");
        options.endpoint = "http://localhost:9/ingest".to_string();
        assert!(matches!(
            Client::new(options),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn construction_requires_a_runtime() {
        let options = Options::new("key");
        assert!(matches!(
            Client::new(options),
            Err(ClientError::Runtime(_))
        ));
    }

    #[tokio::test]
    async fn track_after_shutdown_drops_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = Options::new("key");
        options.endpoint = "http://localhost:9/ingest".to_string();
        options.storage_path = Some(dir.path().join("events.spool"));
        let client = Client::new(options).expect("client");

        client.shutdown().await;
        client.track(RequestEvent::new("GET", "/late", 200));
        assert_eq!(client.stats().buffered_events, 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = Options::new("key");
        options.endpoint = "http://localhost:9/ingest".to_string();
        options.storage_path = Some(dir.path().join("events.spool"));
        let client = Client::new(options).expect("client");

        client.shutdown().await;
        client.shutdown().await;
    }
}
