//! The flush engine: moves batches from the buffer to the transport and
//! decides what happens when that fails.
//!
//! One flush is in flight at any instant. Retryable failures re-queue the
//! batch at the buffer front and arm an exponential backoff; five retryable
//! failures in a row spill the batch to disk and reset the counter so the
//! buffer cannot pin a dead batch forever. Non-retryable failures (the
//! endpoint rejected the payload) go straight to disk without touching the
//! backoff state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::buffer::EventBuffer;
use crate::config::ErrorCallback;
use crate::error::ClientError;
use crate::spool::Spool;
use crate::transport::Submitter;

/// Retryable failures tolerated before the batch is spilled to disk.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// First backoff step; doubles per consecutive failure.
const BACKOFF_BASE_MS: u64 = 1000;
/// Cap on the doubling exponent so the delay arithmetic cannot overflow.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Mutable client state. One mutex, never held across an await.
#[derive(Debug)]
pub(crate) struct Shared {
    pub buffer: EventBuffer,
    pub consecutive_failures: u32,
    pub backoff_until: Option<Instant>,
    pub flush_in_flight: bool,
    pub recovery_path: Option<PathBuf>,
}

pub(crate) struct FlushEngine {
    shared: Mutex<Shared>,
    /// Mirrors `flush_in_flight` so shutdown can await the current flush.
    in_flight_tx: watch::Sender<bool>,
    pub(crate) submitter: Submitter,
    pub(crate) spool: Spool,
    batch_size: usize,
    on_error: Option<ErrorCallback>,
    debug_enabled: bool,
}

impl FlushEngine {
    pub(crate) fn new(
        shared: Shared,
        in_flight_tx: watch::Sender<bool>,
        submitter: Submitter,
        spool: Spool,
        batch_size: usize,
        on_error: Option<ErrorCallback>,
        debug_enabled: bool,
    ) -> Self {
        FlushEngine {
            shared: Mutex::new(shared),
            in_flight_tx,
            submitter,
            spool,
            batch_size,
            on_error,
            debug_enabled,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attempts one flush. Returns `Ok(())` without doing anything when the
    /// buffer is empty, another flush is in flight, or a backoff is active.
    pub(crate) async fn flush(&self) -> Result<(), ClientError> {
        let batch = {
            let mut shared = self.lock();
            if shared.buffer.is_empty() || shared.flush_in_flight {
                return Ok(());
            }
            if shared.consecutive_failures > 0 {
                if let Some(until) = shared.backoff_until {
                    if Instant::now() < until {
                        if self.debug_enabled {
                            debug!("flush skipped, backoff active");
                        }
                        return Ok(());
                    }
                }
            }
            shared.flush_in_flight = true;
            let _ = self.in_flight_tx.send(true);
            shared.buffer.drain_front(self.batch_size)
        };

        self.do_flush(batch).await
    }

    async fn do_flush(&self, batch: Vec<crate::event::RequestEvent>) -> Result<(), ClientError> {
        let count = batch.len();
        let result = self.submitter.submit(&batch).await;

        match result {
            Ok(()) => {
                let recovery = {
                    let mut shared = self.lock();
                    shared.consecutive_failures = 0;
                    shared.backoff_until = None;
                    shared.recovery_path.take()
                };
                if let Some(path) = recovery {
                    Spool::cleanup_recovery(&path);
                    if self.debug_enabled {
                        debug!(path = %path.display(), "recovery file acknowledged and removed");
                    }
                }
                if self.debug_enabled {
                    debug!(events = count, "batch delivered");
                }
                self.finish_flight();
                Ok(())
            }
            Err(submit_err) => {
                let err = ClientError::Submit(submit_err);
                error!("failed to deliver telemetry batch: {err}");
                self.emit_error(&err);

                if err.retryable() {
                    let spill = {
                        let mut shared = self.lock();
                        shared.consecutive_failures += 1;
                        let failures = shared.consecutive_failures;
                        shared.backoff_until = Some(Instant::now() + backoff_delay(failures));
                        if failures >= MAX_CONSECUTIVE_FAILURES {
                            shared.consecutive_failures = 0;
                            Some(batch)
                        } else {
                            let dropped = shared.buffer.prepend_front(batch);
                            if dropped > 0 && self.debug_enabled {
                                debug!(dropped, "buffer full, oldest retried events dropped");
                            }
                            None
                        }
                    };
                    if let Some(batch) = spill {
                        self.spool.write(&batch).await;
                    }
                } else {
                    // terminal rejection: persist and move on, no backoff
                    self.spool.write(&batch).await;
                }

                self.finish_flight();
                Err(err)
            }
        }
    }

    fn finish_flight(&self) {
        let mut shared = self.lock();
        shared.flush_in_flight = false;
        let _ = self.in_flight_tx.send(false);
    }

    fn emit_error(&self, err: &ClientError) {
        if let Some(callback) = &self.on_error {
            let callback = Arc::clone(callback);
            if catch_unwind(AssertUnwindSafe(|| callback(err))).is_err() {
                debug!("on_error callback panicked, ignoring");
            }
        }
    }
}

impl std::fmt::Debug for FlushEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushEngine")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

/// `base * 2^(n-1)` scaled by a uniform factor in `[0.5, 1.0)`. The jitter
/// keeps a fleet of clients that failed together from retrying together.
fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    let base = BACKOFF_BASE_MS.saturating_mul(1 << exponent);
    let factor = rand::thread_rng().gen_range(0.5..1.0);
    Duration::from_millis((base as f64 * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RequestEvent;
    use mockito::{Server, ServerGuard};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use url::Url;

    fn event(path: &str) -> RequestEvent {
        RequestEvent::new("GET", path, 200)
    }

    struct Harness {
        engine: Arc<FlushEngine>,
        _dir: TempDir,
        spool_path: PathBuf,
    }

    fn engine_for(server: &ServerGuard, batch_size: usize) -> Harness {
        engine_with_callback(server, batch_size, None)
    }

    fn engine_with_callback(
        server: &ServerGuard,
        batch_size: usize,
        on_error: Option<ErrorCallback>,
    ) -> Harness {
        let dir = TempDir::new().expect("tempdir");
        let spool_path = dir.path().join("events.spool");
        let url = Url::parse(&server.url()).expect("server url");
        let submitter = Submitter::new(url, "test-key".to_string(), true, None).expect("submitter");
        let (in_flight_tx, _) = watch::channel(false);
        let engine = FlushEngine::new(
            Shared {
                buffer: EventBuffer::new(10_000),
                consecutive_failures: 0,
                backoff_until: None,
                flush_in_flight: false,
                recovery_path: None,
            },
            in_flight_tx,
            submitter,
            Spool::new(spool_path.clone(), 5 * 1024 * 1024, false),
            batch_size,
            on_error,
            false,
        );
        Harness {
            engine: Arc::new(engine),
            _dir: dir,
            spool_path,
        }
    }

    fn track(engine: &FlushEngine, event: RequestEvent) {
        engine.lock().buffer.append(event);
    }

    fn clear_backoff(engine: &FlushEngine) {
        engine.lock().backoff_until = None;
    }

    #[tokio::test]
    async fn success_resets_failure_state() {
        let mut server = Server::new_async().await;
        let mock = server.mock("POST", "/").with_status(202).create_async().await;

        let harness = engine_for(&server, 100);
        harness.engine.lock().consecutive_failures = 3;
        track(&harness.engine, event("/a"));

        harness.engine.flush().await.expect("flush should succeed");

        let shared = harness.engine.lock();
        assert_eq!(shared.consecutive_failures, 0);
        assert!(shared.backoff_until.is_none());
        assert!(shared.buffer.is_empty());
        drop(shared);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn empty_buffer_flush_is_a_noop() {
        let server = Server::new_async().await;
        let harness = engine_for(&server, 100);
        harness.engine.flush().await.expect("no-op flush");
    }

    #[tokio::test]
    async fn retryable_failure_requeues_and_arms_backoff() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(500)
            .with_body("boom")
            .expect(1)
            .create_async()
            .await;

        let harness = engine_for(&server, 100);
        track(&harness.engine, event("/a"));

        let err = harness.engine.flush().await.expect_err("500 should fail");
        assert!(err.retryable());

        {
            let shared = harness.engine.lock();
            assert_eq!(shared.consecutive_failures, 1);
            assert_eq!(shared.buffer.len(), 1, "event must be back in the buffer");
            let until = shared.backoff_until.expect("backoff must be armed");
            assert!(until > Instant::now());
        }

        // second flush is a no-op while the backoff is active
        harness.engine.flush().await.expect("skipped flush is Ok");
        mock.assert_async().await;
        assert!(!harness.spool_path.exists());
    }

    #[tokio::test]
    async fn fifth_retryable_failure_spills_to_disk() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(500)
            .expect(5)
            .create_async()
            .await;

        let harness = engine_for(&server, 100);
        track(&harness.engine, event("/a"));

        for _ in 0..5 {
            clear_backoff(&harness.engine);
            let _ = harness.engine.flush().await;
        }
        mock.assert_async().await;

        let shared = harness.engine.lock();
        assert_eq!(shared.consecutive_failures, 0, "counter resets after spill");
        assert!(shared.buffer.is_empty());
        drop(shared);

        let contents = std::fs::read_to_string(&harness.spool_path).expect("spool file");
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 1, "exactly one spilled batch");
        let batch: Vec<RequestEvent> = serde_json::from_str(lines[0]).expect("parse batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].path, "/a");
    }

    #[tokio::test]
    async fn non_retryable_failure_spills_without_backoff() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(400)
            .with_body(r#"{"error":"bad"}"#)
            .expect(1)
            .create_async()
            .await;

        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen_by_callback = Arc::clone(&seen);
        let callback: ErrorCallback = Arc::new(move |err| {
            seen_by_callback
                .lock()
                .expect("callback lock")
                .push(err.to_string());
        });

        let harness = engine_with_callback(&server, 100, Some(callback));
        track(&harness.engine, event("/a"));

        let err = harness.engine.flush().await.expect_err("400 should fail");
        assert!(!err.retryable());
        mock.assert_async().await;

        {
            let shared = harness.engine.lock();
            assert!(shared.buffer.is_empty());
            assert_eq!(shared.consecutive_failures, 0);
        }

        let contents = std::fs::read_to_string(&harness.spool_path).expect("spool file");
        let batch: Vec<RequestEvent> =
            serde_json::from_str(contents.trim_end()).expect("parse batch");
        assert_eq!(batch[0].path, "/a");

        let messages = seen.lock().expect("lock");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("400"));
        assert!(messages[0].contains("bad"));
    }

    #[tokio::test]
    async fn panicking_callback_is_swallowed() {
        let mut server = Server::new_async().await;
        let _mock = server.mock("POST", "/").with_status(500).create_async().await;

        let callback: ErrorCallback = Arc::new(|_| panic!("host bug"));
        let harness = engine_with_callback(&server, 100, Some(callback));
        track(&harness.engine, event("/a"));

        // must not propagate the panic
        let _ = harness.engine.flush().await;
        assert_eq!(harness.engine.lock().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn concurrent_flushes_collapse_to_one_submission() {
        let mut server = Server::new_async().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_mock = Arc::clone(&calls);
        let mock = server
            .mock("POST", "/")
            .with_status(202)
            .with_body_from_request(move |_| {
                calls_in_mock.fetch_add(1, Ordering::SeqCst);
                Vec::new()
            })
            .expect(1)
            .create_async()
            .await;

        let harness = engine_for(&server, 100);
        track(&harness.engine, event("/a"));

        let first = harness.engine.clone();
        let second = harness.engine.clone();
        let (a, b) = tokio::join!(first.flush(), second.flush());
        a.expect("first flush");
        b.expect("second flush is a no-op");

        mock.assert_async().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_cleans_up_the_recovery_file() {
        let mut server = Server::new_async().await;
        let _mock = server.mock("POST", "/").with_status(202).create_async().await;

        let harness = engine_for(&server, 100);
        let recovery = harness._dir.path().join("events.spool.recovering");
        std::fs::write(&recovery, "[]\n").expect("seed recovery file");
        harness.engine.lock().recovery_path = Some(recovery.clone());
        track(&harness.engine, event("/a"));

        harness.engine.flush().await.expect("flush");

        assert!(!recovery.exists(), "recovery file must be deleted");
        assert!(harness.engine.lock().recovery_path.is_none());
    }

    #[test]
    fn backoff_grows_exponentially_with_jitter() {
        // n-th delay lives in [base * 2^(n-1) / 2, base * 2^(n-1))
        for failures in 1..=5u32 {
            let delay = backoff_delay(failures).as_millis() as u64;
            let ceiling = BACKOFF_BASE_MS * (1 << (failures - 1));
            assert!(delay >= ceiling / 2, "{failures}: {delay} < {}", ceiling / 2);
            assert!(delay < ceiling, "{failures}: {delay} >= {ceiling}");
        }
    }

    #[test]
    fn backoff_jitter_varies_between_runs() {
        let delays: Vec<_> = (0..8).map(|_| backoff_delay(3)).collect();
        let all_equal = delays.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_equal, "jitter must not produce identical delays");
    }
}
