//! # apipulse-client
//!
//! In-process telemetry client for the apipulse API analytics platform.
//! Framework adapters hand the client one [`RequestEvent`] per served
//! request; the client buffers them in memory and ships them in batches to
//! the ingest endpoint over HTTPS.
//!
//! The client is built to be a good guest inside a host web service:
//!
//! - [`Client::track`] never blocks and never fails; admission problems are
//!   resolved by truncating, shedding metadata, or dropping the event.
//! - Delivery failures retry with jittered exponential backoff; batches the
//!   network refuses to take are spilled to an append-only file on disk and
//!   recovered on the next process start.
//! - The configured endpoint is hardened against SSRF: HTTPS is required
//!   (with a localhost development exception), private addresses are
//!   rejected at construction, and every DNS resolution is re-checked
//!   against the private ranges before a connection is dialed.
//! - SIGTERM/SIGINT spill the buffer to disk without attempting network
//!   I/O, and never exit the process on the host's behalf.
//!
//! ```rust,no_run
//! use apipulse_client::{Client, Options, RequestEvent};
//!
//! # async fn example() -> Result<(), apipulse_client::ClientError> {
//! let client = Client::new(Options::new("pk_live_example"))?;
//!
//! let mut event = RequestEvent::new("GET", "/v1/items?page=2", 200);
//! event.response_time_ms = 12.5;
//! client.track(event);
//!
//! // on service shutdown:
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unreachable_pub)]

mod buffer;
mod client;
mod config;
mod consumer;
mod error;
mod event;
mod flusher;
mod private_net;
mod resolver;
mod spool;
mod transport;
mod util;

pub use client::{Client, ClientStats};
pub use config::{ErrorCallback, Options, TlsOptions, DEFAULT_ENDPOINT};
pub use consumer::hash_consumer_id;
pub use error::ClientError;
pub use event::{RequestEvent, MAX_CONSUMER_ID_BYTES, MAX_METHOD_BYTES, MAX_PATH_BYTES};
pub use private_net::{is_private_address, is_private_ip};
pub use transport::SubmitError;
pub use util::sort_query_string;
