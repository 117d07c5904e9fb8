//! The request observation record and its admission rules.
//!
//! Admission is deliberately forgiving: oversized fields are truncated,
//! oversized metadata is shed, and an event that still exceeds the budget is
//! dropped with a debug log. Nothing on this path returns an error to the
//! caller.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::util::sort_query_string;

/// Byte cap applied to [`RequestEvent::method`] at admission.
pub const MAX_METHOD_BYTES: usize = 16;
/// Byte cap applied to [`RequestEvent::path`] at admission.
pub const MAX_PATH_BYTES: usize = 2048;
/// Byte cap applied to [`RequestEvent::consumer_id`] at admission.
pub const MAX_CONSUMER_ID_BYTES: usize = 256;

/// One served request, as observed by a framework adapter.
///
/// Adapters construct one of these per request and hand it to
/// [`crate::Client::track`]. All fields are optional on the wire where the
/// adapter may not know them; recovery from disk tolerates partial records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestEvent {
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub response_time_ms: f64,
    pub request_size: u64,
    pub response_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub timestamp: String,
}

impl RequestEvent {
    /// Creates an event stamped with the current UTC time.
    pub fn new(method: impl Into<String>, path: impl Into<String>, status_code: u16) -> Self {
        RequestEvent {
            method: method.into(),
            path: path.into(),
            status_code,
            timestamp: chrono::Utc::now().to_rfc3339(),
            ..RequestEvent::default()
        }
    }
}

/// Normalizes an event and enforces the per-event size budget.
///
/// Field caps are applied first (`method`, `path`, `consumer_id`), then the
/// serialized size is checked, but only for events carrying `metadata`,
/// which is the only unbounded field. Over budget, metadata is shed and the
/// size recomputed; still over budget, the event is dropped.
///
/// Returns `None` when the event was dropped.
pub(crate) fn admit(
    mut event: RequestEvent,
    max_event_bytes: usize,
    debug_enabled: bool,
) -> Option<RequestEvent> {
    event.path = sort_query_string(&event.path);
    truncate_in_place(&mut event.method, MAX_METHOD_BYTES);
    truncate_in_place(&mut event.path, MAX_PATH_BYTES);
    if let Some(consumer_id) = event.consumer_id.as_mut() {
        truncate_in_place(consumer_id, MAX_CONSUMER_ID_BYTES);
    }

    if event.metadata.is_none() {
        return Some(event);
    }

    match serialized_len(&event) {
        Some(len) if len <= max_event_bytes => Some(event),
        Some(_) => {
            event.metadata = None;
            match serialized_len(&event) {
                Some(len) if len <= max_event_bytes => {
                    if debug_enabled {
                        debug!(path = %event.path, "event over size budget, metadata dropped");
                    }
                    Some(event)
                }
                _ => {
                    if debug_enabled {
                        debug!(path = %event.path, "event over size budget even without metadata, dropped");
                    }
                    None
                }
            }
        }
        None => {
            if debug_enabled {
                debug!(path = %event.path, "event failed to serialize, dropped");
            }
            None
        }
    }
}

fn serialized_len(event: &RequestEvent) -> Option<usize> {
    serde_json::to_vec(event).ok().map(|buf| buf.len())
}

/// Truncates a string to at most `max` bytes without splitting a character.
fn truncate_in_place(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}
