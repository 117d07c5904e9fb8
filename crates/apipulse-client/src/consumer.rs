//! Consumer identity helpers for framework adapters.

use sha2::{Digest, Sha256};

/// Derives a stable, irreversible consumer identifier from a raw identity
/// such as an email address or user id.
///
/// Adapters that must not ship raw user identity can run it through this
/// before setting [`crate::RequestEvent::consumer_id`]; equal inputs always
/// map to the same identifier.
pub fn hash_consumer_id(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}
