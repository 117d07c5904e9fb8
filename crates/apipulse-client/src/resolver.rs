//! DNS resolution guard for the HTTPS transport.
//!
//! Installed as the connection pool's resolver, so every dial, including
//! re-resolution after a TTL expiry, revalidates the addresses a hostname
//! points at. A hostname that was public at construction time can be
//! re-pointed at an internal address later (DNS rebinding); checking at
//! resolution time closes that window.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::debug;

/// How long a successful lookup is reused before hitting the system
/// resolver again.
const CACHE_TTL: Duration = Duration::from_secs(60);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A resolved address landed in a private range.
#[derive(Debug, thiserror::Error)]
#[error("refusing to connect: {host} resolved to private address {addr}")]
pub(crate) struct SsrfBlocked {
    host: String,
    addr: IpAddr,
}

#[derive(Debug)]
struct CachedLookup {
    addrs: Vec<SocketAddr>,
    expires_at: Instant,
}

/// System resolver wrapper with a per-client TTL cache and a post-resolution
/// private-range check.
#[derive(Debug, Clone, Default)]
pub(crate) struct GuardedResolver {
    cache: Arc<Mutex<HashMap<String, CachedLookup>>>,
}

impl GuardedResolver {
    pub(crate) fn new() -> Self {
        GuardedResolver::default()
    }

    fn cached(&self, host: &str) -> Option<Vec<SocketAddr>> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.get(host)?;
        (entry.expires_at > Instant::now()).then(|| entry.addrs.clone())
    }

    fn store(&self, host: &str, addrs: &[SocketAddr]) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.insert(
            host.to_string(),
            CachedLookup {
                addrs: addrs.to_vec(),
                expires_at: Instant::now() + CACHE_TTL,
            },
        );
    }

    async fn lookup(self, host: String) -> Result<Vec<SocketAddr>, BoxError> {
        if let Some(addrs) = self.cached(&host) {
            return Ok(addrs);
        }

        let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
            .await
            .map_err(|err| Box::new(err) as BoxError)?
            .collect();

        for addr in &resolved {
            if crate::private_net::is_private_ip(addr.ip()) {
                debug!(host = %host, addr = %addr.ip(), "blocked dial to private address");
                return Err(Box::new(SsrfBlocked {
                    host,
                    addr: addr.ip(),
                }));
            }
        }

        self.store(&host, &resolved);
        Ok(resolved)
    }
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.clone();
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs = resolver.lookup(host).await?;
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn public_lookup_resolves_and_caches() {
        let resolver = GuardedResolver::new();
        // use a literal so the test never leaves the machine
        let addrs = resolver
            .clone()
            .lookup("93.184.216.34".to_string())
            .await
            .expect("literal public address should resolve");
        assert!(!addrs.is_empty());
        assert!(resolver.cached("93.184.216.34").is_some());
    }

    #[tokio::test]
    async fn private_lookup_is_blocked_and_not_cached() {
        let resolver = GuardedResolver::new();
        let err = resolver
            .clone()
            .lookup("10.0.0.1".to_string())
            .await
            .expect_err("private address must be refused");
        assert!(err.to_string().contains("private address"));
        assert!(resolver.cached("10.0.0.1").is_none());
    }

    #[tokio::test]
    async fn loopback_lookup_is_blocked() {
        let resolver = GuardedResolver::new();
        assert!(resolver.lookup("127.0.0.1".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn cache_entry_is_reused() {
        let resolver = GuardedResolver::new();
        let seeded = vec!["93.184.216.34:443".parse().expect("addr")];
        resolver.store("seeded.example", &seeded);
        let addrs = resolver
            .lookup("seeded.example".to_string())
            .await
            .expect("cached entry should short-circuit the system resolver");
        assert_eq!(addrs, seeded);
    }
}
