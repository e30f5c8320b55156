//! Match-code directory server.
//!
//! Hosts register their listening port under a short code; joiners look the
//! code up and get back the host's observed address. Entries expire unless
//! refreshed.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info};

pub mod directory;
pub mod net;

pub use directory::Directory;

use crate::net::rate_limit::{IpRateLimiter, RateLimitConfig};

/// Rate limiter entries kept before stale IPs are evicted.
const MAX_RATE_LIMIT_ENTRIES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// How long a registration lives without a refresh.
    pub entry_ttl: Duration,
    /// How often expired entries are purged.
    pub cleanup_interval: Duration,
    /// Connections idle longer than this are closed.
    pub idle_timeout: Duration,
    pub rate: RateLimitConfig,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(10),
            rate: RateLimitConfig::default(),
        }
    }
}

/// Serve the directory on `listener` until the task is dropped.
pub async fn run_directory(listener: TcpListener, config: DirectoryConfig) -> anyhow::Result<()> {
    let directory = Arc::new(Directory::new(config.entry_ttl));
    let limiter = config
        .rate
        .conn_limit_enabled()
        .then(|| Arc::new(IpRateLimiter::new(config.rate.clone())));

    let cleanup = {
        let directory = directory.clone();
        let limiter = limiter.clone();
        let every = config.cleanup_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(every);
            loop {
                timer.tick().await;
                let purged = directory.purge_expired(std::time::Instant::now());
                if purged > 0 {
                    debug!(purged, remaining = directory.len(), "Purged expired match codes");
                }
                if let Some(limiter) = &limiter {
                    limiter.cleanup_stale(MAX_RATE_LIMIT_ENTRIES);
                }
            }
        })
    };

    info!("Match directory listening on {}", listener.local_addr()?);
    let result =
        net::tcp::run_tcp_listener_with_listener(listener, directory, limiter, config.idle_timeout)
            .await;
    cleanup.abort();
    result
}
