//! Code -> host address table with expiry.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Longest accepted match code.
pub const MAX_CODE_LEN: usize = 32;

#[derive(Debug, Clone, Copy)]
struct Entry {
    addr: SocketAddr,
    expires: Instant,
}

#[derive(Debug)]
pub struct Directory {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

/// Codes are case-insensitive and surrounding whitespace is ignored.
pub fn normalize_code(code: &str) -> Option<String> {
    let code = code.trim();
    if code.is_empty() || code.len() > MAX_CODE_LEN {
        return None;
    }
    Some(code.to_ascii_uppercase())
}

impl Directory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or refresh `code`. Returns `false` for an unusable code.
    pub fn register(&self, code: &str, addr: SocketAddr, now: Instant) -> bool {
        let Some(code) = normalize_code(code) else {
            return false;
        };
        self.entries.insert(
            code,
            Entry {
                addr,
                expires: now + self.ttl,
            },
        );
        true
    }

    pub fn lookup(&self, code: &str, now: Instant) -> Option<SocketAddr> {
        let code = normalize_code(code)?;
        let entry = *self.entries.get(&code)?;
        if entry.expires <= now {
            self.entries.remove_if(&code, |_, e| e.expires <= now);
            return None;
        }
        Some(entry.addr)
    }

    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
