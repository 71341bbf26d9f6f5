//! Last-known-good health cache for remote backends.
//!
//! A positive probe result is cached for a bounded TTL (30 s by default) so
//! the request path rarely pays for a live probe. Negative results are never
//! cached: a sick backend is re-probed on the next query, which makes
//! recovery visible immediately.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;

/// Default cache TTL for a healthy verdict.
pub const PROBE_TTL: Duration = Duration::from_secs(30);

/// A cheap capability call against a backend (e.g. "describe index stats").
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Ok(()) when the backend answered; Err carries the failure mode.
    async fn probe(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct CachedVerdict {
    checked_at: Instant,
    healthy: bool,
}

/// Per-backend bounded-TTL health cache.
#[derive(Debug)]
pub struct HealthCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedVerdict>>,
}

impl Default for HealthCache {
    fn default() -> Self {
        Self::new(PROBE_TTL)
    }
}

impl HealthCache {
    /// Cache with a custom TTL (tests shrink it).
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Is `backend` healthy?
    ///
    /// Returns the cached positive verdict when fresh; otherwise runs the
    /// probe. The second element is the failure reason when unhealthy.
    pub async fn check(&self, backend: &str, probe: &dyn HealthProbe) -> (bool, Option<String>) {
        if let Some(entry) = self.entries.lock().get(backend).copied() {
            if entry.healthy && entry.checked_at.elapsed() < self.ttl {
                return (true, None);
            }
        }

        match probe.probe().await {
            Ok(()) => {
                self.entries.lock().insert(
                    backend.to_string(),
                    CachedVerdict {
                        checked_at: Instant::now(),
                        healthy: true,
                    },
                );
                (true, None)
            }
            Err(err) => {
                // Unhealthy verdicts are not cached: the next check re-probes.
                self.entries.lock().remove(backend);
                (false, Some(err.to_string()))
            }
        }
    }

    /// Forget everything. Test hook.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
