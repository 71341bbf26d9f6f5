//! Secondary-backend fallback adapter.
//!
//! Wraps the reduced-fan-out vector backend (pgvector in production) behind
//! fixed caps and its own timeout. The caps and budget are constants by
//! design: fallback mode trades recall for a hard latency ceiling, and
//! making them configurable would let one knob quietly defeat the ceiling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PerformanceConfig;
use crate::error::{Error, Result};
use crate::health::{HealthCache, HealthProbe};
use crate::store::{ScoredHit, SourceLayer, VectorIndex};

/// Explicate fan-out cap in fallback mode.
pub const FALLBACK_EXPLICATE_K: usize = 8;
/// Implicate fan-out cap in fallback mode.
pub const FALLBACK_IMPLICATE_K: usize = 4;
/// Hard deadline for a fallback query.
pub const FALLBACK_TIMEOUT_MS: u64 = 350;

/// Health-cache key for the primary backend.
pub const PRIMARY_BACKEND: &str = "primary-vector";

/// [`HealthProbe`] over a vector index's describe-stats capability call.
pub struct IndexHealthProbe {
    index: Arc<dyn VectorIndex>,
}

impl IndexHealthProbe {
    #[must_use]
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl HealthProbe for IndexHealthProbe {
    async fn probe(&self) -> Result<()> {
        self.index.describe_stats().await.map(|_| ())
    }
}

/// Reduced-k adapter over the secondary vector backend.
pub struct FallbackAdapter {
    secondary: Arc<dyn VectorIndex>,
    primary_probe: IndexHealthProbe,
    health: Arc<HealthCache>,
    pgvector_enabled: bool,
    fallbacks_enabled: bool,
}

impl FallbackAdapter {
    /// Build the adapter from the two backends and the loaded config.
    #[must_use]
    pub fn new(
        primary: Arc<dyn VectorIndex>,
        secondary: Arc<dyn VectorIndex>,
        health: Arc<HealthCache>,
        config: &PerformanceConfig,
    ) -> Self {
        Self {
            secondary,
            primary_probe: IndexHealthProbe::new(primary),
            health,
            pgvector_enabled: config.pgvector_enabled,
            fallbacks_enabled: config.fallbacks_enabled,
        }
    }

    /// Is the primary backend healthy? Consults the probe cache.
    pub async fn check_primary_health(&self) -> (bool, Option<String>) {
        self.health.check(PRIMARY_BACKEND, &self.primary_probe).await
    }

    /// Should the selector serve this request from the fallback backend?
    ///
    /// True iff fallbacks are enabled, pgvector is enabled, and the primary
    /// is unhealthy; the reason encodes the failure mode.
    pub async fn should_use_fallback(&self) -> (bool, Option<String>) {
        if !self.fallbacks_enabled || !self.pgvector_enabled {
            return (false, None);
        }
        match self.check_primary_health().await {
            (true, _) => (false, None),
            (false, reason) => (
                true,
                Some(format!(
                    "primary_unhealthy: {}",
                    reason.unwrap_or_else(|| "probe failed".to_string())
                )),
            ),
        }
    }

    /// Explicate fallback query; `top_k` capped at [`FALLBACK_EXPLICATE_K`].
    pub async fn query_explicate(
        &self,
        embedding: &[f32],
        top_k: usize,
        role_rank: u8,
    ) -> Result<Vec<ScoredHit>> {
        self.query(SourceLayer::Explicate, embedding, top_k.min(FALLBACK_EXPLICATE_K), role_rank)
            .await
    }

    /// Implicate fallback query; `top_k` capped at [`FALLBACK_IMPLICATE_K`].
    pub async fn query_implicate(
        &self,
        embedding: &[f32],
        top_k: usize,
        role_rank: u8,
    ) -> Result<Vec<ScoredHit>> {
        self.query(SourceLayer::Implicate, embedding, top_k.min(FALLBACK_IMPLICATE_K), role_rank)
            .await
    }

    async fn query(
        &self,
        layer: SourceLayer,
        embedding: &[f32],
        top_k: usize,
        role_rank: u8,
    ) -> Result<Vec<ScoredHit>> {
        let budget = Duration::from_millis(FALLBACK_TIMEOUT_MS);
        match tokio::time::timeout(budget, self.secondary.query(layer, embedding, top_k, role_rank))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(
                format!("{} fallback query", layer.name()),
                FALLBACK_TIMEOUT_MS,
            )),
        }
    }
}
