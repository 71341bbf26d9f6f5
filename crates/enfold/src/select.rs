//! Dual-index selector.
//!
//! Queries the explicate and implicate indices in parallel under per-leg
//! timeouts, merges whatever arrived, and falls back to the reduced-k
//! secondary backend when the primary's breaker is open or its health probe
//! fails. The selector never fails on backend trouble: every outcome is a
//! [`SelectionResult`] annotated with warnings, and only invalid arguments
//! surface as errors.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::breaker::CircuitBreaker;
use crate::config::PerformanceConfig;
use crate::error::{Error, Result};
use crate::fallback::{FallbackAdapter, FALLBACK_EXPLICATE_K, FALLBACK_IMPLICATE_K};
use crate::metrics::MetricsRegistry;
use crate::rbac;
use crate::store::{ScoredHit, SourceLayer, VectorIndex};

/// Default explicate fan-out.
pub const DEFAULT_EXPLICATE_K: usize = 16;
/// Default implicate fan-out.
pub const DEFAULT_IMPLICATE_K: usize = 8;

/// Selection options.
#[derive(Debug, Clone)]
pub struct SelectOptions {
    /// Caller roles; drive the visibility filter and `role_rank`.
    pub roles: Vec<String>,
    pub explicate_k: usize,
    pub implicate_k: usize,
    /// Optional metadata equality filter applied to merged hits.
    pub filter: Option<HashMap<String, Value>>,
    /// Debug flag: serve from the fallback backend regardless of health.
    pub force_fallback: bool,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            roles: Vec::new(),
            explicate_k: DEFAULT_EXPLICATE_K,
            implicate_k: DEFAULT_IMPLICATE_K,
            filter: None,
            force_fallback: false,
        }
    }
}

/// One piece of evidence in the working set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub source_layer: SourceLayer,
    pub provenance: Value,
    pub role_view_level: u8,
    /// Set when the graph expander added this item.
    #[serde(default)]
    pub via_graph: bool,
    /// Implicate-layer entity the hit resolves to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

impl Evidence {
    fn from_hit(hit: ScoredHit, layer: SourceLayer) -> Self {
        let role_view_level = hit.role_view_level();
        let text = hit
            .metadata
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let provenance = hit.metadata.get("provenance").cloned().unwrap_or(Value::Null);
        let entity_id = hit
            .metadata
            .get("entity_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            id: hit.id,
            text,
            score: hit.score,
            source_layer: layer,
            provenance,
            role_view_level,
            via_graph: false,
            entity_id,
        }
    }
}

/// Observed behavior of one selector leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegTiming {
    pub latency_ms: f64,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-request selection timings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionTimings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explicate: Option<LegTiming>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implicate: Option<LegTiming>,
    pub total_wall_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_ms: Option<f64>,
}

/// Reduced fan-out applied in fallback mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducedK {
    pub explicate: usize,
    pub implicate: usize,
}

/// Whether (and why) the secondary backend served this request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackInfo {
    pub used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduced_k: Option<ReducedK>,
}

/// Strategy and counts recorded alongside the evidence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionMetadata {
    pub strategy: String,
    /// Items dropped by the role-visibility filter.
    pub filtered_count: usize,
    /// Items surviving merge and filtering.
    pub merged_count: usize,
}

/// Structured output of [`DualSelector::select`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionResult {
    pub evidence: Vec<Evidence>,
    pub timings: SelectionTimings,
    pub warnings: Vec<String>,
    pub fallback: FallbackInfo,
    pub metadata: SelectionMetadata,
}

enum LegOutcome {
    Hits(Vec<ScoredHit>),
    TimedOut,
    Failed(String),
    BreakerOpen(String),
}

fn layer_title(layer: SourceLayer) -> &'static str {
    match layer {
        SourceLayer::Explicate => "Explicate",
        SourceLayer::Implicate => "Implicate",
    }
}

/// The parallel dual-index selector.
pub struct DualSelector {
    primary: Arc<dyn VectorIndex>,
    breaker: Arc<CircuitBreaker>,
    fallback: Arc<FallbackAdapter>,
    config: Arc<PerformanceConfig>,
    metrics: Arc<MetricsRegistry>,
}

impl DualSelector {
    #[must_use]
    pub fn new(
        primary: Arc<dyn VectorIndex>,
        breaker: Arc<CircuitBreaker>,
        fallback: Arc<FallbackAdapter>,
        config: Arc<PerformanceConfig>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            primary,
            breaker,
            fallback,
            config,
            metrics,
        }
    }

    /// Select evidence for `embedding`.
    ///
    /// Wall time is bounded by `retrieval.timeout_ms` in parallel primary
    /// mode, roughly twice that sequentially, and by the 350 ms fallback
    /// budget in fallback mode. Backend failures never escape; only invalid
    /// arguments do.
    pub async fn select(
        &self,
        _query: &str,
        embedding: &[f32],
        opts: &SelectOptions,
    ) -> Result<SelectionResult> {
        if embedding.is_empty() {
            return Err(Error::invalid_argument("embedding must be non-empty"));
        }
        if opts.explicate_k == 0 || opts.implicate_k == 0 {
            return Err(Error::invalid_argument("per-layer k must be positive"));
        }

        self.metrics
            .increment_counter("retrieval_requests_total", &[]);
        let role_rank = rbac::max_level(&opts.roles);

        let mut result = if opts.force_fallback {
            self.select_fallback(embedding, opts, role_rank, "forced".to_string())
                .await
        } else {
            match self.fallback.should_use_fallback().await {
                (true, reason) => {
                    self.select_fallback(
                        embedding,
                        opts,
                        role_rank,
                        reason.unwrap_or_else(|| "primary_unhealthy".to_string()),
                    )
                    .await
                }
                (false, _) => self.select_primary(embedding, opts, role_rank).await,
            }
        };

        // Role-visibility filter over the merged list.
        let before = result.evidence.len();
        result.evidence.retain(|e| e.role_view_level <= role_rank);
        result.metadata.filtered_count = before - result.evidence.len();
        result.metadata.merged_count = result.evidence.len();

        self.metrics
            .observe_histogram("retrieval_ms", result.timings.total_wall_time_ms, &[]);
        if result.fallback.used {
            self.metrics
                .increment_counter("pgvector_fallback_total", &[]);
        }
        Ok(result)
    }

    async fn select_primary(
        &self,
        embedding: &[f32],
        opts: &SelectOptions,
        role_rank: u8,
    ) -> SelectionResult {
        let (explicate, implicate) = if self.config.retrieval_parallel {
            futures::join!(
                self.run_leg(SourceLayer::Explicate, embedding, opts.explicate_k, role_rank),
                self.run_leg(SourceLayer::Implicate, embedding, opts.implicate_k, role_rank),
            )
        } else {
            let explicate = self
                .run_leg(SourceLayer::Explicate, embedding, opts.explicate_k, role_rank)
                .await;
            let implicate = self
                .run_leg(SourceLayer::Implicate, embedding, opts.implicate_k, role_rank)
                .await;
            (explicate, implicate)
        };

        // A breaker rejection on either leg switches the whole request to
        // the fallback backend for consistency between layers.
        for (outcome, _) in [&explicate, &implicate] {
            if let LegOutcome::BreakerOpen(detail) = outcome {
                let reason = format!("circuit_breaker_open: {detail}");
                tracing::warn!(reason = %reason, "selector switching to fallback");
                return self
                    .select_fallback(embedding, opts, role_rank, reason)
                    .await;
            }
        }

        let strategy = if self.config.retrieval_parallel {
            "primary_parallel"
        } else {
            "primary_sequential"
        };
        let mut warnings = Vec::new();
        let (explicate_hits, explicate_timing) =
            Self::leg_results(SourceLayer::Explicate, explicate, &mut warnings);
        let (implicate_hits, implicate_timing) =
            Self::leg_results(SourceLayer::Implicate, implicate, &mut warnings);
        if explicate_hits.is_some() != implicate_hits.is_some() {
            let survivor = if explicate_hits.is_some() {
                SourceLayer::Explicate
            } else {
                SourceLayer::Implicate
            };
            warnings.push(format!(
                "Merged results from {} leg only",
                survivor.name()
            ));
        }

        let total_wall_time_ms = if self.config.retrieval_parallel {
            explicate_timing.latency_ms.max(implicate_timing.latency_ms)
        } else {
            explicate_timing.latency_ms + implicate_timing.latency_ms
        };

        let evidence = merge_hits(explicate_hits, implicate_hits, opts.filter.as_ref());
        SelectionResult {
            evidence,
            timings: SelectionTimings {
                explicate: Some(explicate_timing),
                implicate: Some(implicate_timing),
                total_wall_time_ms,
                fallback_ms: None,
            },
            warnings,
            fallback: FallbackInfo::default(),
            metadata: SelectionMetadata {
                strategy: strategy.to_string(),
                ..SelectionMetadata::default()
            },
        }
    }

    async fn select_fallback(
        &self,
        embedding: &[f32],
        opts: &SelectOptions,
        role_rank: u8,
        reason: String,
    ) -> SelectionResult {
        let start = Instant::now();
        let (explicate, implicate) = futures::join!(
            self.fallback
                .query_explicate(embedding, opts.explicate_k, role_rank),
            self.fallback
                .query_implicate(embedding, opts.implicate_k, role_rank),
        );
        let fallback_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut warnings = Vec::new();
        let explicate = match explicate {
            Ok(hits) => Some(hits),
            Err(err) => {
                warnings.push(format!("Explicate fallback query failed: {err}"));
                None
            }
        };
        let implicate = match implicate {
            Ok(hits) => Some(hits),
            Err(err) => {
                warnings.push(format!("Implicate fallback query failed: {err}"));
                None
            }
        };

        let evidence = merge_hits(explicate, implicate, opts.filter.as_ref());
        SelectionResult {
            evidence,
            timings: SelectionTimings {
                explicate: None,
                implicate: None,
                total_wall_time_ms: fallback_ms,
                fallback_ms: Some(fallback_ms),
            },
            warnings,
            fallback: FallbackInfo {
                used: true,
                reason: Some(reason),
                reduced_k: Some(ReducedK {
                    explicate: opts.explicate_k.min(FALLBACK_EXPLICATE_K),
                    implicate: opts.implicate_k.min(FALLBACK_IMPLICATE_K),
                }),
            },
            metadata: SelectionMetadata {
                strategy: "fallback".to_string(),
                ..SelectionMetadata::default()
            },
        }
    }

    async fn run_leg(
        &self,
        layer: SourceLayer,
        embedding: &[f32],
        top_k: usize,
        role_rank: u8,
    ) -> (LegOutcome, LegTiming) {
        let budget_ms = self.config.retrieval_timeout_ms;
        let budget = Duration::from_millis(budget_ms);
        let start = Instant::now();

        let outcome = self
            .breaker
            .call(|| async {
                match tokio::time::timeout(
                    budget,
                    self.primary.query(layer, embedding, top_k, role_rank),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(format!("{} query", layer.name()), budget_ms)),
                }
            })
            .await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(hits) => (
                LegOutcome::Hits(hits),
                LegTiming {
                    latency_ms,
                    timed_out: false,
                    error: None,
                },
            ),
            Err(Error::BreakerOpen(name)) => (
                LegOutcome::BreakerOpen(name),
                LegTiming {
                    latency_ms,
                    timed_out: false,
                    error: Some("breaker open".to_string()),
                },
            ),
            Err(err @ Error::Timeout { .. }) => {
                self.metrics.increment_counter("retrieval_errors_total", &[]);
                (
                    LegOutcome::TimedOut,
                    LegTiming {
                        latency_ms,
                        timed_out: true,
                        error: Some(err.to_string()),
                    },
                )
            }
            Err(err) => {
                self.metrics.increment_counter("retrieval_errors_total", &[]);
                (
                    LegOutcome::Failed(err.to_string()),
                    LegTiming {
                        latency_ms,
                        timed_out: false,
                        error: Some(err.to_string()),
                    },
                )
            }
        }
    }

    fn leg_results(
        layer: SourceLayer,
        (outcome, timing): (LegOutcome, LegTiming),
        warnings: &mut Vec<String>,
    ) -> (Option<Vec<ScoredHit>>, LegTiming) {
        match outcome {
            LegOutcome::Hits(hits) => (Some(hits), timing),
            LegOutcome::TimedOut => {
                warnings.push(format!("{} query timed out", layer_title(layer)));
                (None, timing)
            }
            LegOutcome::Failed(detail) => {
                warnings.push(format!("{} query failed: {detail}", layer_title(layer)));
                (None, timing)
            }
            // Handled by the caller before merge.
            LegOutcome::BreakerOpen(_) => (None, timing),
        }
    }
}

/// Does a hit's metadata satisfy every (key, value) pair of the filter?
// MSRV 1.80: map_or(true, ...) instead of is_none_or.
#[allow(clippy::unnecessary_map_or)]
fn matches_filter(hit: &ScoredHit, filter: Option<&HashMap<String, Value>>) -> bool {
    filter.map_or(true, |filter| {
        filter
            .iter()
            .all(|(key, value)| hit.metadata.get(key) == Some(value))
    })
}

/// Concatenate explicate-first, deduplicating by id (first occurrence wins).
fn merge_hits(
    explicate: Option<Vec<ScoredHit>>,
    implicate: Option<Vec<ScoredHit>>,
    filter: Option<&HashMap<String, Value>>,
) -> Vec<Evidence> {
    let mut seen = HashSet::new();
    let mut evidence = Vec::new();
    for (layer, hits) in [
        (SourceLayer::Explicate, explicate),
        (SourceLayer::Implicate, implicate),
    ] {
        for hit in hits.unwrap_or_default() {
            if matches_filter(&hit, filter) && seen.insert(hit.id.clone()) {
                evidence.push(Evidence::from_hit(hit, layer));
            }
        }
    }
    evidence
}
