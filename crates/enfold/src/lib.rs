//! # Enfold
//!
//! Role-aware, resilient retrieval-augmented QA core over a dual
//! representation store: an *explicate* layer of literal chunks and an
//! *implicate* layer of concept/frame entities joined by a typed graph.
//!
//! The crate covers the hard engineering surfaces of such a service:
//!
//! - **Retrieval**: a parallel dual-index selector with a circuit-breaker
//!   protected primary backend, health-cached fallback to a reduced-fan-out
//!   secondary store, bounded graph expansion, token-budgeted context
//!   packing, and an optional bounded-latency reviewer.
//! - **Ingest**: per-chunk predicate/frame/concept/contradiction analysis
//!   under a chunk deadline, idempotent commit of entities and typed edges,
//!   and background implicate-refresh jobs.
//! - **Resilience**: circuit breakers, a health probe cache, per-operation
//!   latency budgets with percentile metrics.
//! - **Access control**: an RBAC kernel, level-aware response redaction, and
//!   a hard guard keeping externally fetched content out of storage.
//!
//! Backends (vector indices, the knowledge store, NLP, answer generation,
//! review) are trait seams; in-memory implementations ship in
//! [`store::in_memory`] and the pgvector-backed fallback index lives in the
//! `enfold-pgvector` crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use enfold::prelude::*;
//!
//! let config = Arc::new(PerformanceConfig::from_env()?);
//! let selector = DualSelector::new(primary, breaker, fallback, config.clone(), metrics.clone());
//! let result = selector.select("what is rust?", &embedding, &SelectOptions::default()).await?;
//! ```

pub mod analyze;
pub mod audit;
pub mod breaker;
pub mod commit;
pub mod config;
pub mod entity;
pub mod error;
pub mod expand;
pub mod fallback;
pub mod guard;
pub mod health;
pub mod job;
pub mod memory;
pub mod metrics;
pub mod pack;
pub mod pipeline;
pub mod rbac;
pub mod redact;
pub mod review;
pub mod select;
pub mod store;
pub mod worker;

pub use analyze::{AnalysisResult, ChunkAnalyzer, ChunkContext, NlpCapability};
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use commit::{store_memory_guarded, CommitEngine, CommitResult};
pub use config::{AnalysisLimits, IngestFlags, PerformanceConfig};
pub use entity::{Entity, EntityEdge, EntityType, Relation};
pub use error::{Error, Result};
pub use expand::{ExpansionResult, GraphExpander};
pub use fallback::{
    FallbackAdapter, IndexHealthProbe, FALLBACK_EXPLICATE_K, FALLBACK_IMPLICATE_K,
    FALLBACK_TIMEOUT_MS,
};
pub use guard::{filter_external_items, forbid_external_persistence};
pub use health::{HealthCache, HealthProbe};
pub use job::{Job, JobStatus};
pub use memory::{ContradictionTriple, Memory, Provenance};
pub use metrics::{HistogramStats, MetricsRegistry};
pub use pack::{ContextPacker, PackPolicy, PackedContext};
pub use pipeline::{AnswerGenerator, QueryPipeline};
pub use rbac::{has_capability, max_level, resolve_role, Capability, Role};
pub use redact::redact_response;
pub use review::{AnswerJudge, ReviewResult, Reviewer};
pub use select::{
    DualSelector, Evidence, FallbackInfo, SelectOptions, SelectionResult, SelectionTimings,
};
pub use store::{
    IndexStats, JobOutcome, JobQueue, KnowledgeStore, ScoredHit, SourceLayer, VectorIndex,
};
pub use worker::{ImplicateRefresher, RefreshWorker};

/// Convenience imports for embedding the whole pipeline.
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker};
    pub use crate::config::PerformanceConfig;
    pub use crate::error::{Error, Result};
    pub use crate::fallback::FallbackAdapter;
    pub use crate::health::HealthCache;
    pub use crate::metrics::MetricsRegistry;
    pub use crate::pipeline::QueryPipeline;
    pub use crate::select::{DualSelector, SelectOptions};
}
