//! Persistence contracts the core consumes.
//!
//! The core never talks to a concrete database directly: retrieval goes
//! through [`VectorIndex`], the implicate graph and memory rows through
//! [`KnowledgeStore`], and deferred work through [`JobQueue`]. In-memory
//! implementations live in [`in_memory`]; the pgvector crate provides the
//! SQL-backed fallback index.

pub mod in_memory;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{Entity, EntityEdge, EntityType, Relation};
use crate::error::Result;
use crate::job::Job;
use crate::memory::{ContradictionTriple, Memory};

/// Which representation layer a vector hit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceLayer {
    /// Literal chunk index.
    Explicate,
    /// Concept/frame index.
    Implicate,
}

impl SourceLayer {
    /// Stable lowercase tag.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            SourceLayer::Explicate => "explicate",
            SourceLayer::Implicate => "implicate",
        }
    }
}

/// One nearest-neighbor hit, shaped identically across primary and fallback
/// backends so downstream stages never branch on the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredHit {
    pub id: String,
    /// Similarity in [0, 1], higher is closer.
    pub score: f32,
    /// Row payload: `text`, `role_view_level`, `provenance`, and for
    /// implicate hits `entity_id`.
    pub metadata: HashMap<String, Value>,
}

impl ScoredHit {
    /// Visibility level stamped on the row; rows written through the core
    /// always carry one, absent means public.
    #[must_use]
    pub fn role_view_level(&self) -> u8 {
        self.metadata
            .get("role_view_level")
            .and_then(Value::as_u64)
            .map_or(0, |v| v.min(u64::from(u8::MAX)) as u8)
    }
}

/// Cheap capability-call result used as a health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub backend: String,
    pub vector_count: usize,
}

/// A dual-layer nearest-neighbor index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Top-k cosine neighbors of `embedding` in `layer`, restricted to rows
    /// with `role_view_level <= role_rank`.
    async fn query(
        &self,
        layer: SourceLayer,
        embedding: &[f32],
        top_k: usize,
        role_rank: u8,
    ) -> Result<Vec<ScoredHit>>;

    /// Describe-stats capability call; doubles as the health probe.
    async fn describe_stats(&self) -> Result<IndexStats>;
}

/// Memory rows plus the typed entity graph.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn get_memory(&self, id: &str) -> Result<Option<Memory>>;

    /// Insert or replace a memory row. Callers must run the external-persist
    /// guard first; this is the raw write.
    async fn upsert_memory(&self, memory: Memory) -> Result<String>;

    /// Idempotent entity upsert keyed by `(name, entity_type)`. Returns the
    /// existing id on conflict.
    async fn upsert_entity(
        &self,
        name: &str,
        entity_type: EntityType,
        role_view_level: u8,
        metadata: HashMap<String, Value>,
    ) -> Result<String>;

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>>;

    /// Idempotent edge upsert keyed by `(from_id, to_id, relation)`. Both
    /// endpoints must exist.
    async fn upsert_edge(
        &self,
        from_id: &str,
        to_id: &str,
        relation: Relation,
        weight: Option<f32>,
        metadata: HashMap<String, Value>,
    ) -> Result<String>;

    /// Outgoing edges of `entity_id` whose relation is in `relations`.
    async fn edges_from(&self, entity_id: &str, relations: &[Relation]) -> Result<Vec<EntityEdge>>;

    /// The memory a frame (or anchored concept) is bound to, if any.
    async fn memory_for_entity(&self, entity_id: &str) -> Result<Option<Memory>>;

    /// Append contradiction triples to a memory row with set-union
    /// semantics: concurrent appenders never drop or duplicate a triple.
    async fn append_contradictions(
        &self,
        memory_id: &str,
        triples: &[ContradictionTriple],
    ) -> Result<()>;
}

/// Terminal outcome of one job execution.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Done,
    Failed(String),
}

/// Queue of deferred work with atomic claim semantics.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<String>;

    /// Atomically claim one pending job of `kind` (pending → running). A job
    /// claimed here is invisible to other consumers until completed.
    async fn claim_pending(&self, kind: &str) -> Result<Option<Job>>;

    /// Mark a running job done or failed.
    async fn complete(&self, job_id: &str, outcome: JobOutcome) -> Result<()>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>>;
}
