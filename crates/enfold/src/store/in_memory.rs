//! In-memory store implementations.
//!
//! Single-process backends used by the test suites and by embedded
//! deployments. The entity graph sits on a petgraph `DiGraph`; memory rows
//! and indexes are plain maps behind `parking_lot` locks.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde_json::Value;

use crate::entity::{Entity, EntityEdge, EntityType, Relation};
use crate::error::{Error, Result};
use crate::job::{Job, JobStatus};
use crate::memory::{ContradictionTriple, Memory};
use crate::store::{
    IndexStats, JobOutcome, JobQueue, KnowledgeStore, ScoredHit, SourceLayer, VectorIndex,
};

/// Cosine similarity of two dense vectors; 0 for mismatched or zero vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

#[derive(Debug, Clone)]
struct StoredVector {
    id: String,
    embedding: Vec<f32>,
    metadata: HashMap<String, Value>,
}

/// Brute-force cosine-scan vector index over both layers.
#[derive(Debug, Default)]
pub struct MemoryVectorIndex {
    layers: RwLock<HashMap<SourceLayer, Vec<StoredVector>>>,
}

impl MemoryVectorIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace by id) one vector into a layer.
    pub fn insert(
        &self,
        layer: SourceLayer,
        id: impl Into<String>,
        embedding: Vec<f32>,
        metadata: HashMap<String, Value>,
    ) {
        let id = id.into();
        let mut layers = self.layers.write();
        let rows = layers.entry(layer).or_default();
        rows.retain(|row| row.id != id);
        rows.push(StoredVector {
            id,
            embedding,
            metadata,
        });
    }

    /// Index a memory row into the explicate layer with the standard
    /// metadata payload.
    pub fn index_memory(&self, memory: &Memory) {
        let mut metadata = HashMap::new();
        metadata.insert("text".to_string(), Value::from(memory.text.clone()));
        metadata.insert(
            "role_view_level".to_string(),
            Value::from(memory.role_view_level),
        );
        if let Ok(provenance) = serde_json::to_value(&memory.provenance) {
            metadata.insert("provenance".to_string(), provenance);
        }
        self.insert(
            SourceLayer::Explicate,
            memory.id.clone(),
            memory.embedding.clone(),
            metadata,
        );
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn query(
        &self,
        layer: SourceLayer,
        embedding: &[f32],
        top_k: usize,
        role_rank: u8,
    ) -> Result<Vec<ScoredHit>> {
        if embedding.is_empty() {
            return Err(Error::invalid_argument("embedding must be non-empty"));
        }
        let layers = self.layers.read();
        let mut hits: Vec<ScoredHit> = layers
            .get(&layer)
            .map(|rows| {
                rows.iter()
                    .map(|row| ScoredHit {
                        id: row.id.clone(),
                        score: cosine_similarity(embedding, &row.embedding),
                        metadata: row.metadata.clone(),
                    })
                    .filter(|hit| hit.role_view_level() <= role_rank)
                    .collect()
            })
            .unwrap_or_default();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn describe_stats(&self) -> Result<IndexStats> {
        let layers = self.layers.read();
        Ok(IndexStats {
            backend: "in-memory".to_string(),
            vector_count: layers.values().map(Vec::len).sum(),
        })
    }
}

#[derive(Debug, Default)]
struct KnowledgeInner {
    memories: HashMap<String, Memory>,
    entities: HashMap<String, Entity>,
    /// (name, type) uniqueness index.
    entity_names: HashMap<(String, EntityType), String>,
    graph: DiGraph<String, String>,
    node_of_entity: HashMap<String, NodeIndex>,
    edges: HashMap<String, EntityEdge>,
    /// (from, to, relation) uniqueness index.
    edge_triples: HashMap<(String, String, Relation), String>,
}

/// Map-and-petgraph knowledge store.
#[derive(Debug, Default)]
pub struct MemoryKnowledgeStore {
    inner: RwLock<KnowledgeInner>,
}

impl MemoryKnowledgeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entity rows. Test helper.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.inner.read().entities.len()
    }

    /// Number of edge rows. Test helper.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.inner.read().edges.len()
    }
}

#[async_trait]
impl KnowledgeStore for MemoryKnowledgeStore {
    async fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        Ok(self.inner.read().memories.get(id).cloned())
    }

    async fn upsert_memory(&self, memory: Memory) -> Result<String> {
        let id = memory.id.clone();
        self.inner.write().memories.insert(id.clone(), memory);
        Ok(id)
    }

    async fn upsert_entity(
        &self,
        name: &str,
        entity_type: EntityType,
        role_view_level: u8,
        metadata: HashMap<String, Value>,
    ) -> Result<String> {
        let mut inner = self.inner.write();
        let key = (name.to_string(), entity_type);
        if let Some(existing) = inner.entity_names.get(&key) {
            return Ok(existing.clone());
        }
        let id = uuid::Uuid::new_v4().to_string();
        let entity = Entity {
            id: id.clone(),
            name: name.to_string(),
            entity_type,
            role_view_level,
            metadata,
        };
        let node = inner.graph.add_node(id.clone());
        inner.node_of_entity.insert(id.clone(), node);
        inner.entity_names.insert(key, id.clone());
        inner.entities.insert(id.clone(), entity);
        Ok(id)
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.inner.read().entities.get(id).cloned())
    }

    async fn upsert_edge(
        &self,
        from_id: &str,
        to_id: &str,
        relation: Relation,
        weight: Option<f32>,
        metadata: HashMap<String, Value>,
    ) -> Result<String> {
        let mut inner = self.inner.write();
        let triple = (from_id.to_string(), to_id.to_string(), relation);
        if let Some(existing) = inner.edge_triples.get(&triple) {
            return Ok(existing.clone());
        }
        let (Some(&from_node), Some(&to_node)) = (
            inner.node_of_entity.get(from_id),
            inner.node_of_entity.get(to_id),
        ) else {
            return Err(Error::DataIntegrity(format!(
                "edge {from_id} -[{}]-> {to_id} references a missing entity",
                relation.name()
            )));
        };
        let id = uuid::Uuid::new_v4().to_string();
        inner.graph.add_edge(from_node, to_node, id.clone());
        inner.edge_triples.insert(triple, id.clone());
        inner.edges.insert(
            id.clone(),
            EntityEdge {
                id: id.clone(),
                from_id: from_id.to_string(),
                to_id: to_id.to_string(),
                relation,
                weight,
                metadata,
            },
        );
        Ok(id)
    }

    async fn edges_from(&self, entity_id: &str, relations: &[Relation]) -> Result<Vec<EntityEdge>> {
        let inner = self.inner.read();
        let Some(&node) = inner.node_of_entity.get(entity_id) else {
            return Ok(Vec::new());
        };
        let mut result: Vec<EntityEdge> = inner
            .graph
            .edges(node)
            .filter_map(|edge| inner.edges.get(edge.weight()))
            .filter(|edge| relations.contains(&edge.relation))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(result)
    }

    async fn memory_for_entity(&self, entity_id: &str) -> Result<Option<Memory>> {
        let inner = self.inner.read();
        let Some(entity) = inner.entities.get(entity_id) else {
            return Ok(None);
        };
        let memory_id = entity
            .metadata
            .get("memory_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(memory_id.and_then(|id| inner.memories.get(&id).cloned()))
    }

    async fn append_contradictions(
        &self,
        memory_id: &str,
        triples: &[ContradictionTriple],
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(memory) = inner.memories.get_mut(memory_id) else {
            return Err(Error::DataIntegrity(format!(
                "memory {memory_id} not found for contradiction append"
            )));
        };
        let existing: HashSet<ContradictionTriple> =
            memory.contradictions.iter().cloned().collect();
        for triple in triples {
            if !existing.contains(triple) {
                memory.contradictions.push(triple.clone());
            }
        }
        Ok(())
    }
}

/// Single-process job queue with atomic claim.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<Job>>,
}

impl MemoryJobQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All jobs, in enqueue order. Test helper.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<String> {
        let id = job.id.clone();
        self.jobs.lock().push(job);
        Ok(id)
    }

    async fn claim_pending(&self, kind: &str) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock();
        for job in jobs.iter_mut() {
            if job.kind == kind && job.status == JobStatus::Pending {
                job.status = JobStatus::Running;
                job.started_at = Some(chrono::Utc::now());
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    async fn complete(&self, job_id: &str, outcome: JobOutcome) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.iter_mut().find(|job| job.id == job_id) else {
            return Err(Error::DataIntegrity(format!("job {job_id} not found")));
        };
        if job.status != JobStatus::Running {
            return Err(Error::DataIntegrity(format!(
                "job {job_id} is not running; cannot complete"
            )));
        }
        job.finished_at = Some(chrono::Utc::now());
        match outcome {
            JobOutcome::Done => job.status = JobStatus::Done,
            JobOutcome::Failed(error) => {
                job.status = JobStatus::Failed;
                job.error = Some(error);
            }
        }
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.lock().iter().find(|job| job.id == job_id).cloned())
    }
}
