//! Idempotent commit of analysis output.
//!
//! Turns one chunk's [`AnalysisResult`] into concept/frame entities and
//! typed edges. Entity names are stable functions of their inputs
//! (`concept:<slug>`, `frame:<file>:<chunk>:<local>`), edges are unique by
//! `(from, to, relation)`, and contradiction appends are set-unions, so
//! running the same logical ingest twice yields the same ids and no new
//! rows. Every entry point runs the external-persist guard first.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analyze::{AnalysisResult, Polarity};
use crate::config::IngestFlags;
use crate::entity::{concept_name, frame_name, EntityType, Relation};
use crate::error::{Error, Result};
use crate::guard;
use crate::job::{Job, IMPLICATE_REFRESH};
use crate::memory::Memory;
use crate::store::{JobQueue, KnowledgeStore};

/// Ids produced (or reused) by one commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitResult {
    pub concept_entity_ids: Vec<String>,
    pub frame_entity_ids: Vec<String>,
    pub edge_ids: Vec<String>,
    pub jobs_enqueued: usize,
    pub errors: Vec<String>,
}

/// The commit engine.
pub struct CommitEngine {
    store: Arc<dyn KnowledgeStore>,
    jobs: Arc<dyn JobQueue>,
    flags: IngestFlags,
}

impl CommitEngine {
    #[must_use]
    pub fn new(store: Arc<dyn KnowledgeStore>, jobs: Arc<dyn JobQueue>, flags: IngestFlags) -> Self {
        Self { store, jobs, flags }
    }

    /// Commit one chunk's analysis against its memory row.
    ///
    /// `source_items`, when provided, are the raw ingest payloads; any
    /// external marker on them fails the whole commit before a row is
    /// written.
    pub async fn commit_analysis(
        &self,
        analysis: &AnalysisResult,
        memory_id: &str,
        file_id: &str,
        chunk_idx: usize,
        source_items: Option<&[Value]>,
    ) -> Result<CommitResult> {
        if let Some(items) = source_items {
            guard::forbid_external_persistence(items, "memory", true)?;
        }
        if analysis.truncated {
            return Err(Error::invalid_argument(
                "truncated analysis must not be committed; re-analyze the chunk",
            ));
        }

        let mut result = CommitResult::default();
        let mut concept_ids_by_name: HashMap<String, String> = HashMap::new();

        for concept in &analysis.concepts {
            let name = concept_name(&concept.name);
            let mut metadata = HashMap::new();
            metadata.insert("display_name".to_string(), Value::from(concept.name.clone()));
            metadata.insert("memory_id".to_string(), Value::from(memory_id));
            let id = self
                .store
                .upsert_entity(&name, EntityType::Concept, 0, metadata)
                .await?;
            concept_ids_by_name.insert(concept.name.clone(), id.clone());
            result.concept_entity_ids.push(id);
        }

        for frame in &analysis.frames {
            let name = frame_name(file_id, chunk_idx, &frame.local_id);
            let mut metadata = HashMap::new();
            metadata.insert("memory_id".to_string(), Value::from(memory_id));
            metadata.insert(
                "kind".to_string(),
                serde_json::to_value(frame.kind).unwrap_or(Value::Null),
            );
            let frame_id = self
                .store
                .upsert_entity(&name, EntityType::Artifact, 0, metadata)
                .await?;
            result.frame_entity_ids.push(frame_id.clone());

            let polarity = frame
                .predicate_index
                .and_then(|i| analysis.predicates.get(i))
                .map(|p| (p.polarity, p.verb.clone()));

            for concept in &frame.concepts {
                let Some(concept_id) = concept_ids_by_name.get(concept) else {
                    result.errors.push(format!(
                        "frame {} references unknown concept '{concept}'; edge skipped",
                        frame.local_id
                    ));
                    continue;
                };
                let (relation, verb) = match &polarity {
                    Some((Polarity::Positive, verb)) => (Relation::Supports, Some(verb.clone())),
                    Some((Polarity::Negative, verb)) => (Relation::Contradicts, Some(verb.clone())),
                    None => (Relation::EvidenceOf, None),
                };
                let mut metadata = HashMap::new();
                if let Some(verb) = verb {
                    metadata.insert("source_verb".to_string(), Value::from(verb));
                }
                match self
                    .store
                    .upsert_edge(&frame_id, concept_id, relation, None, metadata)
                    .await
                {
                    Ok(edge_id) => result.edge_ids.push(edge_id),
                    Err(Error::DataIntegrity(detail)) => {
                        result.errors.push(format!("edge skipped: {detail}"));
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        if self.flags.contradictions_enabled && !analysis.contradictions.is_empty() {
            self.store
                .append_contradictions(memory_id, &analysis.contradictions)
                .await?;
        }

        if self.flags.implicate_refresh_enabled {
            let mut touched: Vec<&String> = result
                .concept_entity_ids
                .iter()
                .chain(result.frame_entity_ids.iter())
                .collect();
            touched.sort();
            touched.dedup();
            for entity_id in touched {
                self.jobs
                    .enqueue(Job::new(IMPLICATE_REFRESH, vec![entity_id.clone()]))
                    .await?;
                result.jobs_enqueued += 1;
            }
        }

        tracing::debug!(
            memory_id,
            file_id,
            chunk_idx,
            concepts = result.concept_entity_ids.len(),
            frames = result.frame_entity_ids.len(),
            edges = result.edge_ids.len(),
            jobs = result.jobs_enqueued,
            "analysis committed"
        );
        Ok(result)
    }
}

/// Guarded memory write: the upsert entry point every ingest path uses.
pub async fn store_memory_guarded(store: &dyn KnowledgeStore, memory: Memory) -> Result<String> {
    let as_value =
        serde_json::to_value(&memory).map_err(|e| Error::other(format!("serialize memory: {e}")))?;
    guard::forbid_external_persistence(std::slice::from_ref(&as_value), "memory", true)?;
    store.upsert_memory(memory).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::analyze::{ConceptSuggestion, Frame, FrameKind, Predicate};
    use crate::memory::{ContradictionTriple, Provenance};
    use crate::store::in_memory::{MemoryJobQueue, MemoryKnowledgeStore};

    fn flags(contradictions: bool, refresh: bool) -> IngestFlags {
        IngestFlags {
            analysis_enabled: true,
            contradictions_enabled: contradictions,
            implicate_refresh_enabled: refresh,
        }
    }

    /// The two-concept one-frame analysis used across the idempotence tests.
    fn sample_analysis() -> AnalysisResult {
        AnalysisResult {
            predicates: vec![Predicate {
                verb: "advances".to_string(),
                polarity: Polarity::Positive,
                args: vec![],
            }],
            frames: vec![Frame {
                local_id: "frame-1".to_string(),
                kind: FrameKind::Claim,
                predicate_index: Some(0),
                concepts: vec!["Machine Learning".to_string()],
            }],
            concepts: vec![
                ConceptSuggestion {
                    name: "Machine Learning".to_string(),
                    salience: 0.9,
                },
                ConceptSuggestion {
                    name: "Neural Networks".to_string(),
                    salience: 0.8,
                },
            ],
            contradictions: vec![],
            tokens_consumed: 12,
            truncated: false,
        }
    }

    fn engine(
        store: &Arc<MemoryKnowledgeStore>,
        jobs: &Arc<MemoryJobQueue>,
        flags: IngestFlags,
    ) -> CommitEngine {
        CommitEngine::new(
            Arc::clone(store) as Arc<dyn KnowledgeStore>,
            Arc::clone(jobs) as Arc<dyn JobQueue>,
            flags,
        )
    }

    async fn seed_memory(store: &MemoryKnowledgeStore) -> String {
        store
            .upsert_memory(Memory::new("chunk text", 0, vec![0.1]))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_creates_entities_and_polarity_edges() {
        let store = Arc::new(MemoryKnowledgeStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let memory_id = seed_memory(&store).await;
        let engine = engine(&store, &jobs, flags(false, false));

        let result = engine
            .commit_analysis(&sample_analysis(), &memory_id, "file-F", 7, None)
            .await
            .unwrap();

        assert_eq!(result.concept_entity_ids.len(), 2);
        assert_eq!(result.frame_entity_ids.len(), 1);
        assert_eq!(result.edge_ids.len(), 1);
        assert!(result.errors.is_empty());

        // Positive polarity maps the frame->concept link to `supports`.
        let edges = store
            .edges_from(&result.frame_entity_ids[0], &[Relation::Supports])
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].metadata["source_verb"], "advances");
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let store = Arc::new(MemoryKnowledgeStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let memory_id = seed_memory(&store).await;
        let engine = engine(&store, &jobs, flags(false, false));

        let first = engine
            .commit_analysis(&sample_analysis(), &memory_id, "file-F", 7, None)
            .await
            .unwrap();
        let entities_after_first = store.entity_count();
        let edges_after_first = store.edge_count();

        let second = engine
            .commit_analysis(&sample_analysis(), &memory_id, "file-F", 7, None)
            .await
            .unwrap();

        assert_eq!(first.concept_entity_ids, second.concept_entity_ids);
        assert_eq!(first.frame_entity_ids, second.frame_entity_ids);
        assert_eq!(first.edge_ids, second.edge_ids);
        assert_eq!(store.entity_count(), entities_after_first);
        assert_eq!(store.edge_count(), edges_after_first);
    }

    #[tokio::test]
    async fn test_different_chunks_get_distinct_frames() {
        let store = Arc::new(MemoryKnowledgeStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let memory_id = seed_memory(&store).await;
        let engine = engine(&store, &jobs, flags(false, false));

        let a = engine
            .commit_analysis(&sample_analysis(), &memory_id, "file-F", 7, None)
            .await
            .unwrap();
        let b = engine
            .commit_analysis(&sample_analysis(), &memory_id, "file-F", 8, None)
            .await
            .unwrap();

        assert_ne!(a.frame_entity_ids, b.frame_entity_ids);
        // Concepts are shared across chunks.
        assert_eq!(a.concept_entity_ids, b.concept_entity_ids);
    }

    #[tokio::test]
    async fn test_external_item_blocks_whole_commit() {
        let store = Arc::new(MemoryKnowledgeStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let memory_id = seed_memory(&store).await;
        let engine = engine(&store, &jobs, flags(false, false));

        let source_items = vec![
            json!({"text": "internal item"}),
            json!({"text": "external item", "provenance": {"url": "https://example.com/x"}}),
        ];
        let err = engine
            .commit_analysis(&sample_analysis(), &memory_id, "file-F", 7, Some(&source_items))
            .await
            .unwrap_err();

        match err {
            Error::ExternalPersistence { count, urls, .. } => {
                assert_eq!(count, 1);
                assert_eq!(urls, vec!["https://example.com/x".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Nothing was written for either item.
        assert_eq!(store.entity_count(), 0);
        assert_eq!(store.edge_count(), 0);
    }

    #[tokio::test]
    async fn test_truncated_analysis_rejected() {
        let store = Arc::new(MemoryKnowledgeStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let memory_id = seed_memory(&store).await;
        let engine = engine(&store, &jobs, flags(false, false));

        let analysis = AnalysisResult {
            truncated: true,
            ..sample_analysis()
        };
        let err = engine
            .commit_analysis(&analysis, &memory_id, "file-F", 7, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_contradictions_appended_when_enabled() {
        let store = Arc::new(MemoryKnowledgeStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let memory_id = seed_memory(&store).await;

        let triple = ContradictionTriple {
            subject: "accuracy".to_string(),
            claim_a_source: "m-a".to_string(),
            claim_b_source: "m-b".to_string(),
        };
        let analysis = AnalysisResult {
            contradictions: vec![triple.clone()],
            ..sample_analysis()
        };

        // Disabled: nothing lands on the row.
        let engine_off = engine(&store, &jobs, flags(false, false));
        engine_off
            .commit_analysis(&analysis, &memory_id, "file-F", 7, None)
            .await
            .unwrap();
        assert!(store.get_memory(&memory_id).await.unwrap().unwrap().contradictions.is_empty());

        // Enabled: appended once, repeat commits stay a set.
        let engine_on = engine(&store, &jobs, flags(true, false));
        engine_on
            .commit_analysis(&analysis, &memory_id, "file-F", 7, None)
            .await
            .unwrap();
        engine_on
            .commit_analysis(&analysis, &memory_id, "file-F", 7, None)
            .await
            .unwrap();
        let memory = store.get_memory(&memory_id).await.unwrap().unwrap();
        assert_eq!(memory.contradictions, vec![triple]);
    }

    #[tokio::test]
    async fn test_refresh_jobs_enqueued_per_distinct_entity() {
        let store = Arc::new(MemoryKnowledgeStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let memory_id = seed_memory(&store).await;
        let engine = engine(&store, &jobs, flags(false, true));

        let result = engine
            .commit_analysis(&sample_analysis(), &memory_id, "file-F", 7, None)
            .await
            .unwrap();

        // Two concepts plus one frame.
        assert_eq!(result.jobs_enqueued, 3);
        let queued = jobs.snapshot();
        assert_eq!(queued.len(), 3);
        assert!(queued.iter().all(|j| j.kind == IMPLICATE_REFRESH));
    }

    #[tokio::test]
    async fn test_store_memory_guarded_blocks_external() {
        let store = MemoryKnowledgeStore::new();
        let clean = Memory::new("fine", 0, vec![0.1]);
        assert!(store_memory_guarded(&store, clean).await.is_ok());

        let mut marked = Memory::new("external", 0, vec![0.1]);
        marked.provenance = Provenance {
            origin: "fetch".to_string(),
            author_id: "a-1".to_string(),
            source_upload_id: "u-1".to_string(),
            url: Some("https://example.com/page".to_string()),
        };
        let err = store_memory_guarded(&store, marked).await.unwrap_err();
        assert!(matches!(err, Error::ExternalPersistence { .. }));
    }
}
