//! Graph expansion over the implicate layer.
//!
//! One breadth-first hop from each implicate hit's entity along
//! `evidence_of` / `supports` / `contradicts` edges, under a wall-clock
//! budget. Neighbors resolve to their anchored memories, pass the
//! visibility filter, and join the evidence set tagged `via_graph` with a
//! decayed score. Dangling edges are skipped without error; expansion never
//! fails the request.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::Relation;
use crate::memory::ContradictionTriple;
use crate::metrics::MetricsRegistry;
use crate::rbac;
use crate::select::Evidence;
use crate::store::{KnowledgeStore, SourceLayer};

/// Score multiplier applied per traversed edge.
const GRAPH_SCORE_DECAY: f32 = 0.8;

/// Relations the expander follows.
const EXPANDED_RELATIONS: [Relation; 3] = [
    Relation::EvidenceOf,
    Relation::Supports,
    Relation::Contradicts,
];

/// Output of one expansion pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpansionResult {
    /// Via-graph evidence to append to the working set.
    pub added: Vec<Evidence>,
    /// Contradictions whose endpoints were both visible.
    pub contradictions: Vec<ContradictionTriple>,
    /// The budget ran out before all hits were expanded.
    pub truncated: bool,
    pub warnings: Vec<String>,
}

/// Bounded one-hop neighborhood expander.
pub struct GraphExpander {
    store: Arc<dyn KnowledgeStore>,
    metrics: Arc<MetricsRegistry>,
}

impl GraphExpander {
    #[must_use]
    pub fn new(store: Arc<dyn KnowledgeStore>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { store, metrics }
    }

    /// Expand `evidence` within `budget_ms`.
    pub async fn expand<S: AsRef<str>>(
        &self,
        evidence: &[Evidence],
        roles: &[S],
        budget_ms: u64,
    ) -> ExpansionResult {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(budget_ms);
        let role_rank = rbac::max_level(roles);

        let mut seen: HashSet<String> = evidence.iter().map(|e| e.id.clone()).collect();
        let mut result = ExpansionResult::default();

        'hits: for item in evidence
            .iter()
            .filter(|e| e.source_layer == SourceLayer::Implicate)
        {
            let Some(entity_id) = item.entity_id.as_deref() else {
                continue;
            };
            if Instant::now() >= deadline {
                result.truncated = true;
                break;
            }

            let edges = match self.store.edges_from(entity_id, &EXPANDED_RELATIONS).await {
                Ok(edges) => edges,
                Err(err) => {
                    result
                        .warnings
                        .push(format!("edge enumeration failed for {entity_id}: {err}"));
                    continue;
                }
            };

            for edge in edges {
                if Instant::now() >= deadline {
                    result.truncated = true;
                    break 'hits;
                }

                // Dangling endpoints are skipped without error.
                let Ok(Some(neighbor)) = self.store.get_entity(&edge.to_id).await else {
                    continue;
                };
                if neighbor.role_view_level > role_rank {
                    continue;
                }

                let memory = match self.store.memory_for_entity(&neighbor.id).await {
                    Ok(memory) => memory,
                    Err(_) => None,
                };

                if edge.relation == Relation::Contradicts {
                    let subject = edge
                        .metadata
                        .get("subject")
                        .and_then(Value::as_str)
                        .unwrap_or(&neighbor.name)
                        .to_string();
                    result.contradictions.push(ContradictionTriple {
                        subject,
                        claim_a_source: item.id.clone(),
                        claim_b_source: memory
                            .as_ref()
                            .map_or_else(|| neighbor.id.clone(), |m| m.id.clone()),
                    });
                }

                let Some(memory) = memory else {
                    continue;
                };
                if memory.role_view_level > role_rank || !seen.insert(memory.id.clone()) {
                    continue;
                }

                let decay = GRAPH_SCORE_DECAY * edge.weight.unwrap_or(1.0);
                result.added.push(Evidence {
                    id: memory.id.clone(),
                    text: memory.text.clone(),
                    score: item.score * decay,
                    source_layer: SourceLayer::Implicate,
                    provenance: serde_json::to_value(&memory.provenance)
                        .unwrap_or(Value::Null),
                    role_view_level: memory.role_view_level,
                    via_graph: true,
                    entity_id: Some(neighbor.id.clone()),
                });
            }
        }

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .observe_histogram("graph_expand_ms", elapsed_ms, &[]);
        result
    }
}
