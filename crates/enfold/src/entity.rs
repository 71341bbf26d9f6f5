//! Implicate-layer entities and typed edges.
//!
//! Concepts are canonical named terms; frames are predicate/event structures
//! bound to a specific chunk. Both get stable names so that re-running the
//! same ingest upserts instead of duplicating.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Kind of an implicate-layer entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A canonical abstract term.
    Concept,
    /// A discovered frame bound to a chunk.
    Artifact,
}

impl EntityType {
    /// Stable lowercase tag.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            EntityType::Concept => "concept",
            EntityType::Artifact => "artifact",
        }
    }
}

/// Typed relation between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    EvidenceOf,
    Supports,
    Contradicts,
    Mentions,
    References,
    AffiliatedWith,
}

impl Relation {
    /// Stable snake_case tag.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Relation::EvidenceOf => "evidence_of",
            Relation::Supports => "supports",
            Relation::Contradicts => "contradicts",
            Relation::Mentions => "mentions",
            Relation::References => "references",
            Relation::AffiliatedWith => "affiliated_with",
        }
    }
}

/// An implicate-layer entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    /// Canonical name; unique together with `entity_type`.
    pub name: String,
    pub entity_type: EntityType,
    pub role_view_level: u8,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// A typed directed edge; unique by `(from_id, to_id, relation)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEdge {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    pub relation: Relation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f32>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Slug a concept name into its stable entity name: lowercase, runs of
/// non-alphanumerics collapsed to single dashes.
#[must_use]
pub fn concept_name(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-');
    format!("concept:{slug}")
}

/// Stable name for a frame discovered in a specific chunk.
#[must_use]
pub fn frame_name(file_id: &str, chunk_idx: usize, frame_local_id: &str) -> String {
    format!("frame:{file_id}:{chunk_idx}:{frame_local_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concept_name_slugging() {
        assert_eq!(concept_name("Machine Learning"), "concept:machine-learning");
        assert_eq!(concept_name("  C++ / Rust  "), "concept:c-rust");
        assert_eq!(concept_name("Neural Networks"), "concept:neural-networks");
    }

    #[test]
    fn test_concept_name_is_stable() {
        assert_eq!(concept_name("Graph Theory"), concept_name("Graph Theory"));
        assert_eq!(concept_name("graph theory"), concept_name("Graph  Theory"));
    }

    #[test]
    fn test_frame_name_shape() {
        assert_eq!(frame_name("file-9", 7, "frame-1"), "frame:file-9:7:frame-1");
    }

    #[test]
    fn test_relation_tags() {
        assert_eq!(Relation::EvidenceOf.name(), "evidence_of");
        assert_eq!(Relation::AffiliatedWith.name(), "affiliated_with");
    }
}
