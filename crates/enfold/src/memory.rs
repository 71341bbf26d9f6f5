//! Stored chunks ("memories") and their provenance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Where a memory came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Origin tag (e.g. "upload", "import").
    pub origin: String,
    /// Author account id.
    pub author_id: String,
    /// The upload the chunk was split from.
    pub source_upload_id: String,
    /// External URL marker. Always `None` on persisted memories; the
    /// external-persist guard rejects anything carrying one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One detected contradiction between two sourced claims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContradictionTriple {
    /// What the claims disagree about.
    pub subject: String,
    /// Source id of the first claim.
    pub claim_a_source: String,
    /// Source id of the second claim.
    pub claim_b_source: String,
}

/// A chunk of ingested text with its embedding and visibility level.
///
/// Memories are created on ingest and never mutated afterwards except to
/// append contradictions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Type tag (e.g. "chunk", "note").
    pub memory_type: String,
    /// Visibility level: 0 general, 1 pro/scholars, 2 analytics/ops.
    pub role_view_level: u8,
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contradictions: Vec<ContradictionTriple>,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Memory {
    /// New memory with a generated id and the current timestamp.
    #[must_use]
    pub fn new(text: impl Into<String>, role_view_level: u8, embedding: Vec<f32>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            title: None,
            memory_type: "chunk".to_string(),
            role_view_level,
            provenance: Provenance::default(),
            contradictions: Vec::new(),
            embedding,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Attach provenance.
    #[must_use]
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// Replace the generated id (ingest paths carry their own ids).
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_memory_has_no_external_marker() {
        let memory = Memory::new("the sky is blue", 0, vec![0.1, 0.2]);
        assert!(memory.provenance.url.is_none());
        assert!(memory.contradictions.is_empty());
    }

    #[test]
    fn test_contradiction_triple_identity() {
        let a = ContradictionTriple {
            subject: "boiling point".to_string(),
            claim_a_source: "m-1".to_string(),
            claim_b_source: "m-2".to_string(),
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
