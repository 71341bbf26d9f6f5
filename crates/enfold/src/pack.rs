//! Token-budgeted context packing.
//!
//! Assembles the final evidence set under a token budget: score-descending
//! greedy admission with a stable-id tie break, a light diversity rule that
//! avoids long runs from a single source, and a deterministic order key so
//! identical inputs always pack identically. Ties never break on map
//! iteration order.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiktoken_rs::CoreBPE;

use crate::metrics::MetricsRegistry;
use crate::select::Evidence;

/// Packing policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PackPolicy {
    /// Total token budget for the packed context.
    pub token_budget: usize,
    /// Tokens of acceptable underfill when the diversity rule skips an item.
    pub underfill_slack: usize,
}

impl Default for PackPolicy {
    fn default() -> Self {
        Self {
            token_budget: 2048,
            underfill_slack: 64,
        }
    }
}

/// Packed output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackedContext {
    pub items: Vec<Evidence>,
    pub total_tokens: usize,
    /// Deterministic key over the admitted set; identical inputs yield an
    /// identical key and order.
    pub order_key: String,
    pub skipped_for_diversity: usize,
}

/// Estimate the token count of `text`.
///
/// Uses the cl100k encoding; falls back to a chars/4 heuristic when the
/// encoder cannot be constructed.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    match ENCODER.get_or_init(|| tiktoken_rs::cl100k_base().ok()) {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.len().div_ceil(4),
    }
}

/// Source identity used by the diversity rule.
fn source_of(item: &Evidence) -> String {
    if let Value::Object(provenance) = &item.provenance {
        for key in ["source_upload_id", "origin"] {
            if let Some(source) = provenance.get(key).and_then(Value::as_str) {
                if !source.is_empty() {
                    return source.to_string();
                }
            }
        }
    }
    item.id.clone()
}

/// The token-budgeted packer.
pub struct ContextPacker {
    policy: PackPolicy,
    metrics: Arc<MetricsRegistry>,
}

impl ContextPacker {
    #[must_use]
    pub fn new(policy: PackPolicy, metrics: Arc<MetricsRegistry>) -> Self {
        Self { policy, metrics }
    }

    /// Pack `evidence` into the token budget.
    #[must_use]
    pub fn pack(&self, evidence: &[Evidence]) -> PackedContext {
        let start = Instant::now();

        let mut sorted: Vec<&Evidence> = evidence.iter().collect();
        sorted.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        let token_counts: Vec<usize> = sorted.iter().map(|e| estimate_tokens(&e.text)).collect();

        let budget = self.policy.token_budget;
        let mut items: Vec<Evidence> = Vec::new();
        let mut used = 0usize;
        let mut skipped_for_diversity = 0usize;
        let mut last_source: Option<String> = None;
        let mut checkpoint_done_at = 0usize;

        let mut i = 0;
        while i < sorted.len() {
            let item = sorted[i];
            let tokens = token_counts[i];
            if used + tokens > budget {
                break;
            }

            // After every third admission, skip one same-source item unless
            // doing so would leave the budget underfilled beyond the slack.
            let at_checkpoint =
                !items.is_empty() && items.len() % 3 == 0 && checkpoint_done_at != items.len();
            if at_checkpoint {
                checkpoint_done_at = items.len();
                let same_source = last_source.as_deref() == Some(source_of(item).as_str());
                if same_source {
                    let remaining_supply: usize = token_counts[i + 1..].iter().sum();
                    let remaining_budget = budget - used;
                    if remaining_supply + self.policy.underfill_slack >= remaining_budget {
                        skipped_for_diversity += 1;
                        i += 1;
                        continue;
                    }
                }
            }

            used += tokens;
            last_source = Some(source_of(item));
            items.push(item.clone());
            i += 1;
        }

        let order_key = items
            .iter()
            .enumerate()
            .map(|(idx, e)| format!("{idx:03}:{}", e.id))
            .collect::<Vec<_>>()
            .join("|");

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.observe_histogram("packing_ms", elapsed_ms, &[]);

        PackedContext {
            items,
            total_tokens: used,
            order_key,
            skipped_for_diversity,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::store::SourceLayer;

    fn evidence(id: &str, score: f32, text: &str, source: &str) -> Evidence {
        Evidence {
            id: id.to_string(),
            text: text.to_string(),
            score,
            source_layer: SourceLayer::Explicate,
            provenance: json!({ "origin": "upload", "source_upload_id": source }),
            role_view_level: 0,
            via_graph: false,
            entity_id: None,
        }
    }

    fn packer(budget: usize) -> ContextPacker {
        ContextPacker::new(
            PackPolicy {
                token_budget: budget,
                underfill_slack: 2,
            },
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[test]
    fn test_orders_by_score_then_id() {
        let items = vec![
            evidence("b", 0.5, "x", "s1"),
            evidence("a", 0.5, "x", "s2"),
            evidence("c", 0.9, "x", "s3"),
        ];
        let packed = packer(1000).pack(&items);
        let ids: Vec<&str> = packed.items.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_budget_saturation_boundary() {
        // "alpha beta gamma" style payloads with known token counts.
        let text = "one two three four";
        let per_item = estimate_tokens(text);
        assert!(per_item > 0);

        let items = vec![
            evidence("a", 0.9, text, "s1"),
            evidence("b", 0.8, text, "s2"),
            evidence("c", 0.7, text, "s3"),
        ];
        // Exactly two items fit; the third does not.
        let packed = packer(per_item * 2).pack(&items);
        assert_eq!(packed.items.len(), 2);
        assert_eq!(packed.total_tokens, per_item * 2);
        let ids: Vec<&str> = packed.items.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_diversity_skip_after_third_admission() {
        let text = "one two three four five six";
        let per_item = estimate_tokens(text);
        let items = vec![
            evidence("a", 0.9, text, "s1"),
            evidence("b", 0.8, text, "s1"),
            evidence("c", 0.7, text, "same"),
            evidence("d", 0.6, text, "same"),
            evidence("e", 0.5, text, "s2"),
        ];
        // After the third admission (c, source "same"), d shares its source
        // and e can still fill the budget, so d is skipped once.
        let packed = packer(per_item * 4).pack(&items);
        assert_eq!(packed.skipped_for_diversity, 1);
        let ids: Vec<&str> = packed.items.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "e"]);
        assert_eq!(packed.total_tokens, per_item * 4);
    }

    #[test]
    fn test_diversity_skip_suppressed_when_budget_would_underfill() {
        let text = "one two three four five six";
        let per_item = estimate_tokens(text);
        assert!(per_item > 2, "text must cost more than the slack");
        let items = vec![
            evidence("a", 0.9, text, "s1"),
            evidence("b", 0.8, text, "s2"),
            evidence("c", 0.7, text, "same"),
            evidence("d", 0.6, text, "same"),
        ];
        // d is the last remaining supply; skipping it would leave a whole
        // item of budget unfilled, beyond the slack, so d is admitted.
        let packed = packer(per_item * 4).pack(&items);
        assert_eq!(packed.skipped_for_diversity, 0);
        assert_eq!(packed.items.len(), 4);
    }

    #[test]
    fn test_order_key_is_deterministic() {
        let items = vec![
            evidence("a", 0.9, "alpha", "s1"),
            evidence("b", 0.8, "beta", "s2"),
        ];
        let first = packer(1000).pack(&items);
        let second = packer(1000).pack(&items);
        assert_eq!(first.order_key, second.order_key);
        assert_eq!(first.order_key, "000:a|001:b");
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let mut items = vec![
            evidence("a", 0.9, "alpha", "s1"),
            evidence("b", 0.8, "beta", "s2"),
            evidence("c", 0.7, "gamma", "s3"),
        ];
        let forward = packer(1000).pack(&items);
        items.reverse();
        let backward = packer(1000).pack(&items);
        assert_eq!(forward.order_key, backward.order_key);
    }

    #[test]
    fn test_empty_input() {
        let packed = packer(1000).pack(&[]);
        assert!(packed.items.is_empty());
        assert_eq!(packed.total_tokens, 0);
        assert_eq!(packed.order_key, "");
    }

    #[test]
    fn test_records_packing_histogram() {
        let metrics = Arc::new(MetricsRegistry::new());
        let packer = ContextPacker::new(PackPolicy::default(), Arc::clone(&metrics));
        packer.pack(&[evidence("a", 0.9, "alpha", "s1")]);
        assert!(metrics.get_histogram_stats("packing_ms", &[]).is_some());
    }
}
