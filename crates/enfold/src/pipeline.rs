//! Query orchestration.
//!
//! Composes the request path end to end: RBAC gate, dual selection, graph
//! expansion, context packing, answer generation (injected), optional
//! review, and final redaction. Produces the response envelope and the
//! per-stage latency histograms the debug endpoints and CI gates read.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::PerformanceConfig;
use crate::error::Result;
use crate::expand::GraphExpander;
use crate::metrics::MetricsRegistry;
use crate::pack::ContextPacker;
use crate::rbac::{self, Capability};
use crate::redact;
use crate::review::Reviewer;
use crate::select::{DualSelector, Evidence, SelectOptions};

/// External answer generation over the packed evidence.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, query: &str, context: &[Evidence]) -> Result<String>;
}

/// One line of the process trace.
fn trace_step(step: &str, duration_ms: f64, status: &str) -> Value {
    json!({ "step": step, "duration_ms": duration_ms, "status": status })
}

/// The full query path.
pub struct QueryPipeline {
    selector: DualSelector,
    expander: GraphExpander,
    packer: ContextPacker,
    reviewer: Reviewer,
    generator: Arc<dyn AnswerGenerator>,
    config: Arc<PerformanceConfig>,
    metrics: Arc<MetricsRegistry>,
}

impl QueryPipeline {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        selector: DualSelector,
        expander: GraphExpander,
        packer: ContextPacker,
        reviewer: Reviewer,
        generator: Arc<dyn AnswerGenerator>,
        config: Arc<PerformanceConfig>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            selector,
            expander,
            packer,
            reviewer,
            generator,
            config,
            metrics,
        }
    }

    /// Answer `query` for the caller described by `opts.roles`.
    ///
    /// Returns the redacted response envelope. Only invalid arguments (and
    /// a caller without read access) surface as errors; every backend
    /// failure downstream is annotated into the envelope instead.
    pub async fn handle_query(
        &self,
        query: &str,
        embedding: &[f32],
        opts: &SelectOptions,
    ) -> Result<Value> {
        rbac::require_capability(&opts.roles, Capability::ReadPublic)?;

        let total_start = Instant::now();
        let mut trace: Vec<Value> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        // Selection.
        let selection = self.selector.select(query, embedding, opts).await?;
        let retrieval_ms = selection.timings.total_wall_time_ms;
        trace.push(trace_step(
            "select",
            retrieval_ms,
            if selection.evidence.is_empty() { "empty" } else { "ok" },
        ));
        warnings.extend(selection.warnings.iter().cloned());

        // Graph expansion.
        let expand_start = Instant::now();
        let expansion = self
            .expander
            .expand(&selection.evidence, &opts.roles, self.config.graph_timeout_ms)
            .await;
        let graph_ms = expand_start.elapsed().as_secs_f64() * 1000.0;
        trace.push(trace_step(
            "expand",
            graph_ms,
            if expansion.truncated { "truncated" } else { "ok" },
        ));
        warnings.extend(expansion.warnings.iter().cloned());

        let mut evidence = selection.evidence.clone();
        evidence.extend(expansion.added.iter().cloned());

        // Packing.
        let pack_start = Instant::now();
        let packed = self.packer.pack(&evidence);
        let packing_ms = pack_start.elapsed().as_secs_f64() * 1000.0;
        trace.push(trace_step("pack", packing_ms, "ok"));

        // Answer generation is an external collaborator; its failure
        // degrades the response rather than failing the request.
        let generate_start = Instant::now();
        let answer = match self.generator.generate(query, &packed.items).await {
            Ok(answer) => {
                trace.push(trace_step(
                    "generate",
                    generate_start.elapsed().as_secs_f64() * 1000.0,
                    "ok",
                ));
                answer
            }
            Err(err) => {
                warnings.push(format!("Answer generation failed: {err}"));
                trace.push(trace_step(
                    "generate",
                    generate_start.elapsed().as_secs_f64() * 1000.0,
                    "failed",
                ));
                String::new()
            }
        };

        // Review.
        let review = self.reviewer.review_answer(&answer, &packed.items, query).await;
        let reviewer_ms = review.latency_ms;
        trace.push(trace_step(
            "review",
            reviewer_ms,
            if review.skipped { "skipped" } else { "ok" },
        ));

        let total_ms = total_start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.observe_histogram("chat_total_ms", total_ms, &[]);
        trace.push(trace_step("redact", 0.0, "ok"));

        let envelope = json!({
            "answer": answer,
            "context": packed.items,
            "contradictions": expansion.contradictions,
            "process_trace_summary": trace,
            "fallback": selection.fallback,
            "timings": {
                "retrieval_ms": retrieval_ms,
                "graph_ms": graph_ms,
                "packing_ms": packing_ms,
                "reviewer_ms": reviewer_ms,
                "total_ms": total_ms,
            },
            "warnings": warnings,
            "review": review,
            "metadata": {
                "strategy": selection.metadata.strategy,
                "filtered_count": selection.metadata.filtered_count,
                "merged_count": selection.metadata.merged_count,
                "packed_tokens": packed.total_tokens,
                "order_key": packed.order_key,
            },
        });

        Ok(redact::redact_response(&envelope, &opts.roles))
    }
}
