//! Per-chunk ingest analysis.
//!
//! A staged pipeline over one chunk of text: tokenize, extract predicates,
//! assemble frames, suggest concepts, detect contradictions. Every stage
//! goes through the injected [`NlpCapability`]; the core holds no language
//! model specifics. The whole pipeline runs under a single wall-clock
//! deadline (`max_ms_per_chunk`): when it expires, the analyzer returns
//! whatever it has accumulated tagged `truncated`, and callers must skip
//! commit for that chunk.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AnalysisLimits, IngestFlags};
use crate::error::{Error, Result};
use crate::memory::ContradictionTriple;
use crate::metrics::MetricsRegistry;

/// Predicate polarity; drives the support/contradict edge mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Positive,
    Negative,
}

/// One argument slot of an extracted predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateArg {
    pub role: String,
    pub text: String,
}

/// A verb with its argument roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    pub verb: String,
    pub polarity: Polarity,
    #[serde(default)]
    pub args: Vec<PredicateArg>,
}

/// Frame kind discovered by analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Claim,
    Evidence,
    Measurement,
    Hypothesis,
}

/// A predicate/event structure bound to the chunk under analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Chunk-local id, e.g. `frame-1`; feeds the stable entity name.
    pub local_id: String,
    pub kind: FrameKind,
    /// Index into the predicate list, when the frame wraps one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicate_index: Option<usize>,
    /// Names of concepts this frame references.
    #[serde(default)]
    pub concepts: Vec<String>,
}

/// A concept surfaced by analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptSuggestion {
    pub name: String,
    pub salience: f32,
}

/// Everything extracted from one chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub predicates: Vec<Predicate>,
    pub frames: Vec<Frame>,
    pub concepts: Vec<ConceptSuggestion>,
    pub contradictions: Vec<ContradictionTriple>,
    pub tokens_consumed: usize,
    /// The chunk deadline expired before the pipeline finished.
    pub truncated: bool,
}

/// Identity of the chunk being analyzed.
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub memory_id: String,
    pub file_id: String,
    pub chunk_idx: usize,
}

/// The injected NLP backend.
#[async_trait]
pub trait NlpCapability: Send + Sync {
    async fn tokenize(&self, text: &str) -> Result<Vec<String>>;

    async fn extract_predicates(&self, tokens: &[String], max: usize) -> Result<Vec<Predicate>>;

    async fn assemble_frames(
        &self,
        predicates: &[Predicate],
        ctx: &ChunkContext,
        max: usize,
    ) -> Result<Vec<Frame>>;

    async fn suggest_concepts(
        &self,
        text: &str,
        frames: &[Frame],
        max: usize,
    ) -> Result<Vec<ConceptSuggestion>>;

    async fn detect_contradictions(
        &self,
        frames: &[Frame],
        ctx: &ChunkContext,
    ) -> Result<Vec<ContradictionTriple>>;
}

/// The per-chunk analyzer.
pub struct ChunkAnalyzer {
    nlp: Arc<dyn NlpCapability>,
    limits: AnalysisLimits,
    flags: IngestFlags,
    metrics: Arc<MetricsRegistry>,
}

impl ChunkAnalyzer {
    #[must_use]
    pub fn new(
        nlp: Arc<dyn NlpCapability>,
        limits: AnalysisLimits,
        flags: IngestFlags,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            nlp,
            limits,
            flags,
            metrics,
        }
    }

    /// Analyze one chunk under the per-chunk deadline.
    pub async fn analyze_chunk(&self, text: &str, ctx: &ChunkContext) -> Result<AnalysisResult> {
        if text.trim().is_empty() {
            return Err(Error::invalid_argument("chunk text must be non-empty"));
        }

        let start = Instant::now();
        let deadline = start + Duration::from_millis(self.limits.max_ms_per_chunk);
        let mut result = AnalysisResult::default();

        'pipeline: {
            let Some(tokens) = run_stage(deadline, self.nlp.tokenize(text)).await? else {
                result.truncated = true;
                break 'pipeline;
            };
            result.tokens_consumed = tokens.len();

            let Some(predicates) = run_stage(
                deadline,
                self.nlp.extract_predicates(&tokens, self.limits.max_verbs),
            )
            .await?
            else {
                result.truncated = true;
                break 'pipeline;
            };
            result.predicates = predicates;
            result.predicates.truncate(self.limits.max_verbs);

            let Some(frames) = run_stage(
                deadline,
                self.nlp
                    .assemble_frames(&result.predicates, ctx, self.limits.max_frames),
            )
            .await?
            else {
                result.truncated = true;
                break 'pipeline;
            };
            result.frames = frames;
            result.frames.truncate(self.limits.max_frames);

            let Some(concepts) = run_stage(
                deadline,
                self.nlp
                    .suggest_concepts(text, &result.frames, self.limits.max_concepts),
            )
            .await?
            else {
                result.truncated = true;
                break 'pipeline;
            };
            result.concepts = concepts;
            result.concepts.truncate(self.limits.max_concepts);

            if self.flags.contradictions_enabled {
                let Some(contradictions) = run_stage(
                    deadline,
                    self.nlp.detect_contradictions(&result.frames, ctx),
                )
                .await?
                else {
                    result.truncated = true;
                    break 'pipeline;
                };
                result.contradictions = contradictions;
            }
        }

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .observe_histogram("analyze_chunk_ms", elapsed_ms, &[]);
        if result.truncated {
            self.metrics
                .increment_counter("analyze_chunk_truncated_total", &[]);
            tracing::warn!(
                file_id = %ctx.file_id,
                chunk_idx = ctx.chunk_idx,
                elapsed_ms,
                "chunk analysis truncated by deadline"
            );
        }
        Ok(result)
    }
}

/// Run one stage against the shared deadline. `Ok(None)` means the deadline
/// expired; the stage's in-flight work is dropped.
async fn run_stage<T>(
    deadline: Instant,
    stage: impl std::future::Future<Output = Result<T>>,
) -> Result<Option<T>> {
    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
        return Ok(None);
    };
    match tokio::time::timeout(remaining, stage).await {
        Ok(result) => result.map(Some),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// NLP backend with configurable per-stage latency and rich output.
    struct ScriptedNlp {
        stage_delay: Duration,
        verbs: usize,
        concepts: usize,
    }

    impl ScriptedNlp {
        fn fast() -> Self {
            Self {
                stage_delay: Duration::ZERO,
                verbs: 3,
                concepts: 2,
            }
        }
    }

    #[async_trait]
    impl NlpCapability for ScriptedNlp {
        async fn tokenize(&self, text: &str) -> Result<Vec<String>> {
            tokio::time::sleep(self.stage_delay).await;
            Ok(text.split_whitespace().map(str::to_string).collect())
        }

        async fn extract_predicates(
            &self,
            _tokens: &[String],
            max: usize,
        ) -> Result<Vec<Predicate>> {
            tokio::time::sleep(self.stage_delay).await;
            Ok((0..self.verbs.min(max))
                .map(|i| Predicate {
                    verb: format!("verb-{i}"),
                    polarity: if i % 2 == 0 {
                        Polarity::Positive
                    } else {
                        Polarity::Negative
                    },
                    args: vec![PredicateArg {
                        role: "subject".to_string(),
                        text: format!("arg-{i}"),
                    }],
                })
                .collect())
        }

        async fn assemble_frames(
            &self,
            predicates: &[Predicate],
            _ctx: &ChunkContext,
            max: usize,
        ) -> Result<Vec<Frame>> {
            tokio::time::sleep(self.stage_delay).await;
            Ok(predicates
                .iter()
                .take(max)
                .enumerate()
                .map(|(i, _)| Frame {
                    local_id: format!("frame-{}", i + 1),
                    kind: FrameKind::Claim,
                    predicate_index: Some(i),
                    concepts: vec!["Machine Learning".to_string()],
                })
                .collect())
        }

        async fn suggest_concepts(
            &self,
            _text: &str,
            _frames: &[Frame],
            max: usize,
        ) -> Result<Vec<ConceptSuggestion>> {
            tokio::time::sleep(self.stage_delay).await;
            Ok((0..self.concepts.min(max))
                .map(|i| ConceptSuggestion {
                    name: format!("Concept {i}"),
                    salience: 1.0 - i as f32 * 0.1,
                })
                .collect())
        }

        async fn detect_contradictions(
            &self,
            _frames: &[Frame],
            ctx: &ChunkContext,
        ) -> Result<Vec<ContradictionTriple>> {
            tokio::time::sleep(self.stage_delay).await;
            Ok(vec![ContradictionTriple {
                subject: "test subject".to_string(),
                claim_a_source: ctx.memory_id.clone(),
                claim_b_source: "other".to_string(),
            }])
        }
    }

    fn ctx() -> ChunkContext {
        ChunkContext {
            memory_id: "m-1".to_string(),
            file_id: "f-1".to_string(),
            chunk_idx: 7,
        }
    }

    fn analyzer_with(
        nlp: ScriptedNlp,
        limits: AnalysisLimits,
        contradictions: bool,
    ) -> ChunkAnalyzer {
        ChunkAnalyzer::new(
            Arc::new(nlp),
            limits,
            IngestFlags {
                analysis_enabled: true,
                contradictions_enabled: contradictions,
                implicate_refresh_enabled: false,
            },
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_full_pipeline() {
        let analyzer = analyzer_with(ScriptedNlp::fast(), AnalysisLimits::default(), true);
        let result = analyzer
            .analyze_chunk("models learn patterns from data", &ctx())
            .await
            .unwrap();

        assert!(!result.truncated);
        assert_eq!(result.tokens_consumed, 5);
        assert_eq!(result.predicates.len(), 3);
        assert_eq!(result.frames.len(), 3);
        assert_eq!(result.concepts.len(), 2);
        assert_eq!(result.contradictions.len(), 1);
    }

    #[tokio::test]
    async fn test_caps_are_enforced() {
        let nlp = ScriptedNlp {
            stage_delay: Duration::ZERO,
            verbs: 50,
            concepts: 50,
        };
        let limits = AnalysisLimits {
            max_ms_per_chunk: 1_000,
            max_verbs: 4,
            max_frames: 2,
            max_concepts: 3,
        };
        let analyzer = analyzer_with(nlp, limits, false);
        let result = analyzer.analyze_chunk("text", &ctx()).await.unwrap();
        assert_eq!(result.predicates.len(), 4);
        assert_eq!(result.frames.len(), 2);
        assert_eq!(result.concepts.len(), 3);
    }

    #[tokio::test]
    async fn test_deadline_truncates_with_partial_results() {
        let nlp = ScriptedNlp {
            stage_delay: Duration::from_millis(30),
            verbs: 3,
            concepts: 2,
        };
        let limits = AnalysisLimits {
            max_ms_per_chunk: 70,
            ..AnalysisLimits::default()
        };
        let analyzer = analyzer_with(nlp, limits, false);

        let start = Instant::now();
        let result = analyzer.analyze_chunk("slow chunk", &ctx()).await.unwrap();
        assert!(result.truncated);
        // Two stages fit in 70ms at 30ms each; the rest were dropped.
        assert!(result.tokens_consumed > 0);
        assert!(result.concepts.is_empty());
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_contradictions_gated_by_flag() {
        let analyzer = analyzer_with(ScriptedNlp::fast(), AnalysisLimits::default(), false);
        let result = analyzer.analyze_chunk("some text", &ctx()).await.unwrap();
        assert!(result.contradictions.is_empty());
    }

    #[tokio::test]
    async fn test_empty_chunk_rejected() {
        let analyzer = analyzer_with(ScriptedNlp::fast(), AnalysisLimits::default(), false);
        assert!(analyzer.analyze_chunk("   ", &ctx()).await.is_err());
    }
}
