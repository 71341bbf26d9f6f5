//! Optional bounded-latency answer review.
//!
//! The reviewer runs an injected quality judge behind its own circuit
//! breaker and a hard deadline. It never fails the request: every outcome is
//! a [`ReviewResult`], and the skip paths (disabled, breaker open, deadline,
//! judge error) are encoded as `skip_reason` strings. When skipped, the
//! score fields are absent from the serialized result; `skipped` and
//! `latency_ms` are always present.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::breaker::CircuitBreaker;
use crate::config::PerformanceConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsRegistry;
use crate::select::Evidence;

/// Breaker name for the reviewer backend.
pub const REVIEWER_BREAKER: &str = "reviewer";

/// A completed quality judgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgement {
    /// Quality score in [0, 1].
    pub score: f32,
    /// Judge confidence in [0, 1].
    pub confidence: f32,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub details: HashMap<String, Value>,
}

/// The injected answer-quality backend.
#[async_trait]
pub trait AnswerJudge: Send + Sync {
    async fn judge(&self, answer: &str, context: &[Evidence], query: &str) -> Result<Judgement>;
}

/// Outcome of the review stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
    pub latency_ms: f64,
}

impl ReviewResult {
    fn skipped(reason: String, latency_ms: f64) -> Self {
        Self {
            skipped: true,
            skip_reason: Some(reason),
            score: None,
            confidence: None,
            flags: Vec::new(),
            details: HashMap::new(),
            latency_ms,
        }
    }
}

/// The review stage.
pub struct Reviewer {
    judge: Arc<dyn AnswerJudge>,
    breaker: Arc<CircuitBreaker>,
    enabled: bool,
    budget_ms: u64,
    metrics: Arc<MetricsRegistry>,
}

impl Reviewer {
    #[must_use]
    pub fn new(
        judge: Arc<dyn AnswerJudge>,
        breaker: Arc<CircuitBreaker>,
        config: &PerformanceConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            judge,
            breaker,
            enabled: config.reviewer_enabled,
            budget_ms: config.reviewer_budget_ms,
            metrics,
        }
    }

    /// Review `answer` against its evidence.
    ///
    /// Returns within the configured budget plus small overhead: the
    /// deadline drops the in-flight judge future rather than waiting it out.
    pub async fn review_answer(
        &self,
        answer: &str,
        context: &[Evidence],
        query: &str,
    ) -> ReviewResult {
        let start = Instant::now();

        if !self.enabled {
            return self.finish(ReviewResult::skipped(
                "reviewer_disabled".to_string(),
                elapsed_ms(start),
            ));
        }

        let budget_ms = self.budget_ms;
        let budget = Duration::from_millis(budget_ms);
        let outcome = self
            .breaker
            .call(|| async {
                match tokio::time::timeout(budget, self.judge.judge(answer, context, query)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout("review", budget_ms)),
                }
            })
            .await;

        let latency_ms = elapsed_ms(start);
        let result = match outcome {
            Ok(judgement) => ReviewResult {
                skipped: false,
                skip_reason: None,
                score: Some(judgement.score),
                confidence: Some(judgement.confidence),
                flags: judgement.flags,
                details: judgement.details,
                latency_ms,
            },
            Err(Error::BreakerOpen(_)) => {
                ReviewResult::skipped("circuit_breaker_open".to_string(), latency_ms)
            }
            Err(Error::Timeout { .. }) => ReviewResult::skipped(
                format!("timeout_exceeded: {budget_ms}ms"),
                latency_ms,
            ),
            Err(err) => ReviewResult::skipped(format!("error: {}", err.kind()), latency_ms),
        };
        self.finish(result)
    }

    fn finish(&self, result: ReviewResult) -> ReviewResult {
        self.metrics
            .observe_histogram("reviewer_ms", result.latency_ms, &[]);
        if result.skipped {
            self.metrics.increment_counter("reviewer_skips_total", &[]);
        }
        result
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::breaker::BreakerConfig;

    struct ScriptedJudge {
        delay: Duration,
        fail: bool,
    }

    impl ScriptedJudge {
        fn instant() -> Self {
            Self {
                delay: Duration::ZERO,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl AnswerJudge for ScriptedJudge {
        async fn judge(
            &self,
            _answer: &str,
            _context: &[Evidence],
            _query: &str,
        ) -> Result<Judgement> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::backend("judge model unavailable"));
            }
            Ok(Judgement {
                score: 0.84,
                confidence: 0.91,
                flags: vec!["grounded".to_string()],
                details: HashMap::new(),
            })
        }
    }

    fn reviewer_with(judge: ScriptedJudge, config: &PerformanceConfig) -> Reviewer {
        Reviewer::new(
            Arc::new(judge),
            Arc::new(CircuitBreaker::new(REVIEWER_BREAKER, BreakerConfig::default())),
            config,
            Arc::new(MetricsRegistry::new()),
        )
    }

    fn config_with(overrides: &[(&str, &str)]) -> PerformanceConfig {
        let map: BTreeMap<String, String> = overrides
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        PerformanceConfig::from_map(&map).unwrap()
    }

    #[tokio::test]
    async fn test_successful_review() {
        let reviewer = reviewer_with(ScriptedJudge::instant(), &PerformanceConfig::default());
        let result = reviewer.review_answer("answer", &[], "query").await;
        assert!(!result.skipped);
        assert_eq!(result.score, Some(0.84));
        assert_eq!(result.confidence, Some(0.91));
        assert_eq!(result.flags, vec!["grounded".to_string()]);
    }

    #[tokio::test]
    async fn test_disabled_skips_fast() {
        let config = config_with(&[("reviewer.enabled", "false")]);
        let reviewer = reviewer_with(ScriptedJudge::instant(), &config);
        let result = reviewer.review_answer("answer", &[], "query").await;
        assert!(result.skipped);
        assert_eq!(result.skip_reason.as_deref(), Some("reviewer_disabled"));
        assert!(result.score.is_none());
    }

    #[tokio::test]
    async fn test_deadline_drops_runaway_judge() {
        let config = config_with(&[("reviewer.budget_ms", "60")]);
        let judge = ScriptedJudge {
            delay: Duration::from_millis(500),
            fail: false,
        };
        let reviewer = reviewer_with(judge, &config);

        let start = Instant::now();
        let result = reviewer.review_answer("answer", &[], "query").await;
        assert!(result.skipped);
        assert_eq!(result.skip_reason.as_deref(), Some("timeout_exceeded: 60ms"));
        // Wall time stays near the budget even though the judge sleeps 500ms.
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_breaker_open_skips() {
        let breaker = Arc::new(CircuitBreaker::new(
            REVIEWER_BREAKER,
            BreakerConfig::default(),
        ));
        for _ in 0..5 {
            breaker.record_failure();
        }
        let reviewer = Reviewer::new(
            Arc::new(ScriptedJudge::instant()),
            breaker,
            &PerformanceConfig::default(),
            Arc::new(MetricsRegistry::new()),
        );
        let result = reviewer.review_answer("answer", &[], "query").await;
        assert!(result.skipped);
        assert_eq!(result.skip_reason.as_deref(), Some("circuit_breaker_open"));
    }

    #[tokio::test]
    async fn test_judge_error_skips_with_kind() {
        let judge = ScriptedJudge {
            delay: Duration::ZERO,
            fail: true,
        };
        let reviewer = reviewer_with(judge, &PerformanceConfig::default());
        let result = reviewer.review_answer("answer", &[], "query").await;
        assert!(result.skipped);
        assert_eq!(
            result.skip_reason.as_deref(),
            Some("error: backend_unavailable")
        );
    }

    #[tokio::test]
    async fn test_skipped_serialization_omits_scores() {
        let config = config_with(&[("reviewer.enabled", "false")]);
        let reviewer = reviewer_with(ScriptedJudge::instant(), &config);
        let result = reviewer.review_answer("answer", &[], "query").await;
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["skipped"], true);
        assert!(json.get("score").is_none());
        assert!(json.get("confidence").is_none());
        assert!(json.get("latency_ms").is_some());
    }
}
