//! Performance budgets and feature flags.
//!
//! Configuration is a flat mapping of dotted keys loaded once at startup
//! from defaults plus `ENFOLD_*` environment overrides, validated before the
//! process serves anything, and immutable afterwards (`Arc` it around).

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Budgets above this are accepted with a warning.
const EXCESSIVE_BUDGET_MS: u64 = 60_000;

/// Per-chunk analysis limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AnalysisLimits {
    pub max_ms_per_chunk: u64,
    pub max_verbs: usize,
    pub max_frames: usize,
    pub max_concepts: usize,
}

impl Default for AnalysisLimits {
    fn default() -> Self {
        Self {
            max_ms_per_chunk: 40,
            max_verbs: 20,
            max_frames: 10,
            max_concepts: 10,
        }
    }
}

/// Ingest-analysis feature flags. All default off.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IngestFlags {
    pub analysis_enabled: bool,
    pub contradictions_enabled: bool,
    pub implicate_refresh_enabled: bool,
}

/// The full performance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Run the two selector legs concurrently.
    pub retrieval_parallel: bool,
    /// Per-leg timeout in the dual selector.
    pub retrieval_timeout_ms: u64,
    /// Budget for graph expansion.
    pub graph_timeout_ms: u64,
    /// Budget for the optional comparison pass.
    pub compare_timeout_ms: u64,
    /// Gates the reviewer stage.
    pub reviewer_enabled: bool,
    /// Hard deadline for the reviewer.
    pub reviewer_budget_ms: u64,
    /// Enables the secondary vector backend.
    pub pgvector_enabled: bool,
    /// Master toggle for any fallback.
    pub fallbacks_enabled: bool,

    pub ingest: IngestFlags,
    pub analysis_limits: AnalysisLimits,

    /// Raw dotted-key view, kept for the debug endpoint.
    raw: BTreeMap<String, String>,
}

impl Default for PerformanceConfig {
    // Defaults always validate.
    #[allow(clippy::expect_used)]
    fn default() -> Self {
        Self::from_map(&BTreeMap::new()).expect("default configuration is valid")
    }
}

impl PerformanceConfig {
    /// Load from defaults plus `ENFOLD_*` environment overrides.
    ///
    /// `ENFOLD_RETRIEVAL_TIMEOUT_MS=600` overrides `retrieval.timeout_ms`.
    pub fn from_env() -> Result<Self> {
        let mut overrides = BTreeMap::new();
        for key in KNOWN_KEYS {
            let env_name = format!("ENFOLD_{}", key.to_uppercase().replace('.', "_"));
            if let Ok(value) = std::env::var(&env_name) {
                overrides.insert((*key).to_string(), value);
            }
        }
        Self::from_map(&overrides)
    }

    /// Load from defaults plus an explicit override map of dotted keys.
    pub fn from_map(overrides: &BTreeMap<String, String>) -> Result<Self> {
        for key in overrides.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                return Err(Error::config(format!("unrecognized config key '{key}'")));
            }
        }

        let get = |key: &str, default: &str| -> String {
            overrides
                .get(key)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let config = Self {
            retrieval_parallel: parse_bool("retrieval.parallel", &get("retrieval.parallel", "true"))?,
            retrieval_timeout_ms: parse_timeout("retrieval.timeout_ms", &get("retrieval.timeout_ms", "450"))?,
            graph_timeout_ms: parse_timeout("graph.timeout_ms", &get("graph.timeout_ms", "150"))?,
            compare_timeout_ms: parse_timeout("compare.timeout_ms", &get("compare.timeout_ms", "400"))?,
            reviewer_enabled: parse_bool("reviewer.enabled", &get("reviewer.enabled", "true"))?,
            reviewer_budget_ms: parse_timeout("reviewer.budget_ms", &get("reviewer.budget_ms", "500"))?,
            pgvector_enabled: parse_bool("pgvector.enabled", &get("pgvector.enabled", "true"))?,
            fallbacks_enabled: parse_bool("fallbacks.enabled", &get("fallbacks.enabled", "true"))?,
            ingest: IngestFlags {
                analysis_enabled: parse_bool(
                    "ingest.analysis.enabled",
                    &get("ingest.analysis.enabled", "false"),
                )?,
                contradictions_enabled: parse_bool(
                    "ingest.contradictions.enabled",
                    &get("ingest.contradictions.enabled", "false"),
                )?,
                implicate_refresh_enabled: parse_bool(
                    "ingest.implicate.refresh_enabled",
                    &get("ingest.implicate.refresh_enabled", "false"),
                )?,
            },
            analysis_limits: AnalysisLimits {
                max_ms_per_chunk: parse_timeout(
                    "ingest.analysis.max_ms_per_chunk",
                    &get("ingest.analysis.max_ms_per_chunk", "40"),
                )?,
                max_verbs: parse_count("ingest.analysis.max_verbs", &get("ingest.analysis.max_verbs", "20"))?,
                max_frames: parse_count("ingest.analysis.max_frames", &get("ingest.analysis.max_frames", "10"))?,
                max_concepts: parse_count(
                    "ingest.analysis.max_concepts",
                    &get("ingest.analysis.max_concepts", "10"),
                )?,
            },
            raw: Self::render_raw(overrides),
        };

        config.validate()?;
        Ok(config)
    }

    fn render_raw(overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut raw: BTreeMap<String, String> = DEFAULTS
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        for (k, v) in overrides {
            raw.insert(k.clone(), v.clone());
        }
        raw
    }

    fn validate(&self) -> Result<()> {
        if self.retrieval_parallel && !self.pgvector_enabled {
            return Err(Error::config(
                "retrieval.parallel requires pgvector.enabled",
            ));
        }
        for (key, value) in [
            ("retrieval.timeout_ms", self.retrieval_timeout_ms),
            ("graph.timeout_ms", self.graph_timeout_ms),
            ("compare.timeout_ms", self.compare_timeout_ms),
            ("reviewer.budget_ms", self.reviewer_budget_ms),
        ] {
            if value > EXCESSIVE_BUDGET_MS {
                tracing::warn!(key, value, "budget is excessive; accepting anyway");
            }
        }
        Ok(())
    }

    /// Full config grouped into `flags`, `budgets`, and `raw`, with
    /// credential-like values redacted. Serves the debug endpoint.
    #[must_use]
    pub fn debug_view(&self) -> Value {
        let credential = credential_pattern();
        let raw: BTreeMap<String, String> = self
            .raw
            .iter()
            .map(|(k, v)| {
                let value = if credential.is_match(k) {
                    "***REDACTED***".to_string()
                } else {
                    v.clone()
                };
                (k.clone(), value)
            })
            .collect();

        json!({
            "flags": {
                "retrieval.parallel": self.retrieval_parallel,
                "reviewer.enabled": self.reviewer_enabled,
                "pgvector.enabled": self.pgvector_enabled,
                "fallbacks.enabled": self.fallbacks_enabled,
                "ingest.analysis.enabled": self.ingest.analysis_enabled,
                "ingest.contradictions.enabled": self.ingest.contradictions_enabled,
                "ingest.implicate.refresh_enabled": self.ingest.implicate_refresh_enabled,
            },
            "budgets": {
                "retrieval.timeout_ms": self.retrieval_timeout_ms,
                "graph.timeout_ms": self.graph_timeout_ms,
                "compare.timeout_ms": self.compare_timeout_ms,
                "reviewer.budget_ms": self.reviewer_budget_ms,
                "ingest.analysis.max_ms_per_chunk": self.analysis_limits.max_ms_per_chunk,
            },
            "raw": raw,
        })
    }
}

/// Pattern matching credential-like key names.
// The pattern is static and compiles.
#[allow(clippy::unwrap_used)]
pub fn credential_pattern() -> Regex {
    Regex::new(r"(?i)(key|secret|token|password)").unwrap()
}

const DEFAULTS: &[(&str, &str)] = &[
    ("retrieval.parallel", "true"),
    ("retrieval.timeout_ms", "450"),
    ("graph.timeout_ms", "150"),
    ("compare.timeout_ms", "400"),
    ("reviewer.enabled", "true"),
    ("reviewer.budget_ms", "500"),
    ("pgvector.enabled", "true"),
    ("fallbacks.enabled", "true"),
    ("ingest.analysis.enabled", "false"),
    ("ingest.contradictions.enabled", "false"),
    ("ingest.implicate.refresh_enabled", "false"),
    ("ingest.analysis.max_ms_per_chunk", "40"),
    ("ingest.analysis.max_verbs", "20"),
    ("ingest.analysis.max_frames", "10"),
    ("ingest.analysis.max_concepts", "10"),
];

const KNOWN_KEYS: &[&str] = &[
    "retrieval.parallel",
    "retrieval.timeout_ms",
    "graph.timeout_ms",
    "compare.timeout_ms",
    "reviewer.enabled",
    "reviewer.budget_ms",
    "pgvector.enabled",
    "fallbacks.enabled",
    "ingest.analysis.enabled",
    "ingest.contradictions.enabled",
    "ingest.implicate.refresh_enabled",
    "ingest.analysis.max_ms_per_chunk",
    "ingest.analysis.max_verbs",
    "ingest.analysis.max_frames",
    "ingest.analysis.max_concepts",
];

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(Error::config(format!(
            "invalid value '{other}' for '{key}': expected a boolean"
        ))),
    }
}

fn parse_timeout(key: &str, value: &str) -> Result<u64> {
    let parsed: u64 = value.trim().parse().map_err(|_| {
        Error::config(format!(
            "invalid value '{value}' for '{key}': expected a positive integer"
        ))
    })?;
    if parsed == 0 {
        return Err(Error::config(format!(
            "invalid value '0' for '{key}': expected a positive integer"
        )));
    }
    Ok(parsed)
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        Error::config(format!(
            "invalid value '{value}' for '{key}': expected a non-negative integer"
        ))
    })
}
