//! CI latency gate.
//!
//! Reads recorded stage metrics (either the `/debug/metrics` payload or a
//! flat `{"retrieval_ms": 420.0, ...}` map) and asserts each stage's p95
//! against its budget. An environment slack in [0, 10]% widens all budgets
//! for nightly runs; on PR the default slack is 0%. A failing check prints a
//! human-readable overage per metric and exits non-zero.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;

/// Stage budgets, p95 milliseconds.
const BUDGETS: &[(&str, f64)] = &[
    ("retrieval_ms", 500.0),
    ("graph_expand_ms", 200.0),
    ("packing_ms", 550.0),
    ("reviewer_ms", 500.0),
    ("chat_total_ms", 1200.0),
];

#[derive(Args)]
pub struct GateArgs {
    /// Metrics file: /debug/metrics JSON or a flat {metric: p95} map
    pub metrics_file: PathBuf,

    /// Budget slack percentage, clamped to [0, 10] (nightly runs)
    #[arg(long, default_value_t = 0.0)]
    pub slack_pct: f64,

    /// Exclude the reviewer budget (reviewer stage disabled)
    #[arg(long)]
    pub no_reviewer: bool,
}

/// One budget violation.
#[derive(Debug, Clone, PartialEq)]
pub struct GateViolation {
    pub metric: String,
    pub actual: f64,
    pub budget: f64,
    pub overage_pct: f64,
}

/// Outcome of one gate check.
#[derive(Debug, Clone, Default)]
pub struct GateReport {
    pub passed: bool,
    pub violations: Vec<GateViolation>,
    /// (metric, actual, effective budget) for every metric that was checked.
    pub checked: Vec<(String, f64, f64)>,
    /// Metrics with no recorded value.
    pub skipped: Vec<String>,
    pub exit_code: i32,
}

/// Clamp slack to the supported [0, 10]% range; invalid values clamp too.
#[must_use]
pub fn clamp_slack(slack_pct: f64) -> f64 {
    if slack_pct.is_finite() {
        slack_pct.clamp(0.0, 10.0)
    } else {
        0.0
    }
}

/// Pull p95 values out of either supported file shape.
#[must_use]
pub fn extract_p95s(payload: &Value) -> HashMap<String, f64> {
    let mut p95s = HashMap::new();
    for (metric, _) in BUDGETS {
        // Flat map: {"retrieval_ms": 420.0}
        if let Some(v) = payload.get(*metric).and_then(Value::as_f64) {
            p95s.insert((*metric).to_string(), v);
            continue;
        }
        // /debug/metrics: performance.<stage>.p95
        let stage = metric.trim_end_matches("_ms");
        if let Some(v) = payload
            .pointer(&format!("/performance/{stage}/p95"))
            .and_then(Value::as_f64)
        {
            p95s.insert((*metric).to_string(), v);
        }
    }
    p95s
}

/// Assert the recorded p95s against the budgets.
#[must_use]
pub fn check_gates(
    p95s: &HashMap<String, f64>,
    slack_pct: f64,
    reviewer_enabled: bool,
) -> GateReport {
    let slack = clamp_slack(slack_pct);
    let mut report = GateReport {
        passed: true,
        ..GateReport::default()
    };

    for (metric, budget) in BUDGETS {
        if *metric == "reviewer_ms" && !reviewer_enabled {
            continue;
        }
        let effective = budget * (1.0 + slack / 100.0);
        let Some(actual) = p95s.get(*metric).copied() else {
            report.skipped.push((*metric).to_string());
            continue;
        };
        report
            .checked
            .push(((*metric).to_string(), actual, effective));
        if actual > effective {
            report.passed = false;
            report.violations.push(GateViolation {
                metric: (*metric).to_string(),
                actual,
                budget: effective,
                overage_pct: (actual / effective - 1.0) * 100.0,
            });
        }
    }

    report.exit_code = i32::from(!report.passed);
    report
}

/// Run the gate command; returns the process exit code.
pub fn run(args: &GateArgs) -> Result<i32> {
    let raw = std::fs::read_to_string(&args.metrics_file)
        .with_context(|| format!("failed to read {}", args.metrics_file.display()))?;
    let payload: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", args.metrics_file.display()))?;

    let p95s = extract_p95s(&payload);
    let report = check_gates(&p95s, args.slack_pct, !args.no_reviewer);

    for (metric, actual, budget) in &report.checked {
        if report.violations.iter().all(|v| &v.metric != metric) {
            println!("PASS {metric}: {actual:.1}ms <= {budget:.1}ms");
        }
    }
    for skipped in &report.skipped {
        println!("SKIP {skipped}: no recorded value");
    }
    for violation in &report.violations {
        println!(
            "FAIL {}: {:.1}ms > {:.1}ms (+{:.1}% overage)",
            violation.metric, violation.actual, violation.budget, violation.overage_pct
        );
    }
    println!(
        "{}",
        if report.passed {
            "latency gate passed"
        } else {
            "latency gate FAILED"
        }
    );
    Ok(report.exit_code)
}
