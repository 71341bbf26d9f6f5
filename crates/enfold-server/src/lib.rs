//! Debug HTTP surface.
//!
//! Three operator endpoints over the process registries:
//!
//! - `GET /debug/config` - loaded configuration, credential values masked
//! - `GET /debug/metrics` - stage percentiles, counters, derived rates
//! - `GET /debug/health` - healthy/degraded verdict with warnings
//!
//! All three require the `VIEW_DEBUG` capability; the caller's roles arrive
//! in the `x-roles` header (comma-separated). Authentication itself is the
//! surrounding runtime's job; this crate only enforces the capability
//! check and audit-logs denials.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use enfold::breaker::BreakerRegistry;
use enfold::config::PerformanceConfig;
use enfold::error::{Error, Result};
use enfold::metrics::MetricsRegistry;
use enfold::rbac::{self, Capability};

/// Error rate above which the service reports itself degraded.
const DEGRADED_ERROR_RATE: f64 = 0.10;

/// Shared state behind the debug router.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PerformanceConfig>,
    pub metrics: Arc<MetricsRegistry>,
    pub breakers: Arc<BreakerRegistry>,
    pub started_at: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Arc<PerformanceConfig>,
        metrics: Arc<MetricsRegistry>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            config,
            metrics,
            breakers,
            started_at: Instant::now(),
        }
    }
}

/// Build the debug router.
#[must_use]
pub fn debug_router(state: AppState) -> Router {
    Router::new()
        .route("/debug/config", get(config_handler))
        .route("/debug/metrics", get(metrics_handler))
        .route("/debug/health", get(health_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the router and return the bound address plus the serve future.
///
/// Port 0 lets the OS assign one, which keeps tests free of port clashes.
pub async fn serve_debug(
    state: AppState,
    port: u16,
) -> Result<(
    std::net::SocketAddr,
    impl std::future::Future<Output = Result<()>>,
)> {
    let app = debug_router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::other(format!("failed to bind to {addr}: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| Error::other(format!("failed to read local addr: {e}")))?;

    tracing::info!("debug server listening on http://{local_addr}/debug/health");

    let server = async move {
        axum::serve(listener, app)
            .await
            .map_err(|e| Error::other(format!("server error: {e}")))
    };
    Ok((local_addr, server))
}

/// Parse caller roles from the `x-roles` header.
fn caller_roles(headers: &HeaderMap) -> Vec<String> {
    headers
        .get("x-roles")
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Capability gate shared by all three handlers.
fn require_view_debug(headers: &HeaderMap) -> std::result::Result<(), Response> {
    let roles = caller_roles(headers);
    if rbac::require_capability(&roles, Capability::ViewDebug).is_err() {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "VIEW_DEBUG capability required" })),
        )
            .into_response());
    }
    Ok(())
}

async fn config_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_view_debug(&headers) {
        return denied;
    }

    let view = state.config.debug_view();
    let limits = state.config.analysis_limits;
    let ingest = state.config.ingest;
    let body = json!({
        "performance": {
            "flags": view["flags"],
            "budgets": view["budgets"],
            "raw_config": view["raw"],
        },
        "resource_limits": {
            "ingest.analysis.max_ms_per_chunk": limits.max_ms_per_chunk,
            "ingest.analysis.max_verbs": limits.max_verbs,
            "ingest.analysis.max_frames": limits.max_frames,
            "ingest.analysis.max_concepts": limits.max_concepts,
        },
        "feature_flags": {
            "reviewer.enabled": state.config.reviewer_enabled,
            "pgvector.enabled": state.config.pgvector_enabled,
            "fallbacks.enabled": state.config.fallbacks_enabled,
            "ingest.analysis.enabled": ingest.analysis_enabled,
            "ingest.contradictions.enabled": ingest.contradictions_enabled,
            "ingest.implicate.refresh_enabled": ingest.implicate_refresh_enabled,
        },
        "config": view["raw"],
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

fn stage_stats(metrics: &MetricsRegistry, name: &str) -> Value {
    metrics
        .get_histogram_stats(name, &[])
        .and_then(|stats| serde_json::to_value(stats).ok())
        .unwrap_or(Value::Null)
}

fn rate(metrics: &MetricsRegistry, numerator: &str, denominator: &str) -> f64 {
    let denominator = metrics.get_counter(denominator, &[]);
    if denominator == 0 {
        return 0.0;
    }
    metrics.get_counter(numerator, &[]) as f64 / denominator as f64
}

async fn metrics_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_view_debug(&headers) {
        return denied;
    }

    let metrics = &state.metrics;
    let body = json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "performance": {
            "retrieval": stage_stats(metrics, "retrieval_ms"),
            "graph_expand": stage_stats(metrics, "graph_expand_ms"),
            "packing": stage_stats(metrics, "packing_ms"),
            "reviewer": stage_stats(metrics, "reviewer_ms"),
            "chat_total": stage_stats(metrics, "chat_total_ms"),
        },
        "counters": metrics.counters_snapshot(),
        "rates": {
            "retrieval_error_rate": rate(metrics, "retrieval_errors_total", "retrieval_requests_total"),
            "pgvector_fallback_rate": rate(metrics, "pgvector_fallback_total", "retrieval_requests_total"),
        },
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn health_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_view_debug(&headers) {
        return denied;
    }

    let mut warnings: Vec<String> = Vec::new();
    let error_rate = rate(
        &state.metrics,
        "retrieval_errors_total",
        "retrieval_requests_total",
    );
    if error_rate > DEGRADED_ERROR_RATE {
        warnings.push(format!("retrieval error rate {error_rate:.2} exceeds threshold"));
    }
    for breaker in state.breakers.unhealthy() {
        warnings.push(format!("circuit breaker '{breaker}' is not closed"));
    }

    let status = if warnings.is_empty() { "healthy" } else { "degraded" };
    let body = json!({
        "status": status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "warnings": warnings,
        "metrics_summary": {
            "retrieval_requests_total": state.metrics.get_counter("retrieval_requests_total", &[]),
            "retrieval_error_rate": error_rate,
            "pgvector_fallback_rate": rate(
                &state.metrics,
                "pgvector_fallback_total",
                "retrieval_requests_total",
            ),
        },
    });
    (StatusCode::OK, Json(body)).into_response()
}
