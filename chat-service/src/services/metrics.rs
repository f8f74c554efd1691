//! Prometheus metrics for chat-service.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Session metrics
pub static CHAT_SESSIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static CHAT_SESSIONS_ACTIVE: OnceLock<IntGauge> = OnceLock::new();
pub static CHAT_STREAM_TOKENS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

// Upstream metrics
pub static CHAT_UPSTREAM_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static CHAT_TITLE_GENERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Later calls are no-ops.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // outcome: completed, aborted, errored, rejected
    let sessions_total = IntCounterVec::new(
        Opts::new("chat_sessions_total", "Relay sessions by terminal outcome"),
        &["outcome"],
    )?;

    let sessions_active = IntGauge::new(
        "chat_sessions_active",
        "Relay sessions currently streaming",
    )?;

    let stream_tokens = IntCounterVec::new(
        Opts::new(
            "chat_stream_tokens_total",
            "Content events relayed to clients",
        ),
        &["model"],
    )?;

    let upstream_errors = IntCounterVec::new(
        Opts::new("chat_upstream_errors_total", "Upstream provider failures"),
        &["category"],
    )?;

    // result: generated, skipped, failed
    let title_generations = IntCounterVec::new(
        Opts::new("chat_title_generations_total", "Chat title derivations"),
        &["result"],
    )?;

    registry.register(Box::new(sessions_total.clone()))?;
    registry.register(Box::new(sessions_active.clone()))?;
    registry.register(Box::new(stream_tokens.clone()))?;
    registry.register(Box::new(upstream_errors.clone()))?;
    registry.register(Box::new(title_generations.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = CHAT_SESSIONS_TOTAL.set(sessions_total);
    let _ = CHAT_SESSIONS_ACTIVE.set(sessions_active);
    let _ = CHAT_STREAM_TOKENS_TOTAL.set(stream_tokens);
    let _ = CHAT_UPSTREAM_ERRORS_TOTAL.set(upstream_errors);
    let _ = CHAT_TITLE_GENERATIONS_TOTAL.set(title_generations);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return format!("# Failed to encode metrics: {}\n", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to convert metrics to UTF-8");
        format!("# Failed to convert metrics to UTF-8: {}\n", e)
    })
}

pub fn session_started() {
    if let Some(gauge) = CHAT_SESSIONS_ACTIVE.get() {
        gauge.inc();
    }
}

pub fn session_finished(outcome: &str) {
    if let Some(gauge) = CHAT_SESSIONS_ACTIVE.get() {
        gauge.dec();
    }
    record_session_outcome(outcome);
}

/// Count a session outcome without touching the active gauge.
pub fn record_session_outcome(outcome: &str) {
    if let Some(counter) = CHAT_SESSIONS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_token(model: &str) {
    if let Some(counter) = CHAT_STREAM_TOKENS_TOTAL.get() {
        counter.with_label_values(&[model]).inc();
    }
}

pub fn record_upstream_error(category: &str) {
    if let Some(counter) = CHAT_UPSTREAM_ERRORS_TOTAL.get() {
        counter.with_label_values(&[category]).inc();
    }
}

pub fn record_title_generation(result: &str) {
    if let Some(counter) = CHAT_TITLE_GENERATIONS_TOTAL.get() {
        counter.with_label_values(&[result]).inc();
    }
}
