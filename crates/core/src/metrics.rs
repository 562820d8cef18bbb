//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Migration actions (requests, completions, durations)
//! - Watch subscribers
//! - External services (job engine, placement, directory)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Migration Action Metrics
// =============================================================================

/// Action requests by sub-action and outcome.
pub static ACTION_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "migrator_action_requests_total",
            "Total migration action requests",
        ),
        &["action", "result"], // result: "accepted", "rejected", "error"
    )
    .unwrap()
});

/// Completed actions by phase and resulting record state.
pub static ACTIONS_COMPLETED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "migrator_actions_completed_total",
            "Total migration actions that reached a terminal job signal",
        ),
        &["phase", "state"],
    )
    .unwrap()
});

/// Action duration from dispatch to terminal signal.
pub static ACTION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "migrator_action_duration_seconds",
            "Duration of migration actions",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]),
        &["phase"],
    )
    .unwrap()
});

/// Actions currently running.
pub static ACTIONS_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "migrator_actions_running",
        "Number of migration actions currently running",
    )
    .unwrap()
});

/// Automatic full migrations by final state.
pub static AUTOMATIC_MIGRATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "migrator_automatic_migrations_total",
            "Total automatic migrations by final state",
        ),
        &["state"],
    )
    .unwrap()
});

/// Failed attempts to record a finished job's result, by phase.
pub static SETTLE_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "migrator_settle_retries_total",
            "Total failed attempts to record the result of a finished job",
        ),
        &["phase"],
    )
    .unwrap()
});

// =============================================================================
// Watch Metrics
// =============================================================================

/// Watch streams currently attached.
pub static WATCH_SUBSCRIBERS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "migrator_watch_subscribers",
        "Number of attached watch streams",
    )
    .unwrap()
});

/// Watchers disconnected because their queue overflowed.
pub static WATCH_LAGGED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "migrator_watch_lagged_total",
        "Total watch streams closed because the subscriber fell behind",
    )
    .unwrap()
});

// =============================================================================
// External Service Metrics
// =============================================================================

/// External service request duration.
pub static EXTERNAL_SERVICE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "migrator_external_service_duration_seconds",
            "Duration of external service calls",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["service", "operation"],
    )
    .unwrap()
});

/// External service requests total.
pub static EXTERNAL_SERVICE_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "migrator_external_service_requests_total",
            "Total external service requests",
        ),
        &["service", "operation", "status"], // status: "success", "error"
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Record one external call.
pub fn observe_external_call(service: &str, operation: &str, seconds: f64, success: bool) {
    EXTERNAL_SERVICE_DURATION
        .with_label_values(&[service, operation])
        .observe(seconds);
    EXTERNAL_SERVICE_REQUESTS
        .with_label_values(&[service, operation, if success { "success" } else { "error" }])
        .inc();
}

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Actions
        Box::new(ACTION_REQUESTS.clone()),
        Box::new(ACTIONS_COMPLETED.clone()),
        Box::new(ACTION_DURATION.clone()),
        Box::new(ACTIONS_RUNNING.clone()),
        Box::new(AUTOMATIC_MIGRATIONS.clone()),
        Box::new(SETTLE_RETRIES.clone()),
        // Watch
        Box::new(WATCH_SUBSCRIBERS.clone()),
        Box::new(WATCH_LAGGED.clone()),
        // External services
        Box::new(EXTERNAL_SERVICE_DURATION.clone()),
        Box::new(EXTERNAL_SERVICE_REQUESTS.clone()),
    ]
}
