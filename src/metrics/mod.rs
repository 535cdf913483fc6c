// Private module declaration
mod server;

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Provides metrics for:
// - Event intake (emitted events by type)
// - Webhook delivery attempts and outcomes
// - Retry scheduling and exhausted/cancelled deliveries
// - In-process handler failures
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

/// Central metrics registry for the event bus.
pub struct Metrics {
    registry: Registry,

    // Event intake
    pub events_emitted: IntCounterVec,

    // Delivery lifecycle
    pub deliveries_created: IntCounter,
    pub delivery_attempts: IntCounterVec,
    pub deliveries_delivered: IntCounter,
    pub deliveries_exhausted: IntCounter,
    pub deliveries_cancelled: IntCounter,
    pub retries_scheduled: IntCounter,

    // In-process handlers
    pub handler_failures: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let events_emitted = IntCounterVec::new(
            Opts::new("events_emitted_total", "Total events accepted by the bus"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_emitted.clone()))?;

        let deliveries_created = IntCounter::new(
            "deliveries_created_total",
            "Total delivery records created by subscription fan-out",
        )?;
        registry.register(Box::new(deliveries_created.clone()))?;

        let delivery_attempts = IntCounterVec::new(
            Opts::new("delivery_attempts_total", "Total webhook HTTP attempts"),
            &["outcome"],
        )?;
        registry.register(Box::new(delivery_attempts.clone()))?;

        let deliveries_delivered = IntCounter::new(
            "deliveries_delivered_total",
            "Total deliveries that reached a 2xx response",
        )?;
        registry.register(Box::new(deliveries_delivered.clone()))?;

        let deliveries_exhausted = IntCounter::new(
            "deliveries_exhausted_total",
            "Total deliveries that failed after all attempts",
        )?;
        registry.register(Box::new(deliveries_exhausted.clone()))?;

        let deliveries_cancelled = IntCounter::new(
            "deliveries_cancelled_total",
            "Total deliveries cancelled by subscription removal or deactivation",
        )?;
        registry.register(Box::new(deliveries_cancelled.clone()))?;

        let retries_scheduled = IntCounter::new(
            "retries_scheduled_total",
            "Total retry timers scheduled after failed attempts",
        )?;
        registry.register(Box::new(retries_scheduled.clone()))?;

        let handler_failures = IntCounter::new(
            "handler_failures_total",
            "Total in-process event handler failures",
        )?;
        registry.register(Box::new(handler_failures.clone()))?;

        Ok(Self {
            registry,
            events_emitted,
            deliveries_created,
            delivery_attempts,
            deliveries_delivered,
            deliveries_exhausted,
            deliveries_cancelled,
            retries_scheduled,
            handler_failures,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_event_emitted(&self, event_type: &str) {
        self.events_emitted.with_label_values(&[event_type]).inc();
    }

    pub fn record_delivery_created(&self) {
        self.deliveries_created.inc();
    }

    pub fn record_attempt(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.delivery_attempts.with_label_values(&[outcome]).inc();
    }

    pub fn record_delivered(&self) {
        self.deliveries_delivered.inc();
    }

    pub fn record_exhausted(&self) {
        self.deliveries_exhausted.inc();
    }

    pub fn record_delivery_cancelled(&self) {
        self.deliveries_cancelled.inc();
    }

    pub fn record_retry_scheduled(&self) {
        self.retries_scheduled.inc();
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.inc();
    }
}
