use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use event_relay::{
    metrics, Event, EventBus, EventBusConfig, EventHandler, NewSubscription, RetryPolicy,
};

// ============================================================================
// Demo Driver
// ============================================================================
//
// Wires up a bus, registers a webhook subscription against WEBHOOK_SINK_URL
// (any endpoint answering 2xx will do), emits a small payment lifecycle and
// prints the resulting delivery stats.
//
// ============================================================================

struct AuditHandler;

#[async_trait]
impl EventHandler for AuditHandler {
    fn name(&self) -> &str {
        "audit"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            source = %event.source,
            "Audit handler observed event"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,event_relay=debug")),
        )
        .init();

    tracing::info!("Starting event-relay webhook bus demo");

    let bus = EventBus::new(EventBusConfig::default())?;

    // Metrics HTTP server in a background thread with its own runtime
    let metrics_registry = Arc::new(bus.metrics().registry().clone());
    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().expect("metrics runtime");
        rt.block_on(async {
            if let Err(e) = metrics::start_metrics_server(metrics_registry, 9090).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    });

    bus.subscribe_handler("*", Arc::new(AuditHandler)).await;

    let sink_url = std::env::var("WEBHOOK_SINK_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8081/hooks".to_string());

    let subscription = bus
        .create_subscription(
            NewSubscription::new("payments", &sink_url, &["payment.created", "payment.captured"])
                .with_secret("demo-secret")
                .with_retry_policy(RetryPolicy {
                    max_retries: 3,
                    retry_delay_ms: 1000,
                    backoff_multiplier: 2.0,
                }),
        )
        .await?;
    tracing::info!(subscription_id = %subscription.id, url = %sink_url, "Subscription registered");

    // Emit a small payment lifecycle
    bus.emit(
        Event::new("payment.created", "billing")
            .with_data("amount", json!(4200))
            .with_data("currency", json!("EUR")),
    )
    .await?;

    bus.emit(
        Event::new("payment.captured", "billing")
            .with_data("amount", json!(4200))
            .with_metadata("capture", "auto"),
    )
    .await?;

    // Not subscribed; stored but produces no delivery
    bus.emit(Event::new("user.created", "accounts")).await?;

    // Let deliveries and any retries settle
    tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;

    let stats = bus.get_delivery_stats(None).await;
    tracing::info!(
        total = stats.total,
        delivered = stats.delivered,
        failed = stats.failed,
        success_rate = stats.success_rate,
        "Delivery stats"
    );

    Ok(())
}
