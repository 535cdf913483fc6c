use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::error::RelayError;
use crate::metrics::Metrics;
use crate::models::{
    Delivery, DeliveryStats, Event, EventFilter, NewSubscription, Subscription,
    SubscriptionUpdate, WILDCARD,
};
use crate::store::{DeliveryLog, EventStore, RetentionPolicy, SubscriptionRegistry};

// ============================================================================
// Event Bus Facade
// ============================================================================
//
// Composes the store, registry, delivery log and dispatcher into one
// constructible context object. No global singleton: each bus owns its own
// state, so tests and multi-tenant processes can run independent buses.
//
// emit() persists the event, initiates webhook fan-out to every matching
// active subscription, then invokes in-process handlers concurrently.
// Delivery outcomes are recorded on the Delivery records and never propagate
// back to the producer; handler failures do, as one aggregate error that
// names every failing handler.
//
// ============================================================================

/// In-process consumer of emitted events, registered per event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EventBusConfig {
    pub retention: RetentionPolicy,
}

pub struct EventBus {
    store: Arc<EventStore>,
    registry: Arc<SubscriptionRegistry>,
    deliveries: Arc<DeliveryLog>,
    dispatcher: Arc<Dispatcher>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    metrics: Arc<Metrics>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let deliveries = Arc::new(DeliveryLog::new());
        let dispatcher = Arc::new(Dispatcher::new(deliveries.clone(), metrics.clone())?);

        Ok(Self {
            store: Arc::new(EventStore::with_retention(config.retention)),
            registry: Arc::new(SubscriptionRegistry::new()),
            deliveries,
            dispatcher,
            handlers: RwLock::new(HashMap::new()),
            metrics,
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Register an in-process handler for an event type (`"*"` for all).
    pub async fn subscribe_handler(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }

    /// Accept an event: persist it, fan out deliveries to matching active
    /// subscriptions, then run in-process handlers.
    ///
    /// Returns as soon as fan-out is initiated and handlers have resolved;
    /// webhook delivery outcomes never affect the result. If any handler
    /// fails, the event stays stored and an aggregate error is returned.
    pub async fn emit(&self, event: Event) -> Result<Event, RelayError> {
        let event = self.store.append(event).await;
        self.metrics.record_event_emitted(&event.event_type);

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            source = %event.source,
            "Event emitted"
        );

        // Webhook fan-out: one delivery per matching active subscription,
        // evaluated at emit time. Attempts run on their own tasks.
        let matching = self.registry.matching(&event.event_type).await;
        for subscription in &matching {
            self.dispatcher.create_delivery(subscription, &event).await;
        }

        self.notify_handlers(&event).await?;
        Ok(event)
    }

    /// Run all handlers registered for the event's type (plus wildcard
    /// handlers) concurrently, collecting each outcome independently so one
    /// bad handler cannot mask the others.
    async fn notify_handlers(&self, event: &Event) -> Result<(), RelayError> {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let table = self.handlers.read().await;
            table
                .get(&event.event_type)
                .into_iter()
                .chain(table.get(WILDCARD))
                .flatten()
                .cloned()
                .collect()
        };
        if handlers.is_empty() {
            return Ok(());
        }

        let total = handlers.len();
        let outcomes = join_all(handlers.into_iter().map(|handler| {
            let event = event.clone();
            async move {
                handler
                    .handle(&event)
                    .await
                    .map_err(|e| format!("{}: {}", handler.name(), e))
            }
        }))
        .await;

        let failures: Vec<String> = outcomes.into_iter().filter_map(Result::err).collect();
        if failures.is_empty() {
            return Ok(());
        }

        for failure in &failures {
            self.metrics.record_handler_failure();
            tracing::error!(event_id = %event.id, error = %failure, "Event handler failed");
        }
        Err(RelayError::HandlerFailures {
            event_id: event.id,
            failed: failures.len(),
            total,
            details: failures,
        })
    }

    // ------------------------------------------------------------------
    // Subscription management
    // ------------------------------------------------------------------

    pub async fn create_subscription(
        &self,
        request: NewSubscription,
    ) -> Result<Subscription, RelayError> {
        self.registry.create(request).await
    }

    /// Partial update. Deactivating a subscription also cancels its pending
    /// retry timers, so no webhook fires against a deactivated target.
    pub async fn update_subscription(
        &self,
        id: Uuid,
        patch: SubscriptionUpdate,
    ) -> Result<Subscription, RelayError> {
        let updated = self.registry.update(id, patch).await?;
        if !updated.is_active {
            self.dispatcher.cancel_for_subscription(id).await;
        }
        Ok(updated)
    }

    /// Unconditional delete; cancels pending retries for the subscription.
    /// Returns whether an entry existed.
    pub async fn delete_subscription(&self, id: Uuid) -> bool {
        let existed = self.registry.delete(id).await;
        if existed {
            self.dispatcher.cancel_for_subscription(id).await;
        }
        existed
    }

    pub async fn get_subscription(&self, id: Uuid) -> Option<Subscription> {
        self.registry.get(id).await
    }

    pub async fn get_subscriptions(&self) -> Vec<Subscription> {
        self.registry.list().await
    }

    // ------------------------------------------------------------------
    // Query surface
    // ------------------------------------------------------------------

    pub async fn get_event(&self, id: Uuid) -> Option<Event> {
        self.store.get(id).await
    }

    pub async fn get_events(&self, filter: &EventFilter) -> Vec<Event> {
        self.store.query(filter).await
    }

    pub async fn get_delivery(&self, id: Uuid) -> Option<Delivery> {
        self.deliveries.get(id).await
    }

    pub async fn get_deliveries(&self, subscription_id: Option<Uuid>) -> Vec<Delivery> {
        self.deliveries.list(subscription_id).await
    }

    pub async fn get_delivery_stats(&self, subscription_id: Option<Uuid>) -> DeliveryStats {
        self.deliveries.stats(subscription_id).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeliveryStatus;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Endpoint stub that answers every request with 200 and counts hits.
    async fn start_ok_endpoint() -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));

        let hits_clone = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                hits_clone.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 8192];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                        )
                        .await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{}/hook", addr), hits)
    }

    fn make_bus() -> EventBus {
        EventBus::new(EventBusConfig::default()).unwrap()
    }

    async fn wait_for_terminal(bus: &EventBus, delivery_id: Uuid) -> Delivery {
        for _ in 0..200 {
            if let Some(d) = bus.get_delivery(delivery_id).await {
                if d.status.is_terminal() {
                    return d;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("delivery never reached a terminal status");
    }

    struct CountingHandler {
        name: String,
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    fn counting_handler(name: &str, fail: bool) -> (Arc<CountingHandler>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = Arc::new(CountingHandler {
            name: name.to_string(),
            calls: calls.clone(),
            fail,
        });
        (handler, calls)
    }

    #[tokio::test]
    async fn test_emit_stores_event_and_returns_it() {
        let bus = make_bus();
        let event = bus
            .emit(Event::new("payment.created", "billing"))
            .await
            .unwrap();

        let stored = bus.get_event(event.id).await.unwrap();
        assert_eq!(stored.event_type, "payment.created");
        assert_eq!(bus.get_events(&EventFilter::default()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_emit_fans_out_to_matching_subscriptions_only() {
        let (url, _) = start_ok_endpoint().await;
        let bus = make_bus();

        let matching = bus
            .create_subscription(NewSubscription::new("m", &url, &["payment.created"]))
            .await
            .unwrap();
        let other_type = bus
            .create_subscription(NewSubscription::new("o", &url, &["user.created"]))
            .await
            .unwrap();
        let inactive = bus
            .create_subscription(NewSubscription::new("i", &url, &["payment.created"]).inactive())
            .await
            .unwrap();

        let event = bus
            .emit(Event::new("payment.created", "billing"))
            .await
            .unwrap();

        let deliveries = bus.get_deliveries(None).await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].subscription_id, matching.id);
        assert_eq!(deliveries[0].event_id, event.id);
        assert!(bus.get_deliveries(Some(other_type.id)).await.is_empty());
        assert!(bus.get_deliveries(Some(inactive.id)).await.is_empty());
    }

    #[tokio::test]
    async fn test_wildcard_subscription_receives_every_type() {
        let (url, _) = start_ok_endpoint().await;
        let bus = make_bus();
        let sub = bus
            .create_subscription(NewSubscription::new("all", &url, &["*"]))
            .await
            .unwrap();

        bus.emit(Event::new("payment.created", "billing")).await.unwrap();
        bus.emit(Event::new("user.created", "accounts")).await.unwrap();

        assert_eq!(bus.get_deliveries(Some(sub.id)).await.len(), 2);
    }

    #[tokio::test]
    async fn test_later_activated_subscription_gets_no_past_events() {
        let (url, _) = start_ok_endpoint().await;
        let bus = make_bus();

        bus.emit(Event::new("payment.created", "billing")).await.unwrap();

        let sub = bus
            .create_subscription(NewSubscription::new("late", &url, &["payment.created"]))
            .await
            .unwrap();
        assert!(bus.get_deliveries(Some(sub.id)).await.is_empty());
    }

    #[tokio::test]
    async fn test_emit_to_live_endpoint_ends_delivered() {
        let (url, hits) = start_ok_endpoint().await;
        let bus = make_bus();
        bus.create_subscription(NewSubscription::new("m", &url, &["payment.created"]))
            .await
            .unwrap();

        bus.emit(Event::new("payment.created", "billing")).await.unwrap();

        let delivery_id = bus.get_deliveries(None).await[0].id;
        let done = wait_for_terminal(&bus, delivery_id).await;
        assert_eq!(done.status, DeliveryStatus::Delivered);
        assert_eq!(done.attempts, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let stats = bus.get_delivery_stats(None).await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.success_rate, 100.0);
    }

    #[tokio::test]
    async fn test_handlers_run_for_type_and_wildcard() {
        let bus = make_bus();
        let (typed, typed_calls) = counting_handler("typed", false);
        let (wild, wild_calls) = counting_handler("wild", false);
        let (other, other_calls) = counting_handler("other", false);

        bus.subscribe_handler("payment.created", typed).await;
        bus.subscribe_handler("*", wild).await;
        bus.subscribe_handler("user.created", other).await;

        bus.emit(Event::new("payment.created", "billing")).await.unwrap();

        assert_eq!(typed_calls.load(Ordering::SeqCst), 1);
        assert_eq!(wild_calls.load(Ordering::SeqCst), 1);
        assert_eq!(other_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_mask_others() {
        let bus = make_bus();
        let (bad, _) = counting_handler("bad", true);
        let (good, good_calls) = counting_handler("good", false);

        bus.subscribe_handler("payment.created", bad).await;
        bus.subscribe_handler("payment.created", good).await;

        let result = bus.emit(Event::new("payment.created", "billing")).await;

        // The good handler still ran
        assert_eq!(good_calls.load(Ordering::SeqCst), 1);

        // The aggregate error names the failing handler only
        match result {
            Err(RelayError::HandlerFailures {
                failed,
                total,
                details,
                ..
            }) => {
                assert_eq!(failed, 1);
                assert_eq!(total, 2);
                assert!(details[0].contains("bad"));
            }
            other => panic!("expected HandlerFailures, got {:?}", other.map(|e| e.id)),
        }

        // The event is stored despite the handler failure
        assert_eq!(bus.get_events(&EventFilter::default()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_subscription_reports_existence() {
        let (url, _) = start_ok_endpoint().await;
        let bus = make_bus();
        let sub = bus
            .create_subscription(NewSubscription::new("m", &url, &["payment.created"]))
            .await
            .unwrap();

        assert!(bus.delete_subscription(sub.id).await);
        assert!(!bus.delete_subscription(sub.id).await);
        assert!(bus.get_subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_subscription_partial_merge() {
        let (url, _) = start_ok_endpoint().await;
        let bus = make_bus();
        let sub = bus
            .create_subscription(NewSubscription::new("m", &url, &["payment.created"]))
            .await
            .unwrap();

        let updated = bus
            .update_subscription(
                sub.id,
                SubscriptionUpdate {
                    name: Some("renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.url, sub.url);
    }

    #[tokio::test]
    async fn test_independent_buses_do_not_share_state() {
        let bus_a = make_bus();
        let bus_b = make_bus();

        bus_a.emit(Event::new("payment.created", "billing")).await.unwrap();

        assert_eq!(bus_a.get_events(&EventFilter::default()).await.len(), 1);
        assert!(bus_b.get_events(&EventFilter::default()).await.is_empty());
    }
}
