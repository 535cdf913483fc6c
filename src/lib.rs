//! In-memory event bus with signed webhook delivery.
//!
//! Producers emit events; the bus persists them, fans them out to matching
//! active subscriptions as HMAC-signed HTTP callbacks with exponential
//! backoff retries, and keeps per-delivery attempt history queryable for
//! stats and audit. At-least-once delivery, non-durable by design.

pub mod bus;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod models;
pub mod signer;
pub mod store;

pub use bus::{EventBus, EventBusConfig, EventHandler};
pub use error::RelayError;
pub use models::{
    Delivery, DeliveryResponse, DeliveryStats, DeliveryStatus, Event, EventFilter,
    NewSubscription, RetryPolicy, Subscription, SubscriptionUpdate, TimeRange, WILDCARD,
};
pub use store::RetentionPolicy;
