// ============================================================================
// In-Memory Stores
// ============================================================================
//
// Shared, mutable collections behind tokio RwLocks:
// - event_store:            append-only event history with bounded retention
// - subscription_registry:  CRUD over delivery targets, with validation
// - delivery_log:           delivery records plus the stats rollup
//
// Non-durable by design; state lives for the process lifetime only.
//
// ============================================================================

mod delivery_log;
mod event_store;
mod subscription_registry;

pub use delivery_log::DeliveryLog;
pub use event_store::{EventStore, RetentionPolicy};
pub use subscription_registry::SubscriptionRegistry;
