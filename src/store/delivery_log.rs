use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Delivery, DeliveryStats, DeliveryStatus};

// ============================================================================
// Delivery Log - Attempt History & Stats Rollup
// ============================================================================
//
// Holds every delivery record for the process lifetime; records are mutated
// in place by the dispatcher through each attempt and never deleted, so they
// stay queryable for stats and audit. Once a record reaches a terminal
// status (delivered/failed) further updates are refused here, which enforces
// the terminal law even under racing attempt/cancellation tasks.
//
// ============================================================================

pub struct DeliveryLog {
    deliveries: RwLock<HashMap<Uuid, Delivery>>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self {
            deliveries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, delivery: Delivery) {
        self.deliveries.write().await.insert(delivery.id, delivery);
    }

    pub async fn get(&self, id: Uuid) -> Option<Delivery> {
        self.deliveries.read().await.get(&id).cloned()
    }

    /// Delivery records, optionally scoped to one subscription, newest first.
    pub async fn list(&self, subscription_id: Option<Uuid>) -> Vec<Delivery> {
        let deliveries = self.deliveries.read().await;
        let mut records: Vec<Delivery> = deliveries
            .values()
            .filter(|d| subscription_id.is_none_or(|id| d.subscription_id == id))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Apply `mutate` to a non-terminal record and refresh `updated_at`.
    /// Returns the updated record, or `None` if the record is missing or
    /// already terminal.
    pub async fn update<F>(&self, id: Uuid, mutate: F) -> Option<Delivery>
    where
        F: FnOnce(&mut Delivery),
    {
        let mut deliveries = self.deliveries.write().await;
        let delivery = deliveries.get_mut(&id)?;
        if delivery.status.is_terminal() {
            return None;
        }
        mutate(delivery);
        delivery.updated_at = Utc::now();
        Some(delivery.clone())
    }

    /// Counts by status, optionally scoped to one subscription.
    /// `success_rate` is a percentage; 0 when there are no records.
    pub async fn stats(&self, subscription_id: Option<Uuid>) -> DeliveryStats {
        let deliveries = self.deliveries.read().await;
        let mut stats = DeliveryStats::default();

        for delivery in deliveries.values() {
            if subscription_id.is_some_and(|id| delivery.subscription_id != id) {
                continue;
            }
            stats.total += 1;
            match delivery.status {
                DeliveryStatus::Delivered => stats.delivered += 1,
                DeliveryStatus::Failed => stats.failed += 1,
                DeliveryStatus::Pending => stats.pending += 1,
                DeliveryStatus::Retrying => stats.retrying += 1,
            }
        }

        if stats.total > 0 {
            stats.success_rate = stats.delivered as f64 / stats.total as f64 * 100.0;
        }
        stats
    }
}

impl Default for DeliveryLog {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
