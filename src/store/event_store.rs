use std::collections::VecDeque;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Event, EventFilter};

// ============================================================================
// Event Store - Append-Only Event History
// ============================================================================
//
// In-memory, non-durable record of emitted events with filterable retrieval.
// Events are never mutated after append. Retention is count-based: once the
// cap is reached the oldest events are evicted, so memory stays bounded.
//
// ============================================================================

/// Count-based retention for the event store.
#[derive(Clone, Copy, Debug)]
pub struct RetentionPolicy {
    /// Oldest events are evicted once the store holds more than this.
    pub max_events: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { max_events: 10_000 }
    }
}

pub struct EventStore {
    events: RwLock<VecDeque<Event>>,
    retention: RetentionPolicy,
}

impl EventStore {
    pub fn new() -> Self {
        Self::with_retention(RetentionPolicy::default())
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            retention,
        }
    }

    /// Append an event and return the stored record.
    pub async fn append(&self, event: Event) -> Event {
        let mut events = self.events.write().await;
        events.push_back(event.clone());

        while events.len() > self.retention.max_events {
            if let Some(evicted) = events.pop_front() {
                tracing::debug!(
                    event_id = %evicted.id,
                    event_type = %evicted.event_type,
                    max_events = self.retention.max_events,
                    "Retention cap reached, evicting oldest event"
                );
            }
        }

        event
    }

    pub async fn get(&self, id: Uuid) -> Option<Event> {
        let events = self.events.read().await;
        events.iter().find(|e| e.id == id).cloned()
    }

    /// Filtered retrieval, newest first. All present filters are ANDed.
    pub async fn query(&self, filter: &EventFilter) -> Vec<Event> {
        let events = self.events.read().await;
        let mut matched: Vec<Event> = events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
