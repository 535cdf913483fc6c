use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// ============================================================================
// Domain Models
// ============================================================================
//
// Core records of the event bus:
// - Event: immutable fact accepted into the store
// - Subscription: registered HTTP target with matching rule and retry policy
// - Delivery: per-(subscription, event) attempt history and outcome
//
// Maps use BTreeMap/BTreeSet so serialized JSON is canonical, which keeps
// HMAC signatures deterministic for identical payloads.
//
// ============================================================================

/// Event type wildcard: a subscription listing `"*"` receives every event.
pub const WILDCARD: &str = "*";

/// An immutable fact accepted into the event store.
///
/// Serializes to the outbound webhook body shape:
/// `{id, type, data, timestamp, source, version, metadata}`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: BTreeMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Event {
    pub fn new(event_type: &str, source: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            data: BTreeMap::new(),
            timestamp: Utc::now(),
            source: source.to_string(),
            version: "1.0".to_string(),
            metadata: None,
        }
    }

    pub fn with_data(mut self, key: &str, value: serde_json::Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }
}

/// Inclusive time window for event queries.
#[derive(Clone, Debug)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Query filter for the event store. Omitted fields impose no constraint;
/// all present filters are ANDed together.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub event_types: Option<BTreeSet<String>>,
    pub sources: Option<BTreeSet<String>>,
    pub data_filters: Option<BTreeMap<String, serde_json::Value>>,
    pub time_range: Option<TimeRange>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.contains(&event.source) {
                return false;
            }
        }
        if let Some(data_filters) = &self.data_filters {
            for (key, expected) in data_filters {
                if event.data.get(key) != Some(expected) {
                    return false;
                }
            }
        }
        if let Some(range) = &self.time_range {
            if event.timestamp < range.start || event.timestamp > range.end {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Retry/backoff parameters for a subscription.
///
/// After the k-th failed attempt the next retry is scheduled
/// `retry_delay_ms * backoff_multiplier^(k-1)` milliseconds out.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

/// A registered webhook delivery target.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Subscription {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub events: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub is_active: bool,
    pub retry_policy: RetryPolicy,
    /// Reserved equality constraints on event data; not evaluated yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Matching rule: active, and the event type is listed or wildcarded.
    pub fn matches(&self, event_type: &str) -> bool {
        self.is_active && (self.events.contains(event_type) || self.events.contains(WILDCARD))
    }
}

/// Creation request for a subscription. Validated by the registry before
/// anything is stored.
#[derive(Deserialize, Clone, Debug)]
pub struct NewSubscription {
    pub name: String,
    pub url: String,
    pub events: BTreeSet<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_is_active")]
    pub is_active: bool,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub filters: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_is_active() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl NewSubscription {
    pub fn new(name: &str, url: &str, events: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            events: events.iter().map(|e| e.to_string()).collect(),
            secret: None,
            is_active: true,
            retry_policy: RetryPolicy::default(),
            filters: None,
            headers: None,
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_secret(mut self, secret: &str) -> Self {
        self.secret = Some(secret.to_string());
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Partial update for a subscription; only provided fields change.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct SubscriptionUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub events: Option<BTreeSet<String>>,
    pub secret: Option<String>,
    pub is_active: Option<bool>,
    pub retry_policy: Option<RetryPolicy>,
    pub filters: Option<BTreeMap<String, String>>,
    pub headers: Option<BTreeMap<String, String>>,
    pub timeout_ms: Option<u64>,
}

// ============================================================================
// Deliveries
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Retrying,
}

impl DeliveryStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

/// Response captured from the receiver on a successful attempt.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeliveryResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// One attempt-series for a single (subscription, event) pair.
///
/// Invariant: `0 <= attempts <= max_attempts` at all times.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Delivery {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_id: Uuid,
    /// Snapshot of the subscription URL at creation time.
    pub url: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub response: Option<DeliveryResponse>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    /// Instantiate a pending delivery for a matched (subscription, event)
    /// pair. `max_retries = 0` still allows the one initial attempt, so the
    /// attempts invariant holds.
    pub fn new(subscription: &Subscription, event_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            subscription_id: subscription.id,
            event_id,
            url: subscription.url.clone(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts: subscription.retry_policy.max_retries.max(1),
            next_retry_at: None,
            delivered_at: None,
            failed_at: None,
            response: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Rollup over delivery records, optionally scoped to one subscription.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct DeliveryStats {
    pub total: u64,
    pub delivered: u64,
    pub failed: u64,
    pub pending: u64,
    pub retrying: u64,
    pub success_rate: f64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_subscription(events: &[&str], is_active: bool) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            url: "https://example.com/hook".to_string(),
            events: events.iter().map(|e| e.to_string()).collect(),
            secret: None,
            is_active,
            retry_policy: RetryPolicy::default(),
            filters: None,
            headers: None,
            timeout_ms: 10_000,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_event_serializes_with_type_field() {
        let event = Event::new("payment.created", "billing").with_data("amount", json!(100));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "payment.created");
        assert_eq!(value["source"], "billing");
        assert_eq!(value["version"], "1.0");
        assert_eq!(value["data"]["amount"], 100);
        // No metadata key when none was set
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn test_event_builder_metadata() {
        let event = Event::new("user.created", "accounts").with_metadata("tenant", "acme");
        assert_eq!(
            event.metadata.unwrap().get("tenant"),
            Some(&"acme".to_string())
        );
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.retry_delay_ms, 1000);
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_subscription_matches_listed_type() {
        let sub = make_subscription(&["payment.created"], true);
        assert!(sub.matches("payment.created"));
        assert!(!sub.matches("payment.refunded"));
    }

    #[test]
    fn test_subscription_wildcard_matches_any_type() {
        let sub = make_subscription(&[WILDCARD], true);
        assert!(sub.matches("payment.created"));
        assert!(sub.matches("anything.else"));
    }

    #[test]
    fn test_inactive_subscription_never_matches() {
        let sub = make_subscription(&[WILDCARD], false);
        assert!(!sub.matches("payment.created"));
    }

    #[test]
    fn test_delivery_snapshots_subscription_config() {
        let sub = make_subscription(&["payment.created"], true);
        let delivery = Delivery::new(&sub, Uuid::new_v4());

        assert_eq!(delivery.url, sub.url);
        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempts, 0);
        assert_eq!(delivery.max_attempts, 3);
    }

    #[test]
    fn test_delivery_allows_one_attempt_with_zero_retries() {
        let mut sub = make_subscription(&["payment.created"], true);
        sub.retry_policy.max_retries = 0;
        let delivery = Delivery::new(&sub, Uuid::new_v4());
        assert_eq!(delivery.max_attempts, 1);
    }

    #[test]
    fn test_delivery_status_terminality() {
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_event_filter_ands_all_constraints() {
        let event = Event::new("payment.created", "billing").with_data("currency", json!("EUR"));

        let mut filter = EventFilter {
            event_types: Some(["payment.created".to_string()].into()),
            sources: Some(["billing".to_string()].into()),
            ..Default::default()
        };
        assert!(filter.matches(&event));

        filter.data_filters = Some(
            [("currency".to_string(), json!("USD"))]
                .into_iter()
                .collect(),
        );
        assert!(!filter.matches(&event));
    }

    #[test]
    fn test_event_filter_time_range_is_inclusive() {
        let event = Event::new("payment.created", "billing");
        let filter = EventFilter {
            time_range: Some(TimeRange {
                start: event.timestamp,
                end: event.timestamp,
            }),
            ..Default::default()
        };
        assert!(filter.matches(&event));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let event = Event::new("payment.created", "billing");
        assert!(EventFilter::default().matches(&event));
    }

    #[test]
    fn test_new_subscription_defaults_from_json() {
        let req: NewSubscription = serde_json::from_str(
            r#"{"name": "n", "url": "https://example.com", "events": ["payment.created"]}"#,
        )
        .unwrap();
        assert!(req.is_active);
        assert_eq!(req.timeout_ms, 10_000);
        assert_eq!(req.retry_policy, RetryPolicy::default());
    }
}
