use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::RelayError;
use crate::models::{NewSubscription, RetryPolicy, Subscription, SubscriptionUpdate};

// ============================================================================
// Subscription Registry
// ============================================================================
//
// CRUD store of delivery targets and their matching rules. Configuration
// errors (bad URL, out-of-range retry parameters) are rejected here,
// synchronously, and never stored.
//
// ============================================================================

const MAX_RETRIES_MAX: u32 = 10;
const RETRY_DELAY_MS_MIN: u64 = 100;
const RETRY_DELAY_MS_MAX: u64 = 300_000;
const BACKOFF_MULTIPLIER_MIN: f64 = 1.0;
const BACKOFF_MULTIPLIER_MAX: f64 = 5.0;
const TIMEOUT_MS_MIN: u64 = 1_000;
const TIMEOUT_MS_MAX: u64 = 30_000;

pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and store a new subscription.
    pub async fn create(&self, request: NewSubscription) -> Result<Subscription, RelayError> {
        validate_url(&request.url)?;
        if request.events.is_empty() {
            return Err(RelayError::EmptyEventTypes);
        }
        validate_retry_policy(&request.retry_policy)?;
        validate_timeout(request.timeout_ms)?;

        let now = Utc::now();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            name: request.name,
            url: request.url,
            events: request.events,
            secret: request.secret,
            is_active: request.is_active,
            retry_policy: request.retry_policy,
            filters: request.filters,
            headers: request.headers,
            timeout_ms: request.timeout_ms,
            created_at: now,
            updated_at: now,
        };

        tracing::info!(
            subscription_id = %subscription.id,
            name = %subscription.name,
            url = %subscription.url,
            events = ?subscription.events,
            "Subscription created"
        );

        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    pub async fn get(&self, id: Uuid) -> Option<Subscription> {
        self.subscriptions.read().await.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<Subscription> {
        self.subscriptions.read().await.values().cloned().collect()
    }

    pub async fn list_active(&self) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect()
    }

    /// Active subscriptions whose event filter matches `event_type`.
    pub async fn matching(&self, event_type: &str) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.matches(event_type))
            .cloned()
            .collect()
    }

    /// Partial merge: only provided fields change; `updated_at` always
    /// refreshes. Provided fields are re-validated before anything mutates.
    pub async fn update(
        &self,
        id: Uuid,
        patch: SubscriptionUpdate,
    ) -> Result<Subscription, RelayError> {
        if let Some(url) = &patch.url {
            validate_url(url)?;
        }
        if let Some(events) = &patch.events {
            if events.is_empty() {
                return Err(RelayError::EmptyEventTypes);
            }
        }
        if let Some(retry_policy) = &patch.retry_policy {
            validate_retry_policy(retry_policy)?;
        }
        if let Some(timeout_ms) = patch.timeout_ms {
            validate_timeout(timeout_ms)?;
        }

        let mut subscriptions = self.subscriptions.write().await;
        let subscription = subscriptions
            .get_mut(&id)
            .ok_or(RelayError::SubscriptionNotFound(id))?;

        if let Some(name) = patch.name {
            subscription.name = name;
        }
        if let Some(url) = patch.url {
            subscription.url = url;
        }
        if let Some(events) = patch.events {
            subscription.events = events;
        }
        if let Some(secret) = patch.secret {
            subscription.secret = Some(secret);
        }
        if let Some(is_active) = patch.is_active {
            subscription.is_active = is_active;
        }
        if let Some(retry_policy) = patch.retry_policy {
            subscription.retry_policy = retry_policy;
        }
        if let Some(filters) = patch.filters {
            subscription.filters = Some(filters);
        }
        if let Some(headers) = patch.headers {
            subscription.headers = Some(headers);
        }
        if let Some(timeout_ms) = patch.timeout_ms {
            subscription.timeout_ms = timeout_ms;
        }
        subscription.updated_at = Utc::now();

        tracing::info!(subscription_id = %id, "Subscription updated");
        Ok(subscription.clone())
    }

    /// Unconditional removal; returns whether an entry existed.
    pub async fn delete(&self, id: Uuid) -> bool {
        let removed = self.subscriptions.write().await.remove(&id).is_some();
        if removed {
            tracing::info!(subscription_id = %id, "Subscription deleted");
        }
        removed
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Validation
// ============================================================================

fn validate_url(url: &str) -> Result<(), RelayError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|_| RelayError::InvalidUrl(url.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RelayError::InvalidUrl(url.to_string()));
    }
    Ok(())
}

fn validate_retry_policy(policy: &RetryPolicy) -> Result<(), RelayError> {
    if policy.max_retries > MAX_RETRIES_MAX {
        return Err(RelayError::MaxRetriesOutOfRange(policy.max_retries));
    }
    if policy.retry_delay_ms < RETRY_DELAY_MS_MIN || policy.retry_delay_ms > RETRY_DELAY_MS_MAX {
        return Err(RelayError::RetryDelayOutOfRange(policy.retry_delay_ms));
    }
    if policy.backoff_multiplier < BACKOFF_MULTIPLIER_MIN
        || policy.backoff_multiplier > BACKOFF_MULTIPLIER_MAX
    {
        return Err(RelayError::BackoffMultiplierOutOfRange(
            policy.backoff_multiplier,
        ));
    }
    Ok(())
}

fn validate_timeout(timeout_ms: u64) -> Result<(), RelayError> {
    if !(TIMEOUT_MS_MIN..=TIMEOUT_MS_MAX).contains(&timeout_ms) {
        return Err(RelayError::TimeoutOutOfRange(timeout_ms));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
