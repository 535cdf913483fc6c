use chrono::Utc;
use futures_util::future::BoxFuture;
use reqwest::Client;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::models::{
    Delivery, DeliveryResponse, DeliveryStatus, Event, RetryPolicy, Subscription,
};
use crate::signer;
use crate::store::DeliveryLog;

// ============================================================================
// Delivery Dispatcher - Webhook Attempt State Machine
// ============================================================================
//
// Turns a matched (subscription, event) pair into a series of HTTP attempts:
//
//   pending --attempt--> delivered            (2xx, terminal)
//   pending --attempt--> retrying             (failure, attempts left)
//   pending --attempt--> failed               (failure, exhausted, terminal)
//   retrying --timer fires--> pending         (re-attempt)
//
// Attempts within one delivery are strictly sequential; deliveries for
// different subscriptions proceed independently. Retry timers are held in a
// cancellable registry keyed by delivery id, so deleting or deactivating a
// subscription stops its in-flight retries instead of firing them against a
// stale target.
//
// ============================================================================

pub const USER_AGENT: &str = "EventRelay-Webhooks/1.0";

/// Transient attempt failure. Recorded on the Delivery record and fed into
/// the retry path; never surfaced to event producers.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("endpoint returned status {status}")]
    Status { status: u16, body: String },

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("request failed: {0}")]
    Request(String),
}

pub struct Dispatcher {
    client: Client,
    deliveries: Arc<DeliveryLog>,
    timers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(deliveries: Arc<DeliveryLog>, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            deliveries,
            timers: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    /// Create a pending delivery record for a matched (subscription, event)
    /// pair and launch the first attempt without blocking the caller.
    pub async fn create_delivery(
        self: &Arc<Self>,
        subscription: &Subscription,
        event: &Event,
    ) -> Delivery {
        let delivery = Delivery::new(subscription, event.id);
        self.deliveries.insert(delivery.clone()).await;
        self.metrics.record_delivery_created();

        tracing::debug!(
            delivery_id = %delivery.id,
            subscription_id = %subscription.id,
            event_id = %event.id,
            url = %delivery.url,
            "Delivery created"
        );

        let dispatcher = Arc::clone(self);
        let subscription = subscription.clone();
        let event = event.clone();
        let delivery_id = delivery.id;
        tokio::spawn(async move {
            dispatcher.attempt(subscription, event, delivery_id).await;
        });

        delivery
    }

    /// Cancel pending retry timers for a subscription (on delete or
    /// deactivate) and finalize the affected deliveries as failed. Returns
    /// how many deliveries were finalized.
    pub async fn cancel_for_subscription(&self, subscription_id: Uuid) -> usize {
        let in_flight: Vec<Uuid> = self
            .deliveries
            .list(Some(subscription_id))
            .await
            .into_iter()
            .filter(|d| !d.status.is_terminal())
            .map(|d| d.id)
            .collect();

        let mut cancelled = 0;
        let mut timers = self.timers.lock().await;
        for delivery_id in in_flight {
            if let Some(handle) = timers.remove(&delivery_id) {
                handle.abort();
            }
            let finalized = self
                .deliveries
                .update(delivery_id, |d| {
                    d.status = DeliveryStatus::Failed;
                    d.failed_at = Some(Utc::now());
                    d.next_retry_at = None;
                    d.error =
                        Some("subscription deleted or deactivated before delivery completed"
                            .to_string());
                })
                .await;
            if finalized.is_some() {
                cancelled += 1;
                self.metrics.record_delivery_cancelled();
            }
        }

        if cancelled > 0 {
            tracing::info!(
                subscription_id = %subscription_id,
                cancelled = cancelled,
                "Cancelled in-flight deliveries for removed subscription"
            );
        }
        cancelled
    }

    /// One attempt of the state machine. Boxed because the retry timer task
    /// re-enters this function.
    fn attempt(
        self: Arc<Self>,
        subscription: Subscription,
        event: Event,
        delivery_id: Uuid,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            // Claim the attempt; a None here means the record was finalized
            // (e.g. cancelled) while this task was waiting.
            let delivery = match self
                .deliveries
                .update(delivery_id, |d| d.attempts += 1)
                .await
            {
                Some(delivery) => delivery,
                None => return,
            };
            let attempt_no = delivery.attempts;

            tracing::debug!(
                delivery_id = %delivery_id,
                attempt = attempt_no,
                max_attempts = delivery.max_attempts,
                url = %subscription.url,
                "Attempting webhook delivery"
            );

            match self.send(&subscription, &event).await {
                Ok(response) => {
                    self.metrics.record_attempt(true);
                    let status_code = response.status_code;
                    let applied = self
                        .deliveries
                        .update(delivery_id, |d| {
                            d.status = DeliveryStatus::Delivered;
                            d.delivered_at = Some(Utc::now());
                            d.next_retry_at = None;
                            d.response = Some(response);
                        })
                        .await;
                    self.timers.lock().await.remove(&delivery_id);

                    // None means the record was finalized concurrently
                    if applied.is_some() {
                        self.metrics.record_delivered();
                        tracing::info!(
                            delivery_id = %delivery_id,
                            subscription_id = %subscription.id,
                            event_id = %event.id,
                            attempt = attempt_no,
                            status_code = status_code,
                            "Webhook delivered"
                        );
                    }
                }
                Err(error) => {
                    self.metrics.record_attempt(false);

                    if attempt_no < delivery.max_attempts {
                        let delay_ms = backoff_delay_ms(&subscription.retry_policy, attempt_no);
                        let next_retry_at =
                            Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);

                        let applied = self
                            .deliveries
                            .update(delivery_id, |d| {
                                d.status = DeliveryStatus::Retrying;
                                d.error = Some(error.to_string());
                                d.next_retry_at = Some(next_retry_at);
                            })
                            .await;
                        if applied.is_none() {
                            // Finalized concurrently (cancelled); nothing to schedule
                            return;
                        }
                        self.metrics.record_retry_scheduled();

                        tracing::warn!(
                            delivery_id = %delivery_id,
                            attempt = attempt_no,
                            max_attempts = delivery.max_attempts,
                            error = %error,
                            delay_ms = delay_ms,
                            "Webhook delivery failed, retry scheduled"
                        );

                        let dispatcher = Arc::clone(&self);
                        let handle = tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                            // Timer fired: back to pending, then re-attempt.
                            dispatcher
                                .deliveries
                                .update(delivery_id, |d| {
                                    d.status = DeliveryStatus::Pending;
                                    d.next_retry_at = None;
                                })
                                .await;
                            dispatcher.attempt(subscription, event, delivery_id).await;
                        });
                        self.timers.lock().await.insert(delivery_id, handle);
                    } else {
                        self.deliveries
                            .update(delivery_id, |d| {
                                d.status = DeliveryStatus::Failed;
                                d.failed_at = Some(Utc::now());
                                d.next_retry_at = None;
                                d.error = Some(error.to_string());
                            })
                            .await;
                        self.metrics.record_exhausted();
                        self.timers.lock().await.remove(&delivery_id);

                        tracing::error!(
                            delivery_id = %delivery_id,
                            subscription_id = %subscription.id,
                            event_id = %event.id,
                            attempts = attempt_no,
                            error = %error,
                            "Webhook delivery failed after all attempts"
                        );
                    }
                }
            }
        })
    }

    /// Issue one HTTP POST to the subscription endpoint. Any 2xx status is a
    /// success; everything else (non-2xx, connect failure, timeout) is a
    /// transient failure subject to retry.
    async fn send(
        &self,
        subscription: &Subscription,
        event: &Event,
    ) -> Result<DeliveryResponse, AttemptError> {
        let payload =
            serde_json::to_string(event).map_err(|e| AttemptError::Request(e.to_string()))?;

        let mut request = self
            .client
            .post(&subscription.url)
            .timeout(Duration::from_millis(subscription.timeout_ms))
            .header("Content-Type", "application/json")
            .header("X-Webhook-Event", &event.event_type)
            .header("X-Webhook-Source", &event.source);

        if let Some(headers) = &subscription.headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }
        if let Some(secret) = &subscription.secret {
            request = request.header("X-Webhook-Signature", signer::sign(&payload, secret));
        }

        let response = request.body(payload).send().await.map_err(|e| {
            if e.is_timeout() {
                AttemptError::Timeout(subscription.timeout_ms)
            } else if e.is_connect() {
                AttemptError::Network(e.to_string())
            } else {
                AttemptError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            Ok(DeliveryResponse {
                status_code: status.as_u16(),
                headers,
                body,
            })
        } else {
            Err(AttemptError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Backoff law: after the k-th failed attempt the retry delay is
/// `retry_delay_ms * backoff_multiplier^(k-1)`.
pub fn backoff_delay_ms(policy: &RetryPolicy, failed_attempts: u32) -> u64 {
    let exponent = failed_attempts.saturating_sub(1);
    (policy.retry_delay_ms as f64 * policy.backoff_multiplier.powi(exponent as i32)) as u64
}

// ============================================================================
// Tests
// ============================================================================
