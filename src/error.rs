use uuid::Uuid;

// ============================================================================
// Error Taxonomy
// ============================================================================
//
// Configuration errors are rejected synchronously at registry mutation time
// and never stored. Transient delivery errors live in the dispatcher
// (`AttemptError`) and are recorded on the Delivery record instead of being
// thrown to producers.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid webhook URL: {0}")]
    InvalidUrl(String),

    #[error("Subscription must list at least one event type")]
    EmptyEventTypes,

    #[error("max_retries out of range [0, 10]: {0}")]
    MaxRetriesOutOfRange(u32),

    #[error("retry_delay_ms out of range [100, 300000]: {0}")]
    RetryDelayOutOfRange(u64),

    #[error("backoff_multiplier out of range [1.0, 5.0]: {0}")]
    BackoffMultiplierOutOfRange(f64),

    #[error("timeout_ms out of range [1000, 30000]: {0}")]
    TimeoutOutOfRange(u64),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(Uuid),

    #[error("{failed} of {total} handlers failed for event {event_id}")]
    HandlerFailures {
        event_id: Uuid,
        failed: usize,
        total: usize,
        details: Vec<String>,
    },
}
