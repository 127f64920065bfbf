use std::fmt;

use thiserror::Error;

use crate::types::{DeliveryId, SubscriptionId};

/// Failures raised by a subscription or delivery store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A record with the same key already exists.
    #[error("delivery {delivery_id} for subscription {subscription_id} already exists")]
    Conflict {
        subscription_id: SubscriptionId,
        delivery_id: DeliveryId,
    },

    /// The addressed delivery record does not exist.
    #[error("delivery {delivery_id} for subscription {subscription_id} not found")]
    NotFound {
        subscription_id: SubscriptionId,
        delivery_id: DeliveryId,
    },

    /// Stored data could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
}

/// Errors returned to the event source when fan-out does not happen.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Querying subscriptions or writing the delivery batch failed.
    /// No delivery records are visible for the event.
    #[error("delivery fan-out failed for {event_type}: {source}")]
    FanOut {
        event_type: String,
        #[source]
        source: StoreError,
    },

    /// The pipeline has been shut down.
    #[error("pipeline is shut down")]
    Shutdown,

    /// The records were committed but the workers stopped before they
    /// could be queued. They stay `pending` until redelivered.
    #[error("{} deliveries created but not queued: workers stopped", .unqueued.len())]
    NotQueued {
        unqueued: Vec<(SubscriptionId, DeliveryId)>,
    },
}

/// Invalid configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },

    #[error("failed to build http client: {0}")]
    HttpClient(String),
}

/// Result of one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The endpoint answered with a 2xx status.
    Delivered { response_status: u16 },
    Failed(FailureReason),
    /// No HTTP call was made.
    Dropped(DropReason),
}

/// Reasons why a delivery was dropped *without* an HTTP attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    SubscriptionNotFound,
    SubscriptionInactive,

    /// The record already reached a terminal status.
    AlreadyTerminal,

    /// Another invocation holds the record and is sending it.
    InFlight,
}

impl DropReason {
    /// Reason code written to the record's `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            DropReason::SubscriptionNotFound => "subscription_not_found",
            DropReason::SubscriptionInactive => "subscription_inactive",
            DropReason::AlreadyTerminal => "already_terminal",
            DropReason::InFlight => "in_flight",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Reasons why a delivery ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The endpoint answered outside the 2xx range.
    HttpStatus(u16),
    Timeout(String),
    Network(String),
    /// The subscription has no signing secret.
    MissingSecret,
    /// The signing key was rejected by HMAC.
    InvalidSecret(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::HttpStatus(status) =>
                write!(f, "remote endpoint returned {status}"),
            FailureReason::Timeout(msg) =>
                write!(f, "request timed out: {msg}"),
            FailureReason::Network(msg) =>
                write!(f, "network error: {msg}"),
            FailureReason::MissingSecret =>
                write!(f, "missing_secret"),
            FailureReason::InvalidSecret(msg) =>
                write!(f, "invalid_secret: {msg}"),
        }
    }
}
