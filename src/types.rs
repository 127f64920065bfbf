use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Registered destination for webhook deliveries.
///
/// Subscriptions are owned by an external administrative surface. The
/// pipeline only reads them: the dispatcher to decide who receives an
/// event, the worker to sign and address each delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Logical identifier for the subscription.
    pub id: SubscriptionId,

    /// Target URL for webhook delivery.
    pub url: String,

    /// Shared secret used to sign every delivery.
    pub secret: String,

    /// Inactive subscriptions receive nothing.
    pub active: bool,

    /// Event types this subscription listens for.
    pub events: BTreeSet<String>,
}

impl Subscription {
    /// Create an active subscription listening to no events.
    pub fn new(id: impl Into<String>, url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: SubscriptionId(id.into()),
            url: url.into(),
            secret: secret.into(),
            active: true,
            events: BTreeSet::new(),
        }
    }

    /// Add event types to listen for.
    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events.extend(events.into_iter().map(Into::into));
        self
    }

    /// Set the active flag.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Whether this subscription should receive `event_type` right now.
    pub fn matches(&self, event_type: &str) -> bool {
        self.active && self.events.contains(event_type)
    }
}

/// A fact emitted by business logic, e.g. `process.created`.
///
/// The payload shape is opaque to the pipeline beyond being JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub actor_id: Option<String>,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            actor_id: None,
        }
    }

    /// Attach the user that caused the event.
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

/// Unique identifier for a subscription.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a delivery record, scoped under its subscription.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub String);

impl DeliveryId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery lifecycle status.
///
/// `Pending` is the only initial state. `Delivered` and `Failed` are
/// terminal unless an operator explicitly redelivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// Durable record of delivering one domain event to one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: DeliveryId,
    pub subscription_id: SubscriptionId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response_status: Option<u16>,
    #[serde(default)]
    pub response_headers: Option<BTreeMap<String, String>>,
    /// Number of attempts made, not a retry budget.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error: Option<String>,
}

impl DeliveryRecord {
    /// New pending record for `event` addressed to `subscription_id`.
    pub fn pending(subscription_id: SubscriptionId, event: &DomainEvent) -> Self {
        Self {
            id: DeliveryId::generate(),
            subscription_id,
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            status: DeliveryStatus::Pending,
            created_at: Utc::now(),
            delivered_at: None,
            response_status: None,
            response_headers: None,
            retry_count: 0,
            error: None,
        }
    }

    /// Apply an attempt update the same way every store does.
    pub fn apply(&mut self, update: &AttemptUpdate) {
        self.status = update.status;
        self.delivered_at = update.delivered_at;
        self.response_status = update.response_status;
        self.response_headers = update.response_headers.clone();
        self.error = update.error.clone();
        if update.counts_as_attempt {
            self.retry_count = self.retry_count.saturating_add(1);
        }
    }
}

/// Outcome fields written back to a delivery record.
///
/// Every field overwrites the stored value, so a redelivery never leaves
/// stale diagnostics from an earlier attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptUpdate {
    pub status: DeliveryStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub response_status: Option<u16>,
    pub response_headers: Option<BTreeMap<String, String>>,
    pub error: Option<String>,
    /// Increment `retry_count` when applied.
    pub counts_as_attempt: bool,
}

impl AttemptUpdate {
    /// An HTTP response was received.
    pub fn responded(status: u16, headers: BTreeMap<String, String>) -> Self {
        let delivered = (200..300).contains(&status);
        Self {
            status: if delivered { DeliveryStatus::Delivered } else { DeliveryStatus::Failed },
            delivered_at: Some(Utc::now()),
            response_status: Some(status),
            response_headers: Some(headers),
            error: None,
            counts_as_attempt: true,
        }
    }

    /// No HTTP response was obtained.
    pub fn unreachable(error: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            delivered_at: None,
            response_status: None,
            response_headers: None,
            error: Some(error.into()),
            counts_as_attempt: true,
        }
    }

    /// The delivery was abandoned before any attempt was made.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            delivered_at: None,
            response_status: None,
            response_headers: None,
            error: Some(reason.into()),
            counts_as_attempt: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscription_matches_only_when_active_and_listening() {
        let sub = Subscription::new("s1", "http://localhost/hook", "secret")
            .with_events(["process.created"]);
        assert!(sub.matches("process.created"));
        assert!(!sub.matches("analysis.completed"));
        assert!(!sub.with_active(false).matches("process.created"));
    }

    #[test]
    fn pending_record_copies_event() {
        let event = DomainEvent::new("process.created", json!({"id": "p-1"}));
        let record = DeliveryRecord::pending(SubscriptionId("s1".into()), &event);
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.event_type, "process.created");
        assert_eq!(record.payload, json!({"id": "p-1"}));
        assert!(record.delivered_at.is_none());
    }

    #[test]
    fn responded_update_maps_status_range() {
        assert_eq!(AttemptUpdate::responded(204, BTreeMap::new()).status, DeliveryStatus::Delivered);
        assert_eq!(AttemptUpdate::responded(302, BTreeMap::new()).status, DeliveryStatus::Failed);
        assert_eq!(AttemptUpdate::responded(500, BTreeMap::new()).status, DeliveryStatus::Failed);
    }

    #[test]
    fn aborted_update_does_not_count_as_attempt() {
        let event = DomainEvent::new("process.created", json!({}));
        let mut record = DeliveryRecord::pending(SubscriptionId("s1".into()), &event);
        record.apply(&AttemptUpdate::aborted("subscription_inactive"));
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.error.as_deref(), Some("subscription_inactive"));

        record.apply(&AttemptUpdate::unreachable("connection refused"));
        assert_eq!(record.retry_count, 1);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [DeliveryStatus::Pending, DeliveryStatus::Delivered, DeliveryStatus::Failed] {
            assert_eq!(status.as_str().parse::<DeliveryStatus>(), Ok(status));
        }
        assert!("retrying".parse::<DeliveryStatus>().is_err());
    }
}
