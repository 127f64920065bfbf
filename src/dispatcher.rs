use std::sync::Arc;

use tracing::{debug, error, info};

use crate::error::DispatchError;
use crate::store::{DeliveryStore, SubscriptionStore};
use crate::telemetry::{metric_add, metric_inc};
use crate::types::{DeliveryRecord, DomainEvent};

/// Expands one domain event into one pending delivery record per
/// matching active subscription.
#[derive(Clone)]
pub struct FanOutDispatcher {
    subscriptions: Arc<dyn SubscriptionStore>,
    deliveries: Arc<dyn DeliveryStore>,
}

impl FanOutDispatcher {
    pub fn new(subscriptions: Arc<dyn SubscriptionStore>, deliveries: Arc<dyn DeliveryStore>) -> Self {
        Self {
            subscriptions,
            deliveries,
        }
    }

    /// Create the delivery records for `event`.
    ///
    /// All records are written in one atomic batch. Zero matches is not
    /// an error and writes nothing.
    pub async fn dispatch(&self, event: &DomainEvent) -> Result<Vec<DeliveryRecord>, DispatchError> {
        metric_inc("webhook.fanout.events");

        let matches = self
            .subscriptions
            .find_active_for_event(&event.event_type)
            .await
            .map_err(|source| self.fail(event, source))?;

        if matches.is_empty() {
            debug!(event_type = %event.event_type, "no subscriptions for event");
            return Ok(Vec::new());
        }

        let records: Vec<DeliveryRecord> = matches
            .into_iter()
            .map(|sub| DeliveryRecord::pending(sub.id, event))
            .collect();

        self.deliveries
            .insert_batch(&records)
            .await
            .map_err(|source| self.fail(event, source))?;

        metric_add("webhook.fanout.deliveries", records.len() as u64);
        info!(
            event_type = %event.event_type,
            actor_id = event.actor_id.as_deref().unwrap_or("-"),
            deliveries = records.len(),
            "fanned out event"
        );

        Ok(records)
    }

    fn fail(&self, event: &DomainEvent, source: crate::error::StoreError) -> DispatchError {
        metric_inc("webhook.fanout.failure");
        error!(event_type = %event.event_type, error = %source, "fan-out failed");
        DispatchError::FanOut {
            event_type: event.event_type.clone(),
            source,
        }
    }
}
