use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::error::StoreError;
use crate::types::{AttemptUpdate, DeliveryId, DeliveryRecord, Subscription, SubscriptionId};

/// Read access to webhook subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Active subscriptions listening for `event_type`.
    async fn find_active_for_event(&self, event_type: &str) -> Result<Vec<Subscription>, StoreError>;

    async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError>;
}

/// Persistent log of delivery records.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert all records or none of them.
    async fn insert_batch(&self, records: &[DeliveryRecord]) -> Result<(), StoreError>;

    async fn get_delivery(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<Option<DeliveryRecord>, StoreError>;

    /// Mark a `pending` record as in flight.
    ///
    /// Returns `false` if the record is terminal or another invocation
    /// already holds it. Check and mark happen as one atomic step, so of
    /// several concurrent callers at most one gets `true`.
    async fn claim_pending(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<bool, StoreError>;

    /// Drop an in-flight mark without recording an attempt.
    async fn release_claim(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<(), StoreError>;

    /// Write back an attempt outcome, clear any in-flight mark and return
    /// the updated record.
    ///
    /// The `retry_count` increment must be atomic in the backend so that
    /// duplicate invocations never lose a count.
    async fn record_attempt(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
        update: &AttemptUpdate,
    ) -> Result<DeliveryRecord, StoreError>;

    /// All records of a subscription, oldest first.
    async fn list_deliveries(&self, subscription_id: &SubscriptionId) -> Result<Vec<DeliveryRecord>, StoreError>;
}

type DeliveryKey = (SubscriptionId, DeliveryId);

#[derive(Default)]
struct DeliveryTable {
    records: HashMap<DeliveryKey, DeliveryRecord>,
    in_flight: HashSet<DeliveryKey>,
}

/// In-memory store for tests and embedded deployments.
#[derive(Default)]
pub struct InMemoryStore {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    deliveries: Mutex<DeliveryTable>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a subscription.
    pub async fn upsert_subscription(&self, subscription: Subscription) {
        self.subscriptions
            .write()
            .await
            .insert(subscription.id.clone(), subscription);
    }

    /// Flip a subscription's active flag. Returns `false` if it does not exist.
    pub async fn set_active(&self, id: &SubscriptionId, active: bool) -> bool {
        match self.subscriptions.write().await.get_mut(id) {
            Some(sub) => {
                sub.active = active;
                true
            }
            None => false,
        }
    }

    pub async fn remove_subscription(&self, id: &SubscriptionId) -> Option<Subscription> {
        self.subscriptions.write().await.remove(id)
    }

    /// Make every store operation fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Total number of delivery records across all subscriptions.
    pub async fn delivery_count(&self) -> usize {
        self.deliveries.lock().await.records.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn find_active_for_event(&self, event_type: &str) -> Result<Vec<Subscription>, StoreError> {
        self.check_available()?;
        let guard = self.subscriptions.read().await;
        let mut matches: Vec<Subscription> = guard
            .values()
            .filter(|sub| sub.matches(event_type))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }

    async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        self.check_available()?;
        Ok(self.subscriptions.read().await.get(id).cloned())
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStore {
    async fn insert_batch(&self, records: &[DeliveryRecord]) -> Result<(), StoreError> {
        self.check_available()?;
        let mut guard = self.deliveries.lock().await;

        // Validate the whole batch before touching the map.
        let mut seen = HashSet::with_capacity(records.len());
        for record in records {
            let key = (record.subscription_id.clone(), record.id.clone());
            if guard.records.contains_key(&key) || !seen.insert(key) {
                return Err(StoreError::Conflict {
                    subscription_id: record.subscription_id.clone(),
                    delivery_id: record.id.clone(),
                });
            }
        }

        for record in records {
            guard.records.insert(
                (record.subscription_id.clone(), record.id.clone()),
                record.clone(),
            );
        }
        Ok(())
    }

    async fn get_delivery(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        self.check_available()?;
        let guard = self.deliveries.lock().await;
        Ok(guard
            .records
            .get(&(subscription_id.clone(), delivery_id.clone()))
            .cloned())
    }

    async fn claim_pending(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut guard = self.deliveries.lock().await;
        let key = (subscription_id.clone(), delivery_id.clone());
        let record = guard.records.get(&key).ok_or_else(|| StoreError::NotFound {
            subscription_id: subscription_id.clone(),
            delivery_id: delivery_id.clone(),
        })?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        Ok(guard.in_flight.insert(key))
    }

    async fn release_claim(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.deliveries
            .lock()
            .await
            .in_flight
            .remove(&(subscription_id.clone(), delivery_id.clone()));
        Ok(())
    }

    async fn record_attempt(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
        update: &AttemptUpdate,
    ) -> Result<DeliveryRecord, StoreError> {
        self.check_available()?;
        let mut guard = self.deliveries.lock().await;
        let key = (subscription_id.clone(), delivery_id.clone());
        let record = guard.records.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            subscription_id: subscription_id.clone(),
            delivery_id: delivery_id.clone(),
        })?;
        record.apply(update);
        let updated = record.clone();
        guard.in_flight.remove(&key);
        Ok(updated)
    }

    async fn list_deliveries(&self, subscription_id: &SubscriptionId) -> Result<Vec<DeliveryRecord>, StoreError> {
        self.check_available()?;
        let guard = self.deliveries.lock().await;
        let mut records: Vec<DeliveryRecord> = guard
            .records
            .values()
            .filter(|r| &r.subscription_id == subscription_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::{DeliveryStatus, DomainEvent};

    fn event() -> DomainEvent {
        DomainEvent::new("analysis.completed", json!({"analysis_id": "a-1", "score": 0.93}))
    }

    #[tokio::test]
    async fn finds_only_active_matching_subscriptions() {
        let store = InMemoryStore::new();
        store
            .upsert_subscription(Subscription::new("a", "http://a", "s").with_events(["analysis.completed"]))
            .await;
        store
            .upsert_subscription(Subscription::new("b", "http://b", "s").with_events(["process.created"]))
            .await;
        store
            .upsert_subscription(
                Subscription::new("c", "http://c", "s")
                    .with_events(["analysis.completed"])
                    .with_active(false),
            )
            .await;

        let found = store.find_active_for_event("analysis.completed").await.unwrap();
        let ids: Vec<&str> = found.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn batch_with_duplicate_key_writes_nothing() {
        let store = InMemoryStore::new();
        let first = DeliveryRecord::pending(SubscriptionId("a".into()), &event());
        let mut dup = DeliveryRecord::pending(SubscriptionId("b".into()), &event());
        dup.id = first.id.clone();
        dup.subscription_id = first.subscription_id.clone();
        let other = DeliveryRecord::pending(SubscriptionId("c".into()), &event());

        let err = store.insert_batch(&[first, other, dup]).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(store.delivery_count().await, 0);
    }

    #[tokio::test]
    async fn record_attempt_increments_and_overwrites() {
        let store = InMemoryStore::new();
        let record = DeliveryRecord::pending(SubscriptionId("a".into()), &event());
        store.insert_batch(std::slice::from_ref(&record)).await.unwrap();

        let updated = store
            .record_attempt(&record.subscription_id, &record.id, &AttemptUpdate::unreachable("refused"))
            .await
            .unwrap();
        assert_eq!(updated.status, DeliveryStatus::Failed);
        assert_eq!(updated.retry_count, 1);

        let stored = store
            .get_delivery(&record.subscription_id, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, updated);
    }

    #[tokio::test]
    async fn only_one_claim_per_pending_record() {
        let store = InMemoryStore::new();
        let record = DeliveryRecord::pending(SubscriptionId("a".into()), &event());
        store.insert_batch(std::slice::from_ref(&record)).await.unwrap();
        let (sub, id) = (&record.subscription_id, &record.id);

        assert!(store.claim_pending(sub, id).await.unwrap());
        assert!(!store.claim_pending(sub, id).await.unwrap());

        store.release_claim(sub, id).await.unwrap();
        assert!(store.claim_pending(sub, id).await.unwrap());

        // Recording the attempt clears the mark; the record is now terminal.
        store
            .record_attempt(sub, id, &AttemptUpdate::unreachable("refused"))
            .await
            .unwrap();
        assert!(!store.claim_pending(sub, id).await.unwrap());
    }

    #[tokio::test]
    async fn record_attempt_on_unknown_delivery_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .record_attempt(
                &SubscriptionId("a".into()),
                &DeliveryId("missing".into()),
                &AttemptUpdate::unreachable("refused"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.find_active_for_event("process.created").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.insert_batch(&[]).await.is_err());

        store.set_unavailable(false);
        assert!(store.find_active_for_event("process.created").await.unwrap().is_empty());
    }
}
