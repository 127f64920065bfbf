use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::error::StoreError;
use crate::store::{DeliveryStore, SubscriptionStore};
use crate::types::{AttemptUpdate, DeliveryId, DeliveryRecord, Subscription, SubscriptionId};

/// Redis-backed subscription and delivery store.
///
/// Layout under `prefix`:
/// - `{prefix}:subscriptions` hash, subscription id → JSON
/// - `{prefix}:deliveries:{subscription}` hash, delivery id → JSON
/// - `{prefix}:attempts:{subscription}` hash, delivery id → attempt counter
/// - `{prefix}:claims:{subscription}` hash, delivery id → claim timestamp
///
/// The counter lives outside the JSON so concurrent invocations can
/// bump it with `HINCRBY` without a read-modify-write race.
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
    insert_script: redis::Script,
    claim_script: redis::Script,
}

// KEYS: (deliveries, attempts) per record. ARGV: (id, json, attempts) per record.
// Returns the 1-based index of the first conflicting record, or 0 once written.
const INSERT_BATCH_LUA: &str = r#"
local n = #KEYS / 2
local seen = {}
for i = 1, n do
    local hash, id = KEYS[2 * i - 1], ARGV[3 * i - 2]
    local slot = hash .. "\0" .. id
    if seen[slot] or redis.call("HEXISTS", hash, id) == 1 then
        return i
    end
    seen[slot] = true
end
for i = 1, n do
    local id = ARGV[3 * i - 2]
    redis.call("HSET", KEYS[2 * i - 1], id, ARGV[3 * i - 1])
    redis.call("HSET", KEYS[2 * i], id, ARGV[3 * i])
end
return 0
"#;

// KEYS: deliveries, claims. ARGV: id, timestamp.
// Returns -1 for a missing record, 1 when claimed, 0 otherwise.
const CLAIM_LUA: &str = r#"
local payload = redis.call("HGET", KEYS[1], ARGV[1])
if not payload then
    return -1
end
if cjson.decode(payload)["status"] ~= "pending" then
    return 0
end
return redis.call("HSETNX", KEYS[2], ARGV[1], ARGV[2])
"#;

impl RedisStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            insert_script: redis::Script::new(INSERT_BATCH_LUA),
            claim_script: redis::Script::new(CLAIM_LUA),
        }
    }

    /// Create or replace a subscription.
    pub async fn upsert_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(subscription)?;
        let _: () = conn
            .hset(self.subscriptions_key(), &subscription.id.0, payload)
            .await?;
        Ok(())
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn subscriptions_key(&self) -> String {
        format!("{}:subscriptions", self.prefix)
    }

    fn deliveries_key(&self, subscription_id: &SubscriptionId) -> String {
        format!("{}:deliveries:{}", self.prefix, subscription_id.0)
    }

    fn attempts_key(&self, subscription_id: &SubscriptionId) -> String {
        format!("{}:attempts:{}", self.prefix, subscription_id.0)
    }

    fn claims_key(&self, subscription_id: &SubscriptionId) -> String {
        format!("{}:claims:{}", self.prefix, subscription_id.0)
    }

    async fn load_delivery(
        &self,
        conn: &mut MultiplexedConnection,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        let (payload, attempts): (Option<String>, Option<u32>) = redis::pipe()
            .hget(self.deliveries_key(subscription_id), &delivery_id.0)
            .hget(self.attempts_key(subscription_id), &delivery_id.0)
            .query_async(conn)
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        let mut record: DeliveryRecord = serde_json::from_str(&payload)?;
        record.retry_count = attempts.unwrap_or(0);
        Ok(Some(record))
    }
}

#[async_trait]
impl SubscriptionStore for RedisStore {
    async fn find_active_for_event(&self, event_type: &str) -> Result<Vec<Subscription>, StoreError> {
        let mut conn = self.connection().await?;
        let all: HashMap<String, String> = conn.hgetall(self.subscriptions_key()).await?;

        let mut matches = Vec::new();
        for payload in all.values() {
            let sub: Subscription = serde_json::from_str(payload)?;
            if sub.matches(event_type) {
                matches.push(sub);
            }
        }
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }

    async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn.hget(self.subscriptions_key(), &id.0).await?;
        payload
            .map(|p| serde_json::from_str::<Subscription>(&p))
            .transpose()
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl DeliveryStore for RedisStore {
    async fn insert_batch(&self, records: &[DeliveryRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;

        // The conflict check and the writes run as one script.
        let mut invocation = self.insert_script.prepare_invoke();
        for record in records {
            invocation
                .key(self.deliveries_key(&record.subscription_id))
                .key(self.attempts_key(&record.subscription_id))
                .arg(&record.id.0)
                .arg(serde_json::to_string(record)?)
                .arg(record.retry_count);
        }
        let conflict: usize = invocation.invoke_async(&mut conn).await?;

        match conflict.checked_sub(1).and_then(|i| records.get(i)) {
            Some(record) => Err(StoreError::Conflict {
                subscription_id: record.subscription_id.clone(),
                delivery_id: record.id.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn get_delivery(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        let mut conn = self.connection().await?;
        self.load_delivery(&mut conn, subscription_id, delivery_id).await
    }

    async fn claim_pending(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let claimed: i64 = self
            .claim_script
            .key(self.deliveries_key(subscription_id))
            .key(self.claims_key(subscription_id))
            .arg(&delivery_id.0)
            .arg(chrono::Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        match claimed {
            -1 => Err(StoreError::NotFound {
                subscription_id: subscription_id.clone(),
                delivery_id: delivery_id.clone(),
            }),
            n => Ok(n == 1),
        }
    }

    async fn release_claim(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .hdel(self.claims_key(subscription_id), &delivery_id.0)
            .await?;
        Ok(())
    }

    async fn record_attempt(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
        update: &AttemptUpdate,
    ) -> Result<DeliveryRecord, StoreError> {
        let mut conn = self.connection().await?;
        let mut record = self
            .load_delivery(&mut conn, subscription_id, delivery_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                subscription_id: subscription_id.clone(),
                delivery_id: delivery_id.clone(),
            })?;
        record.apply(update);

        let increment = if update.counts_as_attempt { 1 } else { 0 };
        let (attempts,): (u32,) = redis::pipe()
            .atomic()
            .hset(
                self.deliveries_key(subscription_id),
                &delivery_id.0,
                serde_json::to_string(&record)?,
            )
            .ignore()
            .hincr(self.attempts_key(subscription_id), &delivery_id.0, increment)
            .hdel(self.claims_key(subscription_id), &delivery_id.0)
            .ignore()
            .query_async(&mut conn)
            .await?;

        record.retry_count = attempts;
        Ok(record)
    }

    async fn list_deliveries(&self, subscription_id: &SubscriptionId) -> Result<Vec<DeliveryRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let (payloads, attempts): (HashMap<String, String>, HashMap<String, u32>) = redis::pipe()
            .hgetall(self.deliveries_key(subscription_id))
            .hgetall(self.attempts_key(subscription_id))
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::with_capacity(payloads.len());
        for (id, payload) in payloads {
            let mut record: DeliveryRecord = serde_json::from_str(&payload)?;
            record.retry_count = attempts.get(&id).copied().unwrap_or(0);
            records.push(record);
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::DomainEvent;

    async fn store() -> RedisStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let prefix = format!("webhook-fanout-test:{}", uuid::Uuid::new_v4());
        RedisStore::new(redis::Client::open(url).unwrap(), prefix)
    }

    fn record(subscription: &str) -> DeliveryRecord {
        let event = DomainEvent::new("process.created", json!({"process_id": "p-1"}));
        DeliveryRecord::pending(SubscriptionId(subscription.into()), &event)
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn conflicting_batch_writes_nothing() {
        let store = store().await;
        let existing = record("a");
        store.insert_batch(std::slice::from_ref(&existing)).await.unwrap();

        let fresh = record("b");
        let err = store
            .insert_batch(&[fresh.clone(), existing.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { ref delivery_id, .. } if *delivery_id == existing.id));
        assert!(store.get_delivery(&fresh.subscription_id, &fresh.id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn concurrent_claims_have_one_winner() {
        let store = store().await;
        let pending = record("a");
        store.insert_batch(std::slice::from_ref(&pending)).await.unwrap();
        let (sub, id) = (&pending.subscription_id, &pending.id);

        let (a, b) = tokio::join!(store.claim_pending(sub, id), store.claim_pending(sub, id));
        assert_ne!(a.unwrap(), b.unwrap());

        store
            .record_attempt(sub, id, &AttemptUpdate::unreachable("refused"))
            .await
            .unwrap();
        assert!(!store.claim_pending(sub, id).await.unwrap());
    }
}
