use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::{Client, Row};

use crate::error::StoreError;
use crate::store::{DeliveryStore, SubscriptionStore};
use crate::types::{AttemptUpdate, DeliveryId, DeliveryRecord, Subscription, SubscriptionId};

const DELIVERY_COLUMNS: &str = "id, subscription_id, event_type, payload, status, created_at,
     delivered_at, response_status, response_headers, retry_count, error";

/// Postgres-backed subscription and delivery store.
///
/// Deliveries carry no foreign key to subscriptions: a record must
/// outlive the deletion of its subscription. `claimed_at` marks a record
/// that a worker is currently sending and is not part of the record.
pub struct PostgresStore {
    client: Mutex<Client>,
}

impl PostgresStore {
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                    id TEXT PRIMARY KEY,
                    url TEXT NOT NULL,
                    secret TEXT NOT NULL,
                    active BOOLEAN NOT NULL DEFAULT TRUE,
                    events TEXT[] NOT NULL DEFAULT '{}'
                );
                CREATE TABLE IF NOT EXISTS webhook_deliveries (
                    id TEXT NOT NULL,
                    subscription_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    status TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    delivered_at TIMESTAMPTZ,
                    response_status INTEGER,
                    response_headers JSONB,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    claimed_at TIMESTAMPTZ,
                    PRIMARY KEY (subscription_id, id)
                );
                ALTER TABLE webhook_deliveries ADD COLUMN IF NOT EXISTS claimed_at TIMESTAMPTZ;",
            )
            .await?;

        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Create or replace a subscription row.
    pub async fn upsert_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let events: Vec<&str> = subscription.events.iter().map(String::as_str).collect();
        self.client
            .lock()
            .await
            .execute(
                "INSERT INTO webhook_subscriptions (id, url, secret, active, events)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (id) DO UPDATE SET
                    url = EXCLUDED.url,
                    secret = EXCLUDED.secret,
                    active = EXCLUDED.active,
                    events = EXCLUDED.events",
                &[
                    &subscription.id.0,
                    &subscription.url,
                    &subscription.secret,
                    &subscription.active,
                    &events,
                ],
            )
            .await?;
        Ok(())
    }

    fn subscription_from_row(row: &Row) -> Result<Subscription, StoreError> {
        let events: Vec<String> = row.try_get(4)?;
        Ok(Subscription {
            id: SubscriptionId(row.try_get(0)?),
            url: row.try_get(1)?,
            secret: row.try_get(2)?,
            active: row.try_get(3)?,
            events: events.into_iter().collect::<BTreeSet<_>>(),
        })
    }

    fn delivery_from_row(row: &Row) -> Result<DeliveryRecord, StoreError> {
        let status: String = row.try_get(4)?;
        let response_status: Option<i32> = row.try_get(7)?;
        let response_headers: Option<serde_json::Value> = row.try_get(8)?;
        let retry_count: i32 = row.try_get(9)?;

        Ok(DeliveryRecord {
            id: DeliveryId(row.try_get(0)?),
            subscription_id: SubscriptionId(row.try_get(1)?),
            event_type: row.try_get(2)?,
            payload: row.try_get(3)?,
            status: status.parse().map_err(StoreError::Corrupt)?,
            created_at: row.try_get(5)?,
            delivered_at: row.try_get(6)?,
            response_status: response_status
                .map(|s| u16::try_from(s).map_err(|_| StoreError::Corrupt(format!("response status {s}"))))
                .transpose()?,
            response_headers: response_headers
                .map(serde_json::from_value::<BTreeMap<String, String>>)
                .transpose()?,
            retry_count: u32::try_from(retry_count)
                .map_err(|_| StoreError::Corrupt(format!("retry count {retry_count}")))?,
            error: row.try_get(10)?,
        })
    }
}

#[async_trait]
impl SubscriptionStore for PostgresStore {
    async fn find_active_for_event(&self, event_type: &str) -> Result<Vec<Subscription>, StoreError> {
        let rows = self
            .client
            .lock()
            .await
            .query(
                "SELECT id, url, secret, active, events FROM webhook_subscriptions
                 WHERE active AND $1 = ANY(events)
                 ORDER BY id",
                &[&event_type],
            )
            .await?;

        rows.iter().map(Self::subscription_from_row).collect()
    }

    async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                "SELECT id, url, secret, active, events FROM webhook_subscriptions WHERE id = $1",
                &[&id.0],
            )
            .await?;

        row.as_ref().map(Self::subscription_from_row).transpose()
    }
}

#[async_trait]
impl DeliveryStore for PostgresStore {
    async fn insert_batch(&self, records: &[DeliveryRecord]) -> Result<(), StoreError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let stmt = tx
            .prepare(
                "INSERT INTO webhook_deliveries
                    (id, subscription_id, event_type, payload, status, created_at, retry_count)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .await?;

        for record in records {
            let retry_count = i32::try_from(record.retry_count).unwrap_or(i32::MAX);
            // Dropping `tx` on error rolls the whole batch back.
            tx.execute(
                &stmt,
                &[
                    &record.id.0,
                    &record.subscription_id.0,
                    &record.event_type,
                    &record.payload,
                    &record.status.as_str(),
                    &record.created_at,
                    &retry_count,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_delivery(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        let query = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries
             WHERE subscription_id = $1 AND id = $2"
        );
        let row = self
            .client
            .lock()
            .await
            .query_opt(query.as_str(), &[&subscription_id.0, &delivery_id.0])
            .await?;

        row.as_ref().map(Self::delivery_from_row).transpose()
    }

    async fn claim_pending(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<bool, StoreError> {
        let client = self.client.lock().await;
        let claimed = client
            .execute(
                "UPDATE webhook_deliveries SET claimed_at = now()
                 WHERE subscription_id = $1 AND id = $2
                   AND status = 'pending' AND claimed_at IS NULL",
                &[&subscription_id.0, &delivery_id.0],
            )
            .await?;
        if claimed == 1 {
            return Ok(true);
        }

        let exists = client
            .query_opt(
                "SELECT 1 FROM webhook_deliveries WHERE subscription_id = $1 AND id = $2",
                &[&subscription_id.0, &delivery_id.0],
            )
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                subscription_id: subscription_id.clone(),
                delivery_id: delivery_id.clone(),
            }),
        }
    }

    async fn release_claim(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<(), StoreError> {
        self.client
            .lock()
            .await
            .execute(
                "UPDATE webhook_deliveries SET claimed_at = NULL
                 WHERE subscription_id = $1 AND id = $2",
                &[&subscription_id.0, &delivery_id.0],
            )
            .await?;
        Ok(())
    }

    async fn record_attempt(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
        update: &AttemptUpdate,
    ) -> Result<DeliveryRecord, StoreError> {
        let response_status = update.response_status.map(i32::from);
        let response_headers = update
            .response_headers
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let increment: i32 = if update.counts_as_attempt { 1 } else { 0 };

        let query = format!(
            "UPDATE webhook_deliveries SET
                status = $3,
                delivered_at = $4,
                response_status = $5,
                response_headers = $6,
                error = $7,
                retry_count = retry_count + $8,
                claimed_at = NULL
             WHERE subscription_id = $1 AND id = $2
             RETURNING {DELIVERY_COLUMNS}"
        );
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                query.as_str(),
                &[
                    &subscription_id.0,
                    &delivery_id.0,
                    &update.status.as_str(),
                    &update.delivered_at,
                    &response_status,
                    &response_headers,
                    &update.error,
                    &increment,
                ],
            )
            .await?;

        match row {
            Some(row) => Self::delivery_from_row(&row),
            None => Err(StoreError::NotFound {
                subscription_id: subscription_id.clone(),
                delivery_id: delivery_id.clone(),
            }),
        }
    }

    async fn list_deliveries(&self, subscription_id: &SubscriptionId) -> Result<Vec<DeliveryRecord>, StoreError> {
        let query = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries
             WHERE subscription_id = $1
             ORDER BY created_at"
        );
        let rows = self
            .client
            .lock()
            .await
            .query(query.as_str(), &[&subscription_id.0])
            .await?;

        rows.iter().map(Self::delivery_from_row).collect()
    }
}
