use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use tracing::{info, warn};

use crate::config::{AbortPolicy, WebhookConfig};
use crate::error::{ConfigError, DeliveryOutcome, DropReason, FailureReason, StoreError};
use crate::signing::{canonical_payload, compute_signature};
use crate::store::{DeliveryStore, SubscriptionStore};
use crate::telemetry::{metric_inc, metric_inc_subscription};
use crate::types::{AttemptUpdate, DeliveryId, DeliveryRecord, Subscription, SubscriptionId};

/// One "record created" notification for the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTrigger {
    pub subscription_id: SubscriptionId,
    pub delivery_id: DeliveryId,
    /// Attempt even if the record is already terminal.
    pub force: bool,
}

impl DeliveryTrigger {
    pub fn created(record: &DeliveryRecord) -> Self {
        Self {
            subscription_id: record.subscription_id.clone(),
            delivery_id: record.id.clone(),
            force: false,
        }
    }

    pub fn redeliver(subscription_id: SubscriptionId, delivery_id: DeliveryId) -> Self {
        Self {
            subscription_id,
            delivery_id,
            force: true,
        }
    }
}

/// Signs and sends a single delivery record, then records the outcome.
///
/// Holds no per-delivery state, so any number of invocations may run
/// concurrently against the same worker.
#[derive(Clone)]
pub struct DeliveryWorker {
    subscriptions: Arc<dyn SubscriptionStore>,
    deliveries: Arc<dyn DeliveryStore>,
    http_client: reqwest::Client,
    config: Arc<WebhookConfig>,
}

/// What came back from the endpoint, or why nothing did.
enum SendResult {
    Response { status: u16, headers: BTreeMap<String, String> },
    Unreachable(FailureReason),
}

impl DeliveryWorker {
    pub fn new(
        config: WebhookConfig,
        subscriptions: Arc<dyn SubscriptionStore>,
        deliveries: Arc<dyn DeliveryStore>,
    ) -> Result<Self, ConfigError> {
        let http_client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            subscriptions,
            deliveries,
            http_client,
            config: Arc::new(config),
        })
    }

    pub async fn handle(&self, trigger: &DeliveryTrigger) -> Result<DeliveryOutcome, StoreError> {
        self.run(&trigger.subscription_id, &trigger.delivery_id, trigger.force)
            .await
    }

    /// Deliver a freshly created record. Exactly one HTTP attempt at most.
    pub async fn process(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<DeliveryOutcome, StoreError> {
        self.run(subscription_id, delivery_id, false).await
    }

    /// Operator-initiated resend of an existing record, regardless of status.
    pub async fn redeliver(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
    ) -> Result<DeliveryOutcome, StoreError> {
        self.run(subscription_id, delivery_id, true).await
    }

    async fn run(
        &self,
        subscription_id: &SubscriptionId,
        delivery_id: &DeliveryId,
        force: bool,
    ) -> Result<DeliveryOutcome, StoreError> {
        let record = self
            .deliveries
            .get_delivery(subscription_id, delivery_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                subscription_id: subscription_id.clone(),
                delivery_id: delivery_id.clone(),
            })?;

        if force || !self.config.skip_terminal {
            return self.attempt(&record, false).await;
        }

        if record.status.is_terminal() {
            info!(
                subscription_id = %subscription_id,
                delivery_id = %delivery_id,
                status = %record.status,
                "delivery already terminal, skipping"
            );
            return Ok(DeliveryOutcome::Dropped(DropReason::AlreadyTerminal));
        }

        if !self.deliveries.claim_pending(subscription_id, delivery_id).await? {
            info!(
                subscription_id = %subscription_id,
                delivery_id = %delivery_id,
                "delivery claimed by another invocation, skipping"
            );
            return Ok(DeliveryOutcome::Dropped(DropReason::InFlight));
        }

        let result = self.attempt(&record, true).await;
        if result.is_err() {
            self.release(&record).await;
        }
        result
    }

    /// Everything after the guard. `claimed` means this invocation holds
    /// the record's in-flight mark and must release it if nothing is written.
    async fn attempt(&self, record: &DeliveryRecord, claimed: bool) -> Result<DeliveryOutcome, StoreError> {
        let subscription_id = &record.subscription_id;
        let delivery_id = &record.id;

        let subscription = match self.subscriptions.get_subscription(subscription_id).await? {
            Some(sub) if sub.active => sub,
            Some(_) => return self.abort(record, DropReason::SubscriptionInactive, claimed).await,
            None => return self.abort(record, DropReason::SubscriptionNotFound, claimed).await,
        };

        let body = canonical_payload(&record.payload)?;
        let signature = if subscription.secret.is_empty() {
            Err(FailureReason::MissingSecret)
        } else {
            compute_signature(subscription.secret.as_bytes(), &body)
                .map_err(|err| FailureReason::InvalidSecret(err.to_string()))
        };
        let signature = match signature {
            Ok(signature) => signature,
            Err(reason) => return self.reject_secret(record, reason, claimed).await,
        };

        let (update, outcome) = match self.send(&subscription, record, &signature, body).await {
            SendResult::Response { status, headers } => {
                let update = AttemptUpdate::responded(status, headers);
                let outcome = if (200..300).contains(&status) {
                    DeliveryOutcome::Delivered { response_status: status }
                } else {
                    DeliveryOutcome::Failed(FailureReason::HttpStatus(status))
                };
                (update, outcome)
            }
            SendResult::Unreachable(reason) => {
                (AttemptUpdate::unreachable(reason.to_string()), DeliveryOutcome::Failed(reason))
            }
        };

        let stored = self
            .deliveries
            .record_attempt(subscription_id, delivery_id, &update)
            .await?;

        match &outcome {
            DeliveryOutcome::Delivered { response_status } => {
                metric_inc("webhook.delivery.success");
                info!(
                    subscription_id = %subscription_id,
                    delivery_id = %delivery_id,
                    event_type = %record.event_type,
                    response_status,
                    attempts = stored.retry_count,
                    "webhook delivered"
                );
            }
            DeliveryOutcome::Failed(reason) => {
                metric_inc("webhook.delivery.failure");
                metric_inc_subscription("webhook.delivery.failure.subscription", subscription_id);
                warn!(
                    subscription_id = %subscription_id,
                    delivery_id = %delivery_id,
                    event_type = %record.event_type,
                    attempts = stored.retry_count,
                    reason = %reason,
                    "webhook delivery failed"
                );
            }
            DeliveryOutcome::Dropped(_) => {}
        }

        Ok(outcome)
    }

    /// Stop before sending. A terminal record keeps its stored outcome.
    async fn abort(
        &self,
        record: &DeliveryRecord,
        reason: DropReason,
        claimed: bool,
    ) -> Result<DeliveryOutcome, StoreError> {
        metric_inc("webhook.delivery.dropped");
        warn!(
            subscription_id = %record.subscription_id,
            delivery_id = %record.id,
            reason = %reason,
            "delivery aborted before sending"
        );

        if self.config.abort_policy == AbortPolicy::MarkFailed && !record.status.is_terminal() {
            self.deliveries
                .record_attempt(
                    &record.subscription_id,
                    &record.id,
                    &AttemptUpdate::aborted(reason.code()),
                )
                .await?;
        } else if claimed {
            self.release(record).await;
        }
        Ok(DeliveryOutcome::Dropped(reason))
    }

    /// The subscription's secret cannot sign. A terminal record keeps its
    /// stored outcome.
    async fn reject_secret(
        &self,
        record: &DeliveryRecord,
        reason: FailureReason,
        claimed: bool,
    ) -> Result<DeliveryOutcome, StoreError> {
        warn!(
            subscription_id = %record.subscription_id,
            delivery_id = %record.id,
            reason = %reason,
            "subscription secret unusable for signing"
        );
        metric_inc("webhook.delivery.failure");

        if record.status.is_terminal() {
            if claimed {
                self.release(record).await;
            }
        } else {
            self.deliveries
                .record_attempt(
                    &record.subscription_id,
                    &record.id,
                    &AttemptUpdate::aborted(reason.to_string()),
                )
                .await?;
        }
        Ok(DeliveryOutcome::Failed(reason))
    }

    async fn release(&self, record: &DeliveryRecord) {
        if let Err(err) = self
            .deliveries
            .release_claim(&record.subscription_id, &record.id)
            .await
        {
            warn!(
                subscription_id = %record.subscription_id,
                delivery_id = %record.id,
                error = %err,
                "failed to release delivery claim"
            );
        }
    }

    async fn send(
        &self,
        subscription: &Subscription,
        record: &DeliveryRecord,
        signature: &str,
        body: Vec<u8>,
    ) -> SendResult {
        let response = self
            .http_client
            .post(&subscription.url)
            .header(CONTENT_TYPE, "application/json")
            .header(self.config.signature_header.as_str(), signature)
            .header(self.config.event_header.as_str(), record.event_type.as_str())
            .header(self.config.delivery_header.as_str(), record.id.as_str())
            .body(body)
            .send()
            .await;

        match response {
            Ok(resp) => SendResult::Response {
                status: resp.status().as_u16(),
                headers: collect_headers(resp.headers()),
            },
            Err(err) if err.is_timeout() => SendResult::Unreachable(FailureReason::Timeout(err.to_string())),
            Err(err) => SendResult::Unreachable(FailureReason::Network(err.to_string())),
        }
    }
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use reqwest::header::{HeaderValue, SET_COOKIE};

    use super::*;

    #[test]
    fn multi_valued_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let collected = collect_headers(&headers);
        assert_eq!(collected.get("set-cookie").map(String::as_str), Some("a=1, b=2"));
        assert_eq!(collected.get("content-type").map(String::as_str), Some("text/plain"));
    }

    #[test]
    fn triggers_carry_force_flag() {
        let sub = SubscriptionId("s".into());
        let id = DeliveryId("d".into());
        assert!(DeliveryTrigger::redeliver(sub, id).force);
    }
}
