use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::WebhookConfig;
use crate::dispatcher::FanOutDispatcher;
use crate::error::{ConfigError, DispatchError};
use crate::store::{DeliveryStore, SubscriptionStore};
use crate::types::{DeliveryId, DeliveryRecord, DomainEvent, SubscriptionId};
use crate::worker::{DeliveryTrigger, DeliveryWorker};

/// Event source → fan-out → per-record delivery, in one process.
///
/// Every record created by a fan-out produces exactly one trigger on a
/// bounded queue. A pool of worker tasks consumes the queue; triggers for
/// different records run concurrently with no ordering guarantee.
pub struct Pipeline {
    dispatcher: FanOutDispatcher,
    trigger_tx: Option<mpsc::Sender<DeliveryTrigger>>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Build the pipeline and spawn its workers. Must be called inside a
    /// Tokio runtime.
    pub fn new(
        config: WebhookConfig,
        subscriptions: Arc<dyn SubscriptionStore>,
        deliveries: Arc<dyn DeliveryStore>,
    ) -> Result<Self, ConfigError> {
        let worker_count = config.worker_count.max(1);
        let (trigger_tx, trigger_rx) = mpsc::channel(config.trigger_queue_size.max(1));
        let shared_rx = Arc::new(Mutex::new(trigger_rx));

        let dispatcher = FanOutDispatcher::new(subscriptions.clone(), deliveries.clone());
        let worker = DeliveryWorker::new(config, subscriptions, deliveries)?;

        let worker_handles = (0..worker_count)
            .map(|_| tokio::spawn(worker_loop(shared_rx.clone(), worker.clone())))
            .collect();

        Ok(Self {
            dispatcher,
            trigger_tx: Some(trigger_tx),
            worker_handles,
        })
    }

    /// Fan `event` out and schedule one delivery per created record.
    ///
    /// Returns once the records exist and are queued, not once they are
    /// delivered. If the workers stop after the batch is committed, the
    /// error is `NotQueued` and lists the records left `pending`.
    pub async fn publish(&self, event: DomainEvent) -> Result<Vec<DeliveryId>, DispatchError> {
        let tx = self.sender()?;
        let records = self.dispatcher.dispatch(&event).await?;
        queue_created(tx, &records).await
    }

    /// Queue a forced resend of an existing record.
    pub async fn redeliver(
        &self,
        subscription_id: SubscriptionId,
        delivery_id: DeliveryId,
    ) -> Result<(), DispatchError> {
        let tx = self.sender()?;
        tx.send(DeliveryTrigger::redeliver(subscription_id, delivery_id))
            .await
            .map_err(|_| DispatchError::Shutdown)
    }

    /// Stop accepting events, drain queued triggers and wait for workers.
    pub async fn shutdown(&mut self) {
        self.trigger_tx.take();

        for handle in self.worker_handles.drain(..) {
            if let Err(err) = handle.await {
                error!(error = %err, "delivery worker panicked");
            }
        }
        info!("webhook pipeline stopped");
    }

    fn sender(&self) -> Result<&mpsc::Sender<DeliveryTrigger>, DispatchError> {
        self.trigger_tx.as_ref().ok_or(DispatchError::Shutdown)
    }
}

async fn queue_created(
    tx: &mpsc::Sender<DeliveryTrigger>,
    records: &[DeliveryRecord],
) -> Result<Vec<DeliveryId>, DispatchError> {
    let mut ids = Vec::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        if tx.send(DeliveryTrigger::created(record)).await.is_err() {
            let unqueued: Vec<_> = records[i..]
                .iter()
                .map(|r| (r.subscription_id.clone(), r.id.clone()))
                .collect();
            error!(count = unqueued.len(), "workers stopped before created deliveries were queued");
            return Err(DispatchError::NotQueued { unqueued });
        }
        ids.push(record.id.clone());
    }
    Ok(ids)
}

/// Worker loop: pull a trigger, run one invocation, repeat until the
/// queue is closed and empty.
async fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<DeliveryTrigger>>>, worker: DeliveryWorker) {
    loop {
        let trigger = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(trigger) = trigger else { break };

        match worker.handle(&trigger).await {
            Ok(outcome) => debug!(
                subscription_id = %trigger.subscription_id,
                delivery_id = %trigger.delivery_id,
                ?outcome,
                "delivery invocation finished"
            ),
            Err(err) => error!(
                subscription_id = %trigger.subscription_id,
                delivery_id = %trigger.delivery_id,
                error = %err,
                "delivery invocation failed"
            ),
        }
    }
}
