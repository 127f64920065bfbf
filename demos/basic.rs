use std::sync::Arc;

use serde_json::json;
use webhook_fanout::{init_logging, DomainEvent, InMemoryStore, Pipeline, Subscription, WebhookConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging("webhook_fanout=info");

    let config = WebhookConfig::from_env()?;
    let store = Arc::new(InMemoryStore::new());
    store
        .upsert_subscription(
            Subscription::new("compliance-bot", "https://example.com/webhook", "supersecret")
                .with_events(["process.created", "analysis.completed"]),
        )
        .await;

    let mut pipeline = Pipeline::new(config, store.clone(), store.clone())?;

    let event = DomainEvent::new(
        "analysis.completed",
        json!({"analysis_id": "an-123", "process_id": "proc-9", "score": 82}),
    )
    .with_actor("user-1");
    let ids = pipeline.publish(event).await?;
    println!("queued {} deliveries", ids.len());

    pipeline.shutdown().await;
    Ok(())
}
