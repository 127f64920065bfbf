//! Event-driven webhook fan-out and signed delivery.
//!
//! A domain event (`process.created`, `analysis.completed`, ...) is
//! expanded into one durable delivery record per matching active
//! subscription. Each record is then delivered independently: the
//! payload is signed with HMAC-SHA256 using the subscription secret,
//! POSTed once, and the outcome is written back to the record.
//!
//! ## Guarantees
//! - Atomic fan-out: all records for an event appear, or none do
//! - At most one HTTP attempt per worker invocation
//! - Deactivation is re-checked at delivery time
//!
//! ## Non-Guarantees
//! - Automatic retries (`failed` is terminal until redelivered by hand)
//! - Ordering across subscriptions or events
//!
//! Stores are pluggable through [`SubscriptionStore`] and
//! [`DeliveryStore`]; an in-memory store is always available, Redis and
//! Postgres backends sit behind the `redis` and `postgres` features.

mod config;
mod dispatcher;
mod error;
mod logging;
mod pipeline;
mod signing;
mod store;
mod telemetry;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod store_redis;

#[cfg(feature = "postgres")]
mod store_postgres;

pub use config::{AbortPolicy, WebhookConfig};
pub use dispatcher::FanOutDispatcher;
pub use error::{
    ConfigError,
    DeliveryOutcome,
    DispatchError,
    DropReason,
    FailureReason,
    StoreError,
};
pub use logging::init_logging;
pub use pipeline::Pipeline;
pub use signing::{
    canonical_payload,
    compute_signature,
    parse_signature_header,
    verify_signature,
    verify_webhook_request,
    VerificationError,
};
pub use store::{DeliveryStore, InMemoryStore, SubscriptionStore};
pub use types::{
    AttemptUpdate,
    DeliveryId,
    DeliveryRecord,
    DeliveryStatus,
    DomainEvent,
    Subscription,
    SubscriptionId,
};
pub use worker::{DeliveryTrigger, DeliveryWorker};

#[cfg(feature = "redis")]
pub use store_redis::RedisStore;

#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;
