//! Counters, compiled out unless the `metrics` feature is on.

use crate::types::SubscriptionId;

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_add(name: &'static str, value: u64) {
    metrics::counter!(name, value);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_add(_name: &'static str, _value: u64) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_subscription(name: &'static str, subscription_id: &SubscriptionId) {
    metrics::increment_counter!(name, "subscription" => subscription_id.0.clone());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_subscription(_name: &'static str, _subscription_id: &SubscriptionId) {}
