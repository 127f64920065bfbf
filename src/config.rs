use std::time::Duration;

use crate::error::ConfigError;

/// What the worker does with a record whose subscription is gone or inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortPolicy {
    /// Mark the record `failed` with a reason code.
    MarkFailed,
    /// Leave the record `pending` and only log.
    LeavePending,
}

/// Delivery and pipeline settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Hard limit for one HTTP attempt.
    pub timeout: Duration,
    pub user_agent: String,
    pub signature_header: String,
    pub event_header: String,
    pub delivery_header: String,
    pub abort_policy: AbortPolicy,
    /// Skip records that are already `delivered` or `failed`, and claim a
    /// pending record before sending so that concurrent duplicate
    /// invocations send it once.
    pub skip_terminal: bool,
    pub worker_count: usize,
    pub trigger_queue_size: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("webhook-fanout/{}", env!("CARGO_PKG_VERSION")),
            signature_header: "X-Webhook-Signature".to_string(),
            event_header: "X-Webhook-Event".to_string(),
            delivery_header: "X-Webhook-Delivery".to_string(),
            abort_policy: AbortPolicy::MarkFailed,
            skip_terminal: true,
            worker_count,
            trigger_queue_size: 1_024,
        }
    }
}

impl WebhookConfig {
    /// Load from `WEBHOOK_*` environment variables, keeping defaults for unset keys.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("WEBHOOK_TIMEOUT_SECS") {
            let secs = parse::<u64>("WEBHOOK_TIMEOUT_SECS", &v)?;
            if secs == 0 {
                return Err(invalid("WEBHOOK_TIMEOUT_SECS", &v));
            }
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(v) = lookup("WEBHOOK_USER_AGENT") {
            config.user_agent = v;
        }
        if let Some(v) = lookup("WEBHOOK_SIGNATURE_HEADER") {
            config.signature_header = v;
        }
        if let Some(v) = lookup("WEBHOOK_EVENT_HEADER") {
            config.event_header = v;
        }
        if let Some(v) = lookup("WEBHOOK_DELIVERY_HEADER") {
            config.delivery_header = v;
        }
        if let Some(v) = lookup("WEBHOOK_ABORT_POLICY") {
            config.abort_policy = match v.as_str() {
                "mark_failed" => AbortPolicy::MarkFailed,
                "leave_pending" => AbortPolicy::LeavePending,
                _ => return Err(invalid("WEBHOOK_ABORT_POLICY", &v)),
            };
        }
        if let Some(v) = lookup("WEBHOOK_SKIP_TERMINAL") {
            config.skip_terminal = parse::<bool>("WEBHOOK_SKIP_TERMINAL", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_WORKER_COUNT") {
            config.worker_count = parse::<usize>("WEBHOOK_WORKER_COUNT", &v)?.max(1);
        }
        if let Some(v) = lookup("WEBHOOK_TRIGGER_QUEUE_SIZE") {
            config.trigger_queue_size = parse::<usize>("WEBHOOK_TRIGGER_QUEUE_SIZE", &v)?.max(1);
        }

        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_abort_policy(mut self, policy: AbortPolicy) -> Self {
        self.abort_policy = policy;
        self
    }

    pub fn with_skip_terminal(mut self, skip: bool) -> Self {
        self.skip_terminal = skip;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = WebhookConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.abort_policy, AbortPolicy::MarkFailed);
        assert!(config.skip_terminal);
        assert!(config.user_agent.starts_with("webhook-fanout/"));
        assert!(config.worker_count >= 1);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = WebhookConfig::from_lookup(lookup(&[
            ("WEBHOOK_TIMEOUT_SECS", "5"),
            ("WEBHOOK_ABORT_POLICY", "leave_pending"),
            ("WEBHOOK_SKIP_TERMINAL", "false"),
            ("WEBHOOK_WORKER_COUNT", "0"),
            ("WEBHOOK_SIGNATURE_HEADER", "X-Signature"),
        ]))
        .unwrap();

        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.abort_policy, AbortPolicy::LeavePending);
        assert!(!config.skip_terminal);
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.signature_header, "X-Signature");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = WebhookConfig::from_lookup(lookup(&[("WEBHOOK_TIMEOUT_SECS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "WEBHOOK_TIMEOUT_SECS".into(),
                value: "soon".into()
            }
        );
        assert!(WebhookConfig::from_lookup(lookup(&[("WEBHOOK_TIMEOUT_SECS", "0")])).is_err());
        assert!(WebhookConfig::from_lookup(lookup(&[("WEBHOOK_ABORT_POLICY", "retry")])).is_err());
    }
}
