//! Dispatch configuration: YAML file, then environment overrides.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use rdc_transport::{
    BackoffPolicy, BreakerConfig, GovernorConfig, HttpTransportConfig, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub half_open_probe: bool,
    pub probe_jitter_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 300,
            half_open_probe: false,
            probe_jitter_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub capacity: u32,
    pub refill_every_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSettings {
    pub capacities: BTreeMap<String, usize>,
    pub default_capacity: usize,
    pub rate_limits: BTreeMap<String, RateLimitSettings>,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        let defaults = GovernorConfig::default();
        Self {
            capacities: defaults.capacities,
            default_capacity: defaults.default_capacity,
            rate_limits: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_ms: 250,
            call_timeout_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub endpoints: BTreeMap<String, String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            endpoints: BTreeMap::new(),
            user_agent: "rdc-dispatch/0.1".to_string(),
            http_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub breaker: BreakerSettings,
    pub governor: GovernorSettings,
    pub retry: RetrySettings,
    pub transport: TransportSettings,
    pub dry_run: bool,
    pub rank_limit: usize,
    pub deadline_secs: Option<u64>,
    pub hook_queue_capacity: usize,
    /// Upper bound on one hook call.
    pub hook_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerSettings::default(),
            governor: GovernorSettings::default(),
            retry: RetrySettings::default(),
            transport: TransportSettings::default(),
            dry_run: false,
            rank_limit: 50,
            deadline_secs: None,
            hook_queue_capacity: 1024,
            hook_timeout_ms: 5_000,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True")
}

impl DispatchConfig {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing dispatch config yaml")
    }

    /// Load `path` if given, then apply `RDC_*` environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(config.with_overrides(|key| std::env::var(key).ok()))
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(v) = lookup("RDC_DRY_RUN") {
            self.dry_run = parse_flag(v.trim());
        }
        if let Some(v) = number("RDC_RANK_LIMIT") {
            self.rank_limit = v as usize;
        }
        if let Some(v) = number("RDC_BREAKER_THRESHOLD") {
            self.breaker.failure_threshold = v as u32;
        }
        if let Some(v) = number("RDC_BREAKER_COOLDOWN_SECS") {
            self.breaker.cooldown_secs = v;
        }
        if let Some(v) = number("RDC_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = v as u32;
        }
        if let Some(v) = number("RDC_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = number("RDC_RETRY_JITTER_MS") {
            self.retry.jitter_ms = v;
        }
        if let Some(v) = number("RDC_DEADLINE_SECS") {
            self.deadline_secs = Some(v);
        }
        if let Some(v) = number("RDC_HOOK_TIMEOUT_MS") {
            self.hook_timeout_ms = v;
        }
        if let Some(v) = lookup("RDC_USER_AGENT") {
            self.transport.user_agent = v;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if self.governor.default_capacity == 0 {
            return Err(invalid("governor.default_capacity", "must be at least 1"));
        }
        if let Some((class, _)) = self.governor.capacities.iter().find(|(_, c)| **c == 0) {
            return Err(invalid(
                "governor.capacities",
                format!("class {class} has zero capacity"),
            ));
        }
        if let Some((class, _)) = self
            .governor
            .rate_limits
            .iter()
            .find(|(_, r)| r.capacity == 0 || r.refill_every_ms == 0)
        {
            return Err(invalid(
                "governor.rate_limits",
                format!("class {class} needs a non-zero capacity and refill interval"),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.jitter_ms > self.retry.max_delay_ms {
            return Err(invalid("retry.jitter_ms", "must not exceed retry.max_delay_ms"));
        }
        if self.retry.call_timeout_ms == 0 {
            return Err(invalid("retry.call_timeout_ms", "must be positive"));
        }
        if self.rank_limit == 0 {
            return Err(invalid("rank_limit", "must be at least 1"));
        }
        if self.hook_queue_capacity == 0 {
            return Err(invalid("hook_queue_capacity", "must be at least 1"));
        }
        if self.hook_timeout_ms == 0 {
            return Err(invalid("hook_timeout_ms", "must be positive"));
        }
        Ok(())
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            cooldown: Duration::from_secs(self.breaker.cooldown_secs),
            half_open_probe: self.breaker.half_open_probe,
            probe_jitter: Duration::from_millis(self.breaker.probe_jitter_ms),
        }
    }

    pub fn governor_config(&self) -> GovernorConfig {
        GovernorConfig {
            capacities: self.governor.capacities.clone(),
            default_capacity: self.governor.default_capacity,
            rate_limits: self
                .governor
                .rate_limits
                .iter()
                .map(|(class, r)| {
                    (
                        class.clone(),
                        TokenBucketConfig {
                            capacity: r.capacity,
                            refill_every_ms: r.refill_every_ms,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: Duration::from_millis(self.retry.jitter_ms),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.retry.call_timeout_ms)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    pub fn http_transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            timeout: Duration::from_secs(self.transport.http_timeout_secs),
            user_agent: Some(self.transport.user_agent.clone()),
            endpoints: self.transport.endpoints.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = DispatchConfig::default();
        config.validate().expect("valid defaults");
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown_secs, 300);
        assert_eq!(config.governor.capacities["email"], 20);
        assert_eq!(config.governor.capacities["sms"], 10);
        assert_eq!(config.governor.default_capacity, 12);
        assert_eq!(config.retry.max_attempts, 4);
    }

    #[test]
    fn yaml_overrides_only_named_fields() {
        let config = DispatchConfig::from_yaml_str(
            r#"
dry_run: true
rank_limit: 5
breaker:
  failure_threshold: 3
  cooldown_secs: 60
governor:
  capacities:
    email: 2
    platform:upwork: 1
  rate_limits:
    email: { capacity: 5, refill_every_ms: 200 }
transport:
  endpoints:
    email: "https://mail.internal/send"
"#,
        )
        .expect("parse");

        assert!(config.dry_run);
        assert_eq!(config.rank_limit, 5);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker_config().cooldown, Duration::from_secs(60));
        assert_eq!(config.governor.capacities["platform:upwork"], 1);
        assert!(!config.governor.capacities.contains_key("sms"));
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.governor_config().rate_limits["email"].capacity, 5);
        assert_eq!(
            config.http_transport_config().endpoints["email"],
            "https://mail.internal/send"
        );
    }

    #[test]
    fn env_overrides_apply_on_top() {
        let env: HashMap<&str, &str> = [
            ("RDC_DRY_RUN", "true"),
            ("RDC_BREAKER_THRESHOLD", "7"),
            ("RDC_RETRY_MAX_ATTEMPTS", "2"),
            ("RDC_DEADLINE_SECS", "30"),
            ("RDC_HOOK_TIMEOUT_MS", "250"),
            ("RDC_RANK_LIMIT", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config = DispatchConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert!(config.dry_run);
        assert_eq!(config.breaker.failure_threshold, 7);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.deadline(), Some(Duration::from_secs(30)));
        assert_eq!(config.hook_timeout(), Duration::from_millis(250));
        assert_eq!(config.rank_limit, 50);
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let mut config = DispatchConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "breaker.failure_threshold", .. })
        ));

        let mut config = DispatchConfig::default();
        config.governor.capacities.insert("sms".into(), 0);
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.retry.jitter_ms = config.retry.max_delay_ms + 1;
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.hook_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "hook_timeout_ms", .. })
        ));
    }
}
