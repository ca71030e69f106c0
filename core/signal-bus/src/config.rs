//! Dispatch policy per event and engine-wide settings

use crate::error::{ConfigError, Result, SignalError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Priority of a registration command in the registry queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum SignalPriority {
    High,
    #[default]
    Medium,
    Low,
}

impl SignalPriority {
    /// All priorities, in drain order
    pub const ALL: [SignalPriority; 3] = [Self::High, Self::Medium, Self::Low];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

/// Immutable dispatch policy for one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalConfig {
    async_dispatch: bool,
    max_retries: u32,
    retry_delay_ms: u64,
    max_handlers: usize,
    timeout_ms: u64,
    record_metrics: bool,
    priority: SignalPriority,
    group_name: Option<String>,
    persistent: bool,
}

impl SignalConfig {
    pub fn builder() -> SignalConfigBuilder {
        SignalConfigBuilder::default()
    }

    /// Handlers run concurrently on the dispatch pool when true
    pub fn is_async(&self) -> bool {
        self.async_dispatch
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_handlers(&self) -> usize {
        self.max_handlers
    }

    /// Per-attempt timeout; `None` when disabled
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn record_metrics(&self) -> bool {
        self.record_metrics
    }

    pub fn priority(&self) -> SignalPriority {
        self.priority
    }

    pub fn group_name(&self) -> Option<&str> {
        self.group_name.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Same policy with retries disabled
    pub(crate) fn single_attempt(&self) -> Self {
        Self {
            max_retries: 0,
            ..self.clone()
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfigBuilder::default().into_config()
    }
}

/// Builder for [`SignalConfig`]
#[derive(Debug, Clone)]
pub struct SignalConfigBuilder {
    async_dispatch: bool,
    max_retries: u32,
    retry_delay_ms: u64,
    max_handlers: usize,
    timeout_ms: u64,
    record_metrics: bool,
    priority: SignalPriority,
    group_name: Option<String>,
    persistent: bool,
}

impl Default for SignalConfigBuilder {
    fn default() -> Self {
        Self {
            async_dispatch: false,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_handlers: 100,
            timeout_ms: 5000,
            record_metrics: true,
            priority: SignalPriority::Medium,
            group_name: None,
            persistent: false,
        }
    }
}

impl SignalConfigBuilder {
    pub fn async_dispatch(mut self, async_dispatch: bool) -> Self {
        self.async_dispatch = async_dispatch;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay_ms(mut self, retry_delay_ms: u64) -> Self {
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn max_handlers(mut self, max_handlers: usize) -> Self {
        self.max_handlers = max_handlers;
        self
    }

    /// 0 disables the per-attempt timeout
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn record_metrics(mut self, record_metrics: bool) -> Self {
        self.record_metrics = record_metrics;
        self
    }

    pub fn priority(mut self, priority: SignalPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn group_name(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = Some(group_name.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn build(self) -> Result<SignalConfig> {
        if self.max_handlers == 0 {
            return Err(SignalError::InvalidConfig("max_handlers must be at least 1".to_string()));
        }
        if matches!(&self.group_name, Some(name) if name.trim().is_empty()) {
            return Err(SignalError::InvalidConfig("group_name must not be blank".to_string()));
        }
        Ok(self.into_config())
    }

    fn into_config(self) -> SignalConfig {
        SignalConfig {
            async_dispatch: self.async_dispatch,
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            max_handlers: self.max_handlers,
            timeout_ms: self.timeout_ms,
            record_metrics: self.record_metrics,
            priority: self.priority,
            group_name: self.group_name,
            persistent: self.persistent,
        }
    }
}

// ============================================================================
// Engine configuration
// ============================================================================

/// Engine-wide settings, loadable from TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub protection: ProtectionConfig,
    pub dead_letter: DeadLetterConfig,
    pub recovery: RecoveryConfig,
    pub metrics: MetricsConfig,
    /// Upper bound on waiting for in-flight handlers at shutdown
    pub shutdown_timeout_secs: u64,
    pub datacenter_id: u64,
    pub machine_id: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            protection: ProtectionConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            recovery: RecoveryConfig::default(),
            metrics: MetricsConfig::default(),
            shutdown_timeout_secs: 60,
            datacenter_id: 1,
            machine_id: 1,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> std::result::Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Async dispatch pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum handler tasks running at once
    pub max_concurrency: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self {
            max_concurrency: cores * 2 + 1,
        }
    }
}

/// Auto-configured circuit breaker / rate limiter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub open_timeout_ms: u64,
    pub half_open_trials: u32,
    pub max_requests_per_second: usize,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: 5,
            open_timeout_ms: 30_000,
            half_open_trials: 3,
            max_requests_per_second: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub capacity: usize,
    pub retention_days: i64,
    pub auto_cleanup: bool,
    pub cleanup_interval_secs: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            retention_days: 30,
            auto_cleanup: true,
            cleanup_interval_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub retry_interval_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub flush_interval_secs: u64,
    /// Traces kept in the trace index before the oldest is evicted
    pub trace_capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 60,
            trace_capacity: 1000,
        }
    }
}
