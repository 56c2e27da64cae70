//! Runtime configuration.
//!
//! Sources, later ones winning: built-in defaults, an optional YAML file
//! (`--config` or `TOOL_RELAY_CONFIG`), then `TOOL_RELAY_*` environment
//! variables.

use crate::cache::CacheConfig;
use crate::resilience::{BackoffPolicy, RateLimiterConfig};
use crate::transport::HttpTransportConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_ENV: &str = "TOOL_RELAY_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Sqlite,
    Memory,
    None,
}

impl FromStr for CacheBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(CacheBackend::Sqlite),
            "memory" => Ok(CacheBackend::Memory),
            "none" | "off" => Ok(CacheBackend::None),
            other => Err(Error::configuration_with_context(
                format!("unknown cache backend '{}'", other),
                ErrorContext::new()
                    .with_field_path("cache.backend")
                    .with_details("expected sqlite, memory or none"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    pub backend: CacheBackend,
    pub db_path: PathBuf,
    pub memory_capacity: usize,
    pub max_entry_bytes: usize,
    pub sweep_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Sqlite,
            db_path: PathBuf::from("tool-relay-cache.db"),
            memory_capacity: 1000,
            max_entry_bytes: 10 * 1024 * 1024,
            sweep_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterSection {
    /// Concurrent calls per target host.
    pub max_concurrent: usize,
    /// Calls per second per target host; unset means unlimited.
    pub rps: Option<f64>,
    pub burst: Option<u32>,
    /// How often idle per-host windows are dropped.
    pub idle_prune_secs: u64,
}

impl Default for LimiterSection {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            rps: None,
            burst: None,
            idle_prune_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffSection {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 30_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub cache: CacheSection,
    pub limiter: LimiterSection,
    pub backoff: BackoffSection,
    pub http: HttpTransportConfig,
    /// Coalesce concurrent identical cacheable requests.
    pub single_flight: bool,
}

impl RelayConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read config file: {}", e),
                ErrorContext::new().with_details(path.display().to_string()),
            )
        })?;
        Self::from_yaml_str(&text)
    }

    /// Defaults, then the YAML file (explicit path or `TOOL_RELAY_CONFIG`),
    /// then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(p) => Self::from_yaml_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `TOOL_RELAY_*` overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("TOOL_RELAY_CACHE_BACKEND") {
            self.cache.backend = v.parse()?;
        }
        if let Some(v) = get("TOOL_RELAY_DB_PATH") {
            self.cache.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("TOOL_RELAY_SWEEP_INTERVAL_SECS") {
            self.cache.sweep_interval_secs = parse_env("TOOL_RELAY_SWEEP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("TOOL_RELAY_MAX_CONCURRENT") {
            self.limiter.max_concurrent = parse_env("TOOL_RELAY_MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = get("TOOL_RELAY_RPS") {
            self.limiter.rps = Some(parse_env("TOOL_RELAY_RPS", &v)?);
        }
        if let Some(v) = get("TOOL_RELAY_BURST") {
            self.limiter.burst = Some(parse_env("TOOL_RELAY_BURST", &v)?);
        }
        if let Some(v) = get("TOOL_RELAY_LIMITER_PRUNE_SECS") {
            self.limiter.idle_prune_secs = parse_env("TOOL_RELAY_LIMITER_PRUNE_SECS", &v)?;
        }
        if let Some(v) = get("TOOL_RELAY_BACKOFF_BASE_MS") {
            self.backoff.base_ms = parse_env("TOOL_RELAY_BACKOFF_BASE_MS", &v)?;
        }
        if let Some(v) = get("TOOL_RELAY_BACKOFF_MAX_MS") {
            self.backoff.max_ms = parse_env("TOOL_RELAY_BACKOFF_MAX_MS", &v)?;
        }
        if let Some(v) = get("TOOL_RELAY_SINGLE_FLIGHT") {
            self.single_flight = parse_bool("TOOL_RELAY_SINGLE_FLIGHT", &v)?;
        }
        if let Some(v) = get("TOOL_RELAY_HTTP_POOL_MAX_IDLE_PER_HOST") {
            self.http.pool_max_idle_per_host =
                parse_env("TOOL_RELAY_HTTP_POOL_MAX_IDLE_PER_HOST", &v)?;
        }
        if let Some(v) = get("TOOL_RELAY_HTTP_POOL_IDLE_TIMEOUT_SECS") {
            self.http.pool_idle_timeout_secs =
                parse_env("TOOL_RELAY_HTTP_POOL_IDLE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("TOOL_RELAY_PROXY_URL") {
            self.http.proxy_url = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, msg: &str| {
            Err(Error::configuration_with_context(
                msg.to_string(),
                ErrorContext::new().with_field_path(field),
            ))
        };
        if self.limiter.max_concurrent == 0 {
            return invalid("limiter.max_concurrent", "must be at least 1");
        }
        if self.limiter.idle_prune_secs == 0 {
            return invalid("limiter.idle_prune_secs", "must be at least 1");
        }
        if let Some(rps) = self.limiter.rps {
            if !rps.is_finite() || rps <= 0.0 {
                return invalid("limiter.rps", "must be a positive number");
            }
        }
        if self.limiter.burst == Some(0) {
            return invalid("limiter.burst", "must be at least 1");
        }
        if self.backoff.max_ms == 0 {
            return invalid("backoff.max_ms", "must be positive");
        }
        if self.backoff.max_ms < self.backoff.base_ms {
            return invalid("backoff.max_ms", "must not be below backoff.base_ms");
        }
        if self.cache.sweep_interval_secs == 0 {
            return invalid("cache.sweep_interval_secs", "must be positive");
        }
        if self.cache.backend == CacheBackend::Memory && self.cache.memory_capacity == 0 {
            return invalid("cache.memory_capacity", "must be at least 1");
        }
        if self.cache.backend == CacheBackend::Sqlite && self.cache.db_path.as_os_str().is_empty() {
            return invalid("cache.db_path", "must not be empty");
        }
        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .with_enabled(self.cache.backend != CacheBackend::None)
            .with_max_entry_size(self.cache.max_entry_bytes)
            .with_sweep_interval(Duration::from_secs(self.cache.sweep_interval_secs))
    }

    pub fn limiter_config(&self) -> RateLimiterConfig {
        let mut config = RateLimiterConfig::new().with_max_concurrent(self.limiter.max_concurrent);
        if let Some(rps) = self.limiter.rps {
            config = config.with_rps(rps);
        }
        if let Some(burst) = self.limiter.burst {
            config = config.with_burst(burst);
        }
        config
    }

    pub fn limiter_prune_interval(&self) -> Duration {
        Duration::from_secs(self.limiter.idle_prune_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff.base_ms),
            Duration::from_millis(self.backoff.max_ms),
        )
        .with_jitter(self.backoff.jitter)
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| {
        Error::configuration_with_context(
            format!("invalid value for {}: {}", key, e),
            ErrorContext::new().with_field_path(key).with_details(value.to_string()),
        )
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::configuration_with_context(
            format!("invalid boolean for {}", key),
            ErrorContext::new().with_field_path(key).with_details(value.to_string()),
        )),
    }
}
