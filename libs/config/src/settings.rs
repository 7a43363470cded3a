//! Runtime Settings Module
//!
//! Provides configuration loading for the remoting runtime.
//! Supports loading from TOML files with environment variable overrides.

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::defaults;

/// Main runtime configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct RemotingSettings {
    /// Retry and timeout policy for invocations
    pub invocation: InvocationSettings,

    /// Connection establishment and pooling
    pub connection: ConnectionSettings,

    /// Location service lookups and the static locator table
    pub locator: LocatorSettings,

    /// Batch request router behaviour
    pub router: RouterSettings,
}

/// Invocation retry and timeout settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct InvocationSettings {
    /// Wait before each retry; the last entry repeats when `max_retries` is larger
    pub retry_intervals_ms: Vec<u64>,
    /// Retry budget; defaults to the number of intervals
    pub max_retries: Option<usize>,
    /// Default invocation timeout, measured from the first attempt
    pub timeout_ms: Option<u64>,
}

/// Connection settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ConnectionSettings {
    pub connect_timeout_ms: u64,
    /// Forces this timeout onto every endpoint before pooling
    pub override_timeout_ms: Option<u64>,
    /// Forces this compression flag onto every endpoint before pooling
    pub override_compress: Option<bool>,
    pub max_message_size: usize,
    /// Connections idle for longer than this are closed by `close_idle`
    pub idle_timeout_ms: Option<u64>,
    /// How long destroy waits for outstanding replies before aborting
    pub close_timeout_ms: u64,
}

/// Location service settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LocatorSettings {
    pub timeout_ms: u64,
    /// Unset means cached entries never expire; zero disables the cache
    pub cache_timeout_ms: Option<u64>,
    /// Adapter id to stringified endpoints, e.g. `tcp -h 10.0.0.1 -p 4061`
    pub adapters: BTreeMap<String, Vec<String>>,
    /// Identity to stringified proxy, e.g. `printer@PrinterAdapter`
    pub objects: BTreeMap<String, String>,
}

/// Batch router settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RouterSettings {
    pub buffered: bool,
    /// Sleep after every flush cycle to bound flush frequency
    pub sleep_time_ms: Option<u64>,
}

impl Default for InvocationSettings {
    fn default() -> Self {
        Self {
            retry_intervals_ms: defaults::invocation::RETRY_INTERVALS_MS.to_vec(),
            max_retries: None,
            timeout_ms: None,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: defaults::connection::CONNECT_TIMEOUT_MS,
            override_timeout_ms: None,
            override_compress: None,
            max_message_size: defaults::connection::MAX_MESSAGE_SIZE,
            idle_timeout_ms: None,
            close_timeout_ms: defaults::connection::CLOSE_TIMEOUT_MS,
        }
    }
}

impl Default for LocatorSettings {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::locator::LOOKUP_TIMEOUT_MS,
            cache_timeout_ms: None,
            adapters: BTreeMap::new(),
            objects: BTreeMap::new(),
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            buffered: defaults::router::BUFFERED,
            sleep_time_ms: None,
        }
    }
}

impl RemotingSettings {
    /// Load settings from an optional TOML file with environment overrides.
    ///
    /// Environment variables use the `REMOTING_` prefix and `__` between
    /// nested keys, e.g. `REMOTING_INVOCATION__TIMEOUT_MS=2500`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading remoting config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(defaults::ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut settings: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        settings.expand_env_vars()?;
        settings.validate()?;

        debug!(
            adapters = settings.locator.adapters.len(),
            objects = settings.locator.objects.len(),
            "Remoting settings loaded"
        );
        Ok(settings)
    }

    /// Parse settings from a TOML document without consulting the environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut settings: Self = toml::from_str(content).context("Failed to parse TOML settings")?;
        settings.expand_env_vars()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.connection.connect_timeout_ms == 0 {
            bail!("connection.connect_timeout_ms must be greater than zero");
        }
        if self.locator.timeout_ms == 0 {
            bail!("locator.timeout_ms must be greater than zero");
        }
        if self.connection.max_message_size < defaults::connection::MIN_MESSAGE_SIZE {
            bail!(
                "connection.max_message_size must be at least {} bytes",
                defaults::connection::MIN_MESSAGE_SIZE
            );
        }
        if matches!(self.invocation.timeout_ms, Some(0)) {
            bail!("invocation.timeout_ms must be greater than zero when set");
        }
        if self.invocation.max_retries.is_some() && self.invocation.retry_intervals_ms.is_empty() {
            bail!("invocation.max_retries requires at least one retry interval");
        }
        for (adapter, endpoints) in &self.locator.adapters {
            if endpoints.is_empty() {
                bail!("locator.adapters.{} has no endpoints", adapter);
            }
        }
        Ok(())
    }

    /// Expand `${VAR}` references in locator endpoint and proxy strings
    pub fn expand_env_vars(&mut self) -> Result<()> {
        for (adapter, endpoints) in &mut self.locator.adapters {
            for endpoint in endpoints.iter_mut() {
                let expanded = shellexpand::env(endpoint.as_str())
                    .with_context(|| format!("Failed to expand endpoint for adapter {}", adapter))?;
                *endpoint = expanded.into_owned();
            }
        }

        for (identity, proxy) in &mut self.locator.objects {
            let expanded = shellexpand::env(proxy.as_str())
                .with_context(|| format!("Failed to expand proxy for object {}", identity))?;
            *proxy = expanded.into_owned();
        }

        Ok(())
    }
}

impl InvocationSettings {
    pub fn retry_intervals(&self) -> Vec<Duration> {
        self.retry_intervals_ms.iter().copied().map(Duration::from_millis).collect()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn override_timeout(&self) -> Option<Duration> {
        self.override_timeout_ms.map(Duration::from_millis)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl LocatorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_timeout(&self) -> Option<Duration> {
        self.cache_timeout_ms.map(Duration::from_millis)
    }
}

impl RouterSettings {
    pub fn sleep_time(&self) -> Option<Duration> {
        self.sleep_time_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}
