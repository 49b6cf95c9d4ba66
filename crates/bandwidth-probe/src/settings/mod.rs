pub mod validation;

use crate::{plan::TestPlan, types::TestCase, urls::DEFAULT_BASE_URL};
use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::{fmt, net::SocketAddr, path::Path, time::Duration};
use validation::validate_config;

const ENV_PREFIX: &str = "SPEEDTEST";

/// Main settings configuration for bandwidth-probe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log level for application logging (e.g., "info", "debug", "warn", "error")
    pub log_level: String,
    /// Speed test endpoint configuration
    pub endpoint: EndpointSettings,
    /// HTTP client tuning
    pub http: HttpSettings,
    /// Custom test plan; the built-in plan is used when absent
    pub plan: Option<Vec<TestCase>>,
    /// Prometheus exporter configuration (optional)
    pub metrics: Option<MetricsSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Base url serving `__down`, `__up` and `meta`
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Per-request deadline in seconds
    pub timeout_secs: u64,
    /// Idle connections kept per host for reuse between probes
    pub pool_max_idle_per_host: usize,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    pub addr: SocketAddr,
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            endpoint: EndpointSettings::default(),
            http: HttpSettings::default(),
            plan: None,
            metrics: None,
        }
    }
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            pool_max_idle_per_host: 100,
            user_agent: concat!("bandwidth-probe/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Settings {
    /// Load configuration from a specific config file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        // Construct settings, env vars take priority still
        let settings = ConfigBuilder::builder()
            .add_source(File::with_name(&path.as_ref().to_string_lossy()))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        validate_config(&settings)?;

        Ok(settings)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self> {
        // NOTE: a missing .env file is fine
        let _ = dotenvy::dotenv();

        let settings: Settings = ConfigBuilder::builder()
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        validate_config(&settings)?;

        Ok(settings)
    }

    /// The configured plan, or the built-in one.
    pub fn test_plan(&self) -> Result<TestPlan> {
        match &self.plan {
            Some(cases) => TestPlan::new(cases.clone()).context("Invalid test plan in configuration"),
            None => Ok(TestPlan::default()),
        }
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Settings {{\n\
             \tLog Level: {}\n\
             \tBase URL: {}\n\
             \tTimeout: {}s\n\
             \tPool Max Idle Per Host: {}\n\
             \tCustom Plan: {}\n\
             }}",
            self.log_level,
            self.endpoint.base_url,
            self.http.timeout_secs,
            self.http.pool_max_idle_per_host,
            self.plan.is_some(),
        )
    }
}
