use crate::{plan::TestPlan, settings::Settings};
use anyhow::{Result, bail};
use std::net::IpAddr;
use url::Url;

/// Validate the configuration values
pub fn validate_config(settings: &Settings) -> Result<()> {
    // Validate log level
    let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_log_levels.contains(&settings.log_level.to_lowercase().as_str()) {
        bail!(
            "Invalid log level '{}'. Valid options are: {:?}",
            settings.log_level,
            valid_log_levels
        );
    }

    // Validate endpoint
    if settings.endpoint.base_url.is_empty() {
        bail!("Endpoint base URL cannot be empty");
    }
    match Url::parse(&settings.endpoint.base_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        Ok(_) => bail!("Endpoint base URL must start with http:// or https://"),
        Err(err) => bail!(
            "Endpoint base URL '{}' is invalid: {err}",
            settings.endpoint.base_url
        ),
    }

    // Validate http settings
    if settings.http.timeout_secs == 0 {
        bail!("HTTP timeout must be greater than 0");
    }
    if settings.http.pool_max_idle_per_host == 0 {
        bail!("HTTP pool_max_idle_per_host must be greater than 0");
    }
    if settings.http.user_agent.trim().is_empty() {
        bail!("HTTP user agent cannot be empty");
    }

    if let Some(cases) = &settings.plan {
        if let Err(err) = TestPlan::new(cases.clone()) {
            bail!("Configured plan is invalid: {err}");
        }
    }

    if let Some(metrics) = &settings.metrics {
        let valid = match metrics.addr.ip() {
            IpAddr::V4(ipv4) => !ipv4.is_broadcast() && !ipv4.is_multicast(),
            IpAddr::V6(ipv6) => !ipv6.is_unspecified() && !ipv6.is_multicast(),
        };
        if !valid {
            bail!("Invalid metrics SocketAddr: {}", metrics.addr)
        }
    }

    Ok(())
}
