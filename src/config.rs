use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};

// ---------------------------------------------------------------------------
// SensorSource
// ---------------------------------------------------------------------------

/// Where the device agent gets its temperature/humidity samples from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorSource {
    /// Synthetic readings, for running the agent without hardware.
    Simulated,
    /// JSON `{"temperature": .., "humidity": ..}` file refreshed by an
    /// external sensor reader.
    File(PathBuf),
}

impl FromStr for SensorSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Err(anyhow::anyhow!("sensor source must not be empty")),
            "simulated" => Ok(Self::Simulated),
            path => Ok(Self::File(PathBuf::from(path))),
        }
    }
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Shared secret every device request must carry.
    pub api_key: String,
    pub server_host: String,
    pub server_port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            database_url: optional(&lookup, "DATABASE_URL", "sqlite:aquarium.db?mode=rwc"),
            database_max_connections: optional(&lookup, "DATABASE_MAX_CONNECTIONS", "5")
                .parse()
                .context("DATABASE_MAX_CONNECTIONS must be a positive integer")?,
            api_key: required(&lookup, "API_KEY")?,
            server_host: optional(&lookup, "SERVER_HOST", "0.0.0.0"),
            server_port: optional(&lookup, "SERVER_PORT", "8080")
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
        })
    }
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the server, e.g. `http://192.168.1.10:8080`.
    pub server_url: String,
    pub api_key: String,
    pub fan_gpio: u32,
    pub heater_gpio: u32,
    /// Root of the sysfs GPIO tree.
    pub gpio_root: PathBuf,
    /// Log output changes instead of touching GPIO.
    pub gpio_dry_run: bool,
    /// Relay boards that switch on a low level.
    pub relay_active_low: bool,
    pub sensor_source: SensorSource,
    pub poll_interval: Duration,
    /// Upper bound for every request to the server.
    pub request_timeout: Duration,
    /// Extra attempts after a connection failure or timeout.
    pub request_retries: u32,
    pub retry_delay: Duration,
    /// Consecutive API failures are logged at warn level on the first and
    /// every Nth occurrence.
    pub api_error_log_every: u32,
    pub debug: bool,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let poll_interval_secs: u64 = optional(&lookup, "POLL_INTERVAL_SECS", "30")
            .parse()
            .context("POLL_INTERVAL_SECS must be a positive integer")?;
        anyhow::ensure!(poll_interval_secs > 0, "POLL_INTERVAL_SECS must be greater than zero");

        let request_timeout_secs: u64 = optional(&lookup, "REQUEST_TIMEOUT_SECS", "5")
            .parse()
            .context("REQUEST_TIMEOUT_SECS must be a positive integer")?;
        anyhow::ensure!(request_timeout_secs > 0, "REQUEST_TIMEOUT_SECS must be greater than zero");

        let request_retries: u32 = optional(&lookup, "REQUEST_RETRIES", "2")
            .parse()
            .context("REQUEST_RETRIES must be a non-negative integer")?;

        let retry_delay_ms: u64 = optional(&lookup, "RETRY_DELAY_MS", "500")
            .parse()
            .context("RETRY_DELAY_MS must be a non-negative integer")?;

        let api_error_log_every: u32 = optional(&lookup, "API_ERROR_LOG_EVERY", "10")
            .parse()
            .context("API_ERROR_LOG_EVERY must be a positive integer")?;

        Ok(Self {
            server_url: required(&lookup, "SERVER_URL")?,
            api_key: required(&lookup, "API_KEY")?,
            fan_gpio: optional(&lookup, "FAN_GPIO", "17")
                .parse()
                .context("FAN_GPIO must be a GPIO line number")?,
            heater_gpio: optional(&lookup, "HEATER_GPIO", "27")
                .parse()
                .context("HEATER_GPIO must be a GPIO line number")?,
            gpio_root: PathBuf::from(optional(&lookup, "GPIO_ROOT", "/sys/class/gpio")),
            gpio_dry_run: parse_flag("GPIO_DRY_RUN", &optional(&lookup, "GPIO_DRY_RUN", "false"))?,
            relay_active_low: parse_flag(
                "RELAY_ACTIVE_LOW",
                &optional(&lookup, "RELAY_ACTIVE_LOW", "false"),
            )?,
            sensor_source: optional(&lookup, "SENSOR_SOURCE", "simulated")
                .parse()
                .context("SENSOR_SOURCE must be 'simulated' or a file path")?,
            poll_interval: Duration::from_secs(poll_interval_secs),
            request_timeout: Duration::from_secs(request_timeout_secs),
            request_retries,
            retry_delay: Duration::from_millis(retry_delay_ms),
            api_error_log_every: api_error_log_every.max(1),
            debug: parse_flag("DEBUG", &optional(&lookup, "DEBUG", "false"))?,
        })
    }

    /// Default `tracing` filter directive when `RUST_LOG` is unset.
    pub fn default_log_filter(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow::anyhow!("{key} must be a boolean, got: {other:?}")),
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Blank values count as missing.
fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    let value = lookup(key).with_context(|| format!("missing required env var: {key}"))?;
    anyhow::ensure!(!value.trim().is_empty(), "env var {key} must not be empty");
    Ok(value)
}

fn optional(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_owned())
}
