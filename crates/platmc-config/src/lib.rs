//! Configuration for the platmc manager.
//!
//! A TOML file (platform config dir, or an explicit path) layered over
//! built-in defaults and `PLATMC_` environment variables, translated into
//! [`platmc_core::ManagerConfig`]. The `[[demo.endpoints]]` tables describe
//! simulated termini for the loopback demo.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use platmc_core::{CapabilityResolver, IbmResolver, ManagerConfig, RetryPolicy, StandardResolver};
use platmc_proto::EndpointAddress;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── Durations as human-readable strings ─────────────────────────────

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }

    pub mod option {
        use super::{Deserialize, Deserializer, Duration, Error, Serializer};

        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => super::serialize(d, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| humantime::parse_duration(&raw).map_err(D::Error::custom))
                .transpose()
        }
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerSection,

    #[serde(default)]
    pub logging: LoggingSection,

    #[serde(default)]
    pub oem: OemSection,

    #[serde(default)]
    pub demo: DemoSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ManagerSection {
    #[serde(with = "duration_str", default = "default_request_timeout")]
    pub request_timeout: Duration,

    #[serde(default = "default_discovery_attempts")]
    pub discovery_attempts: u32,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default = "default_max_records")]
    pub max_records: usize,

    #[serde(with = "duration_str", default = "default_poll_interval")]
    pub poll_interval: Duration,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Re-enable a faulted terminus after this long. Unset: stay parked
    /// until availability is set again.
    #[serde(
        with = "duration_str::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub fault_cooldown: Option<Duration>,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            discovery_attempts: default_discovery_attempts(),
            retry: RetrySection::default(),
            max_records: default_max_records(),
            poll_interval: default_poll_interval(),
            failure_threshold: default_failure_threshold(),
            fault_cooldown: None,
        }
    }
}

fn default_request_timeout() -> Duration {
    ManagerConfig::default().request_timeout
}
fn default_discovery_attempts() -> u32 {
    ManagerConfig::default().discovery_attempts
}
fn default_max_records() -> usize {
    ManagerConfig::default().max_records
}
fn default_poll_interval() -> Duration {
    ManagerConfig::default().poll_interval
}
fn default_failure_threshold() -> u32 {
    ManagerConfig::default().failure_threshold
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetrySection {
    #[serde(with = "duration_str", default = "default_retry_first")]
    pub first: Duration,

    #[serde(with = "duration_str", default = "default_retry_max")]
    pub max: Duration,

    #[serde(default = "default_retry_factor")]
    pub factor: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            first: default_retry_first(),
            max: default_retry_max(),
            factor: default_retry_factor(),
        }
    }
}

fn default_retry_first() -> Duration {
    RetryPolicy::default().first
}
fn default_retry_max() -> Duration {
    RetryPolicy::default().max
}
fn default_retry_factor() -> f64 {
    RetryPolicy::default().factor
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingSection {
    /// Filter used when neither `RUST_LOG` nor `-v` is given.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "warn".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OemSection {
    /// "standard" or "ibm".
    #[serde(default = "default_oem_profile")]
    pub profile: String,

    /// First sensor id used for vendor-injected capabilities.
    #[serde(default = "default_oem_sensor_base")]
    pub injected_sensor_base: u16,
}

impl Default for OemSection {
    fn default() -> Self {
        Self {
            profile: default_oem_profile(),
            injected_sensor_base: default_oem_sensor_base(),
        }
    }
}

fn default_oem_profile() -> String {
    "standard".into()
}
fn default_oem_sensor_base() -> u16 {
    0xff00
}

// ── Demo termini ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DemoSection {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<DemoEndpoint>,
}

/// One simulated terminus on the loopback bus.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DemoEndpoint {
    /// `"<network>:<eid>"`
    pub address: String,

    /// TID the device claims before discovery.
    #[serde(default)]
    pub tid: u8,

    /// Artificial response latency.
    #[serde(
        with = "duration_str::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub latency: Option<Duration>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub numeric_sensors: Vec<DemoNumeric>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_sensors: Vec<DemoState>,
}

impl DemoEndpoint {
    pub fn endpoint(&self) -> Result<EndpointAddress, ConfigError> {
        EndpointAddress::from_str(&self.address)
            .map_err(|e| invalid("demo.endpoints.address", e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DemoNumeric {
    pub id: u16,
    pub entity_type: u16,
    #[serde(default)]
    pub entity_instance: u16,
    pub raw: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DemoState {
    pub id: u16,
    pub entity_type: u16,
    #[serde(default)]
    pub entity_instance: u16,
    pub state_set: u16,
    pub state: u8,
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Validate and convert to the manager's runtime settings.
    pub fn to_manager_config(&self) -> Result<ManagerConfig, ConfigError> {
        let m = &self.manager;
        if m.request_timeout.is_zero() {
            return Err(invalid("manager.request_timeout", "must be greater than zero"));
        }
        if m.poll_interval.is_zero() {
            return Err(invalid("manager.poll_interval", "must be greater than zero"));
        }
        if m.discovery_attempts == 0 {
            return Err(invalid("manager.discovery_attempts", "must be at least 1"));
        }
        if m.failure_threshold == 0 {
            return Err(invalid("manager.failure_threshold", "must be at least 1"));
        }
        if m.max_records == 0 {
            return Err(invalid("manager.max_records", "must be at least 1"));
        }
        if !m.retry.factor.is_finite() || m.retry.factor < 1.0 {
            return Err(invalid(
                "manager.retry.factor",
                format!("must be a finite number >= 1, got {}", m.retry.factor),
            ));
        }
        if m.retry.max < m.retry.first {
            return Err(invalid("manager.retry.max", "must not be below retry.first"));
        }

        Ok(ManagerConfig {
            request_timeout: m.request_timeout,
            discovery_attempts: m.discovery_attempts,
            retry: RetryPolicy {
                first: m.retry.first,
                max: m.retry.max,
                factor: m.retry.factor,
            },
            max_records: m.max_records,
            poll_interval: m.poll_interval,
            failure_threshold: m.failure_threshold,
            fault_cooldown: m.fault_cooldown,
            ..ManagerConfig::default()
        })
    }

    /// Capability resolver for the configured vendor profile.
    pub fn resolver(&self) -> Result<Arc<dyn CapabilityResolver>, ConfigError> {
        match self.oem.profile.as_str() {
            "standard" => Ok(Arc::new(StandardResolver)),
            "ibm" => Ok(Arc::new(IbmResolver::new(self.oem.injected_sensor_base))),
            other => Err(invalid(
                "oem.profile",
                format!("expected 'standard' or 'ibm', got '{other}'"),
            )),
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "platmc", "platmc").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("platmc");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

fn figment_for(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("PLATMC_").split("__"))
}

/// Load from the default path + environment. A missing file is fine.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` + environment. A missing file is fine.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    Ok(figment_for(path).extract()?)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}
