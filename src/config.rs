//! Configuration file support.
//!
//! The harness reads one file shared by both roles. The format follows the file
//! extension: `.json` is parsed as JSON, anything else as YAML. A handful of
//! environment variables override file values (env > file > defaults).

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config_validation::{
    AddressValidator, DurationValidator, RangeValidator, ValidationContext,
};
use crate::pacer::PacerBounds;
use crate::utils::parse_duration_string;

pub const ENV_LB_ADDR: &str = "HARNESS_LB_ADDR";
pub const ENV_CLIENT_PORT: &str = "HARNESS_CLIENT_PORT";
pub const ENV_FRONTEND_PORT: &str = "HARNESS_FRONTEND_PORT";
pub const ENV_METRICS_PORT: &str = "HARNESS_METRICS_PORT";

/// Errors that can occur when loading or parsing configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Invalid value '{value}' for environment variable {var}")]
    InvalidEnv { var: String, value: String },
}

/// Duration as written in the file: bare integers are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FileDuration {
    Millis(u64),
    String(String),
}

impl FileDuration {
    pub fn to_std_duration(&self) -> Result<Duration, ConfigError> {
        match self {
            FileDuration::Millis(ms) => Ok(Duration::from_millis(*ms)),
            FileDuration::String(s) => parse_duration_string(s)
                .map_err(|e| ConfigError::Validation(format!("Invalid duration '{}': {}", s, e))),
        }
    }
}

impl From<&str> for FileDuration {
    fn from(s: &str) -> Self {
        FileDuration::String(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLoadBalancer {
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default = "default_lb_port")]
    pub port: u16,
}

fn default_lb_port() -> u16 {
    9000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileClient {
    pub port: u16,
    pub initial_timeout: FileDuration,
    pub lease_retry_timeout: FileDuration,
    pub max_read: usize,
    pub start_stopped: bool,
    pub progress: bool,
    pub late_entry_grace: FileDuration,
}

impl Default for FileClient {
    fn default() -> Self {
        Self {
            port: 9001,
            initial_timeout: FileDuration::Millis(100),
            lease_retry_timeout: FileDuration::Millis(10),
            max_read: 64,
            start_stopped: false,
            progress: true,
            late_entry_grace: "30s".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileFrontend {
    pub port: u16,
    pub initial_timeout: FileDuration,
    pub max_read: usize,
    pub shrink_on_success: bool,
    pub handshake_retry: FileDuration,
    pub backend_path: String,
}

impl Default for FileFrontend {
    fn default() -> Self {
        Self {
            port: 9000,
            initial_timeout: "2s".into(),
            max_read: 32,
            shrink_on_success: false,
            handshake_retry: "1s".into(),
            backend_path: "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilePacer {
    pub min_timeout: FileDuration,
    pub max_timeout: FileDuration,
}

impl Default for FilePacer {
    fn default() -> Self {
        Self {
            min_timeout: FileDuration::Millis(1),
            max_timeout: "60s".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileMetrics {
    pub port: Option<u16>,
}

/// Root structure of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    pub load_balancer: FileLoadBalancer,

    #[serde(default)]
    pub client: FileClient,

    #[serde(default)]
    pub frontend: FileFrontend,

    #[serde(default)]
    pub pacer: FilePacer,

    #[serde(default)]
    pub metrics: FileMetrics,
}

/// Settings for the client role.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub port: u16,
    pub initial_timeout: Duration,
    pub lease_retry_timeout: Duration,
    pub max_read: usize,
    pub start_stopped: bool,
    pub progress: bool,
    pub late_entry_grace: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            port: 9001,
            initial_timeout: Duration::from_millis(100),
            lease_retry_timeout: Duration::from_millis(10),
            max_read: 64,
            start_stopped: false,
            progress: true,
            late_entry_grace: Duration::from_secs(30),
        }
    }
}

/// Settings for the frontend role.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontendSettings {
    pub port: u16,
    pub initial_timeout: Duration,
    pub max_read: usize,
    pub shrink_on_success: bool,
    pub handshake_retry: Duration,
    pub backend_path: String,
}

impl Default for FrontendSettings {
    fn default() -> Self {
        Self {
            port: 9000,
            initial_timeout: Duration::from_secs(2),
            max_read: 32,
            shrink_on_success: false,
            handshake_retry: Duration::from_secs(1),
            backend_path: "/".to_string(),
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Load balancer as `host:port`.
    pub load_balancer: String,
    pub client: ClientSettings,
    pub frontend: FrontendSettings,
    pub pacer: PacerBounds,
    pub metrics_port: Option<u16>,
}

impl Config {
    /// Load configuration from a file, apply environment overrides and validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));

        let file: FileConfig = if is_json {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        Self::from_file_config(&file)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = serde_yaml::from_str(content)?;
        Self::from_file_config(&file)
    }

    /// Resolve a parsed file, honoring environment overrides.
    pub fn from_file_config(file: &FileConfig) -> Result<Self, ConfigError> {
        let load_balancer = match env::var(ENV_LB_ADDR) {
            Ok(addr) => addr,
            Err(_) => file
                .load_balancer
                .hosts
                .first()
                .map(|host| format!("{}:{}", host, file.load_balancer.port))
                .unwrap_or_default(),
        };

        let client = ClientSettings {
            port: env_override_u16(ENV_CLIENT_PORT)?.unwrap_or(file.client.port),
            initial_timeout: file.client.initial_timeout.to_std_duration()?,
            lease_retry_timeout: file.client.lease_retry_timeout.to_std_duration()?,
            max_read: file.client.max_read,
            start_stopped: file.client.start_stopped,
            progress: file.client.progress,
            late_entry_grace: file.client.late_entry_grace.to_std_duration()?,
        };

        let frontend = FrontendSettings {
            port: env_override_u16(ENV_FRONTEND_PORT)?.unwrap_or(file.frontend.port),
            initial_timeout: file.frontend.initial_timeout.to_std_duration()?,
            max_read: file.frontend.max_read,
            shrink_on_success: file.frontend.shrink_on_success,
            handshake_retry: file.frontend.handshake_retry.to_std_duration()?,
            backend_path: file.frontend.backend_path.clone(),
        };

        let pacer = PacerBounds {
            min: file.pacer.min_timeout.to_std_duration()?,
            max: file.pacer.max_timeout.to_std_duration()?,
        };

        let metrics_port = env_override_u16(ENV_METRICS_PORT)?.or(file.metrics.port);

        let config = Config {
            load_balancer,
            client,
            frontend,
            pacer,
            metrics_port,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut ctx = ValidationContext::new();

        ctx.enter("loadBalancer");
        if self.load_balancer.is_empty() {
            ctx.field_error("At least one load balancer host must be configured".to_string());
        } else {
            ctx.check("address", AddressValidator::validate(&self.load_balancer));
        }
        ctx.exit();

        ctx.enter("pacer");
        ctx.check(
            "minTimeout",
            DurationValidator::validate_positive(self.pacer.min, "minTimeout"),
        );
        if self.pacer.min > self.pacer.max {
            ctx.field_error(format!(
                "minTimeout {:?} exceeds maxTimeout {:?}",
                self.pacer.min, self.pacer.max
            ));
        }
        ctx.exit();

        ctx.enter("client");
        ctx.check(
            "port",
            RangeValidator::validate_positive_u64(self.client.port as u64, "port"),
        );
        ctx.check(
            "maxRead",
            RangeValidator::validate_u64(self.client.max_read as u64, 1, 65_507, "maxRead"),
        );
        ctx.check(
            "initialTimeout",
            DurationValidator::validate_within(
                self.client.initial_timeout,
                self.pacer.min,
                self.pacer.max,
                "initialTimeout",
            ),
        );
        ctx.check(
            "leaseRetryTimeout",
            DurationValidator::validate_positive(self.client.lease_retry_timeout, "leaseRetryTimeout"),
        );
        ctx.exit();

        ctx.enter("frontend");
        ctx.check(
            "port",
            RangeValidator::validate_positive_u64(self.frontend.port as u64, "port"),
        );
        ctx.check(
            "maxRead",
            RangeValidator::validate_u64(self.frontend.max_read as u64, 1, 65_507, "maxRead"),
        );
        ctx.check(
            "initialTimeout",
            DurationValidator::validate_within(
                self.frontend.initial_timeout,
                self.pacer.min,
                self.pacer.max,
                "initialTimeout",
            ),
        );
        ctx.check(
            "handshakeRetry",
            DurationValidator::validate_positive(self.frontend.handshake_retry, "handshakeRetry"),
        );
        if !self.frontend.backend_path.starts_with('/') {
            ctx.enter("backendPath");
            ctx.field_error("Backend path must start with '/'".to_string());
            ctx.exit();
        }
        ctx.exit();

        ctx.into_result()
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Log a summary of the effective configuration.
    pub fn print_summary(&self) {
        info!(
            load_balancer = %self.load_balancer,
            client_port = self.client.port,
            client_initial_timeout_ms = self.client.initial_timeout.as_millis() as u64,
            frontend_port = self.frontend.port,
            frontend_initial_timeout_ms = self.frontend.initial_timeout.as_millis() as u64,
            pacer_min_ms = self.pacer.min.as_millis() as u64,
            pacer_max_ms = self.pacer.max.as_millis() as u64,
            metrics_port = ?self.metrics_port,
            "Configuration loaded"
        );
    }
}

fn env_override_u16(var: &str) -> Result<Option<u16>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_duration_millis_and_strings() {
        assert_eq!(
            FileDuration::Millis(100).to_std_duration().unwrap(),
            Duration::from_millis(100)
        );
        assert_eq!(
            FileDuration::from("2s").to_std_duration().unwrap(),
            Duration::from_secs(2)
        );
        assert!(FileDuration::from("2 parsecs").to_std_duration().is_err());
    }

    #[test]
    fn file_defaults_match_settings_defaults() {
        let file = FileClient::default();
        assert_eq!(file.port, ClientSettings::default().port);
        assert_eq!(
            file.initial_timeout.to_std_duration().unwrap(),
            ClientSettings::default().initial_timeout
        );

        let file = FileFrontend::default();
        assert_eq!(
            file.handshake_retry.to_std_duration().unwrap(),
            FrontendSettings::default().handshake_retry
        );
    }
}
