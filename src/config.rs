//! Exporter configuration.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{ExporterError, ExporterResult};

/// Default path to the exporter config file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/coriolis-ovm-exporter/config.toml";

/// Default location for the metadata database file.
pub const DEFAULT_DB_FILE: &str = "/etc/coriolis-ovm-exporter/exporter.db";

/// Default HTTPS listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 5544;

/// Default lifetime of issued JWT tokens (7 days).
pub const DEFAULT_JWT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Top-level exporter configuration, parsed from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path on disk to the metadata database.
    #[serde(default = "default_db_file")]
    pub db_file: PathBuf,

    /// API endpoint of the OVM manager, used to authenticate client
    /// credentials on login.
    pub ovm_endpoint: Option<String>,

    /// API server configuration.
    #[serde(default)]
    pub api: ApiServerConfig,

    /// JWT configuration.
    pub jwt: JwtConfig,

    /// Optional log file. When set, logs are written to a rolling file
    /// sink instead of stdout.
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Reads and validates the config file at `path`.
    pub fn load(path: &Path) -> ExporterResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ExporterError::io(format!("reading config {}", path.display()), e))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| ExporterError::BadRequest(format!("decoding config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the config options.
    pub fn validate(&self) -> ExporterResult<()> {
        if self.ovm_endpoint.as_deref().unwrap_or("").is_empty() {
            return Err(ExporterError::BadRequest(
                "missing ovm_endpoint config option".into(),
            ));
        }
        self.api.validate()?;
        self.jwt.validate()?;
        Ok(())
    }
}

/// API server section.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: TlsSettings,
}

impl ApiServerConfig {
    /// Returns a host:port string suitable for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    fn validate(&self) -> ExporterResult<()> {
        if self.port == 0 {
            return Err(ExporterError::BadRequest(format!(
                "invalid port nr {}",
                self.port
            )));
        }
        if self.bind.parse::<IpAddr>().is_err() {
            return Err(ExporterError::BadRequest(format!(
                "invalid bind IP address {:?}",
                self.bind
            )));
        }
        self.tls.validate()
    }
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls: TlsSettings::default(),
        }
    }
}

/// TLS material for the API server. All three paths are required.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSettings {
    pub certificate: PathBuf,
    pub key: PathBuf,
    pub ca_certificate: PathBuf,
}

impl TlsSettings {
    fn validate(&self) -> ExporterResult<()> {
        for (name, path) in [
            ("certificate", &self.certificate),
            ("key", &self.key),
            ("ca_certificate", &self.ca_certificate),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ExporterError::BadRequest(format!(
                    "missing api.tls.{name} config option"
                )));
            }
            if !path.is_file() {
                return Err(ExporterError::BadRequest(format!(
                    "api.tls.{name}: no such file: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// JWT section.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    /// Token lifetime, accepts humantime strings such as "168h" or "7d".
    #[serde(default = "default_jwt_ttl", deserialize_with = "deserialize_duration")]
    pub time_to_live: Duration,
}

impl JwtConfig {
    fn validate(&self) -> ExporterResult<()> {
        if self.secret.is_empty() {
            return Err(ExporterError::BadRequest("missing jwt secret".into()));
        }
        Ok(())
    }
}

fn default_db_file() -> PathBuf {
    PathBuf::from(DEFAULT_DB_FILE)
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_jwt_ttl() -> Duration {
    DEFAULT_JWT_TTL
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}
