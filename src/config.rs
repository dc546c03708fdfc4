use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

pub mod defaults {
    pub const CONFIG_PATH: &str = "relayq.toml";
    pub const DB_PATH: &str = "relayq.db";
    pub const BATCH_SIZE: u32 = 100;
    pub const PROCESS_INTERVAL_MS: u64 = 1_000;
    pub const MAX_PROCESSING_WORKERS: u32 = 10;
    pub const BASE_RETRY_INTERVAL_SECS: u64 = 1;
    pub const MAX_RETRY_INTERVAL_SECS: u64 = 60;
    pub const HEALTH_PORT: u16 = 8089;
}

/// Environment layer: where to find the config file and an optional
/// database-path override. Everything else lives in the file.
#[derive(Clone, Deserialize, Default)]
pub struct Env {
    pub config: Option<String>,
    pub db_path: Option<String>,
}

impl Env {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("RELAYQ_").from_env::<Self>()?)
    }

    pub fn config_path(&self) -> &str {
        self.config.as_deref().unwrap_or(defaults::CONFIG_PATH)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    pub source_servers: SourceServers,
    pub authentication: AuthConfig,
    pub heartbeat: HeartbeatConfig,
    pub delimiter: DelimiterConfig,
    #[serde(default)]
    pub target_servers: Vec<TargetConfig>,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: defaults::DB_PATH.to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    pub batch_size: u32,
    pub process_interval_ms: u64,
    pub max_processing_workers: u32,
    pub base_retry_interval_secs: u64,
    pub max_retry_interval_secs: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            process_interval_ms: defaults::PROCESS_INTERVAL_MS,
            max_processing_workers: defaults::MAX_PROCESSING_WORKERS,
            base_retry_interval_secs: defaults::BASE_RETRY_INTERVAL_SECS,
            max_retry_interval_secs: defaults::MAX_RETRY_INTERVAL_SECS,
        }
    }
}

impl ForwarderConfig {
    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }

    pub fn base_retry_interval(&self) -> Duration {
        Duration::from_secs(self.base_retry_interval_secs)
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_secs(self.max_retry_interval_secs)
    }
}

/// Main/backup upstream pair. The bridge holds exactly one live session at a
/// time; which endpoint owns it is decided by the failover state machine.
#[derive(Clone, Debug, Deserialize)]
pub struct SourceServers {
    pub primary: SourceEndpoint,
    pub backup: SourceEndpoint,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SourceEndpoint {
    pub id: String,
    pub name: String,
    pub address: String,
    pub enabled: bool,
    pub timeout_secs: u64,
    pub max_retries: u32,
    #[serde(default = "default_source_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,
    pub failover_threshold: u32,
}

fn default_source_batch_size() -> u32 {
    100
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_health_check_timeout() -> u64 {
    5
}

impl SourceEndpoint {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AuthConfig {
    pub token: String,
    pub source_id: u32,
    pub host_id: u32,
    pub reauth_interval_secs: u64,
}

impl AuthConfig {
    pub fn reauth_interval(&self) -> Duration {
        Duration::from_secs(self.reauth_interval_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub write_idle_timeout_secs: u64,
    pub read_idle_timeout_secs: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn write_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.write_idle_timeout_secs)
    }

    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.read_idle_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DelimiterConfig {
    /// Hex-encoded delimiter literal, e.g. "7878787888888888".
    pub separator: String,
    pub max_packet_length: usize,
}

impl DelimiterConfig {
    pub fn separator_bytes(&self) -> Result<Vec<u8>, Error> {
        hex::decode(&self.separator)
            .map_err(|e| Error::config(format!("delimiter separator is not valid hex: {e}")))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TargetConfig {
    pub id: String,
    pub name: String,
    pub address: String,
    pub enabled: bool,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub batch_size: u32,
    pub priority: i32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: defaults::HEALTH_PORT,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {path}: {e}")))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::config(format!("cannot parse {path}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.validate_source_servers()?;
        self.validate_target_servers()?;
        self.validate_authentication()?;
        self.validate_heartbeat()?;
        self.validate_delimiter()?;
        Ok(())
    }

    fn validate_source_servers(&self) -> Result<(), Error> {
        validate_endpoint(&self.source_servers.primary, "primary")?;
        validate_endpoint(&self.source_servers.backup, "backup")?;

        if self.source_servers.primary.address == self.source_servers.backup.address {
            return Err(Error::config(
                "primary and backup servers cannot have the same address",
            ));
        }

        Ok(())
    }

    fn validate_target_servers(&self) -> Result<(), Error> {
        if self.target_servers.is_empty() {
            return Err(Error::config("no target servers configured"));
        }

        let mut seen = std::collections::HashSet::new();
        for target in &self.target_servers {
            if !seen.insert(target.id.as_str()) {
                return Err(Error::config(format!(
                    "duplicate target server id: {}",
                    target.id
                )));
            }
            if target.id.is_empty() {
                return Err(Error::config("target server: id is required"));
            }
            if target.name.is_empty() {
                return Err(Error::config(format!(
                    "target server {}: name is required",
                    target.id
                )));
            }
            validate_address(&target.address)
                .map_err(|e| Error::config(format!("target server {}: {e}", target.id)))?;
            if target.timeout_secs == 0 {
                return Err(Error::config(format!(
                    "target server {}: timeout_secs must be positive",
                    target.id
                )));
            }
            if target.batch_size == 0 {
                return Err(Error::config(format!(
                    "target server {}: batch_size must be positive",
                    target.id
                )));
            }
        }

        Ok(())
    }

    fn validate_authentication(&self) -> Result<(), Error> {
        let auth = &self.authentication;
        // Any token length is legal on the wire: ASCII tokens are zero-padded
        // or truncated to 32 bytes. A 64-character token is meant as hex and
        // must decode.
        if auth.token.len() == 64 && hex::decode(&auth.token).is_err() {
            return Err(Error::config(
                "authentication token of 64 characters must be valid hex",
            ));
        }
        if auth.reauth_interval_secs == 0 {
            return Err(Error::config(
                "authentication reauth_interval_secs must be positive",
            ));
        }
        Ok(())
    }

    fn validate_heartbeat(&self) -> Result<(), Error> {
        let hb = &self.heartbeat;
        if hb.interval_secs == 0 {
            return Err(Error::config("heartbeat interval_secs must be positive"));
        }
        if hb.write_idle_timeout_secs == 0 {
            return Err(Error::config(
                "heartbeat write_idle_timeout_secs must be positive",
            ));
        }
        if hb.read_idle_timeout_secs == 0 {
            return Err(Error::config(
                "heartbeat read_idle_timeout_secs must be positive",
            ));
        }
        Ok(())
    }

    fn validate_delimiter(&self) -> Result<(), Error> {
        if self.delimiter.separator.is_empty() {
            return Err(Error::config("delimiter separator is required"));
        }
        if self.delimiter.separator.len() % 2 != 0 {
            return Err(Error::config(
                "delimiter separator must be an even-length hex string",
            ));
        }
        self.delimiter.separator_bytes()?;
        if self.delimiter.max_packet_length == 0 {
            return Err(Error::config(
                "delimiter max_packet_length must be positive",
            ));
        }
        Ok(())
    }
}

fn validate_endpoint(server: &SourceEndpoint, kind: &str) -> Result<(), Error> {
    if server.id.is_empty() {
        return Err(Error::config(format!("{kind} server: id is required")));
    }
    if server.name.is_empty() {
        return Err(Error::config(format!("{kind} server: name is required")));
    }
    validate_address(&server.address).map_err(|e| Error::config(format!("{kind} server: {e}")))?;
    if server.timeout_secs == 0 {
        return Err(Error::config(format!(
            "{kind} server: timeout_secs must be positive"
        )));
    }
    if server.batch_size == 0 {
        return Err(Error::config(format!(
            "{kind} server: batch_size must be positive"
        )));
    }
    if server.failover_threshold == 0 {
        return Err(Error::config(format!(
            "{kind} server: failover_threshold must be positive"
        )));
    }
    Ok(())
}

fn validate_address(address: &str) -> Result<(), String> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(format!(
            "invalid address '{address}', expected 'host:port'"
        )),
    }
}
