use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::receiver::MIN_FRAME_LEN;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub mission: MissionConfig,
    #[serde(default)]
    pub target: TargetConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            stats_log_interval_secs: default_stats_log_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MissionConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub target: String,
    /// Message database; relative paths resolve against the config file
    pub database: Option<PathBuf>,
}

/// Connection parameters for one flight-software target.
#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    #[serde(default = "default_host_addr")]
    pub host_addr: String,
    #[serde(default = "default_recv_tlm_port")]
    pub recv_tlm_port: u16,
    /// Receive timeout in seconds; one idle tick of the receive loop
    #[serde(default = "default_recv_tlm_timeout")]
    pub recv_tlm_timeout: f64,
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
    /// Pause between binding and starting the receive loop, so a display
    /// front end can finish initialising before the first packet
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Consecutive socket errors before logging escalates to error level
    #[serde(default = "default_socket_error_threshold")]
    pub socket_error_threshold: u32,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host_addr: default_host_addr(),
            recv_tlm_port: default_recv_tlm_port(),
            recv_tlm_timeout: default_recv_tlm_timeout(),
            recv_buffer_size: default_recv_buffer_size(),
            startup_delay_ms: default_startup_delay_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            socket_error_threshold: default_socket_error_threshold(),
        }
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_stats_log_interval_secs() -> u64 { 60 }
fn default_host_addr() -> String { "0.0.0.0".to_string() }
fn default_recv_tlm_port() -> u16 { 1235 }
fn default_recv_tlm_timeout() -> f64 { 1.0 }
fn default_recv_buffer_size() -> usize { 4096 }
fn default_startup_delay_ms() -> u64 { 1000 }
fn default_shutdown_timeout_ms() -> u64 { 2000 }
fn default_socket_error_threshold() -> u32 { 10 }

impl TargetConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host_addr, self.recv_tlm_port)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recv_tlm_timeout)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_addr.trim().is_empty() {
            anyhow::bail!("target.host_addr is empty");
        }
        if !self.recv_tlm_timeout.is_finite() || self.recv_tlm_timeout <= 0.0 {
            anyhow::bail!(
                "target.recv_tlm_timeout must be a positive number of seconds, got {}",
                self.recv_tlm_timeout
            );
        }
        if self.recv_buffer_size <= MIN_FRAME_LEN || self.recv_buffer_size > 65535 {
            anyhow::bail!(
                "target.recv_buffer_size must be between {} and 65535, got {}",
                MIN_FRAME_LEN + 1,
                self.recv_buffer_size
            );
        }
        if self.socket_error_threshold == 0 {
            anyhow::bail!("target.socket_error_threshold must be at least 1");
        }
        Ok(())
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        let mut config = Self::parse(&content)?;

        if let (Some(db), Some(dir)) = (config.mission.database.as_mut(), path.parent()) {
            if db.is_relative() {
                *db = dir.join(&*db);
            }
        }

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.target.validate()
    }
}
