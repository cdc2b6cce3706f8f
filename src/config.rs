use crate::serial::port::SUPPORTED_BAUD_RATES;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub sms: SmsConfig,
}
impl AppConfig {
    pub fn load(config_filepath: Option<PathBuf>) -> Result<Self> {
        let config_path = config_filepath.unwrap_or_else(|| PathBuf::from("config.toml"));

        let config_content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {config_path:?}"))?;

        let config: AppConfig = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse TOML config file: {config_path:?}"))?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !SUPPORTED_BAUD_RATES.contains(&self.serial.baud_rate) {
            bail!(
                "unsupported serial baud rate {}, expected one of {:?}",
                self.serial.baud_rate,
                SUPPORTED_BAUD_RATES
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Remote transports are not supported; startup rejects `false`.
    #[serde(default = "default_true")]
    pub is_local: bool,

    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Capacity of the bounded request queue in front of the port daemon.
    #[serde(default = "default_cmd_channel_buffer_size")]
    pub cmd_channel_buffer_size: usize,

    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}
impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            is_local: default_true(),
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            cmd_channel_buffer_size: default_cmd_channel_buffer_size(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Deadline for the first phase of the interactive send handshake.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}
impl SmsConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}
impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            check_interval_secs: default_check_interval_secs(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

fn default_serial_port() -> String {
    "/dev/ttyUSB2".to_string()
}
fn default_baud_rate() -> u32 {
    115200
}
fn default_cmd_channel_buffer_size() -> usize {
    64
}
fn default_read_buffer_size() -> usize {
    4096
}
fn default_db_path() -> String {
    "sms.db".to_string()
}
fn default_check_interval_secs() -> u64 {
    30
}
fn default_send_timeout_secs() -> u64 {
    3
}
fn default_true() -> bool {
    true
}
