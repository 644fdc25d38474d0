//! Driver configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `lms.toml` (base configuration; missing file means all defaults)
//! 2. Environment variables prefixed with `LMS_`, nested with `__`
//!    (e.g. `LMS_STREAM__BUFFER_DEPTH=256`)
//!
//! # Example
//! ```no_run
//! use lms_driver::config::DriverConfig;
//!
//! let config = DriverConfig::load()?;
//! config.validate()?;
//! println!("Xillybus nodes in {}", config.xillybus.device_dir.display());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::mcu::McuMode;
use crate::poll::BoundedPoll;
use crate::protocol::ControlTimeouts;
use crate::stream::{SampleFormat, StreamSettings};

/// Default configuration file name.
pub const CONFIG_FILE: &str = "lms.toml";

/// Top-level driver configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Control and data transfer timing
    #[serde(default)]
    pub transport: TransportConfig,
    /// Xillybus PCIe device nodes
    #[serde(default)]
    pub xillybus: XillybusConfig,
    /// Memory-mapped control mailbox
    #[serde(default)]
    pub mailbox: MailboxConfig,
    /// Streaming defaults
    #[serde(default)]
    pub stream: StreamDefaults,
    /// FPGA PLL polling
    #[serde(default)]
    pub pll: PllConfig,
    /// MCU loader polling
    #[serde(default)]
    pub mcu: McuConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Transport timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Deadline for writing one control packet (ms)
    #[serde(default = "default_control_write_timeout")]
    pub control_write_timeout_ms: u64,
    /// Deadline for reading one control reply (ms)
    #[serde(default = "default_control_read_timeout")]
    pub control_read_timeout_ms: u64,
    /// Back-off between would-block retries (µs)
    #[serde(default = "default_retry_interval")]
    pub retry_interval_us: u64,
}

/// Xillybus device node layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XillybusConfig {
    /// Whether the Xillybus connection entry is registered
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory holding `xillybus_write_8` and friends
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,
    /// RX channels on the board
    #[serde(default = "default_channels")]
    pub rx_channels: usize,
    /// TX channels on the board
    #[serde(default = "default_channels")]
    pub tx_channels: usize,
}

/// Mapped control mailbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// File or device node to map; no mailbox entry when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Offset of the mailbox within the file
    #[serde(default)]
    pub offset: u64,
    /// Bytes per request/response window
    #[serde(default = "default_mailbox_capacity")]
    pub capacity: usize,
}

/// Streaming defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDefaults {
    /// Host sample format
    #[serde(default)]
    pub format: SampleFormat,
    /// FIFO depth in blocks
    #[serde(default = "default_buffer_depth")]
    pub buffer_depth: usize,
    /// 0.0 = throughput, 1.0 = latency
    #[serde(default = "default_latency")]
    pub latency: f32,
    /// Deadline of one data transfer (ms)
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_ms: u64,
    /// Streaming-thread wait on a full or empty FIFO (ms)
    #[serde(default = "default_fifo_timeout")]
    pub fifo_timeout_ms: u64,
}

/// PLL status polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PllConfig {
    /// Reference clock for the FPGA PLL (Hz)
    #[serde(default = "default_reference")]
    pub reference_hz: f64,
    /// Deadline for each done-bit poll (ms)
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    /// Maximum status reads per poll
    #[serde(default = "default_poll_iterations")]
    pub max_polls: u32,
}

/// MCU loader polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McuConfig {
    /// Deadline for each FIFO-empty and programmed poll (ms)
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    /// Maximum status reads per poll
    #[serde(default = "default_poll_iterations")]
    pub max_polls: u32,
    /// Mode used by `program_mcu` when none is given
    #[serde(default = "default_mcu_mode")]
    pub mode: McuMode,
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Log span open/close, timing PLL and MCU sequences
    #[serde(default)]
    pub span_events: bool,
}

// Default value functions
fn default_control_write_timeout() -> u64 {
    500
}

fn default_control_read_timeout() -> u64 {
    1000
}

fn default_retry_interval() -> u64 {
    50
}

fn default_true() -> bool {
    true
}

fn default_device_dir() -> PathBuf {
    PathBuf::from("/dev")
}

fn default_channels() -> usize {
    2
}

fn default_mailbox_capacity() -> usize {
    64
}

fn default_buffer_depth() -> usize {
    64
}

fn default_latency() -> f32 {
    0.5
}

fn default_transfer_timeout() -> u64 {
    100
}

fn default_fifo_timeout() -> u64 {
    20
}

fn default_reference() -> f64 {
    30.72e6
}

fn default_poll_timeout() -> u64 {
    100
}

fn default_poll_iterations() -> u32 {
    1000
}

fn default_mcu_mode() -> McuMode {
    McuMode::Sram
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            control_write_timeout_ms: default_control_write_timeout(),
            control_read_timeout_ms: default_control_read_timeout(),
            retry_interval_us: default_retry_interval(),
        }
    }
}

impl Default for XillybusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_dir: default_device_dir(),
            rx_channels: default_channels(),
            tx_channels: default_channels(),
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            path: None,
            offset: 0,
            capacity: default_mailbox_capacity(),
        }
    }
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self {
            format: SampleFormat::default(),
            buffer_depth: default_buffer_depth(),
            latency: default_latency(),
            transfer_timeout_ms: default_transfer_timeout(),
            fifo_timeout_ms: default_fifo_timeout(),
        }
    }
}

impl Default for PllConfig {
    fn default() -> Self {
        Self {
            reference_hz: default_reference(),
            poll_timeout_ms: default_poll_timeout(),
            max_polls: default_poll_iterations(),
        }
    }
}

impl Default for McuConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout(),
            max_polls: default_poll_iterations(),
            mode: default_mcu_mode(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            span_events: false,
        }
    }
}

impl DriverConfig {
    /// Load configuration from `lms.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `LMS_`.
    /// Example: `LMS_LOGGING__LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(CONFIG_FILE)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LMS_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        if self.stream.buffer_depth == 0 {
            return Err("stream.buffer_depth must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.stream.latency) {
            return Err(format!(
                "Invalid stream.latency {}. Must be 0.0-1.0",
                self.stream.latency
            ));
        }
        if self.transport.control_write_timeout_ms == 0 || self.transport.control_read_timeout_ms == 0 {
            return Err("control timeouts must be non-zero".to_string());
        }
        if !(self.pll.reference_hz.is_finite() && self.pll.reference_hz > 0.0) {
            return Err(format!("Invalid pll.reference_hz {}", self.pll.reference_hz));
        }
        if self.mailbox.capacity < crate::protocol::PACKET_SIZE {
            return Err(format!(
                "mailbox.capacity {} cannot hold a {}-byte control packet",
                self.mailbox.capacity,
                crate::protocol::PACKET_SIZE
            ));
        }
        Ok(())
    }

    /// Render as TOML, e.g. to write a starting `lms.toml`.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Control exchange deadlines.
    pub fn control_timeouts(&self) -> ControlTimeouts {
        ControlTimeouts {
            write: Duration::from_millis(self.transport.control_write_timeout_ms),
            read: Duration::from_millis(self.transport.control_read_timeout_ms),
        }
    }

    /// Would-block retry back-off.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_micros(self.transport.retry_interval_us)
    }

    /// Streaming thread timing.
    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            transfer_timeout: Duration::from_millis(self.stream.transfer_timeout_ms),
            fifo_timeout: Duration::from_millis(self.stream.fifo_timeout_ms),
            ..StreamSettings::default()
        }
    }

    /// Budget for PLL status polls.
    pub fn pll_poll(&self) -> BoundedPoll {
        BoundedPoll::new(Duration::from_millis(self.pll.poll_timeout_ms))
            .with_max_iterations(self.pll.max_polls)
    }

    /// Budget for MCU status polls.
    pub fn mcu_poll(&self) -> BoundedPoll {
        BoundedPoll::new(Duration::from_millis(self.mcu.poll_timeout_ms))
            .with_max_iterations(self.mcu.max_polls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = DriverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.xillybus.device_dir, PathBuf::from("/dev"));
        assert_eq!(config.control_timeouts(), ControlTimeouts::default());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[stream]\nformat = \"packed12\"\nbuffer_depth = 256\n\n[pll]\nreference_hz = 40e6\n"
        )
        .unwrap();

        let config = DriverConfig::load_from(file.path()).unwrap();
        assert_eq!(config.stream.format, SampleFormat::Packed12);
        assert_eq!(config.stream.buffer_depth, 256);
        assert_eq!(config.stream.latency, 0.5);
        assert_eq!(config.pll.reference_hz, 40e6);
        assert_eq!(config.mcu.mode, McuMode::Sram);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = DriverConfig::load_from("/nonexistent/lms.toml").unwrap();
        assert_eq!(config.stream.buffer_depth, 64);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = DriverConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_latency() {
        let mut config = DriverConfig::default();
        config.stream.latency = 2.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = DriverConfig::default();
        config.mailbox.path = Some(PathBuf::from("/dev/lms_mailbox"));
        let text = config.to_toml().unwrap();
        let parsed: DriverConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
