// src/config.rs
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::ads1299::InputSource;
use crate::drivers::ValidationError;
use crate::types::BufferBacking;

/// Everything needed to start a [`Reader`](crate::Reader).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderOptions {
    pub name: String,
    /// Nominal rate in Hz. Sources that advertise their own rate override it.
    pub sample_rate: u32,
    /// Length of the buffer window in seconds.
    pub sample_time: f32,
    /// Requested channels; a source may shrink this when it opens.
    pub n_channel: usize,
    pub backing: BufferBacking,
    pub max_transient_retries: u32,
    pub pause_poll_ms: u64,
    /// How many nominal periods `read_latest_sample` waits before reporting
    /// the sample as stale.
    pub stale_wait_periods: u32,
    pub source: SourceConfig,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            name: "reader".to_owned(),
            sample_rate: 250,
            sample_time: 2.0,
            n_channel: 1,
            backing: BufferBacking::Anonymous,
            max_transient_retries: 5,
            pause_poll_ms: 1,
            stale_wait_periods: 10,
            source: SourceConfig::default(),
        }
    }
}

impl ReaderOptions {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let options = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(options)
    }

    /// Number of columns in the buffer, `round(sample_rate * sample_time)`.
    pub fn window_size(&self) -> Result<usize, ValidationError> {
        let size = (self.sample_rate as f32 * self.sample_time).round();
        if !size.is_finite() || size < 1.0 {
            return Err(ValidationError::InvalidWindow {
                sample_rate: self.sample_rate,
                sample_time: self.sample_time,
            });
        }
        Ok(size as usize)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.n_channel == 0 || self.n_channel > MAX_CHANNELS {
            return Err(ValidationError::InvalidChannelCount {
                requested: self.n_channel,
                max: MAX_CHANNELS,
            });
        }
        self.window_size().map(|_| ())
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms.max(1))
    }
}

/// Upper bound on channels for any source.
pub const MAX_CHANNELS: usize = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Waveform {
    #[default]
    Random,
    Sine,
}

/// Which backend feeds the reader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Synthetic {
        #[serde(default)]
        waveform: Waveform,
        #[serde(default = "default_frequency")]
        frequency_hz: f32,
        #[serde(default = "default_amplitude")]
        amplitude: f32,
        #[serde(default)]
        seed: Option<u64>,
    },
    File {
        path: PathBuf,
        /// Overrides the `# sample_rate:` comment of the file.
        #[serde(default)]
        sample_rate: Option<f32>,
    },
    Tcp {
        address: String,
        #[serde(default = "default_io_timeout_ms")]
        timeout_ms: u64,
    },
    Udp {
        bind: String,
        #[serde(default)]
        peer: Option<String>,
        #[serde(default = "default_io_timeout_ms")]
        timeout_ms: u64,
    },
    Serial {
        #[serde(default)]
        port: Option<String>,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_io_timeout_ms")]
        timeout_ms: u64,
    },
    Lsl {
        /// Resolve by `prop == value`, e.g. `("name", "EEG")`. All streams otherwise.
        #[serde(default)]
        property: Option<String>,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        library: Option<PathBuf>,
        #[serde(default = "default_resolve_timeout")]
        resolve_timeout_s: f64,
        #[serde(default = "default_io_timeout_ms")]
        timeout_ms: u64,
    },
    Ads1299 {
        #[serde(default)]
        device: Option<PathBuf>,
        #[serde(default = "default_drdy_gpio")]
        drdy_gpio: u64,
        #[serde(default = "default_chip_spi_speed")]
        spi_speed_hz: u32,
        #[serde(default)]
        input_source: InputSource,
        #[serde(default)]
        bias: bool,
        #[serde(default)]
        impedance: bool,
        #[serde(default)]
        timing: DriverTiming,
    },
    Esp32Relay {
        #[serde(default)]
        device: Option<PathBuf>,
        #[serde(default = "default_drdy_gpio")]
        drdy_gpio: u64,
        #[serde(default = "default_relay_spi_speed")]
        spi_speed_hz: u32,
        #[serde(default = "default_batch")]
        n_batch: usize,
        #[serde(default)]
        input_source: InputSource,
        #[serde(default)]
        bias: bool,
        #[serde(default)]
        impedance: bool,
        #[serde(default)]
        timing: DriverTiming,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Synthetic {
            waveform: Waveform::Random,
            frequency_hz: default_frequency(),
            amplitude: default_amplitude(),
            seed: None,
        }
    }
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::Synthetic { .. } => "synthetic",
            SourceConfig::File { .. } => "file",
            SourceConfig::Tcp { .. } => "tcp",
            SourceConfig::Udp { .. } => "udp",
            SourceConfig::Serial { .. } => "serial",
            SourceConfig::Lsl { .. } => "lsl",
            SourceConfig::Ads1299 { .. } => "ads1299",
            SourceConfig::Esp32Relay { .. } => "esp32_relay",
        }
    }
}

fn default_frequency() -> f32 {
    10.0
}
fn default_amplitude() -> f32 {
    0.1
}
fn default_io_timeout_ms() -> u64 {
    100
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_resolve_timeout() -> f64 {
    2.0
}
fn default_drdy_gpio() -> u64 {
    26
}
fn default_chip_spi_speed() -> u32 {
    12_500_000
}
fn default_relay_spi_speed() -> u32 {
    20_000_000
}
fn default_batch() -> usize {
    10
}

/// Settle times of the converter. None of them are fixed by the datasheet
/// for this board, so they are configurable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverTiming {
    pub reset_settle_ms: u64,
    pub start_settle_ms: u64,
    /// Applied after bias or impedance registers change.
    pub config_settle_ms: u64,
    pub drdy_timeout_ms: u64,
}

impl Default for DriverTiming {
    fn default() -> Self {
        Self {
            reset_settle_ms: 1000,
            start_settle_ms: 1000,
            config_settle_ms: 10,
            drdy_timeout_ms: 100,
        }
    }
}

impl DriverTiming {
    /// No settling at all, short data-ready timeout.
    pub fn immediate() -> Self {
        Self {
            reset_settle_ms: 0,
            start_settle_ms: 0,
            config_settle_ms: 0,
            drdy_timeout_ms: 20,
        }
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_millis(self.start_settle_ms)
    }

    pub fn config_settle(&self) -> Duration {
        Duration::from_millis(self.config_settle_ms)
    }

    pub fn drdy_timeout(&self) -> Duration {
        Duration::from_millis(self.drdy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_size_rounds_rate_times_time() {
        let options = ReaderOptions::default();
        assert_eq!(options.window_size().unwrap(), 500);
        let odd = ReaderOptions {
            sample_rate: 333,
            sample_time: 0.5,
            ..ReaderOptions::default()
        };
        assert_eq!(odd.window_size().unwrap(), 167);
        let empty = ReaderOptions {
            sample_time: 0.0,
            ..ReaderOptions::default()
        };
        assert!(matches!(
            empty.validate(),
            Err(ValidationError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn zero_channels_is_rejected() {
        let options = ReaderOptions {
            n_channel: 0,
            ..ReaderOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ValidationError::InvalidChannelCount { requested: 0, .. })
        ));
    }

    #[test]
    fn json_fills_in_defaults() {
        let json = r#"{
            "name": "bench",
            "n_channel": 8,
            "source": { "kind": "ads1299", "input_source": "test", "timing": { "reset_settle_ms": 5 } }
        }"#;
        let options: ReaderOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.name, "bench");
        assert_eq!(options.sample_rate, 250);
        match options.source {
            SourceConfig::Ads1299 {
                input_source,
                timing,
                drdy_gpio,
                ..
            } => {
                assert_eq!(input_source, InputSource::Test);
                assert_eq!(timing.reset_settle_ms, 5);
                assert_eq!(timing.drdy_timeout_ms, 100);
                assert_eq!(drdy_gpio, 26);
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn options_load_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"{ "source": { "kind": "tcp", "address": "127.0.0.1:9000" }, "backing": { "kind": "shared", "path": null } }"#,
        )
        .unwrap();
        let options = ReaderOptions::from_json_file(file.path()).unwrap();
        assert_eq!(options.source.kind(), "tcp");
        assert_eq!(options.backing, BufferBacking::Shared { path: None });
    }
}
