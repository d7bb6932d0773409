//! ADS1299 register map, opcodes and setting encodings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::drivers::ValidationError;

/// Register addresses
#[allow(dead_code)]
pub mod reg {
    pub const ID: u8 = 0x00;
    pub const CONFIG1: u8 = 0x01;
    pub const CONFIG2: u8 = 0x02;
    pub const CONFIG3: u8 = 0x03;
    pub const LOFF: u8 = 0x04;
    pub const CH1SET: u8 = 0x05;
    pub const BIAS_SENSP: u8 = 0x0D;
    pub const BIAS_SENSN: u8 = 0x0E;
    pub const LOFF_SENSP: u8 = 0x0F;
    pub const LOFF_SENSN: u8 = 0x10;
    pub const MISC1: u8 = 0x15;
    pub const CONFIG4: u8 = 0x17;
    pub const COUNT: usize = 0x18;
}

/// SPI opcodes
#[allow(dead_code)]
pub mod cmd {
    pub const WAKEUP: u8 = 0x02;
    pub const STANDBY: u8 = 0x04;
    pub const RESET: u8 = 0x06;
    pub const START: u8 = 0x08;
    pub const STOP: u8 = 0x0A;
    pub const RDATAC: u8 = 0x10;
    pub const SDATAC: u8 = 0x11;
    pub const RDATA: u8 = 0x12;
    pub const RREG: u8 = 0x20;
    pub const WREG: u8 = 0x40;
}

/// Virtual registers understood by the relay firmware.
pub mod relay_reg {
    pub const SAMPLE_RATE: u8 = 0x50;
    pub const INPUT_SOURCE: u8 = 0x52;
    pub const BIAS: u8 = 0x54;
    pub const IMPEDANCE: u8 = 0x56;
    pub const CHANNEL: u8 = 0x58;
}

pub const CHANNELS: usize = 8;
/// Status word (3 bytes) followed by 3 bytes per channel.
pub const FRAME_LEN: usize = 3 + 3 * CHANNELS;
pub const STATUS_MARKER: u8 = 0b1100_0000;
/// Device and channel-count bits of the ID register (ADS1299, 8 channels).
pub const DEVICE_ID_MASK: u8 = 0b0001_1111;
pub const DEVICE_ID: u8 = 0b0001_1110;

pub const CONFIG1_BASE: u8 = 0b1001_0000;
pub const CONFIG2_DEFAULT: u8 = 0b1101_0000;
pub const CONFIG3_DEFAULT: u8 = 0b1110_0000;
pub const CONFIG3_BIAS: u8 = 0b1110_1100;
pub const MISC1_SRB1: u8 = 0b0010_0000;
pub const CHNSET_DEFAULT: u8 = 0b0110_0000;

pub const RATE_MASK: u8 = 0b0000_0111;
pub const MUX_MASK: u8 = 0b0000_0111;
pub const GAIN_MASK: u8 = 0b0111_0000;
pub const POWER_DOWN: u8 = 0b1000_0000;

/// Volts per LSB: 4.5 V reference, gain 24, 24-bit code.
pub const DEFAULT_SCALE: f32 = 4.5 / 24.0 / 16_777_216.0;

/// Bus clocks the board's SPI controller can produce (100 MHz / n).
pub const SUPPORTED_SPI_SPEEDS: [u32; 24] = [
    100_000_000, 50_000_000, 33_330_000, 25_000_000, 20_000_000, 12_500_000, 11_110_000,
    10_000_000, 5_000_000, 4_000_000, 3_333_000, 2_500_000, 2_000_000, 1_250_000, 1_111_000,
    1_000_000, 800_000, 500_000, 400_000, 333_000, 250_000, 200_000, 125_000, 100_000,
];

pub fn nearest_spi_speed(requested_hz: u32) -> u32 {
    SUPPORTED_SPI_SPEEDS
        .iter()
        .copied()
        .min_by_key(|speed| speed.abs_diff(requested_hz))
        .unwrap_or(requested_hz)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SampleRate {
    Sps250,
    Sps500,
    Sps1000,
    Sps2000,
    Sps4000,
    Sps8000,
    Sps16000,
}

impl SampleRate {
    pub const fn hz(self) -> u32 {
        match self {
            Self::Sps250 => 250,
            Self::Sps500 => 500,
            Self::Sps1000 => 1000,
            Self::Sps2000 => 2000,
            Self::Sps4000 => 4000,
            Self::Sps8000 => 8000,
            Self::Sps16000 => 16000,
        }
    }

    /// Data-rate bits of CONFIG1.
    pub const fn code(self) -> u8 {
        match self {
            Self::Sps250 => 0b110,
            Self::Sps500 => 0b101,
            Self::Sps1000 => 0b100,
            Self::Sps2000 => 0b011,
            Self::Sps4000 => 0b010,
            Self::Sps8000 => 0b001,
            Self::Sps16000 => 0b000,
        }
    }
}

impl TryFrom<u32> for SampleRate {
    type Error = ValidationError;

    fn try_from(hz: u32) -> Result<Self, Self::Error> {
        Ok(match hz {
            250 => Self::Sps250,
            500 => Self::Sps500,
            1000 => Self::Sps1000,
            2000 => Self::Sps2000,
            4000 => Self::Sps4000,
            8000 => Self::Sps8000,
            16000 => Self::Sps16000,
            other => return Err(ValidationError::UnsupportedSampleRate(other)),
        })
    }
}

/// Channel input multiplexer setting (CHnSET bits 2:0).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    #[default]
    Normal,
    Shorted,
    #[serde(alias = "supply")]
    Mvdd,
    #[serde(alias = "temperature")]
    Temper,
    Test,
}

impl InputSource {
    pub const fn code(self) -> u8 {
        match self {
            Self::Normal => 0b000,
            Self::Shorted => 0b001,
            Self::Mvdd => 0b011,
            Self::Temper => 0b100,
            Self::Test => 0b101,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Shorted => "shorted",
            Self::Mvdd => "mvdd",
            Self::Temper => "temper",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InputSource {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Self::Normal,
            "shorted" => Self::Shorted,
            "mvdd" | "supply" => Self::Mvdd,
            "temper" | "temperature" => Self::Temper,
            "test" => Self::Test,
            _ => return Err(ValidationError::UnsupportedInputSource(s.to_owned())),
        })
    }
}

/// Programmable gain (CHnSET bits 6:4).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Gain {
    X1,
    X2,
    X4,
    X6,
    X8,
    X12,
    X24,
}

impl Gain {
    pub const fn code(self) -> u8 {
        match self {
            Self::X1 => 0b000,
            Self::X2 => 0b001,
            Self::X4 => 0b010,
            Self::X6 => 0b011,
            Self::X8 => 0b100,
            Self::X12 => 0b101,
            Self::X24 => 0b110,
        }
    }

    pub const fn multiplier(self) -> u8 {
        match self {
            Self::X1 => 1,
            Self::X2 => 2,
            Self::X4 => 4,
            Self::X6 => 6,
            Self::X8 => 8,
            Self::X12 => 12,
            Self::X24 => 24,
        }
    }
}

/// Converts a reading taken with the `temper` input source to degrees Celsius.
pub fn voltage_to_celsius(volts: f32) -> f32 {
    (volts * 1.0e6 - 145_300.0) / 490.0 + 25.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_rates_map_to_config1_codes() {
        assert_eq!(SampleRate::try_from(250).unwrap().code(), 0b110);
        assert_eq!(SampleRate::try_from(1000).unwrap().code(), 0b100);
        assert_eq!(SampleRate::try_from(16000).unwrap().code(), 0b000);
        assert_eq!(
            SampleRate::try_from(300),
            Err(ValidationError::UnsupportedSampleRate(300))
        );
    }

    #[test]
    fn input_sources_parse_with_aliases() {
        assert_eq!("test".parse::<InputSource>().unwrap().code(), 0b101);
        assert_eq!("Supply".parse::<InputSource>().unwrap(), InputSource::Mvdd);
        assert_eq!(
            "temperature".parse::<InputSource>().unwrap(),
            InputSource::Temper
        );
        assert!(matches!(
            "bogus".parse::<InputSource>(),
            Err(ValidationError::UnsupportedInputSource(_))
        ));
    }

    #[test]
    fn spi_speed_snaps_to_divider_table() {
        assert_eq!(nearest_spi_speed(12_500_000), 12_500_000);
        assert_eq!(nearest_spi_speed(12_000_000), 12_500_000);
        assert_eq!(nearest_spi_speed(950_000), 1_000_000);
    }

    #[test]
    fn temperature_conversion_matches_datasheet_point() {
        assert!((voltage_to_celsius(0.1453) - 25.0).abs() < 1e-3);
    }
}
