// src/ads1299/mod.rs
//! Register-level driver for the ADS1299 biopotential ADC, wired either
//! directly to the host SPI bus or behind a microcontroller relay.
pub mod bus;
pub mod codec;
pub mod direct;
pub mod registers;
pub mod relay;

#[cfg(test)]
pub(crate) mod emulator;

pub use bus::{BusClaim, DataReady, SpiBus};
pub use direct::Ads1299;
pub use registers::{voltage_to_celsius, Gain, InputSource, SampleRate, CHANNELS};
pub use relay::Esp32Relay;

use crate::drivers::Result;

/// Operations shared by both wiring variants.
///
/// Every setter is a fallible hardware round-trip. Settings changed while
/// streaming may not apply to the next one or two samples.
pub trait AdcDevice: Send {
    fn name(&self) -> &str;
    fn start(&mut self, rate: SampleRate) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn read_sample(&mut self) -> Result<[f32; CHANNELS]>;

    fn sample_rate(&self) -> SampleRate;
    fn set_sample_rate(&mut self, rate: SampleRate) -> Result<()>;
    fn input_source(&self) -> InputSource;
    fn set_input_source(&mut self, source: InputSource) -> Result<()>;
    fn bias_enabled(&self) -> bool;
    fn set_bias(&mut self, enabled: bool) -> Result<()>;
    fn impedance_enabled(&self) -> bool;
    fn set_impedance(&mut self, enabled: bool) -> Result<()>;
    fn set_channel(&mut self, channel: usize, enabled: bool) -> Result<()>;
    fn set_gain(&mut self, channel: usize, gain: Gain) -> Result<()>;
}

pub(crate) fn check_channel(channel: usize) -> Result<()> {
    if channel >= CHANNELS {
        return Err(crate::drivers::ValidationError::InvalidChannel {
            channel,
            available: CHANNELS,
        }
        .into());
    }
    Ok(())
}
