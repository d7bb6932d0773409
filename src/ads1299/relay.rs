//! Converter behind a microcontroller relay.
//!
//! The relay collects `n_batch` samples and hands them over in one SPI
//! transaction. Commands cannot be sent on their own: each setter queues one
//! and the first four transmit bytes of the next batch carry it.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use super::bus::{BusClaim, DataReady, SpiBus};
use super::codec::{decode_relay_batch, relay_command};
use super::registers::{relay_reg, Gain, InputSource, SampleRate, CHANNELS, DEFAULT_SCALE};
use super::{check_channel, AdcDevice};
use crate::config::DriverTiming;
use crate::drivers::{ReaderError, Result};
use crate::pacing::{Clock, Pacer};

pub struct Esp32Relay {
    bus: Box<dyn SpiBus>,
    drdy: Box<dyn DataReady>,
    _claim: Option<BusClaim>,
    clock: Arc<dyn Clock>,
    timing: DriverTiming,
    scale: f32,
    n_batch: usize,
    commands: VecDeque<Vec<u8>>,
    pending: VecDeque<[f32; CHANNELS]>,
    pacer: Pacer,
    started: bool,
    sample_rate: SampleRate,
    input_source: InputSource,
    bias: bool,
    impedance: bool,
}

impl Esp32Relay {
    pub fn new(
        bus: Box<dyn SpiBus>,
        drdy: Box<dyn DataReady>,
        clock: Arc<dyn Clock>,
        timing: DriverTiming,
        n_batch: usize,
    ) -> Self {
        let rate = SampleRate::Sps250;
        Self {
            bus,
            drdy,
            _claim: None,
            pacer: Pacer::from_rate(clock.clone(), rate.hz() as f32),
            clock,
            timing,
            scale: DEFAULT_SCALE,
            n_batch: n_batch.max(1),
            commands: VecDeque::new(),
            pending: VecDeque::new(),
            started: false,
            sample_rate: rate,
            input_source: InputSource::Normal,
            bias: false,
            impedance: false,
        }
    }

    /// Claims `device` and opens it in SPI mode 0.
    #[cfg(target_os = "linux")]
    pub fn open(
        device: &Path,
        drdy_gpio: u64,
        spi_speed_hz: u32,
        clock: Arc<dyn Clock>,
        timing: DriverTiming,
        n_batch: usize,
    ) -> Result<Self> {
        let claim = BusClaim::acquire(device)?;
        let bus = super::bus::open_spidev(device, 0, spi_speed_hz)?;
        let drdy = super::bus::SysfsDataReady::open(drdy_gpio)?;
        info!(
            "opened relay on {} (drdy gpio{drdy_gpio}, batch {n_batch})",
            device.display()
        );
        let mut relay = Self::new(bus, Box::new(drdy), clock, timing, n_batch);
        relay._claim = Some(claim);
        Ok(relay)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(
        device: &Path,
        _drdy_gpio: u64,
        _spi_speed_hz: u32,
        _clock: Arc<dyn Clock>,
        _timing: DriverTiming,
        _n_batch: usize,
    ) -> Result<Self> {
        Err(ReaderError::unavailable(
            device.display().to_string(),
            "spidev is only available on Linux",
        ))
    }

    /// Preselects settings queued by the next [`AdcDevice::start`].
    pub fn with_settings(mut self, input_source: InputSource, bias: bool, impedance: bool) -> Self {
        self.input_source = input_source;
        self.bias = bias;
        self.impedance = impedance;
        self
    }

    /// Commands waiting for the next batch transaction.
    pub fn queued_commands(&self) -> usize {
        self.commands.len()
    }

    fn queue(&mut self, reg: u8, payload: &[u8]) -> Result<()> {
        let command = relay_command(reg, payload)?;
        debug!("relay queued command {command:02x?}");
        self.commands.push_back(command);
        Ok(())
    }

    fn fetch_batch(&mut self) -> Result<()> {
        let timeout = self.timing.drdy_timeout();
        if !self.drdy.wait_falling(timeout)? {
            return Err(ReaderError::transient(
                "relay data-ready wait",
                format!("no batch within {timeout:?}"),
            ));
        }
        let mut frame = vec![0u8; self.n_batch * CHANNELS * 4];
        if let Some(command) = self.commands.pop_front() {
            frame[..command.len()].copy_from_slice(&command);
        }
        self.bus.transfer(&mut frame)?;
        self.pending.extend(decode_relay_batch(&frame, self.scale)?);
        Ok(())
    }
}

impl AdcDevice for Esp32Relay {
    fn name(&self) -> &str {
        "esp32_relay"
    }

    fn start(&mut self, rate: SampleRate) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.set_sample_rate(rate)?;
        if self.input_source != InputSource::Normal {
            self.queue(relay_reg::INPUT_SOURCE, &[self.input_source.code()])?;
        }
        if self.bias {
            self.queue(relay_reg::BIAS, &[1])?;
        }
        if self.impedance {
            self.queue(relay_reg::IMPEDANCE, &[1])?;
        }
        self.pacer.reset();
        self.started = true;
        info!("relay streaming at {} Hz", rate.hz());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        self.pending.clear();
        self.commands.clear();
        Ok(())
    }

    fn read_sample(&mut self) -> Result<[f32; CHANNELS]> {
        if !self.started {
            return Err(ReaderError::NotStarted);
        }
        if self.pending.is_empty() {
            self.fetch_batch()?;
        }
        self.pacer.wait();
        self.pending
            .pop_front()
            .ok_or_else(|| ReaderError::protocol("relay read", "empty batch"))
    }

    fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    fn set_sample_rate(&mut self, rate: SampleRate) -> Result<()> {
        self.queue(relay_reg::SAMPLE_RATE, &[rate.code()])?;
        self.pacer = Pacer::from_rate(self.clock.clone(), rate.hz() as f32);
        self.sample_rate = rate;
        Ok(())
    }

    fn input_source(&self) -> InputSource {
        self.input_source
    }

    fn set_input_source(&mut self, source: InputSource) -> Result<()> {
        self.queue(relay_reg::INPUT_SOURCE, &[source.code()])?;
        self.input_source = source;
        Ok(())
    }

    fn bias_enabled(&self) -> bool {
        self.bias
    }

    fn set_bias(&mut self, enabled: bool) -> Result<()> {
        self.queue(relay_reg::BIAS, &[enabled as u8])?;
        self.bias = enabled;
        Ok(())
    }

    fn impedance_enabled(&self) -> bool {
        self.impedance
    }

    fn set_impedance(&mut self, enabled: bool) -> Result<()> {
        self.queue(relay_reg::IMPEDANCE, &[enabled as u8])?;
        self.impedance = enabled;
        Ok(())
    }

    fn set_channel(&mut self, channel: usize, enabled: bool) -> Result<()> {
        check_channel(channel)?;
        self.queue(relay_reg::CHANNEL, &[channel as u8, enabled as u8])
    }

    fn set_gain(&mut self, _channel: usize, _gain: Gain) -> Result<()> {
        Err(ReaderError::Unsupported {
            backend: self.name().to_owned(),
            operation: "per-channel gain",
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ads1299::emulator::EmulatedRelay;
    use crate::pacing::ManualClock;

    fn relay(n_batch: usize) -> (EmulatedRelay, Arc<ManualClock>, Esp32Relay) {
        let emu = EmulatedRelay::new();
        let clock = Arc::new(ManualClock::new());
        let driver = Esp32Relay::new(
            emu.bus(),
            emu.drdy(),
            clock.clone(),
            DriverTiming::immediate(),
            n_batch,
        );
        (emu, clock, driver)
    }

    #[test]
    fn one_transaction_per_batch_paced_at_rate() {
        let (emu, clock, mut dev) = relay(4);
        dev.start(SampleRate::Sps250).unwrap();
        let first = dev.read_sample().unwrap();
        assert_eq!(first[1], DEFAULT_SCALE);
        for _ in 0..3 {
            dev.read_sample().unwrap();
        }
        assert_eq!(emu.state().transactions, 1);
        let fifth = dev.read_sample().unwrap();
        assert_eq!(fifth[0], 32.0 * DEFAULT_SCALE);
        assert_eq!(emu.state().transactions, 2);
        assert_eq!(clock.elapsed(), Duration::from_millis(16));
    }

    #[test]
    fn commands_ride_on_following_batches_in_order() {
        let (emu, _clock, mut dev) = relay(2);
        dev.start(SampleRate::Sps500).unwrap();
        dev.set_input_source(InputSource::Test).unwrap();
        dev.set_channel(3, false).unwrap();
        assert_eq!(dev.queued_commands(), 3);
        // nothing is sent until data is fetched
        assert!(emu.state().commands.is_empty());
        for _ in 0..6 {
            dev.read_sample().unwrap();
        }
        assert_eq!(dev.queued_commands(), 0);
        assert_eq!(
            emu.state().commands,
            vec![
                vec![0x40, relay_reg::SAMPLE_RATE, 0b101],
                vec![0x40, relay_reg::INPUT_SOURCE, 0b101],
                vec![0x40, relay_reg::CHANNEL, 3, 0],
            ]
        );
    }

    #[test]
    fn gain_is_unsupported_and_channels_are_validated() {
        let (_emu, _clock, mut dev) = relay(1);
        assert!(matches!(
            dev.set_gain(0, Gain::X1),
            Err(ReaderError::Unsupported { .. })
        ));
        assert!(matches!(
            dev.set_channel(9, true),
            Err(ReaderError::Validation(_))
        ));
    }

    #[test]
    fn missing_batch_is_transient() {
        let (emu, _clock, mut dev) = relay(1);
        dev.start(SampleRate::Sps250).unwrap();
        emu.state().data_ready = false;
        assert!(dev.read_sample().unwrap_err().is_transient());
    }
}
