//! Converter wired straight to the host SPI bus.
//!
//! The chip streams in RDATAC mode once started. Any register access has to
//! be wrapped in `SDATAC` / `RDATAC`, otherwise the register file is corrupted;
//! [`Ads1299::with_continuous_stopped`] does that exactly once per setting.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use super::bus::{BusClaim, DataReady, SpiBus};
use super::codec::{decode_frame, read_registers_frame, write_registers_frame};
use super::registers::*;
use super::{check_channel, AdcDevice};
use crate::config::DriverTiming;
use crate::drivers::{ReaderError, Result};
use crate::pacing::Clock;

pub struct Ads1299 {
    bus: Box<dyn SpiBus>,
    drdy: Box<dyn DataReady>,
    _claim: Option<BusClaim>,
    clock: Arc<dyn Clock>,
    timing: DriverTiming,
    scale: f32,
    started: bool,
    continuous: bool,
    sample_rate: SampleRate,
    input_source: InputSource,
    bias: bool,
    impedance: bool,
}

impl Ads1299 {
    pub fn new(
        bus: Box<dyn SpiBus>,
        drdy: Box<dyn DataReady>,
        clock: Arc<dyn Clock>,
        timing: DriverTiming,
    ) -> Self {
        Self {
            bus,
            drdy,
            _claim: None,
            clock,
            timing,
            scale: DEFAULT_SCALE,
            started: false,
            continuous: false,
            sample_rate: SampleRate::Sps250,
            input_source: InputSource::Normal,
            bias: false,
            impedance: false,
        }
    }

    /// Claims `device`, opens it in SPI mode 2 and exports the data-ready GPIO.
    #[cfg(target_os = "linux")]
    pub fn open(
        device: &Path,
        drdy_gpio: u64,
        spi_speed_hz: u32,
        clock: Arc<dyn Clock>,
        timing: DriverTiming,
    ) -> Result<Self> {
        let claim = BusClaim::acquire(device)?;
        let bus = super::bus::open_spidev(device, 2, spi_speed_hz)?;
        let drdy = super::bus::SysfsDataReady::open(drdy_gpio)?;
        info!("opened ADS1299 on {} (drdy gpio{drdy_gpio})", device.display());
        let mut chip = Self::new(bus, Box::new(drdy), clock, timing);
        chip._claim = Some(claim);
        Ok(chip)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(
        device: &Path,
        _drdy_gpio: u64,
        _spi_speed_hz: u32,
        _clock: Arc<dyn Clock>,
        _timing: DriverTiming,
    ) -> Result<Self> {
        Err(ReaderError::unavailable(
            device.display().to_string(),
            "spidev is only available on Linux",
        ))
    }

    /// Preselects settings applied by the next [`AdcDevice::start`].
    pub fn with_settings(mut self, input_source: InputSource, bias: bool, impedance: bool) -> Self {
        self.input_source = input_source;
        self.bias = bias;
        self.impedance = impedance;
        self
    }

    fn command(&mut self, opcode: u8) -> Result<()> {
        self.bus.transfer(&mut [opcode])
    }

    fn write_regs(&mut self, reg: u8, values: &[u8]) -> Result<()> {
        let mut frame = write_registers_frame(reg, values);
        self.bus.transfer(&mut frame)
    }

    fn read_regs(&mut self, reg: u8, count: usize) -> Result<Vec<u8>> {
        let mut frame = read_registers_frame(reg, count);
        self.bus.transfer(&mut frame)?;
        Ok(frame.split_off(2))
    }

    /// Burst read of `count` registers starting at `reg`.
    pub fn read_registers(&mut self, reg: u8, count: usize) -> Result<Vec<u8>> {
        self.with_continuous_stopped(|chip| chip.read_regs(reg, count))
    }

    pub fn write_registers(&mut self, reg: u8, values: &[u8]) -> Result<()> {
        self.with_continuous_stopped(|chip| chip.write_regs(reg, values))
    }

    fn with_continuous_stopped<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if !self.continuous {
            return op(self);
        }
        self.command(cmd::SDATAC)?;
        self.continuous = false;
        let result = op(self);
        // resume even when the operation failed, the stream must not stall
        self.command(cmd::RDATAC)?;
        self.continuous = true;
        result
    }

    fn settle(&self, duration: std::time::Duration) {
        if !duration.is_zero() {
            self.clock.sleep(duration);
        }
    }

    fn channel_setting(&self) -> u8 {
        let base = if self.impedance {
            CHNSET_DEFAULT & !GAIN_MASK
        } else {
            CHNSET_DEFAULT
        };
        (base & !MUX_MASK) | self.input_source.code()
    }

    fn power_up(&mut self, rate: SampleRate) -> Result<()> {
        self.command(cmd::RESET)?;
        self.settle(self.timing.reset_settle());
        self.command(cmd::SDATAC)?;
        self.continuous = false;

        let id = self.read_regs(reg::ID, 1)?[0];
        if id & DEVICE_ID_MASK != DEVICE_ID {
            return Err(ReaderError::protocol(
                "verify device id",
                format!("unexpected id register {id:#04x}"),
            ));
        }

        let config1 = CONFIG1_BASE | rate.code();
        self.write_regs(reg::CONFIG1, &[config1])?;
        let readback = self.read_regs(reg::CONFIG1, 1)?[0];
        if readback != config1 {
            return Err(ReaderError::protocol(
                "configure sample rate",
                format!("CONFIG1 reads {readback:#04x}, wrote {config1:#04x}"),
            ));
        }
        self.write_regs(reg::CONFIG2, &[CONFIG2_DEFAULT])?;
        let config3 = if self.bias { CONFIG3_BIAS } else { CONFIG3_DEFAULT };
        self.write_regs(reg::CONFIG3, &[config3])?;
        self.write_regs(reg::MISC1, &[MISC1_SRB1])?;
        let chnset = self.channel_setting();
        self.write_regs(reg::CH1SET, &[chnset; CHANNELS])?;
        if self.bias {
            self.write_regs(reg::BIAS_SENSP, &[0xFF, 0xFF])?;
        }
        if self.impedance {
            self.write_regs(reg::LOFF_SENSP, &[0xFF])?;
        }

        self.command(cmd::START)?;
        self.settle(self.timing.start_settle());
        self.command(cmd::RDATAC)?;
        self.continuous = true;
        Ok(())
    }

    fn update_channel(&mut self, channel: usize, f: impl FnOnce(u8) -> u8) -> Result<()> {
        check_channel(channel)?;
        let addr = reg::CH1SET + channel as u8;
        self.with_continuous_stopped(|chip| {
            let current = chip.read_regs(addr, 1)?[0];
            chip.write_regs(addr, &[f(current)])
        })
    }
}

impl AdcDevice for Ads1299 {
    fn name(&self) -> &str {
        "ads1299"
    }

    fn start(&mut self, rate: SampleRate) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.power_up(rate)?;
        self.sample_rate = rate;
        self.started = true;
        info!(
            "ads1299 streaming at {} Hz, input {}",
            rate.hz(),
            self.input_source
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.started = false;
        self.continuous = false;
        self.command(cmd::SDATAC)?;
        self.command(cmd::STOP)?;
        debug!("ads1299 stopped");
        Ok(())
    }

    fn read_sample(&mut self) -> Result<[f32; CHANNELS]> {
        if !self.started {
            return Err(ReaderError::NotStarted);
        }
        let timeout = self.timing.drdy_timeout();
        if !self.drdy.wait_falling(timeout)? {
            return Err(ReaderError::transient(
                "data-ready wait",
                format!("no conversion within {timeout:?}"),
            ));
        }
        let mut frame = [0u8; FRAME_LEN];
        self.bus.transfer(&mut frame)?;
        decode_frame(&frame, self.scale)
    }

    fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    fn set_sample_rate(&mut self, rate: SampleRate) -> Result<()> {
        if self.started {
            self.with_continuous_stopped(|chip| {
                let config1 = chip.read_regs(reg::CONFIG1, 1)?[0];
                chip.write_regs(reg::CONFIG1, &[(config1 & !RATE_MASK) | rate.code()])
            })?;
        }
        self.sample_rate = rate;
        Ok(())
    }

    fn input_source(&self) -> InputSource {
        self.input_source
    }

    fn set_input_source(&mut self, source: InputSource) -> Result<()> {
        if self.started {
            self.with_continuous_stopped(|chip| {
                let settings = chip.read_regs(reg::CH1SET, CHANNELS)?;
                let updated: Vec<u8> = settings
                    .iter()
                    .map(|v| (v & !MUX_MASK) | source.code())
                    .collect();
                chip.write_regs(reg::CH1SET, &updated)
            })?;
        }
        self.input_source = source;
        debug!("ads1299 input source set to {source}");
        Ok(())
    }

    fn bias_enabled(&self) -> bool {
        self.bias
    }

    fn set_bias(&mut self, enabled: bool) -> Result<()> {
        if self.started {
            let (sense, config3) = if enabled {
                (0xFF, CONFIG3_BIAS)
            } else {
                (0x00, CONFIG3_DEFAULT)
            };
            self.with_continuous_stopped(|chip| {
                chip.write_regs(reg::BIAS_SENSP, &[sense, sense])?;
                chip.write_regs(reg::CONFIG3, &[config3])
            })?;
            self.settle(self.timing.config_settle());
        }
        self.bias = enabled;
        Ok(())
    }

    fn impedance_enabled(&self) -> bool {
        self.impedance
    }

    fn set_impedance(&mut self, enabled: bool) -> Result<()> {
        if self.started {
            self.with_continuous_stopped(|chip| {
                chip.write_regs(reg::LOFF_SENSP, &[if enabled { 0xFF } else { 0x00 }])?;
                let settings = chip.read_regs(reg::CH1SET, CHANNELS)?;
                let gain_bits = if enabled { 0 } else { Gain::X24.code() << 4 };
                let updated: Vec<u8> = settings
                    .iter()
                    .map(|v| (v & !GAIN_MASK) | gain_bits)
                    .collect();
                chip.write_regs(reg::CH1SET, &updated)
            })?;
            self.settle(self.timing.config_settle());
        }
        self.impedance = enabled;
        Ok(())
    }

    fn set_channel(&mut self, channel: usize, enabled: bool) -> Result<()> {
        self.update_channel(channel, |v| {
            if enabled {
                v & !POWER_DOWN
            } else {
                v | POWER_DOWN
            }
        })
    }

    fn set_gain(&mut self, channel: usize, gain: Gain) -> Result<()> {
        self.update_channel(channel, |v| (v & !GAIN_MASK) | (gain.code() << 4))
    }
}

impl Drop for Ads1299 {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("failed to stop ads1299: {e}");
        }
    }
}
