//! Serial-bus and data-ready seams used by the ADC drivers.
//!
//! The drivers only see [`SpiBus`] and [`DataReady`]; on Linux they are
//! backed by `spidev` and a sysfs GPIO line with edge polling, and tests use
//! an emulated chip instead.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use once_cell::sync::Lazy;

use crate::drivers::{ReaderError, Result};

/// Full-duplex SPI transfer: `buf` is shifted out and replaced by what was
/// shifted in.
pub trait SpiBus: Send {
    fn transfer(&mut self, buf: &mut [u8]) -> Result<()>;
}

/// The data-ready line of the converter.
pub trait DataReady: Send {
    /// Blocks until the next falling edge or until `timeout` elapses.
    /// Returns `false` on timeout.
    fn wait_falling(&mut self, timeout: Duration) -> Result<bool>;
}

static CLAIMED: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive ownership of a bus device path within this process.
///
/// Released on drop.
#[derive(Debug)]
pub struct BusClaim {
    device: PathBuf,
}

impl BusClaim {
    pub fn acquire(device: impl AsRef<Path>) -> Result<Self> {
        let device = device.as_ref().to_path_buf();
        let mut claimed = CLAIMED.lock().unwrap_or_else(|e| e.into_inner());
        if !claimed.insert(device.clone()) {
            return Err(ReaderError::BusInUse {
                device: device.display().to_string(),
            });
        }
        debug!("claimed bus device {}", device.display());
        Ok(Self { device })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }
}

impl Drop for BusClaim {
    fn drop(&mut self) {
        let mut claimed = CLAIMED.lock().unwrap_or_else(|e| e.into_inner());
        claimed.remove(&self.device);
        debug!("released bus device {}", self.device.display());
    }
}

/// Picks the first `/dev/spidevB.C` node when no device was configured.
pub fn find_spi_device() -> Result<PathBuf> {
    let entries = std::fs::read_dir("/dev")
        .map_err(|e| ReaderError::unavailable("spi", format!("cannot list /dev: {e}")))?;
    let mut devices: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("spidev"))
        })
        .collect();
    devices.sort();
    devices
        .into_iter()
        .next()
        .ok_or_else(|| ReaderError::unavailable("spi", "no /dev/spidev* device found"))
}

#[cfg(target_os = "linux")]
pub use linux::{open_spidev, SysfsDataReady};

#[cfg(target_os = "linux")]
mod linux {
    use std::path::Path;
    use std::time::Duration;

    use log::{info, warn};
    use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
    use sysfs_gpio::{Direction, Edge, Pin, PinPoller};

    use super::{DataReady, SpiBus};
    use crate::ads1299::registers::nearest_spi_speed;
    use crate::drivers::{ReaderError, Result};

    struct SpidevBus {
        dev: Spidev,
    }

    impl SpiBus for SpidevBus {
        fn transfer(&mut self, buf: &mut [u8]) -> Result<()> {
            let tx = buf.to_vec();
            let mut transfer = SpidevTransfer::read_write(&tx, buf);
            self.dev
                .transfer(&mut transfer)
                .map_err(|e| ReaderError::protocol("spi transfer", e))
        }
    }

    /// Opens `/dev/spidevB.C` with the given SPI mode (0..=3).
    pub fn open_spidev(path: &Path, mode: u8, max_speed_hz: u32) -> Result<Box<dyn SpiBus>> {
        let mut dev = Spidev::open(path)
            .map_err(|e| ReaderError::unavailable(path.display().to_string(), e))?;
        let speed = nearest_spi_speed(max_speed_hz);
        if speed != max_speed_hz {
            info!("spi clock for {} snapped to {speed} Hz", path.display());
        }
        let flags = match mode {
            0 => SpiModeFlags::SPI_MODE_0,
            1 => SpiModeFlags::SPI_MODE_1,
            2 => SpiModeFlags::SPI_MODE_2,
            _ => SpiModeFlags::SPI_MODE_3,
        };
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(speed)
            .mode(flags)
            .build();
        dev.configure(&options)
            .map_err(|e| ReaderError::unavailable(path.display().to_string(), e))?;
        Ok(Box::new(SpidevBus { dev }))
    }

    /// Falling-edge interrupt on a sysfs-exported GPIO.
    pub struct SysfsDataReady {
        gpio: u64,
        pin: Pin,
        poller: PinPoller,
    }

    impl SysfsDataReady {
        pub fn open(gpio: u64) -> Result<Self> {
            let backend = format!("gpio{gpio}");
            let pin = Pin::new(gpio);
            pin.export()
                .map_err(|e| ReaderError::unavailable(backend.clone(), e))?;
            pin.set_direction(Direction::In)
                .map_err(|e| ReaderError::unavailable(backend.clone(), e))?;
            // the value file must be read once before it can be polled
            pin.get_value()
                .map_err(|e| ReaderError::unavailable(backend.clone(), e))?;
            pin.set_edge(Edge::FallingEdge)
                .map_err(|e| ReaderError::unavailable(backend.clone(), e))?;
            let poller = pin
                .get_poller()
                .map_err(|e| ReaderError::unavailable(backend, e))?;
            Ok(Self { gpio, pin, poller })
        }
    }

    impl DataReady for SysfsDataReady {
        fn wait_falling(&mut self, timeout: Duration) -> Result<bool> {
            let timeout_ms = timeout.as_millis().min(isize::MAX as u128) as isize;
            match self.poller.poll(timeout_ms) {
                Ok(Some(_)) => Ok(true),
                Ok(None) => Ok(false),
                Err(e) => Err(ReaderError::transient("data-ready wait", e)),
            }
        }
    }

    impl Drop for SysfsDataReady {
        fn drop(&mut self) {
            if let Err(e) = self.pin.unexport() {
                warn!("failed to unexport gpio{}: {e}", self.gpio);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_on_same_device_fails_fast() {
        let first = BusClaim::acquire("/dev/spidev-test9.9").unwrap();
        assert!(matches!(
            BusClaim::acquire("/dev/spidev-test9.9"),
            Err(ReaderError::BusInUse { .. })
        ));
        drop(first);
        assert!(BusClaim::acquire("/dev/spidev-test9.9").is_ok());
    }
}
