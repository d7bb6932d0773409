// src/sources/mod.rs
//! One [`SampleSource`] per data origin, plus the factory that picks one from
//! a [`SourceConfig`].
pub mod device;
pub mod lsl;
pub mod replay;
pub mod serial;
pub mod socket;
pub mod synthetic;

use std::sync::Arc;

use crate::ads1299::{bus, Ads1299, Esp32Relay};
use crate::config::SourceConfig;
use crate::drivers::{Result, SampleSource};
use crate::pacing::Clock;

pub use device::DeviceSource;
pub use lsl::LslSource;
pub use replay::ReplaySource;
pub use serial::SerialSource;
pub use socket::{TcpSource, UdpSource};
pub use synthetic::SyntheticSource;

/// Builds the source described by `config`. Nothing is opened yet, except
/// for ADC drivers which claim their bus here so a second reader on the same
/// device fails before it spawns anything.
pub fn build_source(config: &SourceConfig, clock: Arc<dyn Clock>) -> Result<Box<dyn SampleSource>> {
    let source: Box<dyn SampleSource> = match config {
        SourceConfig::Synthetic {
            waveform,
            frequency_hz,
            amplitude,
            seed,
        } => Box::new(SyntheticSource::new(
            *waveform,
            *frequency_hz,
            *amplitude,
            *seed,
            clock,
        )),
        SourceConfig::File { path, sample_rate } => {
            Box::new(ReplaySource::new(path.clone(), *sample_rate, clock))
        }
        SourceConfig::Tcp {
            address,
            timeout_ms,
        } => Box::new(TcpSource::new(address.clone(), *timeout_ms)),
        SourceConfig::Udp {
            bind,
            peer,
            timeout_ms,
        } => Box::new(UdpSource::new(bind.clone(), peer.clone(), *timeout_ms)),
        SourceConfig::Serial {
            port,
            baud_rate,
            timeout_ms,
        } => Box::new(SerialSource::new(port.clone(), *baud_rate, *timeout_ms, clock)),
        SourceConfig::Lsl {
            property,
            value,
            library,
            resolve_timeout_s,
            timeout_ms,
        } => Box::new(LslSource::new(
            property.clone().zip(value.clone()),
            library.clone(),
            *resolve_timeout_s,
            *timeout_ms,
        )),
        SourceConfig::Ads1299 {
            device,
            drdy_gpio,
            spi_speed_hz,
            input_source,
            bias,
            impedance,
            timing,
        } => {
            let path = match device {
                Some(path) => path.clone(),
                None => bus::find_spi_device()?,
            };
            let chip = Ads1299::open(&path, *drdy_gpio, *spi_speed_hz, clock.clone(), *timing)?
                .with_settings(*input_source, *bias, *impedance);
            Box::new(DeviceSource::new(Box::new(chip), clock))
        }
        SourceConfig::Esp32Relay {
            device,
            drdy_gpio,
            spi_speed_hz,
            n_batch,
            input_source,
            bias,
            impedance,
            timing,
        } => {
            let path = match device {
                Some(path) => path.clone(),
                None => bus::find_spi_device()?,
            };
            let relay =
                Esp32Relay::open(&path, *drdy_gpio, *spi_speed_hz, clock.clone(), *timing, *n_batch)?
                    .with_settings(*input_source, *bias, *impedance);
            Box::new(DeviceSource::new(Box::new(relay), clock))
        }
    };
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::system_clock;

    #[test]
    fn factory_builds_unopened_sources() {
        let source = build_source(&SourceConfig::default(), system_clock()).unwrap();
        assert_eq!(source.name(), "synthetic");
        let tcp = SourceConfig::Tcp {
            address: "127.0.0.1:1".to_owned(),
            timeout_ms: 10,
        };
        assert_eq!(build_source(&tcp, system_clock()).unwrap().name(), "tcp");
    }
}
