use std::sync::Arc;

use log::warn;

use crate::ads1299::{AdcDevice, SampleRate, CHANNELS};
use crate::drivers::source::negotiate_channels;
use crate::drivers::{
    Acquired, DeviceHandle, Result, Sample, SampleSource, StreamFormat, StreamRequest,
};
use crate::pacing::Clock;

/// Streams from an ADC driver and hands out its control handle.
pub struct DeviceSource {
    handle: DeviceHandle,
    name: String,
    n_channel: usize,
}

impl DeviceSource {
    pub fn new(device: Box<dyn AdcDevice>, clock: Arc<dyn Clock>) -> Self {
        let name = device.name().to_owned();
        Self {
            handle: DeviceHandle::new(device, clock),
            name,
            n_channel: CHANNELS,
        }
    }
}

impl SampleSource for DeviceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, request: &StreamRequest) -> Result<StreamFormat> {
        let rate = SampleRate::try_from(request.sample_rate.round() as u32)?;
        self.handle.control(|device| device.start(rate))?;
        self.n_channel = negotiate_channels(&self.name, request, CHANNELS)?;
        Ok(StreamFormat {
            n_channel: self.n_channel,
            sample_rate: rate.hz() as f32,
            label: self.name.clone(),
        })
    }

    fn produce(&mut self) -> Result<Acquired> {
        let values = self.handle.stream(|device| device.read_sample())?;
        Ok(Acquired::Sample(Sample::new(values[..self.n_channel].to_vec())))
    }

    fn close(&mut self) {
        if let Err(e) = self.handle.control(|device| device.stop()) {
            warn!("{}: stop failed: {e}", self.name);
        }
    }

    fn control(&self) -> Option<DeviceHandle> {
        Some(self.handle.clone())
    }
}
