use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use crate::ads1299::AdcDevice;
use crate::drivers::{ReaderError, Result};
use crate::pacing::Clock;
const CONTROL_BACKOFF: Duration = Duration::from_micros(50);
/// Shared access to a device so control calls can reach it while the
/// producer thread streams from it. Control calls announce themselves before
/// locking and the producer backs off until they are done, so a setting is
/// applied between two samples.
#[derive(Clone)]
pub struct DeviceHandle {
    device: Arc<Mutex<Box<dyn AdcDevice>>>,
    waiting: Arc<AtomicUsize>,
    clock: Arc<dyn Clock>,
}
impl DeviceHandle {
    pub fn new(device: Box<dyn AdcDevice>, clock: Arc<dyn Clock>) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            waiting: Arc::new(AtomicUsize::new(0)),
            clock,
        }
    }
    pub fn control<T>(&self, op: impl FnOnce(&mut dyn AdcDevice) -> Result<T>) -> Result<T> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let result = {
            let mut device = self.device.lock().unwrap_or_else(|e| e.into_inner());
            op(&mut **device)
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        result
    }
    /// Producer side of [`DeviceHandle::control`].
    pub fn stream<T>(&self, op: impl FnOnce(&mut dyn AdcDevice) -> Result<T>) -> Result<T> {
        while self.waiting.load(Ordering::SeqCst) > 0 {
            self.clock.sleep(CONTROL_BACKOFF);
        }
        let mut device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        op(&mut **device)
    }
}
/// What the reader asks a source for when it opens.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRequest {
    pub n_channel: usize,
    pub sample_rate: f32,
}
/// What a source actually delivers. `n_channel` may be lower than requested,
/// never higher.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamFormat {
    pub n_channel: usize,
    pub sample_rate: f32,
    /// Human readable origin, e.g. `tcp 127.0.0.1:9000`.
    pub label: String,
}
/// One column of channel values. Sources that carry their own clock set
/// `timestamp` in seconds; otherwise the reader stamps elapsed time.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub values: Vec<f32>,
    pub timestamp: Option<f32>,
}
impl Sample {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            timestamp: None,
        }
    }
    pub fn at(values: Vec<f32>, timestamp: f32) -> Self {
        Self {
            values,
            timestamp: Some(timestamp),
        }
    }
}
#[derive(Clone, Debug, PartialEq)]
pub enum Acquired {
    Sample(Sample),
    /// Nothing usable this round, try again.
    Skip,
    /// The source ran out; the stream ends without error.
    Exhausted,
}
/// A data origin driven by the reader's producer loop:
/// `open`, then `produce` until exhausted or closed, then `close`.
pub trait SampleSource: Send {
    fn name(&self) -> &str;
    fn open(&mut self, request: &StreamRequest) -> Result<StreamFormat>;
    /// Blocks for at most about one sample period or the source's own
    /// timeout, so the producer notices a close promptly.
    fn produce(&mut self) -> Result<Acquired>;
    fn close(&mut self) {}
    /// Device control, for sources backed by an ADC.
    fn control(&self) -> Option<DeviceHandle> {
        None
    }
}
/// In-memory source useful for tests and deterministic playback.
pub struct ManualSource {
    format: Option<StreamFormat>,
    queue: VecDeque<Result<Acquired>>,
}
impl ManualSource {
    pub fn new(samples: impl IntoIterator<Item = Sample>) -> Self {
        Self::scripted(samples.into_iter().map(|s| Ok(Acquired::Sample(s))))
    }
    /// Replays `script` step by step, errors included.
    pub fn scripted(script: impl IntoIterator<Item = Result<Acquired>>) -> Self {
        Self {
            format: None,
            queue: script.into_iter().collect(),
        }
    }
    /// Advertises `n_channel` instead of echoing the request.
    pub fn with_format(mut self, n_channel: usize, sample_rate: f32) -> Self {
        self.format = Some(StreamFormat {
            n_channel,
            sample_rate,
            label: "manual".to_owned(),
        });
        self
    }
}
impl SampleSource for ManualSource {
    fn name(&self) -> &str {
        "manual"
    }
    fn open(&mut self, request: &StreamRequest) -> Result<StreamFormat> {
        Ok(self.format.clone().unwrap_or_else(|| StreamFormat {
            n_channel: request.n_channel,
            sample_rate: request.sample_rate,
            label: "manual".to_owned(),
        }))
    }
    fn produce(&mut self) -> Result<Acquired> {
        self.queue.pop_front().unwrap_or(Ok(Acquired::Exhausted))
    }
}
/// Rejects a request the source cannot satisfy at all.
pub(crate) fn negotiate_channels(
    backend: &str,
    request: &StreamRequest,
    available: usize,
) -> Result<usize> {
    if available == 0 {
        return Err(ReaderError::unavailable(backend, "source reports no channels"));
    }
    if available < request.n_channel {
        log::info!(
            "{backend}: {} channels requested, {available} available",
            request.n_channel
        );
    }
    Ok(request.n_channel.min(available))
}
#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn manual_source_replays_then_exhausts() {
        let mut source = ManualSource::new(vec![Sample::new(vec![1.0]), Sample::at(vec![2.0], 0.5)]);
        let request = StreamRequest {
            n_channel: 1,
            sample_rate: 250.0,
        };
        assert_eq!(source.open(&request).unwrap().n_channel, 1);
        assert_eq!(source.produce().unwrap(), Acquired::Sample(Sample::new(vec![1.0])));
        assert_eq!(
            source.produce().unwrap(),
            Acquired::Sample(Sample::at(vec![2.0], 0.5))
        );
        assert_eq!(source.produce().unwrap(), Acquired::Exhausted);
    }
    #[test]
    fn stream_waits_on_the_clock_while_control_is_pending() {
        use crate::ads1299::emulator::EmulatedChip;
        use crate::ads1299::Ads1299;
        use crate::config::DriverTiming;
        use crate::pacing::ManualClock;
        let emu = EmulatedChip::new();
        let clock = Arc::new(ManualClock::new());
        let chip = Ads1299::new(emu.bus(), emu.drdy(), clock.clone(), DriverTiming::immediate());
        let handle = DeviceHandle::new(Box::new(chip), clock.clone());
        handle.waiting.fetch_add(1, Ordering::SeqCst);
        let producer = {
            let handle = handle.clone();
            std::thread::spawn(move || handle.stream(|device| Ok(device.name().to_owned())))
        };
        while clock.elapsed() < CONTROL_BACKOFF * 3 {
            std::thread::yield_now();
        }
        assert!(!producer.is_finished());
        handle.waiting.fetch_sub(1, Ordering::SeqCst);
        let name = producer.join().unwrap().unwrap();
        assert!(!name.is_empty());
    }
    #[test]
    fn negotiation_never_grows() {
        let request = StreamRequest {
            n_channel: 8,
            sample_rate: 250.0,
        };
        assert_eq!(negotiate_channels("t", &request, 4).unwrap(), 4);
        assert_eq!(negotiate_channels("t", &request, 16).unwrap(), 8);
        assert!(negotiate_channels("t", &request, 0).is_err());
    }
}
