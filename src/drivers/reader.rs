use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use log::{debug, error, info, warn};
use crate::ads1299::{Gain, InputSource, SampleRate};
use crate::config::ReaderOptions;
use crate::drivers::buffer::{LatestSample, SampleBuffer, SampleWriter, WindowFrame};
use crate::drivers::source::{Acquired, DeviceHandle, SampleSource, StreamRequest};
use crate::drivers::{ReaderError, Result};
use crate::pacing::{system_clock, Clock, Deadline};
use crate::sources::build_source;
use crate::types::ReaderState;
const FULL_WINDOW_POLL: Duration = Duration::from_millis(1);
/// Flags shared between the control side and the producer thread.
#[derive(Default)]
struct Shared {
    paused: AtomicBool,
    closing: AtomicBool,
    running: AtomicBool,
    last_error: Mutex<Option<String>>,
    captures: Mutex<Vec<Arc<CaptureSink>>>,
}
impl Shared {
    fn set_error(&self, message: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = message;
    }
    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
    fn captures(&self) -> MutexGuard<'_, Vec<Arc<CaptureSink>>> {
        self.captures.lock().unwrap_or_else(|e| e.into_inner())
    }
    fn feed_captures(&self, values: &[f32], timestamp: f32) {
        let mut captures = self.captures();
        if captures.is_empty() {
            return;
        }
        // a dropped Capture leaves the producer as the only owner
        captures.retain(|sink| Arc::strong_count(sink) > 1);
        for sink in captures.iter() {
            sink.push(values, timestamp);
        }
    }
}
/// One sample as delivered to a [`Capture`].
#[derive(Clone, Debug, PartialEq)]
pub struct CapturedSample {
    pub values: Vec<f32>,
    pub timestamp: f32,
}
struct CaptureSink {
    queue: Mutex<VecDeque<CapturedSample>>,
    capacity: usize,
    dropped: AtomicU64,
}
impl CaptureSink {
    fn queue(&self) -> MutexGuard<'_, VecDeque<CapturedSample>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
    fn push(&self, values: &[f32], timestamp: f32) {
        let mut queue = self.queue();
        if queue.len() == self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(CapturedSample {
            values: values.to_vec(),
            timestamp,
        });
    }
}
/// Receives every sample the producer writes from registration on, so a
/// consumer that drains it often enough sees no gap when the window wraps.
///
/// Holds at most `capacity` samples; when full the oldest one is discarded
/// and counted in [`Capture::dropped`].
pub struct Capture {
    sink: Arc<CaptureSink>,
}
impl Capture {
    pub fn drain(&self) -> Vec<CapturedSample> {
        self.sink.queue().drain(..).collect()
    }
    pub fn len(&self) -> usize {
        self.sink.queue().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn dropped(&self) -> u64 {
        self.sink.dropped.load(Ordering::Relaxed)
    }
}
struct Lifecycle {
    state: ReaderState,
    options: ReaderOptions,
    buffer: Option<Arc<SampleBuffer>>,
    producer: Option<JoinHandle<()>>,
    device: Option<DeviceHandle>,
    source_name: String,
    label: String,
}
/// One buffer fed by one source through a dedicated producer thread.
///
/// Every method takes `&self`, so a reader can be shared between consumer
/// threads and closed from any of them. Dropping the reader closes it.
pub struct Reader {
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    latest_cursor: AtomicU64,
    window_cursor: AtomicU64,
    full_cursor: AtomicU64,
}
impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}
impl Reader {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            shared: Arc::new(Shared::default()),
            lifecycle: Mutex::new(Lifecycle {
                state: ReaderState::Closed,
                options: ReaderOptions::default(),
                buffer: None,
                producer: None,
                device: None,
                source_name: String::new(),
                label: String::new(),
            }),
            latest_cursor: AtomicU64::new(0),
            window_cursor: AtomicU64::new(0),
            full_cursor: AtomicU64::new(0),
        }
    }
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }
    /// Opens the source configured in `options` and starts streaming.
    /// On a paused reader this is `resume`; on a started one it does nothing.
    /// A reader whose producer has stopped is closed and opened again.
    pub fn start(&self, options: &ReaderOptions) -> Result<()> {
        let mut life = self.lock();
        if self.reuse_running(&mut life) {
            return Ok(());
        }
        options.validate()?;
        let source = build_source(&options.source, self.clock.clone())?;
        self.start_locked(&mut life, options, source)
    }
    /// Like [`Reader::start`] with a caller-supplied source.
    pub fn start_with(&self, options: &ReaderOptions, source: Box<dyn SampleSource>) -> Result<()> {
        let mut life = self.lock();
        if self.reuse_running(&mut life) {
            return Ok(());
        }
        options.validate()?;
        self.start_locked(&mut life, options, source)
    }
    fn is_dead(&self, life: &Lifecycle) -> bool {
        life.state != ReaderState::Closed && !self.shared.running.load(Ordering::Acquire)
    }
    fn stopped_error(&self) -> ReaderError {
        ReaderError::Stopped {
            reason: self
                .shared
                .last_error()
                .unwrap_or_else(|| "source ended".to_owned()),
        }
    }
    fn reuse_running(&self, life: &mut Lifecycle) -> bool {
        if self.is_dead(life) {
            info!("reader {}: producer has stopped, reopening", life.options.name);
            self.close_locked(life);
            return false;
        }
        match life.state {
            ReaderState::Closed => false,
            ReaderState::Started => {
                debug!("reader {} already started", life.options.name);
                true
            }
            ReaderState::Paused => {
                self.resume_locked(life);
                true
            }
        }
    }
    fn start_locked(
        &self,
        life: &mut Lifecycle,
        options: &ReaderOptions,
        mut source: Box<dyn SampleSource>,
    ) -> Result<()> {
        let window = options.window_size()?;
        let buffer = Arc::new(SampleBuffer::allocate(
            options.n_channel,
            window,
            options.sample_rate as f32,
            &options.backing,
            &options.name,
        )?);
        let request = StreamRequest {
            n_channel: options.n_channel,
            sample_rate: options.sample_rate as f32,
        };
        let format = source.open(&request).map_err(|e| {
            error!("reader {}: cannot open {}: {e}", options.name, source.name());
            e
        })?;
        if format.n_channel < options.n_channel {
            info!(
                "reader {}: {} provides {} of {} channels",
                options.name,
                source.name(),
                format.n_channel,
                options.n_channel
            );
            buffer.shrink_channels(format.n_channel);
        }
        if format.sample_rate != request.sample_rate {
            info!(
                "reader {}: source runs at {} Hz, window stays {window} columns",
                options.name, format.sample_rate
            );
            buffer.set_sample_rate(format.sample_rate);
        }
        let writer = buffer.take_writer()?;
        self.shared.paused.store(false, Ordering::Release);
        self.shared.closing.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        self.shared.set_error(None);
        self.reset_cursors();
        let device = source.control();
        let source_name = source.name().to_owned();
        let producer = Producer {
            name: options.name.clone(),
            source,
            writer,
            shared: self.shared.clone(),
            clock: self.clock.clone(),
            max_retries: options.max_transient_retries,
            pause_poll: options.pause_poll(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("producer-{}", options.name))
            .spawn(move || producer.run())
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                ReaderError::unavailable(source_name.clone(), e)
            })?;
        info!(
            "reader {} started: {}, {} channels at {} Hz, window {window}",
            options.name, format.label, format.n_channel, format.sample_rate
        );
        *life = Lifecycle {
            state: ReaderState::Started,
            options: options.clone(),
            buffer: Some(buffer),
            producer: Some(handle),
            device,
            source_name,
            label: format.label,
        };
        Ok(())
    }
    pub fn pause(&self) -> Result<()> {
        let mut life = self.lock();
        if self.is_dead(&life) {
            return Err(self.stopped_error());
        }
        match life.state {
            ReaderState::Closed => Err(ReaderError::NotStarted),
            ReaderState::Paused => Ok(()),
            ReaderState::Started => {
                self.shared.paused.store(true, Ordering::Release);
                life.state = ReaderState::Paused;
                info!("reader {} paused", life.options.name);
                Ok(())
            }
        }
    }
    pub fn resume(&self) -> Result<()> {
        let mut life = self.lock();
        if self.is_dead(&life) {
            return Err(self.stopped_error());
        }
        match life.state {
            ReaderState::Closed => Err(ReaderError::NotStarted),
            _ => {
                self.resume_locked(&mut life);
                Ok(())
            }
        }
    }
    fn resume_locked(&self, life: &mut Lifecycle) {
        if life.state == ReaderState::Paused {
            self.shared.paused.store(false, Ordering::Release);
            life.state = ReaderState::Started;
            info!("reader {} resumed", life.options.name);
        }
    }
    /// `close` then `start`, e.g. to change the rate or channel count.
    pub fn restart(&self, options: &ReaderOptions) -> Result<()> {
        info!("reader {} restarting", options.name);
        self.close();
        self.start(options)
    }
    /// Stops the producer, waits for it and releases the buffer. Calling it
    /// again is a no-op.
    pub fn close(&self) {
        let mut life = self.lock();
        self.close_locked(&mut life);
    }
    fn close_locked(&self, life: &mut Lifecycle) {
        if life.state == ReaderState::Closed {
            return;
        }
        self.shared.closing.store(true, Ordering::Release);
        if let Some(handle) = life.producer.take() {
            if handle.join().is_err() {
                error!("reader {}: producer thread panicked", life.options.name);
            }
        }
        self.shared.running.store(false, Ordering::Release);
        life.device = None;
        if let Some(buffer) = life.buffer.take() {
            match Arc::try_unwrap(buffer) {
                Ok(buffer) => {
                    if let Err(e) = buffer.release() {
                        warn!("reader {}: {e}", life.options.name);
                    }
                }
                // consumers still hold it; released with the last handle
                Err(_) => debug!("reader {}: buffer still shared", life.options.name),
            }
        }
        self.reset_cursors();
        life.state = ReaderState::Closed;
        info!("reader {} closed", life.options.name);
    }
    fn reset_cursors(&self) {
        self.latest_cursor.store(0, Ordering::Relaxed);
        self.window_cursor.store(0, Ordering::Relaxed);
        self.full_cursor.store(0, Ordering::Relaxed);
    }
    /// Starts collecting every written sample into a new [`Capture`]. Works
    /// on a closed reader too, so nothing is missed from the next start on.
    pub fn register_capture(&self, capacity: usize) -> Capture {
        let sink = Arc::new(CaptureSink {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        });
        self.shared.captures().push(sink.clone());
        debug!("reader {}: capture registered", self.name());
        Capture { sink }
    }
    /// Stops feeding `capture` and returns what it still held.
    pub fn unregister_capture(&self, capture: Capture) -> Vec<CapturedSample> {
        self.shared
            .captures()
            .retain(|sink| !Arc::ptr_eq(sink, &capture.sink));
        capture.drain()
    }
    pub fn state(&self) -> ReaderState {
        self.lock().state
    }
    /// True while the producer is alive and not paused. A reader that is not
    /// closed but not streaming has died; see [`Reader::last_error`].
    pub fn is_streaming(&self) -> bool {
        self.shared.running.load(Ordering::Acquire) && !self.shared.paused.load(Ordering::Acquire)
    }
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error()
    }
    pub fn name(&self) -> String {
        self.lock().options.name.clone()
    }
    /// Where the samples come from, e.g. `tcp 127.0.0.1:9000`.
    pub fn input_source(&self) -> String {
        self.lock().label.clone()
    }
    pub fn buffer(&self) -> Option<Arc<SampleBuffer>> {
        self.lock().buffer.clone()
    }
    fn require_buffer(&self) -> Result<Arc<SampleBuffer>> {
        self.buffer().ok_or(ReaderError::NotStarted)
    }
    pub fn sample_rate(&self) -> f32 {
        let life = self.lock();
        match &life.buffer {
            Some(buffer) => buffer.sample_rate(),
            None => life.options.sample_rate as f32,
        }
    }
    pub fn n_channel(&self) -> usize {
        let life = self.lock();
        match &life.buffer {
            Some(buffer) => buffer.n_channel(),
            None => life.options.n_channel,
        }
    }
    pub fn window_size(&self) -> usize {
        let life = self.lock();
        match &life.buffer {
            Some(buffer) => buffer.window_size(),
            None => life.options.window_size().unwrap_or(0),
        }
    }
    /// Window length in seconds at the current rate.
    pub fn sample_time(&self) -> f32 {
        let rate = self.sample_rate();
        if rate > 0.0 {
            self.window_size() as f32 / rate
        } else {
            0.0
        }
    }
    pub fn samples_written(&self) -> u64 {
        self.buffer().map_or(0, |b| b.samples_written())
    }
    pub fn realtime_sample_rate(&self) -> f32 {
        self.buffer().map_or(0.0, |b| b.realtime_sample_rate())
    }
    /// Newest column. Waits up to `stale_wait_periods` sample periods for a
    /// sample newer than the previous call's, then returns the old one
    /// flagged as stale.
    pub fn read_latest_sample(&self) -> Result<LatestSample> {
        let (buffer, periods) = {
            let life = self.lock();
            let buffer = life.buffer.clone().ok_or(ReaderError::NotStarted)?;
            (buffer, life.options.stale_wait_periods.max(1))
        };
        let period = sample_period(&buffer);
        let deadline = Deadline::after(&*self.clock, period * periods);
        let latest = buffer.read_latest(self.latest_cursor.load(Ordering::Acquire), &deadline);
        self.latest_cursor.store(latest.cursor, Ordering::Release);
        if latest.stale {
            debug!("no new sample within {:?}", period * periods);
        }
        Ok(latest)
    }
    /// Whole window oldest-first; `stale` when nothing was written since the
    /// previous call.
    pub fn read_window(&self) -> Result<WindowFrame> {
        let mut frame = self.require_buffer()?.read_window();
        let previous = self.window_cursor.swap(frame.cursor, Ordering::AcqRel);
        frame.stale = frame.cursor == previous;
        Ok(frame)
    }
    /// Waits until a whole window of samples newer than the previous call's
    /// has been written and returns it. Gives up after one window duration
    /// plus `stale_wait_periods` periods, returning the current window marked
    /// stale.
    pub fn read_full_window(&self) -> Result<WindowFrame> {
        let (buffer, periods) = {
            let life = self.lock();
            let buffer = life.buffer.clone().ok_or(ReaderError::NotStarted)?;
            (buffer, life.options.stale_wait_periods.max(1))
        };
        let window = buffer.window_size() as u64;
        let target = self.full_cursor.load(Ordering::Acquire) + window;
        let periods = u32::try_from(window)
            .unwrap_or(u32::MAX)
            .saturating_add(periods);
        let wait = sample_period(&buffer).saturating_mul(periods);
        let deadline = Deadline::after(&*self.clock, wait);
        while buffer.samples_written() < target && !deadline.expired() {
            deadline.pause(FULL_WINDOW_POLL);
        }
        let mut frame = buffer.read_window();
        frame.stale = frame.cursor < target;
        if frame.stale {
            debug!("no full window within {wait:?}");
        } else {
            self.full_cursor.store(frame.cursor, Ordering::Release);
        }
        Ok(frame)
    }
    fn device(&self, operation: &'static str) -> Result<DeviceHandle> {
        let life = self.lock();
        if life.state == ReaderState::Closed {
            return Err(ReaderError::NotStarted);
        }
        life.device.clone().ok_or_else(|| ReaderError::Unsupported {
            backend: life.source_name.clone(),
            operation,
        })
    }
    /// Selects the channel input (`normal`, `shorted`, `mvdd`, `temper`, `test`).
    pub fn set_input_source(&self, name: &str) -> Result<()> {
        let source: InputSource = name.parse()?;
        self.device("set input source")?
            .control(|device| device.set_input_source(source))?;
        info!("reader {}: input source {source}", self.name());
        Ok(())
    }
    pub fn device_input_source(&self) -> Result<InputSource> {
        self.device("input source")?
            .control(|device| Ok(device.input_source()))
    }
    /// Changes the converter rate in place. The window keeps its size, so
    /// its duration changes; restart to resize it.
    pub fn set_sample_rate(&self, hz: u32) -> Result<()> {
        let rate = SampleRate::try_from(hz)?;
        let device = self.device("set sample rate")?;
        device.control(|device| device.set_sample_rate(rate))?;
        if let Some(buffer) = self.buffer() {
            buffer.set_sample_rate(hz as f32);
        }
        warn!(
            "reader {}: sample rate changed to {hz} Hz without restart, window now spans {:.2} s",
            self.name(),
            self.sample_time()
        );
        Ok(())
    }
    pub fn enable_bias(&self, enabled: bool) -> Result<()> {
        self.device("bias drive")?
            .control(|device| device.set_bias(enabled))
    }
    pub fn bias_enabled(&self) -> Result<bool> {
        self.device("bias drive")?
            .control(|device| Ok(device.bias_enabled()))
    }
    pub fn measure_impedance(&self, enabled: bool) -> Result<()> {
        self.device("impedance measurement")?
            .control(|device| device.set_impedance(enabled))
    }
    pub fn impedance_enabled(&self) -> Result<bool> {
        self.device("impedance measurement")?
            .control(|device| Ok(device.impedance_enabled()))
    }
    pub fn set_channel(&self, channel: usize, enabled: bool) -> Result<()> {
        self.device("channel power")?
            .control(|device| device.set_channel(channel, enabled))
    }
    pub fn set_gain(&self, channel: usize, gain: Gain) -> Result<()> {
        self.device("channel gain")?
            .control(|device| device.set_gain(channel, gain))
    }
}
fn sample_period(buffer: &SampleBuffer) -> Duration {
    let rate = buffer.sample_rate();
    if rate > 0.0 {
        Duration::from_secs_f32(1.0 / rate)
    } else {
        Duration::from_millis(100)
    }
}
impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}
/// The acquire, decode, write loop running on the producer thread.
struct Producer {
    name: String,
    source: Box<dyn SampleSource>,
    writer: SampleWriter,
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    pause_poll: Duration,
}
impl Producer {
    fn run(mut self) {
        let started = self.clock.now();
        let mut failures = 0u32;
        let outcome: Result<()> = loop {
            if self.shared.closing.load(Ordering::Acquire) {
                break Ok(());
            }
            if self.shared.paused.load(Ordering::Acquire) {
                self.clock.sleep(self.pause_poll);
                continue;
            }
            match self.source.produce() {
                Ok(Acquired::Sample(sample)) => {
                    failures = 0;
                    let timestamp = sample
                        .timestamp
                        .unwrap_or_else(|| (self.clock.now() - started).as_secs_f32());
                    if let Err(e) = self.writer.write_sample(&sample.values, timestamp) {
                        break Err(e.into());
                    }
                    let n = self.writer.buffer().n_channel();
                    self.shared.feed_captures(&sample.values[..n], timestamp);
                }
                Ok(Acquired::Skip) => {}
                Ok(Acquired::Exhausted) => {
                    info!("reader {}: {} exhausted", self.name, self.source.name());
                    break Ok(());
                }
                Err(e) if e.is_transient() && failures < self.max_retries => {
                    failures += 1;
                    warn!(
                        "reader {}: {} ({failures}/{}): {e}",
                        self.name,
                        self.source.name(),
                        self.max_retries
                    );
                }
                Err(e) => break Err(e),
            }
        };
        self.source.close();
        if let Err(e) = outcome {
            error!("reader {}: {} stopped: {e}", self.name, self.source.name());
            self.shared.set_error(Some(e.to_string()));
        }
        self.shared.running.store(false, Ordering::Release);
        debug!("reader {}: producer exited", self.name);
    }
}
