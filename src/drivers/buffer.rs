use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, warn};
use memmap2::{Mmap, MmapMut};
use ndarray::{Array1, Array2};
use crate::drivers::BufferError;
use crate::pacing::Deadline;
use crate::types::BufferBacking;
const MAGIC: u64 = u64::from_le_bytes(*b"NACQBUF1");
/// Cells start on their own cache line after the header.
const HEADER_LEN: usize = 64;
const LATEST_POLL: Duration = Duration::from_micros(200);
/// Control block at the start of the mapping. Everything another process
/// may observe is an atomic.
#[repr(C)]
struct Header {
    magic: AtomicU64,
    n_channel_alloc: AtomicU32,
    n_channel: AtomicU32,
    window_size: AtomicU32,
    sample_rate_bits: AtomicU32,
    write_index: AtomicU32,
    _reserved: AtomicU32,
    /// Seqlock: odd while a column is being written, `2 * samples_written` otherwise.
    epoch: AtomicU64,
}
/// Most recent column together with the cursor it was read at.
#[derive(Clone, Debug)]
pub struct LatestSample {
    pub values: Array1<f32>,
    pub timestamp: f32,
    /// Total samples written when this column was read.
    pub cursor: u64,
    /// No sample newer than the caller's cursor arrived within the wait.
    pub stale: bool,
}
/// The whole window rotated oldest-first. The last row holds timestamps.
#[derive(Clone, Debug)]
pub struct WindowFrame {
    pub data: Array2<f32>,
    pub cursor: u64,
    pub stale: bool,
}
impl WindowFrame {
    pub fn n_channel(&self) -> usize {
        self.data.nrows().saturating_sub(1)
    }
    pub fn timestamps(&self) -> ndarray::ArrayView1<'_, f32> {
        self.data.row(self.n_channel())
    }
}
/// Fixed-shape circular sample store, `(n_channel + 1) x window_size` f32.
///
/// One producer writes through a [`SampleWriter`]; any number of consumers
/// read through `&self` without locking. Column writes are bracketed by the
/// epoch counter so readers can detect and repair torn copies.
pub struct SampleBuffer {
    map: Mapping,
    n_alloc: usize,
    window: usize,
    path: Option<PathBuf>,
    owns_path: bool,
    writer_taken: AtomicBool,
}
/// Owned storage is writable; an attached view is mapped read-only.
enum Mapping {
    Owned(MmapMut),
    View(Mmap),
}
impl Mapping {
    fn as_ptr(&self) -> *const u8 {
        match self {
            Mapping::Owned(map) => map.as_ptr(),
            Mapping::View(map) => map.as_ptr(),
        }
    }
}
impl SampleBuffer {
    /// Creates the buffer. A shared file must not exist yet: a path already
    /// taken by another buffer fails with [`BufferError::InUse`].
    pub fn allocate(
        n_channel: usize,
        window_size: usize,
        sample_rate: f32,
        backing: &BufferBacking,
        name: &str,
    ) -> Result<Self, BufferError> {
        if n_channel == 0 || window_size == 0 {
            return Err(BufferError::Allocation(format!(
                "empty shape {n_channel} x {window_size}"
            )));
        }
        let len = mapping_len(n_channel, window_size)?;
        let (map, path) = match backing {
            BufferBacking::Anonymous => {
                let map = MmapMut::map_anon(len)
                    .map_err(|e| BufferError::Allocation(e.to_string()))?;
                (map, None)
            }
            BufferBacking::Shared { path } => {
                let path = path.clone().unwrap_or_else(|| default_shared_path(name));
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .map_err(|source| match source.kind() {
                        std::io::ErrorKind::AlreadyExists => BufferError::InUse(path.clone()),
                        _ => BufferError::Io { path: path.clone(), source },
                    })?;
                let mapped = file
                    .set_len(len as u64)
                    .and_then(|()| unsafe { MmapMut::map_mut(&file) });
                match mapped {
                    Ok(map) => (map, Some(path)),
                    Err(source) => {
                        // the file is ours, do not leave it behind
                        let _ = std::fs::remove_file(&path);
                        return Err(BufferError::Io { path, source });
                    }
                }
            }
        };
        let buffer = Self {
            map: Mapping::Owned(map),
            n_alloc: n_channel,
            window: window_size,
            owns_path: path.is_some(),
            path,
            writer_taken: AtomicBool::new(false),
        };
        let header = buffer.header();
        header.n_channel_alloc.store(n_channel as u32, Ordering::Relaxed);
        header.n_channel.store(n_channel as u32, Ordering::Relaxed);
        header.window_size.store(window_size as u32, Ordering::Relaxed);
        header.sample_rate_bits.store(sample_rate.to_bits(), Ordering::Relaxed);
        header.magic.store(MAGIC, Ordering::Release);
        debug!(
            "allocated sample buffer {n_channel}x{window_size} ({})",
            buffer
                .path
                .as_deref()
                .map_or_else(|| "anonymous".to_owned(), |p| p.display().to_string())
        );
        Ok(buffer)
    }
    /// Maps a buffer created by another process read-only. The view never
    /// writes and never removes the file.
    pub fn attach(path: impl AsRef<Path>) -> Result<Self, BufferError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|source| BufferError::Io { path: path.clone(), source })?;
        let map = unsafe { Mmap::map(&file) }
            .map_err(|source| BufferError::Io { path: path.clone(), source })?;
        if map.len() < HEADER_LEN {
            return Err(BufferError::BadMagic(path));
        }
        let header = unsafe { &*(map.as_ptr() as *const Header) };
        if header.magic.load(Ordering::Acquire) != MAGIC {
            return Err(BufferError::BadMagic(path));
        }
        let n_alloc = header.n_channel_alloc.load(Ordering::Relaxed) as usize;
        let window = header.window_size.load(Ordering::Relaxed) as usize;
        if n_alloc == 0 || window == 0 || mapping_len(n_alloc, window)? > map.len() {
            return Err(BufferError::BadMagic(path));
        }
        Ok(Self {
            map: Mapping::View(map),
            n_alloc,
            window,
            path: Some(path),
            owns_path: false,
            writer_taken: AtomicBool::new(true),
        })
    }
    /// Hands out the single writer. Fails if one was already taken.
    pub fn take_writer(self: &Arc<Self>) -> Result<SampleWriter, BufferError> {
        if self.writer_taken.swap(true, Ordering::AcqRel) {
            return Err(BufferError::WriterTaken);
        }
        Ok(SampleWriter {
            buffer: Arc::clone(self),
        })
    }
    /// True for a view from [`SampleBuffer::attach`].
    pub fn is_view(&self) -> bool {
        matches!(self.map, Mapping::View(_))
    }
    fn header(&self) -> &Header {
        // the mapping is page aligned and at least HEADER_LEN long
        unsafe { &*(self.map.as_ptr() as *const Header) }
    }
    fn cells(&self) -> &[AtomicU32] {
        let len = (self.n_alloc + 1) * self.window;
        unsafe {
            std::slice::from_raw_parts(self.map.as_ptr().add(HEADER_LEN) as *const AtomicU32, len)
        }
    }
    fn cell(&self, row: usize, col: usize) -> &AtomicU32 {
        &self.cells()[row * self.window + col]
    }
    pub fn n_channel(&self) -> usize {
        self.header().n_channel.load(Ordering::Acquire) as usize
    }
    pub fn window_size(&self) -> usize {
        self.window
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
    pub fn sample_rate(&self) -> f32 {
        f32::from_bits(self.header().sample_rate_bits.load(Ordering::Relaxed))
    }
    pub fn set_sample_rate(&self, rate: f32) {
        if self.is_view() {
            warn!("sample rate of an attached buffer view is read-only");
            return;
        }
        self.header()
            .sample_rate_bits
            .store(rate.to_bits(), Ordering::Relaxed);
    }
    /// Next column the writer will fill.
    pub fn write_index(&self) -> usize {
        self.header().write_index.load(Ordering::Acquire) as usize
    }
    pub fn samples_written(&self) -> u64 {
        self.header().epoch.load(Ordering::Acquire) / 2
    }
    /// Irreversibly lowers the channel count. No-op unless `n` is smaller.
    pub fn shrink_channels(&self, n: usize) {
        if self.is_view() {
            warn!("channel count of an attached buffer view is read-only");
            return;
        }
        let n = n.max(1) as u32;
        let previous = self.header().n_channel.fetch_min(n, Ordering::AcqRel);
        if n < previous {
            debug!("sample buffer shrunk from {previous} to {n} channels");
        }
    }
    fn begin_read(&self) -> u64 {
        loop {
            let epoch = self.header().epoch.load(Ordering::Acquire);
            if epoch % 2 == 0 {
                return epoch;
            }
            std::hint::spin_loop();
        }
    }
    fn end_read(&self) -> u64 {
        fence(Ordering::Acquire);
        self.header().epoch.load(Ordering::Relaxed)
    }
    fn column_position(&self, epoch: u64) -> usize {
        ((epoch / 2) % self.window as u64) as usize
    }
    fn copy_columns(&self, out: &mut [u32], start: usize, count: usize) {
        let cells = self.cells();
        for k in 0..count {
            let col = (start + k) % self.window;
            for row in 0..=self.n_alloc {
                let at = row * self.window + col;
                out[at] = cells[at].load(Ordering::Relaxed);
            }
        }
    }
    /// Consistent copy of all cells plus the epoch it is valid at.
    fn snapshot(&self) -> (Vec<u32>, u64) {
        let mut cells = vec![0u32; (self.n_alloc + 1) * self.window];
        let mut begin = self.begin_read();
        self.copy_columns(&mut cells, 0, self.window);
        loop {
            if self.end_read() == begin {
                return (cells, begin);
            }
            // recopy only the columns written since `begin`
            let next = self.begin_read();
            let dirty = ((next - begin) / 2).min(self.window as u64) as usize;
            self.copy_columns(&mut cells, self.column_position(begin), dirty);
            begin = next;
        }
    }
    /// All columns, oldest first. Never blocks the writer.
    pub fn read_window(&self) -> WindowFrame {
        let n = self.n_channel();
        let (cells, epoch) = self.snapshot();
        let start = self.column_position(epoch);
        let window = self.window;
        let data = Array2::from_shape_fn((n + 1, window), |(row, col)| {
            let phys = if row == n { self.n_alloc } else { row };
            f32::from_bits(cells[phys * window + (start + col) % window])
        });
        WindowFrame {
            data,
            cursor: epoch / 2,
            stale: false,
        }
    }
    fn latest_column(&self, n: usize) -> (Array1<f32>, f32, u64) {
        loop {
            let begin = self.begin_read();
            let col = (self.column_position(begin) + self.window - 1) % self.window;
            let values: Array1<f32> = (0..n)
                .map(|ch| f32::from_bits(self.cell(ch, col).load(Ordering::Relaxed)))
                .collect();
            let timestamp = f32::from_bits(self.cell(self.n_alloc, col).load(Ordering::Relaxed));
            if self.end_read() == begin {
                return (values, timestamp, begin / 2);
            }
        }
    }
    /// Newest column once something newer than `last_seen` was written, or
    /// the current newest marked stale when `deadline` passes first.
    pub fn read_latest(&self, last_seen: u64, deadline: &Deadline<'_>) -> LatestSample {
        let n = self.n_channel();
        loop {
            let (values, timestamp, cursor) = self.latest_column(n);
            let fresh = cursor != last_seen;
            if fresh || deadline.expired() {
                return LatestSample {
                    values,
                    timestamp,
                    cursor,
                    stale: !fresh,
                };
            }
            deadline.pause(LATEST_POLL);
        }
    }
    /// Achieved rate estimated from the timestamp row, 0 when unknown.
    pub fn realtime_sample_rate(&self) -> f32 {
        let frame = self.read_window();
        let filled = (frame.cursor.min(self.window as u64)) as usize;
        if filled < 2 {
            return 0.0;
        }
        let ts = frame.timestamps();
        let span = ts[self.window - 1] - ts[self.window - filled];
        if span <= 0.0 {
            return 0.0;
        }
        (filled - 1) as f32 / span
    }
    /// Unmaps the storage and removes the shared file this buffer created.
    pub fn release(mut self) -> Result<(), BufferError> {
        self.remove_file()
    }
    fn remove_file(&mut self) -> Result<(), BufferError> {
        if !self.owns_path {
            return Ok(());
        }
        self.owns_path = false;
        match &self.path {
            Some(path) => match std::fs::remove_file(path) {
                Ok(()) => {
                    debug!("removed shared buffer {}", path.display());
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(BufferError::Io {
                    path: path.clone(),
                    source,
                }),
            },
            None => Ok(()),
        }
    }
}
impl Drop for SampleBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.remove_file() {
            warn!("{e}");
        }
    }
}
/// The producer's exclusive handle on a [`SampleBuffer`].
pub struct SampleWriter {
    buffer: Arc<SampleBuffer>,
}
impl SampleWriter {
    pub fn buffer(&self) -> &Arc<SampleBuffer> {
        &self.buffer
    }
    /// Writes one column and advances the write index. `values` may be longer
    /// than the current channel count; extra values are ignored.
    pub fn write_sample(&mut self, values: &[f32], timestamp: f32) -> Result<usize, BufferError> {
        let buf = &self.buffer;
        let n = buf.n_channel();
        if values.len() < n {
            return Err(BufferError::Shape {
                expected: n,
                actual: values.len(),
            });
        }
        let header = buf.header();
        let epoch = header.epoch.load(Ordering::Relaxed);
        let col = buf.column_position(epoch);
        header.epoch.store(epoch + 1, Ordering::Relaxed);
        fence(Ordering::Release);
        for (ch, value) in values[..n].iter().enumerate() {
            buf.cell(ch, col).store(value.to_bits(), Ordering::Relaxed);
        }
        buf.cell(buf.n_alloc, col)
            .store(timestamp.to_bits(), Ordering::Relaxed);
        let next = (col + 1) % buf.window;
        header.write_index.store(next as u32, Ordering::Release);
        header.epoch.store(epoch + 2, Ordering::Release);
        Ok(next)
    }
}
fn mapping_len(n_channel: usize, window_size: usize) -> Result<usize, BufferError> {
    (n_channel + 1)
        .checked_mul(window_size)
        .and_then(|cells| cells.checked_mul(std::mem::size_of::<u32>()))
        .and_then(|bytes| bytes.checked_add(HEADER_LEN))
        .ok_or_else(|| {
            BufferError::Allocation(format!("{n_channel} x {window_size} overflows"))
        })
}
fn default_shared_path(name: &str) -> PathBuf {
    let dir = Path::new("/dev/shm");
    let dir = if dir.is_dir() {
        dir.to_path_buf()
    } else {
        std::env::temp_dir()
    };
    let name: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    dir.join(format!("neuroacq-{name}-{}", std::process::id()))
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::ManualClock;
    fn anon(n: usize, window: usize) -> Arc<SampleBuffer> {
        Arc::new(SampleBuffer::allocate(n, window, 250.0, &BufferBacking::Anonymous, "test").unwrap())
    }
    #[test]
    fn full_window_reads_back_in_write_order() {
        let buffer = anon(2, 4);
        let mut writer = buffer.take_writer().unwrap();
        for i in 0..4 {
            writer.write_sample(&[i as f32, 10.0 * i as f32], i as f32).unwrap();
        }
        let frame = buffer.read_window();
        assert_eq!(frame.data.shape(), &[3, 4]);
        assert_eq!(frame.data.row(0).to_vec(), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(frame.data.row(1).to_vec(), vec![0.0, 10.0, 20.0, 30.0]);
        assert_eq!(frame.timestamps().to_vec(), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(frame.cursor, 4);
        assert_eq!(buffer.write_index(), 0);
    }
    #[test]
    fn wraparound_rotates_oldest_first() {
        let buffer = anon(1, 4);
        let mut writer = buffer.take_writer().unwrap();
        for i in 0..6 {
            writer.write_sample(&[i as f32], i as f32).unwrap();
        }
        let frame = buffer.read_window();
        assert_eq!(frame.timestamps().to_vec(), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(frame.data.row(0).to_vec(), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(buffer.write_index(), 2);
    }
    #[test]
    fn shrink_only_lowers_channel_count() {
        let buffer = anon(8, 3);
        buffer.shrink_channels(4);
        buffer.shrink_channels(6);
        assert_eq!(buffer.n_channel(), 4);
        let mut writer = buffer.take_writer().unwrap();
        writer.write_sample(&[1.0; 8], 0.5).unwrap();
        let frame = buffer.read_window();
        assert_eq!(frame.data.shape(), &[5, 3]);
        assert_eq!(frame.timestamps()[2], 0.5);
        assert!(matches!(
            writer.write_sample(&[1.0; 3], 1.0),
            Err(BufferError::Shape { expected: 4, actual: 3 })
        ));
    }
    #[test]
    fn second_writer_is_refused() {
        let buffer = anon(1, 2);
        let _writer = buffer.take_writer().unwrap();
        assert!(matches!(buffer.take_writer(), Err(BufferError::WriterTaken)));
    }
    #[test]
    fn latest_reports_stale_after_bounded_wait() {
        let buffer = anon(2, 8);
        let clock = ManualClock::new();
        let deadline = Deadline::after(&clock, Duration::from_millis(40));
        let latest = buffer.read_latest(0, &deadline);
        assert!(latest.stale);
        assert_eq!(clock.elapsed(), Duration::from_millis(40));
        let mut writer = buffer.take_writer().unwrap();
        writer.write_sample(&[3.0, 4.0], 0.004).unwrap();
        let deadline = Deadline::after(&clock, Duration::from_millis(40));
        let latest = buffer.read_latest(0, &deadline);
        assert!(!latest.stale);
        assert_eq!(latest.cursor, 1);
        assert_eq!(latest.values.to_vec(), vec![3.0, 4.0]);
        assert_eq!(latest.timestamp, 0.004);
    }
    #[test]
    fn concurrent_reads_never_tear_columns() {
        let buffer = anon(4, 64);
        let mut writer = buffer.take_writer().unwrap();
        let producer = std::thread::spawn(move || {
            for k in 1..=20_000u32 {
                let v = k as f32;
                writer.write_sample(&[v, v, v, v], v).unwrap();
            }
        });
        while !producer.is_finished() {
            let frame = buffer.read_window();
            for col in frame.data.columns() {
                let ts = col[4];
                assert!(col.iter().all(|v| *v == ts), "torn column {col:?}");
            }
        }
        producer.join().unwrap();
        assert_eq!(buffer.samples_written(), 20_000);
    }
    #[test]
    fn realtime_rate_comes_from_timestamps() {
        let buffer = anon(1, 10);
        assert_eq!(buffer.realtime_sample_rate(), 0.0);
        let mut writer = buffer.take_writer().unwrap();
        for i in 0..5 {
            writer.write_sample(&[0.0], i as f32 * 0.004).unwrap();
        }
        assert!((buffer.realtime_sample_rate() - 250.0).abs() < 0.5);
    }
    #[test]
    fn shared_buffer_is_visible_to_attached_view_and_removed_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared-buf");
        let backing = BufferBacking::Shared {
            path: Some(path.clone()),
        };
        let buffer = Arc::new(SampleBuffer::allocate(2, 5, 500.0, &backing, "shared").unwrap());
        let mut writer = buffer.take_writer().unwrap();
        writer.write_sample(&[1.5, -2.5], 0.002).unwrap();
        let view = Arc::new(SampleBuffer::attach(&path).unwrap());
        assert!(view.is_view());
        view.shrink_channels(1);
        view.set_sample_rate(1.0);
        assert_eq!(view.n_channel(), 2);
        assert_eq!(view.window_size(), 5);
        assert_eq!(view.sample_rate(), 500.0);
        assert!(matches!(view.take_writer(), Err(BufferError::WriterTaken)));
        let frame = view.read_window();
        assert_eq!(frame.data[[0, 4]], 1.5);
        assert_eq!(frame.data[[1, 4]], -2.5);
        drop(view);
        assert!(path.exists());
        drop(writer);
        let buffer = Arc::try_unwrap(buffer).ok().unwrap();
        buffer.release().unwrap();
        assert!(!path.exists());
    }
    #[test]
    fn shared_path_cannot_back_two_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken");
        let backing = BufferBacking::Shared {
            path: Some(path.clone()),
        };
        let first = Arc::new(SampleBuffer::allocate(1, 4, 250.0, &backing, "first").unwrap());
        let mut writer = first.take_writer().unwrap();
        writer.write_sample(&[7.0], 0.0).unwrap();
        assert!(matches!(
            SampleBuffer::allocate(1, 4, 250.0, &backing, "second"),
            Err(BufferError::InUse(p)) if p == path
        ));
        // the refused allocation neither truncated nor removed the file
        assert!(path.exists());
        assert_eq!(first.samples_written(), 1);
        assert_eq!(SampleBuffer::attach(&path).unwrap().read_window().data[[0, 3]], 7.0);
    }
    #[test]
    fn attach_rejects_foreign_files() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![7u8; 256]).unwrap();
        assert!(matches!(
            SampleBuffer::attach(file.path()),
            Err(BufferError::BadMagic(_))
        ));
    }
}
