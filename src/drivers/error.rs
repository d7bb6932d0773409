use std::path::PathBuf;

use thiserror::Error;

/// Settings rejected before any hardware is touched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unsupported sample rate {0} Hz (supported: 250, 500, 1000, 2000, 4000, 8000, 16000)")]
    UnsupportedSampleRate(u32),
    #[error("unsupported input source `{0}` (supported: normal, shorted, mvdd, temper, test)")]
    UnsupportedInputSource(String),
    #[error("invalid channel count {requested} (must be between 1 and {max})")]
    InvalidChannelCount { requested: usize, max: usize },
    #[error("channel {channel} out of range (device has {available} channels)")]
    InvalidChannel { channel: usize, available: usize },
    #[error("invalid window: {sample_rate} Hz x {sample_time} s gives no samples")]
    InvalidWindow { sample_rate: u32, sample_time: f32 },
    #[error("relay command of {0} bytes does not fit the 4-byte command slot")]
    CommandTooLong(usize),
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("cannot allocate sample buffer storage: {0}")]
    Allocation(String),
    #[error("sample buffer I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is not a sample buffer (bad magic)")]
    BadMagic(PathBuf),
    #[error("shared buffer {0} already exists; another reader owns it or a stale file was left behind")]
    InUse(PathBuf),
    #[error("the sample buffer already has a writer")]
    WriterTaken,
    #[error("sample has {actual} channels, buffer expects at most {expected}")]
    Shape { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("{backend}: source unavailable: {reason}")]
    SourceUnavailable { backend: String, reason: String },
    #[error("bus device {device} is already in use")]
    BusInUse { device: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("transient read failure during {operation}: {reason}")]
    TransientRead {
        operation: &'static str,
        reason: String,
    },
    #[error("protocol error during {operation}: {reason}")]
    Protocol {
        operation: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("{backend} does not support {operation}")]
    Unsupported {
        backend: String,
        operation: &'static str,
    },
    #[error("reader is not started")]
    NotStarted,
    /// The producer has stopped; `start` or `restart` reopens the source.
    #[error("producer stopped: {reason}")]
    Stopped { reason: String },
}

impl ReaderError {
    pub fn unavailable(backend: impl Into<String>, reason: impl ToString) -> Self {
        ReaderError::SourceUnavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transient(operation: &'static str, reason: impl ToString) -> Self {
        ReaderError::TransientRead {
            operation,
            reason: reason.to_string(),
        }
    }

    pub fn protocol(operation: &'static str, reason: impl ToString) -> Self {
        ReaderError::Protocol {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Failures the producer loop retries before giving up on the source.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReaderError::TransientRead { .. })
    }
}

pub type Result<T, E = ReaderError> = std::result::Result<T, E>;
