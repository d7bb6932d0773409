// src/lib.rs
pub mod ads1299;
pub mod config;
pub mod drivers;
pub mod pacing;
pub mod sources;
pub mod types;
pub use config::{DriverTiming, ReaderOptions, SourceConfig, Waveform};
pub use drivers::{
    BufferError, Capture, CapturedSample, LatestSample, Reader, ReaderError, SampleBuffer,
    ValidationError, WindowFrame,
};
pub use types::{BufferBacking, ReaderState};
