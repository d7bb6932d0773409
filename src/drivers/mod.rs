// src/drivers/mod.rs
// 声明同级目录下的子模块文件
pub mod buffer;
pub mod error;
pub mod reader;
pub mod source;
// 公开导出这些模块里的结构体，方便外部调用
pub use buffer::{LatestSample, SampleBuffer, SampleWriter, WindowFrame};
pub use error::{BufferError, ReaderError, Result, ValidationError};
pub use reader::{Capture, CapturedSample, Reader};
pub use source::{Acquired, DeviceHandle, ManualSource, Sample, SampleSource, StreamFormat, StreamRequest};
