use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::drivers::source::negotiate_channels;
use crate::drivers::{
    Acquired, ReaderError, Result, Sample, SampleSource, StreamFormat, StreamRequest,
};
use crate::pacing::{Clock, Deadline};

/// How long `open` waits for the first line that fixes the channel count.
const FIRST_LINE_WAIT: Duration = Duration::from_secs(3);
const FIRST_LINE_POLL: Duration = Duration::from_millis(1);

/// Comma separated text samples over a UART, one sample per line.
pub struct SerialSource {
    port: Option<String>,
    baud_rate: u32,
    timeout_ms: u64,
    reader: Option<Box<dyn BufRead + Send>>,
    line: Vec<u8>,
    first: Option<Vec<f32>>,
    n_channel: usize,
    clock: Arc<dyn Clock>,
}

impl SerialSource {
    pub fn new(port: Option<String>, baud_rate: u32, timeout_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            port,
            baud_rate,
            timeout_ms,
            reader: None,
            line: Vec::new(),
            first: None,
            n_channel: 0,
            clock,
        }
    }

    /// Reads lines from an already open byte stream instead of a port.
    pub fn from_reader(reader: impl Read + Send + 'static, clock: Arc<dyn Clock>) -> Self {
        let mut source = Self::new(Some("stream".to_owned()), 0, 0, clock);
        source.reader = Some(Box::new(BufReader::new(reader)));
        source
    }

    fn label(&self) -> String {
        format!("serial {}", self.port.as_deref().unwrap_or("auto"))
    }

    fn open_port(&mut self) -> Result<()> {
        let name = match &self.port {
            Some(name) => name.clone(),
            None => {
                let ports = serialport::available_ports()
                    .map_err(|e| ReaderError::unavailable("serial", e))?;
                let first = ports
                    .into_iter()
                    .next()
                    .ok_or_else(|| ReaderError::unavailable("serial", "no serial port found"))?;
                info!("serial port auto-selected: {}", first.port_name);
                self.port = Some(first.port_name.clone());
                first.port_name
            }
        };
        let port = serialport::new(&name, self.baud_rate)
            .timeout(Duration::from_millis(self.timeout_ms.max(1)))
            .open()
            .map_err(|e| ReaderError::unavailable(self.label(), e))?;
        self.reader = Some(Box::new(BufReader::new(port)));
        Ok(())
    }

    /// One complete line, `None` when the read timed out first. Partial
    /// lines are kept for the next call.
    fn next_line(&mut self) -> Result<Option<String>> {
        let label = self.label();
        let Some(reader) = self.reader.as_mut() else {
            return Err(ReaderError::NotStarted);
        };
        match reader.read_until(b'\n', &mut self.line) {
            Ok(0) => Err(ReaderError::unavailable(label, "port closed")),
            Ok(_) if self.line.ends_with(b"\n") => {
                let text = String::from_utf8_lossy(&self.line).trim().to_owned();
                self.line.clear();
                Ok(Some(text))
            }
            Ok(_) => Ok(None),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(None)
            }
            Err(e) => Err(ReaderError::transient("serial read", e)),
        }
    }
}

pub(crate) fn parse_line(line: &str) -> Option<Vec<f32>> {
    if line.is_empty() {
        return None;
    }
    line.split(',')
        .map(|field| field.trim().parse::<f32>().ok())
        .collect()
}

impl SampleSource for SerialSource {
    fn name(&self) -> &str {
        "serial"
    }

    fn open(&mut self, request: &StreamRequest) -> Result<StreamFormat> {
        if self.reader.is_none() {
            self.open_port()?;
        }
        let clock = self.clock.clone();
        let deadline = Deadline::after(&*clock, FIRST_LINE_WAIT);
        let first = loop {
            match self.next_line()? {
                Some(line) => {
                    if let Some(values) = parse_line(&line) {
                        break values;
                    }
                }
                None => deadline.pause(FIRST_LINE_POLL),
            }
            if deadline.expired() {
                return Err(ReaderError::unavailable(self.label(), "no sample line received"));
            }
        };
        self.n_channel = negotiate_channels(self.name(), request, first.len())?;
        self.first = Some(first);
        Ok(StreamFormat {
            n_channel: self.n_channel,
            sample_rate: request.sample_rate,
            label: self.label(),
        })
    }

    fn produce(&mut self) -> Result<Acquired> {
        let values = match self.first.take() {
            Some(values) => values,
            None => match self.next_line()? {
                Some(line) => match parse_line(&line) {
                    Some(values) => values,
                    None => {
                        debug!("serial: ignoring line {line:?}");
                        return Ok(Acquired::Skip);
                    }
                },
                None => return Ok(Acquired::Skip),
            },
        };
        if values.len() < self.n_channel {
            return Err(ReaderError::transient(
                "serial read",
                format!("line has {} values, expected {}", values.len(), self.n_channel),
            ));
        }
        Ok(Acquired::Sample(Sample::new(values[..self.n_channel].to_vec())))
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::pacing::ManualClock;

    /// A port that never delivers anything before its read timeout.
    struct SilentPort;

    impl Read for SilentPort {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(ErrorKind::TimedOut.into())
        }
    }

    #[test]
    fn lines_parse_as_comma_separated_floats() {
        assert_eq!(parse_line("1.5, -2,3"), Some(vec![1.5, -2.0, 3.0]));
        assert_eq!(parse_line("boot ok"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn first_line_fixes_channel_count() {
        let data = "garbage\n0.1,0.2,0.3\n0.4,0.5,0.6\nnoise\n0.7\n";
        let mut source = SerialSource::from_reader(
            Cursor::new(data.as_bytes().to_vec()),
            Arc::new(ManualClock::new()),
        );
        let format = source
            .open(&StreamRequest {
                n_channel: 8,
                sample_rate: 250.0,
            })
            .unwrap();
        assert_eq!(format.n_channel, 3);
        assert_eq!(
            source.produce().unwrap(),
            Acquired::Sample(Sample::new(vec![0.1, 0.2, 0.3]))
        );
        assert_eq!(
            source.produce().unwrap(),
            Acquired::Sample(Sample::new(vec![0.4, 0.5, 0.6]))
        );
        assert_eq!(source.produce().unwrap(), Acquired::Skip);
        assert!(source.produce().unwrap_err().is_transient());
        assert!(matches!(
            source.produce(),
            Err(ReaderError::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn silent_port_gives_up_after_first_line_wait() {
        let clock = Arc::new(ManualClock::new());
        let mut source = SerialSource::from_reader(SilentPort, clock.clone());
        let outcome = source.open(&StreamRequest {
            n_channel: 2,
            sample_rate: 250.0,
        });
        assert!(matches!(outcome, Err(ReaderError::SourceUnavailable { .. })));
        assert_eq!(clock.elapsed(), FIRST_LINE_WAIT);
    }
}
