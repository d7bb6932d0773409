use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use crate::drivers::source::negotiate_channels;
use crate::drivers::{
    Acquired, ReaderError, Result, Sample, SampleSource, StreamFormat, StreamRequest,
};
use crate::pacing::{Clock, Pacer};

/// Replays a CSV recording (one row per sample, one column per channel).
///
/// An optional leading `# sample_rate: <hz>` comment gives the recorded
/// rate; rows are linearly resampled when it differs from the stream rate.
/// A non-numeric first row is treated as a header.
pub struct ReplaySource {
    path: PathBuf,
    rate_override: Option<f32>,
    clock: Arc<dyn Clock>,
    pacer: Option<Pacer>,
    rows: Vec<Vec<f32>>,
    n_channel: usize,
    position: f64,
    step: f64,
}

impl ReplaySource {
    pub fn new(path: PathBuf, rate_override: Option<f32>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path,
            rate_override,
            clock,
            pacer: None,
            rows: Vec::new(),
            n_channel: 0,
            position: 0.0,
            step: 1.0,
        }
    }

    fn unavailable(&self, reason: impl ToString) -> ReaderError {
        ReaderError::unavailable(format!("file {}", self.path.display()), reason)
    }

    fn interpolate(&self) -> Vec<f32> {
        let last = self.rows.len() - 1;
        let i = (self.position.floor() as usize).min(last);
        let frac = (self.position - i as f64) as f32;
        let lower = &self.rows[i];
        if frac == 0.0 || i == last {
            return lower[..self.n_channel].to_vec();
        }
        let upper = &self.rows[i + 1];
        (0..self.n_channel)
            .map(|ch| lower[ch] + (upper[ch] - lower[ch]) * frac)
            .collect()
    }
}

/// Reads the `# sample_rate:` comment, if any, among the leading comments.
fn recorded_rate(text: &str) -> Option<f32> {
    text.lines()
        .map(str::trim)
        .take_while(|line| line.starts_with('#') || line.is_empty())
        .filter_map(|line| line.trim_start_matches('#').trim().strip_prefix("sample_rate:"))
        .find_map(|rate| rate.trim().parse().ok())
}

fn parse_rows(text: &str) -> std::result::Result<Vec<Vec<f32>>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| e.to_string())?;
        let parsed: std::result::Result<Vec<f32>, _> =
            record.iter().map(|field| field.parse::<f32>()).collect();
        match parsed {
            Ok(row) => rows.push(row),
            Err(_) if line == 0 => continue,
            Err(e) => return Err(format!("row {}: {e}", line + 1)),
        }
    }
    Ok(rows)
}

fn load(path: &Path) -> std::result::Result<(Vec<Vec<f32>>, Option<f32>), String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let rows = parse_rows(&text)?;
    if rows.is_empty() {
        return Err("no samples".to_owned());
    }
    Ok((rows, recorded_rate(&text)))
}

impl SampleSource for ReplaySource {
    fn name(&self) -> &str {
        "file"
    }

    fn open(&mut self, request: &StreamRequest) -> Result<StreamFormat> {
        let (rows, comment_rate) = load(&self.path).map_err(|e| self.unavailable(e))?;
        let columns = rows.iter().map(Vec::len).min().unwrap_or(0);
        let n_channel = negotiate_channels(self.name(), request, columns)?;
        let recorded = self
            .rate_override
            .or(comment_rate)
            .filter(|rate| *rate > 0.0)
            .unwrap_or(request.sample_rate);
        if recorded != request.sample_rate {
            info!(
                "{}: resampling {recorded} Hz recording to {} Hz",
                self.path.display(),
                request.sample_rate
            );
        }
        self.step = f64::from(recorded) / f64::from(request.sample_rate);
        self.position = 0.0;
        self.rows = rows;
        self.n_channel = n_channel;
        self.pacer = Some(Pacer::from_rate(self.clock.clone(), request.sample_rate));
        Ok(StreamFormat {
            n_channel,
            sample_rate: request.sample_rate,
            label: format!("file {}", self.path.display()),
        })
    }

    fn produce(&mut self) -> Result<Acquired> {
        if self.rows.is_empty() || self.position > (self.rows.len() - 1) as f64 {
            return Ok(Acquired::Exhausted);
        }
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.wait();
        }
        let values = self.interpolate();
        self.position += self.step;
        Ok(Acquired::Sample(Sample::new(values)))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::pacing::ManualClock;

    fn csv_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn drain(source: &mut ReplaySource) -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        loop {
            match source.produce().unwrap() {
                Acquired::Sample(sample) => out.push(sample.values),
                Acquired::Exhausted => return out,
                Acquired::Skip => {}
            }
        }
    }

    #[test]
    fn header_and_rate_comment_are_honoured() {
        let file = csv_file("# sample_rate: 500\nFp1,Fp2\n0,10\n1,11\n2,12\n3,13\n4,14\n");
        let mut source = ReplaySource::new(file.path().to_path_buf(), None, Arc::new(ManualClock::new()));
        let format = source
            .open(&StreamRequest {
                n_channel: 2,
                sample_rate: 250.0,
            })
            .unwrap();
        assert_eq!(format.n_channel, 2);
        assert_eq!(
            drain(&mut source),
            vec![vec![0.0, 10.0], vec![2.0, 12.0], vec![4.0, 14.0]]
        );
    }

    #[test]
    fn upsampling_interpolates_between_rows() {
        let file = csv_file("0\n2\n");
        let mut source = ReplaySource::new(
            file.path().to_path_buf(),
            Some(125.0),
            Arc::new(ManualClock::new()),
        );
        source
            .open(&StreamRequest {
                n_channel: 1,
                sample_rate: 250.0,
            })
            .unwrap();
        assert_eq!(drain(&mut source), vec![vec![0.0], vec![1.0], vec![2.0]]);
    }

    #[test]
    fn narrow_file_shrinks_channel_count() {
        let file = csv_file("1,2,3\n4,5,6\n");
        let mut source = ReplaySource::new(file.path().to_path_buf(), None, Arc::new(ManualClock::new()));
        let format = source
            .open(&StreamRequest {
                n_channel: 8,
                sample_rate: 250.0,
            })
            .unwrap();
        assert_eq!(format.n_channel, 3);
        assert_eq!(drain(&mut source).len(), 2);
    }

    #[test]
    fn malformed_or_missing_file_is_unavailable() {
        let file = csv_file("1,2\n3,oops\n");
        let request = StreamRequest {
            n_channel: 2,
            sample_rate: 250.0,
        };
        let mut source = ReplaySource::new(file.path().to_path_buf(), None, Arc::new(ManualClock::new()));
        assert!(matches!(
            source.open(&request),
            Err(ReaderError::SourceUnavailable { .. })
        ));
        let mut missing = ReplaySource::new(
            PathBuf::from("/nonexistent/recording.csv"),
            None,
            Arc::new(ManualClock::new()),
        );
        assert!(matches!(
            missing.open(&request),
            Err(ReaderError::SourceUnavailable { .. })
        ));
    }
}
