// src/main.rs
use std::path::PathBuf;
use std::time::{Duration, Instant};
use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use neuroacq::{Reader, ReaderOptions};
/// Streams samples from one source into a sample buffer and reports on it.
#[derive(Parser, Debug)]
#[command(name = "neuroacq", version)]
struct Cli {
    /// JSON reader options; a synthetic generator when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// How long to stream, in seconds
    #[arg(short, long, default_value_t = 5.0)]
    seconds: f32,
    /// Report interval in milliseconds
    #[arg(short, long, default_value_t = 500)]
    report_every: u64,
}
fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let options = match &cli.config {
        Some(path) => ReaderOptions::from_json_file(path)?,
        None => ReaderOptions::default(),
    };
    let reader = Reader::new();
    reader
        .start(&options)
        .with_context(|| format!("failed to start reader {}", options.name))?;
    info!(
        "{}: {} channels at {} Hz from {}",
        reader.name(),
        reader.n_channel(),
        reader.sample_rate(),
        reader.input_source()
    );
    let run_for = Duration::from_secs_f32(cli.seconds.max(0.0));
    let every = Duration::from_millis(cli.report_every.max(1));
    let started = Instant::now();
    while started.elapsed() < run_for {
        std::thread::sleep(every);
        if !reader.is_streaming() {
            if let Some(e) = reader.last_error() {
                warn!("{}: stream stopped: {e}", reader.name());
            } else {
                info!("{}: stream ended", reader.name());
            }
            break;
        }
        let latest = reader.read_latest_sample().context("failed to read latest sample")?;
        info!(
            "t={:.3}s{} values={:?} rate={:.1} Hz written={}",
            latest.timestamp,
            if latest.stale { " (stale)" } else { "" },
            latest.values.to_vec(),
            reader.realtime_sample_rate(),
            reader.samples_written()
        );
    }
    reader.close();
    Ok(())
}
