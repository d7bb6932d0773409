use std::f32::consts::{FRAC_PI_4, TAU};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Waveform;
use crate::drivers::{Acquired, Result, Sample, SampleSource, StreamFormat, StreamRequest};
use crate::pacing::{Clock, Pacer};

/// Generator for development without hardware, paced at the nominal rate.
pub struct SyntheticSource {
    waveform: Waveform,
    frequency_hz: f32,
    amplitude: f32,
    rng: StdRng,
    clock: Arc<dyn Clock>,
    pacer: Option<Pacer>,
    n_channel: usize,
    sample_rate: f32,
    tick: u64,
}

impl SyntheticSource {
    pub fn new(
        waveform: Waveform,
        frequency_hz: f32,
        amplitude: f32,
        seed: Option<u64>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            waveform,
            frequency_hz,
            amplitude,
            rng,
            clock,
            pacer: None,
            n_channel: 0,
            sample_rate: 0.0,
            tick: 0,
        }
    }

    fn next_values(&mut self) -> Vec<f32> {
        match self.waveform {
            Waveform::Random => (0..self.n_channel)
                .map(|_| self.rng.gen_range(0.0..0.1))
                .collect(),
            Waveform::Sine => {
                let t = self.tick as f32 / self.sample_rate;
                (0..self.n_channel)
                    .map(|ch| {
                        self.amplitude * (TAU * self.frequency_hz * t + ch as f32 * FRAC_PI_4).sin()
                    })
                    .collect()
            }
        }
    }
}

impl SampleSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn open(&mut self, request: &StreamRequest) -> Result<StreamFormat> {
        self.n_channel = request.n_channel;
        self.sample_rate = request.sample_rate;
        self.tick = 0;
        self.pacer = Some(Pacer::from_rate(self.clock.clone(), request.sample_rate));
        Ok(StreamFormat {
            n_channel: request.n_channel,
            sample_rate: request.sample_rate,
            label: format!("synthetic {:?}", self.waveform).to_lowercase(),
        })
    }

    fn produce(&mut self) -> Result<Acquired> {
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.wait();
        }
        let values = self.next_values();
        self.tick += 1;
        Ok(Acquired::Sample(Sample::new(values)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pacing::ManualClock;

    fn values(acquired: Acquired) -> Vec<f32> {
        match acquired {
            Acquired::Sample(sample) => sample.values,
            other => panic!("expected a sample, got {other:?}"),
        }
    }

    #[test]
    fn random_values_are_paced_and_bounded() {
        let clock = Arc::new(ManualClock::new());
        let mut source = SyntheticSource::new(Waveform::Random, 10.0, 0.1, Some(7), clock.clone());
        let format = source
            .open(&StreamRequest {
                n_channel: 3,
                sample_rate: 250.0,
            })
            .unwrap();
        assert_eq!(format.n_channel, 3);
        for _ in 0..3 {
            let v = values(source.produce().unwrap());
            assert_eq!(v.len(), 3);
            assert!(v.iter().all(|x| (0.0..0.1).contains(x)));
        }
        assert_eq!(clock.elapsed(), Duration::from_millis(8));
    }

    #[test]
    fn sine_is_phase_shifted_per_channel() {
        let clock = Arc::new(ManualClock::new());
        let mut source = SyntheticSource::new(Waveform::Sine, 10.0, 2.0, None, clock);
        source
            .open(&StreamRequest {
                n_channel: 3,
                sample_rate: 1000.0,
            })
            .unwrap();
        let first = values(source.produce().unwrap());
        assert_eq!(first[0], 0.0);
        assert!((first[2] - 2.0).abs() < 1e-5);
        let second = values(source.produce().unwrap());
        assert!(second[0] > 0.0);
    }
}
