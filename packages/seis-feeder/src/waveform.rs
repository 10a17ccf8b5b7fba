//! waveform.rs — synthetic ground-motion generation
//!
//! A slow sine carrier plus Gaussian noise stands in for ambient ground
//! motion; a Ricker wavelet burst stands in for an event arrival. Chunks
//! are generated off one continuous sample counter so the published stream
//! stitches seamlessly in the detector's rolling buffer.

use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

/// Ricker (Mexican-hat) wavelet sample, centered mid-burst.
///
/// `rel_sample` is the offset into the burst, `total_samples` the burst
/// length; outside the burst the value is zero.
pub fn ricker(rel_sample: i64, total_samples: u64, samprate: f64, frequency: f64) -> f64 {
    if rel_sample < 0 || rel_sample as u64 >= total_samples {
        return 0.0;
    }
    let center = total_samples as f64 / 2.0;
    let t = (rel_sample as f64 - center) / samprate;
    let arg = PI * frequency * t;
    let arg2 = arg * arg;
    (1.0 - 2.0 * arg2) * (-arg2).exp()
}

/// One station's continuous carrier + noise generator.
pub struct CarrierState {
    amplitude: f64,
    carrier_hz: f64,
    samprate: f64,
    noise: Option<Normal<f64>>,
}

impl CarrierState {
    pub fn new(amplitude: f64, carrier_hz: f64, samprate: f64, noise_sigma: f64) -> Self {
        let noise = if noise_sigma > 0.0 {
            Some(Normal::new(0.0, noise_sigma).expect("sigma is finite and positive"))
        } else {
            None
        };
        Self {
            amplitude,
            carrier_hz,
            samprate,
            noise,
        }
    }

    /// Carrier sample at absolute sample index `n`.
    pub fn sample(&self, n: u64, rng: &mut StdRng) -> f64 {
        let t = n as f64 / self.samprate;
        let mut v = self.amplitude * (2.0 * PI * self.carrier_hz * t).sin();
        if let Some(noise) = &self.noise {
            v += noise.sample(rng);
        }
        v
    }
}

/// An event burst in progress: Ricker wavelet with a per-station moveout.
pub struct ActiveEvent {
    /// Absolute sample index where station 0 sees the arrival.
    pub start_sample: u64,
    pub total_samples: u64,
    pub frequency: f64,
    pub amplitude: f64,
    /// Extra delay applied per station index, in samples.
    pub moveout_samples: u64,
}

impl ActiveEvent {
    pub fn sample(&self, n: u64, station_idx: usize, samprate: f64) -> f64 {
        let onset = self.start_sample + self.moveout_samples * station_idx as u64;
        let rel = n as i64 - onset as i64;
        self.amplitude * ricker(rel, self.total_samples, samprate, self.frequency)
    }

    /// Whether every station (of `n_stations`) is past the burst by `n`.
    pub fn finished(&self, n: u64, n_stations: usize) -> bool {
        let last_onset = self.start_sample + self.moveout_samples * n_stations.saturating_sub(1) as u64;
        n >= last_onset + self.total_samples
    }
}
