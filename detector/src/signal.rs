//! Waveform preprocessing: cosine taper, demean, Butterworth bandpass.
//!
//! The bandpass is an SOS cascade: order/2 Butterworth high-pass biquads at
//! the low corner followed by order/2 low-pass biquads at the high corner,
//! run zero-phase (forward-backward) by default. Section Q values come from
//! the Butterworth pole angles.

use std::f64::consts::PI;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("require 0 < fmin < fmax < fs/2 (got fmin={fmin}, fmax={fmax}, fs={fs})")]
    InvalidBand { fmin: f64, fmax: f64, fs: f64 },
}

// ── Taper and demean ──────────────────────────────────────────────────────────

/// Cosine taper over the first and last `floor(frac * n)` samples.
/// `frac <= 0` (or a zero-length ramp) returns an unchanged copy.
pub fn taper_cosine(y: &[f64], frac: f64) -> Vec<f64> {
    let n = y.len();
    if n == 0 || frac <= 0.0 {
        return y.to_vec();
    }
    let m = (frac * n as f64).floor() as usize;
    if m == 0 {
        return y.to_vec();
    }

    let mut weights = vec![1.0; n];
    for k in 0..m {
        weights[k] = 0.5 * (1.0 - (PI * (k + 1) as f64 / m as f64).cos());
    }
    for k in 0..m {
        weights[n - m + k] = 0.5 * (1.0 - (PI * (m - k) as f64 / m as f64).cos());
    }

    y.iter().zip(&weights).map(|(v, w)| v * w).collect()
}

/// Subtract the arithmetic mean, ignoring NaNs.
pub fn demean(y: &mut [f64]) {
    let mut sum = 0.0;
    let mut count = 0usize;
    for &v in y.iter() {
        if !v.is_nan() {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        return;
    }
    let mean = sum / count as f64;
    for v in y.iter_mut() {
        *v -= mean;
    }
}

// ── Butterworth SOS cascade ───────────────────────────────────────────────────

/// One second-order section, normalized so `a0 == 1`.
#[derive(Debug, Clone, Copy)]
pub struct Sos {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

fn lowpass_section(freq: f64, fs: f64, q: f64) -> Sos {
    let w0 = 2.0 * PI * freq / fs;
    let (sin_w0, cos_w0) = w0.sin_cos();
    let alpha = sin_w0 / (2.0 * q);
    let a0 = 1.0 + alpha;
    Sos {
        b0: (1.0 - cos_w0) / 2.0 / a0,
        b1: (1.0 - cos_w0) / a0,
        b2: (1.0 - cos_w0) / 2.0 / a0,
        a1: -2.0 * cos_w0 / a0,
        a2: (1.0 - alpha) / a0,
    }
}

fn highpass_section(freq: f64, fs: f64, q: f64) -> Sos {
    let w0 = 2.0 * PI * freq / fs;
    let (sin_w0, cos_w0) = w0.sin_cos();
    let alpha = sin_w0 / (2.0 * q);
    let a0 = 1.0 + alpha;
    Sos {
        b0: (1.0 + cos_w0) / 2.0 / a0,
        b1: -(1.0 + cos_w0) / a0,
        b2: (1.0 + cos_w0) / 2.0 / a0,
        a1: -2.0 * cos_w0 / a0,
        a2: (1.0 - alpha) / a0,
    }
}

/// Design the bandpass cascade. Corners must satisfy
/// `0 < fmin < fmax < fs/2`; `order` is the Butterworth order of each edge
/// (even, 4 by default throughout the detector).
pub fn design_bandpass(
    order: usize,
    fmin: f64,
    fmax: f64,
    fs: f64,
) -> Result<Vec<Sos>, SignalError> {
    let nyquist = 0.5 * fs;
    if !(0.0 < fmin && fmin < fmax && fmax < nyquist) {
        return Err(SignalError::InvalidBand { fmin, fmax, fs });
    }

    let pairs = (order / 2).max(1);
    let mut sos = Vec::with_capacity(pairs * 2);
    for k in 0..pairs {
        // Butterworth pole angle for pair k of a 2*pairs-pole edge.
        let theta = PI * (2 * k + 1) as f64 / (2.0 * (2 * pairs) as f64);
        let q = 1.0 / (2.0 * theta.sin());
        sos.push(highpass_section(fmin, fs, q));
        sos.push(lowpass_section(fmax, fs, q));
    }
    Ok(sos)
}

/// Run the cascade over `y` in one direction.
pub fn sosfilt(sos: &[Sos], y: &[f64]) -> Vec<f64> {
    let mut out = y.to_vec();
    for section in sos {
        let mut z1 = 0.0;
        let mut z2 = 0.0;
        for value in out.iter_mut() {
            let x = *value;
            let filtered = section.b0 * x + z1;
            z1 = section.b1 * x - section.a1 * filtered + z2;
            z2 = section.b2 * x - section.a2 * filtered;
            *value = filtered;
        }
    }
    out
}

/// Butterworth bandpass. `zero_phase` runs the cascade forward and backward
/// for zero group delay.
pub fn bandpass_filter(
    y: &[f64],
    fs: f64,
    fmin: f64,
    fmax: f64,
    order: usize,
    zero_phase: bool,
    apply_demean: bool,
) -> Result<Vec<f64>, SignalError> {
    let sos = design_bandpass(order, fmin, fmax, fs)?;

    let mut data = y.to_vec();
    if apply_demean {
        demean(&mut data);
    }

    let forward = sosfilt(&sos, &data);
    if !zero_phase {
        return Ok(forward);
    }

    let mut reversed: Vec<f64> = forward.into_iter().rev().collect();
    reversed = sosfilt(&sos, &reversed);
    reversed.reverse();
    Ok(reversed)
}

/// Standard front-end chain ahead of the STA/LTA: taper, demean, bandpass.
pub fn preprocess_trace(y: &[f64], fs: f64, fmin: f64, fmax: f64) -> Result<Vec<f64>, SignalError> {
    let tapered = taper_cosine(y, 0.05);
    bandpass_filter(&tapered, fs, fmin, fmax, 4, true, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rms(y: &[f64]) -> f64 {
        (y.iter().map(|v| v * v).sum::<f64>() / y.len() as f64).sqrt()
    }

    #[test]
    fn taper_zero_fraction_is_identity() {
        let y: Vec<f64> = (0..50).map(|i| f64::from(i) * 0.3 - 2.0).collect();
        assert_eq!(taper_cosine(&y, 0.0), y);
        assert_eq!(taper_cosine(&y, -1.0), y);
        // frac small enough that floor(frac * n) == 0
        assert_eq!(taper_cosine(&y, 0.01), y);
    }

    #[test]
    fn taper_ramps_the_edges_only() {
        let y = vec![1.0; 100];
        let tapered = taper_cosine(&y, 0.1);
        assert!(tapered[0] < 0.1);
        assert!(tapered[99] < 0.1);
        assert_eq!(tapered[50], 1.0);
        // ramp is symmetric
        for k in 0..10 {
            assert!((tapered[k] - tapered[99 - k]).abs() < 1e-12);
        }
    }

    #[test]
    fn demean_ignores_nans() {
        let mut y = vec![1.0, 3.0, f64::NAN, 5.0];
        demean(&mut y);
        assert!((y[0] - (-2.0)).abs() < 1e-12);
        assert!((y[3] - 2.0).abs() < 1e-12);
        assert!(y[2].is_nan());
    }

    #[test]
    fn bandpass_rejects_bad_corners() {
        let y = vec![0.0; 64];
        assert!(bandpass_filter(&y, 100.0, 0.0, 10.0, 4, true, true).is_err());
        assert!(bandpass_filter(&y, 100.0, 10.0, 1.0, 4, true, true).is_err());
        assert!(bandpass_filter(&y, 100.0, 1.0, 50.0, 4, true, true).is_err());
        assert!(bandpass_filter(&y, 100.0, 1.0, 60.0, 4, true, true).is_err());
        assert!(bandpass_filter(&y, 100.0, -1.0, 10.0, 4, true, true).is_err());
    }

    #[test]
    fn bandpass_of_zeros_is_zeros() {
        let y = vec![0.0; 256];
        let out = bandpass_filter(&y, 100.0, 0.1, 10.0, 4, true, true).unwrap();
        assert!(out.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn bandpass_keeps_in_band_energy() {
        // 2 Hz sine at fs=50 through a 0.5-10 Hz band survives mostly intact.
        let fs = 50.0;
        let y: Vec<f64> = (0..1000)
            .map(|i| (2.0 * PI * 2.0 * f64::from(i) / fs).sin())
            .collect();
        let out = bandpass_filter(&y, fs, 0.5, 10.0, 4, true, true).unwrap();
        // compare away from the edges
        assert!(rms(&out[200..800]) > 0.7 * rms(&y[200..800]));
    }

    #[test]
    fn bandpass_removes_dc() {
        let fs = 50.0;
        // DC offset plus in-band sine; demean disabled so the filter itself
        // must reject the offset.
        let y: Vec<f64> = (0..1000)
            .map(|i| 5.0 + (2.0 * PI * 2.0 * f64::from(i) / fs).sin())
            .collect();
        let out = bandpass_filter(&y, fs, 0.5, 10.0, 4, true, false).unwrap();
        let mean_mid = out[200..800].iter().sum::<f64>() / 600.0;
        assert!(mean_mid.abs() < 0.05);
    }
}
