//! Phase picker contract and the classical envelope backend.
//!
//! The detector core only depends on the `PhasePicker` contract: a fixed
//! input length plus `classify` over an aligned multi-channel window. The
//! output is filtered at this boundary — only P/S picks with a usable time
//! survive, and the pick score is the classifier's peak value when present.
//!
//! The shipped backend is a characteristic-function picker: channels are
//! normalized, a joint energy envelope drives event detection, and P/S
//! onsets are picked from the vertical / horizontal ratios inside each
//! detection window.

use seis_types::Phase;

use crate::dedup::Onset;
use crate::signal::demean;
use crate::trigger::{classic_sta_lta, trigger_onset};
use crate::window::MultiChannelWindow;

// ── Contract ──────────────────────────────────────────────────────────────────

/// Raw classifier output, before the contract filter.
#[derive(Debug, Clone, Default)]
pub struct ClassifyOutput {
    pub picks: Vec<RawPick>,
    pub detections: Vec<RawDetection>,
}

/// A pick exactly as the classifier produced it. Anything may be missing.
#[derive(Debug, Clone)]
pub struct RawPick {
    pub phase: String,
    pub peak_time: Option<f64>,
    pub start_time: Option<f64>,
    pub peak_value: Option<f64>,
}

/// An event-window detection (absolute seconds).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub start_time: f64,
    pub end_time: f64,
}

/// Contract every picker backend satisfies.
pub trait PhasePicker {
    /// Fixed window length the model expects.
    fn input_samples(&self) -> usize;
    fn classify(&self, window: &MultiChannelWindow) -> ClassifyOutput;
}

/// A pick that survived the contract filter.
#[derive(Debug, Clone, PartialEq)]
pub struct PhasePick {
    /// Onset (peak) time, seconds since epoch.
    pub t: f64,
    pub phase: Phase,
    pub score: Option<f64>,
}

impl Onset for PhasePick {
    fn onset(&self) -> f64 {
        self.t
    }
}

/// Apply the contract: keep picks with `phase ∈ {P, S}` and a peak-or-start
/// time; everything else is silently dropped. Both lists come back sorted.
pub fn filter_classifier_output(raw: ClassifyOutput) -> (Vec<PhasePick>, Vec<RawDetection>) {
    let mut picks: Vec<PhasePick> = raw
        .picks
        .into_iter()
        .filter_map(|pick| {
            let phase = Phase::from_label(&pick.phase)?;
            let t = pick.peak_time.or(pick.start_time)?;
            Some(PhasePick {
                t,
                phase,
                score: pick.peak_value,
            })
        })
        .collect();
    picks.sort_by(|a, b| a.t.total_cmp(&b.t));

    let mut detections = raw.detections;
    detections.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
    (picks, detections)
}

// ── Envelope backend ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormMode {
    Std,
    Max,
}

#[derive(Debug, Clone)]
pub struct EnvelopePickerConfig {
    pub window_samples: usize,
    /// STA/LTA ratio on the joint envelope that opens a detection.
    pub detection_on: f64,
    pub detection_off: f64,
    pub sta_seconds: f64,
    pub lta_seconds: f64,
    pub norm_mode: NormMode,
}

impl Default for EnvelopePickerConfig {
    fn default() -> Self {
        Self {
            window_samples: 6000,
            detection_on: 3.0,
            detection_off: 1.5,
            sta_seconds: 1.0,
            lta_seconds: 10.0,
            norm_mode: NormMode::Std,
        }
    }
}

pub struct EnvelopePicker {
    config: EnvelopePickerConfig,
}

impl EnvelopePicker {
    pub fn new(config: EnvelopePickerConfig) -> Self {
        Self { config }
    }

    fn normalize(&self, row: &[f64]) -> Vec<f64> {
        let mut out = row.to_vec();
        demean(&mut out);
        let scale = match self.config.norm_mode {
            NormMode::Std => {
                (out.iter().map(|v| v * v).sum::<f64>() / out.len().max(1) as f64).sqrt()
            }
            NormMode::Max => out.iter().fold(0.0f64, |acc, v| acc.max(v.abs())),
        };
        if scale > 0.0 {
            for v in out.iter_mut() {
                *v /= scale;
            }
        }
        out
    }

    /// Monotone squash of an STA/LTA ratio into [0, 1); 0.5 at the
    /// detection threshold.
    fn score(&self, ratio: f64) -> f64 {
        (ratio / (ratio + self.config.detection_on)).clamp(0.0, 1.0)
    }
}

fn argmax_in(values: &[f64], from: usize, to: usize) -> Option<(usize, f64)> {
    let to = to.min(values.len().saturating_sub(1));
    if from > to {
        return None;
    }
    let mut best = (from, values[from]);
    for (idx, &v) in values.iter().enumerate().take(to + 1).skip(from) {
        if v > best.1 {
            best = (idx, v);
        }
    }
    Some(best)
}

impl PhasePicker for EnvelopePicker {
    fn input_samples(&self) -> usize {
        self.config.window_samples
    }

    fn classify(&self, window: &MultiChannelWindow) -> ClassifyOutput {
        let n = window.window_samples();
        if n == 0 || window.data.is_empty() {
            return ClassifyOutput::default();
        }

        let normalized: Vec<Vec<f64>> =
            window.data.iter().map(|row| self.normalize(row)).collect();

        // Joint energy envelope across channels.
        let mut envelope = vec![0.0; n];
        for row in &normalized {
            for (e, v) in envelope.iter_mut().zip(row) {
                *e += v * v;
            }
        }
        let channels = normalized.len() as f64;
        for e in envelope.iter_mut() {
            *e = (*e / channels).sqrt();
        }

        let nsta = (window.samprate * self.config.sta_seconds).round() as usize;
        let nlta = (window.samprate * self.config.lta_seconds).round() as usize;
        let cft = classic_sta_lta(&envelope, nsta, nlta);
        let onsets = trigger_onset(&cft, self.config.detection_on, self.config.detection_off);

        // Vertical channel carries the P energy; fall back to channel 0.
        let vertical = window
            .channels
            .iter()
            .position(|sid| sid.ends_with('Z'))
            .unwrap_or(0);
        let cft_z = classic_sta_lta(&normalized[vertical], nsta, nlta);

        let horizontals: Vec<usize> = (0..normalized.len()).filter(|&i| i != vertical).collect();
        let cft_h = if horizontals.is_empty() {
            None
        } else {
            let mut h_env = vec![0.0; n];
            for &idx in &horizontals {
                for (e, v) in h_env.iter_mut().zip(&normalized[idx]) {
                    *e += v * v;
                }
            }
            for e in h_env.iter_mut() {
                *e = (*e / horizontals.len() as f64).sqrt();
            }
            Some(classic_sta_lta(&h_env, nsta, nlta))
        };

        let mut out = ClassifyOutput::default();
        for (start_idx, end_idx) in onsets {
            out.detections.push(RawDetection {
                start_time: window.sample_time(start_idx),
                end_time: window.sample_time(end_idx),
            });

            let Some((p_idx, p_ratio)) = argmax_in(&cft_z, start_idx, end_idx) else {
                continue;
            };
            out.picks.push(RawPick {
                phase: "P".to_string(),
                peak_time: Some(window.sample_time(p_idx)),
                start_time: Some(window.sample_time(start_idx)),
                peak_value: Some(self.score(p_ratio)),
            });

            // S arrives after P on the horizontals; only emit when the
            // horizontal ratio clears the detection threshold on its own.
            if let Some(cft_h) = &cft_h {
                if let Some((s_idx, s_ratio)) = argmax_in(cft_h, p_idx + 1, end_idx) {
                    if s_ratio >= self.config.detection_on {
                        out.picks.push(RawPick {
                            phase: "S".to_string(),
                            peak_time: Some(window.sample_time(s_idx)),
                            start_time: None,
                            peak_value: Some(self.score(s_ratio)),
                        });
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::MultiChannelWindow;

    fn synthetic_window(n: usize, fs: f64, burst_at: usize) -> MultiChannelWindow {
        let trace = |amp: f64, freq: f64| -> Vec<f64> {
            (0..n)
                .map(|i| {
                    let t = i as f64 / fs;
                    let mut v = 0.02 * (2.0 * std::f64::consts::PI * 1.0 * t).sin();
                    if i >= burst_at && i < burst_at + 300 {
                        v += amp * (2.0 * std::f64::consts::PI * freq * t).sin();
                    }
                    v
                })
                .collect()
        };
        MultiChannelWindow {
            channels: vec![
                "FDSN:XX_TEST__H_H_E".into(),
                "FDSN:XX_TEST__H_H_N".into(),
                "FDSN:XX_TEST__H_H_Z".into(),
            ],
            data: vec![trace(1.0, 4.0), trace(1.0, 4.0), trace(2.0, 6.0)],
            samprate: fs,
            common_end: 1000.0,
        }
    }

    #[test]
    fn contract_filter_drops_bad_picks() {
        let raw = ClassifyOutput {
            picks: vec![
                RawPick {
                    phase: "P".into(),
                    peak_time: Some(10.0),
                    start_time: None,
                    peak_value: Some(0.9),
                },
                RawPick {
                    phase: "Pn".into(),
                    peak_time: Some(11.0),
                    start_time: None,
                    peak_value: Some(0.9),
                },
                RawPick {
                    phase: "S".into(),
                    peak_time: None,
                    start_time: None,
                    peak_value: Some(0.9),
                },
                RawPick {
                    phase: "s".into(),
                    peak_time: None,
                    start_time: Some(5.0),
                    peak_value: None,
                },
            ],
            detections: vec![],
        };
        let (picks, _) = filter_classifier_output(raw);
        assert_eq!(picks.len(), 2);
        // sorted by time; the start_time fallback is used for the S pick
        assert_eq!(picks[0], PhasePick { t: 5.0, phase: Phase::S, score: None });
        assert_eq!(picks[1].phase, Phase::P);
        assert_eq!(picks[1].score, Some(0.9));
    }

    #[test]
    fn picks_a_p_onset_near_the_burst() {
        let fs = 50.0;
        let n = 3000;
        let burst_at = 2000;
        let window = synthetic_window(n, fs, burst_at);
        let picker = EnvelopePicker::new(EnvelopePickerConfig {
            window_samples: n,
            ..Default::default()
        });

        let (picks, detections) = filter_classifier_output(picker.classify(&window));
        assert!(!detections.is_empty());
        let p = picks.iter().find(|p| p.phase == Phase::P).unwrap();
        let burst_time = window.sample_time(burst_at);
        assert!((p.t - burst_time).abs() < 3.0);
        let score = p.score.unwrap();
        assert!((0.0..=1.0).contains(&score));
        assert!(score >= 0.5);
    }

    #[test]
    fn quiet_window_yields_nothing() {
        let fs = 50.0;
        let n = 3000;
        let data: Vec<f64> = (0..n)
            .map(|i| 0.02 * (2.0 * std::f64::consts::PI * i as f64 / fs).sin())
            .collect();
        let window = MultiChannelWindow {
            channels: vec!["FDSN:XX_TEST__H_H_Z".into()],
            data: vec![data],
            samprate: fs,
            common_end: 0.0,
        };
        let picker = EnvelopePicker::new(EnvelopePickerConfig {
            window_samples: n,
            ..Default::default()
        });
        let out = picker.classify(&window);
        assert!(out.picks.is_empty());
        assert!(out.detections.is_empty());
    }
}
