//! Classic STA/LTA energy-ratio trigger.

use tracing::{debug, info};

use crate::buffer::TraceSegment;
use crate::dedup::Onset;
use crate::signal::{preprocess_trace, SignalError};

/// One trigger window in absolute seconds since epoch, `t_on <= t_off`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerWindow {
    pub t_on: f64,
    pub t_off: f64,
}

impl Onset for TriggerWindow {
    fn onset(&self) -> f64 {
        self.t_on
    }
}

/// Classic STA/LTA characteristic function: ratio of the trailing
/// mean-square over `nsta` samples to the trailing mean-square over `nlta`
/// samples. The first `nlta - 1` values are zero (LTA not yet populated).
pub fn classic_sta_lta(y: &[f64], nsta: usize, nlta: usize) -> Vec<f64> {
    let n = y.len();
    let mut cft = vec![0.0; n];
    if nsta == 0 || nlta == 0 || nlta > n || nsta > nlta {
        return cft;
    }

    // prefix sums of the squared signal
    let mut energy = Vec::with_capacity(n + 1);
    energy.push(0.0);
    let mut acc = 0.0;
    for &v in y {
        acc += v * v;
        energy.push(acc);
    }

    for i in (nlta - 1)..n {
        let sta = (energy[i + 1] - energy[i + 1 - nsta]) / nsta as f64;
        let lta = (energy[i + 1] - energy[i + 1 - nlta]) / nlta as f64;
        cft[i] = if lta > f64::EPSILON { sta / lta } else { 0.0 };
    }
    cft
}

/// Scan a characteristic function for onset windows: enter at
/// `cft >= trigger_on`, leave at `cft <= trigger_off`. A window still open
/// at the end of the signal closes at the last index.
pub fn trigger_onset(cft: &[f64], trigger_on: f64, trigger_off: f64) -> Vec<(usize, usize)> {
    let mut windows = Vec::new();
    let mut active = false;
    let mut start_idx = 0usize;

    for (idx, &value) in cft.iter().enumerate() {
        if !active && value >= trigger_on {
            active = true;
            start_idx = idx;
        } else if active && value <= trigger_off {
            windows.push((start_idx, idx));
            active = false;
        }
    }
    if active && !cft.is_empty() {
        windows.push((start_idx, cft.len() - 1));
    }
    windows
}

/// Run the STA/LTA front-end over one buffered segment and return trigger
/// windows in absolute seconds.
#[allow(clippy::too_many_arguments)]
pub fn detect_sta_lta(
    segment: &TraceSegment,
    sid: &str,
    fmin: f64,
    fmax: f64,
    sta_seconds: f64,
    lta_seconds: f64,
    trigger_on: f64,
    trigger_off: f64,
) -> Result<Vec<TriggerWindow>, SignalError> {
    let filtered = preprocess_trace(&segment.samples, segment.samprate, fmin, fmax)?;
    let nsta = (segment.samprate * sta_seconds).round() as usize;
    let nlta = (segment.samprate * lta_seconds).round() as usize;
    let cft = classic_sta_lta(&filtered, nsta, nlta);
    let onsets = trigger_onset(&cft, trigger_on, trigger_off);
    info!("{} events are found.", onsets.len());

    let picks: Vec<TriggerWindow> = onsets
        .iter()
        .map(|&(start_idx, end_idx)| TriggerWindow {
            t_on: segment.start + start_idx as f64 / segment.samprate,
            t_off: segment.start + end_idx as f64 / segment.samprate,
        })
        .collect();
    if !picks.is_empty() {
        debug!("picks for {sid}: {picks:?}");
    }
    Ok(picks)
}
