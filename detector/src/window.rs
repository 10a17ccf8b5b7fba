//! Multi-channel window assembly for the phase picker.
//!
//! Channels of one station drift apart by a record or two on the bus; the
//! picker wants a rectangular `[channels, N]` block ending at a common
//! instant. Channels are aligned on the earliest segment end, tail-trimmed,
//! and left-padded with zeros where alignment eats into the window.

use crate::buffer::TraceSegment;

/// Aligned picker input: `data[channel][sample]`, all rows ending at
/// `common_end`.
#[derive(Debug, Clone)]
pub struct MultiChannelWindow {
    /// Source ids, same order as `data` rows.
    pub channels: Vec<String>,
    pub data: Vec<Vec<f64>>,
    pub samprate: f64,
    /// Seconds since epoch of the last sample in every row.
    pub common_end: f64,
}

impl MultiChannelWindow {
    pub fn window_samples(&self) -> usize {
        self.data.first().map_or(0, Vec::len)
    }

    /// Epoch time of sample `idx` in any row.
    pub fn sample_time(&self, idx: usize) -> f64 {
        let n = self.window_samples();
        if n == 0 {
            return self.common_end;
        }
        self.common_end - (n - 1 - idx.min(n - 1)) as f64 / self.samprate
    }
}

/// Build the aligned window, or `None` when the group is not ready: no
/// channels, or any channel buffered fewer than `window_samples` samples.
pub fn build_multichannel_window(
    group: &[(&str, &TraceSegment)],
    window_samples: usize,
) -> Option<MultiChannelWindow> {
    if group.is_empty() || window_samples == 0 {
        return None;
    }
    if group
        .iter()
        .any(|(_, seg)| seg.samples.len() < window_samples)
    {
        return None;
    }

    let common_end = group
        .iter()
        .map(|(_, seg)| seg.end)
        .fold(f64::INFINITY, f64::min);

    let samprate = group[0].1.samprate;
    let mut channels = Vec::with_capacity(group.len());
    let mut data = Vec::with_capacity(group.len());

    for (sid, seg) in group {
        let offset = ((seg.end - common_end) * seg.samprate).round() as usize;
        let usable = &seg.samples[..seg.samples.len().saturating_sub(offset)];

        let row = if usable.len() >= window_samples {
            usable[usable.len() - window_samples..].to_vec()
        } else {
            let mut padded = vec![0.0; window_samples - usable.len()];
            padded.extend_from_slice(usable);
            padded
        };

        channels.push((*sid).to_string());
        data.push(row);
    }

    Some(MultiChannelWindow {
        channels,
        data,
        samprate,
        common_end,
    })
}
