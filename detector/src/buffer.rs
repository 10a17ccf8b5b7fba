//! Rolling per-channel trace buffer.
//!
//! Keeps a bounded-duration sample history per source id, append-only.
//! Trimming drops the oldest samples once the buffered span exceeds
//! `max_seconds`; the newest sample is always retained, and a non-empty
//! segment never shrinks below one sample.
//!
//! Concatenation is treated as physically contiguous: if the bus drops a
//! record, the buffer silently stitches across the gap. Known limitation.

use std::collections::HashMap;

use thiserror::Error;

use seis_types::{SourceId, StationKey};

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("sample rate must be > 0 (got {0})")]
    InvalidSampleRate(f64),
}

/// One contiguous run of samples for one source id.
///
/// Invariant: `end == start + (samples.len() - 1) / samprate` when
/// non-empty, `end == start` when empty.
#[derive(Debug, Clone)]
pub struct TraceSegment {
    pub start: f64,
    pub end: f64,
    pub samprate: f64,
    pub samples: Vec<f64>,
}

/// In-memory ring buffer of decoded samples keyed by source id.
pub struct RollingTraceBuffer {
    max_seconds: f64,
    buffers: HashMap<String, TraceSegment>,
}

impl RollingTraceBuffer {
    pub fn new(max_seconds: f64) -> Self {
        Self {
            max_seconds,
            buffers: HashMap::new(),
        }
    }

    /// Append a decoded segment for `sid`, then trim the head down to
    /// `max_seconds`.
    pub fn add_segment(
        &mut self,
        sid: &str,
        start: f64,
        samprate: f64,
        samples: &[f64],
    ) -> Result<(), BufferError> {
        if samprate <= 0.0 {
            return Err(BufferError::InvalidSampleRate(samprate));
        }

        let buf = self
            .buffers
            .entry(sid.to_string())
            .and_modify(|buf| {
                buf.samples.extend_from_slice(samples);
            })
            .or_insert_with(|| TraceSegment {
                start,
                end: start,
                samprate,
                samples: samples.to_vec(),
            });

        buf.end = if buf.samples.is_empty() {
            buf.start
        } else {
            buf.start + (buf.samples.len() - 1) as f64 / buf.samprate
        };

        let cutoff = buf.end - self.max_seconds;
        if buf.start < cutoff {
            let mut trim = ((cutoff - buf.start) * buf.samprate).ceil() as usize;
            trim = trim.min(buf.samples.len().saturating_sub(1));
            if trim > 0 {
                buf.samples.drain(..trim);
                buf.start += trim as f64 / buf.samprate;
            }
        }

        Ok(())
    }

    pub fn get(&self, sid: &str) -> Option<&TraceSegment> {
        self.buffers.get(sid)
    }

    pub fn segment_length(&self, sid: &str) -> usize {
        self.buffers.get(sid).map_or(0, |buf| buf.samples.len())
    }

    pub fn samplerate(&self, sid: &str) -> Option<f64> {
        self.buffers.get(sid).map(|buf| buf.samprate)
    }

    /// Buffered span in seconds (sample count over rate, as the scheduler
    /// measures readiness).
    pub fn buffered_seconds(&self, sid: &str) -> f64 {
        self.buffers
            .get(sid)
            .map_or(0.0, |buf| buf.samples.len() as f64 / buf.samprate)
    }

    /// All buffers whose parsed source id matches `key`, ordered by source
    /// id for a deterministic channel layout. Unparseable ids are skipped.
    pub fn station_buffers(&self, key: &StationKey) -> Vec<(&str, &TraceSegment)> {
        let mut matches: Vec<(&str, &TraceSegment)> = self
            .buffers
            .iter()
            .filter(|(sid, _)| {
                SourceId::parse(sid).is_some_and(|parsed| parsed.station_key() == *key)
            })
            .map(|(sid, seg)| (sid.as_str(), seg))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(b.0));
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: &str = "FDSN:XX_TEST__H_H_Z";

    #[test]
    fn rejects_non_positive_sample_rate() {
        let mut buffer = RollingTraceBuffer::new(10.0);
        assert!(matches!(
            buffer.add_segment(SID, 0.0, 0.0, &[1.0]),
            Err(BufferError::InvalidSampleRate(_))
        ));
        assert!(buffer.add_segment(SID, 0.0, -5.0, &[1.0]).is_err());
    }

    #[test]
    fn trims_to_max_seconds_keeping_newest() {
        // 21 samples at 1 Hz starting t=0 into a 10 s buffer: the head is
        // trimmed to [10..20].
        let mut buffer = RollingTraceBuffer::new(10.0);
        let samples: Vec<f64> = (0..21).map(f64::from).collect();
        buffer.add_segment(SID, 0.0, 1.0, &samples).unwrap();

        let seg = buffer.get(SID).unwrap();
        assert_eq!(seg.start, 10.0);
        assert_eq!(seg.end, 20.0);
        let expected: Vec<f64> = (10..21).map(f64::from).collect();
        assert_eq!(seg.samples, expected);
    }

    #[test]
    fn incremental_appends_match_single_append() {
        let mut whole = RollingTraceBuffer::new(10.0);
        let mut chunked = RollingTraceBuffer::new(10.0);
        let samples: Vec<f64> = (0..21).map(f64::from).collect();

        whole.add_segment(SID, 0.0, 1.0, &samples).unwrap();
        for (i, chunk) in samples.chunks(4).enumerate() {
            chunked
                .add_segment(SID, (i * 4) as f64, 1.0, chunk)
                .unwrap();
        }

        let a = whole.get(SID).unwrap();
        let b = chunked.get(SID).unwrap();
        assert_eq!(a.samples, b.samples);
        assert_eq!(a.start, b.start);
        assert_eq!(a.end, b.end);
    }

    #[test]
    fn never_drops_below_one_sample() {
        // A single sample far beyond the window must survive the trim.
        let mut buffer = RollingTraceBuffer::new(0.5);
        buffer.add_segment(SID, 0.0, 1.0, &[1.0, 2.0, 3.0]).unwrap();
        let seg = buffer.get(SID).unwrap();
        assert!(!seg.samples.is_empty());
        assert_eq!(*seg.samples.last().unwrap(), 3.0);
    }

    #[test]
    fn buffer_bound_holds_across_appends() {
        let mut buffer = RollingTraceBuffer::new(5.0);
        for i in 0..40 {
            let chunk: Vec<f64> = (0..7).map(|j| f64::from(i * 7 + j)).collect();
            buffer
                .add_segment(SID, f64::from(i) * 0.7, 10.0, &chunk)
                .unwrap();
            let seg = buffer.get(SID).unwrap();
            assert!(seg.end - seg.start <= 5.0 + 0.1 + 1e-9);
            assert_eq!(*seg.samples.last().unwrap(), f64::from(i * 7 + 6));
        }
    }

    #[test]
    fn groups_buffers_by_station() {
        let mut buffer = RollingTraceBuffer::new(60.0);
        buffer
            .add_segment("FDSN:XX_TEST__H_H_Z", 0.0, 10.0, &[0.0; 10])
            .unwrap();
        buffer
            .add_segment("FDSN:XX_TEST__H_H_N", 0.0, 10.0, &[0.0; 10])
            .unwrap();
        buffer
            .add_segment("FDSN:XX_OTHER__H_H_Z", 0.0, 10.0, &[0.0; 10])
            .unwrap();

        let key = StationKey {
            net: "XX".into(),
            sta: "TEST".into(),
            loc: "".into(),
        };
        let group = buffer.station_buffers(&key);
        assert_eq!(group.len(), 2);
        // Deterministic (sorted) channel order.
        assert_eq!(group[0].0, "FDSN:XX_TEST__H_H_N");
        assert_eq!(group[1].0, "FDSN:XX_TEST__H_H_Z");
    }
}
