//! Detection scheduling: per-key cooldown state, dedup carry, and the
//! tagged detector backend.
//!
//! Keys are source ids in STA/LTA mode and station keys in picker mode.
//! The state is process-wide and single-owner — the consumer loop is the
//! only writer.

use std::collections::HashMap;

use crate::picker::{EnvelopePicker, PhasePicker};

// ── Backends ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StaLtaParams {
    pub fmin: f64,
    pub fmax: f64,
    pub sta_seconds: f64,
    pub lta_seconds: f64,
    pub trigger_on: f64,
    pub trigger_off: f64,
}

/// The two interchangeable detector front-ends.
pub enum Backend {
    StaLta(StaLtaParams),
    Picker(EnvelopePicker),
}

impl Backend {
    /// Fixed input length, or `None` for the unbounded STA/LTA front-end.
    pub fn input_samples(&self) -> Option<usize> {
        match self {
            Backend::StaLta(_) => None,
            Backend::Picker(picker) => Some(picker.input_samples()),
        }
    }
}

// ── Per-key scheduler state ───────────────────────────────────────────────────

#[derive(Default)]
pub struct DetectScheduler {
    last_detect: HashMap<String, f64>,
    last_ts_on: HashMap<String, f64>,
}

impl DetectScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cooldown gate: run when the key has never run, when
    /// `detect_every_seconds` have elapsed since the last run, or when the
    /// data time moved backwards (stream restart).
    pub fn should_run(&self, key: &str, end: f64, detect_every_seconds: f64) -> bool {
        match self.last_detect.get(key) {
            None => true,
            Some(&last) => end - last >= detect_every_seconds || end < last,
        }
    }

    pub fn mark_ran(&mut self, key: &str, end: f64) {
        self.last_detect.insert(key.to_string(), end);
    }

    /// Dedup carry for `key` — the onset of the last accepted pick.
    pub fn last_ts_on(&self, key: &str) -> Option<f64> {
        self.last_ts_on.get(key).copied()
    }

    pub fn set_last_ts_on(&mut self, key: &str, value: Option<f64>) {
        if let Some(value) = value {
            self.last_ts_on.insert(key.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_is_always_allowed() {
        let scheduler = DetectScheduler::new();
        assert!(scheduler.should_run("XX.TEST.", 123.0, 15.0));
    }

    #[test]
    fn cooldown_blocks_until_elapsed() {
        let mut scheduler = DetectScheduler::new();
        scheduler.mark_ran("k", 100.0);
        assert!(!scheduler.should_run("k", 110.0, 15.0));
        assert!(scheduler.should_run("k", 115.0, 15.0));
        assert!(scheduler.should_run("k", 200.0, 15.0));
    }

    #[test]
    fn clock_regress_forces_a_run() {
        let mut scheduler = DetectScheduler::new();
        scheduler.mark_ran("k", 100.0);
        assert!(scheduler.should_run("k", 50.0, 15.0));
    }

    #[test]
    fn keys_are_independent() {
        let mut scheduler = DetectScheduler::new();
        scheduler.mark_ran("a", 100.0);
        assert!(scheduler.should_run("b", 100.0, 15.0));
    }

    #[test]
    fn ts_on_carry_round_trips() {
        let mut scheduler = DetectScheduler::new();
        assert_eq!(scheduler.last_ts_on("k"), None);
        scheduler.set_last_ts_on("k", Some(42.0));
        assert_eq!(scheduler.last_ts_on("k"), Some(42.0));
        // None never clears an existing carry
        scheduler.set_last_ts_on("k", None);
        assert_eq!(scheduler.last_ts_on("k"), Some(42.0));
    }
}
