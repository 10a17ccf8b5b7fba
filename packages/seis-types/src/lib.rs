//! # seis-types
//!
//! Shared domain and wire types for the SeisGrid pipeline.
//!
//! These types are used by:
//! - `seis-detector`: parsing source identifiers, decoding miniSEED records,
//!   shaping pick rows for the store
//! - `seis-locator`: picks, stations, events and origin estimates
//! - `seis-feeder`: encoding synthetic miniSEED records for the bus
//!
//! ## Identifier conventions
//!
//! - **SourceId**: one channel, canonical text `NET.STA.LOC.CHA`. The FDSN
//!   underscore form `NET_STA_LOC_B_I_C` (band/instrument/component split)
//!   and an optional `FDSN:` prefix are accepted on input.
//! - **StationKey**: `(net, sta, loc)` — groups the channels of one
//!   instrument for multi-channel windowing and association.

pub mod mseed;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Source identifiers ────────────────────────────────────────────────────────

/// `(net, sta, loc)` triple identifying one instrument. `loc` may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StationKey {
    pub net: String,
    pub sta: String,
    pub loc: String,
}

impl fmt::Display for StationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.net, self.sta, self.loc)
    }
}

/// Parsed channel identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceId {
    pub net: String,
    pub sta: String,
    pub loc: String,
    pub chan: String,
}

impl SourceId {
    /// Parse a source identifier in dot or underscore form.
    ///
    /// `FDSN:XX_TEST__H_H_Z` → `XX.TEST..HHZ` (the three underscore-separated
    /// channel codes are rejoined). Returns `None` for unparseable input or
    /// an empty channel code.
    pub fn parse(sid: &str) -> Option<Self> {
        if sid.is_empty() {
            return None;
        }

        let cleaned = sid.strip_prefix("FDSN:").unwrap_or(sid);

        if cleaned.contains('_') {
            let parts: Vec<&str> = cleaned.split('_').collect();
            if parts.len() >= 4 {
                let chan: String = parts[3..].concat();
                if chan.is_empty() {
                    return None;
                }
                return Some(Self {
                    net: parts[0].to_string(),
                    sta: parts[1].to_string(),
                    loc: parts[2].to_string(),
                    chan,
                });
            }
            return None;
        }

        if cleaned.contains('.') {
            let parts: Vec<&str> = cleaned.split('.').collect();
            if parts.len() >= 4 {
                if parts[3].is_empty() {
                    return None;
                }
                return Some(Self {
                    net: parts[0].to_string(),
                    sta: parts[1].to_string(),
                    loc: parts[2].to_string(),
                    chan: parts[3].to_string(),
                });
            }
        }

        None
    }

    pub fn station_key(&self) -> StationKey {
        StationKey {
            net: self.net.clone(),
            sta: self.sta.clone(),
            loc: self.loc.clone(),
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.net, self.sta, self.loc, self.chan)
    }
}

// ── Seismic phases ────────────────────────────────────────────────────────────

/// Phase label attached to a pick. Only P and S are carried end-to-end;
/// anything else a picker emits is dropped at the detector boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    P,
    S,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::P => "P",
            Phase::S => "S",
        }
    }

    /// Case-insensitive parse; unknown labels return `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "P" => Some(Phase::P),
            "S" => Some(Phase::S),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Picks and stations ────────────────────────────────────────────────────────

/// One detected phase onset, as read back from the pick store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pick {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub phase: Phase,
    pub net: String,
    pub sta: String,
    pub loc: String,
    pub chan: String,
    /// Picker confidence in [0, 1]; STA/LTA picks carry no score.
    pub score: Option<f64>,
}

impl Pick {
    pub fn station_key(&self) -> StationKey {
        StationKey {
            net: self.net.clone(),
            sta: self.sta.clone(),
            loc: self.loc.clone(),
        }
    }
}

/// Station metadata (WGS-84 degrees, elevation in meters). Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub net: String,
    pub sta: String,
    pub loc: String,
    pub lat: f64,
    pub lon: f64,
    pub elev_m: f64,
}

impl Station {
    pub fn station_key(&self) -> StationKey {
        StationKey {
            net: self.net.clone(),
            sta: self.sta.clone(),
            loc: self.loc.clone(),
        }
    }
}

// ── Events and origins ────────────────────────────────────────────────────────

/// A time-clustered group of picks emitted by the associator.
/// Lives only within one locator cycle; identity across cycles is the
/// association key (SHA-256 over the ascending pick ids).
#[derive(Debug, Clone)]
pub struct Event {
    /// Ordered ascending by `ts`.
    pub picks: Vec<Pick>,
    pub earliest_pick_time: DateTime<Utc>,
    pub association_key: String,
}

/// Per-arrival solve diagnostics attached to an origin estimate.
#[derive(Debug, Clone)]
pub struct ArrivalResidual {
    pub pick: Pick,
    pub distance_km: f64,
    pub azimuth_deg: f64,
    pub predicted_tt_seconds: f64,
    /// observed − (origin + predicted)
    pub residual_seconds: f64,
}

/// Preliminary hypocenter + origin time from the Gauss-Newton solver.
#[derive(Debug, Clone)]
pub struct OriginEstimate {
    pub association_key: String,
    pub origin_ts: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub depth_km: f64,
    pub rms_seconds: f64,
    pub azimuthal_gap_deg: f64,
    pub used_stations: usize,
    pub arrivals: Vec<ArrivalResidual>,
}

// ── Epoch helpers ─────────────────────────────────────────────────────────────

/// Seconds-since-epoch → UTC timestamp (microsecond resolution).
/// Returns `None` for values outside chrono's representable range.
pub fn epoch_to_utc(epoch_seconds: f64) -> Option<DateTime<Utc>> {
    if !epoch_seconds.is_finite() {
        return None;
    }
    DateTime::<Utc>::from_timestamp_micros((epoch_seconds * 1e6).round() as i64)
}

pub fn utc_to_epoch(ts: DateTime<Utc>) -> f64 {
    ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_nanos()) * 1e-9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_underscore_form_with_fdsn_prefix() {
        let sid = SourceId::parse("FDSN:XX_TEST__H_H_Z").unwrap();
        assert_eq!(sid.net, "XX");
        assert_eq!(sid.sta, "TEST");
        assert_eq!(sid.loc, "");
        assert_eq!(sid.chan, "HHZ");
    }

    #[test]
    fn parses_dot_form() {
        let sid = SourceId::parse("HU.BUD.00.BHZ").unwrap();
        assert_eq!(
            sid.station_key(),
            StationKey {
                net: "HU".into(),
                sta: "BUD".into(),
                loc: "00".into(),
            }
        );
        assert_eq!(sid.chan, "BHZ");
    }

    #[test]
    fn rejects_empty_channel() {
        assert!(SourceId::parse("XX.STA..").is_none());
        assert!(SourceId::parse("XX_STA__").is_none());
        assert!(SourceId::parse("").is_none());
    }

    #[test]
    fn rejects_too_few_parts() {
        assert!(SourceId::parse("XX.STA.00").is_none());
        assert!(SourceId::parse("XX_STA_00").is_none());
        assert!(SourceId::parse("garbage").is_none());
    }

    #[test]
    fn phase_labels() {
        assert_eq!(Phase::from_label("p"), Some(Phase::P));
        assert_eq!(Phase::from_label(" S "), Some(Phase::S));
        assert_eq!(Phase::from_label("Pn"), None);
        assert_eq!(Phase::from_label(""), None);
    }

    #[test]
    fn epoch_round_trip() {
        let ts = epoch_to_utc(1_700_000_000.25).unwrap();
        let back = utc_to_epoch(ts);
        assert!((back - 1_700_000_000.25).abs() < 1e-6);
    }
}
