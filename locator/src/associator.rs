//! Time-window pick association.
//!
//! Sweeps the picks in ascending time order; each seed opens a window of
//! `window_seconds`, the earliest unused pick per station inside the window
//! is collected, and a group passing the station/phase thresholds becomes a
//! candidate event. Used picks never seed or join another event.

use std::collections::{HashMap, HashSet};

use chrono::Duration;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use seis_types::{Event, Pick, StationKey};

/// SHA-256 hex over the underscore-joined ascending pick ids. Stable across
/// runs: re-processing the same picks upserts the same origin row.
pub fn association_key(picks: &[Pick]) -> String {
    let mut ids: Vec<i64> = picks.iter().map(|pick| pick.id).collect();
    ids.sort_unstable();
    let canonical = ids
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join("_");
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

pub fn associate_picks(
    picks: &[Pick],
    window_seconds: f64,
    min_stations: usize,
    min_phases: usize,
    min_score: f64,
) -> Vec<Event> {
    info!(
        "Starting pick association: total_picks={} window_seconds={:.3} min_stations={} min_phases={} min_score={:.3}",
        picks.len(),
        window_seconds,
        min_stations,
        min_phases,
        min_score
    );
    if picks.is_empty() {
        info!("No picks provided; skipping association");
        return Vec::new();
    }

    let mut filtered: Vec<&Pick> = Vec::with_capacity(picks.len());
    let mut dropped_by_score = 0usize;
    for pick in picks {
        match pick.score {
            None => {
                warn!(
                    "Pick id={} has no score; accepting pick despite score filter",
                    pick.id
                );
                filtered.push(pick);
            }
            Some(score) if score >= min_score => filtered.push(pick),
            Some(_) => dropped_by_score += 1,
        }
    }
    debug!(
        "Score filtering complete: kept={} dropped_by_score={dropped_by_score}",
        filtered.len()
    );

    let mut ordered = filtered;
    ordered.sort_by_key(|pick| pick.ts);

    let window = Duration::microseconds((window_seconds * 1e6).round() as i64);
    let mut events = Vec::new();
    let mut used_pick_ids: HashSet<i64> = HashSet::new();

    let mut i = 0usize;
    while i < ordered.len() {
        let seed = ordered[i];
        let start_ts = seed.ts;

        let mut per_station: HashMap<StationKey, &Pick> = HashMap::new();
        let mut window_pick_ids: HashSet<i64> = HashSet::new();
        let mut j = i;
        while j < ordered.len() && ordered[j].ts - start_ts <= window {
            let pick = ordered[j];
            if !used_pick_ids.contains(&pick.id) {
                window_pick_ids.insert(pick.id);
                // picks are pre-sorted, so the first insert per station is
                // that station's earliest pick
                per_station.entry(pick.station_key()).or_insert(pick);
            }
            j += 1;
        }

        let mut event_picks: Vec<Pick> = per_station.values().map(|p| (*p).clone()).collect();
        event_picks.sort_by_key(|pick| pick.ts);
        let station_count = event_picks
            .iter()
            .map(Pick::station_key)
            .collect::<HashSet<_>>()
            .len();
        let phase_count = event_picks.len();
        debug!(
            "Evaluated window seed_pick_id={} start_ts={} candidate_picks={} stations={station_count} phases={phase_count}",
            seed.id,
            start_ts.to_rfc3339(),
            window_pick_ids.len()
        );

        if station_count >= min_stations && phase_count >= min_phases {
            let key = association_key(&event_picks);
            info!(
                "Created event: seed_pick_id={} picks={phase_count} stations={station_count} earliest_pick_time={} association_key={key}",
                seed.id,
                event_picks[0].ts.to_rfc3339()
            );
            events.push(Event {
                earliest_pick_time: event_picks[0].ts,
                association_key: key,
                picks: event_picks,
            });
            used_pick_ids.extend(window_pick_ids);
            i = j;
            continue;
        }

        debug!(
            "Rejected window seed_pick_id={}: stations={station_count}/{min_stations} phases={phase_count}/{min_phases}",
            seed.id
        );
        i += 1;
    }

    info!(
        "Association complete: events={} used_picks={}",
        events.len(),
        used_pick_ids.len()
    );
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use seis_types::Phase;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 27, 12, 0, 0).unwrap()
    }

    fn pick(id: i64, sta: &str, offset_s: f64, score: Option<f64>) -> Pick {
        Pick {
            id,
            ts: t0() + chrono::Duration::microseconds((offset_s * 1e6) as i64),
            phase: Phase::P,
            net: "AA".into(),
            sta: sta.into(),
            loc: "".into(),
            chan: "HHZ".into(),
            score,
        }
    }

    #[test]
    fn four_stations_in_window_make_one_event() {
        let picks = vec![
            pick(1, "STA1", 0.0, Some(0.9)),
            pick(2, "STA2", 1.0, Some(0.9)),
            pick(3, "STA3", 2.0, Some(0.9)),
            pick(4, "STA4", 3.0, Some(0.9)),
        ];
        let events = associate_picks(&picks, 5.0, 4, 4, 0.0);
        assert_eq!(events.len(), 1);
        let ids: Vec<i64> = events[0].picks.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(
            events[0].association_key,
            hex::encode(Sha256::digest(b"1_2_3_4"))
        );
        assert_eq!(events[0].earliest_pick_time, t0());
    }

    #[test]
    fn only_the_first_pick_per_station_is_used() {
        let picks = vec![
            pick(1, "STA1", 0.0, Some(0.9)),
            pick(2, "STA1", 0.5, Some(0.9)),
            pick(3, "STA2", 1.0, Some(0.9)),
            pick(4, "STA3", 2.0, Some(0.9)),
            pick(5, "STA4", 3.0, Some(0.9)),
        ];
        let events = associate_picks(&picks, 5.0, 4, 4, 0.0);
        assert_eq!(events.len(), 1);
        let ids: Vec<i64> = events[0].picks.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3, 4, 5]);
    }

    #[test]
    fn association_key_is_order_independent() {
        let forward = vec![
            pick(1, "STA1", 0.0, Some(0.9)),
            pick(2, "STA2", 1.0, Some(0.9)),
            pick(3, "STA3", 2.0, Some(0.9)),
            pick(4, "STA4", 3.0, Some(0.9)),
        ];
        let mut shuffled = forward.clone();
        shuffled.swap(0, 3);
        shuffled.swap(1, 2);

        let a = associate_picks(&forward, 5.0, 4, 4, 0.0);
        let b = associate_picks(&shuffled, 5.0, 4, 4, 0.0);
        assert_eq!(a[0].association_key, b[0].association_key);
    }

    #[test]
    fn low_score_picks_are_dropped_and_unscored_kept() {
        let picks = vec![
            pick(1, "STA1", 0.0, Some(0.9)),
            pick(2, "STA2", 1.0, Some(0.05)),
            pick(3, "STA3", 2.0, None),
            pick(4, "STA4", 3.0, Some(0.9)),
        ];
        let events = associate_picks(&picks, 5.0, 3, 3, 0.3);
        assert_eq!(events.len(), 1);
        let ids: Vec<i64> = events[0].picks.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3, 4]);
    }

    #[test]
    fn too_few_stations_yields_no_event() {
        let picks = vec![
            pick(1, "STA1", 0.0, Some(0.9)),
            pick(2, "STA2", 1.0, Some(0.9)),
        ];
        assert!(associate_picks(&picks, 5.0, 4, 4, 0.0).is_empty());
    }

    #[test]
    fn used_picks_do_not_join_a_second_event() {
        // Two bursts 30 s apart, four stations each.
        let mut picks = Vec::new();
        for (id, sta) in [(1, "STA1"), (2, "STA2"), (3, "STA3"), (4, "STA4")] {
            picks.push(pick(id, sta, 0.2 * id as f64, Some(0.9)));
        }
        for (id, sta) in [(5, "STA1"), (6, "STA2"), (7, "STA3"), (8, "STA4")] {
            picks.push(pick(id, sta, 30.0 + 0.2 * id as f64, Some(0.9)));
        }

        let events = associate_picks(&picks, 5.0, 4, 4, 0.0);
        assert_eq!(events.len(), 2);
        let first: HashSet<i64> = events[0].picks.iter().map(|p| p.id).collect();
        let second: HashSet<i64> = events[1].picks.iter().map(|p| p.id).collect();
        assert!(first.is_disjoint(&second));
        // every event keeps at most one pick per station
        for event in &events {
            let stations: HashSet<_> = event.picks.iter().map(Pick::station_key).collect();
            assert_eq!(stations.len(), event.picks.len());
        }
    }
}
