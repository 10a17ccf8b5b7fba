//! Damped Gauss-Newton origin solver.
//!
//! Fits `(lat, lon, depth_km, origin_epoch)` to the observed P arrivals of
//! one event under the straight-ray travel-time model. The least-squares
//! step comes from the 4×4 normal equations; a backtracking line search
//! damps the update and every trial point is clipped to the parameter
//! bounds. Derivatives are forward finite differences — the forward model
//! is cheap, the linear solve dominates.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info, warn};

use seis_types::{
    epoch_to_utc, utc_to_epoch, ArrivalResidual, Event, OriginEstimate, Pick, Station, StationKey,
};

use crate::geometry::{azimuth, azimuthal_gap, compute_travel_time, haversine_distance};

pub const DEFAULT_MAX_DEPTH_KM: f64 = 80.0;
pub const DEFAULT_MAX_ITERATIONS: usize = 30;

/// Per-parameter forward-difference steps: degrees, degrees, km, seconds.
const FD_STEPS: [f64; 4] = [1e-4, 1e-4, 1e-3, 1e-3];

#[derive(Debug, Error)]
pub enum SolveError {
    #[error("vp_km_s must be > 0 (got {0})")]
    InvalidVelocity(f64),
    #[error("min_stations must be >= 3 (got {0})")]
    InvalidMinStations(usize),
}

fn rms(values: &[f64]) -> f64 {
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

fn clip(x: [f64; 4], lower: &[f64; 4], upper: &[f64; 4]) -> [f64; 4] {
    let mut out = x;
    for i in 0..4 {
        out[i] = out[i].clamp(lower[i], upper[i]);
    }
    out
}

/// Solve `JᵀJ·dx = Jᵀ·rhs` by Gaussian elimination with partial pivoting.
/// Returns `None` when the normal matrix is (near-)singular.
fn solve_normal_equations(jac: &[[f64; 4]], rhs: &[f64]) -> Option<[f64; 4]> {
    let mut aug = [[0.0f64; 5]; 4];
    for (row, &r) in jac.iter().zip(rhs) {
        for i in 0..4 {
            aug[i][4] += row[i] * r;
            for j in 0..4 {
                aug[i][j] += row[i] * row[j];
            }
        }
    }

    for col in 0..4 {
        let mut pivot = col;
        for row in (col + 1)..4 {
            if aug[row][col].abs() > aug[pivot][col].abs() {
                pivot = row;
            }
        }
        if aug[pivot][col].abs() < 1e-12 {
            return None;
        }
        aug.swap(col, pivot);
        for row in (col + 1)..4 {
            let factor = aug[row][col] / aug[col][col];
            for k in col..5 {
                aug[row][k] -= factor * aug[col][k];
            }
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        let mut sum = aug[i][4];
        for j in (i + 1)..4 {
            sum -= aug[i][j] * x[j];
        }
        x[i] = sum / aug[i][i];
    }
    Some(x)
}

fn finite_difference_jacobian<F>(residual_fn: &F, x: &[f64; 4]) -> Vec<[f64; 4]>
where
    F: Fn(&[f64; 4]) -> Vec<f64>,
{
    let base = residual_fn(x);
    let mut jac = vec![[0.0f64; 4]; base.len()];
    for i in 0..4 {
        let mut x2 = *x;
        x2[i] += FD_STEPS[i];
        let perturbed = residual_fn(&x2);
        for (row, (p, b)) in jac.iter_mut().zip(perturbed.iter().zip(&base)) {
            row[i] = (p - b) / FD_STEPS[i];
        }
    }
    jac
}

/// Estimate the origin for one associated event. `Ok(None)` means no usable
/// estimate (too few stations with metadata, or an ill-conditioned solve).
pub fn estimate_origin(
    event: &Event,
    stations: &HashMap<StationKey, Station>,
    vp_km_s: f64,
    min_stations: usize,
    max_depth_km: f64,
    max_iterations: usize,
) -> Result<Option<OriginEstimate>, SolveError> {
    info!(
        "Starting origin estimation: association_key={} picks={} min_stations={min_stations} vp_km_s={vp_km_s:.3}",
        event.association_key,
        event.picks.len()
    );
    if vp_km_s <= 0.0 {
        return Err(SolveError::InvalidVelocity(vp_km_s));
    }
    if min_stations < 3 {
        return Err(SolveError::InvalidMinStations(min_stations));
    }

    let mut picks: Vec<&Pick> = Vec::new();
    let mut station_list: Vec<&Station> = Vec::new();
    let mut pick_epochs: Vec<f64> = Vec::new();
    for pick in &event.picks {
        let Some(station) = stations.get(&pick.station_key()) else {
            warn!(
                "Skipping pick with missing station metadata: pick_id={} station={}.{}.{}",
                pick.id, pick.net, pick.sta, pick.loc
            );
            continue;
        };
        picks.push(pick);
        station_list.push(station);
        pick_epochs.push(utc_to_epoch(pick.ts));
    }

    if picks.len() < min_stations {
        info!(
            "Origin estimation skipped: usable_picks={} required={min_stations}",
            picks.len()
        );
        return Ok(None);
    }

    // Picks are sorted by time; seed at the first-hit station.
    let first_station = station_list[0];
    let min_epoch = pick_epochs.iter().copied().fold(f64::INFINITY, f64::min);
    let max_epoch = pick_epochs
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);

    let mut x = [first_station.lat, first_station.lon, 10.0, min_epoch - 2.0];
    let lower = [-90.0, -180.0, 0.0, min_epoch - 300.0];
    let upper = [90.0, 180.0, max_depth_km, max_epoch + 300.0];

    let residuals = |params: &[f64; 4]| -> Vec<f64> {
        let [lat, lon, depth_km, origin_epoch] = *params;
        station_list
            .iter()
            .zip(&pick_epochs)
            .map(|(station, observed)| {
                let distance_km = haversine_distance(lat, lon, station.lat, station.lon);
                let tt_pred = compute_travel_time(distance_km, depth_km, vp_km_s);
                observed - (origin_epoch + tt_pred)
            })
            .collect()
    };

    for _ in 0..max_iterations {
        let r = residuals(&x);
        let rms0 = rms(&r);
        debug!(
            "Iteration: association_key={} rms={rms0:.6} lat={:.5} lon={:.5} depth={:.3}",
            event.association_key, x[0], x[1], x[2]
        );
        let jac = finite_difference_jacobian(&residuals, &x);
        let neg_r: Vec<f64> = r.iter().map(|v| -v).collect();
        let Some(dx) = solve_normal_equations(&jac, &neg_r) else {
            warn!(
                "Linear solve failed for association_key={}",
                event.association_key
            );
            return Ok(None);
        };

        let mut improved = false;
        let mut alpha = 1.0f64;
        for _ in 0..8 {
            let mut x_try = x;
            for i in 0..4 {
                x_try[i] += alpha * dx[i];
            }
            let x_try = clip(x_try, &lower, &upper);
            if rms(&residuals(&x_try)) < rms0 {
                x = x_try;
                improved = true;
                break;
            }
            alpha *= 0.5;
        }

        let step_norm = alpha * dx.iter().map(|v| v * v).sum::<f64>().sqrt();
        if !improved || step_norm < 1e-5 {
            debug!(
                "Stopping iterations: association_key={} improved={improved} step_norm={step_norm:.8}",
                event.association_key
            );
            break;
        }
    }

    let [lat, lon, depth_km, origin_epoch] = x;
    let final_residuals = residuals(&x);
    let rms_seconds = rms(&final_residuals);

    let Some(origin_ts) = epoch_to_utc(origin_epoch) else {
        warn!(
            "Origin epoch out of range for association_key={}",
            event.association_key
        );
        return Ok(None);
    };

    let mut arrivals = Vec::with_capacity(picks.len());
    let mut azimuths = Vec::with_capacity(picks.len());
    for ((pick, station), residual) in picks.iter().zip(&station_list).zip(&final_residuals) {
        let distance_km = haversine_distance(lat, lon, station.lat, station.lon);
        let az = azimuth(lat, lon, station.lat, station.lon);
        arrivals.push(ArrivalResidual {
            pick: (*pick).clone(),
            distance_km,
            azimuth_deg: az,
            predicted_tt_seconds: compute_travel_time(distance_km, depth_km, vp_km_s),
            residual_seconds: *residual,
        });
        azimuths.push(az);
    }

    let estimate = OriginEstimate {
        association_key: event.association_key.clone(),
        origin_ts,
        lat,
        lon,
        depth_km,
        rms_seconds,
        azimuthal_gap_deg: azimuthal_gap(&azimuths),
        used_stations: arrivals.len(),
        arrivals,
    };
    info!(
        "Origin estimated: association_key={} origin_ts={} lat={:.5} lon={:.5} depth_km={:.3} rms={:.4} stations={}",
        estimate.association_key,
        estimate.origin_ts.to_rfc3339(),
        estimate.lat,
        estimate.lon,
        estimate.depth_km,
        estimate.rms_seconds,
        estimate.used_stations
    );
    Ok(Some(estimate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use seis_types::Phase;

    fn make_pick(id: i64, ts: DateTime<Utc>, sta: &str) -> Pick {
        Pick {
            id,
            ts,
            phase: Phase::P,
            net: "AA".into(),
            sta: sta.into(),
            loc: "".into(),
            chan: "HHZ".into(),
            score: Some(0.9),
        }
    }

    fn make_station(sta: &str, lat: f64, lon: f64) -> Station {
        Station {
            net: "AA".into(),
            sta: sta.into(),
            loc: "".into(),
            lat,
            lon,
            elev_m: 0.0,
        }
    }

    fn synthetic_network() -> HashMap<StationKey, Station> {
        [
            make_station("STA1", 47.60, 19.05),
            make_station("STA2", 47.50, 19.20),
            make_station("STA3", 47.38, 18.98),
            make_station("STA4", 47.57, 18.90),
        ]
        .into_iter()
        .map(|s| (s.station_key(), s))
        .collect()
    }

    fn forward_event(
        stations: &HashMap<StationKey, Station>,
        origin_lat: f64,
        origin_lon: f64,
        origin_depth: f64,
        origin_t: DateTime<Utc>,
        vp: f64,
    ) -> Event {
        let mut entries: Vec<&Station> = stations.values().collect();
        entries.sort_by(|a, b| a.sta.cmp(&b.sta));

        let mut picks = Vec::new();
        for (i, station) in entries.iter().enumerate() {
            let dist = haversine_distance(origin_lat, origin_lon, station.lat, station.lon);
            let tt = compute_travel_time(dist, origin_depth, vp);
            let ts = origin_t + chrono::Duration::microseconds((tt * 1e6).round() as i64);
            picks.push(make_pick(i as i64 + 1, ts, &station.sta));
        }
        picks.sort_by_key(|p| p.ts);
        Event {
            earliest_pick_time: picks[0].ts,
            association_key: "event-1".into(),
            picks,
        }
    }

    #[test]
    fn recovers_a_synthetic_origin() {
        let origin_t = Utc.with_ymd_and_hms(2026, 2, 27, 12, 0, 0).unwrap();
        let stations = synthetic_network();
        let event = forward_event(&stations, 47.5, 19.05, 8.0, origin_t, 6.0);

        let result = estimate_origin(
            &event,
            &stations,
            6.0,
            4,
            DEFAULT_MAX_DEPTH_KM,
            DEFAULT_MAX_ITERATIONS,
        )
        .unwrap()
        .expect("solver should produce an estimate");

        assert!((result.lat - 47.5).abs() < 0.03);
        assert!((result.lon - 19.05).abs() < 0.03);
        assert!((result.depth_km - 8.0).abs() < 1.5);
        assert!((utc_to_epoch(result.origin_ts) - utc_to_epoch(origin_t)).abs() < 0.3);
        assert!(result.rms_seconds < 0.4);
        assert_eq!(result.used_stations, 4);
        assert_eq!(result.association_key, "event-1");
        assert_eq!(result.arrivals.len(), 4);
        for arrival in &result.arrivals {
            assert!(arrival.residual_seconds.abs() < 0.4);
            assert!((0.0..360.0).contains(&arrival.azimuth_deg));
        }
        assert!(result.azimuthal_gap_deg < 360.0);
    }

    #[test]
    fn depth_stays_within_bounds() {
        let origin_t = Utc.with_ymd_and_hms(2026, 2, 27, 12, 0, 0).unwrap();
        let stations = synthetic_network();
        let event = forward_event(&stations, 47.5, 19.05, 8.0, origin_t, 6.0);

        let result = estimate_origin(&event, &stations, 6.0, 4, 5.0, DEFAULT_MAX_ITERATIONS)
            .unwrap()
            .expect("solver should still converge inside the bound");
        assert!(result.depth_km <= 5.0 + 1e-9);
        assert!(result.depth_km >= 0.0);
    }

    #[test]
    fn missing_station_metadata_drops_below_minimum() {
        let origin_t = Utc.with_ymd_and_hms(2026, 2, 27, 12, 0, 0).unwrap();
        let stations = synthetic_network();
        let event = forward_event(&stations, 47.5, 19.05, 8.0, origin_t, 6.0);

        let mut partial = stations.clone();
        partial.remove(&StationKey {
            net: "AA".into(),
            sta: "STA4".into(),
            loc: "".into(),
        });

        let result = estimate_origin(
            &event,
            &partial,
            6.0,
            4,
            DEFAULT_MAX_DEPTH_KM,
            DEFAULT_MAX_ITERATIONS,
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let origin_t = Utc.with_ymd_and_hms(2026, 2, 27, 12, 0, 0).unwrap();
        let stations = synthetic_network();
        let event = forward_event(&stations, 47.5, 19.05, 8.0, origin_t, 6.0);

        assert!(matches!(
            estimate_origin(&event, &stations, 0.0, 4, 80.0, 30),
            Err(SolveError::InvalidVelocity(_))
        ));
        assert!(matches!(
            estimate_origin(&event, &stations, 6.0, 2, 80.0, 30),
            Err(SolveError::InvalidMinStations(2))
        ));
    }
}
