//! Pick deduplication against the previous detection run.
//!
//! Detection windows overlap between runs, so the same onset keeps showing
//! up. The filter carries the last accepted onset time per key and drops
//! anything within `window_seconds` of it.

/// Anything with an onset time can be deduplicated; the payload
/// (trigger off-time, phase, score) rides along untouched.
pub trait Onset {
    fn onset(&self) -> f64;
}

/// Filter `picks` against `last_ts_on`, returning the accepted picks and
/// the new `last_ts_on`.
///
/// - `window_seconds <= 0`: accept everything; `last_ts_on` advances to the
///   latest onset seen (never moves backward).
/// - otherwise: picks are taken in ascending onset order and accepted iff
///   they fall more than `window_seconds` after the last accepted onset.
pub fn filter_picks<T: Onset + Clone>(
    picks: &[T],
    last_ts_on: Option<f64>,
    window_seconds: f64,
) -> (Vec<T>, Option<f64>) {
    let mut ordered = picks.to_vec();
    ordered.sort_by(|a, b| a.onset().total_cmp(&b.onset()));

    if window_seconds <= 0.0 {
        return match ordered.last() {
            Some(last) => {
                let mut latest = last.onset();
                if let Some(prev) = last_ts_on {
                    if prev > latest {
                        latest = prev;
                    }
                }
                (ordered, Some(latest))
            }
            None => (Vec::new(), last_ts_on),
        };
    }

    let mut accepted = Vec::new();
    let mut latest = last_ts_on;
    for pick in ordered {
        let ok = match latest {
            None => true,
            Some(last) => pick.onset() - last > window_seconds,
        };
        if ok {
            latest = Some(pick.onset());
            accepted.push(pick);
        }
    }
    (accepted, latest)
}
