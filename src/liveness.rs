//! Whether a microlensing event is still worth observing.
//!
//! An event more than [`ALIVE_HORIZON_TE`] Einstein timescales past its peak
//! has returned to baseline for all practical purposes.
use crate::constants::{JulianDate, ALIVE_HORIZON_TE};

/// Liveness of an event at `now`, given the fitted peak time and timescale.
///
/// Missing, non-finite or non-positive `tE` (and missing `t0`) make the event
/// dead rather than an error.
pub fn is_alive(now: JulianDate, t0: Option<JulianDate>, te: Option<f64>) -> bool {
    match (t0, te) {
        (Some(t0), Some(te)) if t0.is_finite() && te.is_finite() && te > 0.0 => {
            (now - t0) / te <= ALIVE_HORIZON_TE
        }
        _ => false,
    }
}

#[cfg(test)]
mod liveness_test {
    use super::*;

    #[test]
    fn test_alive() {
        let now = 2460000.0;
        assert!(!is_alive(now, Some(now - 50.0), Some(20.0)));
        assert!(is_alive(now, Some(now - 10.0), Some(20.0)));
        assert!(is_alive(now, Some(now - 40.0), Some(20.0)));
        // future peak
        assert!(is_alive(now, Some(now + 30.0), Some(20.0)));
    }

    #[test]
    fn test_degenerate_parameters() {
        let now = 2460000.0;
        assert!(!is_alive(now, Some(now), Some(0.0)));
        assert!(!is_alive(now, Some(now), Some(-3.0)));
        assert!(!is_alive(now, Some(now), Some(f64::NAN)));
        assert!(!is_alive(now, None, Some(20.0)));
        assert!(!is_alive(now, Some(now), None));
    }
}
