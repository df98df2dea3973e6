//! # Observing priorities
//!
//! Two independent scores rank alive events for two science cases:
//!
//! * **planet priority** – peaks when the event is close to maximum
//!   magnification with a small impact parameter, i.e. when a short planetary
//!   anomaly is most likely to be caught;
//! * **long priority** – grows with the Einstein timescale and with the time
//!   elapsed since the last photometric point, to keep long (black-hole
//!   candidate) events sampled.
//!
//! Each score comes with an uncertainty from linear propagation of the
//! `(t0, u0, tE)` covariance block: `σ² = gᵀ C g` with `g` the gradient of the
//! score.
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::constants::{JulianDate, DEFAULT_DATA_GAP_DAYS};

/// Upper bound of the planet priority, reached as the source nears the lens.
const PLANET_PRIORITY_CAP: f64 = 10_000.0;
const D_FLOOR: f64 = 1e-10;

/// Scales of the long-timescale score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LongPriorityParams {
    /// Einstein timescale (days) giving a unit score after a long gap.
    pub te_base: f64,
    /// e-folding time (days) of the coverage-gap term.
    pub gap_scale: f64,
    /// Gap assumed when the time of the last data point is unknown.
    pub default_gap: f64,
}

impl Default for LongPriorityParams {
    fn default() -> Self {
        LongPriorityParams {
            te_base: 75.0,
            gap_scale: 3.0,
            default_gap: DEFAULT_DATA_GAP_DAYS,
        }
    }
}

/// Both scores and their uncertainties, as recorded in the priority history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityScore {
    pub planet: f64,
    pub planet_error: f64,
    pub long: f64,
    pub long_error: f64,
}

/// `(τ, s, D)` of the planet score: `s = u0² + τ²`, `D = √(s(s+4))`.
fn planet_terms(now: JulianDate, t0: JulianDate, u0: f64, te: f64) -> (f64, f64, f64) {
    let tau = (now - t0) / te;
    let s = u0 * u0 + tau * tau;
    (tau, s, (s * (s + 4.0)).sqrt())
}

/// Planet priority at `now` for a PSPL event.
pub fn planet_priority(now: JulianDate, t0: JulianDate, u0: f64, te: f64) -> f64 {
    let (_, s, d) = planet_terms(now, t0, u0, te);
    if d < D_FLOOR {
        return PLANET_PRIORITY_CAP;
    }
    (4.0 / d - 2.0 / (s + 2.0 + d)).min(PLANET_PRIORITY_CAP)
}

/// Gradient of [`planet_priority`] with respect to `(t0, u0, tE)`.
pub fn planet_priority_gradient(now: JulianDate, t0: JulianDate, u0: f64, te: f64) -> Vector3<f64> {
    let (tau, s, d) = planet_terms(now, t0, u0, te);
    // flat once capped
    if d < D_FLOOR || planet_priority(now, t0, u0, te) >= PLANET_PRIORITY_CAP {
        return Vector3::zeros();
    }
    let dd_ds = (s + 2.0) / d;
    let dpsi_ds = -4.0 * dd_ds / (d * d) + 2.0 * (1.0 + dd_ds) / (s + 2.0 + d).powi(2);
    Vector3::new(-2.0 * tau / te, 2.0 * u0, -2.0 * tau * tau / te) * dpsi_ds
}

/// Long-timescale priority.
///
/// Arguments
/// ---------
/// * `now`: current Julian Date
/// * `last_data`: Julian Date of the newest photometric point, if known
/// * `te`: Einstein timescale in days
pub fn long_priority(
    now: JulianDate,
    last_data: Option<JulianDate>,
    te: f64,
    params: &LongPriorityParams,
) -> f64 {
    te / params.te_base * gap_term(now, last_data, params)
}

fn gap_term(now: JulianDate, last_data: Option<JulianDate>, params: &LongPriorityParams) -> f64 {
    let last = last_data.unwrap_or(now - params.default_gap);
    let gap = (now - last).max(0.0);
    1.0 - (-gap / params.gap_scale).exp()
}

/// Propagate a gradient through the `(t0, u0, tE)` covariance.
pub fn propagate_error(gradient: &Vector3<f64>, covariance: &Matrix3<f64>) -> f64 {
    (gradient.transpose() * covariance * gradient)[(0, 0)].max(0.0).sqrt()
}

/// Both scores for a fitted event.
///
/// Return
/// ------
/// * a [`PriorityScore`]; the long-priority error only depends on the `tE` variance
pub fn score(
    now: JulianDate,
    t0: JulianDate,
    u0: f64,
    te: f64,
    last_data: Option<JulianDate>,
    covariance: &Matrix3<f64>,
    params: &LongPriorityParams,
) -> PriorityScore {
    let planet = planet_priority(now, t0, u0, te);
    let planet_error = propagate_error(&planet_priority_gradient(now, t0, u0, te), covariance);

    let long = long_priority(now, last_data, te, params);
    let long_gradient = Vector3::new(0.0, 0.0, gap_term(now, last_data, params) / params.te_base);

    PriorityScore {
        planet,
        planet_error,
        long,
        long_error: propagate_error(&long_gradient, covariance),
    }
}

#[cfg(test)]
mod priority_test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_planet_priority_peaks_at_t0() {
        let (t0, u0, te) = (2459000.0, 0.05, 30.0);
        let peak = planet_priority(t0, t0, u0, te);
        assert!(peak > planet_priority(t0 + 5.0 * te, t0, u0, te));
        assert!(peak > planet_priority(t0 - 5.0 * te, t0, u0, te));
        assert!(planet_priority(t0 + 1.0, t0, u0, te) > planet_priority(t0 + 10.0, t0, u0, te));
    }

    #[test]
    fn test_planet_priority_cap() {
        assert_eq!(planet_priority(2459000.0, 2459000.0, 0.0, 10.0), PLANET_PRIORITY_CAP);
        assert_eq!(
            planet_priority_gradient(2459000.0, 2459000.0, 0.0, 10.0),
            Vector3::zeros()
        );
        // the cap is continuous: tiny impact parameters saturate instead of overshooting
        assert_eq!(planet_priority(2459000.0, 2459000.0, 1e-6, 10.0), PLANET_PRIORITY_CAP);
        assert_eq!(
            planet_priority_gradient(2459000.0, 2459000.0, 1e-6, 10.0),
            Vector3::zeros()
        );
        let near = planet_priority(2459000.0, 2459000.0, 1e-3, 10.0);
        assert!(near > 1000.0 && near < PLANET_PRIORITY_CAP);
    }

    #[test]
    fn test_planet_gradient_matches_finite_difference() {
        let (now, t0, u0, te) = (2459003.0, 2459000.0, 0.2, 15.0);
        let g = planet_priority_gradient(now, t0, u0, te);
        // t0 needs a coarser step: JDs only carry ~1e-10 d of resolution
        let (ht, h) = (1e-3, 1e-6);
        let fd = Vector3::new(
            (planet_priority(now, t0 + ht, u0, te) - planet_priority(now, t0 - ht, u0, te)) / (2.0 * ht),
            (planet_priority(now, t0, u0 + h, te) - planet_priority(now, t0, u0 - h, te)) / (2.0 * h),
            (planet_priority(now, t0, u0, te + h) - planet_priority(now, t0, u0, te - h)) / (2.0 * h),
        );
        for i in 0..3 {
            assert_relative_eq!(g[i], fd[i], epsilon = 1e-5, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_long_priority() {
        let params = LongPriorityParams::default();
        let now = 2459000.0;
        // fresh data: no urgency
        assert_eq!(long_priority(now, Some(now), 150.0, &params), 0.0);
        // data in the future (clock skew) is treated as fresh
        assert_eq!(long_priority(now, Some(now + 1.0), 150.0, &params), 0.0);
        // long gap saturates at tE / tE_base
        assert_relative_eq!(long_priority(now, Some(now - 300.0), 150.0, &params), 2.0, epsilon = 1e-12);
        // unknown last point defaults to a 30 day gap
        assert_relative_eq!(
            long_priority(now, None, 150.0, &params),
            long_priority(now, Some(now - 30.0), 150.0, &params)
        );
    }

    #[test]
    fn test_score_errors() {
        let cov = Matrix3::from_diagonal(&Vector3::new(0.01, 1e-4, 4.0));
        let params = LongPriorityParams::default();
        let s = score(2459000.0, 2459000.0, 0.1, 150.0, Some(2458990.0), &cov, &params);
        let gap = 1.0 - (-10.0f64 / 3.0).exp();
        assert_relative_eq!(s.long, 2.0 * gap, epsilon = 1e-12);
        assert_relative_eq!(s.long_error, 2.0 * gap / 75.0, epsilon = 1e-12);
        assert!(s.planet_error > 0.0);

        assert_eq!(propagate_error(&Vector3::zeros(), &cov), 0.0);
    }
}
