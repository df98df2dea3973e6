//! # Visibility oracle
//!
//! Answers two questions for a target, a site and a time window:
//!
//! * **Is the target observable at all?** ([`VisibilityOracle::calculate_visibility`])
//!   The night is bounded by the evening astronomical twilight nearest to the
//!   window start and the first morning astronomical twilight after the window
//!   end. The night is sampled every 30 minutes; the target is observable if at
//!   least one sample satisfies every constraint:
//!     - airmass ≤ `max_airmass` (2.0 by default),
//!     - 20° ≤ altitude ≤ 85°,
//!     - Sun below −18°.
//! * **How close is the Moon?** ([`VisibilityOracle::all_night_moon_sep`])
//!   The night is sampled uniformly (25 samples by default) and the report
//!   carries the target–Moon separations with their mean, together with the
//!   mean illuminated fraction and mean phase angle of the Moon.
//!   [`MoonReport::warning`] turns it into a warn/veto decision.
//!
//! Twilight instants are found by scanning the Sun's altitude on a 10 minute
//! grid and refining each crossing by bisection.
//!
//! ## Errors
//!
//! * [`MopError::UnknownObservatory`] for a site code missing from the registry.
//! * [`MopError::InvalidTimeRange`] for unparsable or empty windows, and for
//!   sites where the Sun never crosses −18° around the window.
pub mod observatories;

use serde::{Deserialize, Serialize};

use crate::constants::{Degree, JulianDate, HOURS_PER_DAY};
use crate::ephemeris::{angular_separation, moon_illumination, moon_phase_angle, moon_position, sun_radec, vector_to_radec};
use crate::mop_errors::MopError;
use crate::time::{jd_to_iso, parse_iso_to_jd};

use observatories::{airmass, Site, SiteRegistry};

/// Step of the twilight scan, in days.
const TWILIGHT_SCAN_STEP: f64 = 10.0 / (60.0 * HOURS_PER_DAY);
const BISECTION_STEPS: usize = 30;

/// A closed interval of time, `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: JulianDate,
    pub end: JulianDate,
}

impl TimeWindow {
    pub fn new(start: JulianDate, end: JulianDate) -> Result<Self, MopError> {
        if !start.is_finite() || !end.is_finite() || end <= start {
            return Err(MopError::InvalidTimeRange(format!(
                "window end ({end}) must be after its start ({start})"
            )));
        }
        Ok(TimeWindow { start, end })
    }

    /// Build a window from two calendar dates (`YYYY-MM-DDTHH:MM:SS`).
    pub fn parse(start: &str, end: &str) -> Result<Self, MopError> {
        TimeWindow::new(parse_iso_to_jd(start)?, parse_iso_to_jd(end)?)
    }

    /// Window of `days` starting at `start`.
    pub fn starting_at(start: JulianDate, days: f64) -> Result<Self, MopError> {
        TimeWindow::new(start, start + days)
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Observing constraints of the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityParams {
    pub max_airmass: f64,
    pub min_altitude: Degree,
    pub max_altitude: Degree,
    /// Sun altitude defining the night.
    pub twilight_altitude: Degree,
    /// Sampling step of the night, in hours.
    pub grid_step_hours: f64,
    pub moon_samples: usize,
    /// Separation under which the Moon is a problem.
    pub moon_distance_limit: Degree,
}

impl Default for VisibilityParams {
    fn default() -> Self {
        VisibilityParams {
            max_airmass: 2.0,
            min_altitude: 20.0,
            max_altitude: 85.0,
            twilight_altitude: -18.0,
            grid_step_hours: 0.5,
            moon_samples: 25,
            moon_distance_limit: 15.0,
        }
    }
}

/// Moon geometry over one night.
#[derive(Debug, Clone, PartialEq)]
pub struct MoonReport {
    /// Target–Moon separation at each sample (degrees).
    pub separations: Vec<Degree>,
    pub mean_separation: Degree,
    /// Mean illuminated fraction, 0 (new) to 1 (full).
    pub mean_illumination: f64,
    /// Mean phase angle in degrees, 0 at full Moon.
    pub mean_phase_angle: Degree,
}

/// What to do about the Moon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoonWarning {
    Clear,
    /// Part of the night is too close to the Moon.
    Warn,
    /// The whole night is too close to the Moon.
    Veto,
}

impl MoonReport {
    pub fn min_separation(&self) -> Degree {
        self.separations.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max_separation(&self) -> Degree {
        self.separations.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn warning(&self, limit: Degree) -> MoonWarning {
        if self.max_separation() < limit {
            MoonWarning::Veto
        } else if self.min_separation() < limit {
            MoonWarning::Warn
        } else {
            MoonWarning::Clear
        }
    }
}

/// Altitude of the Sun seen from `site` at `jd`.
pub fn sun_altitude(site: &Site, jd: JulianDate) -> Degree {
    let (ra, dec) = sun_radec(jd);
    site.altitude(jd, ra, dec)
}

/// Topocentric right ascension and declination of the Moon.
pub fn topocentric_moon_radec(site: &Site, jd: JulianDate) -> (Degree, Degree) {
    vector_to_radec(&(moon_position(jd) - site.geocentric_position(jd)))
}

pub struct VisibilityOracle {
    sites: SiteRegistry,
    params: VisibilityParams,
}

impl VisibilityOracle {
    pub fn new(sites: SiteRegistry, params: VisibilityParams) -> Self {
        VisibilityOracle { sites, params }
    }

    pub fn params(&self) -> &VisibilityParams {
        &self.params
    }

    pub fn site(&self, code: &str) -> Result<&Site, MopError> {
        self.sites.get(code)
    }

    /// Instants where the Sun crosses the twilight altitude between `from` and `to`.
    ///
    /// `setting` selects downward (evening) or upward (morning) crossings.
    fn twilight_crossings(&self, site: &Site, from: JulianDate, to: JulianDate, setting: bool) -> Vec<JulianDate> {
        let level = self.params.twilight_altitude;
        let f = |jd: f64| sun_altitude(site, jd) - level;

        let mut crossings = Vec::new();
        let mut t_prev = from;
        let mut f_prev = f(from);
        while t_prev < to {
            let t = (t_prev + TWILIGHT_SCAN_STEP).min(to);
            let f_t = f(t);
            let crossed = if setting {
                f_prev > 0.0 && f_t <= 0.0
            } else {
                f_prev <= 0.0 && f_t > 0.0
            };
            if crossed {
                let (mut lo, mut hi) = (t_prev, t);
                for _ in 0..BISECTION_STEPS {
                    let mid = 0.5 * (lo + hi);
                    if (f(mid) > 0.0) == (f_prev > 0.0) {
                        lo = mid;
                    } else {
                        hi = mid;
                    }
                }
                crossings.push(0.5 * (lo + hi));
            }
            t_prev = t;
            f_prev = f_t;
        }
        crossings
    }

    /// Evening twilight nearest to the window start and first morning twilight after its end.
    pub fn night_bounds(&self, site: &Site, window: &TimeWindow) -> Result<TimeWindow, MopError> {
        let evening = self
            .twilight_crossings(site, window.start - 1.0, window.start + 1.0, true)
            .into_iter()
            .min_by(|a, b| (a - window.start).abs().total_cmp(&(b - window.start).abs()));
        let morning = self
            .twilight_crossings(site, window.end, window.end + 1.5, false)
            .into_iter()
            .next();

        match (evening, morning) {
            (Some(evening), Some(morning)) => TimeWindow::new(evening, morning),
            _ => Err(MopError::InvalidTimeRange(format!(
                "no astronomical night at {} around {}",
                site.code,
                jd_to_iso(window.start)
            ))),
        }
    }

    /// Whether the target at `(ra, dec)` can be observed from `site_code` during `window`.
    ///
    /// Arguments
    /// ---------
    /// * `ra`, `dec`: target position in degrees
    /// * `window`: time window of the request
    /// * `site_code`: code of a registered site
    /// * `max_airmass`: overrides the configured airmass limit
    pub fn calculate_visibility(
        &self,
        ra: Degree,
        dec: Degree,
        window: &TimeWindow,
        site_code: &str,
        max_airmass: Option<f64>,
    ) -> Result<bool, MopError> {
        let site = self.site(site_code)?;
        let night = self.night_bounds(site, window)?;
        let max_airmass = max_airmass.unwrap_or(self.params.max_airmass);
        let step = self.params.grid_step_hours / HOURS_PER_DAY;

        let n_steps = (night.duration() / step).floor() as usize;
        let observable = (0..=n_steps).map(|i| night.start + i as f64 * step).any(|jd| {
            let alt = site.altitude(jd, ra, dec);
            sun_altitude(site, jd) < self.params.twilight_altitude
                && (self.params.min_altitude..=self.params.max_altitude).contains(&alt)
                && airmass(alt) <= max_airmass
        });
        Ok(observable)
    }

    /// Target–Moon separations sampled uniformly over the night of `window`.
    ///
    /// `samples` overrides the configured number of samples (at least one).
    pub fn all_night_moon_sep(
        &self,
        ra: Degree,
        dec: Degree,
        window: &TimeWindow,
        site_code: &str,
        samples: Option<usize>,
    ) -> Result<MoonReport, MopError> {
        let site = self.site(site_code)?;
        let night = self.night_bounds(site, window)?;
        let n = samples.unwrap_or(self.params.moon_samples).max(1);

        let times: Vec<JulianDate> = if n == 1 {
            vec![night.start]
        } else {
            let step = night.duration() / (n - 1) as f64;
            (0..n).map(|i| night.start + i as f64 * step).collect()
        };

        let separations: Vec<Degree> = times
            .iter()
            .map(|&jd| {
                let (moon_ra, moon_dec) = topocentric_moon_radec(site, jd);
                angular_separation(ra, dec, moon_ra, moon_dec)
            })
            .collect();
        let mean = |total: f64| total / n as f64;

        Ok(MoonReport {
            mean_separation: mean(separations.iter().sum()),
            mean_illumination: mean(times.iter().map(|&jd| moon_illumination(jd)).sum()),
            mean_phase_angle: mean(times.iter().map(|&jd| moon_phase_angle(jd)).sum()),
            separations,
        })
    }
}
