//! # Observing strategy (TAP pass)
//!
//! Each pass re-evaluates fitted events and decides whether and how to
//! observe them. For one event the decision goes through these states:
//!
//! | condition                                   | `Observing_mode`        | `Sky_location` |
//! |---------------------------------------------|-------------------------|----------------|
//! | classification is not microlensing          | `excluded`              | –              |
//! | inside the high-cadence zone                | `No`                    | `In HCZ`       |
//! | outside, no longer alive                    | `No`                    | `Outside HCZ`  |
//! | outside, alive, not visible in the next day | none                    | `Outside HCZ`  |
//! | outside, alive, visible, no current mag     | none                    | `Outside HCZ`  |
//! | outside, alive, visible                     | see [`classify_mode`]   | `Outside HCZ`  |
//!
//! Before any of this, the model parameters go through [`sanity_check`]; an
//! event failing it is skipped for this pass. Both priority scores are
//! recorded on the event and appended to its priority history.
//!
//! The three observing modes (`priority_stellar_event`, `priority_long_event`,
//! `regular_long_event`) produce [`ObservationConfig`]s through
//! [`determine_obs_config`]; those duplicating a pending request are dropped
//! and the rest is submitted when live observing is enabled.
//!
//! Every threshold, cadence and exposure time comes from the [`TapPolicy`]
//! table.
use std::cmp::Ordering::Greater;

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::{Degree, JulianDate, Magnitude, MOP_SOURCE};
use crate::fit::pspl::{ParallaxGeometry, PsplParams};
use crate::liveness::is_alive;
use crate::mop_errors::MopError;
use crate::photometry::{flux_to_magnitude, magnitude_to_flux};
use crate::priority::{self, LongPriorityParams, PriorityScore};
use crate::scheduler::{submit_deduplicated, ObservationConfig, SchedulerApi, SubmissionReport};
use crate::store::{Datum, DatumValue, Store};
use crate::target::{
    ObservingMode, SkyLocation, Target, TargetExtras, TargetFilter, TimescaleCategory,
};
use crate::visibility::{TimeWindow, VisibilityOracle};

/// A rectangular field of the partner high-cadence survey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HczField {
    pub name: String,
    pub ra_min: Degree,
    pub ra_max: Degree,
    pub dec_min: Degree,
    pub dec_max: Degree,
}

impl HczField {
    pub fn new(name: &str, ra_min: Degree, ra_max: Degree, dec_min: Degree, dec_max: Degree) -> Self {
        HczField {
            name: name.to_string(),
            ra_min,
            ra_max,
            dec_min,
            dec_max,
        }
    }

    pub fn contains(&self, ra: Degree, dec: Degree) -> bool {
        (self.ra_min..=self.ra_max).contains(&ra) && (self.dec_min..=self.dec_max).contains(&dec)
    }
}

/// Exposure time for targets down to a given magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureStep {
    pub faint_limit: Magnitude,
    /// Seconds.
    pub exposure_time: f64,
}

/// Cadence and window of one observing mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeStrategy {
    pub cadence_hours: f64,
    pub window_days: f64,
    pub ipp: f64,
    /// Add the colour filter when the event is brighter than this.
    pub color_mag_limit: Option<Magnitude>,
}

/// Thresholds and tables of the strategy pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapPolicy {
    /// Footprint of the partner high-cadence survey.
    pub hcz_fields: Vec<HczField>,
    /// Sites checked for visibility.
    pub sites: Vec<String>,
    /// Look-ahead of the visibility check, in days.
    pub visibility_days: f64,
    /// Einstein timescale separating stellar/planetary from long events.
    pub long_te_threshold: f64,
    pub planet_priority_min: f64,
    /// Minimum priority / error ratio of a priority event.
    pub min_priority_snr: f64,
    pub long_priority_min: f64,
    pub regular_long_priority_min: f64,
    /// Faintest current magnitude of a priority stellar event.
    pub stellar_faint_limit: Magnitude,
    /// Faintest current magnitude of a long event.
    pub long_faint_limit: Magnitude,
    /// Minimum brightening over the baseline of a priority stellar event.
    pub min_brightening: Magnitude,
    pub stellar: ModeStrategy,
    pub long_priority: ModeStrategy,
    pub long_regular: ModeStrategy,
    /// Exposure table sorted by increasing faint limit.
    pub exposures: Vec<ExposureStep>,
    pub primary_filter: String,
    pub color_filter: String,
    /// Exposure factor of the colour filter with respect to the primary one.
    pub color_exposure_factor: f64,
    pub telescope_class: String,
    pub instrument_type: String,
    pub long_priority_params: LongPriorityParams,
}

impl Default for TapPolicy {
    fn default() -> Self {
        TapPolicy {
            hcz_fields: vec![
                HczField::new("BLG02", 267.0, 269.6, -31.6, -29.2),
                HczField::new("BLG03", 267.2, 269.9, -29.5, -27.1),
                HczField::new("BLG42", 267.1, 269.7, -31.4, -29.0),
                HczField::new("BLG43", 267.3, 270.0, -29.3, -26.9),
            ],
            sites: vec!["lsc".into(), "cpt".into(), "coj".into()],
            visibility_days: 1.0,
            long_te_threshold: 75.0,
            planet_priority_min: 10.0,
            min_priority_snr: 3.0,
            long_priority_min: 1.5,
            regular_long_priority_min: 0.5,
            stellar_faint_limit: 17.5,
            long_faint_limit: 19.0,
            min_brightening: 0.1,
            stellar: ModeStrategy {
                cadence_hours: 1.0,
                window_days: 1.0,
                ipp: 1.05,
                color_mag_limit: Some(17.0),
            },
            long_priority: ModeStrategy {
                cadence_hours: 24.0,
                window_days: 7.0,
                ipp: 1.0,
                color_mag_limit: Some(17.0),
            },
            long_regular: ModeStrategy {
                cadence_hours: 72.0,
                window_days: 7.0,
                ipp: 0.95,
                color_mag_limit: None,
            },
            exposures: vec![
                ExposureStep { faint_limit: 14.0, exposure_time: 30.0 },
                ExposureStep { faint_limit: 15.5, exposure_time: 60.0 },
                ExposureStep { faint_limit: 17.0, exposure_time: 120.0 },
                ExposureStep { faint_limit: 18.5, exposure_time: 200.0 },
                ExposureStep { faint_limit: 20.0, exposure_time: 300.0 },
            ],
            primary_filter: "ip".into(),
            color_filter: "gp".into(),
            color_exposure_factor: 1.5,
            telescope_class: "1m0".into(),
            instrument_type: "1M0-SCICAM-SINISTRO".into(),
            long_priority_params: LongPriorityParams::default(),
        }
    }
}

impl TapPolicy {
    pub fn builder() -> TapPolicyBuilder {
        TapPolicyBuilder::new()
    }

    pub fn in_hcz(&self, ra: Degree, dec: Degree) -> bool {
        self.hcz_fields.iter().any(|f| f.contains(ra, dec))
    }

    pub fn category(&self, te: f64) -> TimescaleCategory {
        if te < self.long_te_threshold {
            TimescaleCategory::StellarPlanet
        } else {
            TimescaleCategory::LongTe
        }
    }

    /// Exposure time (s) in the primary filter for a target of magnitude `mag`.
    pub fn exposure_time(&self, mag: Magnitude) -> f64 {
        self.exposures
            .iter()
            .find(|step| mag <= step.faint_limit)
            .or(self.exposures.last())
            .map_or(0.0, |step| step.exposure_time)
    }

    pub fn mode_strategy(&self, mode: ObservingMode) -> Option<&ModeStrategy> {
        match mode {
            ObservingMode::PriorityStellarEvent => Some(&self.stellar),
            ObservingMode::PriorityLongEvent => Some(&self.long_priority),
            ObservingMode::RegularLongEvent => Some(&self.long_regular),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), MopError> {
        let gt0 = |x: f64| x.partial_cmp(&0.0) == Some(Greater);
        if self.sites.is_empty() {
            return Err(MopError::InvalidPolicy("at least one site is required".into()));
        }
        if !gt0(self.visibility_days) || !gt0(self.long_te_threshold) {
            return Err(MopError::InvalidPolicy(
                "visibility_days and long_te_threshold must be > 0".into(),
            ));
        }
        if self.exposures.is_empty()
            || !self.exposures.iter().all(|s| gt0(s.exposure_time))
            || !self
                .exposures
                .windows(2)
                .all(|w| w[0].faint_limit < w[1].faint_limit)
        {
            return Err(MopError::InvalidPolicy(
                "exposure table must be non-empty, sorted by faint limit, with positive times".into(),
            ));
        }
        for (name, s) in [
            ("stellar", &self.stellar),
            ("long_priority", &self.long_priority),
            ("long_regular", &self.long_regular),
        ] {
            if !gt0(s.cadence_hours) || !gt0(s.window_days) || !gt0(s.ipp) {
                return Err(MopError::InvalidPolicy(format!(
                    "{name}: cadence, window and ipp must be > 0"
                )));
            }
        }
        if !gt0(self.color_exposure_factor) {
            return Err(MopError::InvalidPolicy("color_exposure_factor must be > 0".into()));
        }
        if !gt0(self.long_priority_params.te_base) || !gt0(self.long_priority_params.gap_scale) {
            return Err(MopError::InvalidPolicy(
                "long priority scales must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`TapPolicy`], with validation.
#[derive(Debug, Clone, Default)]
pub struct TapPolicyBuilder {
    policy: TapPolicy,
}

impl TapPolicyBuilder {
    pub fn new() -> Self {
        TapPolicyBuilder::default()
    }

    pub fn hcz_fields(mut self, v: Vec<HczField>) -> Self {
        self.policy.hcz_fields = v;
        self
    }
    pub fn sites(mut self, v: Vec<String>) -> Self {
        self.policy.sites = v;
        self
    }
    pub fn long_te_threshold(mut self, v: f64) -> Self {
        self.policy.long_te_threshold = v;
        self
    }
    pub fn planet_priority_min(mut self, v: f64) -> Self {
        self.policy.planet_priority_min = v;
        self
    }
    pub fn min_priority_snr(mut self, v: f64) -> Self {
        self.policy.min_priority_snr = v;
        self
    }
    pub fn long_priority_min(mut self, v: f64) -> Self {
        self.policy.long_priority_min = v;
        self
    }
    pub fn regular_long_priority_min(mut self, v: f64) -> Self {
        self.policy.regular_long_priority_min = v;
        self
    }
    pub fn stellar_faint_limit(mut self, v: Magnitude) -> Self {
        self.policy.stellar_faint_limit = v;
        self
    }
    pub fn exposures(mut self, v: Vec<ExposureStep>) -> Self {
        self.policy.exposures = v;
        self
    }

    pub fn build(self) -> Result<TapPolicy, MopError> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Model parameters that passed [`sanity_check`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SaneModel {
    pub t0: JulianDate,
    pub u0: f64,
    pub te: f64,
    /// `(t0, u0, tE)` block of the fit covariance.
    pub covariance: Matrix3<f64>,
}

/// Check that the extras carry a usable PSPL model.
///
/// Requires finite `t0`, `u0`, `tE > 0`, strictly positive `t0_error` and
/// `tE_error`, and a finite square covariance of dimension ≥ 3.
pub fn sanity_check(extras: &TargetExtras, target: &str) -> Result<SaneModel, MopError> {
    let t0 = extras.require_t0(target)?;
    let u0 = extras.require_u0(target)?;
    let te = extras.require_te(target)?;
    for (value, field) in [(extras.t0_error, "t0_error"), (extras.te_error, "tE_error")] {
        if !value.is_some_and(|v| v.is_finite() && v > 0.0) {
            return Err(MopError::MissingExtra {
                target: target.to_string(),
                field,
            });
        }
    }
    let covariance = extras
        .require_covariance(target)?
        .leading_3x3()
        .ok_or_else(|| MopError::MissingExtra {
            target: target.to_string(),
            field: "Fit_covariance",
        })?;
    Ok(SaneModel {
        t0,
        u0,
        te,
        covariance,
    })
}

/// Current model magnitude of the event in the reference filter.
///
/// `None` when the model or its source magnitude is missing, or the model flux
/// is not positive.
pub fn mag_now(target: &Target, now: JulianDate) -> Option<Magnitude> {
    let e = &target.extras;
    let (t0, u0, te) = (e.t0?, e.u0?, e.te?);
    if !(te > 0.0) {
        return None;
    }
    let source_flux = magnitude_to_flux(e.source_magnitude?);
    let blend_flux = e.blend_magnitude.map_or(0.0, magnitude_to_flux);
    let params = PsplParams {
        t0,
        u0,
        te,
        pi_en: e.pi_en.unwrap_or(0.0),
        pi_ee: e.pi_ee.unwrap_or(0.0),
    };
    let offset = if params.pi_en != 0.0 || params.pi_ee != 0.0 {
        ParallaxGeometry::new(target.ra, target.dec, e.t0_par.unwrap_or(t0)).offset(now)
    } else {
        (0.0, 0.0)
    };
    flux_to_magnitude(source_flux * params.magnification_at(now, offset) + blend_flux)
}

fn snr(value: f64, error: f64) -> f64 {
    if error > 0.0 {
        value / error
    } else if value > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

/// Observing mode of a visible, alive event outside the high-cadence zone.
pub fn classify_mode(
    policy: &TapPolicy,
    score: &PriorityScore,
    category: TimescaleCategory,
    mag_now: Magnitude,
    mag_baseline: Option<Magnitude>,
) -> ObservingMode {
    match category {
        TimescaleCategory::StellarPlanet => {
            let brightened = mag_baseline.map_or(true, |b| b - mag_now >= policy.min_brightening);
            if score.planet >= policy.planet_priority_min
                && snr(score.planet, score.planet_error) >= policy.min_priority_snr
                && mag_now <= policy.stellar_faint_limit
                && brightened
            {
                ObservingMode::PriorityStellarEvent
            } else {
                ObservingMode::Other
            }
        }
        TimescaleCategory::LongTe => {
            if mag_now > policy.long_faint_limit {
                ObservingMode::Other
            } else if score.long >= policy.long_priority_min
                && snr(score.long, score.long_error) >= policy.min_priority_snr
            {
                ObservingMode::PriorityLongEvent
            } else if score.long >= policy.regular_long_priority_min {
                ObservingMode::RegularLongEvent
            } else {
                ObservingMode::Other
            }
        }
    }
}

/// Observation configurations of an event in an observing `mode`.
///
/// One configuration per filter: the primary filter always, the colour
/// filter when the event is brighter than the mode's colour limit. Modes
/// without observations give an empty list.
pub fn determine_obs_config(
    policy: &TapPolicy,
    target: &Target,
    mode: ObservingMode,
    mag_now: Magnitude,
    now: JulianDate,
    max_airmass: f64,
    min_lunar_distance: Degree,
) -> Result<Vec<ObservationConfig>, MopError> {
    let Some(strategy) = policy.mode_strategy(mode) else {
        return Ok(Vec::new());
    };
    let window = TimeWindow::starting_at(now, strategy.window_days)?;
    let exposure = policy.exposure_time(mag_now);

    let mut filters = vec![(policy.primary_filter.as_str(), exposure)];
    if strategy.color_mag_limit.is_some_and(|limit| mag_now < limit) {
        filters.push((policy.color_filter.as_str(), exposure * policy.color_exposure_factor));
    }

    Ok(filters
        .into_iter()
        .map(|(filter, exposure_time)| ObservationConfig {
            target: target.name.clone(),
            ra: target.ra,
            dec: target.dec,
            telescope_class: policy.telescope_class.clone(),
            instrument_type: policy.instrument_type.clone(),
            filter: filter.to_string(),
            exposure_time,
            exposure_count: 1,
            cadence_hours: strategy.cadence_hours,
            window,
            ipp: strategy.ipp,
            max_airmass,
            min_lunar_distance,
        })
        .collect())
}

/// Result of evaluating one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Extras to persist.
    pub extras: TargetExtras,
    pub score: Option<PriorityScore>,
    pub configs: Vec<ObservationConfig>,
}

/// Which events a pass looks at.
#[derive(Debug, Clone, PartialEq)]
pub enum TapSelection {
    AllAlive,
    Named(String),
}

/// Counters of a strategy pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TapReport {
    pub evaluated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub submitted: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

pub struct StrategySelector<'a> {
    store: &'a dyn Store,
    scheduler: &'a dyn SchedulerApi,
    oracle: &'a VisibilityOracle,
    policy: TapPolicy,
    live_obs: bool,
}

impl<'a> StrategySelector<'a> {
    pub fn new(
        store: &'a dyn Store,
        scheduler: &'a dyn SchedulerApi,
        oracle: &'a VisibilityOracle,
        policy: TapPolicy,
        live_obs: bool,
    ) -> Self {
        StrategySelector {
            store,
            scheduler,
            oracle,
            policy,
            live_obs,
        }
    }

    pub fn policy(&self) -> &TapPolicy {
        &self.policy
    }

    /// Whether the target can be observed from any policy site in the look-ahead window.
    fn is_visible(&self, target: &Target, now: JulianDate) -> Result<bool, MopError> {
        let window = TimeWindow::starting_at(now, self.policy.visibility_days)?;
        for site in &self.policy.sites {
            match self
                .oracle
                .calculate_visibility(target.ra, target.dec, &window, site, None)
            {
                Ok(true) => {
                    if let Ok(moon) = self.oracle.all_night_moon_sep(target.ra, target.dec, &window, site, None) {
                        debug!(
                            event = %target.name,
                            site = %site,
                            moon_separation = moon.mean_separation,
                            moon_warning = ?moon.warning(self.oracle.params().moon_distance_limit),
                            "visible"
                        );
                    }
                    return Ok(true);
                }
                Ok(false) => {}
                // no astronomical night at that site: not visible from there
                Err(MopError::InvalidTimeRange(reason)) => debug!(site = %site, "{reason}"),
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }

    /// Decide the observing mode of `target` at `now` without persisting anything.
    pub fn evaluate(&self, target: &Target, now: JulianDate) -> Result<Evaluation, MopError> {
        let mut extras = target.extras.clone();
        if !extras.is_microlensing() {
            extras.observing_mode = Some(ObservingMode::Excluded);
            return Ok(Evaluation {
                extras,
                score: None,
                configs: Vec::new(),
            });
        }

        let model = sanity_check(&extras, &target.name)?;
        let category = self.policy.category(model.te);
        let score = priority::score(
            now,
            model.t0,
            model.u0,
            model.te,
            extras.latest_data_hjd,
            &model.covariance,
            &self.policy.long_priority_params,
        );
        info!(
            event = %target.name,
            planet = score.planet,
            planet_error = score.planet_error,
            long = score.long,
            long_error = score.long_error,
            "priorities"
        );
        extras.category = Some(category);
        extras.planet_priority = Some(score.planet);
        extras.planet_priority_error = Some(score.planet_error);
        extras.long_priority = Some(score.long);
        extras.long_priority_error = Some(score.long_error);

        let mut configs = Vec::new();
        let (mode, sky_location) = if self.policy.in_hcz(target.ra, target.dec) {
            (Some(ObservingMode::No), SkyLocation::InHcz)
        } else if !is_alive(now, Some(model.t0), Some(model.te)) {
            extras.alive = Some(false);
            (Some(ObservingMode::No), SkyLocation::OutsideHcz)
        } else if !self.is_visible(target, now)? {
            info!(event = %target.name, "not currently visible");
            (None, SkyLocation::OutsideHcz)
        } else {
            let current = mag_now(target, now);
            extras.mag_now = current;
            let mode = current.map(|mag| {
                classify_mode(&self.policy, &score, category, mag, extras.baseline_magnitude)
            });
            if let (Some(mode), Some(mag)) = (mode, current) {
                let vis = self.oracle.params();
                configs = determine_obs_config(
                    &self.policy,
                    target,
                    mode,
                    mag,
                    now,
                    vis.max_airmass,
                    vis.moon_distance_limit,
                )?;
            }
            (mode, SkyLocation::OutsideHcz)
        };
        info!(event = %target.name, mode = ?mode, "observing mode");
        extras.observing_mode = mode;
        extras.sky_location = Some(sky_location);

        Ok(Evaluation {
            extras,
            score: Some(score),
            configs,
        })
    }

    /// Evaluate, persist and (when live) submit for one target.
    pub fn run_target(&self, target: &Target, now: JulianDate) -> Result<Option<SubmissionReport>, MopError> {
        let evaluation = self.evaluate(target, now)?;
        self.store.save_extras(&target.name, &evaluation.extras)?;

        if let Some(score) = evaluation.score {
            let datum = Datum::new(&target.name, MOP_SOURCE, now, DatumValue::TapPriority(score));
            match self.store.append_datum(datum) {
                Ok(()) => {}
                Err(err @ MopError::DuplicateDatum { .. }) => warn!("{err}"),
                Err(err) => return Err(err),
            }
        }

        if evaluation.configs.is_empty() {
            return Ok(None);
        }
        if !self.live_obs {
            warn!(
                event = %target.name,
                n_configs = evaluation.configs.len(),
                "observations switched off, nothing submitted"
            );
            return Ok(None);
        }
        submit_deduplicated(self.scheduler, &target.name, evaluation.configs).map(Some)
    }

    /// Run a strategy pass; per-target failures are logged and counted.
    pub fn run(&self, selection: &TapSelection, now: JulianDate) -> Result<TapReport, MopError> {
        let targets = match selection {
            TapSelection::AllAlive => self.store.find(&TargetFilter::alive())?,
            TapSelection::Named(name) => vec![self.store.get(name)?],
        };
        info!(n_events = targets.len(), "strategy pass started");

        let mut report = TapReport::default();
        for target in &targets {
            match self.run_target(target, now) {
                Ok(submission) => {
                    report.evaluated += 1;
                    if let Some(s) = submission {
                        report.submitted += s.accepted.len();
                        report.duplicates += s.duplicates;
                        report.rejected += s.rejected.len();
                    }
                }
                Err(err @ MopError::MissingExtra { .. }) => {
                    warn!(event = %target.name, "insufficient model parameters, skipping: {err}");
                    report.skipped += 1;
                }
                Err(err) if err.is_per_target() || err.is_http_status() => {
                    warn!(event = %target.name, "strategy failed: {err}");
                    report.failed += 1;
                }
                Err(err) => return Err(err),
            }
        }
        info!(?report, "strategy pass done");
        Ok(report)
    }
}

#[cfg(test)]
mod strategy_test {
    use super::*;
    use crate::constants::MICROLENSING;
    use crate::scheduler::memory::MemoryScheduler;
    use crate::scheduler::SubmissionOutcome;
    use crate::store::memory::MemoryStore;
    use crate::store::DataType;
    use crate::target::{CovarianceMatrix, TargetKind};
    use crate::visibility::observatories::SiteRegistry;
    use crate::visibility::VisibilityParams;
    use approx::assert_relative_eq;

    // 2020-05-31 00:00 UT: the bulge rises over Chile in the evening
    const NOW: f64 = 2459000.5;

    fn fitted_extras(t0: f64, u0: f64, te: f64) -> TargetExtras {
        TargetExtras {
            classification: Some(MICROLENSING.into()),
            alive: Some(true),
            t0: Some(t0),
            t0_error: Some(0.1),
            u0: Some(u0),
            u0_error: Some(0.001),
            te: Some(te),
            te_error: Some(0.5),
            source_magnitude: Some(17.0),
            blend_magnitude: Some(18.0),
            baseline_magnitude: Some(16.64),
            latest_data_hjd: Some(NOW - 1.0),
            fit_covariance: Some(CovarianceMatrix(vec![
                vec![0.01, 0.0, 0.0],
                vec![0.0, 1e-6, 0.0],
                vec![0.0, 0.0, 0.25],
            ])),
            ..TargetExtras::default()
        }
    }

    fn oracle() -> VisibilityOracle {
        VisibilityOracle::new(SiteRegistry::lco_network(), VisibilityParams::default())
    }

    fn add_target(store: &MemoryStore, name: &str, ra: f64, dec: f64, extras: TargetExtras) -> Target {
        store
            .get_or_create(name, ra, dec, TargetKind::Sidereal, 2000.0)
            .unwrap();
        store.save_extras(name, &extras).unwrap();
        store.get(name).unwrap()
    }

    #[test]
    fn test_policy_validation() {
        assert!(TapPolicy::builder().build().is_ok());
        assert!(TapPolicy::builder().sites(vec![]).build().is_err());
        assert!(TapPolicy::builder()
            .exposures(vec![
                ExposureStep { faint_limit: 18.0, exposure_time: 100.0 },
                ExposureStep { faint_limit: 15.0, exposure_time: 50.0 },
            ])
            .build()
            .is_err());
    }

    #[test]
    fn test_policy_tables() {
        let policy = TapPolicy::default();
        assert!(policy.in_hcz(268.14, -29.03));
        assert!(!policy.in_hcz(270.5, -28.0));
        assert_eq!(policy.exposure_time(13.0), 30.0);
        assert_eq!(policy.exposure_time(16.0), 120.0);
        assert_eq!(policy.exposure_time(22.0), 300.0);
        assert_eq!(policy.category(20.0), TimescaleCategory::StellarPlanet);
        assert_eq!(policy.category(75.0), TimescaleCategory::LongTe);
    }

    #[test]
    fn test_sanity_check() {
        let mut extras = fitted_extras(NOW, 0.1, 20.0);
        assert!(sanity_check(&extras, "ev").is_ok());
        extras.te_error = Some(0.0);
        assert_eq!(
            sanity_check(&extras, "ev"),
            Err(MopError::MissingExtra {
                target: "ev".into(),
                field: "tE_error"
            })
        );
        let mut extras = fitted_extras(NOW, 0.1, 20.0);
        extras.fit_covariance = None;
        assert!(sanity_check(&extras, "ev").is_err());
    }

    #[test]
    fn test_mag_now() {
        let mut t = Target::new("ev", 270.5, -28.0, TargetKind::Sidereal, 2000.0);
        t.extras = fitted_extras(NOW, 0.1, 20.0);
        // far from the peak the model returns to the baseline
        let baseline = 17.0 - 2.5 * (1.0 + 10f64.powf(-0.4)).log10();
        assert_relative_eq!(mag_now(&t, NOW + 1e5).unwrap(), baseline, epsilon = 1e-6);
        assert!(mag_now(&t, NOW).unwrap() < baseline - 2.0);
        t.extras.source_magnitude = None;
        assert_eq!(mag_now(&t, NOW), None);
    }

    #[test]
    fn test_classify_mode() {
        let policy = TapPolicy::default();
        let strong = PriorityScore {
            planet: 20.0,
            planet_error: 1.0,
            long: 3.0,
            long_error: 0.1,
        };
        let stellar = TimescaleCategory::StellarPlanet;
        let long = TimescaleCategory::LongTe;
        assert_eq!(
            classify_mode(&policy, &strong, stellar, 15.0, Some(16.5)),
            ObservingMode::PriorityStellarEvent
        );
        // too faint
        assert_eq!(classify_mode(&policy, &strong, stellar, 18.0, Some(19.0)), ObservingMode::Other);
        // not brightened
        assert_eq!(classify_mode(&policy, &strong, stellar, 15.0, Some(15.05)), ObservingMode::Other);
        assert_eq!(classify_mode(&policy, &strong, long, 15.0, None), ObservingMode::PriorityLongEvent);

        let weak = PriorityScore {
            long: 0.8,
            ..strong
        };
        assert_eq!(classify_mode(&policy, &weak, long, 15.0, None), ObservingMode::RegularLongEvent);
        let none = PriorityScore {
            long: 0.1,
            ..strong
        };
        assert_eq!(classify_mode(&policy, &none, long, 15.0, None), ObservingMode::Other);
    }

    #[test]
    fn test_obs_config_filters() {
        let policy = TapPolicy::default();
        let t = Target::new("ev", 270.5, -28.0, TargetKind::Sidereal, 2000.0);
        let bright = determine_obs_config(&policy, &t, ObservingMode::PriorityStellarEvent, 14.5, NOW, 2.0, 15.0).unwrap();
        assert_eq!(bright.len(), 2);
        assert_eq!(bright[0].filter, "ip");
        assert_eq!(bright[0].exposure_time, 60.0);
        assert_eq!(bright[1].filter, "gp");
        assert_eq!(bright[1].exposure_time, 90.0);
        assert_eq!(bright[0].window, TimeWindow::new(NOW, NOW + 1.0).unwrap());

        let faint = determine_obs_config(&policy, &t, ObservingMode::RegularLongEvent, 14.5, NOW, 2.0, 15.0).unwrap();
        assert_eq!(faint.len(), 1);
        assert_eq!(faint[0].cadence_hours, 72.0);
        assert!(determine_obs_config(&policy, &t, ObservingMode::Other, 14.5, NOW, 2.0, 15.0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_state_machine() {
        let store = MemoryStore::new();
        let scheduler = MemoryScheduler::new();
        let oracle = oracle();
        let selector = StrategySelector::new(&store, &scheduler, &oracle, TapPolicy::default(), true);

        let mut other = Target::new("var", 270.5, -28.0, TargetKind::Sidereal, 2000.0);
        other.extras.classification = Some("Variable".into());
        assert_eq!(
            selector.evaluate(&other, NOW).unwrap().extras.observing_mode,
            Some(ObservingMode::Excluded)
        );

        let hcz = add_target(&store, "hcz", 268.14, -29.03, fitted_extras(NOW - 2.0, 0.05, 30.0));
        let e = selector.evaluate(&hcz, NOW).unwrap();
        assert_eq!(e.extras.observing_mode, Some(ObservingMode::No));
        assert_eq!(e.extras.sky_location, Some(SkyLocation::InHcz));

        let dead = add_target(&store, "dead", 270.5, -28.0, fitted_extras(NOW - 100.0, 0.05, 30.0));
        let e = selector.evaluate(&dead, NOW).unwrap();
        assert_eq!(e.extras.observing_mode, Some(ObservingMode::No));
        assert_eq!(e.extras.sky_location, Some(SkyLocation::OutsideHcz));
        assert_eq!(e.extras.alive, Some(false));

        let north = add_target(&store, "north", 30.0, 70.0, fitted_extras(NOW - 2.0, 0.05, 30.0));
        let e = selector.evaluate(&north, NOW).unwrap();
        assert_eq!(e.extras.observing_mode, None);
        assert!(e.configs.is_empty());
    }

    #[test]
    fn test_priority_event_submitted_once() {
        let store = MemoryStore::new();
        let scheduler = MemoryScheduler::new();
        let oracle = oracle();
        let selector = StrategySelector::new(&store, &scheduler, &oracle, TapPolicy::default(), true);
        add_target(&store, "ev", 270.5, -28.0, fitted_extras(NOW - 2.0, 0.05, 30.0));

        let report = selector.run(&TapSelection::AllAlive, NOW).unwrap();
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.submitted, 2);

        let saved = store.get("ev").unwrap();
        assert_eq!(saved.extras.observing_mode, Some(ObservingMode::PriorityStellarEvent));
        assert_eq!(saved.extras.category, Some(TimescaleCategory::StellarPlanet));
        assert!(saved.extras.planet_priority.unwrap() > 10.0);
        assert!(saved.extras.mag_now.unwrap() < 15.0);

        // unchanged event one hour later: nothing new
        let again = selector.run(&TapSelection::Named("ev".into()), NOW + 1.0 / 24.0).unwrap();
        assert_eq!(again.submitted, 0);
        assert_eq!(again.duplicates, 2);
        assert_eq!(scheduler.pending().len(), 2);
        assert_eq!(store.data("ev", Some(DataType::TapPriority)).unwrap().len(), 2);
    }

    #[test]
    fn test_insane_event_skipped_and_dry_run() {
        let store = MemoryStore::new();
        let scheduler = MemoryScheduler::new();
        let oracle = oracle();
        let selector = StrategySelector::new(&store, &scheduler, &oracle, TapPolicy::default(), false);

        let mut broken = fitted_extras(NOW - 2.0, 0.05, 30.0);
        broken.te = None;
        add_target(&store, "broken", 270.5, -28.0, broken);
        add_target(&store, "ev", 270.5, -28.0, fitted_extras(NOW - 2.0, 0.05, 30.0));

        let report = selector.run(&TapSelection::AllAlive, NOW).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.submitted, 0);
        assert!(scheduler.pending().is_empty());
    }

    #[test]
    fn test_dead_event_leaves_the_queue() {
        let store = MemoryStore::new();
        let scheduler = MemoryScheduler::new();
        let oracle = oracle();
        let selector = StrategySelector::new(&store, &scheduler, &oracle, TapPolicy::default(), true);
        let mut extras = fitted_extras(NOW - 100.0, 0.05, 30.0);
        extras.last_fit = Some(NOW - 1.0);
        add_target(&store, "dead", 270.5, -28.0, extras);

        let report = selector.run(&TapSelection::AllAlive, NOW).unwrap();
        assert_eq!(report.evaluated, 1);
        assert_eq!(store.get("dead").unwrap().extras.alive, Some(false));
        assert!(store.find(&TargetFilter::alive()).unwrap().is_empty());
        assert!(store.claim_stale(4.0, NOW).unwrap().is_none());
    }

    /// Answers with an HTTP error status for one target.
    struct FailingScheduler {
        inner: MemoryScheduler,
        failing: &'static str,
    }

    impl SchedulerApi for FailingScheduler {
        fn submit(&self, configs: &[ObservationConfig]) -> Result<Vec<SubmissionOutcome>, MopError> {
            self.inner.submit(configs)
        }

        fn list_pending(&self, target: &str) -> Result<Vec<ObservationConfig>, MopError> {
            if target == self.failing {
                return Err(MopError::UreqHttpError(ureq::Error::StatusCode(500)));
            }
            self.inner.list_pending(target)
        }
    }

    #[test]
    fn test_scheduler_error_isolated_to_its_event() {
        let store = MemoryStore::new();
        let scheduler = FailingScheduler {
            inner: MemoryScheduler::new(),
            failing: "a",
        };
        let oracle = oracle();
        let selector = StrategySelector::new(&store, &scheduler, &oracle, TapPolicy::default(), true);
        add_target(&store, "a", 270.5, -28.0, fitted_extras(NOW - 2.0, 0.05, 30.0));
        add_target(&store, "b", 270.5, -28.0, fitted_extras(NOW - 2.0, 0.05, 30.0));

        let report = selector.run(&TapSelection::AllAlive, NOW).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.submitted, 2);
        let pending = scheduler.inner.pending();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|(_, c)| c.target == "b"));
    }
}
