//! # Fit job queue
//!
//! Several workers (threads or processes) drain the same store. Each
//! iteration claims the alive target with the oldest `last_fit` older than the
//! staleness window; the claim advances `last_fit` to now, so the other
//! workers skip it. The target is then fitted outside any transaction and the
//! results are written back.
//!
//! A target whose processing fails keeps its advanced `last_fit` and is
//! retried after the next staleness window. The queue is drained when no
//! target can be claimed.
//!
//! [`JobQueueCoordinator::run_selection`] refits a whole [`FitSelection`]
//! in random order instead, without claims or staleness checks.
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::constants::{JulianDate, LAST_FIT_SENTINEL, MOP_SOURCE};
use crate::fit::ModelFitter;
use crate::liveness::is_alive;
use crate::mop_errors::MopError;
use crate::photometry::PhotometrySeries;
use crate::store::{DataType, Datum, Store};
use crate::target::{Target, TargetFilter};
use crate::time::Clock;

/// What happened to a claimed target.
#[derive(Debug, PartialEq)]
pub enum JobOutcome {
    /// New model saved; carries the updated liveness.
    Fitted { alive: bool },
    /// Not a microlensing event: marked dead without fitting.
    NotMicrolensing,
    /// No photometry newer than the last model.
    NoNewData,
    /// Processing failed; the claim timestamp is kept.
    Failed(MopError),
}

/// Counters of a drained queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub fitted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: &JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::Fitted { .. } => self.fitted += 1,
            JobOutcome::NotMicrolensing | JobOutcome::NoNewData => self.skipped += 1,
            JobOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Targets refitted by a full pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FitSelection {
    All,
    Alive,
    /// Targets whose name contains one of the years, e.g. `[2023,2024]`.
    Years(Vec<String>),
}

impl FitSelection {
    fn filter(&self) -> TargetFilter {
        match self {
            FitSelection::Alive => TargetFilter::alive(),
            FitSelection::All | FitSelection::Years(_) => TargetFilter::all(),
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            FitSelection::Years(years) => years.iter().any(|year| name.contains(year.as_str())),
            FitSelection::All | FitSelection::Alive => true,
        }
    }
}

impl FromStr for FitSelection {
    type Err = MopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "all" => Ok(FitSelection::All),
            "alive" => Ok(FitSelection::Alive),
            list if list.starts_with('[') && list.ends_with(']') => {
                let years: Vec<String> = list[1..list.len() - 1]
                    .split(',')
                    .map(str::trim)
                    .filter(|y| !y.is_empty())
                    .map(str::to_string)
                    .collect();
                if years.is_empty() {
                    return Err(MopError::ParsingError(format!("empty year list {list}")));
                }
                Ok(FitSelection::Years(years))
            }
            other => Err(MopError::ParsingError(format!(
                "fit selection '{other}', expected all, alive or [years]"
            ))),
        }
    }
}

pub struct JobQueueCoordinator<'a> {
    store: &'a dyn Store,
    fitter: &'a ModelFitter,
    clock: &'a dyn Clock,
    window_hours: f64,
}

impl<'a> JobQueueCoordinator<'a> {
    /// Arguments
    /// ---------
    /// * `window_hours`: minimum age of `last_fit` for a target to be claimed
    pub fn new(
        store: &'a dyn Store,
        fitter: &'a ModelFitter,
        clock: &'a dyn Clock,
        window_hours: f64,
    ) -> Result<Self, MopError> {
        if !(window_hours.is_finite() && window_hours > 0.0) {
            return Err(MopError::InvalidConfig(format!(
                "run_every must be a positive number of hours, got {window_hours}"
            )));
        }
        Ok(JobQueueCoordinator {
            store,
            fitter,
            clock,
            window_hours,
        })
    }

    /// Give every target without `last_fit` the sentinel date, making it claimable.
    ///
    /// Return
    /// ------
    /// * the number of updated targets
    pub fn backfill_last_fit(&self) -> Result<usize, MopError> {
        let missing = self.store.find(&TargetFilter {
            missing_last_fit: Some(true),
            ..TargetFilter::default()
        })?;
        for target in &missing {
            let mut extras = target.extras.clone();
            extras.last_fit = Some(LAST_FIT_SENTINEL);
            self.store.save_extras(&target.name, &extras)?;
        }
        if !missing.is_empty() {
            info!(n_targets = missing.len(), "backfilled last_fit");
        }
        Ok(missing.len())
    }

    /// Claim and process one target.
    ///
    /// Return
    /// ------
    /// * `None` when the queue is drained, else the target name and its outcome.
    ///   Only errors of the claim itself are returned as `Err`.
    pub fn run_once(&self) -> Result<Option<(String, JobOutcome)>, MopError> {
        let now = self.clock.now_jd()?;
        let target = loop {
            match self.store.claim_stale(self.window_hours, now) {
                Ok(Some(target)) => break target,
                Ok(None) => return Ok(None),
                // another worker won the race: look for the next candidate
                Err(MopError::StoreConflict(reason)) => debug!("claim lost: {reason}"),
                Err(err) => return Err(err),
            }
        };
        debug!(event = %target.name, "claimed");

        let outcome = self.process_logged(&target, now, false);
        Ok(Some((target.name, outcome)))
    }

    /// Process targets until none can be claimed.
    pub fn run(&self) -> Result<DrainReport, MopError> {
        let mut report = DrainReport::default();
        while let Some((_, outcome)) = self.run_once()? {
            report.record(&outcome);
        }
        info!(
            processed = report.processed,
            fitted = report.fitted,
            skipped = report.skipped,
            failed = report.failed,
            "queue drained"
        );
        Ok(report)
    }

    /// Refit every target of `selection`, shuffled with `rng`, even without new data.
    ///
    /// Failures are isolated per target as in [`JobQueueCoordinator::run`].
    pub fn run_selection<R: Rng + ?Sized>(
        &self,
        selection: &FitSelection,
        rng: &mut R,
    ) -> Result<DrainReport, MopError> {
        let now = self.clock.now_jd()?;
        let mut targets = self.store.find(&selection.filter())?;
        targets.retain(|t| selection.matches(&t.name));
        targets.shuffle(rng);
        info!(n_targets = targets.len(), ?selection, "fitting selection");

        let mut report = DrainReport::default();
        for target in &targets {
            report.record(&self.process_logged(target, now, true));
        }
        info!(
            processed = report.processed,
            fitted = report.fitted,
            skipped = report.skipped,
            failed = report.failed,
            "selection fitted"
        );
        Ok(report)
    }

    fn process_logged(&self, target: &Target, now: JulianDate, refit: bool) -> JobOutcome {
        match self.process(target, now, refit) {
            Ok(outcome) => outcome,
            Err(err) if err.is_per_target() => {
                warn!(event = %target.name, "fit failed: {err}");
                JobOutcome::Failed(err)
            }
            Err(err) => {
                error!(event = %target.name, "fit failed: {err}");
                JobOutcome::Failed(err)
            }
        }
    }

    fn process(&self, target: &Target, now: JulianDate, refit: bool) -> Result<JobOutcome, MopError> {
        let mut extras = target.extras.clone();
        if !extras.is_microlensing() {
            info!(event = %target.name, "not a microlensing event, marked dead");
            extras.alive = Some(false);
            self.store.save_extras(&target.name, &extras)?;
            return Ok(JobOutcome::NotMicrolensing);
        }

        let points = PhotometrySeries::combined(&self.store.photometry(&target.name)?);
        let newest = points.last().map(|p| p.jd);
        // the last model datum is stamped with the time of the previous fit
        let previous_fit = if refit {
            None
        } else {
            self.store
                .latest_datum(&target.name, DataType::LightCurveModel)?
                .map(|d| d.timestamp)
        };
        if let Some(previous_fit) = previous_fit {
            if newest.map_or(true, |jd| jd < previous_fit) {
                debug!(event = %target.name, "no new data since the last model");
                return Ok(JobOutcome::NoNewData);
            }
        }

        info!(event = %target.name, n_points = points.len(), "fitting");
        let fit = self.fitter.fit(&points, target.ra, target.dec)?;
        let alive = is_alive(now, Some(fit.t0), Some(fit.te));
        extras.record_fit(&fit, alive);
        extras.last_fit = Some(now);
        self.store.save_extras(&target.name, &extras)?;

        let model = Datum::light_curve_model(&target.name, MOP_SOURCE, now, &fit.model_curve);
        match self.store.append_datum(model) {
            Ok(()) => {}
            Err(err @ MopError::DuplicateDatum { .. }) => warn!("{err}"),
            Err(err) => return Err(err),
        }
        info!(
            event = %target.name,
            t0 = fit.t0,
            u0 = fit.u0,
            te = fit.te,
            red_chi2 = fit.red_chi2,
            alive,
            "model saved"
        );
        Ok(JobOutcome::Fitted { alive })
    }
}

#[cfg(test)]
mod coordinator_test {
    use super::*;
    use crate::constants::MICROLENSING;
    use crate::fit::{pspl, FitParams};
    use crate::photometry::{flux_to_magnitude, magnitude_to_flux, PhotometryPoint};
    use crate::store::memory::MemoryStore;
    use crate::target::TargetKind;
    use crate::time::FixedClock;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const NOW: f64 = 2459010.0;

    fn fitter() -> ModelFitter {
        ModelFitter::new(FitParams::builder().fit_parallax(false).build().unwrap()).unwrap()
    }

    fn add_event(store: &MemoryStore, name: &str, classification: &str, last_fit: Option<f64>) {
        store
            .get_or_create(name, 270.5, -28.0, TargetKind::Sidereal, 2000.0)
            .unwrap();
        let mut target = store.get(name).unwrap();
        target.extras.classification = Some(classification.to_string());
        target.extras.alive = Some(true);
        target.extras.last_fit = last_fit;
        store.save_extras(name, &target.extras).unwrap();
    }

    fn add_photometry(store: &MemoryStore, name: &str, t0: f64, until: f64) {
        let (fs, fb) = (magnitude_to_flux(18.0), magnitude_to_flux(19.0));
        let mut jd = t0 - 40.0;
        while jd <= until {
            let a = pspl::magnification(((jd - t0) / 15.0).hypot(0.2));
            let point = PhotometryPoint::new(jd, flux_to_magnitude(fs * a + fb).unwrap(), 0.01, "I");
            store.append_datum(Datum::photometry(name, "OGLE", &point)).unwrap();
            jd += 1.0;
        }
    }

    #[test]
    fn test_backfill() {
        let store = MemoryStore::new();
        let fitter = fitter();
        let clock = FixedClock(NOW);
        add_event(&store, "a", MICROLENSING, None);
        add_event(&store, "b", MICROLENSING, Some(NOW - 1.0));

        let queue = JobQueueCoordinator::new(&store, &fitter, &clock, 4.0).unwrap();
        assert_eq!(queue.backfill_last_fit().unwrap(), 1);
        assert_eq!(store.get("a").unwrap().extras.last_fit, Some(LAST_FIT_SENTINEL));
        assert_eq!(store.get("b").unwrap().extras.last_fit, Some(NOW - 1.0));
        assert_eq!(queue.backfill_last_fit().unwrap(), 0);
    }

    #[test]
    fn test_drain() {
        let store = MemoryStore::new();
        let fitter = fitter();
        let clock = FixedClock(NOW);
        add_event(&store, "ev", MICROLENSING, None);
        add_photometry(&store, "ev", NOW - 5.0, NOW - 0.5);
        add_event(&store, "star", "Variable", None);
        add_event(&store, "empty", MICROLENSING, None);
        // fitted one hour ago: inside the window
        add_event(&store, "fresh", MICROLENSING, Some(NOW - 1.0 / 24.0));

        let queue = JobQueueCoordinator::new(&store, &fitter, &clock, 4.0).unwrap();
        queue.backfill_last_fit().unwrap();
        let report = queue.run().unwrap();
        assert_eq!(
            report,
            DrainReport {
                processed: 3,
                fitted: 1,
                skipped: 1,
                failed: 1
            }
        );

        let ev = store.get("ev").unwrap();
        assert_eq!(ev.extras.last_fit, Some(NOW));
        assert_eq!(ev.extras.alive, Some(true));
        assert!((ev.extras.te.unwrap() - 15.0).abs() < 0.15);
        assert!(ev.extras.fit_covariance.is_some());
        assert_eq!(store.data("ev", Some(DataType::LightCurveModel)).unwrap().len(), 1);

        assert_eq!(store.get("star").unwrap().extras.alive, Some(false));
        // failed fit keeps the advanced claim
        assert_eq!(store.get("empty").unwrap().extras.last_fit, Some(NOW));
        assert_eq!(store.get("fresh").unwrap().extras.last_fit, Some(NOW - 1.0 / 24.0));
    }

    #[test]
    fn test_no_new_data_skipped() {
        let store = MemoryStore::new();
        let fitter = fitter();
        add_event(&store, "ev", MICROLENSING, Some(LAST_FIT_SENTINEL));
        add_photometry(&store, "ev", NOW - 5.0, NOW - 0.5);

        let first = FixedClock(NOW);
        let queue = JobQueueCoordinator::new(&store, &fitter, &first, 4.0).unwrap();
        let (name, outcome) = queue.run_once().unwrap().unwrap();
        assert_eq!(name, "ev");
        assert_eq!(outcome, JobOutcome::Fitted { alive: true });

        let later = FixedClock(NOW + 1.0);
        let queue = JobQueueCoordinator::new(&store, &fitter, &later, 4.0).unwrap();
        let (_, outcome) = queue.run_once().unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::NoNewData);
        assert_eq!(queue.run_once().unwrap(), None);
    }

    #[test]
    fn test_invalid_window() {
        let store = MemoryStore::new();
        let fitter = fitter();
        let clock = FixedClock(NOW);
        assert!(JobQueueCoordinator::new(&store, &fitter, &clock, -1.0).is_err());
        assert!(JobQueueCoordinator::new(&store, &fitter, &clock, 0.0).is_err());
    }

    #[test]
    fn test_fit_selection_parsing() {
        assert_eq!("all".parse::<FitSelection>().unwrap(), FitSelection::All);
        assert_eq!("alive".parse::<FitSelection>().unwrap(), FitSelection::Alive);
        assert_eq!(
            "[2023, 2024]".parse::<FitSelection>().unwrap(),
            FitSelection::Years(vec!["2023".into(), "2024".into()])
        );
        assert!("[]".parse::<FitSelection>().is_err());
        assert!("need".parse::<FitSelection>().is_err());
    }

    #[test]
    fn test_run_selection() {
        let store = MemoryStore::new();
        let fitter = fitter();
        let clock = FixedClock(NOW);
        for name in ["OGLE-2020-BLG-0001", "OGLE-2021-BLG-0002", "OGLE-2019-BLG-0003"] {
            add_event(&store, name, MICROLENSING, Some(NOW - 1.0 / 24.0));
            add_photometry(&store, name, NOW - 5.0, NOW - 0.5);
        }
        let mut dead = store.get("OGLE-2019-BLG-0003").unwrap();
        dead.extras.alive = Some(false);
        store.save_extras(&dead.name, &dead.extras).unwrap();

        let queue = JobQueueCoordinator::new(&store, &fitter, &clock, 4.0).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        let years = FitSelection::Years(vec!["2020".into(), "2019".into()]);
        let report = queue.run_selection(&years, &mut rng).unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.fitted, 2);
        assert_eq!(store.get("OGLE-2021-BLG-0002").unwrap().extras.last_fit, Some(NOW - 1.0 / 24.0));

        // refitted even though nothing new arrived and the window has not elapsed;
        // the 2019 event came back alive with its refit
        let report = queue.run_selection(&FitSelection::Alive, &mut rng).unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.fitted, 3);
        assert_eq!(store.data("OGLE-2020-BLG-0001", Some(DataType::LightCurveModel)).unwrap().len(), 1);

        let report = queue.run_selection(&FitSelection::All, &mut rng).unwrap();
        assert_eq!(report.fitted, 3);
    }
}
