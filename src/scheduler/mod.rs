//! # Observation requests
//!
//! [`ObservationConfig`] is a proposed exposure sequence for one target in one
//! filter. Configurations are ephemeral: they are either submitted to a
//! [`SchedulerApi`] or dropped because an equivalent request is already
//! pending.
//!
//! Two configurations are duplicates when they share the target and the
//! filter and their time windows overlap. [`submit_deduplicated`] applies
//! that rule against the scheduler's pending requests (and within the batch),
//! so running a strategy pass twice on an unchanged event submits nothing the
//! second time.
pub mod lco;
pub mod memory;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::Degree;
use crate::mop_errors::MopError;
use crate::visibility::TimeWindow;

/// A proposed request for one target and one filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationConfig {
    pub target: String,
    pub ra: Degree,
    pub dec: Degree,
    /// Telescope class, e.g. `1m0`.
    pub telescope_class: String,
    pub instrument_type: String,
    pub filter: String,
    /// Exposure time in seconds.
    pub exposure_time: f64,
    pub exposure_count: u32,
    /// Interval between visits, in hours.
    pub cadence_hours: f64,
    pub window: TimeWindow,
    /// Intra-proposal priority.
    pub ipp: f64,
    pub max_airmass: f64,
    pub min_lunar_distance: Degree,
}

impl ObservationConfig {
    /// Same target, same filter, overlapping windows.
    pub fn duplicates(&self, other: &ObservationConfig) -> bool {
        self.target == other.target && self.filter == other.filter && self.window.overlaps(&other.window)
    }

    /// Name of the request group sent to the scheduler.
    pub fn group_name(&self) -> String {
        format!("{}_{}_{}", self.target, self.filter, self.window.start.round() as i64)
    }
}

/// Answer of the scheduler for one submitted configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Accepted { id: String },
    Rejected { reason: String },
}

/// Remote telescope scheduler.
pub trait SchedulerApi: Send + Sync {
    /// Submit configurations; one outcome per configuration, in order.
    fn submit(&self, configs: &[ObservationConfig]) -> Result<Vec<SubmissionOutcome>, MopError>;

    /// Requests of `target` still waiting to be executed.
    fn list_pending(&self, target: &str) -> Result<Vec<ObservationConfig>, MopError>;
}

/// Summary of a deduplicated submission.
#[derive(Debug, Default, PartialEq)]
pub struct SubmissionReport {
    /// Identifiers of the accepted requests.
    pub accepted: Vec<String>,
    /// Errors of the rejected requests.
    pub rejected: Vec<MopError>,
    /// Configurations dropped as duplicates.
    pub duplicates: usize,
}

/// Remove configurations duplicating a pending request or an earlier entry of the batch.
///
/// Return
/// ------
/// * the configurations to submit and the number of dropped ones
pub fn filter_duplicates(
    configs: Vec<ObservationConfig>,
    pending: &[ObservationConfig],
) -> (Vec<ObservationConfig>, usize) {
    let total = configs.len();
    let mut kept: Vec<ObservationConfig> = Vec::with_capacity(total);
    for config in configs {
        if !pending.iter().chain(kept.iter()).any(|p| p.duplicates(&config)) {
            kept.push(config);
        }
    }
    let dropped = total - kept.len();
    (kept, dropped)
}

/// Submit the configurations of `target` that do not duplicate a pending request.
///
/// Rejections are logged and reported; they are not retried.
pub fn submit_deduplicated(
    scheduler: &dyn SchedulerApi,
    target: &str,
    configs: Vec<ObservationConfig>,
) -> Result<SubmissionReport, MopError> {
    let pending = scheduler.list_pending(target)?;
    let (fresh, duplicates) = filter_duplicates(configs, &pending);
    let mut report = SubmissionReport {
        duplicates,
        ..SubmissionReport::default()
    };
    if fresh.is_empty() {
        info!(event = %target, duplicates, "nothing new to submit");
        return Ok(report);
    }

    let outcomes = scheduler.submit(&fresh)?;
    for (config, outcome) in fresh.iter().zip(outcomes) {
        match outcome {
            SubmissionOutcome::Accepted { id } => {
                info!(event = %target, filter = %config.filter, id = %id, "request accepted");
                report.accepted.push(id);
            }
            SubmissionOutcome::Rejected { reason } => {
                let err = MopError::SubmissionRejected {
                    target: target.to_string(),
                    reason,
                };
                warn!(filter = %config.filter, "{err}");
                report.rejected.push(err);
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
pub(crate) mod scheduler_test {
    use super::*;

    pub(crate) fn config(target: &str, filter: &str, start: f64, end: f64) -> ObservationConfig {
        ObservationConfig {
            target: target.to_string(),
            ra: 268.0,
            dec: -29.0,
            telescope_class: "1m0".into(),
            instrument_type: "1M0-SCICAM-SINISTRO".into(),
            filter: filter.to_string(),
            exposure_time: 120.0,
            exposure_count: 1,
            cadence_hours: 8.0,
            window: TimeWindow::new(start, end).unwrap(),
            ipp: 1.0,
            max_airmass: 2.0,
            min_lunar_distance: 15.0,
        }
    }

    #[test]
    fn test_duplicate_rule() {
        let a = config("ev", "ip", 10.0, 11.0);
        assert!(a.duplicates(&config("ev", "ip", 10.5, 12.0)));
        assert!(!a.duplicates(&config("ev", "gp", 10.5, 12.0)));
        assert!(!a.duplicates(&config("ev", "ip", 11.0, 12.0)));
        assert!(!a.duplicates(&config("other", "ip", 10.0, 11.0)));
    }

    #[test]
    fn test_filter_duplicates() {
        let pending = vec![config("ev", "ip", 10.0, 11.0)];
        let batch = vec![
            config("ev", "ip", 10.5, 11.5),
            config("ev", "gp", 10.5, 11.5),
            config("ev", "gp", 10.6, 11.6),
        ];
        let (kept, dropped) = filter_duplicates(batch, &pending);
        assert_eq!(dropped, 2);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].filter, "gp");
        assert_eq!(kept[0].group_name(), "ev_gp_11");
    }
}
