//! # Targets and their derived attributes
//!
//! A [`Target`] is a sky position with a unique name. Everything the pipeline
//! derives about it (fit parameters, liveness, priorities, observing decision,
//! claim timestamp) lives in a strongly typed [`TargetExtras`] record.
//!
//! ## Persistence
//!
//! [`TargetExtras`] serialises to a flat JSON object whose keys are the
//! historical attribute names (`Alive`, `t0`, `tE`, `Fit_covariance`, ...).
//! Unknown keys are preserved in [`TargetExtras::other`] so that attributes
//! written by other tools survive a read/modify/write cycle.
//!
//! The covariance matrix is stored as a nested JSON array of rows
//! ([`CovarianceMatrix`]); together with `serde_json`'s `float_roundtrip`
//! feature this round-trips bit for bit.
//!
//! ## Validation
//!
//! Consumers never read an optional field directly when they need it: the
//! `require_*` accessors turn a missing or non-finite value into
//! [`MopError::MissingExtra`] naming the target and the field.
use std::collections::BTreeMap;
use std::fmt;

use nalgebra::{DMatrix, Matrix3};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{Degree, JulianDate, Magnitude, MICROLENSING};
use crate::fit::FitResult;
use crate::mop_errors::MopError;

/// How the position of a target evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TargetKind {
    #[default]
    Sidereal,
    NonSidereal,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Sidereal => write!(f, "SIDEREAL"),
            TargetKind::NonSidereal => write!(f, "NON_SIDEREAL"),
        }
    }
}

impl std::str::FromStr for TargetKind {
    type Err = MopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SIDEREAL" => Ok(TargetKind::Sidereal),
            "NON_SIDEREAL" => Ok(TargetKind::NonSidereal),
            other => Err(MopError::ParsingError(format!("target kind '{other}'"))),
        }
    }
}

/// Observing decision taken by the last strategy pass.
///
/// `None` in [`TargetExtras::observing_mode`] means the event was skipped for
/// that pass (not visible, or no current magnitude).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservingMode {
    #[serde(rename = "excluded")]
    Excluded,
    No,
    #[serde(rename = "priority_stellar_event")]
    PriorityStellarEvent,
    #[serde(rename = "priority_long_event")]
    PriorityLongEvent,
    #[serde(rename = "regular_long_event")]
    RegularLongEvent,
    #[serde(rename = "other")]
    Other,
}

/// Position of the event with respect to the partner high-cadence survey footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkyLocation {
    #[serde(rename = "In HCZ")]
    InHcz,
    #[serde(rename = "Outside HCZ")]
    OutsideHcz,
}

/// Timescale class of a fitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimescaleCategory {
    #[serde(rename = "Stellar/planet")]
    StellarPlanet,
    #[serde(rename = "Long tE")]
    LongTe,
}

/// A square covariance matrix stored row by row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CovarianceMatrix(pub Vec<Vec<f64>>);

impl CovarianceMatrix {
    pub fn from_matrix(matrix: &DMatrix<f64>) -> Self {
        CovarianceMatrix(
            matrix
                .row_iter()
                .map(|row| row.iter().copied().collect())
                .collect(),
        )
    }

    /// Convert back to a dense matrix, checking that every row has the same length
    /// as the number of rows.
    pub fn to_matrix(&self) -> Option<DMatrix<f64>> {
        let n = self.0.len();
        if self.0.iter().any(|row| row.len() != n) {
            return None;
        }
        Some(DMatrix::from_fn(n, n, |i, j| self.0[i][j]))
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    /// The `(t0, u0, tE)` block in the leading corner.
    pub fn leading_3x3(&self) -> Option<Matrix3<f64>> {
        if self.0.len() < 3 || self.0.iter().take(3).any(|row| row.len() < 3) {
            return None;
        }
        Some(Matrix3::from_fn(|i, j| self.0[i][j]))
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().flatten().all(|v| v.is_finite())
    }
}

/// Attributes derived by the pipeline and attached to a [`Target`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetExtras {
    #[serde(rename = "Classification", default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(rename = "Alive", default, skip_serializing_if = "Option::is_none")]
    pub alive: Option<bool>,
    #[serde(rename = "Last_fit", default, skip_serializing_if = "Option::is_none")]
    pub last_fit: Option<JulianDate>,
    #[serde(rename = "Latest_data_HJD", default, skip_serializing_if = "Option::is_none")]
    pub latest_data_hjd: Option<JulianDate>,

    #[serde(rename = "t0", default, skip_serializing_if = "Option::is_none")]
    pub t0: Option<JulianDate>,
    #[serde(rename = "t0_error", default, skip_serializing_if = "Option::is_none")]
    pub t0_error: Option<f64>,
    #[serde(rename = "u0", default, skip_serializing_if = "Option::is_none")]
    pub u0: Option<f64>,
    #[serde(rename = "u0_error", default, skip_serializing_if = "Option::is_none")]
    pub u0_error: Option<f64>,
    #[serde(rename = "tE", default, skip_serializing_if = "Option::is_none")]
    pub te: Option<f64>,
    #[serde(rename = "tE_error", default, skip_serializing_if = "Option::is_none")]
    pub te_error: Option<f64>,
    #[serde(rename = "piEN", default, skip_serializing_if = "Option::is_none")]
    pub pi_en: Option<f64>,
    #[serde(rename = "piEN_error", default, skip_serializing_if = "Option::is_none")]
    pub pi_en_error: Option<f64>,
    #[serde(rename = "piEE", default, skip_serializing_if = "Option::is_none")]
    pub pi_ee: Option<f64>,
    #[serde(rename = "piEE_error", default, skip_serializing_if = "Option::is_none")]
    pub pi_ee_error: Option<f64>,
    #[serde(rename = "t0_par", default, skip_serializing_if = "Option::is_none")]
    pub t0_par: Option<JulianDate>,

    #[serde(rename = "Source_magnitude", default, skip_serializing_if = "Option::is_none")]
    pub source_magnitude: Option<Magnitude>,
    #[serde(rename = "Blend_magnitude", default, skip_serializing_if = "Option::is_none")]
    pub blend_magnitude: Option<Magnitude>,
    #[serde(rename = "Baseline_magnitude", default, skip_serializing_if = "Option::is_none")]
    pub baseline_magnitude: Option<Magnitude>,

    #[serde(rename = "Fit_covariance", default, skip_serializing_if = "Option::is_none")]
    pub fit_covariance: Option<CovarianceMatrix>,
    #[serde(rename = "Chi2", default, skip_serializing_if = "Option::is_none")]
    pub chi2: Option<f64>,
    #[serde(rename = "red_chi2", default, skip_serializing_if = "Option::is_none")]
    pub red_chi2: Option<f64>,
    #[serde(rename = "KS_test", default, skip_serializing_if = "Option::is_none")]
    pub ks_statistic: Option<f64>,
    #[serde(rename = "AD_test", default, skip_serializing_if = "Option::is_none")]
    pub ad_statistic: Option<f64>,
    #[serde(rename = "JB_test", default, skip_serializing_if = "Option::is_none")]
    pub jb_statistic: Option<f64>,

    #[serde(rename = "TAP_priority", default, skip_serializing_if = "Option::is_none")]
    pub planet_priority: Option<f64>,
    #[serde(rename = "TAP_priority_error", default, skip_serializing_if = "Option::is_none")]
    pub planet_priority_error: Option<f64>,
    #[serde(rename = "TAP_priority_longtE", default, skip_serializing_if = "Option::is_none")]
    pub long_priority: Option<f64>,
    #[serde(rename = "TAP_priority_longtE_error", default, skip_serializing_if = "Option::is_none")]
    pub long_priority_error: Option<f64>,
    #[serde(rename = "Category", default, skip_serializing_if = "Option::is_none")]
    pub category: Option<TimescaleCategory>,
    #[serde(rename = "Mag_now", default, skip_serializing_if = "Option::is_none")]
    pub mag_now: Option<Magnitude>,
    #[serde(rename = "Observing_mode", default, skip_serializing_if = "Option::is_none")]
    pub observing_mode: Option<ObservingMode>,
    #[serde(rename = "Sky_location", default, skip_serializing_if = "Option::is_none")]
    pub sky_location: Option<SkyLocation>,

    /// Attributes not modelled above, kept verbatim.
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

fn require_finite(
    value: Option<f64>,
    target: &str,
    field: &'static str,
) -> Result<f64, MopError> {
    match value {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(MopError::MissingExtra {
            target: target.to_string(),
            field,
        }),
    }
}

impl TargetExtras {
    pub fn is_microlensing(&self) -> bool {
        self.classification.as_deref() == Some(MICROLENSING)
    }

    pub fn require_t0(&self, target: &str) -> Result<JulianDate, MopError> {
        require_finite(self.t0, target, "t0")
    }

    pub fn require_u0(&self, target: &str) -> Result<f64, MopError> {
        require_finite(self.u0, target, "u0")
    }

    /// Einstein timescale, which must also be strictly positive.
    pub fn require_te(&self, target: &str) -> Result<f64, MopError> {
        let te = require_finite(self.te, target, "tE")?;
        if te <= 0.0 {
            return Err(MopError::MissingExtra {
                target: target.to_string(),
                field: "tE",
            });
        }
        Ok(te)
    }

    /// Covariance with at least the `(t0, u0, tE)` block and only finite entries.
    pub fn require_covariance(&self, target: &str) -> Result<&CovarianceMatrix, MopError> {
        match &self.fit_covariance {
            Some(cov) if cov.dim() >= 3 && cov.is_finite() && cov.to_matrix().is_some() => Ok(cov),
            _ => Err(MopError::MissingExtra {
                target: target.to_string(),
                field: "Fit_covariance",
            }),
        }
    }

    /// Copy every fitted quantity of `fit` into the record.
    ///
    /// Priority and observing-decision fields are left untouched: they belong to
    /// the strategy pass.
    pub fn record_fit(&mut self, fit: &FitResult, alive: bool) {
        self.alive = Some(alive);
        self.t0 = Some(fit.t0);
        self.t0_error = Some(fit.t0_error);
        self.u0 = Some(fit.u0);
        self.u0_error = Some(fit.u0_error);
        self.te = Some(fit.te);
        self.te_error = Some(fit.te_error);
        self.pi_en = Some(fit.pi_en);
        self.pi_en_error = Some(fit.pi_en_error);
        self.pi_ee = Some(fit.pi_ee);
        self.pi_ee_error = Some(fit.pi_ee_error);
        self.t0_par = Some(fit.t0_par);
        self.source_magnitude = fit.source_magnitude;
        self.blend_magnitude = fit.blend_magnitude;
        self.baseline_magnitude = fit.baseline_magnitude;
        self.fit_covariance = Some(CovarianceMatrix::from_matrix(&fit.covariance));
        self.chi2 = Some(fit.chi2);
        self.red_chi2 = Some(fit.red_chi2);
        self.ks_statistic = Some(fit.normality.ks_statistic);
        self.ad_statistic = Some(fit.normality.ad_statistic);
        self.jb_statistic = Some(fit.normality.jb_statistic);
        self.latest_data_hjd = Some(fit.latest_data_jd);
    }
}

/// A named sky position followed by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub ra: Degree,
    pub dec: Degree,
    pub kind: TargetKind,
    pub epoch: f64,
    pub extras: TargetExtras,
}

impl Target {
    pub fn new(name: &str, ra: Degree, dec: Degree, kind: TargetKind, epoch: f64) -> Self {
        Target {
            name: name.to_string(),
            ra,
            dec,
            kind,
            epoch,
            extras: TargetExtras::default(),
        }
    }
}

/// Selection criteria for [`Store::find`](crate::store::Store::find).
///
/// Every criterion left to `None` matches all targets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetFilter {
    pub name: Option<String>,
    pub classification: Option<String>,
    pub alive: Option<bool>,
    /// `Some(true)` selects targets that were never given a `last_fit`.
    pub missing_last_fit: Option<bool>,
}

impl TargetFilter {
    pub fn all() -> Self {
        TargetFilter::default()
    }

    pub fn named(name: &str) -> Self {
        TargetFilter {
            name: Some(name.to_string()),
            ..TargetFilter::default()
        }
    }

    pub fn alive() -> Self {
        TargetFilter {
            alive: Some(true),
            ..TargetFilter::default()
        }
    }

    pub fn matches(&self, target: &Target) -> bool {
        self.name.as_ref().map_or(true, |n| n == &target.name)
            && self
                .classification
                .as_ref()
                .map_or(true, |c| target.extras.classification.as_ref() == Some(c))
            && self
                .alive
                .map_or(true, |a| target.extras.alive.unwrap_or(false) == a)
            && self
                .missing_last_fit
                .map_or(true, |m| target.extras.last_fit.is_none() == m)
    }
}

#[cfg(test)]
mod target_test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extras_json_keys() {
        let extras = TargetExtras {
            classification: Some(MICROLENSING.into()),
            alive: Some(true),
            te: Some(25.0),
            observing_mode: Some(ObservingMode::PriorityStellarEvent),
            sky_location: Some(SkyLocation::OutsideHcz),
            category: Some(TimescaleCategory::StellarPlanet),
            ..TargetExtras::default()
        };
        let value = serde_json::to_value(&extras).unwrap();
        assert_eq!(
            value,
            json!({
                "Classification": "Microlensing",
                "Alive": true,
                "tE": 25.0,
                "Observing_mode": "priority_stellar_event",
                "Sky_location": "Outside HCZ",
                "Category": "Stellar/planet"
            })
        );
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let raw = r#"{"Alive": false, "Spectras": 2, "Note": "check blend"}"#;
        let extras: TargetExtras = serde_json::from_str(raw).unwrap();
        assert_eq!(extras.alive, Some(false));
        assert_eq!(extras.other.get("Spectras"), Some(&json!(2)));

        let back = serde_json::to_value(&extras).unwrap();
        assert_eq!(back["Note"], json!("check blend"));
    }

    #[test]
    fn test_require_accessors() {
        let mut extras = TargetExtras {
            te: Some(0.0),
            t0: Some(f64::NAN),
            ..TargetExtras::default()
        };
        assert_eq!(
            extras.require_te("ev"),
            Err(MopError::MissingExtra {
                target: "ev".into(),
                field: "tE"
            })
        );
        assert!(extras.require_t0("ev").is_err());
        assert!(extras.require_covariance("ev").is_err());

        extras.fit_covariance = Some(CovarianceMatrix(vec![vec![1.0, 0.0], vec![0.0, 1.0]]));
        assert!(extras.require_covariance("ev").is_err());

        extras.fit_covariance = Some(CovarianceMatrix(vec![vec![1.0; 3]; 3]));
        assert!(extras.require_covariance("ev").is_ok());
    }

    #[test]
    fn test_covariance_leading_block() {
        let m = DMatrix::from_fn(5, 5, |i, j| (i * 5 + j) as f64);
        let cov = CovarianceMatrix::from_matrix(&m);
        assert_eq!(cov.to_matrix().unwrap(), m);
        let block = cov.leading_3x3().unwrap();
        assert_eq!(block[(2, 1)], 11.0);

        let ragged = CovarianceMatrix(vec![vec![1.0, 2.0], vec![3.0]]);
        assert_eq!(ragged.to_matrix(), None);
    }

    #[test]
    fn test_filter() {
        let mut t = Target::new("ev", 268.0, -29.0, TargetKind::Sidereal, 2000.0);
        assert!(TargetFilter::all().matches(&t));
        assert!(!TargetFilter::alive().matches(&t));
        t.extras.alive = Some(true);
        assert!(TargetFilter::alive().matches(&t));
        assert!(!TargetFilter::named("other").matches(&t));

        let missing = TargetFilter {
            missing_last_fit: Some(true),
            ..TargetFilter::default()
        };
        assert!(missing.matches(&t));
        t.extras.last_fit = Some(2459000.0);
        assert!(!missing.matches(&t));
    }
}
