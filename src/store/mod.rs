//! # Target store
//!
//! The pipeline reads and writes targets through the [`Store`] trait:
//!
//! * targets are looked up with a [`TargetFilter`] or by name, and created
//!   idempotently with [`Store::get_or_create`];
//! * [`Store::claim_stale`] is the job-queue primitive. It atomically selects
//!   one alive target whose `last_fit` is at least `window_hours` old, skipping
//!   targets locked by another worker, and advances its `last_fit` to `now`
//!   before returning it;
//! * derived attributes are written back as a whole [`TargetExtras`] record;
//! * photometry, light-curve models and priority history are append-only
//!   [`Datum`] records, unique per `(target, source, type, timestamp)`.
//!
//! Two implementations are provided: [`memory::MemoryStore`] for tests and
//! single-process runs, [`sqlite::SqliteStore`] for a database shared by
//! several worker processes.
pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{Degree, JulianDate, Magnitude};
use crate::mop_errors::MopError;
use crate::photometry::{PhotometryPoint, PhotometrySeries};
use crate::priority::PriorityScore;
use crate::target::{Target, TargetExtras, TargetFilter, TargetKind};

/// Kind of a stored [`Datum`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Photometry,
    LightCurveModel,
    TapPriority,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Photometry => "photometry",
            DataType::LightCurveModel => "lc_model",
            DataType::TapPriority => "TAP_priority",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = MopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "photometry" => Ok(DataType::Photometry),
            "lc_model" => Ok(DataType::LightCurveModel),
            "TAP_priority" => Ok(DataType::TapPriority),
            other => Err(MopError::ParsingError(format!("data type '{other}'"))),
        }
    }
}

/// Payload of a stored datum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatumValue {
    Photometry {
        magnitude: Magnitude,
        error: Magnitude,
        filter: String,
    },
    LightCurveModel {
        #[serde(rename = "lc_model_time")]
        times: Vec<JulianDate>,
        #[serde(rename = "lc_model_magnitude")]
        magnitudes: Vec<Magnitude>,
    },
    TapPriority(PriorityScore),
}

impl DatumValue {
    pub fn data_type(&self) -> DataType {
        match self {
            DatumValue::Photometry { .. } => DataType::Photometry,
            DatumValue::LightCurveModel { .. } => DataType::LightCurveModel,
            DatumValue::TapPriority(_) => DataType::TapPriority,
        }
    }
}

/// A timestamped data product attached to a target.
#[derive(Debug, Clone, PartialEq)]
pub struct Datum {
    pub target: String,
    pub source: String,
    pub timestamp: JulianDate,
    pub value: DatumValue,
}

impl Datum {
    pub fn new(target: &str, source: &str, timestamp: JulianDate, value: DatumValue) -> Self {
        Datum {
            target: target.to_string(),
            source: source.to_string(),
            timestamp,
            value,
        }
    }

    pub fn photometry(target: &str, source: &str, point: &PhotometryPoint) -> Self {
        Datum::new(
            target,
            source,
            point.jd,
            DatumValue::Photometry {
                magnitude: point.magnitude,
                error: point.error,
                filter: point.filter.clone(),
            },
        )
    }

    pub fn light_curve_model(target: &str, source: &str, timestamp: JulianDate, curve: &[(JulianDate, Magnitude)]) -> Self {
        let (times, magnitudes) = curve.iter().copied().unzip();
        Datum::new(target, source, timestamp, DatumValue::LightCurveModel { times, magnitudes })
    }

    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }

    /// Whether `other` would violate the uniqueness of `(target, source, type, timestamp)`.
    pub fn collides_with(&self, other: &Datum) -> bool {
        self.target == other.target
            && self.source == other.source
            && self.data_type() == other.data_type()
            && self.timestamp == other.timestamp
    }

    pub(crate) fn duplicate_error(&self) -> MopError {
        MopError::DuplicateDatum {
            target: self.target.clone(),
            source_name: self.source.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Staleness window converted to days.
pub(crate) fn window_days(window_hours: f64) -> f64 {
    window_hours / crate::constants::HOURS_PER_DAY
}

/// Whether a target can be claimed at `now`.
pub(crate) fn is_claimable(target: &Target, window_hours: f64, now: JulianDate) -> bool {
    target.extras.alive == Some(true)
        && target
            .extras
            .last_fit
            .is_some_and(|last| now - last >= window_days(window_hours))
}

/// Persistence of targets and their data products.
pub trait Store: Send + Sync {
    /// Targets matching `filter`, ordered by name.
    fn find(&self, filter: &TargetFilter) -> Result<Vec<Target>, MopError>;

    /// Target called `name`, or [`MopError::TargetNotFound`].
    fn get(&self, name: &str) -> Result<Target, MopError>;

    /// Return the target called `name`, creating it if needed.
    ///
    /// Return
    /// ------
    /// * the target and `true` when it was created by this call. An existing
    ///   target is returned unchanged, whatever the other arguments.
    fn get_or_create(
        &self,
        name: &str,
        ra: Degree,
        dec: Degree,
        kind: TargetKind,
        epoch: f64,
    ) -> Result<(Target, bool), MopError>;

    /// Atomically claim the alive target with the oldest `last_fit` older than
    /// `window_hours`, skipping rows locked by other workers.
    ///
    /// The returned target already carries `last_fit == now`.
    fn claim_stale(&self, window_hours: f64, now: JulianDate) -> Result<Option<Target>, MopError>;

    /// Replace the extras of `name`.
    fn save_extras(&self, name: &str, extras: &TargetExtras) -> Result<(), MopError>;

    /// Append a datum.
    ///
    /// Return
    /// ------
    /// * [`MopError::DuplicateDatum`] if the same target, source, type and
    ///   timestamp already exist
    /// * [`MopError::TargetNotFound`] for an unknown target
    fn append_datum(&self, datum: Datum) -> Result<(), MopError>;

    /// Data of `name`, optionally restricted to one type, ordered by timestamp.
    fn data(&self, name: &str, data_type: Option<DataType>) -> Result<Vec<Datum>, MopError>;

    /// Photometry of `name`, one series per source.
    fn photometry(&self, name: &str) -> Result<Vec<PhotometrySeries>, MopError> {
        let mut by_source: BTreeMap<String, PhotometrySeries> = BTreeMap::new();
        for datum in self.data(name, Some(DataType::Photometry))? {
            if let DatumValue::Photometry { magnitude, error, filter } = datum.value {
                by_source
                    .entry(datum.source.clone())
                    .or_insert_with(|| PhotometrySeries::new(&datum.source))
                    .insert(name, PhotometryPoint::new(datum.timestamp, magnitude, error, &filter))?;
            }
        }
        Ok(by_source.into_values().collect())
    }

    /// Most recent datum of a given type.
    fn latest_datum(&self, name: &str, data_type: DataType) -> Result<Option<Datum>, MopError> {
        Ok(self.data(name, Some(data_type))?.pop())
    }
}
