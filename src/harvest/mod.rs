//! # Survey harvesters
//!
//! A [`CatalogHarvester`] lists the events published by a survey and
//! downloads their light curves. Ingestion into the [`Store`] is idempotent:
//!
//! * [`ingest_events`] creates missing targets (classified as microlensing and
//!   alive) and leaves existing ones untouched;
//! * [`ingest_photometry`] only appends points newer than the latest point
//!   already stored for that source.
pub mod ogle;

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::constants::{Degree, MICROLENSING};
use crate::mop_errors::MopError;
use crate::photometry::PhotometrySeries;
use crate::store::{DataType, Datum, Store};
use crate::target::{Target, TargetKind};

/// Events of a survey, by name.
pub type EventCatalog = BTreeMap<String, (Degree, Degree)>;

pub trait CatalogHarvester {
    /// Source name under which the photometry is stored.
    fn source(&self) -> &str;

    /// Events published for the given seasons.
    fn fetch(&self, years: &[String]) -> Result<EventCatalog, MopError>;

    /// Full light curve of one event.
    fn fetch_series(&self, target: &str) -> Result<PhotometrySeries, MopError>;
}

/// Create the events of `catalog` missing from the store.
///
/// Return
/// ------
/// * every target of the catalog, created or not
pub fn ingest_events(store: &dyn Store, catalog: &EventCatalog) -> Result<Vec<Target>, MopError> {
    let mut targets = Vec::with_capacity(catalog.len());
    let mut n_created = 0;
    for (name, &(ra, dec)) in catalog {
        let (mut target, created) = store.get_or_create(name, ra, dec, TargetKind::Sidereal, 2000.0)?;
        if created {
            target.extras.classification = Some(MICROLENSING.to_string());
            target.extras.alive = Some(true);
            store.save_extras(name, &target.extras)?;
            info!(event = %name, "new event");
            n_created += 1;
        }
        targets.push(target);
    }
    info!(n_events = catalog.len(), n_created, "events ingested");
    Ok(targets)
}

/// Append the points of `series` newer than the newest stored point of its source.
///
/// Return
/// ------
/// * the number of appended points
pub fn ingest_series(store: &dyn Store, target: &str, series: &PhotometrySeries) -> Result<usize, MopError> {
    let newest = store
        .data(target, Some(DataType::Photometry))?
        .iter()
        .filter(|d| d.source == series.source())
        .map(|d| d.timestamp)
        .fold(f64::NEG_INFINITY, f64::max);

    let mut appended = 0;
    for point in series.points().iter().filter(|p| p.jd > newest) {
        match store.append_datum(Datum::photometry(target, series.source(), point)) {
            Ok(()) => appended += 1,
            Err(MopError::DuplicateDatum { .. }) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(appended)
}

/// Download and ingest the light curves of `targets`.
///
/// A failing target is logged and skipped.
///
/// Return
/// ------
/// * the total number of appended points
pub fn ingest_photometry(
    store: &dyn Store,
    harvester: &dyn CatalogHarvester,
    targets: &[Target],
) -> Result<usize, MopError> {
    let mut total = 0;
    for target in targets {
        let appended = harvester
            .fetch_series(&target.name)
            .and_then(|series| ingest_series(store, &target.name, &series));
        match appended {
            Ok(0) => info!(event = %target.name, "photometry already up to date"),
            Ok(n) => {
                info!(event = %target.name, n_points = n, "photometry ingested");
                total += n;
            }
            Err(err)
                if err.is_per_target()
                    || matches!(err, MopError::UreqHttpError(_) | MopError::ParsingError(_)) =>
            {
                warn!(event = %target.name, "photometry not ingested: {err}");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}
