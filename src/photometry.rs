//! # Photometry series
//!
//! Time-ordered brightness measurements of one target from one data source.
//!
//! A [`PhotometrySeries`] keeps its points sorted by Julian Date and refuses a
//! second point at an already-known timestamp: re-ingesting a light curve must
//! never silently replace a measurement that a previous fit already used.
//!
//! Two plain-text readers are provided:
//!
//! * [`PhotometrySeries::from_table`] – uploaded tables with the columns
//!   `time filter magnitude error` (JD or MJD),
//! * [`PhotometrySeries::from_columns`] – survey light curves with the columns
//!   `jd magnitude error [...]` and a fixed filter (e.g. OGLE `phot.dat`).
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::constants::{JulianDate, Magnitude, MAG_TO_FLUX_ERR, ZERO_POINT};
use crate::mop_errors::MopError;
use crate::time::normalize_to_jd;

/// One photometric measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotometryPoint {
    pub jd: JulianDate,
    pub magnitude: Magnitude,
    pub error: Magnitude,
    pub filter: String,
}

impl PhotometryPoint {
    pub fn new(jd: JulianDate, magnitude: Magnitude, error: Magnitude, filter: &str) -> Self {
        PhotometryPoint {
            jd,
            magnitude,
            error,
            filter: filter.to_string(),
        }
    }

    /// Whether the point can enter a fit (finite values, strictly positive error).
    pub fn is_usable(&self) -> bool {
        self.jd.is_finite() && self.magnitude.is_finite() && self.error.is_finite() && self.error > 0.0
    }

    /// Flux and flux error on the [`ZERO_POINT`] scale.
    pub fn to_flux(&self) -> (f64, f64) {
        let flux = magnitude_to_flux(self.magnitude);
        (flux, self.error * flux * MAG_TO_FLUX_ERR)
    }
}

/// Convert a magnitude to a flux on the [`ZERO_POINT`] scale.
pub fn magnitude_to_flux(magnitude: Magnitude) -> f64 {
    10f64.powf((ZERO_POINT - magnitude) / 2.5)
}

/// Convert a flux on the [`ZERO_POINT`] scale to a magnitude.
///
/// Non-positive fluxes have no magnitude.
pub fn flux_to_magnitude(flux: f64) -> Option<Magnitude> {
    (flux > 0.0 && flux.is_finite()).then(|| ZERO_POINT - 2.5 * flux.log10())
}

/// Time-ascending photometry of a target from a single source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhotometrySeries {
    source: String,
    points: Vec<PhotometryPoint>,
}

impl PhotometrySeries {
    pub fn new(source: &str) -> Self {
        PhotometrySeries {
            source: source.to_string(),
            points: Vec::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn points(&self) -> &[PhotometryPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Insert a point, keeping the series time-ordered.
    ///
    /// Return
    /// ------
    /// * [`MopError::DuplicateDatum`] if a point already exists at the same JD.
    pub fn insert(&mut self, target: &str, point: PhotometryPoint) -> Result<(), MopError> {
        match self
            .points
            .binary_search_by(|p| p.jd.total_cmp(&point.jd))
        {
            Ok(_) => Err(MopError::DuplicateDatum {
                target: target.to_string(),
                source_name: self.source.clone(),
                timestamp: point.jd,
            }),
            Err(idx) => {
                self.points.insert(idx, point);
                Ok(())
            }
        }
    }

    /// Build a series from unordered points, rejecting duplicated timestamps.
    pub fn from_points(
        target: &str,
        source: &str,
        points: impl IntoIterator<Item = PhotometryPoint>,
    ) -> Result<Self, MopError> {
        let mut series = PhotometrySeries::new(source);
        for point in points {
            series.insert(target, point)?;
        }
        Ok(series)
    }

    /// Merge several single-source series into one multi-filter series for fitting.
    ///
    /// Points sharing a timestamp across sources are all kept: the uniqueness
    /// constraint only holds within a source.
    pub fn combined<'a>(series: impl IntoIterator<Item = &'a PhotometrySeries>) -> Vec<PhotometryPoint> {
        series
            .into_iter()
            .flat_map(|s| s.points.iter().cloned())
            .sorted_by(|a, b| a.jd.total_cmp(&b.jd))
            .collect()
    }

    /// Latest timestamp of the series.
    pub fn last_jd(&self) -> Option<JulianDate> {
        self.points.last().map(|p| p.jd)
    }

    /// Distinct filters present in the series, in first-seen order.
    pub fn filters(&self) -> Vec<String> {
        self.points.iter().map(|p| p.filter.clone()).unique().collect()
    }

    /// Read an uploaded photometry table with the columns `time filter magnitude error`.
    ///
    /// Blank lines and lines starting with `#` are ignored. Times above 2400000.5
    /// are Julian Dates, smaller values are Modified Julian Dates.
    pub fn from_table(target: &str, source: &str, content: &str) -> Result<Self, MopError> {
        let mut series = PhotometrySeries::new(source);
        for (lineno, line) in data_lines(content) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [time, filter, magnitude, error] = fields.as_slice() else {
                return Err(MopError::ParsingError(format!(
                    "photometry table line {lineno}: expected 4 columns, got {}",
                    fields.len()
                )));
            };
            let point = PhotometryPoint::new(
                normalize_to_jd(parse_float(time, lineno)?),
                parse_float(magnitude, lineno)?,
                parse_float(error, lineno)?,
                filter,
            );
            series.insert(target, point)?;
        }

        if series.is_empty() {
            return Err(MopError::ParsingError(
                "photometry table is empty".to_string(),
            ));
        }
        Ok(series)
    }

    /// Read a survey light curve whose first three columns are `jd magnitude error`.
    ///
    /// Extra columns (seeing, sky level, ...) are ignored.
    pub fn from_columns(
        target: &str,
        source: &str,
        filter: &str,
        content: &str,
    ) -> Result<Self, MopError> {
        let mut series = PhotometrySeries::new(source);
        for (lineno, line) in data_lines(content) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return Err(MopError::ParsingError(format!(
                    "light curve line {lineno}: expected at least 3 columns"
                )));
            }
            let point = PhotometryPoint::new(
                normalize_to_jd(parse_float(fields[0], lineno)?),
                parse_float(fields[1], lineno)?,
                parse_float(fields[2], lineno)?,
                filter,
            );
            series.insert(target, point)?;
        }
        Ok(series)
    }
}

fn data_lines(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn parse_float(field: &str, lineno: usize) -> Result<f64, MopError> {
    field
        .parse()
        .map_err(|_| MopError::ParsingError(format!("line {lineno}: invalid number '{field}'")))
}

#[cfg(test)]
mod photometry_test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_insert_keeps_order() {
        let mut series = PhotometrySeries::new("OGLE");
        series
            .insert("ev", PhotometryPoint::new(2459002.0, 18.0, 0.01, "I"))
            .unwrap();
        series
            .insert("ev", PhotometryPoint::new(2459000.0, 18.5, 0.01, "I"))
            .unwrap();
        series
            .insert("ev", PhotometryPoint::new(2459001.0, 18.2, 0.01, "I"))
            .unwrap();

        let jds: Vec<f64> = series.points().iter().map(|p| p.jd).collect();
        assert_eq!(jds, vec![2459000.0, 2459001.0, 2459002.0]);
        assert_eq!(series.last_jd(), Some(2459002.0));
    }

    #[test]
    fn test_duplicate_timestamp_rejected() {
        let mut series = PhotometrySeries::new("OGLE");
        series
            .insert("ev", PhotometryPoint::new(2459000.0, 18.0, 0.01, "I"))
            .unwrap();
        let err = series
            .insert("ev", PhotometryPoint::new(2459000.0, 17.0, 0.01, "I"))
            .unwrap_err();

        assert_eq!(
            err,
            MopError::DuplicateDatum {
                target: "ev".into(),
                source_name: "OGLE".into(),
                timestamp: 2459000.0
            }
        );
        // the original measurement is untouched
        assert_eq!(series.points()[0].magnitude, 18.0);
    }

    #[test]
    fn test_from_table() {
        let content = "# time filter magnitude error\n\
                       2459000.5 ip 17.25 0.02\n\
                       59001.0 gp 18.10 0.03\n\n";
        let series = PhotometrySeries::from_table("ev", "upload", content).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.points()[1].jd, 2459001.5);
        assert_eq!(series.filters(), vec!["ip".to_string(), "gp".to_string()]);

        assert!(PhotometrySeries::from_table("ev", "upload", "# nothing\n").is_err());
        assert!(PhotometrySeries::from_table("ev", "upload", "2459000.5 ip 17.25\n").is_err());
    }

    #[test]
    fn test_from_columns() {
        let content = "2459000.12345 17.512 0.011 4.2 1200\n2459000.22345 17.498 0.010 4.0 1100\n";
        let series = PhotometrySeries::from_columns("ev", "OGLE", "OGLE_I", content).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.points()[0].filter, "OGLE_I");
    }

    #[test]
    fn test_flux_conversion() {
        assert_relative_eq!(magnitude_to_flux(ZERO_POINT), 1.0);
        assert_relative_eq!(flux_to_magnitude(magnitude_to_flux(18.3)).unwrap(), 18.3, epsilon = 1e-12);
        assert_eq!(flux_to_magnitude(-1.0), None);

        let (flux, err) = PhotometryPoint::new(0.0, ZERO_POINT, 0.1, "I").to_flux();
        assert_relative_eq!(flux, 1.0);
        assert_relative_eq!(err, 0.1 * MAG_TO_FLUX_ERR);
    }

    #[test]
    fn test_combined_sources() {
        let a = PhotometrySeries::from_points(
            "ev",
            "OGLE",
            vec![PhotometryPoint::new(3.0, 18.0, 0.01, "I"), PhotometryPoint::new(1.0, 18.0, 0.01, "I")],
        )
        .unwrap();
        let b = PhotometrySeries::from_points("ev", "LCO", vec![PhotometryPoint::new(1.0, 17.0, 0.01, "ip")])
            .unwrap();
        let combined = PhotometrySeries::combined([&a, &b]);
        assert_eq!(combined.len(), 3);
        assert!(combined.windows(2).all(|w| w[0].jd <= w[1].jd));
    }
}
