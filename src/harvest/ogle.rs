//! OGLE Early Warning System.
//!
//! Each season publishes `{year}/lenses.par`, one event per line:
//!
//! ```text
//! Event          Field      StarNo  RA(J2000)    Dec(J2000)   Tmax(HJD) ...
//! 2024-BLG-0001  BLG500.01  12345   17:52:34.51  -29:01:51.9  2460400.12 ...
//! ```
//!
//! and one light curve per event at `{year}/{field}-{number}/phot.dat`, whose
//! first three columns are `HJD I sigma_I`.
use tracing::{info, warn};

use crate::conversion::{parse_dec_to_deg, parse_ra_to_deg};
use crate::env_state::MopEnv;
use crate::harvest::{CatalogHarvester, EventCatalog};
use crate::mop_errors::MopError;
use crate::photometry::PhotometrySeries;

pub const OGLE_EWS_URL: &str = "https://www.astrouw.edu.pl/ogle/ogle4/ews";
pub const OGLE_SOURCE: &str = "OGLE";
/// Filter name of the OGLE light curves.
pub const OGLE_FILTER: &str = "OGLE_I";

#[derive(Debug, Clone)]
pub struct OgleHarvester {
    env: MopEnv,
    base_url: String,
}

impl OgleHarvester {
    pub fn new(env: MopEnv, base_url: &str) -> Self {
        OgleHarvester {
            env,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Parse a `lenses.par` file into `OGLE-{event}` → `(ra, dec)` in degrees.
///
/// The header and lines with unreadable coordinates are skipped.
pub fn parse_lenses_par(content: &str) -> EventCatalog {
    let mut events = EventCatalog::new();
    for line in content.lines() {
        if line.contains("StarNo") || line.trim().len() <= 5 {
            continue;
        }
        let entries: Vec<&str> = line.split_whitespace().collect();
        let (Some(event), Some(ra), Some(dec)) = (entries.first(), entries.get(3), entries.get(4)) else {
            warn!(line, "truncated lenses.par line");
            continue;
        };
        match (parse_ra_to_deg(ra), parse_dec_to_deg(dec)) {
            (Some((ra, _)), Some((dec, _))) => {
                events.insert(format!("OGLE-{event}"), (ra, dec));
            }
            _ => warn!(event, ra, dec, "unreadable coordinates"),
        }
    }
    events
}

/// `(year, event directory)` of an OGLE event name, e.g.
/// `OGLE-2024-BLG-0001` → `("2024", "blg-0001")`.
pub fn event_path(name: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = name.split('-').collect();
    match parts.as_slice() {
        ["OGLE", year, field, number] => Some((year.to_string(), format!("{field}-{number}").to_lowercase())),
        _ => None,
    }
}

impl CatalogHarvester for OgleHarvester {
    fn source(&self) -> &str {
        OGLE_SOURCE
    }

    fn fetch(&self, years: &[String]) -> Result<EventCatalog, MopError> {
        let mut events = EventCatalog::new();
        for year in years {
            let url = format!("{}/{year}/lenses.par", self.base_url);
            match self.env.get_from_url(url.as_str()) {
                Ok(content) => {
                    let season = parse_lenses_par(&content);
                    info!(year = %year, n_events = season.len(), "OGLE season read");
                    events.extend(season);
                }
                Err(MopError::UreqHttpError(ureq::Error::StatusCode(code))) => {
                    warn!(year = %year, status = code, "OGLE season not available");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(events)
    }

    fn fetch_series(&self, target: &str) -> Result<PhotometrySeries, MopError> {
        let (year, event) = event_path(target)
            .ok_or_else(|| MopError::ParsingError(format!("OGLE event name {target}")))?;
        let url = format!("{}/{year}/{event}/phot.dat", self.base_url);
        let content = self.env.get_from_url(url.as_str())?;
        PhotometrySeries::from_columns(target, OGLE_SOURCE, OGLE_FILTER, &content)
    }
}

#[cfg(test)]
mod ogle_test {
    use super::*;
    use approx::assert_relative_eq;

    const LENSES_PAR: &str = "\
Event          Field      StarNo  RA(J2000)    Dec(J2000)   Tmax(HJD)     Tmax(UT)    tau     umin
2024-BLG-0001  BLG500.01  12345   17:52:34.51  -29:01:51.9  2460400.123  2024-03-30  25.1    0.12
2024-BLG-0002  BLG501.02  54321   18:01:00.00  -27:30:00.0  2460410.500  2024-04-09  40.0    0.30
2024-BLG-0003  BLG501.02  54322   xx:yy        -27:30:00.0  2460410.500  2024-04-09  40.0    0.30
";

    #[test]
    fn test_parse_lenses_par() {
        let events = parse_lenses_par(LENSES_PAR);
        assert_eq!(events.len(), 2);
        let (ra, dec) = events["OGLE-2024-BLG-0001"];
        assert_relative_eq!(ra, 268.1437916666667, epsilon = 1e-10);
        assert_relative_eq!(dec, -29.03108333333333, epsilon = 1e-10);
        assert_relative_eq!(events["OGLE-2024-BLG-0002"].0, 270.25, epsilon = 1e-10);
    }

    #[test]
    fn test_event_path() {
        assert_eq!(
            event_path("OGLE-2024-BLG-0001"),
            Some(("2024".to_string(), "blg-0001".to_string()))
        );
        assert_eq!(event_path("KMT-2024-BLG-0001"), None);
        assert_eq!(event_path("OGLE-2024"), None);
    }
}
