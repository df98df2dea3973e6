use hifitime::{Epoch, Unit};
use std::str::FromStr;

use crate::constants::{JulianDate, DPI, JDTOMJD, MJD};
use crate::mop_errors::MopError;

/// Source of the current time for the scheduling loop.
///
/// Production code uses [`SystemClock`]; tests pin the time with [`FixedClock`]
/// so that staleness windows and liveness checks are reproducible.
pub trait Clock: Send + Sync {
    /// Current time as a UTC Julian Date.
    fn now_jd(&self) -> Result<JulianDate, MopError>;
}

/// Wall-clock time from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_jd(&self) -> Result<JulianDate, MopError> {
        Ok(Epoch::now()?.to_jde_utc_days())
    }
}

/// A clock frozen at a given Julian Date.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub JulianDate);

impl Clock for FixedClock {
    fn now_jd(&self) -> Result<JulianDate, MopError> {
        Ok(self.0)
    }
}

/// Transformation from modified julian date (MJD) in julian date (JD)
pub fn mjd_to_jd(mjd: MJD) -> JulianDate {
    Epoch::from_mjd_utc(mjd).to_jde_utc_days()
}

/// Transformation from julian date (JD) in modified julian date (MJD)
pub fn jd_to_mjd(jd: JulianDate) -> MJD {
    Epoch::from_jde_utc(jd).to_mjd_utc_days()
}

/// Interpret a photometric timestamp that may be either a JD or an MJD.
///
/// Values above the JD/MJD offset are taken as Julian Dates, anything below
/// as Modified Julian Dates.
pub fn normalize_to_jd(time: f64) -> JulianDate {
    if time > JDTOMJD {
        time
    } else {
        time + JDTOMJD
    }
}

/// Parse a calendar date (`YYYY-MM-DDTHH:MM:SS`, optional trailing `Z` or ` UTC`)
/// into a UTC Julian Date.
///
/// Return
/// ------
/// * the Julian Date, or [`MopError::InvalidTimeRange`] if the string cannot be parsed
pub fn parse_iso_to_jd(date: &str) -> Result<JulianDate, MopError> {
    let trimmed = date.trim();
    let trimmed = trimmed.strip_suffix('Z').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix(" UTC").unwrap_or(trimmed);
    Epoch::from_str(trimmed)
        .map(|epoch| epoch.to_jde_utc_days())
        .map_err(|err| MopError::InvalidTimeRange(format!("cannot parse '{date}': {err}")))
}

/// Format a UTC Julian Date as `YYYY-MM-DDTHH:MM:SS`, rounded to the second.
pub fn jd_to_iso(jd: JulianDate) -> String {
    let epoch = Epoch::from_jde_utc(jd).round(Unit::Second * 1);
    let text = format!("{epoch}");
    let text = text.strip_suffix(" UTC").unwrap_or(&text);
    // hifitime prints sub-second digits only when they are non-zero
    match text.split_once('.') {
        Some((whole, _)) => whole.to_string(),
        None => text.to_string(),
    }
}

/// Compute the Greenwich Mean Sidereal Time (GMST) in radians
/// for a given Modified Julian Date (UT1 time scale).
///
/// This function implements the IAU 1982/2000 polynomial formula
/// for the mean sidereal time at 0h UT1, plus the fractional-day
/// correction term due to Earth's rotation rate.
///
/// # Arguments
/// * `tjm` - Modified Julian Date (MJD, UT1 time scale)
///
/// # Returns
/// * GMST angle in radians, normalized to the interval [0, 2π).
pub fn gmst(tjm: MJD) -> f64 {
    // Polynomial coefficients for GMST at 0h UT1 (in seconds)
    const C0: f64 = 24110.54841;
    const C1: f64 = 8640184.812866;
    const C2: f64 = 9.3104e-2;
    const C3: f64 = -6.2e-6;

    // Ratio of sidereal day to solar day
    const RAP: f64 = 1.00273790934;

    // MJD of J2000.0
    const T2000: f64 = 51544.5;

    let itjm = tjm.floor();
    let t = (itjm - T2000) / 36525.0;

    let mut gmst0 = ((C3 * t + C2) * t + C1) * t + C0;
    gmst0 *= DPI / 86400.0;

    let h = tjm.fract() * DPI;
    let gmst = gmst0 + h * RAP;

    gmst.rem_euclid(DPI)
}

/// Local mean sidereal time (radians) at a site of given east longitude.
pub fn local_sidereal_time(jd: JulianDate, longitude_deg: f64) -> f64 {
    (gmst(jd - JDTOMJD) + longitude_deg.to_radians()).rem_euclid(DPI)
}
