//! # Constants and type definitions for MOP
//!
//! This module centralizes the **physical constants**, **conversion factors**, and **common type
//! definitions** used throughout the `mop` library.
//!
//! ## Overview
//!
//! - Astronomical constants (J2000, Julian Date offsets, photometric zero point)
//! - Unit conversions (degrees ↔ radians, hours ↔ days)
//! - Core type aliases used across the crate
//! - Scheduling constants (claim sentinel, liveness horizon, default staleness window)

// -------------------------------------------------------------------------------------------------
// Physical constants and unit conversions
// -------------------------------------------------------------------------------------------------

/// 2π, useful for trigonometric conversions
pub const DPI: f64 = 2. * std::f64::consts::PI;

/// Julian Date of J2000.0 (2000-01-01 12:00:00 TT)
pub const J2000_JD: f64 = 2_451_545.0;

/// Conversion factor between Julian Date and Modified Julian Date
pub const JDTOMJD: f64 = 2400000.5;

/// Number of hours in a day
pub const HOURS_PER_DAY: f64 = 24.0;

/// Earth equatorial radius (m), WGS84
pub const EARTH_MAJOR_AXIS: Meter = 6_378_137.0;

/// Earth polar radius (m), WGS84
pub const EARTH_MINOR_AXIS: Meter = 6_356_752.3;

/// Photometric zero point used to move between magnitudes and fluxes.
pub const ZERO_POINT: f64 = 27.4;

/// ln(10) / 2.5, the derivative factor between magnitude and relative flux errors.
pub const MAG_TO_FLUX_ERR: f64 = std::f64::consts::LN_10 / 2.5;

// -------------------------------------------------------------------------------------------------
// Scheduling constants
// -------------------------------------------------------------------------------------------------

/// Far-past `last_fit` value written to targets that were never claimed
/// (1986-12-11), so that every target eventually becomes eligible.
pub const LAST_FIT_SENTINEL: JulianDate = 2446756.5;

/// Number of Einstein timescales after peak beyond which an event is over.
pub const ALIVE_HORIZON_TE: f64 = 2.0;

/// Default staleness window of the fitting queue, in hours.
pub const DEFAULT_RUN_EVERY_HOURS: f64 = 4.0;

/// Default look-back for the last photometric point when it is unknown, in days.
pub const DEFAULT_DATA_GAP_DAYS: f64 = 30.0;

/// Classification tag of events handled by the fitter.
pub const MICROLENSING: &str = "Microlensing";

/// Source tag used for data products produced by this crate.
pub const MOP_SOURCE: &str = "MOP";

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Angle in degrees
pub type Degree = f64;
/// Distance in meters
pub type Meter = f64;
/// Julian Date (days)
pub type JulianDate = f64;
/// Modified Julian Date (days)
pub type MJD = f64;
/// Apparent magnitude
pub type Magnitude = f64;
