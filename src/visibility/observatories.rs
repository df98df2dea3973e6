//! # Observing sites
//!
//! A [`Site`] stores the geodetic position of a telescope together with its
//! **geocentric parallax coordinates** (ρ·cosφ′, ρ·sinφ′), used to move the
//! Moon from geocentric to topocentric coordinates.
//!
//! [`SiteRegistry::lco_network`] knows the 1 m telescope sites of the Las
//! Cumbres Observatory network under their usual three-letter codes; more
//! sites can be registered at run time.
use std::collections::BTreeMap;

use nalgebra::Vector3;

use crate::constants::{Degree, JulianDate, Meter, EARTH_MAJOR_AXIS, EARTH_MINOR_AXIS};
use crate::mop_errors::MopError;
use crate::time::local_sidereal_time;

/// Convert geodetic latitude (radians) and height (meters) into normalized
/// parallax coordinates `(ρ·cosφ′, ρ·sinφ′)`, in Earth equatorial radii.
///
/// The computation uses the reference ellipsoid defined by:
/// * `EARTH_MAJOR_AXIS`: Equatorial radius (m),
/// * `EARTH_MINOR_AXIS`: Polar radius (m).
///
/// ```text
/// u = atan( (sin φ * (b/a)) / cos φ )
/// ρ_sinφ = (b/a) * sin u + (h/a) * sin φ
/// ρ_cosφ = cos u + (h/a) * cos φ
/// ```
pub fn lat_alt_to_parallax(lat: f64, height: Meter) -> (f64, f64) {
    let axis_ratio = EARTH_MINOR_AXIS / EARTH_MAJOR_AXIS;

    // parametric latitude
    let u = (lat.sin() * axis_ratio).atan2(lat.cos());

    let rho_sin_phi = axis_ratio * u.sin() + (height / EARTH_MAJOR_AXIS) * lat.sin();
    let rho_cos_phi = u.cos() + (height / EARTH_MAJOR_AXIS) * lat.cos();

    (rho_cos_phi, rho_sin_phi)
}

/// Same as [`lat_alt_to_parallax`] with the latitude in degrees.
pub fn geodetic_to_parallax(lat: Degree, height: Meter) -> (f64, f64) {
    lat_alt_to_parallax(lat.to_radians(), height)
}

/// A ground-based observing site.
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    /// Short identifier, e.g. `"lsc"`.
    pub code: String,
    pub name: String,
    /// Geodetic longitude in degrees, east positive.
    pub longitude: Degree,
    /// Geodetic latitude in degrees.
    pub latitude: Degree,
    /// Height above the ellipsoid in meters.
    pub elevation: Meter,
    rho_cos_phi: f64,
    rho_sin_phi: f64,
}

impl Site {
    pub fn new(code: &str, name: &str, longitude: Degree, latitude: Degree, elevation: Meter) -> Self {
        let (rho_cos_phi, rho_sin_phi) = geodetic_to_parallax(latitude, elevation);
        Site {
            code: code.to_string(),
            name: name.to_string(),
            longitude,
            latitude,
            elevation,
            rho_cos_phi,
            rho_sin_phi,
        }
    }

    pub fn rho_cos_phi(&self) -> f64 {
        self.rho_cos_phi
    }

    pub fn rho_sin_phi(&self) -> f64 {
        self.rho_sin_phi
    }

    /// Geocentric position of the site in the equatorial frame of date, in Earth radii.
    pub fn geocentric_position(&self, jd: JulianDate) -> Vector3<f64> {
        let lst = local_sidereal_time(jd, self.longitude);
        Vector3::new(
            self.rho_cos_phi * lst.cos(),
            self.rho_cos_phi * lst.sin(),
            self.rho_sin_phi,
        )
    }

    /// Altitude (degrees) of a direction `(ra, dec)` seen from the site at `jd`.
    pub fn altitude(&self, jd: JulianDate, ra: Degree, dec: Degree) -> Degree {
        let hour_angle = local_sidereal_time(jd, self.longitude) - ra.to_radians();
        let (sin_lat, cos_lat) = self.latitude.to_radians().sin_cos();
        let (sin_dec, cos_dec) = dec.to_radians().sin_cos();
        (sin_lat * sin_dec + cos_lat * cos_dec * hour_angle.cos())
            .clamp(-1.0, 1.0)
            .asin()
            .to_degrees()
    }
}

/// Plane-parallel airmass, `sec z`. Infinite at or below the horizon.
pub fn airmass(altitude: Degree) -> f64 {
    if altitude <= 0.0 {
        f64::INFINITY
    } else {
        1.0 / altitude.to_radians().sin()
    }
}

/// Sites known to the visibility oracle, by code.
#[derive(Debug, Clone, Default)]
pub struct SiteRegistry {
    sites: BTreeMap<String, Site>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        SiteRegistry::default()
    }

    /// The 1 m telescope sites of the LCO network.
    pub fn lco_network() -> Self {
        let mut registry = SiteRegistry::new();
        for site in [
            Site::new("ogg", "Haleakala Observatory", -156.2575, 20.7069, 3055.0),
            Site::new("coj", "Siding Spring Observatory", 149.0707, -31.2733, 1116.0),
            Site::new("lsc", "Cerro Tololo Inter-American Observatory", -70.8048, -30.1674, 2198.0),
            Site::new("cpt", "South African Astronomical Observatory", 20.8101, -32.3806, 1460.0),
            Site::new("tfn", "Teide Observatory", -16.5111, 28.3000, 2330.0),
            Site::new("elp", "McDonald Observatory", -104.0152, 30.6801, 2070.0),
        ] {
            registry.register(site);
        }
        registry
    }

    /// Add or replace a site.
    pub fn register(&mut self, site: Site) {
        self.sites.insert(site.code.clone(), site);
    }

    /// Look a site up by code (case-insensitive).
    ///
    /// Return
    /// ------
    /// * [`MopError::UnknownObservatory`] if the code is not registered
    pub fn get(&self, code: &str) -> Result<&Site, MopError> {
        self.sites
            .get(&code.trim().to_lowercase())
            .ok_or_else(|| MopError::UnknownObservatory(code.to_string()))
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(String::as_str)
    }
}
