//! # Low-precision Sun and Moon ephemerides
//!
//! Analytic series from the *Astronomical Almanac* ("low precision formulae"),
//! good to about 0.01° for the Sun and 0.3° for the Moon between 1950 and 2050.
//! That is more than enough both for annual microlensing parallax (which only
//! needs the Earth–Sun vector to a fraction of a percent) and for twilight and
//! lunar-distance constraints.
//!
//! All positions are **geocentric**, in the **mean equatorial frame of date**.
//!
//! Units
//! -----
//! * Sun distance: AU.
//! * Moon distance: Earth radii.
//! * Angles: degrees unless the name says otherwise.
use nalgebra::Vector3;

use crate::constants::{Degree, JulianDate, J2000_JD};

/// Earth radii in one astronomical unit.
const EARTH_RADII_PER_AU: f64 = 23_454.8;

/// Mean obliquity of the ecliptic (degrees) at `jd`.
fn obliquity(jd: JulianDate) -> Degree {
    23.439 - 4.0e-7 * (jd - J2000_JD)
}

fn sin_d(x: Degree) -> f64 {
    x.to_radians().sin()
}

fn cos_d(x: Degree) -> f64 {
    x.to_radians().cos()
}

/// Rotate an ecliptic unit direction `(λ, β)` to equatorial Cartesian coordinates.
fn ecliptic_to_equatorial(lambda: Degree, beta: Degree, eps: Degree) -> Vector3<f64> {
    let (cl, sl) = (cos_d(lambda), sin_d(lambda));
    let (cb, sb) = (cos_d(beta), sin_d(beta));
    let (ce, se) = (cos_d(eps), sin_d(eps));
    Vector3::new(cb * cl, ce * cb * sl - se * sb, se * cb * sl + ce * sb)
}

/// Right ascension and declination (degrees) of a Cartesian direction.
pub fn vector_to_radec(v: &Vector3<f64>) -> (Degree, Degree) {
    let ra = v.y.atan2(v.x).to_degrees().rem_euclid(360.0);
    let dec = (v.z / v.norm()).asin().to_degrees();
    (ra, dec)
}

/// Unit vector pointing at `(ra, dec)` (degrees).
pub fn radec_to_unit(ra: Degree, dec: Degree) -> Vector3<f64> {
    Vector3::new(cos_d(dec) * cos_d(ra), cos_d(dec) * sin_d(ra), sin_d(dec))
}

/// Great-circle separation (degrees) between two sky positions.
pub fn angular_separation(ra1: Degree, dec1: Degree, ra2: Degree, dec2: Degree) -> Degree {
    let a = radec_to_unit(ra1, dec1);
    let b = radec_to_unit(ra2, dec2);
    // atan2 form stays accurate for very small and very large separations
    a.cross(&b).norm().atan2(a.dot(&b)).to_degrees()
}

/// Geocentric position of the Sun at `jd`, in AU.
///
/// Arguments
/// ---------
/// * `jd`: Julian Date (UT is adequate at this precision)
///
/// Return
/// ------
/// * the Sun's geocentric equatorial position vector, in AU
pub fn sun_position(jd: JulianDate) -> Vector3<f64> {
    let n = jd - J2000_JD;
    let mean_longitude = (280.460 + 0.985_647_4 * n).rem_euclid(360.0);
    let g = (357.528 + 0.985_600_3 * n).rem_euclid(360.0);
    let lambda = mean_longitude + 1.915 * sin_d(g) + 0.020 * sin_d(2.0 * g);
    let distance = 1.000_14 - 0.016_71 * cos_d(g) - 0.000_14 * cos_d(2.0 * g);
    ecliptic_to_equatorial(lambda, 0.0, obliquity(jd)) * distance
}

/// Right ascension and declination of the Sun (degrees).
pub fn sun_radec(jd: JulianDate) -> (Degree, Degree) {
    vector_to_radec(&sun_position(jd))
}

/// Geocentric position of the Moon at `jd`, in Earth radii.
pub fn moon_position(jd: JulianDate) -> Vector3<f64> {
    let t = (jd - J2000_JD) / 36_525.0;

    let lambda = 218.32 + 481_267.881 * t
        + 6.29 * sin_d(135.0 + 477_198.87 * t)
        - 1.27 * sin_d(259.3 - 413_335.36 * t)
        + 0.66 * sin_d(235.7 + 890_534.22 * t)
        + 0.21 * sin_d(269.9 + 954_397.74 * t)
        - 0.19 * sin_d(357.5 + 35_999.05 * t)
        - 0.11 * sin_d(186.5 + 966_404.03 * t);

    let beta = 5.13 * sin_d(93.3 + 483_202.02 * t)
        + 0.28 * sin_d(228.2 + 960_400.89 * t)
        - 0.28 * sin_d(318.3 + 6_003.15 * t)
        - 0.17 * sin_d(217.6 - 407_332.21 * t);

    let horizontal_parallax = 0.9508
        + 0.0518 * cos_d(135.0 + 477_198.87 * t)
        + 0.0095 * cos_d(259.3 - 413_335.36 * t)
        + 0.0078 * cos_d(235.7 + 890_534.22 * t)
        + 0.0028 * cos_d(269.9 + 954_397.74 * t);

    let distance = 1.0 / sin_d(horizontal_parallax);
    ecliptic_to_equatorial(lambda.rem_euclid(360.0), beta, obliquity(jd)) * distance
}

/// Right ascension and declination of the Moon (degrees).
pub fn moon_radec(jd: JulianDate) -> (Degree, Degree) {
    vector_to_radec(&moon_position(jd))
}

/// Lunar phase angle (degrees) at `jd`: 0 at full Moon, 180 at new Moon.
pub fn moon_phase_angle(jd: JulianDate) -> Degree {
    let sun = sun_position(jd) * EARTH_RADII_PER_AU;
    let moon = moon_position(jd);
    // angle Sun-Moon-Earth
    let moon_to_sun = sun - moon;
    let moon_to_earth = -moon;
    moon_to_sun
        .cross(&moon_to_earth)
        .norm()
        .atan2(moon_to_sun.dot(&moon_to_earth))
        .to_degrees()
}

/// Illuminated fraction of the lunar disc (0 = new, 1 = full).
pub fn moon_illumination(jd: JulianDate) -> f64 {
    (1.0 + cos_d(moon_phase_angle(jd))) / 2.0
}

#[cfg(test)]
mod ephemeris_test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sun_at_equinox() {
        // 2021-03-20 09:37 UT, March equinox
        let (ra, dec) = sun_radec(2459293.90);
        assert!(dec.abs() < 0.05, "dec = {dec}");
        assert!(ra < 0.1 || ra > 359.9, "ra = {ra}");
    }

    #[test]
    fn test_sun_distance() {
        // perihelion early January, aphelion early July
        assert_relative_eq!(sun_position(2459218.5).norm(), 0.9833, epsilon = 2e-4);
        assert_relative_eq!(sun_position(2459400.5).norm(), 1.0167, epsilon = 2e-4);
    }

    #[test]
    fn test_angular_separation() {
        assert_relative_eq!(angular_separation(10.0, 0.0, 20.0, 0.0), 10.0, epsilon = 1e-10);
        assert_relative_eq!(angular_separation(0.0, 90.0, 123.0, 0.0), 90.0, epsilon = 1e-10);
        assert_relative_eq!(angular_separation(45.0, -30.0, 45.0, -30.0), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_moon_phases() {
        // full Moon 2021-01-28 19:16 UT, new Moon 2021-02-11 19:06 UT
        assert!(moon_illumination(2459243.30) > 0.98);
        assert!(moon_illumination(2459257.30) < 0.02);
        assert!(moon_phase_angle(2459243.30) < 15.0);
    }

    #[test]
    fn test_moon_distance() {
        let d = moon_position(2459243.30).norm();
        assert!((55.0..65.0).contains(&d), "distance = {d}");
    }
}
