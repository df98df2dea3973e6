//! # Point-source point-lens magnification with annual parallax
//!
//! The source–lens separation, in Einstein radii, is
//!
//! ```text
//! τ = (t − t0) / tE + δτ(t)
//! β = u0 + δβ(t)
//! u = √(τ² + β²)
//! A(u) = (u² + 2) / (u √(u² + 4))
//! ```
//!
//! where `(δτ, δβ)` are the parallax shifts induced by the Earth's orbital
//! motion. Following Gould (2004), the Sun's apparent position is projected
//! onto the North/East basis of the target and expanded around a fixed
//! reference time `t0_par`: only the departure from uniform motion at
//! `t0_par` enters the model, so that `(t0, u0, tE)` keep their geocentric
//! meaning at `t0_par`.
use nalgebra::Vector3;

use crate::constants::{Degree, JulianDate};
use crate::ephemeris::sun_position;

/// Half-width (days) of the finite difference used for the solar velocity.
const SUN_VELOCITY_STEP: f64 = 0.5;

/// Smallest separation used in [`magnification`]; keeps `A` finite at `u = 0`.
const MIN_SEPARATION: f64 = 1e-10;

/// PSPL magnification at separation `u` (Einstein radii).
pub fn magnification(u: f64) -> f64 {
    let u = u.abs().max(MIN_SEPARATION);
    let u2 = u * u;
    (u2 + 2.0) / (u * (u2 + 4.0).sqrt())
}

/// Geometric parameters of the PSPL+parallax model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsplParams {
    pub t0: JulianDate,
    pub u0: f64,
    pub te: f64,
    pub pi_en: f64,
    pub pi_ee: f64,
}

impl PsplParams {
    /// A model without parallax.
    pub fn static_lens(t0: JulianDate, u0: f64, te: f64) -> Self {
        PsplParams {
            t0,
            u0,
            te,
            pi_en: 0.0,
            pi_ee: 0.0,
        }
    }

    /// Magnification at `jd`, given the parallax offset `(ΔN, ΔE)` of that epoch.
    pub fn magnification_at(&self, jd: JulianDate, offset: (f64, f64)) -> f64 {
        let (delta_n, delta_e) = offset;
        let tau = (jd - self.t0) / self.te + self.pi_en * delta_n + self.pi_ee * delta_e;
        let beta = self.u0 - self.pi_en * delta_e + self.pi_ee * delta_n;
        magnification(tau.hypot(beta))
    }
}

/// Sun offsets projected on the sky of one target, relative to `t0_par`.
#[derive(Debug, Clone)]
pub struct ParallaxGeometry {
    t0_par: JulianDate,
    north: Vector3<f64>,
    east: Vector3<f64>,
    sun_ref: Vector3<f64>,
    sun_velocity: Vector3<f64>,
}

impl ParallaxGeometry {
    /// Prepare the projection for a target at `(ra, dec)` (degrees).
    pub fn new(ra: Degree, dec: Degree, t0_par: JulianDate) -> Self {
        let (sa, ca) = ra.to_radians().sin_cos();
        let (sd, cd) = dec.to_radians().sin_cos();

        let east = Vector3::new(-sa, ca, 0.0);
        let north = Vector3::new(-sd * ca, -sd * sa, cd);

        let sun_velocity = (sun_position(t0_par + SUN_VELOCITY_STEP)
            - sun_position(t0_par - SUN_VELOCITY_STEP))
            / (2.0 * SUN_VELOCITY_STEP);

        ParallaxGeometry {
            t0_par,
            north,
            east,
            sun_ref: sun_position(t0_par),
            sun_velocity,
        }
    }

    pub fn t0_par(&self) -> JulianDate {
        self.t0_par
    }

    /// Parallax offset `(ΔN, ΔE)` (AU) at `jd`.
    pub fn offset(&self, jd: JulianDate) -> (f64, f64) {
        let delta =
            sun_position(jd) - self.sun_ref - (jd - self.t0_par) * self.sun_velocity;
        (delta.dot(&self.north), delta.dot(&self.east))
    }
}
