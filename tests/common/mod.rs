#![allow(dead_code)]

use mop::constants::MICROLENSING;
use mop::fit::pspl;
use mop::photometry::{flux_to_magnitude, magnitude_to_flux, PhotometryPoint};
use mop::store::{Datum, Store};
use mop::target::TargetKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Parameters of a synthetic static PSPL light curve.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticEvent {
    pub t0: f64,
    pub u0: f64,
    pub te: f64,
    pub source_mag: f64,
    pub blend_mag: f64,
}

impl SyntheticEvent {
    pub fn magnitude(&self, jd: f64) -> f64 {
        let a = pspl::magnification(((jd - self.t0) / self.te).hypot(self.u0));
        flux_to_magnitude(magnitude_to_flux(self.source_mag) * a + magnitude_to_flux(self.blend_mag))
            .unwrap()
    }

    /// `n` evenly spaced noiseless points over `[start, end]`.
    pub fn photometry(&self, start: f64, end: f64, n: usize, error: f64, filter: &str) -> Vec<PhotometryPoint> {
        (0..n)
            .map(|i| {
                let jd = start + (end - start) * i as f64 / (n - 1) as f64;
                PhotometryPoint::new(jd, self.magnitude(jd), error, filter)
            })
            .collect()
    }

    /// Same as [`SyntheticEvent::photometry`] with Gaussian noise of standard deviation `error`.
    pub fn noisy_photometry(
        &self,
        start: f64,
        end: f64,
        n: usize,
        error: f64,
        seed: u64,
    ) -> Vec<PhotometryPoint> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.photometry(start, end, n, error, "I")
            .into_iter()
            .map(|mut p| {
                p.magnitude += error * gaussian(&mut rng);
                p
            })
            .collect()
    }
}

/// Standard normal deviate (Box–Muller).
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Register an alive microlensing event with its photometry.
pub fn add_event(store: &dyn Store, name: &str, ra: f64, dec: f64, last_fit: Option<f64>, points: &[PhotometryPoint]) {
    let (mut target, _) = store
        .get_or_create(name, ra, dec, TargetKind::Sidereal, 2000.0)
        .unwrap();
    target.extras.classification = Some(MICROLENSING.to_string());
    target.extras.alive = Some(true);
    target.extras.last_fit = last_fit;
    store.save_extras(name, &target.extras).unwrap();
    for point in points {
        store.append_datum(Datum::photometry(name, "OGLE", point)).unwrap();
    }
}
