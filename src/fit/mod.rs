//! # PSPL + parallax light-curve fitting
//!
//! This module fits a point-source point-lens model with annual parallax to the
//! photometry of one target, in flux space, and reports everything the
//! scheduler needs downstream: parameters with errors, the full covariance,
//! goodness of fit, residual normality statistics and a synthetic model curve.
//!
//! ## Model
//!
//! For every filter `k` the observed flux is `F(t) = fs_k · A(t) + fb_k`, with
//! the magnification `A` of [`pspl::PsplParams`]. The free parameters are, in
//! this order (which is also the order of the covariance rows):
//!
//! ```text
//! t0, u0, tE, [piEN, piEE], fs_1, fb_1, ..., fs_K, fb_K
//! ```
//!
//! The parallax pair is only free when the series has at least
//! [`FitParams::min_points_parallax`] points; otherwise it is held at zero and
//! reported with a zero error.
//!
//! ## Algorithm
//!
//! 1. Magnitudes are converted to fluxes on the 27.4 zero point.
//! 2. A grid of starting points `u0 × tE` is laid around the brightest
//!    observation (both signs of `u0`: parallax breaks the `±u0` symmetry).
//!    Each start gets its fluxes from a weighted linear solve.
//! 3. Every start is refined with Levenberg–Marquardt
//!    ([`levenberg_marquardt`]) on a rayon pool of [`FitParams::cores`] threads.
//! 4. The converged solution with the lowest χ² wins; its covariance is
//!    `(JᵀWJ)⁻¹`, falling back to a pseudo-inverse when the normal matrix is
//!    singular (degenerate, sparse light curves).
//!
//! ## Errors
//!
//! * [`MopError::InsufficientData`] when fewer than [`FitParams::min_points`]
//!   usable points are available.
//! * [`MopError::FitDivergence`] when no start converges to finite parameters.
//!
//! ## See also
//! ------------
//! * [`crate::liveness`] – consumes `t0` and `tE`.
//! * [`crate::priority`] – consumes the `(t0, u0, tE)` covariance block.
pub mod levenberg_marquardt;
pub mod normality;
pub mod pspl;

use std::cmp::Ordering::{Equal, Greater};
use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{Degree, JulianDate, Magnitude};
use crate::mop_errors::MopError;
use crate::photometry::{flux_to_magnitude, PhotometryPoint};

use levenberg_marquardt::{minimize, LmSettings, LmSolution};
use normality::NormalityStats;
use pspl::{ParallaxGeometry, PsplParams};

/// Configuration of [`ModelFitter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitParams {
    /// Worker threads of the multi-start pool.
    pub cores: usize,
    /// Minimum number of usable photometric points.
    pub min_points: usize,
    /// Whether the parallax components may be fitted at all.
    pub fit_parallax: bool,
    /// Minimum number of points before the parallax components are freed.
    pub min_points_parallax: usize,
    /// Starting impact parameters (absolute values; both signs are tried).
    pub u0_grid: Vec<f64>,
    /// Starting Einstein timescales, in days.
    pub te_grid: Vec<f64>,
    pub max_iterations: usize,
    /// Relative χ² improvement below which a start has converged.
    pub ftol: f64,
    /// Number of samples of the synthetic model curve.
    pub model_curve_points: usize,
}

impl FitParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a [`FitParamsBuilder`] to override the defaults.
    ///
    /// # Example
    ///
    /// ```rust
    /// use mop::fit::FitParams;
    ///
    /// let params = FitParams::builder()
    ///     .cores(4)
    ///     .min_points(10)
    ///     .fit_parallax(false)
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(params.cores, 4);
    /// ```
    pub fn builder() -> FitParamsBuilder {
        FitParamsBuilder::new()
    }
}

impl Default for FitParams {
    fn default() -> Self {
        FitParams {
            cores: 1,
            min_points: 3,
            fit_parallax: true,
            min_points_parallax: 30,
            u0_grid: vec![0.01, 0.1, 0.5, 1.0],
            te_grid: vec![5.0, 20.0, 60.0, 150.0],
            max_iterations: 300,
            ftol: 1e-10,
            model_curve_points: 500,
        }
    }
}

/// Builder for [`FitParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct FitParamsBuilder {
    params: FitParams,
}

impl FitParamsBuilder {
    pub fn new() -> Self {
        Self {
            params: FitParams::default(),
        }
    }

    pub fn cores(mut self, v: usize) -> Self {
        self.params.cores = v;
        self
    }
    pub fn min_points(mut self, v: usize) -> Self {
        self.params.min_points = v;
        self
    }
    pub fn fit_parallax(mut self, v: bool) -> Self {
        self.params.fit_parallax = v;
        self
    }
    pub fn min_points_parallax(mut self, v: usize) -> Self {
        self.params.min_points_parallax = v;
        self
    }
    pub fn u0_grid(mut self, v: Vec<f64>) -> Self {
        self.params.u0_grid = v;
        self
    }
    pub fn te_grid(mut self, v: Vec<f64>) -> Self {
        self.params.te_grid = v;
        self
    }
    pub fn max_iterations(mut self, v: usize) -> Self {
        self.params.max_iterations = v;
        self
    }
    pub fn ftol(mut self, v: f64) -> Self {
        self.params.ftol = v;
        self
    }
    pub fn model_curve_points(mut self, v: usize) -> Self {
        self.params.model_curve_points = v;
        self
    }

    /// Return true iff x > 0.0 and comparable (i.e., not NaN).
    #[inline]
    fn gt0(x: f64) -> bool {
        x.partial_cmp(&0.0) == Some(Greater)
    }

    /// Finalize the builder.
    ///
    /// Validation rules
    /// -----------------
    /// * `cores ≥ 1`, `min_points ≥ 1`, `max_iterations ≥ 1`, `model_curve_points ≥ 2`.
    /// * `ftol > 0`.
    /// * both start grids non-empty, with strictly positive `tE` and non-negative `u0`.
    pub fn build(self) -> Result<FitParams, MopError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

impl FitParams {
    /// Check the invariants enforced by [`FitParamsBuilder::build`].
    ///
    /// Also used on parameters deserialised from a configuration file.
    pub fn validate(&self) -> Result<(), MopError> {
        let p = self;
        if p.cores == 0 {
            return Err(MopError::InvalidFitParameter("cores must be >= 1".into()));
        }
        if p.min_points == 0 {
            return Err(MopError::InvalidFitParameter(
                "min_points must be >= 1".into(),
            ));
        }
        if p.max_iterations == 0 {
            return Err(MopError::InvalidFitParameter(
                "max_iterations must be >= 1".into(),
            ));
        }
        if p.model_curve_points < 2 {
            return Err(MopError::InvalidFitParameter(
                "model_curve_points must be >= 2".into(),
            ));
        }
        if !FitParamsBuilder::gt0(p.ftol) {
            return Err(MopError::InvalidFitParameter("ftol must be > 0".into()));
        }
        if p.u0_grid.is_empty() || p.te_grid.is_empty() {
            return Err(MopError::InvalidFitParameter(
                "start grids must not be empty".into(),
            ));
        }
        if !p.te_grid.iter().all(|&te| FitParamsBuilder::gt0(te)) {
            return Err(MopError::InvalidFitParameter(
                "te_grid values must be > 0".into(),
            ));
        }
        if !p
            .u0_grid
            .iter()
            .all(|u0| matches!(u0.partial_cmp(&0.0), Some(Greater) | Some(Equal)))
        {
            return Err(MopError::InvalidFitParameter(
                "u0_grid values must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

/// Source and blend flux of one filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterFluxes {
    pub filter: String,
    pub n_points: usize,
    pub source_flux: f64,
    pub source_flux_error: f64,
    pub blend_flux: f64,
    pub blend_flux_error: f64,
}

/// Outcome of a successful fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    pub t0: JulianDate,
    pub t0_error: f64,
    pub u0: f64,
    pub u0_error: f64,
    pub te: f64,
    pub te_error: f64,
    pub pi_en: f64,
    pub pi_en_error: f64,
    pub pi_ee: f64,
    pub pi_ee_error: f64,
    pub parallax_fitted: bool,
    /// Reference time of the parallax expansion.
    pub t0_par: JulianDate,

    /// Per-filter fluxes, the reference filter (most points) first.
    pub fluxes: Vec<FilterFluxes>,
    /// Magnitudes in the reference filter; `None` when the flux is not positive.
    pub source_magnitude: Option<Magnitude>,
    pub blend_magnitude: Option<Magnitude>,
    pub baseline_magnitude: Option<Magnitude>,

    /// Covariance of all free parameters, in the order given in the module docs.
    pub covariance: DMatrix<f64>,
    pub chi2: f64,
    pub red_chi2: f64,
    pub normality: NormalityStats,
    pub n_points: usize,
    /// Time of the newest photometric point used.
    pub latest_data_jd: JulianDate,
    /// Synthetic light curve in the reference filter.
    pub model_curve: Vec<(JulianDate, Magnitude)>,
}

/// Flux-space data of one fit.
struct FluxData {
    jd: Vec<JulianDate>,
    flux: Vec<f64>,
    sigma: Vec<f64>,
    filter_idx: Vec<usize>,
    offsets: Vec<(f64, f64)>,
    filters: Vec<String>,
}

/// Layout of the parameter vector.
#[derive(Debug, Clone, Copy)]
struct Layout {
    /// Reference epoch subtracted from `t0` inside the optimiser.
    t_ref: JulianDate,
    parallax: bool,
    n_filters: usize,
}

impl Layout {
    fn flux_offset(&self) -> usize {
        if self.parallax {
            5
        } else {
            3
        }
    }

    fn n_params(&self) -> usize {
        self.flux_offset() + 2 * self.n_filters
    }

    fn geometry(&self, p: &DVector<f64>) -> PsplParams {
        let (pi_en, pi_ee) = if self.parallax { (p[3], p[4]) } else { (0.0, 0.0) };
        PsplParams {
            t0: self.t_ref + p[0],
            u0: p[1],
            te: p[2],
            pi_en,
            pi_ee,
        }
    }

    fn fluxes(&self, p: &DVector<f64>, k: usize) -> (f64, f64) {
        let i = self.flux_offset() + 2 * k;
        (p[i], p[i + 1])
    }
}

impl FluxData {
    fn weighted_residuals(&self, layout: &Layout, p: &DVector<f64>) -> DVector<f64> {
        let geometry = layout.geometry(p);
        DVector::from_iterator(
            self.jd.len(),
            (0..self.jd.len()).map(|i| {
                let (fs, fb) = layout.fluxes(p, self.filter_idx[i]);
                let model = fs * geometry.magnification_at(self.jd[i], self.offsets[i]) + fb;
                (self.flux[i] - model) / self.sigma[i]
            }),
        )
    }

    /// Weighted linear solve of `(fs, fb)` per filter for a fixed geometry.
    fn linear_fluxes(&self, geometry: &PsplParams) -> Vec<(f64, f64)> {
        let mut sums = vec![[0.0f64; 5]; self.filters.len()];
        for i in 0..self.jd.len() {
            let w = self.sigma[i].powi(-2);
            let a = geometry.magnification_at(self.jd[i], self.offsets[i]);
            let s = &mut sums[self.filter_idx[i]];
            s[0] += w * a * a;
            s[1] += w * a;
            s[2] += w;
            s[3] += w * a * self.flux[i];
            s[4] += w * self.flux[i];
        }
        sums.iter()
            .map(|[saa, sa, sw, saf, sf]| {
                let det = saa * sw - sa * sa;
                if det.abs() > 1e-12 * saa * sw {
                    ((saf * sw - sa * sf) / det, (saa * sf - sa * saf) / det)
                } else {
                    // no leverage on the blend: attribute everything to the source
                    (sf / sa, 0.0)
                }
            })
            .collect()
    }
}

/// Multi-start PSPL(+parallax) fitter.
pub struct ModelFitter {
    params: FitParams,
    pool: ThreadPool,
}

impl ModelFitter {
    /// Build a fitter and its worker pool.
    pub fn new(params: FitParams) -> Result<Self, MopError> {
        params.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.cores)
            .build()
            .map_err(|e| MopError::InvalidFitParameter(format!("worker pool: {e}")))?;
        Ok(ModelFitter { params, pool })
    }

    pub fn params(&self) -> &FitParams {
        &self.params
    }

    /// Fit the photometry of a target located at `(ra, dec)`.
    ///
    /// Arguments
    /// ---------
    /// * `points`: photometry of every source, in any order; unusable points
    ///   (non-finite values, non-positive errors) are ignored
    /// * `ra`, `dec`: target position in degrees, for the parallax projection
    ///
    /// Return
    /// ------
    /// * the best [`FitResult`] over the start grid
    pub fn fit(
        &self,
        points: &[PhotometryPoint],
        ra: Degree,
        dec: Degree,
    ) -> Result<FitResult, MopError> {
        let mut usable: Vec<&PhotometryPoint> = points.iter().filter(|p| p.is_usable()).collect();
        if usable.len() < self.params.min_points {
            return Err(MopError::InsufficientData {
                available: usable.len(),
                required: self.params.min_points,
            });
        }
        usable.sort_by(|a, b| a.jd.total_cmp(&b.jd));

        let filters = filters_by_size(&usable);
        let brightest = brightest_epoch(&usable, &filters);
        let geometry = ParallaxGeometry::new(ra, dec, brightest);

        let data = FluxData {
            jd: usable.iter().map(|p| p.jd).collect(),
            flux: usable.iter().map(|p| p.to_flux().0).collect(),
            sigma: usable.iter().map(|p| p.to_flux().1).collect(),
            filter_idx: usable
                .iter()
                .map(|p| filters.iter().position(|f| f == &p.filter).unwrap_or(0))
                .collect(),
            offsets: usable.iter().map(|p| geometry.offset(p.jd)).collect(),
            filters,
        };

        let layout = Layout {
            t_ref: brightest,
            parallax: self.params.fit_parallax && usable.len() >= self.params.min_points_parallax,
            n_filters: data.filters.len(),
        };

        let starts = self.starting_points(&data, &layout);
        let settings = LmSettings {
            max_iterations: self.params.max_iterations,
            ftol: self.params.ftol,
        };
        let scales = parameter_scales(&data, &layout);

        let solutions: Vec<Option<LmSolution>> = self.pool.install(|| {
            starts
                .par_iter()
                .map(|start| {
                    minimize(
                        |p| data.weighted_residuals(&layout, p),
                        start.clone(),
                        &scales,
                        |p| p[2] > 0.0 && p.iter().all(|v| v.is_finite()),
                        settings,
                    )
                })
                .collect()
        });

        let best = solutions
            .into_iter()
            .flatten()
            .filter(|s| s.converged && s.chi2.is_finite())
            .fold(None::<LmSolution>, |best, s| match best {
                Some(b) if b.chi2 <= s.chi2 => Some(b),
                _ => Some(s),
            })
            .ok_or_else(|| {
                MopError::FitDivergence(format!(
                    "none of the {} starting points converged",
                    starts.len()
                ))
            })?;

        debug!(
            chi2 = best.chi2,
            iterations = best.iterations,
            parallax = layout.parallax,
            "best PSPL solution"
        );
        self.assemble(&data, &layout, &geometry, best)
    }

    fn starting_points(&self, data: &FluxData, layout: &Layout) -> Vec<DVector<f64>> {
        let mut starts = Vec::new();
        for &te in &self.params.te_grid {
            for &u0_abs in &self.params.u0_grid {
                for u0 in [u0_abs, -u0_abs] {
                    if u0_abs == 0.0 && u0 < 0.0 {
                        continue;
                    }
                    let geometry = PsplParams::static_lens(layout.t_ref, u0, te);
                    let mut p = DVector::zeros(layout.n_params());
                    p[1] = u0;
                    p[2] = te;
                    for (k, (fs, fb)) in data.linear_fluxes(&geometry).into_iter().enumerate() {
                        let i = layout.flux_offset() + 2 * k;
                        p[i] = fs;
                        p[i + 1] = fb;
                    }
                    starts.push(p);
                }
            }
        }
        starts
    }

    fn assemble(
        &self,
        data: &FluxData,
        layout: &Layout,
        geometry: &ParallaxGeometry,
        solution: LmSolution,
    ) -> Result<FitResult, MopError> {
        let p = &solution.params;
        if p.iter().any(|v| !v.is_finite()) {
            return Err(MopError::FitDivergence("non-finite optimum".into()));
        }

        let covariance = covariance(&solution.jacobian);
        if covariance.iter().any(|v| !v.is_finite()) {
            return Err(MopError::FitDivergence("non-finite covariance".into()));
        }
        let sigma = |i: usize| covariance[(i, i)].max(0.0).sqrt();

        let pspl = layout.geometry(p);
        let (pi_en_error, pi_ee_error) = if layout.parallax {
            (sigma(3), sigma(4))
        } else {
            (0.0, 0.0)
        };

        let fluxes: Vec<FilterFluxes> = data
            .filters
            .iter()
            .enumerate()
            .map(|(k, filter)| {
                let (fs, fb) = layout.fluxes(p, k);
                let i = layout.flux_offset() + 2 * k;
                FilterFluxes {
                    filter: filter.clone(),
                    n_points: data.filter_idx.iter().filter(|&&f| f == k).count(),
                    source_flux: fs,
                    source_flux_error: sigma(i),
                    blend_flux: fb,
                    blend_flux_error: sigma(i + 1),
                }
            })
            .collect();

        let (fs_ref, fb_ref) = layout.fluxes(p, 0);
        let n = data.jd.len();
        let dof = n.saturating_sub(layout.n_params()).max(1);
        let residuals: Vec<f64> = solution.residuals.iter().copied().collect();

        let first = data.jd.first().copied().unwrap_or(pspl.t0);
        let last = data.jd.last().copied().unwrap_or(pspl.t0);
        let model_curve = model_curve(
            &pspl,
            geometry,
            (fs_ref, fb_ref),
            first.min(pspl.t0 - 2.0 * pspl.te),
            last.max(pspl.t0 + 2.0 * pspl.te),
            self.params.model_curve_points,
        );

        Ok(FitResult {
            t0: pspl.t0,
            t0_error: sigma(0),
            u0: pspl.u0,
            u0_error: sigma(1),
            te: pspl.te,
            te_error: sigma(2),
            pi_en: pspl.pi_en,
            pi_en_error,
            pi_ee: pspl.pi_ee,
            pi_ee_error,
            parallax_fitted: layout.parallax,
            t0_par: geometry.t0_par(),
            fluxes,
            source_magnitude: flux_to_magnitude(fs_ref),
            blend_magnitude: flux_to_magnitude(fb_ref),
            baseline_magnitude: flux_to_magnitude(fs_ref + fb_ref),
            covariance,
            chi2: solution.chi2,
            red_chi2: solution.chi2 / dof as f64,
            normality: NormalityStats::from_residuals(&residuals),
            n_points: n,
            latest_data_jd: last,
            model_curve,
        })
    }
}

/// Filters ordered by decreasing number of points (first seen wins ties).
fn filters_by_size(points: &[&PhotometryPoint]) -> Vec<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for p in points {
        match counts.iter_mut().find(|(f, _)| f == &p.filter) {
            Some((_, c)) => *c += 1,
            None => counts.push((p.filter.clone(), 1)),
        }
    }
    // stable sort keeps first-seen order among equal counts
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.into_iter().map(|(f, _)| f).collect()
}

/// Epoch of the brightest point relative to the median magnitude of its filter.
fn brightest_epoch(points: &[&PhotometryPoint], filters: &[String]) -> JulianDate {
    let medians: BTreeMap<&str, f64> = filters
        .iter()
        .map(|f| {
            let mut mags: Vec<f64> = points
                .iter()
                .filter(|p| &p.filter == f)
                .map(|p| p.magnitude)
                .collect();
            mags.sort_by(f64::total_cmp);
            (f.as_str(), mags[mags.len() / 2])
        })
        .collect();

    points
        .iter()
        .min_by(|a, b| {
            let da = a.magnitude - medians[a.filter.as_str()];
            let db = b.magnitude - medians[b.filter.as_str()];
            da.total_cmp(&db)
        })
        .map(|p| p.jd)
        .unwrap_or_default()
}

/// Typical size of every parameter, for finite-difference steps.
fn parameter_scales(data: &FluxData, layout: &Layout) -> DVector<f64> {
    let mean_flux = data.flux.iter().map(|f| f.abs()).sum::<f64>() / data.flux.len() as f64;
    DVector::from_fn(layout.n_params(), |i, _| match i {
        0 => 1.0,
        1 => 0.01,
        2 => 1.0,
        _ if i < layout.flux_offset() => 0.01,
        _ => mean_flux.max(1.0),
    })
}

/// `(JᵀJ)⁻¹` of the weighted residual Jacobian, pseudo-inverse when singular.
fn covariance(jacobian: &DMatrix<f64>) -> DMatrix<f64> {
    let normal = jacobian.transpose() * jacobian;
    if let Some(inverse) = normal.clone().cholesky().map(|c| c.inverse()) {
        return inverse;
    }
    let n = normal.nrows();
    normal
        .pseudo_inverse(1e-12)
        .unwrap_or_else(|_| DMatrix::from_element(n, n, f64::NAN))
}

fn model_curve(
    pspl: &PsplParams,
    geometry: &ParallaxGeometry,
    (fs, fb): (f64, f64),
    start: JulianDate,
    end: JulianDate,
    samples: usize,
) -> Vec<(JulianDate, Magnitude)> {
    let step = (end - start) / (samples - 1) as f64;
    (0..samples)
        .map(|i| start + i as f64 * step)
        .filter_map(|jd| {
            let flux = fs * pspl.magnification_at(jd, geometry.offset(jd)) + fb;
            flux_to_magnitude(flux).map(|mag| (jd, mag))
        })
        .collect()
}
