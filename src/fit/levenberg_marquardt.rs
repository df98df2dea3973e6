//! Damped least squares (Levenberg–Marquardt) with a central finite-difference Jacobian.
//!
//! The objective is `χ² = Σ rᵢ(p)²` where `r` are the **weighted** residuals
//! `(yᵢ − mᵢ(p)) / σᵢ`. The damping term is scaled by the diagonal of `JᵀJ`
//! (Marquardt's variant), which keeps the step well conditioned when the
//! parameters live on very different scales (days, Einstein radii, fluxes).
use nalgebra::{DMatrix, DVector};

/// Relative finite-difference step.
const FD_STEP: f64 = 1e-6;

const LAMBDA_START: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e12;

/// Stopping rules of [`minimize`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct LmSettings {
    pub max_iterations: usize,
    /// Relative χ² decrease below which the optimisation is considered converged.
    pub ftol: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct LmSolution {
    pub params: DVector<f64>,
    pub chi2: f64,
    /// Jacobian of the weighted residuals at `params`.
    pub jacobian: DMatrix<f64>,
    pub residuals: DVector<f64>,
    pub iterations: usize,
    pub converged: bool,
}

fn jacobian<F>(residuals: &F, p: &DVector<f64>, scales: &DVector<f64>, n_rows: usize) -> DMatrix<f64>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let mut jac = DMatrix::zeros(n_rows, p.len());
    for j in 0..p.len() {
        let h = FD_STEP * (p[j].abs() + scales[j]);
        let mut forward = p.clone();
        forward[j] += h;
        let mut backward = p.clone();
        backward[j] -= h;
        let column = (residuals(&forward) - residuals(&backward)) / (2.0 * h);
        jac.set_column(j, &column);
    }
    jac
}

/// Minimise `Σ residuals(p)²` starting at `start`.
///
/// Arguments
/// ---------
/// * `residuals`: weighted residual vector for a parameter vector
/// * `start`: initial parameters
/// * `scales`: typical magnitude of each parameter, used for the finite-difference steps
/// * `admissible`: rejects parameter vectors outside the model domain; such steps
///   are treated like uphill steps and only increase the damping
/// * `settings`: iteration cap and tolerance
///
/// Return
/// ------
/// * `None` when the starting point is not admissible or gives a non-finite χ²,
///   the best point reached otherwise. `converged` tells whether the stopping
///   criterion was met before the iteration cap.
pub(crate) fn minimize<F, A>(
    residuals: F,
    start: DVector<f64>,
    scales: &DVector<f64>,
    admissible: A,
    settings: LmSettings,
) -> Option<LmSolution>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
    A: Fn(&DVector<f64>) -> bool,
{
    if !admissible(&start) {
        return None;
    }
    let mut p = start;
    let mut r = residuals(&p);
    let mut chi2 = r.norm_squared();
    if !chi2.is_finite() {
        return None;
    }

    let n_rows = r.len();
    let mut lambda = LAMBDA_START;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < settings.max_iterations {
        iterations += 1;
        let jac = jacobian(&residuals, &p, scales, n_rows);
        let jtj = jac.transpose() * &jac;
        let rhs = -(jac.transpose() * &r);

        let mut accepted = None;
        while lambda <= LAMBDA_MAX {
            let mut damped = jtj.clone();
            for k in 0..damped.nrows() {
                damped[(k, k)] += lambda * jtj[(k, k)].max(LAMBDA_MIN);
            }
            let Some(step) = damped.cholesky().map(|c| c.solve(&rhs)) else {
                lambda *= 10.0;
                continue;
            };

            let trial = &p + step;
            if !admissible(&trial) {
                lambda *= 10.0;
                continue;
            }
            let r_trial = residuals(&trial);
            let chi2_trial = r_trial.norm_squared();
            if chi2_trial.is_finite() && chi2_trial < chi2 {
                accepted = Some((trial, r_trial, chi2_trial));
                lambda = (lambda / 10.0).max(LAMBDA_MIN);
                break;
            }
            lambda *= 10.0;
        }

        match accepted {
            Some((trial, r_trial, chi2_trial)) => {
                let gain = chi2 - chi2_trial;
                p = trial;
                r = r_trial;
                chi2 = chi2_trial;
                if gain <= settings.ftol * chi2 {
                    converged = true;
                    break;
                }
            }
            None => {
                // no descent direction left at any damping: local minimum
                converged = true;
                break;
            }
        }
    }

    let jacobian = jacobian(&residuals, &p, scales, n_rows);
    Some(LmSolution {
        params: p,
        chi2,
        jacobian,
        residuals: r,
        iterations,
        converged,
    })
}

#[cfg(test)]
mod levenberg_marquardt_test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_exponential_decay() {
        // y = a exp(-b x), a = 3, b = 0.7
        let xs: Vec<f64> = (0..30).map(|i| i as f64 * 0.2).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 3.0 * (-0.7 * x).exp()).collect();

        let residuals = |p: &DVector<f64>| {
            DVector::from_iterator(
                xs.len(),
                xs.iter()
                    .zip(&ys)
                    .map(|(x, y)| (y - p[0] * (-p[1] * x).exp()) / 0.01),
            )
        };

        let solution = minimize(
            residuals,
            DVector::from_vec(vec![1.0, 0.1]),
            &DVector::from_vec(vec![1.0, 1.0]),
            |p| p[1] > 0.0,
            LmSettings {
                max_iterations: 200,
                ftol: 1e-12,
            },
        )
        .unwrap();

        assert!(solution.converged);
        assert_relative_eq!(solution.params[0], 3.0, epsilon = 1e-6);
        assert_relative_eq!(solution.params[1], 0.7, epsilon = 1e-6);
        assert!(solution.chi2 < 1e-8);
    }

    #[test]
    fn test_inadmissible_start() {
        let solution = minimize(
            |p: &DVector<f64>| p.clone(),
            DVector::from_vec(vec![-1.0]),
            &DVector::from_vec(vec![1.0]),
            |p| p[0] > 0.0,
            LmSettings {
                max_iterations: 10,
                ftol: 1e-10,
            },
        );
        assert!(solution.is_none());
    }
}
