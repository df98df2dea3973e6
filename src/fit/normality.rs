//! Normality statistics of normalised fit residuals.
//!
//! For a well-modelled light curve with correct error bars, `(y − m) / σ`
//! follows a standard normal distribution. Three classical statistics measure
//! the departure from it:
//!
//! * Kolmogorov–Smirnov `D` against N(0, 1),
//! * Anderson–Darling `A²` against N(0, 1) (more sensitive in the tails),
//! * Jarque–Bera, from the sample skewness and kurtosis.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalityStats {
    pub ks_statistic: f64,
    pub ad_statistic: f64,
    pub jb_statistic: f64,
}

impl NormalityStats {
    pub fn from_residuals(residuals: &[f64]) -> Self {
        let finite: Vec<f64> = residuals.iter().copied().filter(|r| r.is_finite()).collect();
        NormalityStats {
            ks_statistic: kolmogorov_smirnov(&finite),
            ad_statistic: anderson_darling(&finite),
            jb_statistic: jarque_bera(&finite),
        }
    }
}

/// Error function, Abramowitz & Stegun 7.1.26 (|ε| < 1.5e-7).
fn erf(x: f64) -> f64 {
    const P: f64 = 0.327_591_1;
    const A: [f64; 5] = [
        0.254_829_592,
        -0.284_496_736,
        1.421_413_741,
        -1.453_152_027,
        1.061_405_429,
    ];
    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = A.iter().rev().fold(0.0, |acc, a| acc * t + a) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

/// Cumulative distribution function of N(0, 1).
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

fn sorted(sample: &[f64]) -> Vec<f64> {
    let mut v = sample.to_vec();
    v.sort_by(f64::total_cmp);
    v
}

pub fn kolmogorov_smirnov(sample: &[f64]) -> f64 {
    let n = sample.len() as f64;
    sorted(sample)
        .iter()
        .enumerate()
        .map(|(i, &z)| {
            let cdf = normal_cdf(z);
            ((i as f64 + 1.0) / n - cdf).max(cdf - i as f64 / n)
        })
        .fold(0.0, f64::max)
}

pub fn anderson_darling(sample: &[f64]) -> f64 {
    if sample.is_empty() {
        return 0.0;
    }
    let z = sorted(sample);
    let n = z.len();
    let clamp = |p: f64| p.clamp(1e-300, 1.0 - 1e-16);
    let s: f64 = (0..n)
        .map(|i| {
            let lower = clamp(normal_cdf(z[i])).ln();
            let upper = (1.0 - clamp(normal_cdf(z[n - 1 - i]))).ln();
            (2.0 * i as f64 + 1.0) * (lower + upper)
        })
        .sum();
    -(n as f64) - s / n as f64
}

pub fn jarque_bera(sample: &[f64]) -> f64 {
    let n = sample.len() as f64;
    if sample.len() < 2 {
        return 0.0;
    }
    let mean = sample.iter().sum::<f64>() / n;
    let moment = |k: i32| sample.iter().map(|x| (x - mean).powi(k)).sum::<f64>() / n;
    let m2 = moment(2);
    if m2 <= f64::MIN_POSITIVE {
        return 0.0;
    }
    let skewness = moment(3) / m2.powf(1.5);
    let kurtosis = moment(4) / (m2 * m2);
    n / 6.0 * (skewness.powi(2) + (kurtosis - 3.0).powi(2) / 4.0)
}

#[cfg(test)]
mod normality_test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normal_cdf() {
        assert_relative_eq!(normal_cdf(0.0), 0.5, epsilon = 1e-9);
        assert_relative_eq!(normal_cdf(1.96), 0.9750021048517795, epsilon = 1e-6);
        assert_relative_eq!(normal_cdf(-1.0), 0.15865525393145707, epsilon = 1e-6);
    }

    #[test]
    fn test_statistics_on_symmetric_sample() {
        let sample = [-1.5, -0.5, 0.0, 0.5, 1.5];
        let stats = NormalityStats::from_residuals(&sample);
        // symmetric sample: no skewness
        assert!(stats.ks_statistic > 0.0 && stats.ks_statistic < 0.3);
        assert!(stats.ad_statistic.is_finite());
        assert!(stats.jb_statistic < 1.0);
    }

    #[test]
    fn test_outlier_is_detected() {
        let mut sample: Vec<f64> = (0..50).map(|i| ((i as f64) / 49.0 - 0.5) * 3.0).collect();
        let clean = NormalityStats::from_residuals(&sample);
        sample.push(40.0);
        let dirty = NormalityStats::from_residuals(&sample);
        assert!(dirty.jb_statistic > clean.jb_statistic * 10.0);
        assert!(dirty.ad_statistic > clean.ad_statistic);
    }

    #[test]
    fn test_degenerate_samples() {
        let stats = NormalityStats::from_residuals(&[]);
        assert_eq!(stats.ks_statistic, 0.0);
        assert_eq!(stats.ad_statistic, 0.0);
        assert_eq!(stats.jb_statistic, 0.0);
        assert_eq!(jarque_bera(&[0.0, 0.0, 0.0]), 0.0);
    }
}
