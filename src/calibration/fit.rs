//! Calibration Fitting Engine
//!
//! Least-squares polynomial fit of `standard = f(raw)` via the normal
//! equations `XᵗX · coeffs = XᵗY`, solved by Gaussian elimination with
//! partial pivoting.
//!
//! ## Degree capping
//!
//! | Points | Fit        |
//! |--------|------------|
//! | 2      | linear     |
//! | 3      | quadratic  |
//! | ≥ 4    | cubic      |
//!
//! Coefficients above the fitted degree are reported as exactly zero.
//!
//! ## Fail-safe
//!
//! A pivot smaller than [`SINGULAR_PIVOT_EPSILON`] (or a non-finite solution)
//! marks the system singular and the identity transform is returned, so a bad
//! calibration session can never push garbage coefficients downstream.

use tracing::{debug, warn};

use super::CalibrationError;
use crate::types::{CalibrationParams, CalibrationPoint};

/// Pivot magnitude below which the normal equations are declared singular.
pub const SINGULAR_PIVOT_EPSILON: f64 = 1e-10;

/// Highest polynomial degree the engine fits.
pub const MAX_DEGREE: usize = 3;

/// Outcome of a fit, with diagnostics for the operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitSummary {
    pub params: CalibrationParams,
    /// Degree actually fitted (1..=3)
    pub degree: usize,
    /// True if the system was singular and `params` is the identity fallback
    pub singular: bool,
    /// Root-mean-square residual of `params` over the input points
    pub rms_residual: f64,
}

/// Polynomial degree used for `n` points.
pub fn degree_for(n: usize) -> usize {
    n.saturating_sub(1).min(MAX_DEGREE)
}

/// Fit the best cubic (or lower) correction polynomial to `points`.
///
/// Returns `InsufficientPoints` for fewer than two points; every other
/// input yields coefficients, falling back to the identity when singular.
pub fn fit_polynomial(points: &[CalibrationPoint]) -> Result<CalibrationParams, CalibrationError> {
    fit_with_summary(points).map(|s| s.params)
}

/// Like [`fit_polynomial`] but also reports degree, singularity, and residual.
pub fn fit_with_summary(points: &[CalibrationPoint]) -> Result<FitSummary, CalibrationError> {
    if points.len() < 2 {
        return Err(CalibrationError::InsufficientPoints {
            channel: 0,
            have: points.len(),
        });
    }

    let degree = degree_for(points.len());
    let (xtx, xty) = normal_equations(points, degree);

    let (params, singular) = match solve_gaussian(xtx, xty) {
        Some(solution) => (params_from_solution(&solution), false),
        None => {
            warn!(
                points = points.len(),
                degree,
                "Calibration system is singular or ill-conditioned, using identity transform"
            );
            (CalibrationParams::IDENTITY, true)
        }
    };

    let rms_residual = rms_residual(&params, points);
    debug!(
        degree,
        singular,
        a = params.a,
        b = params.b,
        c = params.c,
        d = params.d,
        rms_residual,
        "Calibration fit complete"
    );

    Ok(FitSummary {
        params,
        degree,
        singular,
        rms_residual,
    })
}

/// Build `XᵗX` (size `degree+1`) from power sums of the raw averages and
/// `XᵗY` from power sums weighted by the standard values.
///
/// Row/column `i` corresponds to the coefficient of `x^i`.
fn normal_equations(points: &[CalibrationPoint], degree: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
    let n = degree + 1;

    // power_sums[k] = Σ x^k for k in 0..=2*degree
    let mut power_sums = vec![0.0; 2 * degree + 1];
    let mut xty = vec![0.0; n];

    for p in points {
        let mut xk = 1.0;
        for (k, sum) in power_sums.iter_mut().enumerate() {
            *sum += xk;
            if k < n {
                xty[k] += xk * p.standard_value;
            }
            xk *= p.raw_average;
        }
    }

    let xtx = (0..n)
        .map(|row| (0..n).map(|col| power_sums[row + col]).collect())
        .collect();

    (xtx, xty)
}

/// Solve `a · x = b` by Gaussian elimination with partial pivoting.
///
/// Returns `None` when a pivot falls below [`SINGULAR_PIVOT_EPSILON`] or the
/// solution is not finite.
pub(crate) fn solve_gaussian(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    if a.len() != n || a.iter().any(|row| row.len() != n) {
        return None;
    }

    for col in 0..n {
        // Partial pivot: bring the row with the largest |a[row][col]| up.
        let pivot_row = (col..n).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;

        // Written as a negated >= so that NaN pivots are also rejected.
        if !(a[pivot_row][col].abs() >= SINGULAR_PIVOT_EPSILON) {
            return None;
        }

        if pivot_row != col {
            a.swap(pivot_row, col);
            b.swap(pivot_row, col);
        }

        let pivot = a[col][col];
        for row in (col + 1)..n {
            let factor = a[row][col] / pivot;
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }

    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Map a solution vector (constant term first) onto `(a, b, c, d)`,
/// zeroing every coefficient above the fitted degree.
fn params_from_solution(solution: &[f64]) -> CalibrationParams {
    let coeff = |power: usize| solution.get(power).copied().unwrap_or(0.0);
    CalibrationParams::new(coeff(3), coeff(2), coeff(1), coeff(0))
}

fn rms_residual(params: &CalibrationParams, points: &[CalibrationPoint]) -> f64 {
    let sum_sq: f64 = points
        .iter()
        .map(|p| {
            let r = params.apply(p.raw_average) - p.standard_value;
            r * r
        })
        .sum();
    (sum_sq / points.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points_on(f: impl Fn(f64) -> f64, xs: &[f64]) -> Vec<CalibrationPoint> {
        xs.iter().map(|&x| CalibrationPoint::new(x, f(x))).collect()
    }

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_degree_capping() {
        assert_eq!(degree_for(2), 1);
        assert_eq!(degree_for(3), 2);
        assert_eq!(degree_for(4), 3);
        assert_eq!(degree_for(25), 3);
    }

    #[test]
    fn test_rejects_fewer_than_two_points() {
        assert!(matches!(
            fit_polynomial(&[]),
            Err(CalibrationError::InsufficientPoints { have: 0, .. })
        ));
        assert!(matches!(
            fit_polynomial(&[CalibrationPoint::new(1.0, 2.0)]),
            Err(CalibrationError::InsufficientPoints { have: 1, .. })
        ));
    }

    #[test]
    fn test_recovers_exact_cubic() {
        let cubic = |x: f64| 2.0 * x.powi(3) - x.powi(2) + 3.0 * x + 1.0;
        for xs in [
            vec![0.0, 1.0, 2.0, 3.0],
            vec![-2.0, -1.0, 0.0, 1.0, 2.0, 3.0],
            vec![0.5, 1.5, 2.5, 4.0, 5.0, 7.25, 8.0],
        ] {
            let p = fit_polynomial(&points_on(cubic, &xs)).unwrap();
            assert_close(p.a, 2.0, 1e-6);
            assert_close(p.b, -1.0, 1e-6);
            assert_close(p.c, 3.0, 1e-6);
            assert_close(p.d, 1.0, 1e-6);
        }
    }

    #[test]
    fn test_two_points_linear_with_zeroed_higher_terms() {
        let p = fit_polynomial(&[CalibrationPoint::new(1.0, 3.0), CalibrationPoint::new(3.0, 7.0)])
            .unwrap();
        assert_eq!(p.a, 0.0);
        assert_eq!(p.b, 0.0);
        assert_close(p.c, 2.0, 1e-12);
        assert_close(p.d, 1.0, 1e-12);
        assert_close(p.apply(1.0), 3.0, 1e-12);
        assert_close(p.apply(3.0), 7.0, 1e-12);
    }

    #[test]
    fn test_three_points_quadratic() {
        let quad = |x: f64| 0.5 * x * x - 2.0 * x + 4.0;
        let p = fit_polynomial(&points_on(quad, &[-1.0, 2.0, 5.0])).unwrap();
        assert_eq!(p.a, 0.0);
        assert_close(p.b, 0.5, 1e-9);
        assert_close(p.c, -2.0, 1e-9);
        assert_close(p.d, 4.0, 1e-9);
    }

    #[test]
    fn test_identical_points_fall_back_to_identity() {
        for n in 2..=6 {
            let pts = vec![CalibrationPoint::new(2.5, 10.0); n];
            let summary = fit_with_summary(&pts).unwrap();
            assert!(summary.singular, "n={n} should be singular");
            assert_eq!(summary.params, CalibrationParams::IDENTITY);
            assert!(summary.params.is_finite());
        }
    }

    #[test]
    fn test_all_zero_raw_falls_back_to_identity() {
        let pts = vec![CalibrationPoint::new(0.0, 1.0), CalibrationPoint::new(0.0, 2.0)];
        assert_eq!(fit_polynomial(&pts).unwrap(), CalibrationParams::IDENTITY);
    }

    #[test]
    fn test_nan_points_never_yield_nan() {
        let pts = vec![
            CalibrationPoint::new(f64::NAN, 1.0),
            CalibrationPoint::new(1.0, 2.0),
            CalibrationPoint::new(2.0, 3.0),
        ];
        let p = fit_polynomial(&pts).unwrap();
        assert_eq!(p, CalibrationParams::IDENTITY);
    }

    #[test]
    fn test_quadratic_fit_of_collinear_points() {
        let pts = vec![
            CalibrationPoint::new(0.0, 1.0),
            CalibrationPoint::new(2.0, 5.0),
            CalibrationPoint::new(4.0, 9.0),
        ];
        let summary = fit_with_summary(&pts).unwrap();
        assert!(!summary.singular);
        assert_close(summary.params.b, 0.0, 1e-9);
        assert_close(summary.params.c, 2.0, 1e-9);
        assert_close(summary.params.d, 1.0, 1e-9);
        assert!(summary.rms_residual < 1e-9);
    }

    #[test]
    fn test_solver_pivots_zero_leading_entry() {
        // Leading zero forces a row swap.
        let a = vec![vec![0.0, 1.0], vec![2.0, 0.0]];
        let x = solve_gaussian(a, vec![3.0, 4.0]).unwrap();
        assert_close(x[0], 2.0, 1e-12);
        assert_close(x[1], 3.0, 1e-12);
    }

    #[test]
    fn test_solver_rejects_mismatched_shapes() {
        assert!(solve_gaussian(vec![vec![1.0, 2.0]], vec![1.0]).is_none());
    }
}
