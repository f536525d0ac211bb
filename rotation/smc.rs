//! Squared multiple correlation: per-variable communality estimates.
//!
//! `smc` accepts either a ready-made correlation/covariance matrix (square
//! input) or a raw data matrix with observations in rows (non-square input),
//! in which case the correlation structure is computed first. The estimates
//! come from the diagonal of the pseudoinverse, which keeps the computation
//! defined on singular correlation matrices.

use crate::linalg::pinv;
use crate::model::RotationError;
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Covariance matrix of the columns of a data matrix.
fn column_covariance(data: ArrayView2<f64>) -> Result<Array2<f64>, RotationError> {
    let n = data.nrows();
    if n < 2 {
        return Err(RotationError::InvalidConfiguration(format!(
            "computing a covariance matrix needs at least two observations, got {n}"
        )));
    }
    let means = data.sum_axis(Axis(0)) / n as f64;
    let centered = &data - &means;
    Ok(centered.t().dot(&centered) / (n as f64 - 1.0))
}

/// Rescales a covariance matrix to a correlation matrix, returning the
/// variances alongside.
fn to_correlation(cov: &Array2<f64>) -> Result<(Array2<f64>, Array1<f64>), RotationError> {
    let variances = cov.diag().to_owned();
    if variances.iter().any(|&v| !(v.is_finite() && v > 0.0)) {
        return Err(RotationError::NumericalInstability {
            context: "rescaling a covariance matrix to a correlation matrix",
            detail: "a variable has non-positive or non-finite variance".to_string(),
        });
    }
    let sd = variances.mapv(f64::sqrt);
    let k = cov.nrows();
    let corr = Array2::from_shape_fn((k, k), |(i, j)| cov[(i, j)] / (sd[i] * sd[j]));
    Ok((corr, variances))
}

/// Squared multiple correlation of every variable with all the others.
///
/// With `covar = false` a square input is taken as a correlation matrix;
/// with `covar = true` it is taken as a covariance matrix and the estimates
/// are scaled back by the variances. Non-square input is treated as a data
/// matrix (observations × variables). Estimates that come out as NaN are
/// treated as perfectly predictable (1) and everything is clamped into
/// `[0, 1]` before variance scaling; clamping is logged, never silent.
pub fn smc(input: ArrayView2<f64>, covar: bool) -> Result<Array1<f64>, RotationError> {
    let (corr, variances) = if input.nrows() == input.ncols() {
        if covar {
            let cov = input.to_owned();
            let (corr, variances) = to_correlation(&cov)?;
            (corr, Some(variances))
        } else {
            (input.to_owned(), None)
        }
    } else {
        let cov = column_covariance(input)?;
        let (corr, variances) = to_correlation(&cov)?;
        (corr, covar.then_some(variances))
    };

    let r_inv = pinv(corr.view(), None)?;
    let mut estimates = Array1::from_shape_fn(corr.nrows(), |i| 1.0 - 1.0 / r_inv[(i, i)]);
    let nan_count = estimates.iter().filter(|v| v.is_nan()).count();
    if nan_count > 0 {
        log::warn!("{nan_count} SMC estimate(s) were NaN and are reported as 1");
        estimates.mapv_inplace(|v| if v.is_nan() { 1.0 } else { v });
    }
    let clamped_count = estimates
        .iter()
        .filter(|&&v| !(0.0..=1.0).contains(&v))
        .count();
    if clamped_count > 0 {
        log::warn!("{clamped_count} SMC estimate(s) fell outside [0, 1] and were clamped");
        estimates.mapv_inplace(|v| v.clamp(0.0, 1.0));
    }
    if let Some(variances) = variances {
        estimates = &estimates * &variances;
    }
    Ok(estimates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn identity_correlation_yields_all_zeros() {
        let r = Array2::eye(4);
        let estimates = smc(r.view(), false).unwrap();
        for &v in estimates.iter() {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn two_variable_smc_equals_squared_correlation() {
        let r = array![[1.0, 0.8], [0.8, 1.0]];
        let estimates = smc(r.view(), false).unwrap();
        assert_abs_diff_eq!(estimates[0], 0.64, epsilon = 1e-12);
        assert_abs_diff_eq!(estimates[1], 0.64, epsilon = 1e-12);
    }

    #[test]
    fn covariance_mode_scales_back_by_variances() {
        let cov = array![[4.0, 2.0], [2.0, 4.0]];
        let estimates = smc(cov.view(), true).unwrap();
        // Correlation 0.5 gives SMC 0.25, scaled by each variance of 4.
        assert_abs_diff_eq!(estimates[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(estimates[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn singular_correlation_is_clamped_not_fatal() {
        // A duplicated variable: the pseudoinverse keeps this defined, and
        // the out-of-range estimate is clamped into [0, 1].
        let r = array![[1.0, 1.0], [1.0, 1.0]];
        let estimates = smc(r.view(), false).unwrap();
        for &v in estimates.iter() {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn data_matrix_input_matches_precomputed_correlation() {
        let data = array![
            [1.0, 2.0, 0.5],
            [2.0, 3.5, 1.0],
            [3.0, 5.2, 0.4],
            [4.0, 6.8, 1.4],
            [5.0, 9.1, 0.9],
            [6.0, 10.9, 1.6]
        ];
        let cov = column_covariance(data.view()).unwrap();
        let (corr, _) = to_correlation(&cov).unwrap();
        let from_data = smc(data.view(), false).unwrap();
        let from_corr = smc(corr.view(), false).unwrap();
        for (a, b) in from_data.iter().zip(from_corr.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn too_few_observations_are_rejected() {
        let data = array![[1.0, 2.0, 3.0]];
        assert!(matches!(
            smc(data.view(), false),
            Err(RotationError::InvalidConfiguration(_))
        ));
    }
}
