//! SVD-backed linear-algebra helpers shared by the rotation loops.
//!
//! Every decomposition reports failure through [`RotationError`] instead of
//! panicking; near-singular inputs produce an explicit `SingularMatrix` so a
//! caller (usually the restart harness) can treat the run as a failed
//! candidate rather than a process-level fault.

use crate::model::RotationError;
use ndarray::{Array2, ArrayView2, s};
use ndarray_linalg::{QR, SVD};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;

/// Relative singular-value cutoff below which a square matrix is treated as
/// singular by [`tolerant_inverse`].
const SINGULARITY_RCOND: f64 = 1e-12;

pub(crate) fn frobenius_norm(m: ArrayView2<f64>) -> f64 {
    m.iter().map(|&v| v * v).sum::<f64>().sqrt()
}

/// Nearest-orthonormal retraction: the `UVᵗ` factor of the polar
/// decomposition `X = UΣVᵗ`.
pub(crate) fn polar_factor(x: &Array2<f64>) -> Result<Array2<f64>, RotationError> {
    let (u_opt, _, vt_opt) = x.svd(true, true).map_err(|e| {
        RotationError::DecompositionFailed {
            context: "computing the polar retraction",
            source: e,
        }
    })?;
    match (u_opt, vt_opt) {
        (Some(u), Some(vt)) => Ok(u.dot(&vt)),
        _ => Err(RotationError::NumericalInstability {
            context: "computing the polar retraction",
            detail: "SVD returned no singular vectors".to_string(),
        }),
    }
}

/// Inverse of a square matrix with an explicit singularity check.
///
/// The matrix is inverted through its SVD; if the smallest singular value
/// falls below `SINGULARITY_RCOND` times the largest, the inversion is
/// refused with [`RotationError::SingularMatrix`] so the caller can fail the
/// current restart instead of propagating garbage.
pub(crate) fn tolerant_inverse(
    m: &Array2<f64>,
    context: &'static str,
) -> Result<Array2<f64>, RotationError> {
    let n = m.nrows();
    debug_assert_eq!(n, m.ncols());
    let (u_opt, sigma, vt_opt) =
        m.svd(true, true)
            .map_err(|e| RotationError::DecompositionFailed { context, source: e })?;
    let (u, vt) = match (u_opt, vt_opt) {
        (Some(u), Some(vt)) => (u, vt),
        _ => {
            return Err(RotationError::NumericalInstability {
                context,
                detail: "SVD returned no singular vectors".to_string(),
            });
        }
    };
    let s_max = sigma.iter().cloned().fold(0.0_f64, f64::max);
    let s_min = sigma.iter().cloned().fold(f64::INFINITY, f64::min);
    if !(s_max.is_finite() && s_min.is_finite()) {
        return Err(RotationError::NumericalInstability {
            context,
            detail: "non-finite singular values".to_string(),
        });
    }
    if s_min <= SINGULARITY_RCOND * s_max || s_max == 0.0 {
        return Err(RotationError::SingularMatrix { context });
    }
    let mut inv = Array2::zeros((n, n));
    for (j, &sv) in sigma.iter().enumerate() {
        let vj = vt.row(j);
        let uj = u.column(j);
        for r in 0..n {
            for c in 0..n {
                inv[(r, c)] += vj[r] * uj[c] / sv;
            }
        }
    }
    Ok(inv)
}

/// Solves `gram · X = rhs` for a symmetric `gram` through the tolerant
/// inverse, reporting `SingularMatrix` rather than producing an unstable
/// solution.
pub(crate) fn solve_normal_equations(
    gram: &Array2<f64>,
    rhs: &Array2<f64>,
    context: &'static str,
) -> Result<Array2<f64>, RotationError> {
    let inv = tolerant_inverse(gram, context)?;
    Ok(inv.dot(rhs))
}

/// Rescales the columns of an oblique transformation `U` by
/// `sqrt(diag((UᵗU)⁻¹))`, the normalization that gives the implied factor
/// correlation matrix `U⁻¹·(U⁻¹)ᵗ` a unit diagonal. An orthonormal `U` is
/// left exactly unchanged.
pub(crate) fn rescale_oblique_transform(
    u: &Array2<f64>,
    context: &'static str,
) -> Result<Array2<f64>, RotationError> {
    let gram_inv = tolerant_inverse(&u.t().dot(u), context)?;
    let scale = gram_inv.diag().mapv(f64::sqrt);
    if scale.iter().any(|v| !v.is_finite()) {
        return Err(RotationError::NumericalInstability {
            context,
            detail: "non-finite column rescaling factor".to_string(),
        });
    }
    Ok(u.dot(&Array2::from_diag(&scale)))
}

/// Moore–Penrose pseudoinverse with tolerance-based rank truncation.
///
/// Singular values `σᵢ > tol · σ_max` are kept and inverted; the rest are
/// truncated. `tol` defaults to `√ε` for `f64`. When no singular value
/// clears the threshold the matrix is fully rank-deficient and an explicit
/// [`RotationError::RankDeficient`] is returned.
pub fn pinv(m: ArrayView2<f64>, tol: Option<f64>) -> Result<Array2<f64>, RotationError> {
    let tol = tol.unwrap_or_else(|| f64::EPSILON.sqrt());
    if !(tol.is_finite() && tol >= 0.0) {
        return Err(RotationError::InvalidConfiguration(format!(
            "pinv tolerance must be a non-negative finite number, got {tol}"
        )));
    }
    let (u_opt, sigma, vt_opt) = m.svd(true, true).map_err(|e| {
        RotationError::DecompositionFailed {
            context: "computing the pseudoinverse",
            source: e,
        }
    })?;
    let (u, vt) = match (u_opt, vt_opt) {
        (Some(u), Some(vt)) => (u, vt),
        _ => {
            return Err(RotationError::NumericalInstability {
                context: "computing the pseudoinverse",
                detail: "SVD returned no singular vectors".to_string(),
            });
        }
    };
    let s_max = sigma.iter().cloned().fold(0.0_f64, f64::max);
    let threshold = tol * s_max;
    // LAPACK returns singular values in descending order, so the kept set is
    // a prefix.
    let kept = sigma.iter().take_while(|&&sv| sv > threshold).count();
    if kept == 0 {
        return Err(RotationError::RankDeficient { threshold });
    }
    let u_kept = u.slice(s![.., ..kept]);
    let vt_kept = vt.slice(s![..kept, ..]);
    let scaled_v = {
        let mut v = vt_kept.t().to_owned();
        for (j, &sv) in sigma.iter().take(kept).enumerate() {
            v.column_mut(j).mapv_inplace(|x| x / sv);
        }
        v
    };
    Ok(scaled_v.dot(&u_kept.t()))
}

/// A uniformly random k×k orthonormal matrix: the Q factor of a Gaussian
/// draw's QR decomposition.
pub(crate) fn random_orthonormal(
    k: usize,
    rng: &mut StdRng,
) -> Result<Array2<f64>, RotationError> {
    let gaussian = Array2::from_shape_fn((k, k), |_| rng.sample::<f64, _>(StandardNormal));
    let (q, _r) = gaussian
        .qr()
        .map_err(|e| RotationError::DecompositionFailed {
            context: "orthonormalizing a random start",
            source: e,
        })?;
    Ok(q)
}

/// Deterministic FNV-1a hash of a matrix's shape and element bit patterns.
///
/// Seeds the random-restart generator from data content instead of wall
/// clock time so repeated runs on the same loadings are bit-reproducible.
pub(crate) fn seed_from_matrix(m: ArrayView2<f64>) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    let mut absorb = |bytes: &[u8]| {
        for &b in bytes {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    absorb(&(m.nrows() as u64).to_le_bytes());
    absorb(&(m.ncols() as u64).to_le_bytes());
    for &v in m.iter() {
        absorb(&v.to_bits().to_le_bytes());
    }
    hash
}
