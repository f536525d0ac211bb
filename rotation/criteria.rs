//! The objective/gradient strategy family.
//!
//! Every rotation criterion is a stateless mapping from a loadings matrix to
//! a scalar objective `f` and a gradient matrix `Gq`, packaged behind the
//! [`Criterion`] trait. The GPA loops depend only on this trait; swapping
//! criteria never touches the loops. All criteria are written for
//! *minimization*, so "maximize simplicity" criteria carry a negated sign.
//!
//! Method-specific parameters (oblimin's `gamma`, geomin's `delta`, target
//! and weight matrices, ...) live on the implementing struct and are fixed
//! for the lifetime of a run.

use crate::linalg::tolerant_inverse;
use crate::model::RotationError;
use itertools::Itertools;
use ndarray::{Array2, ArrayView2, Axis, s};
use ndarray_linalg::{Cholesky, UPLO};

/// Objective value and gradient at the current loadings.
#[derive(Clone, Debug)]
pub struct CriterionValue {
    pub f: f64,
    pub gq: Array2<f64>,
}

/// A pure rotation criterion: `L ↦ (f, Gq)`.
pub trait Criterion: Send + Sync {
    /// Canonical method name, used to label results.
    fn name(&self) -> &'static str;

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError>;
}

fn squared(l: ArrayView2<f64>) -> Array2<f64> {
    l.mapv(|v| v * v)
}

/// k×k matrix of ones with a zero diagonal; couples every factor pair once.
fn offdiag_ones(k: usize) -> Array2<f64> {
    let mut n = Array2::ones((k, k));
    n.diag_mut().fill(0.0);
    n
}

/// `x·ln(x)` with the exact limit 0 at x = 0.
fn xlnx(x: f64) -> f64 {
    if x > 0.0 { x * x.ln() } else { 0.0 }
}

/// `ln(x)` clamped away from -inf so gradients of entropy-style criteria do
/// not turn into NaN at exactly-zero loadings.
fn safe_ln(x: f64) -> f64 {
    x.max(f64::MIN_POSITIVE).ln()
}

fn check_shape(
    name: &'static str,
    what: &'static str,
    expected: (usize, usize),
    got: (usize, usize),
) -> Result<(), RotationError> {
    if expected != got {
        return Err(RotationError::InvalidConfiguration(format!(
            "{name}: {what} must have shape {expected:?} to match the loadings, got {got:?}"
        )));
    }
    Ok(())
}

/// Varimax: maximizes the variance of squared loadings within each factor.
#[derive(Clone, Copy, Debug, Default)]
pub struct Varimax;

impl Criterion for Varimax {
    fn name(&self) -> &'static str {
        "varimax"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        let p = loadings.nrows() as f64;
        let l2 = squared(loadings);
        let col_means = l2.sum_axis(Axis(0)) / p;
        let centered = &l2 - &col_means;
        let f = -centered.iter().map(|v| v * v).sum::<f64>() / 4.0;
        let gq = -(&loadings * &centered);
        Ok(CriterionValue { f, gq })
    }
}

/// Varimin: the exact negation of varimax, minimizing within-factor variance
/// of squared loadings.
#[derive(Clone, Copy, Debug, Default)]
pub struct Varimin;

impl Criterion for Varimin {
    fn name(&self) -> &'static str {
        "varimin"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        let value = Varimax.evaluate(loadings)?;
        Ok(CriterionValue {
            f: -value.f,
            gq: -value.gq,
        })
    }
}

/// Quartimax: maximizes the sum of fourth powers of the loadings.
#[derive(Clone, Copy, Debug, Default)]
pub struct Quartimax;

impl Criterion for Quartimax {
    fn name(&self) -> &'static str {
        "quartimax"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        let l2 = squared(loadings);
        let f = -l2.iter().map(|v| v * v).sum::<f64>() / 4.0;
        let gq = loadings.mapv(|v| -v.powi(3));
        Ok(CriterionValue { f, gq })
    }
}

/// Quartimin: penalizes products of squared loadings across factor pairs.
#[derive(Clone, Copy, Debug, Default)]
pub struct Quartimin;

impl Criterion for Quartimin {
    fn name(&self) -> &'static str {
        "quartimin"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        let l2 = squared(loadings);
        let x = l2.dot(&offdiag_ones(loadings.ncols()));
        let f = (&l2 * &x).sum() / 4.0;
        let gq = &loadings * &x;
        Ok(CriterionValue { f, gq })
    }
}

/// Oblimin family: quartimin with the cross-products row-demeaned by
/// `gamma / p`. `gamma = 0` is quartimin, `gamma = 0.5` biquartimin.
#[derive(Clone, Copy, Debug)]
pub struct Oblimin {
    pub gamma: f64,
}

impl Oblimin {
    pub fn new(gamma: f64) -> Self {
        Self { gamma }
    }
}

impl Criterion for Oblimin {
    fn name(&self) -> &'static str {
        "oblimin"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        if !self.gamma.is_finite() {
            return Err(RotationError::InvalidConfiguration(format!(
                "oblimin gamma must be finite, got {}",
                self.gamma
            )));
        }
        let p = loadings.nrows() as f64;
        let l2 = squared(loadings);
        let mut x = l2.dot(&offdiag_ones(loadings.ncols()));
        if self.gamma != 0.0 {
            let col_sums = x.sum_axis(Axis(0));
            x = &x - &(col_sums * (self.gamma / p));
        }
        let f = (&l2 * &x).sum() / 4.0;
        let gq = &loadings * &x;
        Ok(CriterionValue { f, gq })
    }
}

/// Geomin: sum over variables of the geometric mean of squared loadings,
/// regularized by `delta` to keep the logs finite.
#[derive(Clone, Copy, Debug)]
pub struct Geomin {
    pub delta: f64,
}

impl Geomin {
    pub fn new(delta: f64) -> Self {
        Self { delta }
    }
}

impl Criterion for Geomin {
    fn name(&self) -> &'static str {
        "geomin"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        if !(self.delta.is_finite() && self.delta > 0.0) {
            return Err(RotationError::InvalidConfiguration(format!(
                "geomin delta must be strictly positive, got {}",
                self.delta
            )));
        }
        let k = loadings.ncols() as f64;
        let l2d = loadings.mapv(|v| v * v + self.delta);
        let row_log_means = l2d.mapv(f64::ln).sum_axis(Axis(1)) / k;
        let pro = row_log_means.mapv(f64::exp);
        let f = pro.sum();
        let pro_col = pro.insert_axis(Axis(1));
        let gq = (&loadings / &l2d) * &pro_col * (2.0 / k);
        Ok(CriterionValue { f, gq })
    }
}

/// Bentler's invariant pattern simplicity criterion. Works with the
/// log-determinants of the squared-loading cross-product matrix and its
/// diagonal; both must be invertible.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bentler;

impl Criterion for Bentler {
    fn name(&self) -> &'static str {
        "bentler"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        let l2 = squared(loadings);
        let m = l2.t().dot(&l2);
        let d_diag = m.diag().to_owned();
        if d_diag.iter().any(|&v| v <= 0.0) {
            return Err(RotationError::SingularMatrix {
                context: "inverting the diagonal of the bentler cross-product matrix",
            });
        }
        // log|M| = 2 Σ ln diag(chol(M)); a failed factorization means M is
        // not positive definite, which this criterion cannot recover from.
        let chol = m
            .cholesky(UPLO::Lower)
            .map_err(|_| RotationError::SingularMatrix {
                context: "factoring the bentler cross-product matrix",
            })?;
        let log_det_m = chol.diag().mapv(f64::ln).sum() * 2.0;
        let log_det_d = d_diag.mapv(f64::ln).sum();
        let m_inv = tolerant_inverse(&m, "inverting the bentler cross-product matrix")?;
        let d_inv = Array2::from_diag(&d_diag.mapv(|v| 1.0 / v));
        let f = -(log_det_m - log_det_d) / 4.0;
        let gq = -(&loadings * &l2.dot(&(&m_inv - &d_inv)));
        Ok(CriterionValue { f, gq })
    }
}

/// McKeon's information-maximization criterion over the squared-loading
/// distribution.
#[derive(Clone, Copy, Debug, Default)]
pub struct Infomax;

impl Criterion for Infomax {
    fn name(&self) -> &'static str {
        "infomax"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        let (p, k) = loadings.dim();
        let s_mat = squared(loadings);
        let total = s_mat.sum();
        if !(total.is_finite() && total > 0.0) {
            return Err(RotationError::NumericalInstability {
                context: "evaluating the infomax criterion",
                detail: format!("sum of squared loadings is {total}"),
            });
        }
        let s1 = s_mat.sum_axis(Axis(1));
        let s2 = s_mat.sum_axis(Axis(0));
        let e = &s_mat / total;
        let e1 = &s1 / total;
        let e2 = &s2 / total;
        let q0 = -e.iter().copied().map(xlnx).sum::<f64>();
        let q1 = -e1.iter().copied().map(xlnx).sum::<f64>();
        let q2 = -e2.iter().copied().map(xlnx).sum::<f64>();
        let f = (k as f64).ln() + q0 - q1 - q2;

        let h = e.mapv(|v| -(safe_ln(v) + 1.0));
        let alpha0 = (&s_mat * &h).sum() / (total * total);
        let g0 = h.mapv(|v| v / total - alpha0);
        let h1 = e1.mapv(|v| -(safe_ln(v) + 1.0));
        let alpha1 = s1.dot(&h1) / (total * total);
        let g1 = Array2::from_shape_fn((p, k), |(i, _)| h1[i] / total - alpha1);
        let h2 = e2.mapv(|v| -(safe_ln(v) + 1.0));
        let alpha2 = h2.dot(&s2) / (total * total);
        let g2 = Array2::from_shape_fn((p, k), |(_, j)| h2[j] / total - alpha2);
        let gq = &loadings * &(&(&g0 - &g1) - &g2) * 2.0;
        Ok(CriterionValue { f, gq })
    }
}

/// Simplimax: drives the `num_zeros` smallest squared loadings toward zero
/// through an indicator mask over a sorted copy. Ties at the threshold are
/// admitted first-in-scan-order so exactly `num_zeros` cells are selected.
#[derive(Clone, Copy, Debug)]
pub struct Simplimax {
    pub num_zeros: usize,
}

impl Simplimax {
    pub fn new(num_zeros: usize) -> Self {
        Self { num_zeros }
    }
}

impl Criterion for Simplimax {
    fn name(&self) -> &'static str {
        "simplimax"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        let (p, k) = loadings.dim();
        if self.num_zeros == 0 || self.num_zeros > p * k {
            return Err(RotationError::InvalidConfiguration(format!(
                "simplimax zero count must lie in [1, {}], got {}",
                p * k,
                self.num_zeros
            )));
        }
        let l2 = squared(loadings);
        let threshold = l2
            .iter()
            .copied()
            .sorted_by(f64::total_cmp)
            .nth(self.num_zeros - 1)
            .unwrap_or(f64::INFINITY);
        let mut mask = Array2::<f64>::zeros((p, k));
        let mut taken = 0usize;
        for ((i, j), &v) in l2.indexed_iter() {
            if v < threshold {
                mask[(i, j)] = 1.0;
                taken += 1;
            }
        }
        for ((i, j), &v) in l2.indexed_iter() {
            if taken == self.num_zeros {
                break;
            }
            if v == threshold && mask[(i, j)] == 0.0 {
                mask[(i, j)] = 1.0;
                taken += 1;
            }
        }
        let f = (&mask * &l2).sum();
        let gq = &loadings * &mask * 2.0;
        Ok(CriterionValue { f, gq })
    }
}

/// Comrey's tandem criterion I: variables that correlate should load on the
/// same factor.
#[derive(Clone, Copy, Debug, Default)]
pub struct TandemI;

impl Criterion for TandemI {
    fn name(&self) -> &'static str {
        "tandemi"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        let ll = loadings.dot(&loadings.t());
        let ll2 = ll.mapv(|v| v * v);
        let l2 = squared(loadings);
        let a = ll2.dot(&l2);
        let f = -(&l2 * &a).sum();
        let gq1 = (&loadings * &a) * 4.0;
        let gq2 = (&ll * &l2.dot(&l2.t())).dot(&loadings) * 4.0;
        Ok(CriterionValue {
            f,
            gq: -gq1 - gq2,
        })
    }
}

/// Comrey's tandem criterion II: variables that do not correlate should load
/// on different factors.
#[derive(Clone, Copy, Debug, Default)]
pub struct TandemII;

impl Criterion for TandemII {
    fn name(&self) -> &'static str {
        "tandemii"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        let p = loadings.nrows();
        let ll = loadings.dot(&loadings.t());
        let ll2 = ll.mapv(|v| v * v);
        let complement = &Array2::<f64>::ones((p, p)) - &ll2;
        let l2 = squared(loadings);
        let a = complement.dot(&l2);
        let f = (&l2 * &a).sum();
        let gq1 = (&loadings * &a) * 4.0;
        let gq2 = (&ll * &l2.dot(&l2.t())).dot(&loadings) * 4.0;
        Ok(CriterionValue { f, gq: gq1 - gq2 })
    }
}

/// Least-squares fit to a fixed target matrix. `NaN` target cells are masked
/// out of both the objective and the gradient.
#[derive(Clone, Debug)]
pub struct TargetCriterion {
    pub target: Array2<f64>,
}

impl TargetCriterion {
    pub fn new(target: Array2<f64>) -> Self {
        Self { target }
    }
}

impl Criterion for TargetCriterion {
    fn name(&self) -> &'static str {
        "target"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        check_shape("target", "the target matrix", loadings.dim(), self.target.dim())?;
        let mut f = 0.0;
        let mut gq = Array2::zeros(loadings.dim());
        for ((i, j), &t) in self.target.indexed_iter() {
            if t.is_nan() {
                continue;
            }
            let r = loadings[(i, j)] - t;
            f += r * r;
            gq[(i, j)] = 2.0 * r;
        }
        Ok(CriterionValue { f, gq })
    }
}

/// Partially specified target: a weight matrix selects which cells are fit
/// to the target. `NaN` target cells under a zero weight are treated as
/// unspecified.
#[derive(Clone, Debug)]
pub struct PartiallySpecifiedTarget {
    pub weights: Array2<f64>,
    pub target: Array2<f64>,
}

impl PartiallySpecifiedTarget {
    pub fn new(weights: Array2<f64>, target: Array2<f64>) -> Self {
        Self { weights, target }
    }
}

impl Criterion for PartiallySpecifiedTarget {
    fn name(&self) -> &'static str {
        "pst"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        check_shape("pst", "the weight matrix", loadings.dim(), self.weights.dim())?;
        check_shape("pst", "the target matrix", loadings.dim(), self.target.dim())?;
        let mut f = 0.0;
        let mut gq = Array2::zeros(loadings.dim());
        for ((i, j), &w) in self.weights.indexed_iter() {
            let t = self.target[(i, j)];
            let b = if t.is_nan() { 0.0 } else { w * t };
            let diff = w * loadings[(i, j)] - b;
            f += diff * diff;
            gq[(i, j)] = 2.0 * w * diff;
        }
        Ok(CriterionValue { f, gq })
    }
}

/// McCammon's minimum-entropy ratio criterion.
#[derive(Clone, Copy, Debug, Default)]
pub struct McCammon;

impl Criterion for McCammon {
    fn name(&self) -> &'static str {
        "mccammon"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        let (p, k) = loadings.dim();
        let s_mat = squared(loadings);
        let col_sums = s_mat.sum_axis(Axis(0));
        if col_sums.iter().any(|&v| v <= 0.0) {
            return Err(RotationError::NumericalInstability {
                context: "evaluating the mccammon criterion",
                detail: "a factor has zero total squared loading".to_string(),
            });
        }
        let p_norm = &s_mat / &col_sums;
        let q1 = -p_norm.iter().copied().map(xlnx).sum::<f64>();
        let h = p_norm.mapv(|v| -(safe_ln(v) + 1.0));
        let r = Array2::from_shape_fn((p, k), |(_, j)| col_sums[j]);
        let inner = &(&s_mat * &h) / &r.mapv(|v| v * v);
        let inner_col_sums = inner.sum_axis(Axis(0));
        let g1 = &(&h / &r) - &inner_col_sums;
        let total = s_mat.sum();
        let p2 = &col_sums / total;
        let q2 = -p2.iter().copied().map(xlnx).sum::<f64>();
        let h_vec = p2.mapv(|v| -(safe_ln(v) + 1.0));
        let alpha = h_vec.dot(&p2);
        let g2 = Array2::from_shape_fn((p, k), |(_, j)| h_vec[j] / total - alpha / total);
        if !(q1 > 0.0 && q2 > 0.0) {
            return Err(RotationError::NumericalInstability {
                context: "evaluating the mccammon criterion",
                detail: format!("entropy terms must be positive (Q1 = {q1}, Q2 = {q2})"),
            });
        }
        let gq = &loadings * &(&(&g1 / q1) - &(&g2 / q2)) * 2.0;
        let f = q1.ln() - q2.ln();
        Ok(CriterionValue { f, gq })
    }
}

/// Minimum-entropy criterion over squared loadings.
#[derive(Clone, Copy, Debug, Default)]
pub struct Entropy;

impl Criterion for Entropy {
    fn name(&self) -> &'static str {
        "entropy"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        let l2 = squared(loadings);
        let f = -l2.iter().copied().map(xlnx).sum::<f64>() / 2.0;
        let gq = loadings.mapv(|v| {
            let sq = v * v;
            if sq > 0.0 { -(v * sq.ln() + v) } else { 0.0 }
        });
        Ok(CriterionValue { f, gq })
    }
}

/// Bifactor (biquartimin) rotation: quartimin applied to every factor except
/// the first, which is left free as the general factor.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bifactor;

impl Criterion for Bifactor {
    fn name(&self) -> &'static str {
        "bifactor"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        let (p, k) = loadings.dim();
        if k < 2 {
            return Err(RotationError::InvalidConfiguration(
                "bifactor rotation needs at least two factors".to_string(),
            ));
        }
        let sub = loadings.slice(s![.., 1..]);
        let l2 = squared(sub);
        let x = l2.dot(&offdiag_ones(k - 1));
        let f = (&l2 * &x).sum() / 4.0;
        let mut gq = Array2::zeros((p, k));
        gq.slice_mut(s![.., 1..]).assign(&(&sub * &x));
        Ok(CriterionValue { f, gq })
    }
}

/// Bifactor variant of geomin: geomin applied to every factor except the
/// first.
#[derive(Clone, Copy, Debug)]
pub struct Bigeomin {
    pub delta: f64,
}

impl Bigeomin {
    pub fn new(delta: f64) -> Self {
        Self { delta }
    }
}

impl Criterion for Bigeomin {
    fn name(&self) -> &'static str {
        "bigeomin"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        let (p, k) = loadings.dim();
        if k < 2 {
            return Err(RotationError::InvalidConfiguration(
                "bigeomin rotation needs at least two factors".to_string(),
            ));
        }
        let sub = loadings.slice(s![.., 1..]);
        let inner = Geomin::new(self.delta).evaluate(sub)?;
        let mut gq = Array2::zeros((p, k));
        gq.slice_mut(s![.., 1..]).assign(&inner.gq);
        Ok(CriterionValue { f: inner.f, gq })
    }
}

/// Crawford–Ferguson family: a `kappa`-weighted blend of factor complexity
/// and variable complexity. Classic members are exposed as constructors.
#[derive(Clone, Copy, Debug)]
pub struct CrawfordFerguson {
    pub kappa: f64,
}

impl CrawfordFerguson {
    pub fn new(kappa: f64) -> Self {
        Self { kappa }
    }

    pub fn quartimax() -> Self {
        Self::new(0.0)
    }

    pub fn varimax(p: usize) -> Self {
        Self::new(1.0 / p as f64)
    }

    pub fn equamax(p: usize, k: usize) -> Self {
        Self::new(k as f64 / (2.0 * p as f64))
    }

    pub fn parsimax(p: usize, k: usize) -> Self {
        Self::new((k as f64 - 1.0) / (p as f64 + k as f64 - 2.0))
    }

    pub fn factor_parsimony() -> Self {
        Self::new(1.0)
    }
}

impl Criterion for CrawfordFerguson {
    fn name(&self) -> &'static str {
        "cf"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        if !(0.0..=1.0).contains(&self.kappa) {
            return Err(RotationError::InvalidConfiguration(format!(
                "crawford-ferguson kappa must lie in [0, 1], got {}",
                self.kappa
            )));
        }
        let (p, k) = loadings.dim();
        let l2 = squared(loadings);
        let row_couple = l2.dot(&offdiag_ones(k));
        let col_couple = offdiag_ones(p).dot(&l2);
        let f = (&l2 * &row_couple).sum() * (1.0 - self.kappa) / 4.0
            + (&l2 * &col_couple).sum() * self.kappa / 4.0;
        let gq = &(&loadings * &row_couple) * (1.0 - self.kappa)
            + &(&loadings * &col_couple) * self.kappa;
        Ok(CriterionValue { f, gq })
    }
}

/// Weighted least squares on squared loadings; the weight matrix comes from
/// an outer loop (e.g. Lp-rotation reweighting) and is fixed per call.
#[derive(Clone, Debug)]
pub struct LpWeightedLeastSquares {
    pub weights: Array2<f64>,
}

impl LpWeightedLeastSquares {
    pub fn new(weights: Array2<f64>) -> Self {
        Self { weights }
    }
}

impl Criterion for LpWeightedLeastSquares {
    fn name(&self) -> &'static str {
        "lp-wls"
    }

    fn evaluate(&self, loadings: ArrayView2<f64>) -> Result<CriterionValue, RotationError> {
        check_shape(
            "lp-wls",
            "the weight matrix",
            loadings.dim(),
            self.weights.dim(),
        )?;
        let l2 = squared(loadings);
        let f = (&self.weights * &l2).sum();
        let gq = &(&self.weights * &loadings) * 2.0;
        Ok(CriterionValue { f, gq })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_loadings(p: usize, k: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((p, k), |_| rng.gen_range(-0.9..0.9))
    }

    /// Central finite differences of the objective, compared against the
    /// analytic gradient entry by entry.
    fn assert_gradient_matches(criterion: &dyn Criterion, loadings: &Array2<f64>, tol: f64) {
        let h = 1e-6;
        let gq = criterion.evaluate(loadings.view()).unwrap().gq;
        for i in 0..loadings.nrows() {
            for j in 0..loadings.ncols() {
                let mut plus = loadings.clone();
                plus[(i, j)] += h;
                let mut minus = loadings.clone();
                minus[(i, j)] -= h;
                let f_plus = criterion.evaluate(plus.view()).unwrap().f;
                let f_minus = criterion.evaluate(minus.view()).unwrap().f;
                let fd = (f_plus - f_minus) / (2.0 * h);
                assert!(
                    (fd - gq[(i, j)]).abs() <= tol * (1.0 + fd.abs()),
                    "{} gradient mismatch at ({}, {}): analytic {} vs finite-difference {}",
                    criterion.name(),
                    i,
                    j,
                    gq[(i, j)],
                    fd
                );
            }
        }
    }

    #[test]
    fn analytic_gradients_match_finite_differences() {
        let l = random_loadings(6, 3, 17);
        assert_gradient_matches(&Varimax, &l, 1e-5);
        assert_gradient_matches(&Varimin, &l, 1e-5);
        assert_gradient_matches(&Quartimax, &l, 1e-5);
        assert_gradient_matches(&Quartimin, &l, 1e-5);
        assert_gradient_matches(&Oblimin::new(0.5), &l, 1e-5);
        assert_gradient_matches(&Geomin::new(0.01), &l, 1e-5);
        assert_gradient_matches(&Bentler, &l, 1e-4);
        assert_gradient_matches(&Infomax, &l, 1e-4);
        assert_gradient_matches(&TandemI, &l, 1e-4);
        assert_gradient_matches(&TandemII, &l, 1e-4);
        assert_gradient_matches(&McCammon, &l, 1e-4);
        assert_gradient_matches(&Entropy, &l, 1e-5);
        assert_gradient_matches(&Bifactor, &l, 1e-5);
        assert_gradient_matches(&Bigeomin::new(0.01), &l, 1e-5);
        assert_gradient_matches(&CrawfordFerguson::equamax(6, 3), &l, 1e-5);
    }

    #[test]
    fn target_gradient_matches_finite_differences() {
        let l = random_loadings(5, 2, 23);
        let target = random_loadings(5, 2, 24);
        assert_gradient_matches(&TargetCriterion::new(target.clone()), &l, 1e-5);
        let weights = random_loadings(5, 2, 25).mapv(f64::abs);
        assert_gradient_matches(&PartiallySpecifiedTarget::new(weights, target), &l, 1e-5);
        let wls = random_loadings(5, 2, 26).mapv(f64::abs);
        assert_gradient_matches(&LpWeightedLeastSquares::new(wls), &l, 1e-5);
    }

    #[test]
    fn oblimin_zero_gamma_is_quartimin() {
        let l = random_loadings(8, 3, 5);
        let quartimin = Quartimin.evaluate(l.view()).unwrap();
        let oblimin = Oblimin::new(0.0).evaluate(l.view()).unwrap();
        assert_abs_diff_eq!(quartimin.f, oblimin.f, epsilon = 1e-14);
        for (a, b) in quartimin.gq.iter().zip(oblimin.gq.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-14);
        }
    }

    #[test]
    fn crawford_ferguson_kappa_zero_matches_quartimin_shape() {
        // With kappa = 0 the CF family reduces to the quartimin coupling.
        let l = random_loadings(7, 3, 6);
        let cf = CrawfordFerguson::quartimax().evaluate(l.view()).unwrap();
        let quartimin = Quartimin.evaluate(l.view()).unwrap();
        assert_abs_diff_eq!(cf.f, quartimin.f, epsilon = 1e-14);
    }

    #[test]
    fn target_masks_nan_cells() {
        let l = array![[0.5, 0.2], [0.3, 0.8]];
        let target = array![[0.6, f64::NAN], [f64::NAN, 0.7]];
        let value = TargetCriterion::new(target).evaluate(l.view()).unwrap();
        let expected = (0.5_f64 - 0.6).powi(2) + (0.8_f64 - 0.7).powi(2);
        assert_abs_diff_eq!(value.f, expected, epsilon = 1e-14);
        assert_eq!(value.gq[(0, 1)], 0.0);
        assert_eq!(value.gq[(1, 0)], 0.0);
    }

    #[test]
    fn target_shape_mismatch_is_rejected() {
        let l = random_loadings(4, 2, 9);
        let target = random_loadings(4, 3, 9);
        assert!(matches!(
            TargetCriterion::new(target).evaluate(l.view()),
            Err(RotationError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn simplimax_selects_exactly_k_cells_under_ties() {
        // Four equal-magnitude cells tie at the threshold; only the first two
        // in row-major scan order may be selected.
        let l = array![[0.1, 0.1], [0.1, 0.1], [0.9, 0.8]];
        let value = Simplimax::new(2).evaluate(l.view()).unwrap();
        let mask_count = value
            .gq
            .indexed_iter()
            .filter(|&(_, &g)| g != 0.0)
            .count();
        assert_eq!(mask_count, 2);
        assert!(value.gq[(0, 0)] != 0.0);
        assert!(value.gq[(0, 1)] != 0.0);
        assert_eq!(value.gq[(1, 0)], 0.0);
        assert_abs_diff_eq!(value.f, 2.0 * 0.01, epsilon = 1e-14);
    }

    #[test]
    fn simplimax_rejects_out_of_range_zero_count() {
        let l = random_loadings(3, 2, 4);
        assert!(Simplimax::new(0).evaluate(l.view()).is_err());
        assert!(Simplimax::new(7).evaluate(l.view()).is_err());
    }

    #[test]
    fn entropy_is_finite_at_zero_loadings() {
        let l = array![[0.0, 0.5], [0.7, 0.0]];
        let value = Entropy.evaluate(l.view()).unwrap();
        assert!(value.f.is_finite());
        assert!(value.gq.iter().all(|g| g.is_finite()));
        assert_eq!(value.gq[(0, 0)], 0.0);
    }

    #[test]
    fn geomin_rejects_non_positive_delta() {
        let l = random_loadings(4, 2, 8);
        assert!(Geomin::new(0.0).evaluate(l.view()).is_err());
        assert!(Geomin::new(-1.0).evaluate(l.view()).is_err());
    }

    #[test]
    fn bentler_reports_singularity_instead_of_panicking() {
        // A rank-one loadings matrix makes the cross-product singular.
        let l = array![[0.5, 0.5], [0.5, 0.5], [0.5, 0.5]];
        assert!(matches!(
            Bentler.evaluate(l.view()),
            Err(RotationError::SingularMatrix { .. })
        ));
    }
}
