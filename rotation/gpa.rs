//! Gradient-projection rotation loops.
//!
//! Both loops follow the same scheme: evaluate the criterion at the current
//! loadings, pull the ambient gradient back to the rotation matrix, project
//! it onto the tangent space of the constraint manifold, and take an
//! Armijo-style backtracking step that is retracted onto the manifold. The
//! orthogonal (Stiefel-manifold) loop retracts through the polar
//! decomposition; the oblique loop rescales columns to unit norm and tracks
//! the factor correlation matrix `Phi = TᵗT`.
//!
//! The step size doubles after every outer iteration and halves on each
//! rejected trial, up to [`MAX_LINE_SEARCH_HALVINGS`] halvings. When every
//! trial is rejected the last one is committed anyway: forward progress is
//! preferred over a strict descent guarantee, and the exhaustion is counted
//! in the diagnostics and logged at warn level so it is never silent.

use crate::criteria::Criterion;
use crate::linalg::{frobenius_norm, polar_factor, tolerant_inverse};
use crate::model::{
    IterationRecord, RotOpts, RotationDiagnostics, RotationError, RotationFit, RotationResult,
};
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Backtracking halvings attempted before the forward-progress commit.
const MAX_LINE_SEARCH_HALVINGS: usize = 10;

fn validate_input(
    a: ArrayView2<f64>,
    start: Option<&ArrayView2<f64>>,
) -> Result<(), RotationError> {
    let (p, k) = a.dim();
    if p == 0 {
        return Err(RotationError::InvalidConfiguration(
            "loadings matrix has no rows".to_string(),
        ));
    }
    if k < 2 {
        return Err(RotationError::InvalidConfiguration(format!(
            "rotation requires at least two factors, got k = {k}"
        )));
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(RotationError::InvalidConfiguration(
            "loadings matrix contains non-finite values".to_string(),
        ));
    }
    if let Some(t0) = start {
        if t0.dim() != (k, k) {
            return Err(RotationError::InvalidConfiguration(format!(
                "starting rotation must be {k}x{k}, got {:?}",
                t0.dim()
            )));
        }
    }
    Ok(())
}

/// Row norms used by Kaiser normalization. Zero rows keep weight 1 so they
/// pass through the normalization untouched.
fn kaiser_weights(a: ArrayView2<f64>) -> Array1<f64> {
    a.map_axis(Axis(1), |row| {
        row.iter().map(|v| v * v).sum::<f64>().sqrt()
    })
    .mapv(|w| if w > 0.0 { w } else { 1.0 })
}

fn working_loadings(a: ArrayView2<f64>, normalize: bool) -> Array2<f64> {
    let mut a_work = a.to_owned();
    if normalize {
        let w = kaiser_weights(a);
        for (mut row, &wi) in a_work.rows_mut().into_iter().zip(w.iter()) {
            row.mapv_inplace(|v| v / wi);
        }
    }
    a_work
}

/// Rescales every column of `x` to unit Euclidean norm, the retraction of
/// the oblique manifold.
fn normalize_columns(x: &Array2<f64>) -> Result<Array2<f64>, RotationError> {
    let mut out = x.clone();
    for mut col in out.columns_mut() {
        let norm = col.iter().map(|v| v * v).sum::<f64>().sqrt();
        if !(norm.is_finite() && norm > 0.0) {
            return Err(RotationError::NumericalInstability {
                context: "rescaling rotation columns to unit norm",
                detail: "a trial column has zero or non-finite norm".to_string(),
            });
        }
        col.mapv_inplace(|v| v / norm);
    }
    Ok(out)
}

/// Orthogonal GPA loop: minimizes `criterion` over rotations with `TᵗT = I`.
///
/// `start` defaults to the identity; a supplied start is retracted onto the
/// manifold first, so heuristic starts that are merely close to orthonormal
/// are legal. Reaching `max_iter` is a normal outcome reported through
/// `converged = false`, never an error.
pub fn rotate_orthogonal(
    a: ArrayView2<f64>,
    criterion: &dyn Criterion,
    start: Option<ArrayView2<f64>>,
    opts: &RotOpts,
) -> Result<RotationFit, RotationError> {
    opts.validate()?;
    validate_input(a, start.as_ref())?;
    let k = a.ncols();
    let a_work = working_loadings(a, opts.normalize);

    let mut tmat = match start {
        Some(t0) => polar_factor(&t0.to_owned())?,
        None => Array2::eye(k),
    };
    let mut l = a_work.dot(&tmat);
    let initial = criterion.evaluate(l.view())?;
    let mut f = initial.f;
    let mut g = a_work.t().dot(&initial.gq);

    let mut al = opts.alpha0;
    let mut history = Vec::new();
    let mut exhaustions = 0usize;
    let mut converged = false;
    let mut iterations = 0usize;

    for iter in 0..=opts.max_iter {
        iterations = iter;
        let m = tmat.t().dot(&g);
        let sym = (&m + &m.t()) * 0.5;
        let gp = &g - &tmat.dot(&sym);
        let s = frobenius_norm(gp.view());
        if !(f.is_finite() && s.is_finite()) {
            return Err(RotationError::NumericalInstability {
                context: "iterating the orthogonal GPA loop",
                detail: format!("objective {f}, projected gradient norm {s}"),
            });
        }
        history.push(IterationRecord {
            iteration: iter,
            objective: f,
            log10_gradient_norm: s.log10(),
            step: al,
        });
        log::debug!(
            "gpa[{}] iter {iter}: f = {f:.6e}, log10|Gp| = {:.3}, alpha = {al:.3e}",
            criterion.name(),
            s.log10()
        );
        if s < opts.eps {
            converged = true;
            break;
        }
        if iter == opts.max_iter {
            break;
        }

        al *= 2.0;
        let mut halvings = 0usize;
        let (t_new, l_new, value_new, accepted) = loop {
            let x = &tmat - &(&gp * al);
            let t_trial = polar_factor(&x)?;
            let l_trial = a_work.dot(&t_trial);
            let value_trial = criterion.evaluate(l_trial.view())?;
            if f - value_trial.f > 0.5 * s * s * al {
                break (t_trial, l_trial, value_trial, true);
            }
            if halvings == MAX_LINE_SEARCH_HALVINGS {
                break (t_trial, l_trial, value_trial, false);
            }
            halvings += 1;
            al *= 0.5;
        };
        if !accepted {
            exhaustions += 1;
            log::warn!(
                "line search for {} exhausted {MAX_LINE_SEARCH_HALVINGS} halvings at iteration \
                 {iter}; committing the last trial to avoid stalling",
                criterion.name()
            );
        }
        tmat = t_new;
        l = l_new;
        f = value_new.f;
        g = a_work.t().dot(&value_new.gq);
    }

    // Undo Kaiser scaling by rebuilding the loadings from the raw input.
    let loadings = if opts.normalize { a.dot(&tmat) } else { l };
    log::info!(
        "orthogonal {} rotation finished: f = {f:.6e}, converged = {converged}, iterations = {iterations}",
        criterion.name()
    );
    Ok(RotationFit {
        result: RotationResult {
            loadings,
            rotation: tmat,
            phi: None,
            objective: f,
            converged,
            iterations,
            method: criterion.name(),
        },
        diagnostics: RotationDiagnostics {
            history,
            line_search_exhaustions: exhaustions,
            used_fallback: false,
        },
    })
}

/// Oblique GPA loop: minimizes `criterion` over invertible rotations with
/// unit-norm columns, reporting the factor correlation matrix `Phi = TᵗT`.
///
/// Every inversion of `T` goes through the tolerant inverse; a near-singular
/// trial aborts this run with `SingularMatrix` so the restart harness can
/// drop the candidate instead of the whole selection.
pub fn rotate_oblique(
    a: ArrayView2<f64>,
    criterion: &dyn Criterion,
    start: Option<ArrayView2<f64>>,
    opts: &RotOpts,
) -> Result<RotationFit, RotationError> {
    opts.validate()?;
    validate_input(a, start.as_ref())?;
    let k = a.ncols();
    let a_work = working_loadings(a, opts.normalize);

    let mut tmat = match start {
        Some(t0) => normalize_columns(&t0.to_owned())?,
        None => Array2::eye(k),
    };
    let mut t_inv = tolerant_inverse(&tmat, "inverting the oblique rotation matrix")?;
    let mut l = a_work.dot(&t_inv.t());
    let initial = criterion.evaluate(l.view())?;
    let mut f = initial.f;
    let mut g = -(l.t().dot(&initial.gq).dot(&t_inv)).t().to_owned();

    let mut al = opts.alpha0;
    let mut history = Vec::new();
    let mut exhaustions = 0usize;
    let mut converged = false;
    let mut iterations = 0usize;

    for iter in 0..=opts.max_iter {
        iterations = iter;
        // Project out the component that would change column norms.
        let col_sums = (&tmat * &g).sum_axis(Axis(0));
        let gp = &g - &tmat.dot(&Array2::from_diag(&col_sums));
        let s = frobenius_norm(gp.view());
        if !(f.is_finite() && s.is_finite()) {
            return Err(RotationError::NumericalInstability {
                context: "iterating the oblique GPA loop",
                detail: format!("objective {f}, projected gradient norm {s}"),
            });
        }
        history.push(IterationRecord {
            iteration: iter,
            objective: f,
            log10_gradient_norm: s.log10(),
            step: al,
        });
        log::debug!(
            "gpa[{}] iter {iter}: f = {f:.6e}, log10|Gp| = {:.3}, alpha = {al:.3e}",
            criterion.name(),
            s.log10()
        );
        if s < opts.eps {
            converged = true;
            break;
        }
        if iter == opts.max_iter {
            break;
        }

        al *= 2.0;
        let mut halvings = 0usize;
        let (t_new, ti_new, l_new, value_new, accepted) = loop {
            let x = &tmat - &(&gp * al);
            let t_trial = normalize_columns(&x)?;
            let ti_trial = tolerant_inverse(&t_trial, "inverting the oblique rotation matrix")?;
            let l_trial = a_work.dot(&ti_trial.t());
            let value_trial = criterion.evaluate(l_trial.view())?;
            if f - value_trial.f > 0.5 * s * s * al {
                break (t_trial, ti_trial, l_trial, value_trial, true);
            }
            if halvings == MAX_LINE_SEARCH_HALVINGS {
                break (t_trial, ti_trial, l_trial, value_trial, false);
            }
            halvings += 1;
            al *= 0.5;
        };
        if !accepted {
            exhaustions += 1;
            log::warn!(
                "line search for {} exhausted {MAX_LINE_SEARCH_HALVINGS} halvings at iteration \
                 {iter}; committing the last trial to avoid stalling",
                criterion.name()
            );
        }
        tmat = t_new;
        t_inv = ti_new;
        l = l_new;
        f = value_new.f;
        g = -(l.t().dot(&value_new.gq).dot(&t_inv)).t().to_owned();
    }

    let phi = tmat.t().dot(&tmat);
    let loadings = if opts.normalize { a.dot(&t_inv.t()) } else { l };
    log::info!(
        "oblique {} rotation finished: f = {f:.6e}, converged = {converged}, iterations = {iterations}",
        criterion.name()
    );
    Ok(RotationFit {
        result: RotationResult {
            loadings,
            rotation: tmat,
            phi: Some(phi),
            objective: f,
            converged,
            iterations,
            method: criterion.name(),
        },
        diagnostics: RotationDiagnostics {
            history,
            line_search_exhaustions: exhaustions,
            used_fallback: false,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{Quartimin, Varimax};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_loadings(p: usize, k: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((p, k), |_| rng.gen_range(-0.9..0.9))
    }

    #[test]
    fn single_factor_is_rejected() {
        let a = random_loadings(6, 1, 1);
        let err = rotate_orthogonal(a.view(), &Varimax, None, &RotOpts::default());
        assert!(matches!(
            err,
            Err(RotationError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn orthogonal_rotation_stays_on_the_stiefel_manifold() {
        let a = random_loadings(10, 3, 2);
        let fit = rotate_orthogonal(a.view(), &Varimax, None, &RotOpts::default()).unwrap();
        let gram = fit.result.rotation.t().dot(&fit.result.rotation);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(gram[(i, j)], expected, epsilon = 1e-8);
            }
        }
        assert!(fit.result.phi.is_none());
    }

    #[test]
    fn oblique_rotation_keeps_unit_column_norms() {
        let a = random_loadings(12, 3, 3);
        let fit = rotate_oblique(a.view(), &Quartimin, None, &RotOpts::default()).unwrap();
        for col in fit.result.rotation.columns() {
            let norm = col.iter().map(|v| v * v).sum::<f64>().sqrt();
            assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-10);
        }
        let phi = fit.result.phi.as_ref().unwrap();
        for i in 0..3 {
            assert_abs_diff_eq!(phi[(i, i)], 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn accepted_objective_sequence_is_monotone_after_line_search() {
        let a = random_loadings(9, 3, 4);
        let fit = rotate_orthogonal(a.view(), &Varimax, None, &RotOpts::default()).unwrap();
        // With no exhausted line searches every committed step must descend.
        assert_eq!(fit.diagnostics.line_search_exhaustions, 0);
        for pair in fit.diagnostics.history.windows(2) {
            assert!(pair[1].objective <= pair[0].objective + 1e-12);
        }
    }

    #[test]
    fn rotating_a_converged_solution_is_idempotent() {
        let a = random_loadings(8, 2, 5);
        let opts = RotOpts::default();
        let first = rotate_orthogonal(a.view(), &Varimax, None, &opts).unwrap();
        assert!(first.result.converged);
        let again =
            rotate_orthogonal(first.result.loadings.view(), &Varimax, None, &opts).unwrap();
        assert!(again.result.converged);
        assert!(again.result.iterations <= 1);
    }

    #[test]
    fn kaiser_normalization_preserves_row_norms_under_orthogonal_rotation() {
        let a = array![
            [0.9, 0.1],
            [0.8, 0.2],
            [0.7, 0.3],
            [0.1, 0.9],
            [0.2, 0.8],
            [0.3, 0.7]
        ];
        let opts = RotOpts::default().with_normalize(true);
        let fit = rotate_orthogonal(a.view(), &Varimax, None, &opts).unwrap();
        for (orig, rotated) in a.rows().into_iter().zip(fit.result.loadings.rows()) {
            let before: f64 = orig.iter().map(|v| v * v).sum();
            let after: f64 = rotated.iter().map(|v| v * v).sum();
            assert_abs_diff_eq!(before, after, epsilon = 1e-10);
        }
    }

    #[test]
    fn history_starts_at_iteration_zero() {
        let a = random_loadings(7, 2, 6);
        let fit = rotate_orthogonal(a.view(), &Varimax, None, &RotOpts::default()).unwrap();
        assert_eq!(fit.diagnostics.history[0].iteration, 0);
        assert_eq!(
            fit.diagnostics.history.len(),
            fit.result.iterations + 1
        );
    }
}
