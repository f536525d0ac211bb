//! Promax oblique rotation.
//!
//! Promax sharpens a varimax solution instead of running an oblique GPA
//! loop: the varimax loadings are raised to a power (sign preserved) to form
//! an idealized target, and the least-squares transformation onto that
//! target is solved in closed form. When the normal equations are singular
//! the varimax stage is returned as a documented, visible fallback.

use crate::criteria::Varimax;
use crate::gpa::rotate_orthogonal;
use crate::linalg::{rescale_oblique_transform, solve_normal_equations, tolerant_inverse};
use crate::model::{RotOpts, RotationError, RotationFit, RotationResult};
use ndarray::{Array2, ArrayView2};

/// Power applied when the caller passes a value below 1. Power 1 itself is
/// legal and reproduces the varimax solution exactly.
const DEFAULT_POWER: i32 = 4;

/// Promax rotation: varimax followed by a power-transform target alignment.
///
/// Returns the rotated loadings, the combined rotation `R = T₀·U`, and the
/// factor correlation matrix `Phi = R⁻¹·(R⁻¹)ᵗ`. Kaiser normalization and
/// the varimax loop settings are taken from `opts`.
pub fn promax(
    a: ArrayView2<f64>,
    power: i32,
    opts: &RotOpts,
) -> Result<RotationFit, RotationError> {
    let power = if power < 1 { DEFAULT_POWER } else { power };
    let varimax_fit = rotate_orthogonal(a, &Varimax, None, opts)?;
    let z = &varimax_fit.result.loadings;
    let t0 = &varimax_fit.result.rotation;

    // Sign-preserving power transform: Q = Z ⊙ |Z|^(power−1).
    let q = z.mapv(|v| v * v.abs().powi(power - 1));
    let gram = z.t().dot(z);
    let rhs = z.t().dot(&q);

    let oblique = (|| -> Result<(Array2<f64>, Array2<f64>, Array2<f64>), RotationError> {
        let u = solve_normal_equations(&gram, &rhs, "solving the promax normal equations")?;
        let u = rescale_oblique_transform(&u, "rescaling the promax transformation")?;
        let r = t0.dot(&u);
        let r_inv = tolerant_inverse(&r, "inverting the promax rotation")?;
        let phi = r_inv.dot(&r_inv.t());
        let loadings = a.dot(&r);
        Ok((loadings, r, phi))
    })();

    match oblique {
        Ok((loadings, rotation, phi)) => Ok(RotationFit {
            result: RotationResult {
                loadings,
                rotation,
                phi: Some(phi),
                objective: varimax_fit.result.objective,
                converged: varimax_fit.result.converged,
                iterations: varimax_fit.result.iterations,
                method: "promax",
            },
            diagnostics: varimax_fit.diagnostics,
        }),
        Err(err) => {
            log::warn!(
                "promax target alignment failed ({err}); returning the varimax solution instead"
            );
            let mut fallback = varimax_fit;
            fallback.result.method = "promax";
            fallback.diagnostics.used_fallback = true;
            Ok(fallback)
        }
    }
}
