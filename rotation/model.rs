//! Configuration, method selection, and result types for the rotation engine.
//!
//! Everything a caller exchanges with the engine lives here: the validated
//! [`RotOpts`] configuration, the closed [`Method`] set, the immutable
//! [`RotationResult`] / [`RotationDiagnostics`] outputs, and the crate-wide
//! [`RotationError`] taxonomy. Result shapes are closed structs with `phi` as
//! an explicit optional field; there are no method-dependent dynamic maps.

use ndarray::Array2;
use std::str::FromStr;
use thiserror::Error;

/// A comprehensive error type for the rotation engine.
///
/// A failure inside a single restart is caught at the restart boundary and
/// excluded from selection; only when every restart fails does the harness
/// surface [`RotationError::AllRestartsFailed`]. Exhausting `max_iter` is
/// *not* an error: it is a normal terminal state with `converged = false`.
#[derive(Error, Debug)]
pub enum RotationError {
    #[error("invalid rotation configuration: {0}")]
    InvalidConfiguration(String),

    #[error("singular matrix while {context}")]
    SingularMatrix { context: &'static str },

    #[error("numerical instability while {context}: {detail}")]
    NumericalInstability {
        context: &'static str,
        detail: String,
    },

    #[error("rank-deficient matrix: no singular value above threshold {threshold:.3e}")]
    RankDeficient { threshold: f64 },

    #[error("matrix decomposition failed while {context}: {source}")]
    DecompositionFailed {
        context: &'static str,
        #[source]
        source: ndarray_linalg::error::LinalgError,
    },

    #[error("all {attempted} restart(s) failed; first failure: {first}")]
    AllRestartsFailed {
        attempted: usize,
        first: Box<RotationError>,
    },
}

/// The constraint manifold a method optimizes over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    /// `TᵗT = I`; factors stay uncorrelated and `phi` is reported as `None`.
    Orthogonal,
    /// Unit-column-norm `T`; factors may correlate and `phi = TᵗT`.
    Oblique,
}

/// The closed set of rotation methods the harness dispatches on.
///
/// Criterion parameters (`gamma`, `delta`, `kappa`, the simplimax zero count)
/// come from [`RotOpts`]; target and weight matrices are supplied at call
/// time through the harness entry points that accept them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    None,
    Varimax,
    Varimin,
    Quartimax,
    Quartimin,
    Oblimin,
    Geomin,
    Bentler,
    Infomax,
    Simplimax,
    TandemI,
    TandemII,
    Mccammon,
    Entropy,
    Bifactor,
    Bigeomin,
    CrawfordFerguson,
    Target,
    Pst,
    LpWls,
    Promax,
    TargetRot,
}

impl Method {
    pub fn name(self) -> &'static str {
        match self {
            Method::None => "none",
            Method::Varimax => "varimax",
            Method::Varimin => "varimin",
            Method::Quartimax => "quartimax",
            Method::Quartimin => "quartimin",
            Method::Oblimin => "oblimin",
            Method::Geomin => "geomin",
            Method::Bentler => "bentler",
            Method::Infomax => "infomax",
            Method::Simplimax => "simplimax",
            Method::TandemI => "tandemi",
            Method::TandemII => "tandemii",
            Method::Mccammon => "mccammon",
            Method::Entropy => "entropy",
            Method::Bifactor => "bifactor",
            Method::Bigeomin => "bigeomin",
            Method::CrawfordFerguson => "cf",
            Method::Target => "target",
            Method::Pst => "pst",
            Method::LpWls => "lp-wls",
            Method::Promax => "promax",
            Method::TargetRot => "targetrot",
        }
    }

    /// The manifold this method is conventionally run on.
    pub fn family(self) -> Family {
        match self {
            Method::Quartimin
            | Method::Oblimin
            | Method::Geomin
            | Method::Simplimax
            | Method::Bigeomin
            | Method::LpWls
            | Method::Promax
            | Method::TargetRot => Family::Oblique,
            _ => Family::Orthogonal,
        }
    }

    /// Whether the criterion is known to have multiple local optima.
    ///
    /// Only these methods get more than one start from the harness; methods
    /// with a single optimum by construction (including `none`) always run
    /// exactly one.
    pub fn prone_to_local_optima(self) -> bool {
        matches!(
            self,
            Method::Quartimin
                | Method::Oblimin
                | Method::Geomin
                | Method::Bentler
                | Method::Infomax
                | Method::Simplimax
                | Method::TandemII
                | Method::Mccammon
                | Method::Entropy
                | Method::Bigeomin
        )
    }
}

impl FromStr for Method {
    type Err = RotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Method::None),
            "varimax" => Ok(Method::Varimax),
            "varimin" => Ok(Method::Varimin),
            "quartimax" => Ok(Method::Quartimax),
            "quartimin" => Ok(Method::Quartimin),
            "oblimin" => Ok(Method::Oblimin),
            "geomin" => Ok(Method::Geomin),
            "bentler" => Ok(Method::Bentler),
            "infomax" => Ok(Method::Infomax),
            "simplimax" => Ok(Method::Simplimax),
            "tandemi" | "tandem1" => Ok(Method::TandemI),
            "tandemii" | "tandem2" => Ok(Method::TandemII),
            "mccammon" => Ok(Method::Mccammon),
            "entropy" => Ok(Method::Entropy),
            "bifactor" => Ok(Method::Bifactor),
            "bigeomin" => Ok(Method::Bigeomin),
            "cf" => Ok(Method::CrawfordFerguson),
            "target" => Ok(Method::Target),
            "pst" => Ok(Method::Pst),
            "lp-wls" | "lpwls" => Ok(Method::LpWls),
            "promax" => Ok(Method::Promax),
            "targetrot" | "cluster" => Ok(Method::TargetRot),
            other => Err(RotationError::InvalidConfiguration(format!(
                "unknown rotation method '{other}'"
            ))),
        }
    }
}

/// Configuration for a rotation run.
///
/// Validated once by [`RotOpts::validate`] before any loop starts; invalid
/// combinations fail fast instead of surfacing mid-optimization.
#[derive(Clone, Debug)]
pub struct RotOpts {
    /// Convergence threshold on the Frobenius norm of the projected gradient.
    pub eps: f64,
    /// Outer-iteration cap for the GPA loops.
    pub max_iter: usize,
    /// Initial line-search step size.
    pub alpha0: f64,
    /// Oblimin row-demeaning weight; 0 is quartimin, 0.5 is biquartimin.
    pub gamma: f64,
    /// Geomin regularizer added to squared loadings; must stay strictly positive.
    pub delta: f64,
    /// Crawford–Ferguson complexity weight in `[0, 1]`.
    pub kappa: f64,
    /// Promax power; values below 1 fall back to the default of 4.
    pub promax_power: i32,
    /// Restart budget for methods prone to multiple local optima.
    pub restarts: usize,
    /// Number of squared loadings simplimax drives to zero; defaults to the
    /// number of variables when unset.
    pub simplimax_zeros: Option<usize>,
    /// Kaiser normalization: row-scale loadings by their communality before
    /// rotating, undo afterwards.
    pub normalize: bool,
    /// Explicit seed for the random restart generator. When unset the seed is
    /// derived from a deterministic hash of the input loadings so repeated
    /// runs on the same data are bit-reproducible.
    pub seed: Option<u64>,
}

impl Default for RotOpts {
    fn default() -> Self {
        Self {
            eps: 1e-5,
            max_iter: 1000,
            alpha0: 1.0,
            gamma: 0.0,
            delta: 0.01,
            kappa: 0.0,
            promax_power: 4,
            restarts: 1,
            simplimax_zeros: None,
            normalize: false,
            seed: None,
        }
    }
}

impl RotOpts {
    pub fn validate(&self) -> Result<(), RotationError> {
        if !(self.eps.is_finite() && self.eps > 0.0) {
            return Err(RotationError::InvalidConfiguration(format!(
                "eps must be a positive finite number, got {}",
                self.eps
            )));
        }
        if self.max_iter == 0 {
            return Err(RotationError::InvalidConfiguration(
                "max_iter must be at least 1".to_string(),
            ));
        }
        if !(self.alpha0.is_finite() && self.alpha0 > 0.0) {
            return Err(RotationError::InvalidConfiguration(format!(
                "alpha0 must be a positive finite number, got {}",
                self.alpha0
            )));
        }
        if !self.gamma.is_finite() {
            return Err(RotationError::InvalidConfiguration(format!(
                "gamma must be finite, got {}",
                self.gamma
            )));
        }
        if !(self.delta.is_finite() && self.delta > 0.0) {
            return Err(RotationError::InvalidConfiguration(format!(
                "delta must be strictly positive, got {}",
                self.delta
            )));
        }
        if !(0.0..=1.0).contains(&self.kappa) {
            return Err(RotationError::InvalidConfiguration(format!(
                "kappa must lie in [0, 1], got {}",
                self.kappa
            )));
        }
        if self.restarts == 0 {
            return Err(RotationError::InvalidConfiguration(
                "restarts must be at least 1".to_string(),
            ));
        }
        if let Some(zeros) = self.simplimax_zeros {
            if zeros == 0 {
                return Err(RotationError::InvalidConfiguration(
                    "simplimax_zeros must be at least 1 when set".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_restarts(mut self, restarts: usize) -> Self {
        self.restarts = restarts;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }
}

/// One row of the per-iteration history table.
#[derive(Clone, Copy, Debug)]
pub struct IterationRecord {
    pub iteration: usize,
    pub objective: f64,
    /// `log10` of the projected-gradient Frobenius norm.
    pub log10_gradient_norm: f64,
    /// Step size in effect when the row was recorded.
    pub step: f64,
}

/// Per-run diagnostics returned alongside every rotation result.
#[derive(Clone, Debug, Default)]
pub struct RotationDiagnostics {
    /// `(iter, f, log10 ‖Gp‖, α)` per outer iteration.
    pub history: Vec<IterationRecord>,
    /// Number of outer iterations whose line search ran out of backtracking
    /// attempts and committed the last rejected trial to keep moving.
    pub line_search_exhaustions: usize,
    /// Set when a closed-form solve failed and a documented fallback result
    /// was substituted (e.g. Promax returning its varimax stage). Never
    /// silent: the substitution is also logged at warn level.
    pub used_fallback: bool,
}

/// The immutable outcome of one rotation run.
#[derive(Clone, Debug)]
pub struct RotationResult {
    /// Rotated loadings, p×k.
    pub loadings: Array2<f64>,
    /// Rotation matrix `T`, k×k.
    pub rotation: Array2<f64>,
    /// Factor correlation matrix `TᵗT` for oblique rotations; `None` for
    /// orthogonal rotations, whose factor correlations are the identity by
    /// convention.
    pub phi: Option<Array2<f64>>,
    /// Final criterion value.
    pub objective: f64,
    /// Whether the projected-gradient norm dropped below `eps`.
    pub converged: bool,
    /// Outer iterations consumed.
    pub iterations: usize,
    /// Canonical method name.
    pub method: &'static str,
}

/// A rotation result plus its diagnostics.
#[derive(Clone, Debug)]
pub struct RotationFit {
    pub result: RotationResult,
    pub diagnostics: RotationDiagnostics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_opts_validate() {
        RotOpts::default().validate().unwrap();
    }

    #[test]
    fn zero_eps_is_rejected() {
        let opts = RotOpts::default().with_eps(0.0);
        assert!(matches!(
            opts.validate(),
            Err(RotationError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn non_positive_delta_is_rejected() {
        let opts = RotOpts {
            delta: 0.0,
            ..RotOpts::default()
        };
        assert!(opts.validate().is_err());
        let opts = RotOpts {
            delta: -0.01,
            ..RotOpts::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn method_names_round_trip() {
        let methods = [
            Method::None,
            Method::Varimax,
            Method::Varimin,
            Method::Quartimax,
            Method::Quartimin,
            Method::Oblimin,
            Method::Geomin,
            Method::Bentler,
            Method::Infomax,
            Method::Simplimax,
            Method::TandemI,
            Method::TandemII,
            Method::Mccammon,
            Method::Entropy,
            Method::Bifactor,
            Method::Bigeomin,
            Method::CrawfordFerguson,
            Method::Target,
            Method::Pst,
            Method::LpWls,
            Method::Promax,
            Method::TargetRot,
        ];
        for method in methods {
            assert_eq!(method.name().parse::<Method>().unwrap(), method);
        }
    }

    #[test]
    fn unknown_method_string_is_rejected() {
        assert!("equamax-ish".parse::<Method>().is_err());
    }

    #[test]
    fn oblique_methods_report_oblique_family() {
        assert_eq!(Method::Quartimin.family(), Family::Oblique);
        assert_eq!(Method::Geomin.family(), Family::Oblique);
        assert_eq!(Method::Promax.family(), Family::Oblique);
        assert_eq!(Method::Varimax.family(), Family::Orthogonal);
        assert_eq!(Method::Bentler.family(), Family::Orthogonal);
    }
}
