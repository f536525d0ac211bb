//! Rotation-selection harness: multi-restart dispatch over the GPA loops.
//!
//! The harness builds a deterministic list of starting rotation matrices
//! (identity first, then heuristic starts derived from varimax, promax, and
//! target rotation, then seeded random orthonormal fills), runs the
//! appropriate loop from each start, and keeps the candidate with the
//! smallest final objective. Restarts are independent and fan out on rayon; results are
//! collected by start index and reduced sequentially, so the selection is
//! reproducible regardless of completion order. A failure inside one restart
//! only removes that candidate; the selection fails only when every restart
//! fails.

use crate::criteria::{
    Bentler, Bifactor, Bigeomin, CrawfordFerguson, Criterion, Entropy, Geomin, Infomax,
    LpWeightedLeastSquares, McCammon, Oblimin, PartiallySpecifiedTarget, Quartimax, Quartimin,
    Simplimax, TandemI, TandemII, TargetCriterion, Varimax, Varimin,
};
use crate::gpa::{rotate_oblique, rotate_orthogonal};
use crate::linalg::{random_orthonormal, seed_from_matrix};
use crate::model::{
    Family, Method, RotOpts, RotationDiagnostics, RotationError, RotationFit, RotationResult,
};
use crate::promax::promax;
use crate::target::target_rotate;
use ndarray::{Array2, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;

/// Where a restart's starting rotation matrix came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartKind {
    Identity,
    VarimaxDerived,
    PromaxDerived,
    TargetDerived,
    Random(usize),
}

/// One restart's outcome, kept for diagnostics even when it failed.
#[derive(Debug)]
pub struct RestartCandidate {
    pub index: usize,
    pub start: StartKind,
    pub outcome: Result<RotationFit, RotationError>,
}

/// The harness output: the minimum-objective fit plus every per-restart
/// candidate for diagnostics and testing.
#[derive(Debug)]
pub struct RotationSelection {
    pub best: RotationFit,
    pub candidates: Vec<RestartCandidate>,
}

/// Runs `method` on the unrotated loadings `a`, restarting according to
/// `opts`, and returns the best candidate.
///
/// Methods that need a target or weight matrix must go through
/// [`select_rotation_with`]; calling them here reports
/// `InvalidConfiguration`.
pub fn select_rotation(
    a: ArrayView2<f64>,
    method: Method,
    opts: &RotOpts,
) -> Result<RotationSelection, RotationError> {
    select_rotation_with(a, method, opts, None, None)
}

/// [`select_rotation`] with the call-time matrices some criteria require:
/// `target` for the target/pst criteria (and optional cluster keys for
/// `targetrot`), `weights` for pst and lp-wls.
pub fn select_rotation_with(
    a: ArrayView2<f64>,
    method: Method,
    opts: &RotOpts,
    target: Option<ArrayView2<f64>>,
    weights: Option<ArrayView2<f64>>,
) -> Result<RotationSelection, RotationError> {
    opts.validate()?;
    let (p, k) = a.dim();
    if p == 0 {
        return Err(RotationError::InvalidConfiguration(
            "loadings matrix has no rows".to_string(),
        ));
    }
    // A single factor has nothing to rotate: report the identity no-op.
    if k == 1 {
        return Ok(single_candidate(identity_fit(a, method.name())));
    }
    match method {
        Method::None => Ok(single_candidate(identity_fit(a, "none"))),
        Method::Promax => Ok(single_candidate(promax(a, opts.promax_power, opts)?)),
        Method::TargetRot => Ok(single_candidate(target_rotate(a, target)?)),
        _ => select_gpa_rotation(a, method, opts, target, weights),
    }
}

fn select_gpa_rotation(
    a: ArrayView2<f64>,
    method: Method,
    opts: &RotOpts,
    target: Option<ArrayView2<f64>>,
    weights: Option<ArrayView2<f64>>,
) -> Result<RotationSelection, RotationError> {
    let (p, k) = a.dim();
    let criterion = criterion_for(method, opts, (p, k), target, weights)?;
    let family = method.family();
    let budget = if method.prone_to_local_optima() {
        opts.restarts
    } else {
        1
    };
    if budget < opts.restarts {
        log::debug!(
            "{} has a single optimum by construction; running one start instead of {}",
            method.name(),
            opts.restarts
        );
    }

    let mut starts: Vec<(StartKind, Array2<f64>)> = vec![(StartKind::Identity, Array2::eye(k))];
    if budget > 1 {
        match rotate_orthogonal(a, &Varimax, None, opts) {
            Ok(fit) => starts.push((StartKind::VarimaxDerived, fit.result.rotation)),
            Err(err) => log::debug!("varimax-derived start unavailable: {err}"),
        }
        match promax(a, opts.promax_power, opts) {
            Ok(fit) => starts.push((StartKind::PromaxDerived, fit.result.rotation)),
            Err(err) => log::debug!("promax-derived start unavailable: {err}"),
        }
        match target_rotate(a, None) {
            Ok(fit) => starts.push((StartKind::TargetDerived, fit.result.rotation)),
            Err(err) => log::debug!("target-derived start unavailable: {err}"),
        }
    }
    starts.truncate(budget);
    if starts.len() < budget {
        let seed = opts.seed.unwrap_or_else(|| seed_from_matrix(a));
        let mut rng = StdRng::seed_from_u64(seed);
        for index in starts.len()..budget {
            starts.push((StartKind::Random(index), random_orthonormal(k, &mut rng)?));
        }
    }

    log::info!(
        "selecting {} rotation ({:?} family) over {} start(s) on a {p}x{k} loadings matrix",
        method.name(),
        family,
        starts.len()
    );

    let criterion_ref: &dyn Criterion = criterion.as_ref();
    let candidates: Vec<RestartCandidate> = starts
        .into_par_iter()
        .enumerate()
        .map(|(index, (start, t0))| {
            let outcome = match family {
                Family::Orthogonal => rotate_orthogonal(a, criterion_ref, Some(t0.view()), opts),
                Family::Oblique => rotate_oblique(a, criterion_ref, Some(t0.view()), opts),
            };
            if let Err(err) = &outcome {
                log::warn!("restart #{index} ({start:?}) failed: {err}");
            }
            RestartCandidate {
                index,
                start,
                outcome,
            }
        })
        .collect();

    let Some(best_index) = pick_best(&candidates) else {
        let attempted = candidates.len();
        let first = candidates
            .into_iter()
            .find_map(|candidate| candidate.outcome.err())
            .map(Box::new)
            .unwrap_or_else(|| {
                Box::new(RotationError::InvalidConfiguration(
                    "no restart produced an outcome".to_string(),
                ))
            });
        return Err(RotationError::AllRestartsFailed { attempted, first });
    };
    let best = match &candidates[best_index].outcome {
        Ok(fit) => fit.clone(),
        // pick_best only returns indices of successful candidates.
        Err(_) => {
            return Err(RotationError::InvalidConfiguration(
                "internal selection inconsistency".to_string(),
            ));
        }
    };
    log::info!(
        "selected restart #{best_index} ({:?}) with objective {:.6e}",
        candidates[best_index].start,
        best.result.objective
    );
    Ok(RotationSelection { best, candidates })
}

/// Index of the successful candidate with the smallest objective. Ties keep
/// the first candidate in start order: the comparison is strict, and the
/// candidate list is ordered by start index, never by completion time.
fn pick_best(candidates: &[RestartCandidate]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for candidate in candidates {
        if let Ok(fit) = &candidate.outcome {
            let objective = fit.result.objective;
            let better = match best {
                None => true,
                Some((_, incumbent)) => objective < incumbent,
            };
            if better {
                best = Some((candidate.index, objective));
            }
        }
    }
    best.map(|(index, _)| index)
}

fn identity_fit(a: ArrayView2<f64>, method: &'static str) -> RotationFit {
    RotationFit {
        result: RotationResult {
            loadings: a.to_owned(),
            rotation: Array2::eye(a.ncols()),
            phi: None,
            objective: 0.0,
            converged: true,
            iterations: 0,
            method,
        },
        diagnostics: RotationDiagnostics::default(),
    }
}

fn single_candidate(fit: RotationFit) -> RotationSelection {
    RotationSelection {
        best: fit.clone(),
        candidates: vec![RestartCandidate {
            index: 0,
            start: StartKind::Identity,
            outcome: Ok(fit),
        }],
    }
}

fn criterion_for(
    method: Method,
    opts: &RotOpts,
    dims: (usize, usize),
    target: Option<ArrayView2<f64>>,
    weights: Option<ArrayView2<f64>>,
) -> Result<Box<dyn Criterion>, RotationError> {
    let (p, _) = dims;
    let criterion: Box<dyn Criterion> = match method {
        Method::Varimax => Box::new(Varimax),
        Method::Varimin => Box::new(Varimin),
        Method::Quartimax => Box::new(Quartimax),
        Method::Quartimin => Box::new(Quartimin),
        Method::Oblimin => Box::new(Oblimin::new(opts.gamma)),
        Method::Geomin => Box::new(Geomin::new(opts.delta)),
        Method::Bentler => Box::new(Bentler),
        Method::Infomax => Box::new(Infomax),
        Method::Simplimax => Box::new(Simplimax::new(opts.simplimax_zeros.unwrap_or(p))),
        Method::TandemI => Box::new(TandemI),
        Method::TandemII => Box::new(TandemII),
        Method::Mccammon => Box::new(McCammon),
        Method::Entropy => Box::new(Entropy),
        Method::Bifactor => Box::new(Bifactor),
        Method::Bigeomin => Box::new(Bigeomin::new(opts.delta)),
        Method::CrawfordFerguson => Box::new(CrawfordFerguson::new(opts.kappa)),
        Method::Target => {
            let t = target.ok_or_else(|| {
                RotationError::InvalidConfiguration(
                    "the target method requires a target matrix".to_string(),
                )
            })?;
            Box::new(TargetCriterion::new(t.to_owned()))
        }
        Method::Pst => {
            let t = target.ok_or_else(|| {
                RotationError::InvalidConfiguration(
                    "the pst method requires a target matrix".to_string(),
                )
            })?;
            let w = weights.ok_or_else(|| {
                RotationError::InvalidConfiguration(
                    "the pst method requires a weight matrix".to_string(),
                )
            })?;
            Box::new(PartiallySpecifiedTarget::new(w.to_owned(), t.to_owned()))
        }
        Method::LpWls => {
            let w = weights.ok_or_else(|| {
                RotationError::InvalidConfiguration(
                    "the lp-wls method requires a weight matrix".to_string(),
                )
            })?;
            Box::new(LpWeightedLeastSquares::new(w.to_owned()))
        }
        Method::None | Method::Promax | Method::TargetRot => {
            return Err(RotationError::InvalidConfiguration(format!(
                "{} is not a GPA criterion",
                method.name()
            )));
        }
    };
    Ok(criterion)
}
