#![deny(dead_code)]
#![deny(unused_imports)]

//! # thurstone
//!
//! A gradient-projection rotation engine for factor analysis: the iterative
//! optimizer that transforms an unrotated factor-loadings matrix into a
//! rotated one that is easier to interpret, so each variable loads strongly
//! on few factors.
//!
//! The engine is a pure, deterministic (given a seed) numerical
//! transformation over in-memory `ndarray` matrices. It consists of:
//!
//! - orthogonal and oblique GPA loops ([`rotate_orthogonal`],
//!   [`rotate_oblique`]) with an Armijo-style backtracking line search and
//!   manifold retraction;
//! - a pluggable family of objective/gradient criteria behind the
//!   [`Criterion`] trait;
//! - closed-form [`promax`] and [`target_rotate`] oblique rotations;
//! - a multi-restart selection harness ([`select_rotation`]) with
//!   deterministic data-hash seeding and parallel restarts;
//! - robust numerical primitives: a tolerance-truncated Moore–Penrose
//!   pseudoinverse ([`pinv`]) and squared multiple correlations ([`smc`]).
//!
//! No routine here performs I/O or terminates the process; every numerical
//! failure surfaces as a [`RotationError`].

pub mod criteria;
pub mod gpa;
pub mod harness;
pub mod linalg;
pub mod model;
pub mod promax;
pub mod smc;
pub mod target;

pub use crate::criteria::{Criterion, CriterionValue};
pub use crate::gpa::{rotate_oblique, rotate_orthogonal};
pub use crate::harness::{
    RestartCandidate, RotationSelection, StartKind, select_rotation, select_rotation_with,
};
pub use crate::linalg::pinv;
pub use crate::model::{
    Family, IterationRecord, Method, RotOpts, RotationDiagnostics, RotationError, RotationFit,
    RotationResult,
};
pub use crate::promax::promax;
pub use crate::smc::smc;
pub use crate::target::{factor_to_cluster, factor_to_cluster_cut, target_rotate};
