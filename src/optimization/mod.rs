//! Local optimization of docking poses
//!
//! The quasi-Newton driver in [`bfgs`] is generic over the state
//! representation: anything that implements [`GeneralizedState`] can be
//! minimized, given an [`Objective`] for it. [`quasi_newton`] binds the
//! molecular model to that contract and picks the host or accelerator
//! representation for each call.

pub mod bfgs;
pub mod quasi_newton;

use nalgebra::DVector;
use thiserror::Error;

use crate::model::EvaluationError;

pub use bfgs::{bfgs, ImprovementCriterion, Minimum, QuasiNewtonParams, Termination};
pub use quasi_newton::{Backend, DeviceAux, QuasiNewton, QuasiNewtonAux};

/// Errors that can occur during optimization
#[derive(Error, Debug)]
pub enum OptimizationError {
    #[error("Gradient has {actual} entries but the state has {expected} degrees of freedom")]
    GradientSizeMismatch { expected: usize, actual: usize },

    #[error("Conformation has {actual} torsions but the model has {expected}")]
    ConformationMismatch { expected: usize, actual: usize },

    #[error("Invalid convergence parameters: {0}")]
    InvalidParameters(String),

    #[error("Accelerator backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),
}

/// A vector in generalized-coordinate space with a fixed flat layout
pub trait GeneralizedVector: Clone {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, i: usize) -> f64;

    fn set(&mut self, i: usize, value: f64);

    fn dot(&self, other: &Self) -> f64 {
        (0..self.len()).map(|i| self.get(i) * other.get(i)).sum()
    }

    fn to_dvector(&self) -> DVector<f64> {
        DVector::from_fn(self.len(), |i, _| self.get(i))
    }

    /// Overwrite every entry from `values`, which must have the same length
    fn assign(&mut self, values: &DVector<f64>) {
        for (i, v) in values.iter().enumerate() {
            self.set(i, *v);
        }
    }
}

/// A point the driver can move along a direction
pub trait GeneralizedState: Clone {
    type Change: GeneralizedVector;

    fn degrees_of_freedom(&self) -> usize;

    /// Move by `factor * change`
    fn increment(&mut self, change: &Self::Change, factor: f64);
}

/// A differentiable scalar function of a state.
///
/// `evaluate` must be pure: the same state always yields the same energy and
/// gradient.
pub trait Objective<S: GeneralizedState> {
    /// Energy at `state`; `gradient` is overwritten with its derivatives
    fn evaluate(&self, state: &S, gradient: &mut S::Change) -> Result<f64, EvaluationError>;
}

impl GeneralizedVector for DVector<f64> {
    fn len(&self) -> usize {
        self.nrows()
    }

    fn get(&self, i: usize) -> f64 {
        self[i]
    }

    fn set(&mut self, i: usize, value: f64) {
        self[i] = value;
    }
}

impl GeneralizedState for DVector<f64> {
    type Change = DVector<f64>;

    fn degrees_of_freedom(&self) -> usize {
        self.nrows()
    }

    fn increment(&mut self, change: &DVector<f64>, factor: f64) {
        self.axpy(factor, change, 1.0);
    }
}
