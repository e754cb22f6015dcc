//! Forcefields used to fill the pairwise interaction table

pub mod vina;

use crate::atom::AtomType;
use thiserror::Error;

/// Errors that can occur in forcefields
#[derive(Error, Debug)]
pub enum ForceFieldError {
    #[error("Invalid interatomic distance: {0}")]
    InvalidDistance(f64),
}

/// Trait representing a forcefield that scores a pair of atom types at a distance.
/// The Send + Sync bounds enable parallel table construction with rayon
pub trait ForceField: Send + Sync {
    /// Get the name of the forcefield
    fn name(&self) -> &'static str;

    /// Distance beyond which every pair term vanishes (Angstroms)
    fn cutoff(&self) -> f64;

    /// Calculate the interaction energy between two atom types at `distance`
    fn pair_energy(
        &self,
        type1: AtomType,
        type2: AtomType,
        distance: f64,
    ) -> Result<f64, ForceFieldError>;
}
