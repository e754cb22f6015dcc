//! JSON job description for the `refine` binary

use std::path::Path;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::atom::Atom;
use crate::conf::Conf;
use crate::math::Vec3;
use crate::molecule::Molecule;
use crate::optimization::QuasiNewtonParams;

/// Errors that can occur when loading a job
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed job file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid job: {0}")]
    Invalid(String),
}

/// Axis-aligned search box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchBox {
    pub center: Vec3,
    pub size: Vec3,
}

impl SearchBox {
    /// Minimum corner
    pub fn corner1(&self) -> Vector3<f64> {
        self.center.to_vector3() - self.size.to_vector3() * 0.5
    }

    /// Maximum corner
    pub fn corner2(&self) -> Vector3<f64> {
        self.center.to_vector3() + self.size.to_vector3() * 0.5
    }
}

/// Allowed deviation of the initial orientation's norm from one
const ORIENTATION_TOLERANCE: f64 = 1e-6;

fn default_grid_spacing() -> f64 {
    0.375
}

fn default_cutoff() -> f64 {
    8.0
}

fn default_true() -> bool {
    true
}

/// One refinement job: a ligand, its receptor environment and the starting pose
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub ligand: Molecule,

    #[serde(default)]
    pub receptor: Vec<Atom>,

    #[serde(rename = "box")]
    pub search_box: SearchBox,

    #[serde(default = "default_grid_spacing")]
    pub grid_spacing: f64,

    /// Pair interaction cutoff (Angstroms)
    #[serde(default = "default_cutoff")]
    pub cutoff: f64,

    /// Uniform force applied to every ligand atom
    #[serde(default)]
    pub bias: Vec3,

    #[serde(default)]
    pub params: QuasiNewtonParams,

    /// Starting pose; a random one inside the box when absent
    #[serde(default)]
    pub initial: Option<Conf>,

    /// Precompute the receptor field on grids instead of summing it directly
    #[serde(default = "default_true")]
    pub use_grid_cache: bool,
}

impl JobConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let job: JobConfig = serde_json::from_str(text)?;
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ligand.atoms.is_empty() {
            return Err(ConfigError::Invalid("ligand has no atoms".to_string()));
        }
        self.ligand
            .check_bonds()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let size = self.search_box.size.to_vector3();
        if size.iter().any(|s| !(*s > 0.0 && s.is_finite())) {
            return Err(ConfigError::Invalid(format!("box size {:?}", size)));
        }
        if !(self.grid_spacing > 0.0 && self.grid_spacing.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "grid_spacing {}",
                self.grid_spacing
            )));
        }
        if !(self.cutoff > 0.0 && self.cutoff.is_finite()) {
            return Err(ConfigError::Invalid(format!("cutoff {}", self.cutoff)));
        }

        if let Some(conf) = &self.initial {
            if conf.num_torsions() != self.ligand.torsions.len() {
                return Err(ConfigError::Invalid(format!(
                    "initial pose has {} torsions, ligand has {}",
                    conf.num_torsions(),
                    self.ligand.torsions.len()
                )));
            }

            // Deserializing a unit quaternion does not normalize it
            let norm = conf.orientation.quaternion().norm();
            if !((norm - 1.0).abs() <= ORIENTATION_TOLERANCE) {
                return Err(ConfigError::Invalid(format!(
                    "initial orientation has norm {}",
                    norm
                )));
            }
        }

        self.params
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
