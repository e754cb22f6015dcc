//! Vina-like empirical pair potential

use crate::atom::AtomType;
use crate::forcefield::{ForceField, ForceFieldError};

/// Parameters for Vina forcefield
#[derive(Debug, Clone)]
pub struct VinaParams {
    // Weights for each component of the scoring function
    pub weight_gauss1: f64,
    pub weight_gauss2: f64,
    pub weight_repulsion: f64,
    pub weight_hydrophobic: f64,
    pub weight_hydrogen: f64,

    /// Interaction cutoff in Angstroms
    pub cutoff: f64,
}

impl Default for VinaParams {
    fn default() -> Self {
        // Default parameters from the Vina paper
        Self {
            weight_gauss1: -0.0356,
            weight_gauss2: -0.00516,
            weight_repulsion: 0.840,
            weight_hydrophobic: -0.0351,
            weight_hydrogen: -0.587,
            cutoff: 8.0,
        }
    }
}

/// Implementation of the Vina scoring function
#[derive(Debug, Clone, Default)]
pub struct VinaForceField {
    pub params: VinaParams,
}

impl VinaForceField {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: VinaParams) -> Self {
        Self { params }
    }

    fn gauss1(d: f64) -> f64 {
        (-(d / 0.5).powi(2)).exp()
    }

    fn gauss2(d: f64) -> f64 {
        (-((d - 3.0) / 2.0).powi(2)).exp()
    }

    fn repulsion(d: f64) -> f64 {
        if d < 0.0 {
            d * d
        } else {
            0.0
        }
    }

    /// Piecewise linear ramp: 1 below `good`, 0 above `bad`
    fn slope_step(good: f64, bad: f64, d: f64) -> f64 {
        if d <= good {
            1.0
        } else if d >= bad {
            0.0
        } else {
            (bad - d) / (bad - good)
        }
    }
}

impl ForceField for VinaForceField {
    fn name(&self) -> &'static str {
        "Vina"
    }

    fn cutoff(&self) -> f64 {
        self.params.cutoff
    }

    fn pair_energy(
        &self,
        type1: AtomType,
        type2: AtomType,
        distance: f64,
    ) -> Result<f64, ForceFieldError> {
        if !distance.is_finite() || distance < 0.0 {
            return Err(ForceFieldError::InvalidDistance(distance));
        }
        if distance >= self.params.cutoff {
            return Ok(0.0);
        }

        // Surface distance
        let d = distance - (type1.radius() + type2.radius());
        let p = &self.params;

        let mut e = p.weight_gauss1 * Self::gauss1(d)
            + p.weight_gauss2 * Self::gauss2(d)
            + p.weight_repulsion * Self::repulsion(d);

        if type1.is_hydrophobic() && type2.is_hydrophobic() {
            e += p.weight_hydrophobic * Self::slope_step(0.5, 1.5, d);
        }
        let hbond = (type1.is_donor() && type2.is_acceptor())
            || (type2.is_donor() && type1.is_acceptor());
        if hbond {
            e += p.weight_hydrogen * Self::slope_step(-0.7, 0.0, d);
        }

        Ok(e)
    }
}
