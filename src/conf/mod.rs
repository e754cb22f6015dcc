//! Generalized coordinates of a flexible ligand pose (host encoding)
//!
//! A [`Conf`] places the ligand's root rigid body (position and orientation)
//! and sets every torsion angle. A [`Change`] lives in the same coordinate
//! space with one entry per degree of freedom, laid out as
//! `[position (3), orientation (3), torsions (n)]`.

use nalgebra::{UnitQuaternion, Vector3};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::math::{normalize_angle, quaternion_increment};
use crate::optimization::{GeneralizedState, GeneralizedVector};

/// A ligand conformation in generalized coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conf {
    /// Position of the root rigid body origin (Angstroms)
    pub position: Vector3<f64>,

    /// Orientation of the root rigid body
    pub orientation: UnitQuaternion<f64>,

    /// Torsion angles (radians), one per rotatable bond
    pub torsions: Vec<f64>,
}

impl Conf {
    pub fn new(
        position: Vector3<f64>,
        orientation: UnitQuaternion<f64>,
        torsions: Vec<f64>,
    ) -> Self {
        Self {
            position,
            orientation,
            torsions,
        }
    }

    /// Unrotated pose at `position` with every torsion at zero
    pub fn at(position: Vector3<f64>, num_torsions: usize) -> Self {
        Self::new(position, UnitQuaternion::identity(), vec![0.0; num_torsions])
    }

    pub fn num_torsions(&self) -> usize {
        self.torsions.len()
    }

    /// Random pose with the root inside the box `[corner1, corner2]`
    pub fn randomize<R: Rng + ?Sized>(
        rng: &mut R,
        corner1: &Vector3<f64>,
        corner2: &Vector3<f64>,
        num_torsions: usize,
    ) -> Self {
        let position = Vector3::from_fn(|i, _| rng.gen_range(corner1[i]..=corner2[i]));

        // Rejection sampling inside the unit 4-ball gives a uniform rotation
        let orientation = loop {
            let q = nalgebra::Quaternion::new(
                rng.gen_range(-1.0..=1.0),
                rng.gen_range(-1.0..=1.0),
                rng.gen_range(-1.0..=1.0),
                rng.gen_range(-1.0..=1.0),
            );
            let n = q.norm();
            if n > 1e-3 && n <= 1.0 {
                break UnitQuaternion::from_quaternion(q);
            }
        };

        let torsions = (0..num_torsions).map(|_| rng.gen_range(-PI..PI)).collect();
        Self::new(position, orientation, torsions)
    }
}

impl GeneralizedState for Conf {
    type Change = Change;

    fn degrees_of_freedom(&self) -> usize {
        6 + self.torsions.len()
    }

    fn increment(&mut self, change: &Change, factor: f64) {
        self.position += change.position * factor;
        self.orientation = quaternion_increment(&self.orientation, &(change.orientation * factor));
        for (t, d) in self.torsions.iter_mut().zip(&change.torsions) {
            *t = normalize_angle(*t + factor * d);
        }
    }
}

/// Gradient (or step) in generalized coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Derivative with respect to the root position (minus the net force)
    pub position: Vector3<f64>,

    /// Derivative with respect to a rotation vector (minus the net torque)
    pub orientation: Vector3<f64>,

    pub torsions: Vec<f64>,
}

impl Change {
    pub fn zeros(num_torsions: usize) -> Self {
        Self {
            position: Vector3::zeros(),
            orientation: Vector3::zeros(),
            torsions: vec![0.0; num_torsions],
        }
    }

    /// A zeroed change sized for `conf`
    pub fn for_conf(conf: &Conf) -> Self {
        Self::zeros(conf.num_torsions())
    }
}

impl GeneralizedVector for Change {
    fn len(&self) -> usize {
        6 + self.torsions.len()
    }

    fn get(&self, i: usize) -> f64 {
        match i {
            0..=2 => self.position[i],
            3..=5 => self.orientation[i - 3],
            _ => self.torsions[i - 6],
        }
    }

    fn set(&mut self, i: usize, value: f64) {
        match i {
            0..=2 => self.position[i] = value,
            3..=5 => self.orientation[i - 3] = value,
            _ => self.torsions[i - 6] = value,
        }
    }
}

/// A conformation together with its score.
///
/// `energy` stays `None` until a minimization of this pose has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPose {
    pub conf: Conf,
    pub energy: Option<f64>,
}

impl ScoredPose {
    pub fn new(conf: Conf) -> Self {
        Self { conf, energy: None }
    }
}
