//! Flexible molecule topology: atoms, bonds and rotatable torsions

use crate::atom::Atom;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

/// Errors that can occur when working with molecules
#[derive(Error, Debug)]
pub enum MoleculeError {
    #[error("Invalid bond between atoms {0} and {1}")]
    InvalidBond(usize, usize),

    #[error("Invalid atom index: {0}")]
    InvalidAtomIndex(usize),

    #[error("Torsion {0} must move exactly one end of its bond")]
    InvalidTorsion(usize),

    #[error("Torsions {0} and {1} move overlapping but non-nested atom sets")]
    OverlappingTorsions(usize, usize),

    #[error("Every atom moves with some torsion; the root has no atoms")]
    EmptyRoot,

    #[error("No atoms in molecule")]
    EmptyMolecule,
}

/// A chemical bond between two atoms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bond {
    pub atom1_idx: usize,
    pub atom2_idx: usize,

    /// Is this bond rotatable?
    #[serde(default)]
    pub rotatable: bool,
}

/// A rotatable bond and the atoms that move when it rotates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Torsion {
    /// Index of the rotatable bond
    pub bond_idx: usize,

    /// Indices of atoms that move when this bond rotates
    pub moving_atoms: Vec<usize>,
}

/// A flexible molecule in its reference geometry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Molecule {
    #[serde(default)]
    pub name: String,

    pub atoms: Vec<Atom>,

    #[serde(default)]
    pub bonds: Vec<Bond>,

    #[serde(default)]
    pub torsions: Vec<Torsion>,
}

impl Molecule {
    /// Create a new empty molecule
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Add an atom to the molecule
    pub fn add_atom(&mut self, atom: Atom) -> usize {
        let idx = self.atoms.len();
        self.atoms.push(atom);
        idx
    }

    /// Add a bond between two atoms
    pub fn add_bond(
        &mut self,
        atom1_idx: usize,
        atom2_idx: usize,
        rotatable: bool,
    ) -> Result<usize, MoleculeError> {
        let n = self.atoms.len();
        if atom1_idx >= n || atom2_idx >= n || atom1_idx == atom2_idx {
            return Err(MoleculeError::InvalidBond(atom1_idx, atom2_idx));
        }

        let idx = self.bonds.len();
        self.bonds.push(Bond {
            atom1_idx,
            atom2_idx,
            rotatable,
        });
        Ok(idx)
    }

    /// Register a torsion about bond `bond_idx`, marking the bond rotatable
    pub fn add_torsion(
        &mut self,
        bond_idx: usize,
        moving_atoms: Vec<usize>,
    ) -> Result<usize, MoleculeError> {
        let idx = self.torsions.len();
        self.torsions.push(Torsion {
            bond_idx,
            moving_atoms,
        });
        if let Err(e) = self.check_torsion(idx) {
            self.torsions.pop();
            return Err(e);
        }
        self.bonds[bond_idx].rotatable = true;
        Ok(idx)
    }

    /// Every bond must join two distinct atoms of this molecule
    pub fn check_bonds(&self) -> Result<(), MoleculeError> {
        let n = self.atoms.len();
        for bond in &self.bonds {
            let (a, b) = (bond.atom1_idx, bond.atom2_idx);
            if a >= n || b >= n || a == b {
                return Err(MoleculeError::InvalidBond(a, b));
            }
        }
        Ok(())
    }

    /// Returns `(fixed end, moving end)` of torsion `idx`'s bond
    pub fn torsion_ends(&self, idx: usize) -> Result<(usize, usize), MoleculeError> {
        self.check_torsion(idx)
    }

    fn check_torsion(&self, idx: usize) -> Result<(usize, usize), MoleculeError> {
        let torsion = &self.torsions[idx];
        let bond = self
            .bonds
            .get(torsion.bond_idx)
            .ok_or(MoleculeError::InvalidTorsion(idx))?;

        if let Some(&bad) = torsion.moving_atoms.iter().find(|&&a| a >= self.atoms.len()) {
            return Err(MoleculeError::InvalidAtomIndex(bad));
        }

        let moves1 = torsion.moving_atoms.contains(&bond.atom1_idx);
        let moves2 = torsion.moving_atoms.contains(&bond.atom2_idx);
        match (moves1, moves2) {
            (false, true) => Ok((bond.atom1_idx, bond.atom2_idx)),
            (true, false) => Ok((bond.atom2_idx, bond.atom1_idx)),
            _ => Err(MoleculeError::InvalidTorsion(idx)),
        }
    }

    /// Get the center of the molecule
    pub fn center(&self) -> Result<Vector3<f64>, MoleculeError> {
        if self.atoms.is_empty() {
            return Err(MoleculeError::EmptyMolecule);
        }

        let sum = self
            .atoms
            .iter()
            .fold(Vector3::zeros(), |acc, atom| acc + atom.coordinates);

        Ok(sum / self.atoms.len() as f64)
    }

    /// Get the bounding box of the molecule
    pub fn bounding_box(&self) -> Result<(Vector3<f64>, Vector3<f64>), MoleculeError> {
        if self.atoms.is_empty() {
            return Err(MoleculeError::EmptyMolecule);
        }

        let mut min = Vector3::repeat(f64::MAX);
        let mut max = Vector3::repeat(f64::MIN);
        for atom in &self.atoms {
            min = min.inf(&atom.coordinates);
            max = max.sup(&atom.coordinates);
        }

        Ok((min, max))
    }

    /// Bond-graph adjacency lists
    pub fn neighbors(&self) -> Vec<Vec<usize>> {
        let mut adj = vec![Vec::new(); self.atoms.len()];
        for bond in &self.bonds {
            adj[bond.atom1_idx].push(bond.atom2_idx);
            adj[bond.atom2_idx].push(bond.atom1_idx);
        }
        adj
    }

    /// Atoms reachable from `start` within `max_bonds` bonds (including `start`)
    pub fn atoms_within_bonds(&self, start: usize, max_bonds: usize) -> HashSet<usize> {
        let adj = self.neighbors();
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([(start, 0)]);

        while let Some((atom, depth)) = queue.pop_front() {
            if depth == max_bonds {
                continue;
            }
            for &next in &adj[atom] {
                if seen.insert(next) {
                    queue.push_back((next, depth + 1));
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomType;

    fn chain(n: usize) -> Molecule {
        let mut mol = Molecule::new("chain");
        for i in 0..n {
            mol.add_atom(Atom::new(
                AtomType::Carbon,
                Vector3::new(1.5 * i as f64, 0.0, 0.0),
            ));
        }
        for i in 1..n {
            mol.add_bond(i - 1, i, false).unwrap();
        }
        mol
    }

    #[test]
    fn test_invalid_bond() {
        let mut mol = chain(2);
        assert!(matches!(
            mol.add_bond(0, 5, false),
            Err(MoleculeError::InvalidBond(0, 5))
        ));
    }

    #[test]
    fn test_check_bonds_catches_deserialized_out_of_range_bond() {
        let mut mol = chain(2);
        assert!(mol.check_bonds().is_ok());
        mol.bonds.push(Bond {
            atom1_idx: 0,
            atom2_idx: 7,
            rotatable: false,
        });
        assert!(matches!(
            mol.check_bonds(),
            Err(MoleculeError::InvalidBond(0, 7))
        ));
    }

    #[test]
    fn test_torsion_must_move_one_end() {
        let mut mol = chain(4);
        assert!(mol.add_torsion(1, vec![1, 2, 3]).is_err());
        assert!(mol.torsions.is_empty());
        let idx = mol.add_torsion(1, vec![2, 3]).unwrap();
        assert_eq!(mol.torsion_ends(idx).unwrap(), (1, 2));
        assert!(mol.bonds[1].rotatable);
    }

    #[test]
    fn test_atoms_within_bonds() {
        let mol = chain(6);
        let near = mol.atoms_within_bonds(0, 3);
        assert_eq!(near, HashSet::from([0, 1, 2, 3]));
    }

    #[test]
    fn test_center_and_bounding_box() {
        let mol = chain(3);
        let center = mol.center().unwrap();
        let (min, max) = mol.bounding_box().unwrap();
        assert_eq!(center, Vector3::new(1.5, 0.0, 0.0));
        assert_eq!(min.x, 0.0);
        assert_eq!(max.x, 3.0);
        assert!(Molecule::new("empty").center().is_err());
    }
}
