//! Atom types of the scoring model and atom records

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Atom types distinguished by the interaction table.
///
/// Serialized with their PDBQT spelling so job files read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomType {
    #[serde(rename = "C")]
    Carbon,
    #[serde(rename = "N")]
    Nitrogen,
    /// Hydrogen bond acceptor nitrogen
    #[serde(rename = "NA")]
    NitrogenA,
    #[serde(rename = "O")]
    Oxygen,
    /// Hydrogen bond acceptor oxygen
    #[serde(rename = "OA")]
    OxygenA,
    #[serde(rename = "S")]
    Sulfur,
    #[serde(rename = "P")]
    Phosphorus,
    #[serde(rename = "F")]
    Fluorine,
    #[serde(rename = "Cl")]
    Chlorine,
    #[serde(rename = "Br")]
    Bromine,
    #[serde(rename = "I")]
    Iodine,
    /// Polar hydrogen (hydrogen bond donor)
    #[serde(rename = "HD")]
    HydrogenD,
    #[serde(rename = "Met")]
    Metal,
}

impl AtomType {
    /// Number of distinct atom types
    pub const COUNT: usize = 13;

    /// Every atom type, ordered by [`AtomType::index`]
    pub const ALL: [AtomType; Self::COUNT] = [
        AtomType::Carbon,
        AtomType::Nitrogen,
        AtomType::NitrogenA,
        AtomType::Oxygen,
        AtomType::OxygenA,
        AtomType::Sulfur,
        AtomType::Phosphorus,
        AtomType::Fluorine,
        AtomType::Chlorine,
        AtomType::Bromine,
        AtomType::Iodine,
        AtomType::HydrogenD,
        AtomType::Metal,
    ];

    /// Dense index used to address per-type tables
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Returns the van der Waals radius of the atom type in Angstroms
    pub fn radius(&self) -> f64 {
        match self {
            AtomType::Carbon => 1.9,
            AtomType::Nitrogen | AtomType::NitrogenA => 1.8,
            AtomType::Oxygen | AtomType::OxygenA => 1.7,
            AtomType::Sulfur => 2.0,
            AtomType::Phosphorus => 2.1,
            AtomType::Fluorine => 1.5,
            AtomType::Chlorine => 1.8,
            AtomType::Bromine => 2.0,
            AtomType::Iodine => 2.2,
            AtomType::HydrogenD => 1.0,
            AtomType::Metal => 1.2,
        }
    }

    pub fn is_hydrophobic(&self) -> bool {
        matches!(
            self,
            AtomType::Carbon
                | AtomType::Fluorine
                | AtomType::Chlorine
                | AtomType::Bromine
                | AtomType::Iodine
        )
    }

    pub fn is_donor(&self) -> bool {
        matches!(self, AtomType::HydrogenD | AtomType::Metal)
    }

    pub fn is_acceptor(&self) -> bool {
        matches!(self, AtomType::NitrogenA | AtomType::OxygenA)
    }

    /// Convert atom type to its PDBQT spelling
    pub fn to_pdbqt_string(&self) -> &'static str {
        match self {
            AtomType::Carbon => "C",
            AtomType::Nitrogen => "N",
            AtomType::NitrogenA => "NA",
            AtomType::Oxygen => "O",
            AtomType::OxygenA => "OA",
            AtomType::Sulfur => "S",
            AtomType::Phosphorus => "P",
            AtomType::Fluorine => "F",
            AtomType::Chlorine => "Cl",
            AtomType::Bromine => "Br",
            AtomType::Iodine => "I",
            AtomType::HydrogenD => "HD",
            AtomType::Metal => "Met",
        }
    }
}

impl fmt::Display for AtomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_pdbqt_string())
    }
}

/// An atom in 3D space
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atom {
    pub atom_type: AtomType,

    /// 3D coordinates (in Angstroms)
    pub coordinates: Vector3<f64>,

    /// Atom name, informational only
    #[serde(default)]
    pub name: String,
}

impl Atom {
    pub fn new(atom_type: AtomType, coordinates: Vector3<f64>) -> Self {
        Self {
            atom_type,
            coordinates,
            name: String::new(),
        }
    }

    /// Euclidean distance to another atom
    pub fn distance(&self, other: &Atom) -> f64 {
        (self.coordinates - other.coordinates).norm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_dense() {
        for (i, t) in AtomType::ALL.iter().enumerate() {
            assert_eq!(t.index(), i);
        }
    }

    #[test]
    fn test_serde_uses_pdbqt_names() {
        let json = serde_json::to_string(&AtomType::OxygenA).unwrap();
        assert_eq!(json, "\"OA\"");
        let t: AtomType = serde_json::from_str("\"Cl\"").unwrap();
        assert_eq!(t, AtomType::Chlorine);
    }

    #[test]
    fn test_atom_distance() {
        let a = Atom::new(AtomType::Carbon, Vector3::new(0.0, 0.0, 0.0));
        let b = Atom::new(AtomType::Oxygen, Vector3::new(3.0, 4.0, 0.0));
        assert_eq!(a.distance(&b), 5.0);
    }
}
