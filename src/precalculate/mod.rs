//! Precomputed pairwise interaction table
//!
//! Pair energies are sampled on a uniform grid in squared distance, so a lookup
//! never needs a square root. Each sample stores the energy and `dE/dr / r`,
//! which multiplied by the displacement vector gives the pair force directly.

use rayon::prelude::*;
use thiserror::Error;

use crate::atom::AtomType;
use crate::forcefield::{ForceField, ForceFieldError};

/// Errors that can occur when building or querying the table
#[derive(Error, Debug)]
pub enum TableError {
    #[error("Invalid table parameters: {0}")]
    InvalidParameters(String),

    #[error("Squared distance {0} is not a finite non-negative number")]
    NonFiniteDistance(f64),

    #[error("ForceField error: {0}")]
    ForceField(#[from] ForceFieldError),
}

/// Samples for one unordered pair of atom types
#[derive(Debug, Clone)]
struct PairSamples {
    energy: Vec<f64>,
    dor: Vec<f64>,
}

impl PairSamples {
    fn build(
        forcefield: &dyn ForceField,
        t1: AtomType,
        t2: AtomType,
        n: usize,
        factor: f64,
    ) -> Result<Self, TableError> {
        let rs: Vec<f64> = (0..n).map(|i| (i as f64 / factor).sqrt()).collect();
        let energy = rs
            .iter()
            .map(|&r| forcefield.pair_energy(t1, t2, r))
            .collect::<Result<Vec<_>, _>>()?;

        // Central differences in r; the end points carry no force
        let mut dor = vec![0.0; n];
        for i in 1..n - 1 {
            let dr = rs[i + 1] - rs[i - 1];
            if dr > 0.0 && rs[i] > 0.0 {
                dor[i] = (energy[i + 1] - energy[i - 1]) / (dr * rs[i]);
            }
        }

        Ok(Self { energy, dor })
    }
}

/// Pairwise interaction lookup table indexed by atom-type pair and squared distance
#[derive(Debug, Clone)]
pub struct InteractionTable {
    cutoff_sqr: f64,
    factor: f64,
    pairs: Vec<PairSamples>,
}

impl InteractionTable {
    /// Sample `forcefield` for every atom-type pair with `factor` samples per Å².
    pub fn new(forcefield: &dyn ForceField, factor: f64) -> Result<Self, TableError> {
        let cutoff = forcefield.cutoff();
        if !(cutoff > 0.0 && cutoff.is_finite()) {
            return Err(TableError::InvalidParameters(format!("cutoff {}", cutoff)));
        }
        if !(factor > 0.0 && factor.is_finite()) {
            return Err(TableError::InvalidParameters(format!("factor {}", factor)));
        }

        let cutoff_sqr = cutoff * cutoff;
        let n = (factor * cutoff_sqr).ceil() as usize + 3;

        let type_pairs: Vec<(AtomType, AtomType)> = AtomType::ALL
            .iter()
            .enumerate()
            .flat_map(|(j, &tj)| AtomType::ALL[..=j].iter().map(move |&ti| (ti, tj)))
            .collect();

        let pairs = type_pairs
            .par_iter()
            .map(|&(ti, tj)| PairSamples::build(forcefield, ti, tj, n, factor))
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "interaction table for {}: {} type pairs x {} samples",
            forcefield.name(),
            pairs.len(),
            n
        );

        Ok(Self {
            cutoff_sqr,
            factor,
            pairs,
        })
    }

    pub fn cutoff_sqr(&self) -> f64 {
        self.cutoff_sqr
    }

    fn pair_index(t1: AtomType, t2: AtomType) -> usize {
        let (i, j) = if t1.index() <= t2.index() {
            (t1.index(), t2.index())
        } else {
            (t2.index(), t1.index())
        };
        j * (j + 1) / 2 + i
    }

    /// Energy and `dE/dr / r` at squared distance `r2`
    pub fn eval_deriv(
        &self,
        t1: AtomType,
        t2: AtomType,
        r2: f64,
    ) -> Result<(f64, f64), TableError> {
        if !(r2 >= 0.0) || r2.is_infinite() {
            return Err(TableError::NonFiniteDistance(r2));
        }
        if r2 >= self.cutoff_sqr {
            return Ok((0.0, 0.0));
        }

        let samples = &self.pairs[Self::pair_index(t1, t2)];
        let scaled = self.factor * r2;
        let i1 = scaled as usize;
        let i2 = i1 + 1;
        let rem = scaled - i1 as f64;

        let e = samples.energy[i1] + rem * (samples.energy[i2] - samples.energy[i1]);
        let dor = samples.dor[i1] + rem * (samples.dor[i2] - samples.dor[i1]);
        Ok((e, dor))
    }

    /// Energy only
    pub fn eval(&self, t1: AtomType, t2: AtomType, r2: f64) -> Result<f64, TableError> {
        self.eval_deriv(t1, t2, r2).map(|(e, _)| e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forcefield::vina::VinaForceField;

    fn table() -> InteractionTable {
        InteractionTable::new(&VinaForceField::new(), 32.0).unwrap()
    }

    #[test]
    fn test_matches_forcefield_at_samples() {
        let ff = VinaForceField::new();
        let table = table();
        let r2 = 16.0; // exactly on a sample
        let expected = ff.pair_energy(AtomType::Carbon, AtomType::OxygenA, 4.0).unwrap();
        let got = table.eval(AtomType::Carbon, AtomType::OxygenA, r2).unwrap();
        assert!((expected - got).abs() < 1e-12);
    }

    #[test]
    fn test_is_symmetric_in_types() {
        let table = table();
        let a = table.eval_deriv(AtomType::HydrogenD, AtomType::NitrogenA, 5.3).unwrap();
        let b = table.eval_deriv(AtomType::NitrogenA, AtomType::HydrogenD, 5.3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_beyond_cutoff() {
        let table = table();
        assert_eq!(table.eval_deriv(AtomType::Carbon, AtomType::Carbon, 64.0).unwrap(), (0.0, 0.0));
        assert_eq!(table.eval_deriv(AtomType::Carbon, AtomType::Carbon, 1e9).unwrap(), (0.0, 0.0));
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let table = table();
        let r: f64 = 5.0;
        let h = 1e-3;
        let (_, dor) = table.eval_deriv(AtomType::Carbon, AtomType::Carbon, r * r).unwrap();
        let ep = table.eval(AtomType::Carbon, AtomType::Carbon, (r + h).powi(2)).unwrap();
        let em = table.eval(AtomType::Carbon, AtomType::Carbon, (r - h).powi(2)).unwrap();
        let numeric = (ep - em) / (2.0 * h);
        assert!((dor * r - numeric).abs() < 1e-3);
    }

    #[test]
    fn test_nan_distance_is_an_error() {
        let table = table();
        assert!(matches!(
            table.eval_deriv(AtomType::Carbon, AtomType::Carbon, f64::NAN),
            Err(TableError::NonFiniteDistance(_))
        ));
    }
}
