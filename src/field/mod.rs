//! External potential fields acting on individual ligand atoms
//!
//! A field answers one question: what is the energy of an atom of a given type
//! at a given position, and how does it change with that position. Atoms that
//! leave the search box are evaluated at the nearest point of the box and pay a
//! linear penalty proportional to the distance outside.

use nalgebra::Vector3;
use thiserror::Error;

use crate::atom::{Atom, AtomType};
use crate::grid::{Grid, GridError};
use crate::precalculate::{InteractionTable, TableError};

/// Default energy penalty per Angstrom outside the search box
pub const DEFAULT_SLOPE: f64 = 1e6;

/// Errors that can occur when building or evaluating a field
#[derive(Error, Debug)]
pub enum FieldError {
    #[error("Grid error: {0}")]
    Grid(#[from] GridError),

    #[error("Interaction table error: {0}")]
    Table(#[from] TableError),

    #[error("No precomputed grid for atom type {0}")]
    MissingType(AtomType),

    #[error("Invalid search box: {0}")]
    InvalidBox(String),
}

/// Abstract potential interface evaluated once per ligand atom.
///
/// Implementations are shared read-only between concurrent minimizations.
pub trait FieldPotential: Send + Sync {
    /// Energy of an atom and its derivative with respect to the atom position
    fn eval_deriv(
        &self,
        atom_type: AtomType,
        position: &Vector3<f64>,
    ) -> Result<(f64, Vector3<f64>), FieldError>;
}

/// Linear penalty for the part of `position` outside the box `[lo, hi]`
fn out_of_box_penalty(
    clamped: &Vector3<f64>,
    position: &Vector3<f64>,
    slope: f64,
) -> (f64, Vector3<f64>) {
    let outside = position - clamped;
    let dist = outside.norm();
    if dist > 0.0 {
        (slope * dist, outside * (slope / dist))
    } else {
        (0.0, Vector3::zeros())
    }
}

/// Receptor field precomputed on one grid per ligand atom type
#[derive(Debug, Clone)]
pub struct GridCache {
    grids: Vec<Option<Grid>>,
    slope: f64,
}

impl GridCache {
    /// Sample the receptor field for each of `atom_types` on a grid starting at
    /// `corner1` with `dimensions` points spaced `spacing` apart.
    pub fn new(
        table: &InteractionTable,
        receptor: &[Atom],
        atom_types: &[AtomType],
        corner1: Vector3<f64>,
        spacing: f64,
        dimensions: Vector3<usize>,
        slope: f64,
    ) -> Result<Self, FieldError> {
        let mut grids: Vec<Option<Grid>> = vec![None; AtomType::COUNT];

        for &t in atom_types {
            if grids[t.index()].is_some() {
                continue;
            }
            let grid = Grid::from_fn::<_, FieldError>(corner1, spacing, dimensions, |p| {
                receptor.iter().try_fold(0.0, |acc, ra| {
                    let r2 = (p - ra.coordinates).norm_squared();
                    Ok::<f64, FieldError>(acc + table.eval(t, ra.atom_type, r2)?)
                })
            })?;
            log::debug!("precomputed {} grid with {} points", t, grid.data.len());
            grids[t.index()] = Some(grid);
        }

        Ok(Self { grids, slope })
    }

    /// Number of grid points needed to cover `size` at `spacing`
    pub fn dimensions_for(size: &Vector3<f64>, spacing: f64) -> Vector3<usize> {
        Vector3::from_fn(|i, _| (size[i] / spacing).ceil() as usize + 1)
    }
}

impl FieldPotential for GridCache {
    fn eval_deriv(
        &self,
        atom_type: AtomType,
        position: &Vector3<f64>,
    ) -> Result<(f64, Vector3<f64>), FieldError> {
        let grid = self.grids[atom_type.index()]
            .as_ref()
            .ok_or(FieldError::MissingType(atom_type))?;

        let (e, g) = grid.eval_clamped(position)?;
        let (pe, pg) = out_of_box_penalty(&grid.clamp(position), position, self.slope);
        Ok((e + pe, g + pg))
    }
}

/// Receptor field summed directly over receptor atoms on every call
#[derive(Debug, Clone)]
pub struct NonCache<'a> {
    table: &'a InteractionTable,
    receptor: &'a [Atom],
    corner1: Vector3<f64>,
    corner2: Vector3<f64>,
    slope: f64,
}

impl<'a> NonCache<'a> {
    pub fn new(
        table: &'a InteractionTable,
        receptor: &'a [Atom],
        corner1: Vector3<f64>,
        corner2: Vector3<f64>,
        slope: f64,
    ) -> Result<Self, FieldError> {
        if (0..3).any(|i| !(corner1[i] < corner2[i])) {
            return Err(FieldError::InvalidBox(format!(
                "{:?} .. {:?}",
                corner1, corner2
            )));
        }
        Ok(Self {
            table,
            receptor,
            corner1,
            corner2,
            slope,
        })
    }
}

impl FieldPotential for NonCache<'_> {
    fn eval_deriv(
        &self,
        atom_type: AtomType,
        position: &Vector3<f64>,
    ) -> Result<(f64, Vector3<f64>), FieldError> {
        let clamped = Vector3::from_fn(|i, _| position[i].clamp(self.corner1[i], self.corner2[i]));

        let mut e = 0.0;
        let mut g = Vector3::zeros();
        for ra in self.receptor {
            let r = clamped - ra.coordinates;
            let r2 = r.norm_squared();
            if r2 < self.table.cutoff_sqr() {
                let (pe, dor) = self.table.eval_deriv(atom_type, ra.atom_type, r2)?;
                e += pe;
                g += r * dor;
            }
        }

        // Clamped axes do not feel the receptor
        for i in 0..3 {
            if clamped[i] != position[i] {
                g[i] = 0.0;
            }
        }

        let (pe, pg) = out_of_box_penalty(&clamped, position, self.slope);
        Ok((e + pe, g + pg))
    }
}
