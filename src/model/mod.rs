//! Energy and gradient of a flexible ligand in generalized coordinates
//!
//! The ligand is a tree of rigid segments. The root segment is placed by the
//! conformation's position and orientation; every other segment hangs off its
//! parent through one rotatable bond and turns about that bond by its torsion
//! angle. Energies are computed per atom in Cartesian space and the atomic
//! gradients are folded back onto the tree as net forces and torques.

use nalgebra::{Unit, UnitQuaternion, Vector3};
use rayon::prelude::*;
use std::collections::HashSet;
use thiserror::Error;

use crate::atom::{Atom, AtomType};
use crate::conf::{Change, Conf};
use crate::device::{Device, DeviceChange, DeviceConf};
use crate::field::{FieldError, FieldPotential};
use crate::grid::{Grid, GridError};
use crate::molecule::{Molecule, MoleculeError};
use crate::precalculate::{InteractionTable, TableError};

/// Pairs closer than this many bonds are excluded from the internal energy
const EXCLUDED_BOND_SEPARATION: usize = 3;

/// Errors that make a conformation impossible to score
#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("Interaction table error: {0}")]
    Table(#[from] TableError),

    #[error("Field error: {0}")]
    Field(#[from] FieldError),

    #[error("User grid error: {0}")]
    Grid(#[from] GridError),

    #[error("Expected {expected} torsions, got {actual}")]
    TorsionCount { expected: usize, actual: usize },

    #[error("Atom {0} has a non-finite coordinate")]
    NonFiniteCoordinate(usize),
}

/// Everything an evaluation reads besides the conformation itself.
///
/// Shared read-only by every evaluation of one minimization and, if the
/// caller wishes, by concurrent minimizations.
#[derive(Clone, Copy)]
pub struct EvaluationContext<'a> {
    /// Pairwise interactions used for the ligand's internal energy
    pub table: &'a InteractionTable,

    /// External potential acting on each ligand atom
    pub field: &'a dyn FieldPotential,

    /// Uniform applied force; each atom gains energy `-bias . position`
    pub bias: Vector3<f64>,

    /// Optional extra potential map added to every atom regardless of type
    pub user_grid: Option<&'a Grid>,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(table: &'a InteractionTable, field: &'a dyn FieldPotential) -> Self {
        Self {
            table,
            field,
            bias: Vector3::zeros(),
            user_grid: None,
        }
    }

    pub fn with_bias(mut self, bias: Vector3<f64>) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_user_grid(mut self, grid: &'a Grid) -> Self {
        self.user_grid = Some(grid);
        self
    }
}

/// A scoring model that can be differentiated with respect to a conformation.
///
/// Both methods must return the same energy and gradient for the same logical
/// conformation; the optimizer relies on it when switching backends.
pub trait EnergyModel: Send + Sync {
    fn num_torsions(&self) -> usize;

    fn degrees_of_freedom(&self) -> usize {
        6 + self.num_torsions()
    }

    /// Energy at `conf`; `gradient` is overwritten with its derivatives
    fn eval_deriv(
        &self,
        ctx: &EvaluationContext<'_>,
        conf: &Conf,
        gradient: &mut Change,
    ) -> Result<f64, EvaluationError>;

    /// Device-resident counterpart of [`EnergyModel::eval_deriv`].
    ///
    /// The default copies the state to the host and evaluates there.
    fn eval_deriv_device(
        &self,
        _device: &Device,
        ctx: &EvaluationContext<'_>,
        conf: &DeviceConf,
        gradient: &mut DeviceChange,
    ) -> Result<f64, EvaluationError> {
        let mut host_gradient = gradient.to_host();
        let e = self.eval_deriv(ctx, &conf.to_host(), &mut host_gradient)?;
        *gradient = DeviceChange::from_host(&host_gradient);
        Ok(e)
    }
}

/// One rigid piece of the torsion tree
#[derive(Debug, Clone)]
struct Segment {
    parent: Option<usize>,
    /// Index into the conformation's torsions (none for the root)
    torsion: Option<usize>,
    /// Origin in the parent's frame
    relative_origin: Vector3<f64>,
    /// Rotation axis in the parent's frame
    relative_axis: Unit<Vector3<f64>>,
    atoms: Vec<usize>,
}

/// Placement of one segment for a given conformation
#[derive(Debug, Clone)]
struct Frame {
    origin: Vector3<f64>,
    orientation: UnitQuaternion<f64>,
    axis: Vector3<f64>,
}

/// Generalized derivatives before they are written to a gradient buffer
struct Derivatives {
    position: Vector3<f64>,
    orientation: Vector3<f64>,
    torsions: Vec<f64>,
}

/// Flexible ligand scored against an external field
#[derive(Debug, Clone)]
pub struct Model {
    atom_types: Vec<AtomType>,
    /// Atom coordinates relative to their segment origin, reference pose
    internal: Vec<Vector3<f64>>,
    /// Segments with parents before children; index 0 is the root
    segments: Vec<Segment>,
    /// Internal pairs that can move relative to each other
    pairs: Vec<(usize, usize)>,
    root_origin: Vector3<f64>,
    num_torsions: usize,
}

impl Model {
    /// Build the torsion tree of `molecule` from its torsions' moving-atom sets
    pub fn from_molecule(molecule: &Molecule) -> Result<Self, MoleculeError> {
        let n_atoms = molecule.atoms.len();
        if n_atoms == 0 {
            return Err(MoleculeError::EmptyMolecule);
        }
        molecule.check_bonds()?;

        let moving: Vec<HashSet<usize>> = molecule
            .torsions
            .iter()
            .map(|t| t.moving_atoms.iter().copied().collect())
            .collect();
        let ends = (0..molecule.torsions.len())
            .map(|k| molecule.torsion_ends(k))
            .collect::<Result<Vec<_>, _>>()?;

        // Torsion sets must nest like a tree
        for a in 0..moving.len() {
            for b in (a + 1)..moving.len() {
                let overlap = !moving[a].is_disjoint(&moving[b]);
                let nested = moving[a].is_subset(&moving[b]) || moving[b].is_subset(&moving[a]);
                if overlap && (!nested || moving[a].len() == moving[b].len()) {
                    return Err(MoleculeError::OverlappingTorsions(a, b));
                }
            }
        }

        // Larger sets first so parents precede their children
        let mut order: Vec<usize> = (0..moving.len()).collect();
        order.sort_by(|&a, &b| moving[b].len().cmp(&moving[a].len()).then(a.cmp(&b)));

        // Owner segment per atom: smallest torsion set containing it, else root
        let mut owner = vec![0usize; n_atoms];
        for (pos, &k) in order.iter().enumerate() {
            for &a in &moving[k] {
                owner[a] = pos + 1;
            }
        }

        let root_atoms: Vec<usize> = (0..n_atoms).filter(|&a| owner[a] == 0).collect();
        if root_atoms.is_empty() {
            return Err(MoleculeError::EmptyRoot);
        }
        let coords: Vec<Vector3<f64>> = molecule.atoms.iter().map(|a| a.coordinates).collect();
        let root_origin = root_atoms
            .iter()
            .fold(Vector3::zeros(), |acc, &a| acc + coords[a])
            / root_atoms.len() as f64;

        let mut segments = vec![Segment {
            parent: None,
            torsion: None,
            relative_origin: Vector3::zeros(),
            relative_axis: Vector3::x_axis(),
            atoms: root_atoms,
        }];
        let mut origins = vec![root_origin];

        for (pos, &k) in order.iter().enumerate() {
            let (fixed, moving_end) = ends[k];
            let parent = owner[fixed];
            // The fixed end must sit in an enclosing segment
            if parent > pos {
                return Err(MoleculeError::InvalidTorsion(k));
            }
            let origin = coords[moving_end];
            let axis = origin - coords[fixed];
            let relative_axis =
                Unit::try_new(axis, 1e-9).ok_or(MoleculeError::InvalidTorsion(k))?;

            segments.push(Segment {
                parent: Some(parent),
                torsion: Some(k),
                relative_origin: origin - origins[parent],
                relative_axis,
                atoms: Vec::new(),
            });
            origins.push(origin);
        }

        for a in 0..n_atoms {
            if owner[a] != 0 {
                segments[owner[a]].atoms.push(a);
            }
        }

        let internal = (0..n_atoms).map(|a| coords[a] - origins[owner[a]]).collect();

        let mut pairs = Vec::new();
        for i in 0..n_atoms {
            let near = molecule.atoms_within_bonds(i, EXCLUDED_BOND_SEPARATION);
            for j in (i + 1)..n_atoms {
                if owner[i] != owner[j] && !near.contains(&j) {
                    pairs.push((i, j));
                }
            }
        }

        log::debug!(
            "model {}: {} atoms, {} torsions, {} internal pairs",
            molecule.name,
            n_atoms,
            molecule.torsions.len(),
            pairs.len()
        );

        Ok(Self {
            atom_types: molecule.atoms.iter().map(|a| a.atom_type).collect(),
            internal,
            segments,
            pairs,
            root_origin,
            num_torsions: molecule.torsions.len(),
        })
    }

    pub fn num_atoms(&self) -> usize {
        self.atom_types.len()
    }

    pub fn num_pairs(&self) -> usize {
        self.pairs.len()
    }

    /// Distinct atom types present, in first-seen order
    pub fn atom_types(&self) -> Vec<AtomType> {
        let mut seen = Vec::new();
        for &t in &self.atom_types {
            if !seen.contains(&t) {
                seen.push(t);
            }
        }
        seen
    }

    /// The conformation that reproduces the molecule's input geometry
    pub fn reference_conf(&self) -> Conf {
        Conf::at(self.root_origin, self.num_torsions)
    }

    /// Cartesian coordinates of every atom for `conf`
    pub fn atom_coords(&self, conf: &Conf) -> Result<Vec<Vector3<f64>>, EvaluationError> {
        self.check_torsions(conf.torsions.len())?;
        let (_, coords) = self.place(&conf.position, &conf.orientation, &conf.torsions);
        Ok(coords)
    }

    /// Atoms placed at `conf`, typed like the input molecule
    pub fn atoms_at(&self, conf: &Conf) -> Result<Vec<Atom>, EvaluationError> {
        let coords = self.atom_coords(conf)?;
        Ok(self
            .atom_types
            .iter()
            .zip(coords)
            .map(|(&t, x)| Atom::new(t, x))
            .collect())
    }

    fn check_torsions(&self, actual: usize) -> Result<(), EvaluationError> {
        if actual != self.num_torsions {
            return Err(EvaluationError::TorsionCount {
                expected: self.num_torsions,
                actual,
            });
        }
        Ok(())
    }

    /// Forward kinematics
    fn place(
        &self,
        position: &Vector3<f64>,
        orientation: &UnitQuaternion<f64>,
        torsions: &[f64],
    ) -> (Vec<Frame>, Vec<Vector3<f64>>) {
        let mut frames: Vec<Frame> = Vec::with_capacity(self.segments.len());
        let mut coords = vec![Vector3::zeros(); self.internal.len()];

        for seg in &self.segments {
            let frame = match (seg.parent, seg.torsion) {
                (Some(p), Some(k)) => {
                    let parent = &frames[p];
                    let axis = parent.orientation * seg.relative_axis;
                    Frame {
                        origin: parent.origin + parent.orientation * seg.relative_origin,
                        orientation: UnitQuaternion::from_axis_angle(&axis, torsions[k])
                            * parent.orientation,
                        axis: axis.into_inner(),
                    }
                }
                _ => Frame {
                    origin: *position,
                    orientation: *orientation,
                    axis: Vector3::zeros(),
                },
            };
            for &a in &seg.atoms {
                coords[a] = frame.origin + frame.orientation * self.internal[a];
            }
            frames.push(frame);
        }

        (frames, coords)
    }

    /// Energy and gradient of one atom in the external potentials
    fn atom_term(
        &self,
        ctx: &EvaluationContext<'_>,
        atom: usize,
        x: &Vector3<f64>,
    ) -> Result<(f64, Vector3<f64>), EvaluationError> {
        if !(x.x.is_finite() && x.y.is_finite() && x.z.is_finite()) {
            return Err(EvaluationError::NonFiniteCoordinate(atom));
        }
        let (mut e, mut g) = ctx.field.eval_deriv(self.atom_types[atom], x)?;
        if let Some(grid) = ctx.user_grid {
            let (ge, gg) = grid.eval_clamped(x)?;
            e += ge;
            g += gg;
        }
        e -= ctx.bias.dot(x);
        g -= ctx.bias;
        Ok((e, g))
    }

    /// Energy of one internal pair and the gradient on its second atom
    fn pair_term(
        &self,
        ctx: &EvaluationContext<'_>,
        pair: &(usize, usize),
        coords: &[Vector3<f64>],
    ) -> Result<(f64, Vector3<f64>), EvaluationError> {
        let (i, j) = *pair;
        let r = coords[j] - coords[i];
        let (e, dor) = ctx
            .table
            .eval_deriv(self.atom_types[i], self.atom_types[j], r.norm_squared())?;
        Ok((e, r * dor))
    }

    /// Sum per-atom and per-pair terms in index order
    fn accumulate(
        &self,
        atom_terms: Vec<(f64, Vector3<f64>)>,
        pair_terms: Vec<(f64, Vector3<f64>)>,
    ) -> (f64, Vec<Vector3<f64>>) {
        let mut e = 0.0;
        let mut grads = Vec::with_capacity(atom_terms.len());
        for (ae, ag) in atom_terms {
            e += ae;
            grads.push(ag);
        }
        for (&(i, j), (pe, pg)) in self.pairs.iter().zip(pair_terms) {
            e += pe;
            grads[j] += pg;
            grads[i] -= pg;
        }
        (e, grads)
    }

    /// Fold Cartesian gradients onto the tree, leaves first
    fn reduce(
        &self,
        frames: &[Frame],
        coords: &[Vector3<f64>],
        grads: &[Vector3<f64>],
    ) -> Derivatives {
        let n = self.segments.len();
        let mut force = vec![Vector3::zeros(); n];
        let mut torque = vec![Vector3::zeros(); n];

        for s in 0..n {
            for &a in &self.segments[s].atoms {
                force[s] += grads[a];
                torque[s] += (coords[a] - frames[s].origin).cross(&grads[a]);
            }
        }

        let mut torsions = vec![0.0; self.num_torsions];
        for s in (1..n).rev() {
            let seg = &self.segments[s];
            if let (Some(p), Some(k)) = (seg.parent, seg.torsion) {
                torsions[k] = torque[s].dot(&frames[s].axis);
                let lever = frames[s].origin - frames[p].origin;
                let f = force[s];
                let t = torque[s] + lever.cross(&f);
                force[p] += f;
                torque[p] += t;
            }
        }

        Derivatives {
            position: force[0],
            orientation: torque[0],
            torsions,
        }
    }
}

impl EnergyModel for Model {
    fn num_torsions(&self) -> usize {
        self.num_torsions
    }

    fn eval_deriv(
        &self,
        ctx: &EvaluationContext<'_>,
        conf: &Conf,
        gradient: &mut Change,
    ) -> Result<f64, EvaluationError> {
        self.check_torsions(conf.torsions.len())?;
        self.check_torsions(gradient.torsions.len())?;

        let (frames, coords) = self.place(&conf.position, &conf.orientation, &conf.torsions);
        let atom_terms = coords
            .iter()
            .enumerate()
            .map(|(a, x)| self.atom_term(ctx, a, x))
            .collect::<Result<Vec<_>, _>>()?;
        let pair_terms = self
            .pairs
            .iter()
            .map(|p| self.pair_term(ctx, p, &coords))
            .collect::<Result<Vec<_>, _>>()?;

        let (e, grads) = self.accumulate(atom_terms, pair_terms);
        let d = self.reduce(&frames, &coords, &grads);

        gradient.position = d.position;
        gradient.orientation = d.orientation;
        gradient.torsions.copy_from_slice(&d.torsions);
        Ok(e)
    }

    fn eval_deriv_device(
        &self,
        device: &Device,
        ctx: &EvaluationContext<'_>,
        conf: &DeviceConf,
        gradient: &mut DeviceChange,
    ) -> Result<f64, EvaluationError> {
        self.check_torsions(conf.torsions().len())?;
        self.check_torsions(gradient.as_slice().len() - 6)?;

        let (frames, coords) = self.place(&conf.position(), &conf.orientation(), conf.torsions());

        // Terms are computed in parallel but collected in index order, so the
        // sums below match the host path exactly.
        let (atom_terms, pair_terms) = device.install(|| {
            let atom_terms = coords
                .par_iter()
                .enumerate()
                .map(|(a, x)| self.atom_term(ctx, a, x))
                .collect::<Result<Vec<_>, _>>()?;
            let pair_terms = self
                .pairs
                .par_iter()
                .map(|p| self.pair_term(ctx, p, &coords))
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, EvaluationError>((atom_terms, pair_terms))
        })?;

        let (e, grads) = self.accumulate(atom_terms, pair_terms);
        let d = self.reduce(&frames, &coords, &grads);

        let out = gradient.as_mut_slice();
        out[..3].copy_from_slice(d.position.as_slice());
        out[3..6].copy_from_slice(d.orientation.as_slice());
        out[6..].copy_from_slice(&d.torsions);
        Ok(e)
    }
}
