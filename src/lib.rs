//! RustDock-Refine: quasi-Newton local refinement of docking poses
//!
//! A ligand pose is described in generalized coordinates (root position,
//! root orientation and one angle per rotatable bond) and minimized with a
//! BFGS driver against a Vina-style scoring model. The same minimization can
//! run on the host or on an accelerator device and reaches the same minimum
//! on both.

pub mod atom;
pub mod conf;
pub mod config;
pub mod device;
pub mod field;
pub mod forcefield;
pub mod grid;
pub mod math;
pub mod model;
pub mod molecule;
pub mod optimization;
pub mod precalculate;

// Re-export commonly used types and functions
pub use atom::Atom;
pub use conf::{Change, Conf, ScoredPose};
pub use device::Device;
pub use model::{EnergyModel, EvaluationContext, Model};
pub use molecule::Molecule;
pub use optimization::{Backend, Minimum, QuasiNewton, QuasiNewtonParams};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
