//! Main executable for rustdock-refine

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use rustdock_refine::atom::Atom;
use rustdock_refine::conf::{Change, Conf, ScoredPose};
use rustdock_refine::config::JobConfig;
use rustdock_refine::device::Device;
use rustdock_refine::field::{FieldPotential, GridCache, NonCache, DEFAULT_SLOPE};
use rustdock_refine::forcefield::vina::{VinaForceField, VinaParams};
use rustdock_refine::model::{EvaluationContext, Model};
use rustdock_refine::optimization::{Backend, Minimum, QuasiNewton};
use rustdock_refine::precalculate::InteractionTable;

/// Interaction table samples per squared Angstrom
const TABLE_FACTOR: f64 = 32.0;

/// Command-line arguments for the application
#[derive(Parser, Debug)]
#[clap(
    name = "refine",
    version = rustdock_refine::VERSION,
    about = "Quasi-Newton local refinement of a docking pose"
)]
struct Cli {
    /// JSON job file (ligand, receptor atoms, search box, parameters)
    #[clap(long, value_parser)]
    job: PathBuf,

    /// Run the minimization on the accelerator device
    #[clap(long)]
    device: bool,

    /// Device worker threads (defaults to the number of CPUs)
    #[clap(long)]
    threads: Option<usize>,

    /// Seed for the random starting pose when the job has none
    #[clap(long)]
    seed: Option<u64>,

    /// Output file for the refined pose (stdout when omitted)
    #[clap(long, short, value_parser)]
    out: Option<PathBuf>,
}

#[derive(Serialize)]
struct RefineOutput {
    pose: ScoredPose,
    atoms: Vec<Atom>,
    stats: Minimum,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    let job = JobConfig::from_path(&cli.job)
        .with_context(|| format!("Failed to load job file: {}", cli.job.display()))?;

    let forcefield = VinaForceField::with_params(VinaParams {
        cutoff: job.cutoff,
        ..VinaParams::default()
    });
    let table = InteractionTable::new(&forcefield, TABLE_FACTOR)
        .context("Failed to build interaction table")?;

    let model = Model::from_molecule(&job.ligand)
        .with_context(|| format!("Invalid ligand topology: {}", job.ligand.name))?;
    info!(
        "Ligand {}: {} atoms, {} torsions, {} internal pairs",
        job.ligand.name,
        model.num_atoms(),
        job.ligand.torsions.len(),
        model.num_pairs()
    );

    let corner1 = job.search_box.corner1();
    let corner2 = job.search_box.corner2();
    let field: Box<dyn FieldPotential + '_> = if job.use_grid_cache {
        let dims = GridCache::dimensions_for(&job.search_box.size.to_vector3(), job.grid_spacing);
        info!("Precomputing receptor grids ({} x {} x {})", dims.x, dims.y, dims.z);
        Box::new(
            GridCache::new(
                &table,
                &job.receptor,
                &model.atom_types(),
                corner1,
                job.grid_spacing,
                dims,
                DEFAULT_SLOPE,
            )
            .context("Failed to precompute receptor grids")?,
        )
    } else {
        Box::new(
            NonCache::new(&table, &job.receptor, corner1, corner2, DEFAULT_SLOPE)
                .context("Invalid search box")?,
        )
    };

    let ctx = EvaluationContext::new(&table, field.as_ref()).with_bias(job.bias.into());

    let initial = match &job.initial {
        Some(conf) => conf.clone(),
        None => {
            let mut rng = match cli.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let conf = Conf::randomize(&mut rng, &corner1, &corner2, job.ligand.torsions.len());
            debug!("Random starting pose: {:?}", conf);
            conf
        }
    };

    let mut optimizer = QuasiNewton::with_params(job.params.clone());
    if cli.device {
        let threads = cli.threads.unwrap_or_else(rayon::current_num_threads);
        let device = Device::new(threads).context("Failed to acquire accelerator device")?;
        optimizer = optimizer.with_device(Arc::new(device));
    }

    let mut pose = ScoredPose::new(initial);
    let mut gradient = Change::for_conf(&pose.conf);
    let stats = optimizer
        .minimize(
            &model,
            &ctx,
            &mut pose,
            &mut gradient,
            Backend::from(cli.device),
        )
        .context("Minimization failed")?;

    info!(
        "Refined energy {:.4} after {} steps ({:?})",
        stats.energy, stats.iterations, stats.termination
    );

    let atoms = model.atoms_at(&pose.conf)?;
    let output = RefineOutput { pose, atoms, stats };
    let json = serde_json::to_string_pretty(&output)?;

    match &cli.out {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write results to {}", path.display()))?;
            info!("Wrote refined pose to {}", path.display());
        }
        None => println!("{}", json),
    }

    Ok(())
}
