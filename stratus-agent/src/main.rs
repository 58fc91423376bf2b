//! stratus-agent: operator tool for the stratus reconciliation engine.
//!
//! - `validate` runs the mutator pipeline over a control plane manifest and
//!   prints the resource documents the engine would write
//! - `simulate` drives the full engine against in-memory clouds, honoring
//!   requeue results and persisting status between ticks

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod agent;

use agent::{CatalogEntry, Simulation, SimulationOptions};
use stratus_engine::api::Manifest;
use stratus_engine::mutators::{apply_mutators, default_mutators, MutationContext};
use stratus_engine::{AuditLogger, EngineConfig};

/// stratus control plane agent
#[derive(Parser, Debug)]
#[command(name = "stratus-agent", version, about)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply engine defaults to a manifest's resources and print them
    Validate {
        /// Control plane manifest (YAML)
        #[arg(short, long)]
        manifest: PathBuf,
    },

    /// Reconcile a manifest against a simulated cloud
    Simulate {
        /// Control plane manifest (YAML)
        #[arg(short, long)]
        manifest: PathBuf,

        /// Engine configuration (YAML); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write the control plane document here after every tick
        #[arg(short, long)]
        status: Option<PathBuf>,

        /// Maximum reconcile ticks per phase
        #[arg(long, default_value = "50")]
        ticks: u32,

        /// Polls before a simulated operation completes
        #[arg(long, default_value = "2")]
        latency_polls: u32,

        /// Multiplier for requeue delays (0 runs without sleeping)
        #[arg(long, default_value = "0")]
        time_scale: f64,

        /// Delete all resources once the control plane is ready
        #[arg(long)]
        delete: bool,

        /// YAML list of images published in the simulated marketplace
        #[arg(long)]
        images: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratus_engine=info,stratus_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Validate { manifest } => validate(&manifest).await,
        Commands::Simulate {
            manifest,
            config,
            status,
            ticks,
            latency_polls,
            time_scale,
            delete,
            images,
        } => {
            let config = match config {
                Some(path) => EngineConfig::load(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => EngineConfig::default(),
            };
            let manifest = load_manifest(&manifest).await?;
            let print_status = status.is_none();
            let images = match images {
                Some(path) => load_catalog(&path).await?,
                None => Vec::new(),
            };

            let mut simulation = Simulation::new(
                &manifest,
                &config,
                SimulationOptions {
                    ticks,
                    latency_polls,
                    time_scale,
                    delete,
                    status_path: status,
                    images,
                },
            )?;
            let result = simulation.run().await;
            if print_status {
                print!("{}", simulation.document());
            }
            result
        }
    }
}

async fn load_manifest(path: &Path) -> Result<Manifest> {
    let yaml = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    Manifest::from_yaml(&yaml).with_context(|| format!("Failed to parse manifest {}", path.display()))
}

async fn load_catalog(path: &Path) -> Result<Vec<CatalogEntry>> {
    let yaml = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read image catalog {}", path.display()))?;
    CatalogEntry::from_yaml(&yaml)
}

async fn validate(path: &Path) -> Result<()> {
    let manifest = load_manifest(path).await?;
    let audit = AuditLogger::tracing();
    let ctx = MutationContext {
        cluster: &manifest.cluster,
        control_plane: &manifest.control_plane,
        audit: &audit,
    };

    let resources = apply_mutators(&ctx, &manifest.control_plane.spec.resources, &default_mutators())
        .context("Manifest is not valid")?;
    info!(resources = resources.len(), "Manifest is valid");

    print!("{}", serde_yaml::to_string(&resources).context("Failed to render resources")?);
    Ok(())
}
