//! huaca CLI - archaeological site probability pipeline

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Instant;

use huaca::config::PipelineConfig;
use huaca::pipeline::Pipeline;
use huaca::types::VarType;

#[derive(Parser)]
#[command(name = "huaca")]
#[command(author, version, about = "Terrain, alignment and sampling pipeline for site prediction", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults are used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the processed raster directory
    #[arg(long, global = true)]
    raster_dir: Option<PathBuf>,

    /// Override the raw tile directory
    #[arg(long, global = true)]
    tile_dir: Option<PathBuf>,

    /// Override the raw vector directory
    #[arg(long, global = true)]
    vector_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum VarTypeArg {
    Continuous,
    Categorical,
    Distance,
}

impl From<VarTypeArg> for VarType {
    fn from(v: VarTypeArg) -> Self {
        match v {
            VarTypeArg::Continuous => VarType::Continuous,
            VarTypeArg::Categorical => VarType::Categorical,
            VarTypeArg::Distance => VarType::Distance,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Extract and mosaic elevation tiles into dem.tif
    Assemble,
    /// Compute terrain derivatives of dem.tif
    Derive {
        /// Recompute outputs that already exist
        #[arg(short, long)]
        force: bool,
    },
    /// Compute distance rasters from the configured vector sources
    Distance {
        #[arg(short, long)]
        force: bool,
    },
    /// Resample an external raster onto the dem.tif grid
    Align {
        /// Input raster
        input: PathBuf,
        /// Layer name; registered layers are written to their registry file,
        /// others to <name>.tif in the raster directory
        #[arg(short, long)]
        name: String,
        /// Variable type; selects bilinear or nearest resampling
        #[arg(short = 't', long, value_enum, default_value = "continuous")]
        var_type: VarTypeArg,
    },
    /// Verify that every registry layer is aligned with dem.tif
    Check {
        /// Registry version (v1, v2); all layers when omitted
        #[arg(long)]
        version: Option<String>,
    },
    /// Sample presence/absence points into a training table
    Sample {
        /// Presence sites (points or polygons)
        presence: PathBuf,
        #[arg(long)]
        version: Option<String>,
    },
    /// Train the configured classifier on a training table
    Train {
        /// Training table CSV
        table: PathBuf,
        /// Model output (defaults to <models_dir>/<kind>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Predict a probability raster with a trained model
    Predict {
        /// Trained model JSON
        model: PathBuf,
        /// Output GeoTIFF
        output: PathBuf,
    },
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &cli.raster_dir {
        config.raster_dir = dir.clone();
    }
    if let Some(dir) = &cli.tile_dir {
        config.tile_dir = dir.clone();
    }
    if let Some(dir) = &cli.vector_dir {
        config.vector_dir = dir.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let pipeline = Pipeline::new(load_config(&cli)?).context("Invalid configuration")?;
    let start = Instant::now();

    match cli.command {
        Commands::Assemble => {
            let path = pipeline.assemble().context("Tile assembly failed")?;
            println!("Mosaic: {}", path.display());
        }
        Commands::Derive { force } => {
            let written = pipeline.derive(force).context("Derivative computation failed")?;
            for path in written {
                println!("{}", path.display());
            }
        }
        Commands::Distance { force } => {
            let written = pipeline.distances(force).context("Distance computation failed")?;
            for path in written {
                println!("{}", path.display());
            }
        }
        Commands::Align { input, name, var_type } => {
            let path = pipeline
                .align(&input, &name, var_type.into())
                .with_context(|| format!("Failed to align {}", input.display()))?;
            println!("Aligned: {}", path.display());
        }
        Commands::Check { version } => {
            let report = pipeline.check(version.as_deref()).context("Alignment check failed")?;
            if report.is_empty() {
                bail!("No layers registered for version {:?}", version);
            }
            for layer in report {
                println!("OK  {:<28} {}x{}  {}", layer.name, layer.width, layer.height, layer.path.display());
            }
        }
        Commands::Sample { presence, version } => {
            let path = pipeline
                .sample(&presence, version.as_deref())
                .context("Sampling failed")?;
            println!("Training table: {}", path.display());
        }
        Commands::Train { table, output } => {
            let path = pipeline
                .train(&table, output.as_deref())
                .with_context(|| format!("Training on {} failed", table.display()))?;
            println!("Model: {}", path.display());
        }
        Commands::Predict { model, output } => {
            let map = pipeline
                .predict(&model, &output)
                .with_context(|| format!("Prediction with {} failed", model.display()))?;
            println!("Probability map: {} ({} valid cells)", output.display(), map.valid_count());
        }
    }

    log::info!("Done in {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}
