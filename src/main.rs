use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

use airfoil_cfd::commands::{self, CommandResult};
use airfoil_cfd::config::Config;
use airfoil_cfd::logging;
use airfoil_cfd::sketch::SketchFormat;

/// Airfoil CFD pipeline - profiles, CAD export, meshing, HPC runs and polars
#[derive(Parser, Debug)]
#[command(name = "airfoil-cfd", version, about)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level for this crate (RUST_LOG overrides)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a NACA 4- or 5-digit section as CSV
    Naca {
        designation: String,
        /// Points per surface
        #[arg(short, long)]
        points: Option<usize>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Convert every .txt/.dat coordinate file in a directory to CSV
    Convert {
        /// Defaults to paths.profiles_dir
        dir: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also write sketches (dxf, svg, fcmacro)
        #[arg(long, value_delimiter = ',')]
        sketch: Vec<SketchFormat>,
    },
    /// Write 2D sketches of a profile
    Sketch {
        /// Coordinate file or NACA designation
        profile: String,
        #[arg(short, long, value_delimiter = ',')]
        formats: Vec<SketchFormat>,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        aoa: f64,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Export an extruded section as STEP
    Step {
        profile: String,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        aoa: f64,
        #[arg(long)]
        span_mm: Option<f64>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write the Gmsh script, optionally running gmsh
    Mesh {
        profile: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        run: bool,
    },
    /// Submit a job script to the configured scheduler
    Submit { script: PathBuf },
    /// Query a job
    Status { job_id: String },
    /// Cancel a job
    Cancel { job_id: String },
    /// Average a coefficient history
    Post {
        file: PathBuf,
        #[arg(long)]
        fraction: Option<f64>,
        #[arg(long)]
        tolerance: Option<f64>,
    },
    /// Run one case end to end
    Run {
        profile: String,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        aoa: f64,
        /// Ignore the run ledger and redo every stage
        #[arg(long)]
        force: bool,
    },
    /// Run a polar sweep
    Sweep {
        profile: String,
        /// Comma separated angles; defaults to flow.angles_deg
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        angles: Option<Vec<f64>>,
        #[arg(long)]
        force: bool,
    },
    /// Download coordinates from the UIUC database
    Fetch {
        name: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write a default configuration file
    InitConfig {
        #[arg(default_value = "airfoil-cfd.toml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

async fn dispatch(config: &Config, command: Command) -> CommandResult {
    match command {
        Command::Naca {
            designation,
            points,
            output,
        } => commands::handle_naca(config, &designation, points, output),
        Command::Convert {
            dir,
            output,
            sketch,
        } => commands::handle_convert(config, dir, output, sketch),
        Command::Sketch {
            profile,
            formats,
            aoa,
            output,
        } => commands::handle_sketch(config, &profile, formats, aoa, output),
        Command::Step {
            profile,
            aoa,
            span_mm,
            output,
        } => commands::handle_step(config, &profile, aoa, span_mm, output),
        Command::Mesh {
            profile,
            output,
            run,
        } => commands::handle_mesh(config, &profile, output, run).await,
        Command::Submit { script } => commands::handle_submit(config, &script).await,
        Command::Status { job_id } => commands::handle_status(config, &job_id).await,
        Command::Cancel { job_id } => commands::handle_cancel(config, &job_id).await,
        Command::Post {
            file,
            fraction,
            tolerance,
        } => commands::handle_post(config, &file, fraction, tolerance),
        Command::Run {
            profile,
            aoa,
            force,
        } => commands::handle_run(config, &profile, aoa, force).await,
        Command::Sweep {
            profile,
            angles,
            force,
        } => commands::handle_sweep(config, &profile, angles, force).await,
        Command::Fetch { name, url, output } => {
            commands::handle_fetch(config, &name, url, output).await
        }
        Command::InitConfig { path, force } => commands::handle_init_config(&path, force),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = commands::load_config(args.config.as_deref(), args.log_level.as_deref())?;
    logging::init(&config.logging, &config.paths.logs_dir);

    match &args.config {
        Some(path) => info!(
            path = %path.display(),
            scheduler = ?config.hpc.scheduler,
            "configuration loaded"
        ),
        None => info!("no configuration file, using defaults"),
    }
    info!(
        command = ?args.command,
        logs_dir = %config.paths.logs_dir.display(),
        "airfoil-cfd starting"
    );

    match dispatch(&config, args.command).await {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "command failed");
            Err(e)
        }
    }
}
