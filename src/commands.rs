use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Config, ConfigError, HpcConfig, SchedulerKind};
use crate::convert::{convert_directory, ConvertOptions};
use crate::fetch::{AirfoilDatabase, DEFAULT_DATABASE_URL};
use crate::hpc::{LocalScheduler, Scheduler, SlurmScheduler};
use crate::mesh::{write_geo, GmshMesher, MeshSettings};
use crate::naca::{generate, NacaDesignation};
use crate::pipeline::Pipeline;
use crate::post::{summarize, CoefficientHistory};
use crate::profile::Profile;
use crate::sketch::{Sketch, SketchFormat, SketchOptions};
use crate::step::{write_step, StepOptions};

/// Command handler result
pub type CommandResult = Result<Value, Box<dyn std::error::Error>>;

/// Config from `--config` (or defaults) with the `--log-level` override
/// applied. Runs before logging exists, so it must not rely on being logged.
pub fn load_config(path: Option<&Path>, log_level: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(level) = log_level {
        config.logging.level = level.to_string();
    }
    Ok(config)
}

/// A coordinate file path, or a NACA designation such as `2412` / `NACA 23012`.
pub fn load_profile(config: &Config, source: &str) -> Result<Profile, Box<dyn std::error::Error>> {
    let path = Path::new(source);
    if path.is_file() {
        return Ok(Profile::from_file(path)?);
    }
    match NacaDesignation::parse(source) {
        Ok(designation) => Ok(generate(&designation, &config.naca)?),
        Err(e) => Err(format!("'{}' is neither a coordinate file nor a NACA designation ({})", source, e).into()),
    }
}

pub fn make_scheduler(hpc: &HpcConfig) -> Arc<dyn Scheduler> {
    match hpc.scheduler {
        SchedulerKind::Slurm => Arc::new(
            SlurmScheduler::new(hpc.ssh_host.clone()).with_bin_dir(hpc.slurm_bin_dir.clone()),
        ),
        SchedulerKind::Local => Arc::new(LocalScheduler::new()),
    }
}

pub fn handle_naca(
    config: &Config,
    designation: &str,
    points: Option<usize>,
    output: Option<PathBuf>,
) -> CommandResult {
    let designation = NacaDesignation::parse(designation)?;
    let mut opts = config.naca.clone();
    if let Some(n) = points {
        opts.points_per_surface = n;
    }
    let profile = generate(&designation, &opts)?;
    let path = output.unwrap_or_else(|| {
        config
            .paths
            .profiles_dir
            .join(format!("{}.csv", profile.slug()))
    });
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    profile.write_csv(&path)?;
    let (thickness, at) = profile.max_thickness();
    Ok(json!({
        "name": profile.name,
        "points": profile.points.len(),
        "max_thickness": thickness,
        "max_thickness_x": at,
        "file": path,
    }))
}

pub fn handle_convert(
    config: &Config,
    dir: Option<PathBuf>,
    output: Option<PathBuf>,
    sketch_formats: Vec<SketchFormat>,
) -> CommandResult {
    let dir = dir.unwrap_or_else(|| config.paths.profiles_dir.clone());
    let opts = ConvertOptions {
        output_dir: output,
        sketch_formats,
        sketch: SketchOptions {
            chord_mm: config.geometry.chord_m * 1000.0,
            aoa_deg: 0.0,
            spline: config.sketch.spline,
        },
    };
    let report = convert_directory(&dir, &opts)?;
    let converted: Vec<Value> = report
        .converted
        .iter()
        .map(|c| json!({ "source": c.source, "csv": c.csv, "sketches": c.sketches, "points": c.points }))
        .collect();
    let failures: Vec<Value> = report
        .failures
        .iter()
        .map(|(path, error)| json!({ "source": path, "error": error }))
        .collect();
    Ok(json!({ "converted": converted, "failures": failures }))
}

pub fn handle_sketch(
    config: &Config,
    source: &str,
    formats: Vec<SketchFormat>,
    aoa_deg: f64,
    output: Option<PathBuf>,
) -> CommandResult {
    let profile = load_profile(config, source)?;
    let formats = if formats.is_empty() {
        config.sketch.formats.clone()
    } else {
        formats
    };
    let sketch = Sketch::from_profile(
        &profile,
        &SketchOptions {
            chord_mm: config.geometry.chord_m * 1000.0,
            aoa_deg,
            spline: config.sketch.spline,
        },
    );
    let dir = output.unwrap_or_else(|| config.paths.output_dir.join(profile.slug()).join("cad"));
    let files = sketch.write(&dir, &formats)?;
    Ok(json!({ "name": profile.name, "files": files }))
}

pub fn handle_step(
    config: &Config,
    source: &str,
    aoa_deg: f64,
    span_mm: Option<f64>,
    output: Option<PathBuf>,
) -> CommandResult {
    let profile = load_profile(config, source)?;
    let chord_mm = config.geometry.chord_m * 1000.0;
    let opts = StepOptions {
        chord_mm,
        span_mm: span_mm.unwrap_or(config.mesh.extrude_thickness * chord_mm),
        aoa_deg,
        author: config.step.author.clone(),
        organization: config.step.organization.clone(),
    };
    let path = output.unwrap_or_else(|| {
        config
            .paths
            .output_dir
            .join(profile.slug())
            .join("cad")
            .join(format!("{}.step", profile.slug()))
    });
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_step(&path, &profile, &opts)?;
    Ok(json!({ "name": profile.name, "file": path, "span_mm": opts.span_mm }))
}

pub async fn handle_mesh(
    config: &Config,
    source: &str,
    output: Option<PathBuf>,
    run_gmsh: bool,
) -> CommandResult {
    let profile = load_profile(config, source)?;
    let settings: MeshSettings = config.mesh.clone();
    let dir = output.unwrap_or_else(|| config.paths.output_dir.join(profile.slug()).join("mesh"));
    std::fs::create_dir_all(&dir)?;
    let geo = dir.join(format!("{}.geo", profile.slug()));
    std::fs::write(&geo, write_geo(&profile, &settings)?)?;
    info!(geo = %geo.display(), "gmsh script written");

    if run_gmsh || settings.run_gmsh {
        let msh = geo.with_extension("msh");
        let report = GmshMesher::new(&settings).run(&geo, &msh).await?;
        return Ok(json!({ "geo": geo, "mesh": report }));
    }
    Ok(json!({ "geo": geo }))
}

pub async fn handle_submit(config: &Config, script: &Path) -> CommandResult {
    let scheduler = make_scheduler(&config.hpc);
    let job_id = scheduler.submit(script).await?;
    Ok(json!({ "job_id": job_id, "scheduler": scheduler.name() }))
}

pub async fn handle_status(config: &Config, job_id: &str) -> CommandResult {
    let scheduler = make_scheduler(&config.hpc);
    if config.hpc.scheduler == SchedulerKind::Local {
        warn!("local jobs are only tracked by the process that started them");
    }
    let state = scheduler.status(job_id).await?;
    Ok(json!({
        "job_id": job_id,
        "state": state.to_string(),
        "terminal": state.is_terminal(),
    }))
}

pub async fn handle_cancel(config: &Config, job_id: &str) -> CommandResult {
    let scheduler = make_scheduler(&config.hpc);
    scheduler.cancel(job_id).await?;
    Ok(json!({ "job_id": job_id, "cancelled": true }))
}

pub fn handle_post(
    config: &Config,
    file: &Path,
    averaging_fraction: Option<f64>,
    tolerance: Option<f64>,
) -> CommandResult {
    let history = CoefficientHistory::from_file(file)?;
    let summary = summarize(
        &history,
        averaging_fraction.unwrap_or(config.post.averaging_fraction),
        tolerance.unwrap_or(config.post.convergence_tolerance),
    )?;
    Ok(serde_json::to_value(&summary)?)
}

pub async fn handle_run(config: &Config, source: &str, aoa_deg: f64, force: bool) -> CommandResult {
    let profile = load_profile(config, source)?;
    let pipeline = Pipeline::new(config.clone(), make_scheduler(&config.hpc)).with_force(force);
    let result = pipeline.run_case(&profile, aoa_deg).await?;
    Ok(serde_json::to_value(&result)?)
}

pub async fn handle_sweep(
    config: &Config,
    source: &str,
    angles: Option<Vec<f64>>,
    force: bool,
) -> CommandResult {
    let profile = load_profile(config, source)?;
    let angles = angles.unwrap_or_else(|| config.flow.angles_deg.clone());
    let pipeline = Pipeline::new(config.clone(), make_scheduler(&config.hpc)).with_force(force);
    let report = pipeline.sweep(&profile, &angles).await?;
    Ok(json!({
        "profile": report.profile,
        "dir": report.dir,
        "polar": report.polar.points,
        "failures": report.failures,
        "metrics": report.metrics,
        "success_rate": report.metrics.success_rate(),
    }))
}

pub async fn handle_fetch(
    config: &Config,
    name: &str,
    base_url: Option<String>,
    output: Option<PathBuf>,
) -> CommandResult {
    let db = AirfoilDatabase::new(base_url.unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()))?;
    let profile = db.fetch(name).await?;
    let path = output.unwrap_or_else(|| {
        config
            .paths
            .profiles_dir
            .join(format!("{}.csv", name.to_ascii_lowercase()))
    });
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    profile.write_csv(&path)?;
    Ok(json!({ "name": profile.name, "points": profile.points.len(), "file": path }))
}

pub fn handle_init_config(path: &Path, overwrite: bool) -> CommandResult {
    if path.exists() && !overwrite {
        return Err(format!("{} already exists (use --force to overwrite)", path.display()).into());
    }
    std::fs::write(path, Config::default().to_toml_string()?)?;
    Ok(json!({ "file": path }))
}
