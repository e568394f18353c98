use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::mesh::MeshSettings;
use crate::naca::NacaOptions;
use crate::sketch::SketchFormat;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,

    /// NACA generator settings
    #[serde(default)]
    pub naca: NacaOptions,

    #[serde(default)]
    pub geometry: GeometryConfig,

    #[serde(default)]
    pub sketch: SketchConfig,

    #[serde(default)]
    pub step: StepConfig,

    #[serde(default)]
    pub mesh: MeshSettings,

    #[serde(default)]
    pub flow: FlowConfig,

    /// Batch system configuration
    #[serde(default)]
    pub hpc: HpcConfig,

    #[serde(default)]
    pub post: PostConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_profiles_dir")]
    pub profiles_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeometryConfig {
    #[serde(default = "default_chord_m")]
    pub chord_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SketchConfig {
    #[serde(default = "default_true")]
    pub spline: bool,
    #[serde(default = "default_sketch_formats")]
    pub formats: Vec<SketchFormat>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub organization: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_reynolds")]
    pub reynolds: f64,
    #[serde(default = "default_density")]
    pub density: f64,
    #[serde(default = "default_nu")]
    pub kinematic_viscosity: f64,
    #[serde(default = "default_angles")]
    pub angles_deg: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Slurm,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpcConfig {
    #[serde(default = "default_scheduler")]
    pub scheduler: SchedulerKind,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    /// Submit through `ssh <host>` instead of running sbatch locally
    #[serde(default)]
    pub ssh_host: Option<String>,
    /// Directory holding sbatch/squeue/sacct/scancel when they are not on `PATH`
    #[serde(default)]
    pub slurm_bin_dir: Option<PathBuf>,
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    #[serde(default = "default_ntasks")]
    pub ntasks: u32,
    #[serde(default = "default_time_limit")]
    pub time_limit_minutes: u32,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub modules: Vec<String>,
    /// Command templates; `{case_dir}`, `{mesh}`, `{name}`, `{ntasks}` and `{chord}` are substituted
    #[serde(default = "default_commands")]
    pub commands: Vec<String>,
    #[serde(default = "default_true")]
    pub wait: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_minutes: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostConfig {
    #[serde(default = "default_coefficients_file")]
    pub coefficients_file: PathBuf,
    #[serde(default = "default_averaging_fraction")]
    pub averaging_fraction: f64,
    #[serde(default = "default_convergence_tolerance")]
    pub convergence_tolerance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Write JSON lines to `<logs_dir>/logfile.jsonl`
    #[serde(default = "default_true")]
    pub json_file: bool,
    /// Also write every event, any crate, at debug and above to
    /// `<logs_dir>/complete_logfile.jsonl`
    #[serde(default = "default_true")]
    pub complete_file: bool,
    /// Log files roll over when a write would take them past this size
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_backups")]
    pub backups: u32,
    #[serde(default = "default_complete_backups")]
    pub complete_backups: u32,
}

fn default_true() -> bool {
    true
}

fn default_profiles_dir() -> PathBuf {
    PathBuf::from("profiles")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_chord_m() -> f64 {
    1.0
}

fn default_sketch_formats() -> Vec<SketchFormat> {
    vec![SketchFormat::Dxf, SketchFormat::Svg]
}

fn default_reynolds() -> f64 {
    1.0e6
}

fn default_density() -> f64 {
    1.225
}

fn default_nu() -> f64 {
    1.5e-5
}

fn default_angles() -> Vec<f64> {
    vec![0.0]
}

fn default_scheduler() -> SchedulerKind {
    SchedulerKind::Slurm
}

fn default_nodes() -> u32 {
    1
}

fn default_ntasks() -> u32 {
    4
}

fn default_time_limit() -> u32 {
    60
}

fn default_commands() -> Vec<String> {
    vec![
        "gmshToFoam {mesh}".to_string(),
        "transformPoints -scale '({chord} {chord} {chord})'".to_string(),
        "decomposePar -force".to_string(),
        "mpirun -np {ntasks} simpleFoam -parallel".to_string(),
        "reconstructPar -latestTime".to_string(),
    ]
}

fn default_poll_interval() -> u64 {
    30
}

fn default_timeout() -> u64 {
    1440
}

fn default_max_concurrent() -> usize {
    4
}

fn default_coefficients_file() -> PathBuf {
    PathBuf::from("postProcessing/forceCoeffs/0/coefficient.dat")
}

fn default_averaging_fraction() -> f64 {
    0.2
}

fn default_convergence_tolerance() -> f64 {
    0.01
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_bytes() -> u64 {
    1_000_000_000
}

fn default_backups() -> u32 {
    5
}

fn default_complete_backups() -> u32 {
    1
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            profiles_dir: default_profiles_dir(),
            output_dir: default_output_dir(),
            logs_dir: default_logs_dir(),
        }
    }
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            chord_m: default_chord_m(),
        }
    }
}

impl Default for SketchConfig {
    fn default() -> Self {
        Self {
            spline: true,
            formats: default_sketch_formats(),
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            reynolds: default_reynolds(),
            density: default_density(),
            kinematic_viscosity: default_nu(),
            angles_deg: default_angles(),
        }
    }
}

impl Default for HpcConfig {
    fn default() -> Self {
        Self {
            scheduler: default_scheduler(),
            partition: None,
            account: None,
            ssh_host: None,
            slurm_bin_dir: None,
            nodes: default_nodes(),
            ntasks: default_ntasks(),
            time_limit_minutes: default_time_limit(),
            memory: None,
            modules: Vec::new(),
            commands: default_commands(),
            wait: true,
            poll_interval_secs: default_poll_interval(),
            timeout_minutes: default_timeout(),
            max_concurrent_jobs: default_max_concurrent(),
        }
    }
}

impl Default for PostConfig {
    fn default() -> Self {
        Self {
            coefficients_file: default_coefficients_file(),
            averaging_fraction: default_averaging_fraction(),
            convergence_tolerance: default_convergence_tolerance(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_file: true,
            complete_file: true,
            max_bytes: default_max_bytes(),
            backups: default_backups(),
            complete_backups: default_complete_backups(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), scheduler = ?config.hpc.scheduler, "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let chord = self.geometry.chord_m;
        if !chord.is_finite() || chord <= 0.0 {
            return Err(ConfigError::Invalid("geometry.chord_m must be positive".into()));
        }
        if self.flow.angles_deg.is_empty() {
            return Err(ConfigError::Invalid("flow.angles_deg is empty".into()));
        }
        if let Some(a) = self.flow.angles_deg.iter().find(|a| a.abs() >= 90.0) {
            return Err(ConfigError::Invalid(format!(
                "flow.angles_deg contains {} (must be within +-90)",
                a
            )));
        }
        if self.hpc.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid("hpc.max_concurrent_jobs must be >= 1".into()));
        }
        if self.hpc.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("hpc.poll_interval_secs must be >= 1".into()));
        }
        let fraction = self.post.averaging_fraction;
        if fraction.is_nan() || fraction <= 0.0 || fraction > 1.0 {
            return Err(ConfigError::Invalid(
                "post.averaging_fraction must be in (0, 1]".into(),
            ));
        }
        if self.logging.max_bytes == 0 {
            return Err(ConfigError::Invalid("logging.max_bytes must be >= 1".into()));
        }
        self.mesh
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.paths.output_dir, PathBuf::from("runs"));
        assert_eq!(config.hpc.scheduler, SchedulerKind::Slurm);
        assert_eq!(config.naca.points_per_surface, 100);
        assert_eq!(config.mesh.farfield_radius_chords, 20.0);
        assert_eq!(config.logging.backups, 5);
        assert!(config.logging.complete_file);
        assert_eq!(config.logging.complete_backups, 1);
    }

    #[test]
    fn test_partial_sections() {
        let toml = r#"
[flow]
reynolds = 3.0e6
angles_deg = [-2.0, 0.0, 2.0, 4.0]

[hpc]
scheduler = "local"
ntasks = 16
modules = ["openfoam/11"]

[sketch]
formats = ["dxf", "fcmacro"]

[mesh.boundary_layer]
first_height = 1e-5
growth_ratio = 1.15
thickness = 0.02
"#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.flow.reynolds, 3.0e6);
        assert_eq!(config.flow.density, 1.225);
        assert_eq!(config.flow.angles_deg.len(), 4);
        assert_eq!(config.hpc.scheduler, SchedulerKind::Local);
        assert_eq!(config.hpc.ntasks, 16);
        assert_eq!(config.hpc.time_limit_minutes, 60);
        assert_eq!(
            config.sketch.formats,
            vec![SketchFormat::Dxf, SketchFormat::FreeCad]
        );
        assert!(config.mesh.boundary_layer.is_some());
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            Config::from_toml_str("[flow]\nangles_deg = []\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[flow]\nangles_deg = [95.0]\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[hpc]\nmax_concurrent_jobs = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[hpc]\nscheduler = \"pbs\"\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[logging]\nmax_bytes = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_toml_round_trip_via_file() {
        let mut config = Config::default();
        config.hpc.partition = Some("gpu".to_string());
        let text = config.to_toml_string().unwrap();

        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), text).unwrap();
        let loaded = Config::from_file(file.path()).unwrap();
        assert_eq!(loaded.hpc.partition.as_deref(), Some("gpu"));
        assert_eq!(loaded.hpc.commands, config.hpc.commands);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_file("/nonexistent/airfoil.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
