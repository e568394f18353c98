//! Per-case orchestration: profile to job script, submission, post-processing
//! and concurrent polar sweeps.
//!
//! Every case directory carries a `ledger.json`; stages it lists as completed
//! are skipped on the next run unless the pipeline is forced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::case::{CaseError, FlowConditions};
use crate::config::Config;
use crate::hpc::{
    expand_template, render_slurm_script, wait_for_completion, HpcError, JobSpec, JobState,
    Scheduler,
};
use crate::mesh::{write_geo, GmshMesher, MeshError};
use crate::metrics::RunMetrics;
use crate::post::{summarize, CoefficientHistory, CoefficientSummary, Polar, PolarPoint, PostError};
use crate::profile::{Profile, ProfileError};
use crate::sketch::{Sketch, SketchOptions};
use crate::step::{write_step, StepError, StepOptions};

pub const LEDGER_FILE: &str = "ledger.json";
pub const JOB_SCRIPT: &str = "job.sh";
pub const CASE_SUMMARY_FILE: &str = "summary.json";
pub const POLAR_FILE: &str = "polar.csv";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    Step(#[from] StepError),
    #[error(transparent)]
    Mesh(#[from] MeshError),
    #[error(transparent)]
    Case(#[from] CaseError),
    #[error(transparent)]
    Hpc(#[from] HpcError),
    #[error(transparent)]
    Post(#[from] PostError),
    #[error("corrupt ledger {path}: {source}")]
    Ledger {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("job {id} ended in state {state}")]
    JobFailed { id: String, state: JobState },
    #[error("sweep has no angles")]
    NoAngles,
    #[error("angle {0} appears more than once in the sweep")]
    DuplicateAngle(f64),
    #[error("concurrency limiter closed: {0}")]
    Limiter(#[from] tokio::sync::AcquireError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Profile,
    Sketch,
    Step,
    Mesh,
    Case,
    Script,
    Submit,
    Wait,
    Post,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Profile => "profile",
            Stage::Sketch => "sketch",
            Stage::Step => "step",
            Stage::Mesh => "mesh",
            Stage::Case => "case",
            Stage::Script => "script",
            Stage::Submit => "submit",
            Stage::Wait => "wait",
            Stage::Post => "post",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: Stage,
    pub status: StageStatus,
    pub payload: Value,
}

/// Append-only record of stage outcomes for one case directory
pub struct RunLedger {
    path: PathBuf,
    entries: Vec<LedgerEntry>,
}

impl RunLedger {
    pub fn open(dir: &Path) -> Result<Self, PipelineError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LEDGER_FILE);
        let entries = if path.exists() {
            let data = fs::read_to_string(&path)?;
            serde_json::from_str(&data).map_err(|source| PipelineError::Ledger {
                path: path.clone(),
                source,
            })?
        } else {
            Vec::new()
        };
        Ok(Self { path, entries })
    }

    pub fn record(
        &mut self,
        stage: Stage,
        status: StageStatus,
        payload: Value,
    ) -> Result<(), PipelineError> {
        self.entries.push(LedgerEntry {
            timestamp: Utc::now(),
            stage,
            status,
            payload,
        });
        self.persist()
    }

    fn last(&self, stage: Stage) -> Option<&LedgerEntry> {
        self.entries.iter().rev().find(|e| e.stage == stage)
    }

    /// True when the latest entry for `stage` is a completion.
    pub fn is_complete(&self, stage: Stage) -> bool {
        self.last(stage)
            .map_or(false, |e| e.status == StageStatus::Completed)
    }

    /// Payload of the latest entry for `stage`, if that entry is a completion.
    pub fn payload(&self, stage: Stage) -> Option<&Value> {
        self.last(stage)
            .filter(|e| e.status == StageStatus::Completed)
            .map(|e| &e.payload)
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), PipelineError> {
        let data = serde_json::to_string_pretty(&self.entries)?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}

/// `aoa_+04.00`, `aoa_-12.50`; negative zero prints as `+00.00`. Angles
/// that two decimals cannot represent keep every digit (`aoa_+1.004`), so
/// distinct angles never share a case directory.
pub fn case_dir_name(aoa_deg: f64) -> String {
    let aoa = if aoa_deg == 0.0 { 0.0 } else { aoa_deg };
    let short = format!("{:+06.2}", aoa);
    if short.parse::<f64>().ok() == Some(aoa) {
        format!("aoa_{}", short)
    } else {
        format!("aoa_{:+}", aoa)
    }
}

/// Files produced for a case up to (and including) its job script.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedCase {
    pub dir: PathBuf,
    pub aoa_deg: f64,
    pub geo: PathBuf,
    pub msh: PathBuf,
    pub script: PathBuf,
    pub metrics: RunMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub dir: PathBuf,
    pub aoa_deg: f64,
    pub job_id: Option<String>,
    pub state: Option<JobState>,
    /// `None` when the pipeline does not wait for the job.
    pub summary: Option<CoefficientSummary>,
    pub metrics: RunMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseFailure {
    pub aoa_deg: Option<f64>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub profile: String,
    pub reynolds: f64,
    pub dir: PathBuf,
    pub polar: Polar,
    pub cases: Vec<CaseResult>,
    pub failures: Vec<CaseFailure>,
    pub metrics: RunMetrics,
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    scheduler: Arc<dyn Scheduler>,
    force: bool,
}

impl Pipeline {
    pub fn new(config: Config, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            config: Arc::new(config),
            scheduler,
            force: false,
        }
    }

    /// Re-run stages even when the ledger marks them complete.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn profile_dir(&self, profile: &Profile) -> PathBuf {
        self.config.paths.output_dir.join(profile.slug())
    }

    pub fn case_dir(&self, profile: &Profile, aoa_deg: f64) -> PathBuf {
        self.profile_dir(profile).join(case_dir_name(aoa_deg))
    }

    pub fn flow_conditions(&self, aoa_deg: f64) -> FlowConditions {
        let cfg = &self.config;
        FlowConditions {
            reynolds: cfg.flow.reynolds,
            aoa_deg,
            chord_m: cfg.geometry.chord_m,
            span_m: cfg.mesh.extrude_thickness * cfg.geometry.chord_m,
            density: cfg.flow.density,
            kinematic_viscosity: cfg.flow.kinematic_viscosity,
        }
    }

    pub fn job_spec(&self, slug: &str, aoa_deg: f64, dir: &Path, msh: &Path) -> JobSpec {
        let hpc = &self.config.hpc;
        let name = format!("{}-{}", slug, case_dir_name(aoa_deg));
        let mut vars = HashMap::new();
        vars.insert("case_dir", dir.display().to_string());
        vars.insert("mesh", msh.display().to_string());
        vars.insert("name", name.clone());
        vars.insert("ntasks", hpc.ntasks.to_string());
        vars.insert("chord", self.config.geometry.chord_m.to_string());
        JobSpec {
            name,
            partition: hpc.partition.clone(),
            account: hpc.account.clone(),
            nodes: hpc.nodes,
            ntasks: hpc.ntasks,
            time_limit_minutes: hpc.time_limit_minutes,
            memory: hpc.memory.clone(),
            modules: hpc.modules.clone(),
            working_dir: dir.to_path_buf(),
            commands: hpc
                .commands
                .iter()
                .map(|c| expand_template(c, &vars))
                .collect(),
        }
    }

    fn skip(&self, ledger: &RunLedger, stage: Stage) -> bool {
        let done = !self.force && ledger.is_complete(stage);
        if done {
            debug!(stage = %stage, ledger = %ledger.path().display(), "stage already complete, skipping");
        }
        done
    }

    fn complete(
        &self,
        ledger: &mut RunLedger,
        metrics: &mut RunMetrics,
        stage: Stage,
        started: Instant,
        payload: Value,
    ) -> Result<(), PipelineError> {
        let secs = started.elapsed().as_secs_f64();
        metrics.record_stage(stage.as_str(), secs);
        ledger.record(stage, StageStatus::Completed, payload)?;
        info!(stage = %stage, seconds = secs, "stage complete");
        Ok(())
    }

    fn record_failure(&self, ledger: &mut RunLedger, stage: Stage, err: &PipelineError) {
        error!(stage = %stage, ledger = %ledger.path().display(), error = %err, "stage failed");
        if let Err(e) = ledger.record(stage, StageStatus::Failed, json!({ "error": err.to_string() })) {
            warn!(error = %e, "could not update ledger");
        }
    }

    /// Profile, sketch, STEP, mesh, case files and job script for one angle.
    pub async fn prepare_case(
        &self,
        profile: &Profile,
        aoa_deg: f64,
    ) -> Result<PreparedCase, PipelineError> {
        let dir = self.case_dir(profile, aoa_deg);
        let mut ledger = RunLedger::open(&dir)?;
        let dir = fs::canonicalize(&dir)?;
        let mut metrics = RunMetrics::new();
        let mut stage = Stage::Profile;
        info!(profile = %profile.name, aoa = aoa_deg, dir = %dir.display(), "preparing case");
        match self
            .prepare_stages(profile, aoa_deg, &dir, &mut ledger, &mut metrics, &mut stage)
            .await
        {
            Ok(prepared) => Ok(prepared),
            Err(e) => {
                self.record_failure(&mut ledger, stage, &e);
                Err(e)
            }
        }
    }

    async fn prepare_stages(
        &self,
        profile: &Profile,
        aoa_deg: f64,
        dir: &Path,
        ledger: &mut RunLedger,
        metrics: &mut RunMetrics,
        stage: &mut Stage,
    ) -> Result<PreparedCase, PipelineError> {
        let cfg = &self.config;
        let foil = profile.normalized();
        let slug = foil.slug();
        let chord_mm = cfg.geometry.chord_m * 1000.0;
        let cad_dir = dir.join("cad");
        let mesh_dir = dir.join("mesh");
        let geo = mesh_dir.join(format!("{}.geo", slug));
        let msh = mesh_dir.join(format!("{}.msh", slug));
        let script = dir.join(JOB_SCRIPT);

        *stage = Stage::Profile;
        if !self.skip(ledger, Stage::Profile) {
            let t = Instant::now();
            foil.validate()?;
            foil.write_csv(dir.join("profile.csv"))?;
            let (thickness, at) = foil.max_thickness();
            self.complete(
                ledger,
                metrics,
                Stage::Profile,
                t,
                json!({
                    "name": foil.name,
                    "points": foil.points.len(),
                    "max_thickness": thickness,
                    "max_thickness_x": at,
                }),
            )?;
        }

        *stage = Stage::Sketch;
        if !self.skip(ledger, Stage::Sketch) {
            let t = Instant::now();
            let sketch = Sketch::from_profile(
                &foil,
                &SketchOptions {
                    chord_mm,
                    aoa_deg,
                    spline: cfg.sketch.spline,
                },
            );
            let files = sketch.write(&cad_dir, &cfg.sketch.formats)?;
            self.complete(ledger, metrics, Stage::Sketch, t, json!({ "files": files }))?;
        }

        *stage = Stage::Step;
        if !self.skip(ledger, Stage::Step) {
            let t = Instant::now();
            fs::create_dir_all(&cad_dir)?;
            let path = cad_dir.join(format!("{}.step", slug));
            write_step(
                &path,
                &foil,
                &StepOptions {
                    chord_mm,
                    span_mm: cfg.mesh.extrude_thickness * chord_mm,
                    aoa_deg,
                    author: cfg.step.author.clone(),
                    organization: cfg.step.organization.clone(),
                },
            )?;
            self.complete(ledger, metrics, Stage::Step, t, json!({ "file": path }))?;
        }

        *stage = Stage::Mesh;
        if !self.skip(ledger, Stage::Mesh) {
            let t = Instant::now();
            fs::create_dir_all(&mesh_dir)?;
            fs::write(&geo, write_geo(&foil, &cfg.mesh)?)?;
            let payload = if cfg.mesh.run_gmsh {
                let report = GmshMesher::new(&cfg.mesh).run(&geo, &msh).await?;
                json!({
                    "geo": geo,
                    "msh": report.msh_path,
                    "nodes": report.nodes,
                    "elements": report.elements,
                })
            } else {
                json!({ "geo": geo })
            };
            self.complete(ledger, metrics, Stage::Mesh, t, payload)?;
        }

        *stage = Stage::Case;
        if !self.skip(ledger, Stage::Case) {
            let t = Instant::now();
            let flow = self.flow_conditions(aoa_deg);
            flow.write_case_files(dir)?;
            self.complete(
                ledger,
                metrics,
                Stage::Case,
                t,
                json!({ "velocity": flow.velocity(), "reynolds": flow.reynolds }),
            )?;
        }

        *stage = Stage::Script;
        if !self.skip(ledger, Stage::Script) {
            let t = Instant::now();
            let job = self.job_spec(&slug, aoa_deg, dir, &msh);
            fs::write(&script, render_slurm_script(&job)?)?;
            self.complete(
                ledger,
                metrics,
                Stage::Script,
                t,
                json!({ "script": script, "job_name": job.name }),
            )?;
        }

        Ok(PreparedCase {
            dir: dir.to_path_buf(),
            aoa_deg,
            geo,
            msh,
            script,
            metrics: std::mem::take(metrics),
        })
    }

    /// Prepare, submit, wait and post-process one angle.
    pub async fn run_case(&self, profile: &Profile, aoa_deg: f64) -> Result<CaseResult, PipelineError> {
        let prepared = self.prepare_case(profile, aoa_deg).await?;
        let mut ledger = RunLedger::open(&prepared.dir)?;
        let mut metrics = prepared.metrics.clone();
        let mut stage = Stage::Submit;
        match self
            .execute_stages(&prepared, &mut ledger, &mut metrics, &mut stage)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => {
                self.record_failure(&mut ledger, stage, &e);
                Err(e)
            }
        }
    }

    async fn execute_stages(
        &self,
        prepared: &PreparedCase,
        ledger: &mut RunLedger,
        metrics: &mut RunMetrics,
        stage: &mut Stage,
    ) -> Result<CaseResult, PipelineError> {
        let hpc = &self.config.hpc;

        *stage = Stage::Submit;
        let previous = if self.force {
            None
        } else {
            ledger
                .payload(Stage::Submit)
                .and_then(|p| p.get("job_id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let job_id = match previous {
            Some(id) => {
                info!(job_id = %id, "reusing submitted job");
                id
            }
            None => {
                let t = Instant::now();
                let id = self.scheduler.submit(&prepared.script).await?;
                self.complete(
                    ledger,
                    metrics,
                    Stage::Submit,
                    t,
                    json!({ "job_id": id, "scheduler": self.scheduler.name() }),
                )?;
                id
            }
        };

        if !hpc.wait {
            info!(job_id = %job_id, "not waiting for job");
            return Ok(CaseResult {
                dir: prepared.dir.clone(),
                aoa_deg: prepared.aoa_deg,
                job_id: Some(job_id),
                state: None,
                summary: None,
                metrics: std::mem::take(metrics),
            });
        }

        *stage = Stage::Wait;
        let state = if self.skip(ledger, Stage::Wait) {
            JobState::Completed
        } else {
            let t = Instant::now();
            let waited = wait_for_completion(
                self.scheduler.as_ref(),
                &job_id,
                Duration::from_secs(hpc.poll_interval_secs),
                Duration::from_secs(hpc.timeout_minutes * 60),
            )
            .await;
            let state = match waited {
                Ok(state) => state,
                Err(HpcError::UnknownJob(id)) => {
                    // the scheduler lost the job (e.g. a local job from an earlier process)
                    warn!(job_id = %id, "scheduler does not know the job, it will be resubmitted");
                    ledger.record(
                        Stage::Submit,
                        StageStatus::Failed,
                        json!({ "job_id": id, "error": "unknown job" }),
                    )?;
                    return Err(HpcError::UnknownJob(id).into());
                }
                Err(e) => return Err(e.into()),
            };
            if state != JobState::Completed {
                // a failed job is resubmitted on the next run
                ledger.record(
                    Stage::Submit,
                    StageStatus::Failed,
                    json!({ "job_id": job_id, "state": state.to_string() }),
                )?;
                return Err(PipelineError::JobFailed { id: job_id, state });
            }
            self.complete(
                ledger,
                metrics,
                Stage::Wait,
                t,
                json!({ "job_id": job_id, "state": state.to_string() }),
            )?;
            state
        };

        *stage = Stage::Post;
        let cached: Option<CoefficientSummary> = if self.force {
            None
        } else {
            ledger
                .payload(Stage::Post)
                .and_then(|v| serde_json::from_value(v.clone()).ok())
        };
        let summary = match cached {
            Some(summary) => summary,
            None => {
                let t = Instant::now();
                let path = prepared.dir.join(&self.config.post.coefficients_file);
                let history = CoefficientHistory::from_file(&path)?;
                let summary = summarize(
                    &history,
                    self.config.post.averaging_fraction,
                    self.config.post.convergence_tolerance,
                )?;
                fs::write(
                    prepared.dir.join(CASE_SUMMARY_FILE),
                    serde_json::to_string_pretty(&summary)?,
                )?;
                self.complete(ledger, metrics, Stage::Post, t, serde_json::to_value(&summary)?)?;
                summary
            }
        };
        info!(
            aoa = prepared.aoa_deg,
            cl = summary.cl,
            cd = summary.cd,
            converged = summary.converged,
            "case finished"
        );

        Ok(CaseResult {
            dir: prepared.dir.clone(),
            aoa_deg: prepared.aoa_deg,
            job_id: Some(job_id),
            state: Some(state),
            summary: Some(summary),
            metrics: std::mem::take(metrics),
        })
    }

    /// Run every angle, at most `hpc.max_concurrent_jobs` at a time, and
    /// write `polar.csv` plus `summary.json` next to the case directories.
    pub async fn sweep(&self, profile: &Profile, angles: &[f64]) -> Result<SweepReport, PipelineError> {
        if angles.is_empty() {
            return Err(PipelineError::NoAngles);
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(&dup) = angles.iter().find(|&&a| !seen.insert(case_dir_name(a))) {
            return Err(PipelineError::DuplicateAngle(dup));
        }
        let limit = self.config.hpc.max_concurrent_jobs.max(1);
        info!(profile = %profile.name, cases = angles.len(), limit, "starting sweep");

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();
        for &aoa in angles {
            let pipeline = self.clone();
            let profile = profile.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let result: Result<CaseResult, PipelineError> = async {
                    let _permit = semaphore.acquire_owned().await?;
                    pipeline.run_case(&profile, aoa).await
                }
                .await;
                (aoa, result)
            });
        }

        let reynolds = self.config.flow.reynolds;
        let mut polar = Polar::new(profile.name.clone());
        let mut metrics = RunMetrics::new();
        let mut cases = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((aoa, Ok(result))) => {
                    metrics.merge(&result.metrics);
                    metrics.record_success();
                    if let Some(s) = &result.summary {
                        polar.push(PolarPoint {
                            aoa_deg: aoa,
                            reynolds,
                            cl: s.cl,
                            cd: s.cd,
                            cm: s.cm,
                            converged: s.converged,
                        });
                    }
                    cases.push(result);
                }
                Ok((aoa, Err(e))) => {
                    error!(aoa, error = %e, "case failed");
                    metrics.record_failure();
                    failures.push(CaseFailure {
                        aoa_deg: Some(aoa),
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(error = %e, "case task aborted");
                    metrics.record_failure();
                    failures.push(CaseFailure {
                        aoa_deg: None,
                        error: e.to_string(),
                    });
                }
            }
        }
        cases.sort_by(|a, b| a.aoa_deg.total_cmp(&b.aoa_deg));

        if let Some((point, ld)) = polar.max_lift_to_drag() {
            metrics.set_custom("max_l_over_d", ld);
            metrics.set_custom("aoa_max_l_over_d", point.aoa_deg);
        }
        if let Some(point) = polar.cl_max() {
            metrics.set_custom("cl_max", point.cl);
        }
        if let Some(slope) = polar.lift_slope_per_deg(10.0) {
            metrics.set_custom("lift_slope_per_deg", slope);
        }
        if let Some(aoa) = polar.zero_lift_aoa() {
            metrics.set_custom("zero_lift_aoa", aoa);
        }

        let dir = self.profile_dir(profile);
        fs::create_dir_all(&dir)?;
        polar.write_csv(dir.join(POLAR_FILE))?;
        let report = SweepReport {
            profile: profile.name.clone(),
            reynolds,
            dir: dir.clone(),
            polar,
            cases,
            failures,
            metrics,
        };
        fs::write(
            dir.join(CASE_SUMMARY_FILE),
            serde_json::to_string_pretty(&report)?,
        )?;
        info!(
            dir = %dir.display(),
            succeeded = report.metrics.cases_success,
            failed = report.metrics.cases_failed,
            "sweep finished"
        );
        Ok(report)
    }
}
