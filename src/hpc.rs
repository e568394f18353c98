//! Batch job scripts and scheduler backends.
//!
//! Solver runs are described by a [`JobSpec`], rendered to a Slurm batch
//! script and handed to a [`Scheduler`]. Slurm commands can run locally or
//! through `ssh` to a login node; [`LocalScheduler`] runs the same script on
//! the current machine for workstation use.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum HpcError {
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("failed to run {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("could not find a job id in scheduler output: {0}")]
    UnexpectedOutput(String),
    #[error("unknown job {0}")]
    UnknownJob(String),
    #[error("job {id} still {state} after {waited:?}")]
    Timeout {
        id: String,
        state: JobState,
        waited: Duration,
    },
}

/// Lifecycle of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Unknown(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timeout"),
            Self::Unknown(s) => write!(f, "unknown ({})", s),
        }
    }
}

/// Map a Slurm state string (`squeue %T` / `sacct State`) to a [`JobState`].
pub fn parse_slurm_state(raw: &str) -> JobState {
    let word = raw
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches('+')
        .to_ascii_uppercase();
    match word.as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "RESV_DEL_HOLD" | "SUSPENDED" => {
            JobState::Pending
        }
        "RUNNING" | "COMPLETING" | "STAGE_OUT" => JobState::Running,
        "COMPLETED" => JobState::Completed,
        "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE" | "PREEMPTED" => {
            JobState::Failed
        }
        "CANCELLED" => JobState::Cancelled,
        "TIMEOUT" => JobState::Timeout,
        _ => JobState::Unknown(raw.trim().to_string()),
    }
}

/// Job id from `sbatch` output (`Submitted batch job 123` or `--parsable`).
pub fn parse_sbatch_output(stdout: &str) -> Result<String, HpcError> {
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Submitted batch job") {
            let id = rest.trim();
            if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
                return Ok(id.to_string());
            }
        }
        let parsable = line.split(';').next().unwrap_or("");
        if !parsable.is_empty() && parsable.chars().all(|c| c.is_ascii_digit()) {
            return Ok(parsable.to_string());
        }
    }
    Err(HpcError::UnexpectedOutput(stdout.trim().to_string()))
}

/// Resources and commands for one solver job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub partition: Option<String>,
    pub account: Option<String>,
    pub nodes: u32,
    pub ntasks: u32,
    pub time_limit_minutes: u32,
    pub memory: Option<String>,
    pub modules: Vec<String>,
    pub working_dir: PathBuf,
    pub commands: Vec<String>,
}

impl JobSpec {
    pub fn validate(&self) -> Result<(), HpcError> {
        if self.name.is_empty() {
            return Err(HpcError::InvalidJob("job name is empty".to_string()));
        }
        if let Some(c) = self
            .name
            .chars()
            .find(|c| c.is_whitespace() || ";&|`$<>'\"\\".contains(*c))
        {
            return Err(HpcError::InvalidJob(format!(
                "job name '{}' contains '{}'",
                self.name, c
            )));
        }
        if self.nodes == 0 || self.ntasks == 0 {
            return Err(HpcError::InvalidJob(
                "nodes and ntasks must be at least 1".to_string(),
            ));
        }
        if self.time_limit_minutes == 0 {
            return Err(HpcError::InvalidJob("time limit must be positive".to_string()));
        }
        if self.commands.is_empty() {
            return Err(HpcError::InvalidJob("no commands to run".to_string()));
        }
        Ok(())
    }
}

/// Render a Slurm batch script.
pub fn render_slurm_script(job: &JobSpec) -> Result<String, HpcError> {
    job.validate()?;
    let mut out = String::from("#!/bin/bash\n");
    let _ = writeln!(out, "#SBATCH --job-name={}", job.name);
    if let Some(p) = &job.partition {
        let _ = writeln!(out, "#SBATCH --partition={}", p);
    }
    if let Some(a) = &job.account {
        let _ = writeln!(out, "#SBATCH --account={}", a);
    }
    let _ = writeln!(out, "#SBATCH --nodes={}", job.nodes);
    let _ = writeln!(out, "#SBATCH --ntasks={}", job.ntasks);
    let _ = writeln!(
        out,
        "#SBATCH --time={:02}:{:02}:00",
        job.time_limit_minutes / 60,
        job.time_limit_minutes % 60
    );
    if let Some(m) = &job.memory {
        let _ = writeln!(out, "#SBATCH --mem={}", m);
    }
    let _ = writeln!(out, "#SBATCH --output={}/slurm-%j.out", job.working_dir.display());
    let _ = writeln!(out, "#SBATCH --error={}/slurm-%j.err", job.working_dir.display());
    out.push('\n');
    out.push_str("set -euo pipefail\n");
    for m in &job.modules {
        let _ = writeln!(out, "module load {}", m);
    }
    let _ = writeln!(out, "cd \"{}\"", job.working_dir.display());
    let _ = writeln!(out, "export NPROCS={}", job.ntasks);
    out.push('\n');
    for cmd in &job.commands {
        out.push_str(cmd);
        out.push('\n');
    }
    Ok(out)
}

/// A batch system that can accept scripts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;
    async fn submit(&self, script: &Path) -> Result<String, HpcError>;
    async fn status(&self, job_id: &str) -> Result<JobState, HpcError>;
    async fn cancel(&self, job_id: &str) -> Result<(), HpcError>;
}

/// Slurm via `sbatch`/`squeue`/`sacct`/`scancel`, optionally over ssh.
pub struct SlurmScheduler {
    ssh_host: Option<String>,
    bin_dir: Option<PathBuf>,
}

impl SlurmScheduler {
    pub fn new(ssh_host: Option<String>) -> Self {
        Self {
            ssh_host,
            bin_dir: None,
        }
    }

    /// Run the Slurm tools from `dir` instead of looking them up on `PATH`.
    pub fn with_bin_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.bin_dir = dir;
        self
    }

    /// Program and arguments, wrapped in `ssh host` when remote.
    fn command_line(&self, program: &str, args: &[String]) -> (String, Vec<String>) {
        let program = match &self.bin_dir {
            Some(dir) => dir.join(program).display().to_string(),
            None => program.to_string(),
        };
        match &self.ssh_host {
            Some(host) => {
                let mut ssh_args = vec![host.clone(), program];
                ssh_args.extend(args.iter().cloned());
                ("ssh".to_string(), ssh_args)
            }
            None => (program, args.to_vec()),
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<String, HpcError> {
        let (bin, argv) = self.command_line(program, args);
        debug!(command = %bin, args = ?argv, "running scheduler command");
        let output = Command::new(&bin)
            .args(&argv)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| HpcError::Launch {
                command: program.to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(HpcError::CommandFailed {
                command: program.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Scheduler for SlurmScheduler {
    fn name(&self) -> &str {
        "slurm"
    }

    async fn submit(&self, script: &Path) -> Result<String, HpcError> {
        let out = self
            .run("sbatch", &[script.display().to_string()])
            .await?;
        let id = parse_sbatch_output(&out)?;
        info!(job_id = %id, script = %script.display(), "job submitted to slurm");
        Ok(id)
    }

    async fn status(&self, job_id: &str) -> Result<JobState, HpcError> {
        let queued = self
            .run(
                "squeue",
                &[
                    "-h".to_string(),
                    "-j".to_string(),
                    job_id.to_string(),
                    "-o".to_string(),
                    "%T".to_string(),
                ],
            )
            .await;
        // squeue forgets finished jobs (and errors on unknown ids), sacct remembers them
        if let Ok(out) = queued {
            if let Some(line) = out.lines().map(str::trim).find(|l| !l.is_empty()) {
                return Ok(parse_slurm_state(line));
            }
        }
        let out = self
            .run(
                "sacct",
                &[
                    "-n".to_string(),
                    "-X".to_string(),
                    "-P".to_string(),
                    "-j".to_string(),
                    job_id.to_string(),
                    "-o".to_string(),
                    "State".to_string(),
                ],
            )
            .await?;
        match out.lines().map(str::trim).find(|l| !l.is_empty()) {
            Some(line) => Ok(parse_slurm_state(line)),
            None => Err(HpcError::UnknownJob(job_id.to_string())),
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<(), HpcError> {
        self.run("scancel", &[job_id.to_string()]).await?;
        info!(job_id = %job_id, "job cancelled");
        Ok(())
    }
}

enum LocalJob {
    Running(Child),
    Finished(JobState),
}

/// Runs scripts with `bash` on this machine.
pub struct LocalScheduler {
    jobs: Mutex<HashMap<String, LocalJob>>,
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    fn name(&self) -> &str {
        "local"
    }

    async fn submit(&self, script: &Path) -> Result<String, HpcError> {
        // bash runs inside the script's directory, so the path must not stay relative
        let script = std::fs::canonicalize(script).map_err(|source| HpcError::Launch {
            command: "bash".to_string(),
            source,
        })?;
        let dir = script.parent().unwrap_or_else(|| Path::new("/"));
        let log = std::fs::File::create(dir.join("local-job.out")).map_err(|source| {
            HpcError::Launch {
                command: "bash".to_string(),
                source,
            }
        })?;
        let err_log = log.try_clone().map_err(|source| HpcError::Launch {
            command: "bash".to_string(),
            source,
        })?;
        let child = Command::new("bash")
            .arg(&script)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log))
            .spawn()
            .map_err(|source| HpcError::Launch {
                command: "bash".to_string(),
                source,
            })?;
        let id = format!("local-{}", Uuid::new_v4().simple());
        info!(job_id = %id, script = %script.display(), "job started locally");
        self.jobs.lock().await.insert(id.clone(), LocalJob::Running(child));
        Ok(id)
    }

    async fn status(&self, job_id: &str) -> Result<JobState, HpcError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| HpcError::UnknownJob(job_id.to_string()))?;
        let state = match job {
            LocalJob::Finished(state) => return Ok(state.clone()),
            LocalJob::Running(child) => match child.try_wait() {
                Ok(Some(status)) if status.success() => JobState::Completed,
                Ok(Some(_)) => JobState::Failed,
                Ok(None) => return Ok(JobState::Running),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "could not poll local job");
                    JobState::Unknown(e.to_string())
                }
            },
        };
        *job = LocalJob::Finished(state.clone());
        Ok(state)
    }

    async fn cancel(&self, job_id: &str) -> Result<(), HpcError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| HpcError::UnknownJob(job_id.to_string()))?;
        if let LocalJob::Running(child) = job {
            if let Err(e) = child.kill().await {
                warn!(job_id = %job_id, error = %e, "failed to kill local job");
            }
            *job = LocalJob::Finished(JobState::Cancelled);
        }
        info!(job_id = %job_id, "local job cancelled");
        Ok(())
    }
}

/// Poll until the job reaches a terminal state or `timeout` elapses.
pub async fn wait_for_completion(
    scheduler: &dyn Scheduler,
    job_id: &str,
    poll: Duration,
    timeout: Duration,
) -> Result<JobState, HpcError> {
    let started = Instant::now();
    let mut interval = tokio::time::interval(poll);
    let mut last = JobState::Pending;
    loop {
        interval.tick().await;
        let state = scheduler.status(job_id).await?;
        if state != last {
            info!(job_id = %job_id, state = %state, scheduler = scheduler.name(), "job state changed");
        }
        if state.is_terminal() {
            return Ok(state);
        }
        last = state;
        if started.elapsed() >= timeout {
            return Err(HpcError::Timeout {
                id: job_id.to_string(),
                state: last,
                waited: started.elapsed(),
            });
        }
    }
}

/// Substitute `{name}`-style placeholders in command templates.
pub fn expand_template(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}
