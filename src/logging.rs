//! Console and JSON-lines logging.
//!
//! Three layers, each with its own filter: the console and `logfile.jsonl`
//! follow `RUST_LOG` (or this crate at the configured level), while
//! `complete_logfile.jsonl` keeps every debug event from every crate.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

pub const LOG_FILE_NAME: &str = "logfile.jsonl";
pub const COMPLETE_LOG_FILE_NAME: &str = "complete_logfile.jsonl";

fn backup_path(path: &Path, n: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

/// Shift `path` to `path.1`, `path.1` to `path.2` and so on once it
/// reaches `max_bytes`. The oldest backup beyond `backups` is dropped.
/// Returns whether a rotation happened.
pub fn rotate_logs(path: &Path, max_bytes: u64, backups: u32) -> io::Result<bool> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if size < max_bytes {
        return Ok(false);
    }
    if backups == 0 {
        fs::remove_file(path)?;
        return Ok(true);
    }
    let oldest = backup_path(path, backups);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..backups).rev() {
        let from = backup_path(path, n);
        if from.exists() {
            fs::rename(&from, backup_path(path, n + 1))?;
        }
    }
    fs::rename(path, backup_path(path, 1))?;
    Ok(true)
}

/// Append-only log file that rolls over with [`rotate_logs`] instead of
/// growing past `max_bytes`.
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: u32,
    file: File,
    size: u64,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl RotatingFile {
    /// Open for appending, creating the directory and rotating first when
    /// the file is already full.
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backups: u32) -> io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        rotate_logs(&path, max_bytes, backups)?;
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            backups,
            file,
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        rotate_logs(&self.path, 0, self.backups)?;
        self.file = open_append(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // a record larger than max_bytes still lands in a fresh file
        if self.size > 0 && self.size.saturating_add(buf.len() as u64) > self.max_bytes {
            self.roll()?;
        }
        let n = self.file.write(buf)?;
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("warn,airfoil_cfd={}", level)))
        .unwrap_or_else(|_| EnvFilter::new("warn,airfoil_cfd=info"))
}

/// Build the layered subscriber without installing it. Log files that
/// cannot be opened are left out and described in the returned warnings.
pub fn build_subscriber(
    cfg: &LoggingConfig,
    logs_dir: &Path,
) -> (impl Subscriber + Send + Sync + 'static, Vec<String>) {
    let mut warnings = Vec::new();
    let mut open = |enabled: bool, name: &str, backups: u32| {
        if !enabled {
            return None;
        }
        let path = logs_dir.join(name);
        match RotatingFile::open(&path, cfg.max_bytes, backups) {
            Ok(file) => Some(file),
            Err(e) => {
                warnings.push(format!(
                    "file logging disabled, cannot open {}: {}",
                    path.display(),
                    e
                ));
                None
            }
        }
    };

    let file_layer = open(cfg.json_file, LOG_FILE_NAME, cfg.backups).map(|file| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true)
            .with_writer(Mutex::new(file))
            .with_filter(env_filter(&cfg.level))
    });

    let complete_layer =
        open(cfg.complete_file, COMPLETE_LOG_FILE_NAME, cfg.complete_backups).map(|file| {
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_writer(Mutex::new(file))
                .with_filter(LevelFilter::DEBUG)
        });

    let console = fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_writer(io::stderr)
        .with_filter(env_filter(&cfg.level));

    let subscriber = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(complete_layer);
    (subscriber, warnings)
}

/// Install the global subscriber. Warnings about skipped log files are
/// emitted through it once it is in place.
pub fn init(cfg: &LoggingConfig, logs_dir: &Path) {
    let (subscriber, warnings) = build_subscriber(cfg, logs_dir);
    if subscriber.try_init().is_ok() {
        for warning in warnings {
            tracing::warn!("{warning}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_no_rotation_below_limit() {
        let dir = tempdir().unwrap();
        let log = dir.path().join(LOG_FILE_NAME);
        fs::write(&log, "small").unwrap();
        assert!(!rotate_logs(&log, 1024, 3).unwrap());
        assert!(log.exists());
        assert!(!backup_path(&log, 1).exists());
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        assert!(!rotate_logs(&dir.path().join("absent.jsonl"), 1, 3).unwrap());
    }

    #[test]
    fn test_rotation_shifts_backups() {
        let dir = tempdir().unwrap();
        let log = dir.path().join(LOG_FILE_NAME);
        fs::write(backup_path(&log, 1), "one").unwrap();
        fs::write(backup_path(&log, 2), "two").unwrap();
        fs::write(&log, "current-current").unwrap();

        assert!(rotate_logs(&log, 4, 2).unwrap());
        assert!(!log.exists());
        assert_eq!(fs::read_to_string(backup_path(&log, 1)).unwrap(), "current-current");
        assert_eq!(fs::read_to_string(backup_path(&log, 2)).unwrap(), "one");
        assert!(!backup_path(&log, 3).exists());
    }

    #[test]
    fn test_zero_backups_removes_file() {
        let dir = tempdir().unwrap();
        let log = dir.path().join(LOG_FILE_NAME);
        fs::write(&log, "0123456789").unwrap();
        assert!(rotate_logs(&log, 4, 0).unwrap());
        assert!(!log.exists());
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/logs").join(LOG_FILE_NAME);
        let file = RotatingFile::open(&path, 1024, 5).unwrap();
        assert_eq!(file.path(), path.as_path());
        assert!(path.exists());
    }

    #[test]
    fn test_rotating_file_rolls_while_writing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);
        let mut file = RotatingFile::open(&path, 16, 2).unwrap();
        file.write_all(b"0123456789\n").unwrap();
        file.write_all(b"abcdefghij\n").unwrap();
        file.write_all(b"ABCDEFGHIJ\n").unwrap();
        file.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "ABCDEFGHIJ\n");
        assert_eq!(fs::read_to_string(backup_path(&path, 1)).unwrap(), "abcdefghij\n");
        assert_eq!(fs::read_to_string(backup_path(&path, 2)).unwrap(), "0123456789\n");
    }

    #[test]
    fn test_open_rotates_full_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(COMPLETE_LOG_FILE_NAME);
        fs::write(&path, "x".repeat(32)).unwrap();
        let _file = RotatingFile::open(&path, 32, 1).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(fs::metadata(backup_path(&path, 1)).unwrap().len(), 32);
    }

    #[test]
    fn test_layers_filter_independently() {
        let dir = tempdir().unwrap();
        let cfg = LoggingConfig::default();
        let (subscriber, warnings) = build_subscriber(&cfg, dir.path());
        assert!(warnings.is_empty());

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "airfoil_cfd::pipeline", case = "aoa_+02.00", "stage complete");
            tracing::debug!(target: "airfoil_cfd::pipeline", "below the configured level");
            tracing::debug!(target: "hyper::client", "third party detail");
        });

        let main = fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        let complete = fs::read_to_string(dir.path().join(COMPLETE_LOG_FILE_NAME)).unwrap();
        assert_eq!(main.lines().count(), 1);
        assert_eq!(complete.lines().count(), 3);
        assert!(complete.contains("third party detail"));

        let record: serde_json::Value = serde_json::from_str(main.trim_end()).unwrap();
        assert_eq!(record["fields"]["message"], "stage complete");
        assert_eq!(record["fields"]["case"], "aoa_+02.00");
        assert_eq!(record["level"], "INFO");
        assert!(record["line_number"].is_u64());
        assert!(record["filename"].as_str().unwrap().ends_with("logging.rs"));
        assert!(record.get("threadName").is_some());
    }

    #[test]
    fn test_unwritable_log_dir_is_reported() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();
        let (_subscriber, warnings) = build_subscriber(&LoggingConfig::default(), &blocker);
        assert_eq!(warnings.len(), 2);

        let cfg = LoggingConfig {
            json_file: false,
            complete_file: false,
            ..LoggingConfig::default()
        };
        let (_subscriber, warnings) = build_subscriber(&cfg, &blocker);
        assert!(warnings.is_empty());
    }
}
