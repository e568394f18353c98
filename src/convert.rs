//! Batch conversion of coordinate files to CSV (and optionally sketches).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::profile::{Profile, ProfileError};
use crate::sketch::{Sketch, SketchFormat, SketchOptions};

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("cannot read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Defaults to the input directory.
    pub output_dir: Option<PathBuf>,
    pub sketch_formats: Vec<SketchFormat>,
    pub sketch: SketchOptions,
}

#[derive(Debug, Clone)]
pub struct Converted {
    pub source: PathBuf,
    pub csv: PathBuf,
    pub sketches: Vec<PathBuf>,
    pub points: usize,
}

#[derive(Debug, Default)]
pub struct ConvertReport {
    pub converted: Vec<Converted>,
    pub failures: Vec<(PathBuf, String)>,
}

impl ConvertReport {
    pub fn total(&self) -> usize {
        self.converted.len() + self.failures.len()
    }
}

/// Files with a `.dat` or `.txt` extension, sorted by name.
pub fn coordinate_files(dir: &Path) -> Result<Vec<PathBuf>, ConvertError> {
    let entries = fs::read_dir(dir).map_err(|source| ConvertError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("dat") || e.eq_ignore_ascii_case("txt"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Outputs are named after the source file, never the header line.
fn output_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "profile".to_string())
}

fn convert_file(
    path: &Path,
    stem: &str,
    out_dir: &Path,
    opts: &ConvertOptions,
) -> Result<Converted, ProfileError> {
    let profile = Profile::from_file(path)?;
    let csv = out_dir.join(format!("{}.csv", stem));
    profile.write_csv(&csv)?;

    let mut sketches = Vec::new();
    if !opts.sketch_formats.is_empty() {
        let sketch = Sketch::from_profile(&profile, &opts.sketch);
        sketches = sketch
            .write_named(out_dir, stem, &opts.sketch_formats)
            .map_err(|source| ProfileError::Io {
                path: out_dir.to_path_buf(),
                source,
            })?;
    }
    Ok(Converted {
        source: path.to_path_buf(),
        csv,
        sketches,
        points: profile.points.len(),
    })
}

/// Convert every coordinate file in `dir`. A bad file is logged and
/// recorded in the report; the rest of the batch still runs.
pub fn convert_directory(dir: &Path, opts: &ConvertOptions) -> Result<ConvertReport, ConvertError> {
    let files = coordinate_files(dir)?;
    let out_dir = opts.output_dir.clone().unwrap_or_else(|| dir.to_path_buf());
    fs::create_dir_all(&out_dir).map_err(|source| ConvertError::CreateDir {
        path: out_dir.clone(),
        source,
    })?;

    let mut report = ConvertReport::default();
    let mut stems: HashMap<String, PathBuf> = HashMap::new();
    for path in files {
        let stem = output_stem(&path);
        if let Some(first) = stems.get(&stem) {
            let msg = format!("output name '{}' already used by {}", stem, first.display());
            error!(file = %path.display(), error = %msg, "conversion skipped");
            report.failures.push((path, msg));
            continue;
        }
        match convert_file(&path, &stem, &out_dir, opts) {
            Ok(done) => {
                stems.insert(stem, path.clone());
                info!(
                    file = %path.display(),
                    csv = %done.csv.display(),
                    points = done.points,
                    "converted"
                );
                report.converted.push(done);
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "conversion failed");
                report.failures.push((path, e.to_string()));
            }
        }
    }
    info!(
        dir = %dir.display(),
        converted = report.converted.len(),
        failed = report.failures.len(),
        "batch conversion finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SELIG: &str = "TEST FOIL\n1.0 0.0\n0.5 0.06\n0.0 0.0\n0.5 -0.04\n1.0 0.0\n";

    #[test]
    fn test_only_coordinate_files_are_picked() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.dat"), SELIG).unwrap();
        fs::write(dir.path().join("a.TXT"), SELIG).unwrap();
        fs::write(dir.path().join("notes.md"), "hello").unwrap();
        fs::create_dir(dir.path().join("sub.dat")).unwrap();

        let files = coordinate_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.TXT", "b.dat"]);
    }

    #[test]
    fn test_bad_file_does_not_stop_batch() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("good.dat"), SELIG).unwrap();
        fs::write(dir.path().join("bad.dat"), "nothing to see\nhere\n").unwrap();

        let report = convert_directory(dir.path(), &ConvertOptions::default()).unwrap();
        assert_eq!(report.total(), 2);
        assert_eq!(report.converted.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].0.ends_with("bad.dat"));

        let csv = fs::read_to_string(dir.path().join("good.csv")).unwrap();
        assert_eq!(csv.lines().count(), 5);
        assert!(csv.starts_with("1,0"));
    }

    #[test]
    fn test_output_dir_and_sketches() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        fs::write(dir.path().join("foil.dat"), SELIG).unwrap();

        let opts = ConvertOptions {
            output_dir: Some(out.clone()),
            sketch_formats: vec![SketchFormat::Dxf],
            sketch: SketchOptions::default(),
        };
        let report = convert_directory(dir.path(), &opts).unwrap();
        assert_eq!(report.converted.len(), 1);
        assert!(out.join("foil.csv").exists());
        assert_eq!(report.converted[0].sketches.len(), 1);
        assert!(report.converted[0].sketches[0].exists());
    }

    #[test]
    fn test_sketches_follow_file_names() {
        let dir = tempdir().unwrap();
        let header = "NACA 0012\n1.0 0.0\n0.5 0.06\n0.0 0.0\n0.5 -0.06\n1.0 0.0\n";
        fs::write(dir.path().join("a.dat"), header).unwrap();
        fs::write(dir.path().join("b.dat"), header).unwrap();

        let opts = ConvertOptions {
            sketch_formats: vec![SketchFormat::Dxf, SketchFormat::Svg],
            ..ConvertOptions::default()
        };
        let report = convert_directory(dir.path(), &opts).unwrap();
        assert_eq!(report.converted.len(), 2);
        assert_eq!(
            report.converted[0].sketches,
            vec![dir.path().join("a.dxf"), dir.path().join("a.svg")]
        );
        assert_eq!(
            report.converted[1].sketches,
            vec![dir.path().join("b.dxf"), dir.path().join("b.svg")]
        );
        assert!(!dir.path().join("naca-0012.dxf").exists());
    }

    #[test]
    fn test_same_stem_is_not_overwritten() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("foil.dat"), SELIG).unwrap();
        fs::write(dir.path().join("foil.txt"), "OTHER\n1 0\n0 0\n1 -0.02\n").unwrap();

        let report = convert_directory(dir.path(), &ConvertOptions::default()).unwrap();
        assert_eq!(report.converted.len(), 1);
        assert!(report.converted[0].source.ends_with("foil.dat"));
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].0.ends_with("foil.txt"));
        let csv = fs::read_to_string(dir.path().join("foil.csv")).unwrap();
        assert_eq!(csv.lines().count(), 5);
    }

    #[test]
    fn test_missing_directory() {
        assert!(matches!(
            convert_directory(Path::new("/nonexistent/profiles"), &ConvertOptions::default()),
            Err(ConvertError::ReadDir { .. })
        ));
    }
}
