//! Post-processing of force coefficient histories into CD/CL results.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::case::FlowConditions;

#[derive(Debug, thiserror::Error)]
pub enum PostError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no column header found")]
    MissingHeader,
    #[error("column '{0}' not found in header")]
    MissingColumn(&'static str),
    #[error("line {line}: {msg}")]
    Parse { line: usize, msg: String },
    #[error("no samples to average")]
    Empty,
    #[error("averaging fraction must be in (0, 1], got {0}")]
    InvalidFraction(f64),
}

/// One row of a coefficient history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoefficientSample {
    pub time: f64,
    pub cd: f64,
    pub cl: f64,
    pub cm: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoefficientHistory {
    pub samples: Vec<CoefficientSample>,
}

fn column(names: &[String], candidates: &[&str]) -> Option<usize> {
    candidates
        .iter()
        .find_map(|c| names.iter().position(|n| n.eq_ignore_ascii_case(c)))
}

fn split_tokens(line: &str) -> Vec<&str> {
    line.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Parse OpenFOAM `forceCoeffs.dat` / `coefficient.dat` or a headed CSV.
///
/// OpenFOAM headers are comment lines; the last `# Time ...` line wins.
pub fn parse_coefficient_history(text: &str) -> Result<CoefficientHistory, PostError> {
    let mut names: Option<Vec<String>> = None;
    let mut data: Vec<(usize, Vec<&str>)> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            let tokens = split_tokens(comment);
            if tokens
                .first()
                .map_or(false, |t| t.eq_ignore_ascii_case("time"))
            {
                names = Some(tokens.iter().map(|t| t.to_string()).collect());
            }
            continue;
        }
        let tokens = split_tokens(line);
        if names.is_none() && data.is_empty() && tokens.iter().any(|t| t.parse::<f64>().is_err()) {
            names = Some(tokens.iter().map(|t| t.to_string()).collect());
            continue;
        }
        data.push((idx + 1, tokens));
    }

    let names = names.ok_or(PostError::MissingHeader)?;
    let time_col = column(&names, &["Time", "Iteration", "iter"]).unwrap_or(0);
    let cd_col = column(&names, &["Cd", "CD"]).ok_or(PostError::MissingColumn("Cd"))?;
    let cl_col = column(&names, &["Cl", "CL"]).ok_or(PostError::MissingColumn("Cl"))?;
    let cm_col = column(&names, &["Cm", "CmPitch", "CM"]);

    let mut samples = Vec::with_capacity(data.len());
    for (line, tokens) in data {
        let get = |col: usize| -> Result<f64, PostError> {
            let tok = tokens.get(col).ok_or_else(|| PostError::Parse {
                line,
                msg: format!("missing column {}", col + 1),
            })?;
            tok.parse::<f64>().map_err(|_| PostError::Parse {
                line,
                msg: format!("'{}' is not a number", tok),
            })
        };
        samples.push(CoefficientSample {
            time: get(time_col)?,
            cd: get(cd_col)?,
            cl: get(cl_col)?,
            cm: match cm_col {
                Some(c) => Some(get(c)?),
                None => None,
            },
        });
    }
    Ok(CoefficientHistory { samples })
}

impl CoefficientHistory {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PostError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| PostError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let history = parse_coefficient_history(&text)?;
        info!(path = %path.display(), samples = history.samples.len(), "coefficient history loaded");
        Ok(history)
    }
}

/// Time-averaged coefficients over the tail of a history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientSummary {
    pub cl: f64,
    pub cd: f64,
    pub cm: Option<f64>,
    pub cl_std: f64,
    pub cd_std: f64,
    pub lift_to_drag: Option<f64>,
    pub samples_used: usize,
    pub converged: bool,
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

fn relative(std: f64, mean: f64) -> f64 {
    if mean.abs() <= 1e-12 {
        std
    } else {
        std / mean.abs()
    }
}

/// Average the last `averaging_fraction` of samples.
///
/// Converged when the relative spread of both Cl and Cd in that window is
/// at most `tolerance` (absolute spread when the mean is ~0).
pub fn summarize(
    history: &CoefficientHistory,
    averaging_fraction: f64,
    tolerance: f64,
) -> Result<CoefficientSummary, PostError> {
    if averaging_fraction.is_nan() || averaging_fraction <= 0.0 || averaging_fraction > 1.0 {
        return Err(PostError::InvalidFraction(averaging_fraction));
    }
    let n = history.samples.len();
    if n == 0 {
        return Err(PostError::Empty);
    }
    let window = ((n as f64 * averaging_fraction).ceil() as usize).clamp(1, n);
    let tail = &history.samples[n - window..];

    let cl: Vec<f64> = tail.iter().map(|s| s.cl).collect();
    let cd: Vec<f64> = tail.iter().map(|s| s.cd).collect();
    let (cl_mean, cl_std) = mean_std(&cl);
    let (cd_mean, cd_std) = mean_std(&cd);
    let cm: Vec<f64> = tail.iter().filter_map(|s| s.cm).collect();
    let cm_mean = if cm.len() == tail.len() {
        Some(mean_std(&cm).0)
    } else {
        None
    };

    let converged =
        relative(cl_std, cl_mean) <= tolerance && relative(cd_std, cd_mean) <= tolerance;
    if !converged {
        warn!(cl_std, cd_std, window, "coefficients not converged");
    }

    Ok(CoefficientSummary {
        cl: cl_mean,
        cd: cd_mean,
        cm: cm_mean,
        cl_std,
        cd_std,
        lift_to_drag: if cd_mean.abs() > 1e-12 {
            Some(cl_mean / cd_mean)
        } else {
            None
        },
        samples_used: window,
        converged,
    })
}

/// (Cl, Cd) from dimensional lift and drag forces.
pub fn coefficients_from_forces(lift: f64, drag: f64, flow: &FlowConditions) -> (f64, f64) {
    let denom = flow.dynamic_pressure() * flow.reference_area();
    (lift / denom, drag / denom)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolarPoint {
    pub aoa_deg: f64,
    pub reynolds: f64,
    pub cl: f64,
    pub cd: f64,
    pub cm: Option<f64>,
    pub converged: bool,
}

impl PolarPoint {
    pub fn lift_to_drag(&self) -> Option<f64> {
        if self.cd.abs() > 1e-12 {
            Some(self.cl / self.cd)
        } else {
            None
        }
    }
}

/// Coefficients against angle of attack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Polar {
    pub name: String,
    pub points: Vec<PolarPoint>,
}

impl Polar {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            points: Vec::new(),
        }
    }

    /// Insert keeping points sorted by angle of attack.
    pub fn push(&mut self, point: PolarPoint) {
        let idx = self
            .points
            .partition_point(|p| p.aoa_deg <= point.aoa_deg);
        self.points.insert(idx, point);
    }

    pub fn max_lift_to_drag(&self) -> Option<(&PolarPoint, f64)> {
        self.points
            .iter()
            .filter_map(|p| p.lift_to_drag().map(|ld| (p, ld)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    pub fn cl_max(&self) -> Option<&PolarPoint> {
        self.points.iter().max_by(|a, b| a.cl.total_cmp(&b.cl))
    }

    /// Least-squares dCl/dalpha over points with |aoa| <= `max_abs_aoa`.
    pub fn lift_slope_per_deg(&self, max_abs_aoa: f64) -> Option<f64> {
        let pts: Vec<&PolarPoint> = self
            .points
            .iter()
            .filter(|p| p.aoa_deg.abs() <= max_abs_aoa)
            .collect();
        if pts.len() < 2 {
            return None;
        }
        let n = pts.len() as f64;
        let mx = pts.iter().map(|p| p.aoa_deg).sum::<f64>() / n;
        let my = pts.iter().map(|p| p.cl).sum::<f64>() / n;
        let sxx: f64 = pts.iter().map(|p| (p.aoa_deg - mx).powi(2)).sum();
        if sxx <= f64::EPSILON {
            return None;
        }
        let sxy: f64 = pts.iter().map(|p| (p.aoa_deg - mx) * (p.cl - my)).sum();
        Some(sxy / sxx)
    }

    /// First angle where Cl changes sign, linearly interpolated.
    pub fn zero_lift_aoa(&self) -> Option<f64> {
        if let Some(p) = self.points.iter().find(|p| p.cl == 0.0) {
            return Some(p.aoa_deg);
        }
        self.points.windows(2).find_map(|w| {
            let (a, b) = (&w[0], &w[1]);
            if a.cl.signum() != b.cl.signum() {
                Some(a.aoa_deg - a.cl * (b.aoa_deg - a.aoa_deg) / (b.cl - a.cl))
            } else {
                None
            }
        })
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from("aoa_deg,reynolds,cl,cd,cm,l_over_d,converged\n");
        for p in &self.points {
            let _ = writeln!(
                out,
                "{},{},{},{},{},{},{}",
                p.aoa_deg,
                p.reynolds,
                p.cl,
                p.cd,
                p.cm.map(|v| v.to_string()).unwrap_or_default(),
                p.lift_to_drag().map(|v| v.to_string()).unwrap_or_default(),
                p.converged
            );
        }
        out
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), PostError> {
        let path = path.as_ref();
        fs::write(path, self.to_csv()).map_err(|source| PostError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), points = self.points.len(), "polar written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPENFOAM_LEGACY: &str = "# Force coefficients
# dragDir     : (1 0 0)
# liftDir     : (0 1 0)
#
# Time    	Cm           	Cd           	Cl           	Cl(f)        	Cl(r)
1	0.01	0.020	0.40	0.2	0.2
2	0.01	0.012	0.50	0.25	0.25
3	0.01	0.010	0.50	0.25	0.25
4	0.01	0.010	0.50	0.25	0.25
";

    const OPENFOAM_NEW: &str = "# Force and moment coefficients
# Time	Cd	Cd(f)	Cd(r)	Cl	Cl(f)	Cl(r)	CmPitch	CmRoll	CmYaw	Cs	Cs(f)	Cs(r)
100	0.011	0	0	0.25	0	0	-0.05	0	0	0	0	0
200	0.011	0	0	0.25	0	0	-0.05	0	0	0	0	0
";

    #[test]
    fn test_parse_legacy_columns() {
        let h = parse_coefficient_history(OPENFOAM_LEGACY).unwrap();
        assert_eq!(h.samples.len(), 4);
        assert_eq!(h.samples[0].cd, 0.020);
        assert_eq!(h.samples[0].cl, 0.40);
        assert_eq!(h.samples[0].cm, Some(0.01));
    }

    #[test]
    fn test_parse_new_columns() {
        let h = parse_coefficient_history(OPENFOAM_NEW).unwrap();
        assert_eq!(h.samples.len(), 2);
        assert_eq!(h.samples[1].time, 200.0);
        assert_eq!(h.samples[1].cm, Some(-0.05));
    }

    #[test]
    fn test_parse_csv_header() {
        let text = "iter,CL,CD\n1,0.3,0.02\n2,0.31,0.021\n";
        let h = parse_coefficient_history(text).unwrap();
        assert_eq!(h.samples.len(), 2);
        assert_eq!(h.samples[1].cl, 0.31);
        assert_eq!(h.samples[1].cm, None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_coefficient_history("1 2 3\n"),
            Err(PostError::MissingHeader)
        ));
        assert!(matches!(
            parse_coefficient_history("# Time Cd\n1 0.1\n"),
            Err(PostError::MissingColumn("Cl"))
        ));
        assert!(matches!(
            parse_coefficient_history("# Time Cd Cl\n1 0.1 x\n"),
            Err(PostError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn test_summarize_tail() {
        let h = parse_coefficient_history(OPENFOAM_LEGACY).unwrap();
        let s = summarize(&h, 0.5, 0.01).unwrap();
        assert_eq!(s.samples_used, 2);
        assert!((s.cl - 0.5).abs() < 1e-12);
        assert!((s.cd - 0.010).abs() < 1e-12);
        assert!(s.converged);
        assert!((s.lift_to_drag.unwrap() - 50.0).abs() < 1e-9);

        let all = summarize(&h, 1.0, 0.01).unwrap();
        assert_eq!(all.samples_used, 4);
        assert!(!all.converged);
    }

    #[test]
    fn test_summarize_invalid() {
        let h = CoefficientHistory::default();
        assert!(matches!(summarize(&h, 0.2, 0.01), Err(PostError::Empty)));
        let h = parse_coefficient_history(OPENFOAM_NEW).unwrap();
        assert!(matches!(
            summarize(&h, 0.0, 0.01),
            Err(PostError::InvalidFraction(_))
        ));
    }

    #[test]
    fn test_coefficients_from_forces() {
        let flow = FlowConditions {
            reynolds: 1.0e6,
            aoa_deg: 0.0,
            chord_m: 1.0,
            span_m: 1.0,
            density: 1.0,
            kinematic_viscosity: 1.0e-5,
        };
        // q = 0.5 * 1 * 10^2 = 50, A = 1
        let (cl, cd) = coefficients_from_forces(25.0, 0.5, &flow);
        assert!((cl - 0.5).abs() < 1e-9);
        assert!((cd - 0.01).abs() < 1e-9);
    }

    fn point(aoa: f64, cl: f64, cd: f64) -> PolarPoint {
        PolarPoint {
            aoa_deg: aoa,
            reynolds: 1e6,
            cl,
            cd,
            cm: None,
            converged: true,
        }
    }

    #[test]
    fn test_polar_analysis() {
        let mut polar = Polar::new("NACA 2412");
        polar.push(point(4.0, 0.68, 0.0070));
        polar.push(point(-4.0, -0.20, 0.0070));
        polar.push(point(0.0, 0.24, 0.0060));
        polar.push(point(12.0, 1.40, 0.0180));
        polar.push(point(16.0, 1.20, 0.0400));

        let aoas: Vec<f64> = polar.points.iter().map(|p| p.aoa_deg).collect();
        assert_eq!(aoas, vec![-4.0, 0.0, 4.0, 12.0, 16.0]);

        assert_eq!(polar.cl_max().unwrap().aoa_deg, 12.0);
        let (best, ld) = polar.max_lift_to_drag().unwrap();
        assert_eq!(best.aoa_deg, 4.0);
        assert!((ld - 0.68 / 0.007).abs() < 1e-9);

        let slope = polar.lift_slope_per_deg(5.0).unwrap();
        assert!((slope - 0.11).abs() < 1e-9);

        let a0 = polar.zero_lift_aoa().unwrap();
        assert!((a0 - (-4.0 + 0.2 * 4.0 / 0.44)).abs() < 1e-9);
    }

    #[test]
    fn test_polar_csv() {
        let mut polar = Polar::new("x");
        polar.push(point(2.0, 0.4, 0.0));
        let csv = polar.to_csv();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("aoa_deg,reynolds,cl,cd,cm,l_over_d,converged")
        );
        assert_eq!(lines.next(), Some("2,1000000,0.4,0,,,true"));
    }
}
