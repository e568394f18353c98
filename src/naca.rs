//! NACA 4- and 5-digit section generator.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use tracing::info;

use crate::profile::{Point2, Profile};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NacaError {
    #[error("'{0}' is not a 4- or 5-digit NACA designation")]
    InvalidLength(String),
    #[error("'{0}' contains non-digit characters")]
    NotDigits(String),
    #[error("thickness must be greater than zero")]
    ZeroThickness,
    #[error("camber of {0}% needs a non-zero camber position")]
    MissingCamberPosition(u32),
    #[error("unsupported 5-digit camber line {0}")]
    UnsupportedSeries(String),
    #[error("need at least 3 points per surface, got {0}")]
    TooFewPoints(usize),
}

/// A parsed NACA designation. Fractions are of chord.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NacaDesignation {
    FourDigit {
        max_camber: f64,
        camber_position: f64,
        thickness: f64,
    },
    FiveDigit {
        design_cl: f64,
        series: u32,
        reflex: bool,
        thickness: f64,
    },
}

impl NacaDesignation {
    /// Accepts `NACA 2412`, `naca23012`, `0012`.
    pub fn parse(input: &str) -> Result<Self, NacaError> {
        let trimmed = input.trim();
        let digits = trimmed
            .strip_prefix("NACA")
            .or_else(|| trimmed.strip_prefix("naca"))
            .or_else(|| trimmed.strip_prefix("Naca"))
            .unwrap_or(trimmed)
            .trim()
            .trim_start_matches('-')
            .trim();

        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(NacaError::NotDigits(input.to_string()));
        }
        let d: Vec<u32> = digits.chars().filter_map(|c| c.to_digit(10)).collect();

        match d.len() {
            4 => {
                let m = d[0];
                let p = d[1];
                let t = d[2] * 10 + d[3];
                if t == 0 {
                    return Err(NacaError::ZeroThickness);
                }
                if m > 0 && p == 0 {
                    return Err(NacaError::MissingCamberPosition(m));
                }
                Ok(Self::FourDigit {
                    max_camber: m as f64 / 100.0,
                    camber_position: p as f64 / 10.0,
                    thickness: t as f64 / 100.0,
                })
            }
            5 => {
                let l = d[0];
                let p = d[1];
                let q = d[2];
                let t = d[3] * 10 + d[4];
                if t == 0 {
                    return Err(NacaError::ZeroThickness);
                }
                let reflex = match q {
                    0 => false,
                    1 => true,
                    _ => return Err(NacaError::UnsupportedSeries(digits[..3].to_string())),
                };
                let supported = if reflex { (2..=5).contains(&p) } else { (1..=5).contains(&p) };
                if l == 0 || !supported {
                    return Err(NacaError::UnsupportedSeries(digits[..3].to_string()));
                }
                Ok(Self::FiveDigit {
                    design_cl: 0.15 * l as f64,
                    series: p,
                    reflex,
                    thickness: t as f64 / 100.0,
                })
            }
            _ => Err(NacaError::InvalidLength(input.to_string())),
        }
    }

    pub fn thickness(&self) -> f64 {
        match *self {
            Self::FourDigit { thickness, .. } | Self::FiveDigit { thickness, .. } => thickness,
        }
    }

    /// Camber line height and slope at x.
    fn camber(&self, x: f64) -> (f64, f64) {
        match *self {
            Self::FourDigit {
                max_camber: m,
                camber_position: p,
                ..
            } => {
                if m == 0.0 || p == 0.0 {
                    return (0.0, 0.0);
                }
                if x < p {
                    (
                        m / (p * p) * (2.0 * p * x - x * x),
                        2.0 * m / (p * p) * (p - x),
                    )
                } else {
                    let q = (1.0 - p) * (1.0 - p);
                    (
                        m / q * ((1.0 - 2.0 * p) + 2.0 * p * x - x * x),
                        2.0 * m / q * (p - x),
                    )
                }
            }
            Self::FiveDigit {
                design_cl,
                series,
                reflex,
                ..
            } => {
                let (r, k1, k2_k1) = five_digit_constants(series, reflex);
                let k1 = k1 * design_cl / 0.3;
                let r3 = r * r * r;
                if !reflex {
                    if x < r {
                        (
                            k1 / 6.0 * (x * x * x - 3.0 * r * x * x + r * r * (3.0 - r) * x),
                            k1 / 6.0 * (3.0 * x * x - 6.0 * r * x + r * r * (3.0 - r)),
                        )
                    } else {
                        (k1 * r3 / 6.0 * (1.0 - x), -k1 * r3 / 6.0)
                    }
                } else {
                    let tail = k2_k1 * (1.0 - r).powi(3);
                    if x < r {
                        (
                            k1 / 6.0 * ((x - r).powi(3) - tail * x - r3 * x + r3),
                            k1 / 6.0 * (3.0 * (x - r).powi(2) - tail - r3),
                        )
                    } else {
                        (
                            k1 / 6.0 * (k2_k1 * (x - r).powi(3) - tail * x - r3 * x + r3),
                            k1 / 6.0 * (3.0 * k2_k1 * (x - r).powi(2) - tail - r3),
                        )
                    }
                }
            }
        }
    }
}

impl fmt::Display for NacaDesignation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::FourDigit {
                max_camber,
                camber_position,
                thickness,
            } => write!(
                f,
                "NACA {}{}{:02}",
                (max_camber * 100.0).round() as u32,
                (camber_position * 10.0).round() as u32,
                (thickness * 100.0).round() as u32
            ),
            Self::FiveDigit {
                design_cl,
                series,
                reflex,
                thickness,
            } => write!(
                f,
                "NACA {}{}{}{:02}",
                (design_cl / 0.15).round() as u32,
                series,
                u32::from(reflex),
                (thickness * 100.0).round() as u32
            ),
        }
    }
}

/// (r, k1, k2/k1) for design CL = 0.3.
fn five_digit_constants(series: u32, reflex: bool) -> (f64, f64, f64) {
    match (series, reflex) {
        (1, false) => (0.0580, 361.400, 0.0),
        (2, false) => (0.1260, 51.640, 0.0),
        (3, false) => (0.2025, 15.957, 0.0),
        (4, false) => (0.2900, 6.643, 0.0),
        (5, false) => (0.3910, 3.230, 0.0),
        (2, true) => (0.1300, 51.990, 0.000764),
        (3, true) => (0.2170, 15.793, 0.00677),
        (4, true) => (0.3180, 6.520, 0.0303),
        _ => (0.4410, 3.191, 0.1355),
    }
}

/// Generator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NacaOptions {
    #[serde(default = "default_points_per_surface")]
    pub points_per_surface: usize,
    #[serde(default = "default_true")]
    pub cosine_spacing: bool,
    #[serde(default = "default_true")]
    pub closed_trailing_edge: bool,
}

fn default_points_per_surface() -> usize {
    100
}

fn default_true() -> bool {
    true
}

impl Default for NacaOptions {
    fn default() -> Self {
        Self {
            points_per_surface: default_points_per_surface(),
            cosine_spacing: true,
            closed_trailing_edge: true,
        }
    }
}

/// Half thickness at x for thickness ratio t.
fn half_thickness(x: f64, t: f64, closed_te: bool) -> f64 {
    let a4 = if closed_te { -0.1036 } else { -0.1015 };
    5.0 * t
        * (0.2969 * x.sqrt() - 0.1260 * x - 0.3516 * x * x + 0.2843 * x.powi(3) + a4 * x.powi(4))
}

/// Build the section in Selig order with `2 * points_per_surface - 1` points.
pub fn generate(designation: &NacaDesignation, opts: &NacaOptions) -> Result<Profile, NacaError> {
    let n = opts.points_per_surface;
    if n < 3 {
        return Err(NacaError::TooFewPoints(n));
    }

    let t = designation.thickness();
    let mut upper = Vec::with_capacity(n);
    let mut lower = Vec::with_capacity(n);

    for i in 0..n {
        let s = i as f64 / (n - 1) as f64;
        let x = if opts.cosine_spacing {
            0.5 * (1.0 - (PI * s).cos())
        } else {
            s
        };
        let yt = half_thickness(x, t, opts.closed_trailing_edge);
        let (yc, dyc) = designation.camber(x);
        let theta = dyc.atan();
        let (sin_t, cos_t) = theta.sin_cos();
        upper.push(Point2::new(x - yt * sin_t, yc + yt * cos_t));
        lower.push(Point2::new(x + yt * sin_t, yc - yt * cos_t));
    }

    let mut points: Vec<Point2> = upper.into_iter().rev().collect();
    points.extend(lower.into_iter().skip(1));

    let name = designation.to_string();
    info!(name = %name, points = points.len(), "generated NACA section");
    Ok(Profile::new(name, points))
}
