//! Freestream conditions and the solver-side case files.
//!
//! Incidence is applied to the freestream, not the geometry, so one mesh
//! serves a whole polar sweep.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum CaseError {
    #[error("invalid flow conditions: {0}")]
    Invalid(String),
    #[error("failed to write case files: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConditions {
    pub reynolds: f64,
    pub aoa_deg: f64,
    pub chord_m: f64,
    /// Depth of the pseudo-2D domain.
    pub span_m: f64,
    pub density: f64,
    pub kinematic_viscosity: f64,
}

impl FlowConditions {
    pub fn validate(&self) -> Result<(), CaseError> {
        let positive = [
            ("reynolds", self.reynolds),
            ("chord_m", self.chord_m),
            ("span_m", self.span_m),
            ("density", self.density),
            ("kinematic_viscosity", self.kinematic_viscosity),
        ];
        for (field, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(CaseError::Invalid(format!(
                    "{} must be positive, got {}",
                    field, value
                )));
            }
        }
        if !self.aoa_deg.is_finite() || self.aoa_deg.abs() >= 90.0 {
            return Err(CaseError::Invalid(format!(
                "angle of attack {} outside (-90, 90)",
                self.aoa_deg
            )));
        }
        Ok(())
    }

    /// Freestream speed from Re = U c / nu.
    pub fn velocity(&self) -> f64 {
        self.reynolds * self.kinematic_viscosity / self.chord_m
    }

    pub fn freestream(&self) -> [f64; 3] {
        let u = self.velocity();
        let (s, c) = self.aoa_deg.to_radians().sin_cos();
        [u * c, u * s, 0.0]
    }

    pub fn lift_direction(&self) -> [f64; 3] {
        let (s, c) = self.aoa_deg.to_radians().sin_cos();
        [-s, c, 0.0]
    }

    pub fn drag_direction(&self) -> [f64; 3] {
        let (s, c) = self.aoa_deg.to_radians().sin_cos();
        [c, s, 0.0]
    }

    pub fn dynamic_pressure(&self) -> f64 {
        0.5 * self.density * self.velocity().powi(2)
    }

    pub fn reference_area(&self) -> f64 {
        self.chord_m * self.span_m
    }

    /// `#include`-able dictionary with the freestream values.
    pub fn render_freestream_include(&self) -> String {
        let mut out = String::new();
        out.push_str(FOAM_BANNER);
        let _ = writeln!(out, "aoa             {};", self.aoa_deg);
        let _ = writeln!(out, "Re              {};", self.reynolds);
        let _ = writeln!(out, "magUInf         {};", self.velocity());
        let _ = writeln!(out, "Uinf            {};", vector(self.freestream()));
        let _ = writeln!(out, "nu              {};", self.kinematic_viscosity);
        let _ = writeln!(out, "rhoInf          {};", self.density);
        let _ = writeln!(out, "liftDir         {};", vector(self.lift_direction()));
        let _ = writeln!(out, "dragDir         {};", vector(self.drag_direction()));
        let _ = writeln!(out, "lRef            {};", self.chord_m);
        let _ = writeln!(out, "Aref            {};", self.reference_area());
        out
    }

    /// forceCoeffs function object for the given wall patches.
    pub fn render_force_coeffs(&self, patches: &[&str]) -> String {
        let mut out = String::new();
        out.push_str(FOAM_BANNER);
        out.push_str("forceCoeffs\n{\n");
        out.push_str("    type            forceCoeffs;\n");
        out.push_str("    libs            (forces);\n");
        out.push_str("    writeControl    timeStep;\n");
        out.push_str("    writeInterval   1;\n");
        let _ = writeln!(out, "    patches         ({});", patches.join(" "));
        out.push_str("    rho             rhoInf;\n");
        let _ = writeln!(out, "    rhoInf          {};", self.density);
        let _ = writeln!(out, "    liftDir         {};", vector(self.lift_direction()));
        let _ = writeln!(out, "    dragDir         {};", vector(self.drag_direction()));
        out.push_str("    CofR            (0.25 0 0);\n");
        out.push_str("    pitchAxis       (0 0 1);\n");
        let _ = writeln!(out, "    magUInf         {};", self.velocity());
        let _ = writeln!(out, "    lRef            {};", self.chord_m);
        let _ = writeln!(out, "    Aref            {};", self.reference_area());
        out.push_str("}\n");
        out
    }

    /// Writes `system/forceCoeffs`, `constant/freestream` and `case.json`.
    pub fn write_case_files(&self, dir: &Path) -> Result<Vec<PathBuf>, CaseError> {
        self.validate()?;
        let system = dir.join("system");
        let constant = dir.join("constant");
        fs::create_dir_all(&system)?;
        fs::create_dir_all(&constant)?;

        let files = vec![
            (system.join("forceCoeffs"), self.render_force_coeffs(&["airfoil"])),
            (constant.join("freestream"), self.render_freestream_include()),
            (
                dir.join("case.json"),
                serde_json::to_string_pretty(self)
                    .map_err(|e| CaseError::Invalid(e.to_string()))?,
            ),
        ];
        let mut written = Vec::with_capacity(files.len());
        for (path, body) in files {
            fs::write(&path, body)?;
            written.push(path);
        }
        info!(
            dir = %dir.display(),
            aoa = self.aoa_deg,
            velocity = self.velocity(),
            "case files written"
        );
        Ok(written)
    }
}

const FOAM_BANNER: &str = "// generated by airfoil-cfd\n\n";

fn vector(v: [f64; 3]) -> String {
    let clean = |x: f64| if x.abs() < 1e-15 { 0.0 } else { x };
    format!("({} {} {})", clean(v[0]), clean(v[1]), clean(v[2]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn conditions(aoa: f64) -> FlowConditions {
        FlowConditions {
            reynolds: 1.0e6,
            aoa_deg: aoa,
            chord_m: 1.0,
            span_m: 0.01,
            density: 1.225,
            kinematic_viscosity: 1.5e-5,
        }
    }

    #[test]
    fn test_velocity_from_reynolds() {
        let c = conditions(0.0);
        assert!((c.velocity() - 15.0).abs() < 1e-9);
        assert!((c.dynamic_pressure() - 0.5 * 1.225 * 225.0).abs() < 1e-9);
        assert!((c.reference_area() - 0.01).abs() < 1e-15);
    }

    #[test]
    fn test_directions_follow_incidence() {
        let c = conditions(90.0 - 1e-9);
        assert!(c.validate().is_ok());
        let c = conditions(30.0);
        let u = c.freestream();
        assert!((u[1] / u[0] - 30f64.to_radians().tan()).abs() < 1e-12);
        let l = c.lift_direction();
        let d = c.drag_direction();
        assert!((l[0] * d[0] + l[1] * d[1]).abs() < 1e-12);
        assert!(l[1] > 0.0 && l[0] < 0.0);
    }

    #[test]
    fn test_validate() {
        let mut c = conditions(5.0);
        assert!(c.validate().is_ok());
        c.reynolds = 0.0;
        assert!(matches!(c.validate(), Err(CaseError::Invalid(_))));
        let c = conditions(95.0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_force_coeffs_dictionary() {
        let text = conditions(0.0).render_force_coeffs(&["airfoil", "flap"]);
        assert!(text.contains("patches         (airfoil flap);"));
        assert!(text.contains("liftDir         (0 1 0);"));
        assert!(text.contains("dragDir         (1 0 0);"));
        assert!(text.contains("magUInf         15"));
    }

    #[test]
    fn test_write_case_files() {
        let dir = tempdir().unwrap();
        let written = conditions(4.0).write_case_files(dir.path()).unwrap();
        assert_eq!(written.len(), 3);
        assert!(dir.path().join("system/forceCoeffs").exists());
        let json = std::fs::read_to_string(dir.path().join("case.json")).unwrap();
        let back: FlowConditions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.aoa_deg, 4.0);
    }
}
