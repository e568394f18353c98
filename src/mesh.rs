//! Gmsh script generation and mesher invocation.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

use crate::profile::Profile;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("invalid mesh settings: {0}")]
    InvalidSettings(String),
    #[error("profile needs at least 3 distinct points")]
    TooFewPoints,
    #[error("failed to launch gmsh: {0}")]
    Launch(#[source] std::io::Error),
    #[error("gmsh exited with {code:?}: {stderr}")]
    GmshFailed { code: Option<i32>, stderr: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryLayerSettings {
    /// First cell height in chords.
    pub first_height: f64,
    pub growth_ratio: f64,
    /// Total layer thickness in chords.
    pub thickness: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSettings {
    #[serde(default = "default_farfield_radius")]
    pub farfield_radius_chords: f64,
    #[serde(default = "default_airfoil_cell")]
    pub airfoil_cell_size: f64,
    #[serde(default = "default_farfield_cell")]
    pub farfield_cell_size: f64,
    /// Extrusion depth of the single-cell pseudo-2D mesh, in chords.
    #[serde(default = "default_extrude")]
    pub extrude_thickness: f64,
    #[serde(default)]
    pub boundary_layer: Option<BoundaryLayerSettings>,
    #[serde(default = "default_gmsh")]
    pub gmsh: String,
    #[serde(default = "default_threads")]
    pub threads: u32,
    #[serde(default)]
    pub run_gmsh: bool,
}

fn default_farfield_radius() -> f64 {
    20.0
}
fn default_airfoil_cell() -> f64 {
    0.01
}
fn default_farfield_cell() -> f64 {
    2.0
}
fn default_extrude() -> f64 {
    0.01
}
fn default_gmsh() -> String {
    "gmsh".to_string()
}
fn default_threads() -> u32 {
    1
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            farfield_radius_chords: default_farfield_radius(),
            airfoil_cell_size: default_airfoil_cell(),
            farfield_cell_size: default_farfield_cell(),
            extrude_thickness: default_extrude(),
            boundary_layer: None,
            gmsh: default_gmsh(),
            threads: default_threads(),
            run_gmsh: false,
        }
    }
}

impl MeshSettings {
    pub fn validate(&self) -> Result<(), MeshError> {
        let positive = [
            ("farfield_radius_chords", self.farfield_radius_chords),
            ("airfoil_cell_size", self.airfoil_cell_size),
            ("farfield_cell_size", self.farfield_cell_size),
            ("extrude_thickness", self.extrude_thickness),
        ];
        for (field, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(MeshError::InvalidSettings(format!(
                    "{} must be positive, got {}",
                    field, value
                )));
            }
        }
        if self.farfield_radius_chords <= 1.0 {
            return Err(MeshError::InvalidSettings(
                "farfield must enclose the airfoil (radius > 1 chord)".to_string(),
            ));
        }
        if let Some(bl) = &self.boundary_layer {
            if bl.first_height <= 0.0 || bl.thickness <= bl.first_height || bl.growth_ratio < 1.0 {
                return Err(MeshError::InvalidSettings(
                    "boundary layer needs first_height > 0, thickness > first_height, growth_ratio >= 1"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Build a Gmsh script for a circular-farfield pseudo-2D domain.
///
/// Physical groups: `farfield`, `airfoil`, `front`, `back`, `fluid`.
pub fn write_geo(profile: &Profile, settings: &MeshSettings) -> Result<String, MeshError> {
    settings.validate()?;
    let foil = profile.normalized();

    let mut pts = foil.points.clone();
    let closed = foil.is_closed(1e-9);
    if closed {
        pts.pop();
    }
    if pts.len() < 3 {
        return Err(MeshError::TooFewPoints);
    }
    let le = foil.leading_edge_index().min(pts.len() - 1);
    if le == 0 {
        return Err(MeshError::TooFewPoints);
    }

    let mut out = String::new();
    let _ = writeln!(out, "// {} - generated by airfoil-cfd", foil.name);
    let _ = writeln!(out, "SetFactory(\"Built-in\");");
    let _ = writeln!(out, "lc_foil = {};", settings.airfoil_cell_size);
    let _ = writeln!(out, "lc_far = {};", settings.farfield_cell_size);
    let _ = writeln!(out, "R = {};", settings.farfield_radius_chords);
    let _ = writeln!(out, "depth = {};", settings.extrude_thickness);
    out.push('\n');

    // airfoil points 1..=n
    for (i, p) in pts.iter().enumerate() {
        let _ = writeln!(out, "Point({}) = {{{}, {}, 0, lc_foil}};", i + 1, p.x, p.y);
    }
    let n = pts.len();
    let le_id = le + 1;

    let upper: Vec<String> = (1..=le_id).map(|i| i.to_string()).collect();
    let mut lower: Vec<String> = (le_id..=n).map(|i| i.to_string()).collect();
    if closed {
        lower.push("1".to_string());
    }
    let _ = writeln!(out, "Spline(1) = {{{}}};", upper.join(", "));
    let _ = writeln!(out, "Spline(2) = {{{}}};", lower.join(", "));
    let mut foil_curves = vec![1, 2];
    if !closed {
        let _ = writeln!(out, "Line(3) = {{{}, 1}};", n);
        foil_curves.push(3);
    }
    out.push('\n');

    // farfield circle centred on the quarter chord
    let c = n + 1;
    let _ = writeln!(out, "Point({}) = {{0.25, 0, 0, lc_far}};", c);
    let _ = writeln!(out, "Point({}) = {{0.25 + R, 0, 0, lc_far}};", c + 1);
    let _ = writeln!(out, "Point({}) = {{0.25, R, 0, lc_far}};", c + 2);
    let _ = writeln!(out, "Point({}) = {{0.25 - R, 0, 0, lc_far}};", c + 3);
    let _ = writeln!(out, "Point({}) = {{0.25, -R, 0, lc_far}};", c + 4);
    let far_curves = [11, 12, 13, 14];
    for (k, curve) in far_curves.iter().enumerate() {
        let start = c + 1 + k;
        let end = c + 1 + (k + 1) % 4;
        let _ = writeln!(out, "Circle({}) = {{{}, {}, {}}};", curve, start, c, end);
    }
    out.push('\n');

    let join = |ids: &[usize]| {
        ids.iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let _ = writeln!(out, "Curve Loop(1) = {{{}}};", join(&far_curves));
    let _ = writeln!(out, "Curve Loop(2) = {{{}}};", join(&foil_curves));
    let _ = writeln!(out, "Plane Surface(1) = {{1, 2}};");

    if let Some(bl) = &settings.boundary_layer {
        out.push('\n');
        let _ = writeln!(out, "Field[1] = BoundaryLayer;");
        let _ = writeln!(out, "Field[1].CurvesList = {{{}}};", join(&foil_curves));
        let _ = writeln!(out, "Field[1].Size = {};", bl.first_height);
        let _ = writeln!(out, "Field[1].Ratio = {};", bl.growth_ratio);
        let _ = writeln!(out, "Field[1].Thickness = {};", bl.thickness);
        let _ = writeln!(out, "Field[1].Quads = 1;");
        if !closed {
            let _ = writeln!(out, "Field[1].PointsList = {{1, {}}};", n);
        }
        let _ = writeln!(out, "BoundaryLayer Field = 1;");
    }

    out.push('\n');
    let _ = writeln!(
        out,
        "ext[] = Extrude {{0, 0, depth}} {{ Surface{{1}}; Layers{{1}}; Recombine; }};"
    );
    // lateral surfaces follow the boundary curve order: farfield loop, then airfoil loop
    let far_last = 2 + far_curves.len() - 1;
    let foil_first = far_last + 1;
    let foil_last = foil_first + foil_curves.len() - 1;
    let _ = writeln!(out, "Physical Surface(\"front\") = {{1}};");
    let _ = writeln!(out, "Physical Surface(\"back\") = {{ext[0]}};");
    let _ = writeln!(out, "Physical Volume(\"fluid\") = {{ext[1]}};");
    let _ = writeln!(
        out,
        "Physical Surface(\"farfield\") = {{ext[{{2:{}}}]}};",
        far_last
    );
    let _ = writeln!(
        out,
        "Physical Surface(\"airfoil\") = {{ext[{{{}:{}}}]}};",
        foil_first, foil_last
    );
    out.push('\n');
    let _ = writeln!(out, "Mesh.MshFileVersion = 2.2;");

    Ok(out)
}

/// Result of a gmsh run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshReport {
    pub msh_path: PathBuf,
    pub nodes: Option<u64>,
    pub elements: Option<u64>,
}

/// Last "N nodes M elements" summary printed by gmsh.
pub fn parse_mesh_stats(stdout: &str) -> Option<(u64, u64)> {
    stdout.lines().rev().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        tokens.windows(4).find_map(|w| {
            if w[1] == "nodes" && w[3] == "elements" {
                Some((w[0].parse().ok()?, w[2].parse().ok()?))
            } else {
                None
            }
        })
    })
}

/// Runs the external `gmsh` binary.
pub struct GmshMesher {
    executable: String,
    threads: u32,
}

impl GmshMesher {
    pub fn new(settings: &MeshSettings) -> Self {
        Self {
            executable: settings.gmsh.clone(),
            threads: settings.threads.max(1),
        }
    }

    pub async fn run(&self, geo: &Path, msh: &Path) -> Result<MeshReport, MeshError> {
        info!(geo = %geo.display(), msh = %msh.display(), "running gmsh");
        let output = Command::new(&self.executable)
            .arg(geo)
            .arg("-3")
            .arg("-format")
            .arg("msh22")
            .arg("-nt")
            .arg(self.threads.to_string())
            .arg("-o")
            .arg(msh)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(MeshError::Launch)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(code = ?output.status.code(), "gmsh failed");
            return Err(MeshError::GmshFailed {
                code: output.status.code(),
                stderr,
            });
        }

        let stats = parse_mesh_stats(&stdout);
        info!(nodes = ?stats.map(|s| s.0), elements = ?stats.map(|s| s.1), "mesh generated");
        Ok(MeshReport {
            msh_path: msh.to_path_buf(),
            nodes: stats.map(|s| s.0),
            elements: stats.map(|s| s.1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naca::{generate, NacaDesignation, NacaOptions};

    fn foil(closed: bool) -> Profile {
        generate(
            &NacaDesignation::parse("0012").unwrap(),
            &NacaOptions {
                points_per_surface: 11,
                cosine_spacing: true,
                closed_trailing_edge: closed,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_closed_profile_geo() {
        let geo = write_geo(&foil(true), &MeshSettings::default()).unwrap();
        // 21 points, duplicate trailing edge dropped
        assert!(geo.contains("Point(20) = {"));
        assert!(!geo.contains("Point(21) = {1"));
        assert!(geo.contains("Spline(1) = {1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11};"));
        assert!(geo.contains("Spline(2) = {11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 1};"));
        assert!(!geo.contains("Line(3)"));
        assert!(geo.contains("Curve Loop(2) = {1, 2};"));
        assert!(geo.contains("Physical Surface(\"farfield\") = {ext[{2:5}]};"));
        assert!(geo.contains("Physical Surface(\"airfoil\") = {ext[{6:7}]};"));
        assert!(geo.contains("Mesh.MshFileVersion = 2.2;"));
    }

    #[test]
    fn test_open_profile_gets_trailing_edge_line() {
        let geo = write_geo(&foil(false), &MeshSettings::default()).unwrap();
        assert!(geo.contains("Line(3) = {21, 1};"));
        assert!(geo.contains("Curve Loop(2) = {1, 2, 3};"));
        assert!(geo.contains("Physical Surface(\"airfoil\") = {ext[{6:8}]};"));
    }

    #[test]
    fn test_farfield_circle() {
        let geo = write_geo(&foil(true), &MeshSettings::default()).unwrap();
        assert!(geo.contains("R = 20;"));
        assert!(geo.contains("Circle(11) = {22, 21, 23};"));
        assert!(geo.contains("Circle(14) = {25, 21, 22};"));
    }

    #[test]
    fn test_boundary_layer_field() {
        let settings = MeshSettings {
            boundary_layer: Some(BoundaryLayerSettings {
                first_height: 1e-5,
                growth_ratio: 1.2,
                thickness: 0.02,
            }),
            ..MeshSettings::default()
        };
        let geo = write_geo(&foil(true), &settings).unwrap();
        assert!(geo.contains("Field[1] = BoundaryLayer;"));
        assert!(geo.contains("Field[1].Ratio = 1.2;"));
        assert!(geo.contains("BoundaryLayer Field = 1;"));
    }

    #[test]
    fn test_invalid_settings() {
        let settings = MeshSettings {
            farfield_radius_chords: 0.5,
            ..MeshSettings::default()
        };
        assert!(matches!(
            write_geo(&foil(true), &settings),
            Err(MeshError::InvalidSettings(_))
        ));
        let settings = MeshSettings {
            boundary_layer: Some(BoundaryLayerSettings {
                first_height: 0.1,
                growth_ratio: 1.1,
                thickness: 0.01,
            }),
            ..MeshSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_parse_mesh_stats() {
        let out = "Info    : Meshing 3D...\nInfo    : 1234 nodes 5678 elements\nInfo    : Writing 'x.msh'...\nInfo    : 4321 nodes 8765 elements\nInfo    : Done writing 'x.msh'\n";
        assert_eq!(parse_mesh_stats(out), Some((4321, 8765)));
        assert_eq!(parse_mesh_stats("nothing here"), None);
    }

    #[tokio::test]
    async fn test_missing_gmsh_binary() {
        let mesher = GmshMesher::new(&MeshSettings {
            gmsh: "definitely-not-gmsh-binary".to_string(),
            ..MeshSettings::default()
        });
        let err = mesher
            .run(Path::new("a.geo"), Path::new("a.msh"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Launch(_)));
    }
}
