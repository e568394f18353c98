//! 2D sketch generation for the CAD side of the pipeline.
//!
//! A [`Sketch`] is the airfoil placed at its final size and incidence in
//! millimetres. It can be written as an ASCII DXF, an SVG preview, or a
//! FreeCAD macro that rebuilds the sketch inside the CAD tool.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::profile::{Point2, Profile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SketchFormat {
    Dxf,
    Svg,
    #[serde(rename = "fcmacro")]
    FreeCad,
}

impl SketchFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Dxf => "dxf",
            Self::Svg => "svg",
            Self::FreeCad => "FCMacro",
        }
    }
}

impl std::str::FromStr for SketchFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dxf" => Ok(Self::Dxf),
            "svg" => Ok(Self::Svg),
            "fcmacro" | "freecad" => Ok(Self::FreeCad),
            other => Err(format!("unknown sketch format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SketchOptions {
    #[serde(default = "default_chord_mm")]
    pub chord_mm: f64,
    #[serde(default)]
    pub aoa_deg: f64,
    /// Curves as splines through the points instead of polylines.
    #[serde(default = "default_true")]
    pub spline: bool,
}

fn default_chord_mm() -> f64 {
    1000.0
}

fn default_true() -> bool {
    true
}

impl Default for SketchOptions {
    fn default() -> Self {
        Self {
            chord_mm: default_chord_mm(),
            aoa_deg: 0.0,
            spline: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SketchEntity {
    Polyline { points: Vec<Point2> },
    Spline { points: Vec<Point2> },
    Line { start: Point2, end: Point2 },
}

impl SketchEntity {
    pub fn points(&self) -> Vec<Point2> {
        match self {
            Self::Polyline { points } | Self::Spline { points } => points.clone(),
            Self::Line { start, end } => vec![*start, *end],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sketch {
    pub name: String,
    pub entities: Vec<SketchEntity>,
}

impl Sketch {
    /// Normalize, pitch about the quarter chord, then scale to millimetres.
    pub fn from_profile(profile: &Profile, opts: &SketchOptions) -> Self {
        let placed = place_profile(profile, opts.chord_mm, opts.aoa_deg);
        let le = placed.leading_edge_index();

        let upper: Vec<Point2> = placed.points[..=le].to_vec();
        let lower: Vec<Point2> = placed.points[le..].to_vec();
        let make = |points: Vec<Point2>| {
            if opts.spline {
                SketchEntity::Spline { points }
            } else {
                SketchEntity::Polyline { points }
            }
        };

        let mut entities = vec![make(upper), make(lower)];
        if !placed.is_closed(1e-9 * opts.chord_mm.max(1.0)) {
            if let (Some(&last), Some(&first)) = (placed.points.last(), placed.points.first()) {
                entities.push(SketchEntity::Line {
                    start: last,
                    end: first,
                });
            }
        }

        Self {
            name: profile.name.clone(),
            entities,
        }
    }

    /// Bounding box as (min, max).
    pub fn bounds(&self) -> (Point2, Point2) {
        let mut min = Point2::new(f64::INFINITY, f64::INFINITY);
        let mut max = Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in self.entities.iter().flat_map(|e| e.points()) {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
        }
        (min, max)
    }

    /// ASCII DXF R12. Splines are written as polylines through their fit points.
    pub fn to_dxf(&self) -> String {
        let mut out = String::new();
        out.push_str("0\nSECTION\n2\nHEADER\n9\n$ACADVER\n1\nAC1009\n9\n$INSUNITS\n70\n4\n0\nENDSEC\n");
        out.push_str("0\nSECTION\n2\nTABLES\n0\nTABLE\n2\nLAYER\n70\n1\n");
        out.push_str("0\nLAYER\n2\nAIRFOIL\n70\n0\n62\n7\n6\nCONTINUOUS\n0\nENDTAB\n0\nENDSEC\n");
        out.push_str("0\nSECTION\n2\nENTITIES\n");
        for entity in &self.entities {
            match entity {
                SketchEntity::Line { start, end } => {
                    let _ = write!(
                        out,
                        "0\nLINE\n8\nAIRFOIL\n10\n{}\n20\n{}\n30\n0.0\n11\n{}\n21\n{}\n31\n0.0\n",
                        start.x, start.y, end.x, end.y
                    );
                }
                SketchEntity::Polyline { points } | SketchEntity::Spline { points } => {
                    out.push_str("0\nPOLYLINE\n8\nAIRFOIL\n66\n1\n70\n0\n");
                    for p in points {
                        let _ = write!(
                            out,
                            "0\nVERTEX\n8\nAIRFOIL\n10\n{}\n20\n{}\n30\n0.0\n",
                            p.x, p.y
                        );
                    }
                    out.push_str("0\nSEQEND\n8\nAIRFOIL\n");
                }
            }
        }
        out.push_str("0\nENDSEC\n0\nEOF\n");
        out
    }

    /// SVG preview with y pointing up.
    pub fn to_svg(&self) -> String {
        let (min, max) = self.bounds();
        let width = (max.x - min.x).max(1e-9);
        let height = (max.y - min.y).max(1e-9);
        let pad = 0.05 * width.max(height);
        let stroke = 0.002 * width;

        let mut out = String::new();
        let _ = writeln!(
            out,
            r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="{} {} {} {}">"#,
            min.x - pad,
            -max.y - pad,
            width + 2.0 * pad,
            height + 2.0 * pad
        );
        let _ = writeln!(out, "  <title>{}</title>", escape_xml(&self.name));
        for entity in &self.entities {
            let pts: Vec<String> = entity
                .points()
                .iter()
                .map(|p| format!("{},{}", p.x, -p.y))
                .collect();
            let _ = writeln!(
                out,
                r#"  <polyline fill="none" stroke="black" stroke-width="{}" points="{}"/>"#,
                stroke,
                pts.join(" ")
            );
        }
        out.push_str("</svg>\n");
        out
    }

    /// FreeCAD macro creating a `Sketcher::SketchObject` named after the profile.
    pub fn to_freecad_macro(&self) -> String {
        let mut out = String::new();
        out.push_str("import FreeCAD as App\nimport Part\nimport Sketcher\n\n");
        out.push_str("doc = App.ActiveDocument or App.newDocument(\"Airfoil\")\n");
        let _ = writeln!(
            out,
            "sketch = doc.addObject(\"Sketcher::SketchObject\", \"{}\")",
            python_identifier(&self.name)
        );
        for entity in &self.entities {
            match entity {
                SketchEntity::Line { start, end } => {
                    let _ = writeln!(
                        out,
                        "sketch.addGeometry(Part.LineSegment(App.Vector({}, {}, 0), App.Vector({}, {}, 0)), False)",
                        start.x, start.y, end.x, end.y
                    );
                }
                SketchEntity::Spline { points } => {
                    out.push_str("pts = [\n");
                    for p in points {
                        let _ = writeln!(out, "    App.Vector({}, {}, 0),", p.x, p.y);
                    }
                    out.push_str("]\ncurve = Part.BSplineCurve()\ncurve.interpolate(pts)\n");
                    out.push_str("sketch.addGeometry(curve, False)\n");
                }
                SketchEntity::Polyline { points } => {
                    for w in points.windows(2) {
                        let _ = writeln!(
                            out,
                            "sketch.addGeometry(Part.LineSegment(App.Vector({}, {}, 0), App.Vector({}, {}, 0)), False)",
                            w[0].x, w[0].y, w[1].x, w[1].y
                        );
                    }
                }
            }
        }
        out.push_str("doc.recompute()\n");
        out
    }

    pub fn render(&self, format: SketchFormat) -> String {
        match format {
            SketchFormat::Dxf => self.to_dxf(),
            SketchFormat::Svg => self.to_svg(),
            SketchFormat::FreeCad => self.to_freecad_macro(),
        }
    }

    /// Write one file per format into `dir`, named after the profile slug.
    pub fn write(&self, dir: &Path, formats: &[SketchFormat]) -> std::io::Result<Vec<PathBuf>> {
        self.write_named(dir, &crate::profile::slugify(&self.name), formats)
    }

    /// Like [`Sketch::write`] with an explicit file stem.
    pub fn write_named(
        &self,
        dir: &Path,
        stem: &str,
        formats: &[SketchFormat],
    ) -> std::io::Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        let mut written = Vec::new();
        for format in formats {
            let path = dir.join(format!("{}.{}", stem, format.extension()));
            fs::write(&path, self.render(*format))?;
            info!(path = %path.display(), ?format, "sketch written");
            written.push(path);
        }
        Ok(written)
    }
}

/// Unit chord, pitched about the quarter chord, scaled to `chord`.
pub fn place_profile(profile: &Profile, chord: f64, aoa_deg: f64) -> Profile {
    profile
        .normalized()
        .rotated_about(Point2::new(0.25, 0.0), aoa_deg)
        .scaled(chord)
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn python_identifier(name: &str) -> String {
    let mut id: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if id.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        id.insert(0, '_');
    }
    id
}
