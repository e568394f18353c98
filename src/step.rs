//! STEP (ISO 10303-21, AP214) export of an extruded wing section.
//!
//! The section is written as a single faceted B-rep: two planar caps and one
//! quad per boundary segment. Faceted solids import cleanly into every CAD
//! tool and every mesher that reads STEP.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::profile::{Point2, Profile};
use crate::sketch::place_profile;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("section needs at least 3 distinct points, got {0}")]
    TooFewPoints(usize),
    #[error("span must be positive, got {0}")]
    InvalidSpan(f64),
    #[error("chord must be positive, got {0}")]
    InvalidChord(f64),
    #[error("failed to write STEP file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOptions {
    #[serde(default = "default_chord_mm")]
    pub chord_mm: f64,
    #[serde(default = "default_span_mm")]
    pub span_mm: f64,
    #[serde(default)]
    pub aoa_deg: f64,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub organization: String,
}

fn default_chord_mm() -> f64 {
    1000.0
}

fn default_span_mm() -> f64 {
    10.0
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            chord_mm: default_chord_mm(),
            span_mm: default_span_mm(),
            aoa_deg: 0.0,
            author: String::new(),
            organization: String::new(),
        }
    }
}

/// Accumulates `#n=ENTITY;` records with sequential ids.
struct StepWriter {
    records: Vec<String>,
}

impl StepWriter {
    fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    fn add(&mut self, entity: impl Into<String>) -> usize {
        self.records.push(entity.into());
        self.records.len()
    }

    fn point(&mut self, x: f64, y: f64, z: f64) -> usize {
        self.add(format!(
            "CARTESIAN_POINT('',({},{},{}))",
            real(x),
            real(y),
            real(z)
        ))
    }

    fn face(&mut self, loop_points: &[usize]) -> usize {
        let poly = self.add(format!("POLY_LOOP('',({}))", refs(loop_points)));
        let bound = self.add(format!("FACE_OUTER_BOUND('',#{},.T.)", poly));
        self.add(format!("FACE('',(#{}))", bound))
    }
}

/// STEP reals always carry a decimal point.
fn real(v: f64) -> String {
    let v = if v == 0.0 { 0.0 } else { v };
    let s = format!("{}", v);
    if s.contains('.') || s.contains('E') || s.contains('e') || !v.is_finite() {
        s
    } else {
        format!("{}.", s)
    }
}

fn refs(ids: &[usize]) -> String {
    ids.iter()
        .map(|id| format!("#{}", id))
        .collect::<Vec<_>>()
        .join(",")
}

fn quote(s: &str) -> String {
    s.replace('\'', "''")
}

/// Distinct boundary points in counter-clockwise order.
fn boundary(profile: &Profile) -> Vec<Point2> {
    let mut pts: Vec<Point2> = Vec::with_capacity(profile.points.len());
    for p in &profile.points {
        if pts.last().map_or(true, |q: &Point2| q.distance(p) > 1e-9) {
            pts.push(*p);
        }
    }
    if pts.len() > 1 {
        if let (Some(first), Some(last)) = (pts.first(), pts.last()) {
            if first.distance(last) <= 1e-9 {
                pts.pop();
            }
        }
    }
    if Profile::new("", pts.clone()).signed_area() < 0.0 {
        pts.reverse();
    }
    pts
}

/// Render the extruded section as a STEP file.
pub fn export_step(profile: &Profile, opts: &StepOptions) -> Result<String, StepError> {
    if !opts.span_mm.is_finite() || opts.span_mm <= 0.0 {
        return Err(StepError::InvalidSpan(opts.span_mm));
    }
    if !opts.chord_mm.is_finite() || opts.chord_mm <= 0.0 {
        return Err(StepError::InvalidChord(opts.chord_mm));
    }
    if profile.points.len() < 3 {
        return Err(StepError::TooFewPoints(profile.points.len()));
    }
    let section = boundary(&place_profile(profile, opts.chord_mm, opts.aoa_deg));
    if section.len() < 3 {
        return Err(StepError::TooFewPoints(section.len()));
    }

    let name = quote(&profile.name);
    let mut w = StepWriter::new();

    let app = w.add("APPLICATION_CONTEXT('automotive design')");
    w.add(format!(
        "APPLICATION_PROTOCOL_DEFINITION('international standard','automotive_design',2000,#{})",
        app
    ));
    let prod_ctx = w.add(format!("PRODUCT_CONTEXT('',#{},'mechanical')", app));
    let product = w.add(format!("PRODUCT('{0}','{0}','',(#{1}))", name, prod_ctx));
    w.add(format!(
        "PRODUCT_RELATED_PRODUCT_CATEGORY('part',$,(#{}))",
        product
    ));
    let formation = w.add(format!("PRODUCT_DEFINITION_FORMATION('','',#{})", product));
    let def_ctx = w.add(format!(
        "PRODUCT_DEFINITION_CONTEXT('part definition',#{},'design')",
        app
    ));
    let definition = w.add(format!(
        "PRODUCT_DEFINITION('design','',#{},#{})",
        formation, def_ctx
    ));
    let shape = w.add(format!("PRODUCT_DEFINITION_SHAPE('','',#{})", definition));

    let length = w.add("(LENGTH_UNIT()NAMED_UNIT(*)SI_UNIT(.MILLI.,.METRE.))");
    let angle = w.add("(NAMED_UNIT(*)PLANE_ANGLE_UNIT()SI_UNIT($,.RADIAN.))");
    let solid_angle = w.add("(NAMED_UNIT(*)SI_UNIT($,.STERADIAN.)SOLID_ANGLE_UNIT())");
    let uncertainty = w.add(format!(
        "UNCERTAINTY_MEASURE_WITH_UNIT(LENGTH_MEASURE(1.E-07),#{},'distance_accuracy_value','confusion accuracy')",
        length
    ));
    let geom_ctx = w.add(format!(
        "(GEOMETRIC_REPRESENTATION_CONTEXT(3)GLOBAL_UNCERTAINTY_ASSIGNED_CONTEXT((#{}))GLOBAL_UNIT_ASSIGNED_CONTEXT((#{},#{},#{}))REPRESENTATION_CONTEXT('Context #1','3D Context with UNIT and UNCERTAINTY'))",
        uncertainty, length, angle, solid_angle
    ));

    let origin = w.point(0.0, 0.0, 0.0);
    let z_axis = w.add("DIRECTION('',(0.,0.,1.))");
    let x_axis = w.add("DIRECTION('',(1.,0.,0.))");
    let placement = w.add(format!(
        "AXIS2_PLACEMENT_3D('',#{},#{},#{})",
        origin, z_axis, x_axis
    ));

    let root: Vec<usize> = section.iter().map(|p| w.point(p.x, p.y, 0.0)).collect();
    let tip: Vec<usize> = section
        .iter()
        .map(|p| w.point(p.x, p.y, opts.span_mm))
        .collect();

    let n = section.len();
    let mut faces = Vec::with_capacity(n + 2);
    let root_loop: Vec<usize> = root.iter().rev().copied().collect();
    faces.push(w.face(&root_loop));
    faces.push(w.face(&tip));
    for i in 0..n {
        let j = (i + 1) % n;
        faces.push(w.face(&[root[i], root[j], tip[j], tip[i]]));
    }

    let shell = w.add(format!("CLOSED_SHELL('',({}))", refs(&faces)));
    let brep = w.add(format!("FACETED_BREP('{}',#{})", name, shell));
    let rep = w.add(format!(
        "FACETED_BREP_SHAPE_REPRESENTATION('',(#{},#{}),#{})",
        brep, placement, geom_ctx
    ));
    w.add(format!("SHAPE_DEFINITION_REPRESENTATION(#{},#{})", shape, rep));

    let mut out = String::new();
    out.push_str("ISO-10303-21;\nHEADER;\n");
    let _ = writeln!(
        out,
        "FILE_DESCRIPTION(('Extruded airfoil section {}'),'2;1');",
        name
    );
    let _ = writeln!(
        out,
        "FILE_NAME('{}.step','{}',('{}'),('{}'),'airfoil-cfd {}','airfoil-cfd','');",
        crate::profile::slugify(&profile.name),
        Utc::now().format("%Y-%m-%dT%H:%M:%S"),
        quote(&opts.author),
        quote(&opts.organization),
        env!("CARGO_PKG_VERSION")
    );
    out.push_str("FILE_SCHEMA(('AUTOMOTIVE_DESIGN { 1 0 10303 214 1 1 1 1 }'));\nENDSEC;\nDATA;\n");
    for (i, record) in w.records.iter().enumerate() {
        let _ = writeln!(out, "#{}={};", i + 1, record);
    }
    out.push_str("ENDSEC;\nEND-ISO-10303-21;\n");

    info!(
        name = %profile.name,
        entities = w.records.len(),
        faces = faces.len(),
        "STEP section built"
    );
    Ok(out)
}

pub fn write_step<P: AsRef<Path>>(
    path: P,
    profile: &Profile,
    opts: &StepOptions,
) -> Result<(), StepError> {
    let text = export_step(profile, opts)?;
    fs::write(path.as_ref(), text)?;
    info!(path = %path.as_ref().display(), "STEP file written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naca::{generate, NacaDesignation, NacaOptions};

    fn section(closed: bool) -> Profile {
        let d = NacaDesignation::parse("2412").unwrap();
        generate(
            &d,
            &NacaOptions {
                points_per_surface: 11,
                cosine_spacing: true,
                closed_trailing_edge: closed,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_real_formatting() {
        assert_eq!(real(0.0), "0.");
        assert_eq!(real(-0.0), "0.");
        assert_eq!(real(12.0), "12.");
        assert_eq!(real(-3.5), "-3.5");
        assert_eq!(real(1e-7), "0.0000001");
    }

    #[test]
    fn test_header_and_trailer() {
        let text = export_step(&section(true), &StepOptions::default()).unwrap();
        assert!(text.starts_with("ISO-10303-21;\nHEADER;\n"));
        assert!(text.contains("AUTOMOTIVE_DESIGN"));
        assert!(text.ends_with("ENDSEC;\nEND-ISO-10303-21;\n"));
    }

    #[test]
    fn test_closed_section_face_count() {
        // 21 points, closed: the duplicate trailing edge point is dropped
        let text = export_step(&section(true), &StepOptions::default()).unwrap();
        assert_eq!(text.matches("=POLY_LOOP(").count(), 20 + 2);
        assert_eq!(text.matches("=FACE(").count(), 22);
        assert_eq!(text.matches("=CLOSED_SHELL(").count(), 1);
        assert_eq!(text.matches("=CARTESIAN_POINT(").count(), 1 + 2 * 20);
    }

    #[test]
    fn test_open_section_keeps_trailing_edge_face() {
        let text = export_step(&section(false), &StepOptions::default()).unwrap();
        assert_eq!(text.matches("=POLY_LOOP(").count(), 21 + 2);
    }

    #[test]
    fn test_entity_ids_are_sequential() {
        let text = export_step(&section(true), &StepOptions::default()).unwrap();
        let ids: Vec<usize> = text
            .lines()
            .filter(|l| l.starts_with('#'))
            .map(|l| l[1..l.find('=').unwrap()].parse().unwrap())
            .collect();
        assert_eq!(ids.first(), Some(&1));
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(*id, i + 1);
        }
    }

    #[test]
    fn test_span_reaches_tip() {
        let opts = StepOptions {
            span_mm: 250.0,
            ..StepOptions::default()
        };
        let text = export_step(&section(true), &opts).unwrap();
        assert!(text.contains(",250.))"));
    }

    #[test]
    fn test_boundary_is_counter_clockwise() {
        let mut p = section(true);
        p.points.reverse();
        let b = boundary(&p);
        assert!(Profile::new("", b).signed_area() > 0.0);
    }

    #[test]
    fn test_invalid_inputs() {
        let opts = StepOptions {
            span_mm: 0.0,
            ..StepOptions::default()
        };
        assert!(matches!(
            export_step(&section(true), &opts),
            Err(StepError::InvalidSpan(_))
        ));
        let tiny = Profile::new("tiny", vec![Point2::new(0.0, 0.0), Point2::new(1.0, 0.0)]);
        assert!(matches!(
            export_step(&tiny, &StepOptions::default()),
            Err(StepError::TooFewPoints(2))
        ));
    }

    #[test]
    fn test_quotes_are_escaped() {
        let mut p = section(true);
        p.name = "Wortmann's".to_string();
        let text = export_step(&p, &StepOptions::default()).unwrap();
        assert!(text.contains("PRODUCT('Wortmann''s','Wortmann''s'"));
    }
}
