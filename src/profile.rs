//! Airfoil coordinate handling.
//!
//! A [`Profile`] always stores its points in Selig order: trailing edge,
//! along the upper surface to the leading edge, then back along the lower
//! surface to the trailing edge. Lednicer files are converted on load.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A 2D point in profile coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Errors from reading or validating coordinates.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {msg}")]
    Parse { line: usize, msg: String },
    #[error("profile has {0} points, need at least 3")]
    TooFewPoints(usize),
    #[error("non-finite coordinate at point {0}")]
    NonFinite(usize),
    #[error("leading and trailing edge coincide")]
    DegenerateChord,
}

/// Layout of a coordinate file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinateFormat {
    /// Single loop TE -> upper -> LE -> lower -> TE, optional name line.
    Selig,
    /// Name, point counts, upper block LE -> TE, lower block LE -> TE.
    Lednicer,
    /// Comma separated `x,y` rows, optional header.
    Csv,
}

/// An airfoil section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub points: Vec<Point2>,
}

impl Profile {
    pub fn new(name: impl Into<String>, points: Vec<Point2>) -> Self {
        Self {
            name: name.into(),
            points,
        }
    }

    /// Parse coordinates, detecting the file layout.
    pub fn parse(text: &str, fallback_name: &str) -> Result<Self, ProfileError> {
        let (profile, format) = Self::parse_detect(text, fallback_name)?;
        debug!(name = %profile.name, ?format, points = profile.points.len(), "parsed profile");
        Ok(profile)
    }

    /// Parse coordinates and report which layout was found.
    pub fn parse_detect(
        text: &str,
        fallback_name: &str,
    ) -> Result<(Self, CoordinateFormat), ProfileError> {
        let mut name: Option<String> = None;
        let mut rows: Vec<(usize, Point2)> = Vec::new();
        let mut saw_comma = false;
        let mut saw_header = false;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.contains(',') {
                saw_comma = true;
            }

            let tokens: Vec<&str> = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|t| !t.is_empty())
                .collect();

            match parse_pair(&tokens) {
                Some(p) => rows.push((line_no, p)),
                None if rows.is_empty() && name.is_none() && !saw_header => {
                    if is_column_header(&tokens) {
                        saw_header = true;
                    } else {
                        name = Some(line.to_string());
                    }
                }
                None => {
                    return Err(ProfileError::Parse {
                        line: line_no,
                        msg: format!("expected two numbers, found '{}'", line),
                    })
                }
            }
        }

        let name = name.unwrap_or_else(|| fallback_name.to_string());

        if let Some(&(_, first)) = rows.first() {
            if is_lednicer_counts(first) && rows.len() > 1 {
                let upper_n = first.x as usize;
                let lower_n = first.y as usize;
                let data: Vec<Point2> = rows[1..].iter().map(|(_, p)| *p).collect();
                if upper_n.checked_add(lower_n) != Some(data.len()) {
                    return Err(ProfileError::Parse {
                        line: rows[0].0,
                        msg: format!(
                            "Lednicer header announces {} + {} points, found {}",
                            upper_n,
                            lower_n,
                            data.len()
                        ),
                    });
                }
                let points = merge_lednicer(&data[..upper_n], &data[upper_n..]);
                let profile = Self::new(name, points);
                profile.validate()?;
                return Ok((profile, CoordinateFormat::Lednicer));
            }
        }

        let points: Vec<Point2> = rows.into_iter().map(|(_, p)| p).collect();
        let profile = Self::new(name, points);
        profile.validate()?;
        let format = if saw_comma {
            CoordinateFormat::Csv
        } else {
            CoordinateFormat::Selig
        };
        Ok((profile, format))
    }

    /// Load a coordinate file; the name falls back to the file stem.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "airfoil".to_string());
        let profile = Self::parse(&text, &stem)?;
        info!(path = %path.display(), name = %profile.name, points = profile.points.len(), "profile loaded");
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.points.len() < 3 {
            return Err(ProfileError::TooFewPoints(self.points.len()));
        }
        if let Some(i) = self
            .points
            .iter()
            .position(|p| !p.x.is_finite() || !p.y.is_finite())
        {
            return Err(ProfileError::NonFinite(i));
        }
        if self.chord() <= f64::EPSILON {
            return Err(ProfileError::DegenerateChord);
        }
        Ok(())
    }

    /// Index of the leading edge (smallest x, first on ties).
    pub fn leading_edge_index(&self) -> usize {
        let mut best = 0;
        for (i, p) in self.points.iter().enumerate() {
            if p.x < self.points[best].x {
                best = i;
            }
        }
        best
    }

    pub fn leading_edge(&self) -> Point2 {
        self.points[self.leading_edge_index()]
    }

    /// Midpoint of the first and last point.
    pub fn trailing_edge(&self) -> Point2 {
        let (a, b) = match (self.points.first(), self.points.last()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Point2::new(0.0, 0.0),
        };
        Point2::new((a.x + b.x) * 0.5, (a.y + b.y) * 0.5)
    }

    pub fn chord(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        self.leading_edge().distance(&self.trailing_edge())
    }

    pub fn is_closed(&self, tol: f64) -> bool {
        match (self.points.first(), self.points.last()) {
            (Some(a), Some(b)) => a.distance(b) <= tol,
            _ => false,
        }
    }

    /// Copy with the first point appended when the trailing edge is open.
    pub fn closed(&self) -> Self {
        let mut out = self.clone();
        if !self.is_closed(1e-12) {
            if let Some(first) = self.points.first() {
                out.points.push(*first);
            }
        }
        out
    }

    /// Leading edge at the origin, trailing edge on +x, unit chord.
    pub fn normalized(&self) -> Self {
        let le = self.leading_edge();
        let te = self.trailing_edge();
        let chord = self.chord();
        if chord <= f64::EPSILON {
            return self.clone();
        }
        let angle = (te.y - le.y).atan2(te.x - le.x);
        let (s, c) = (-angle).sin_cos();
        let points = self
            .points
            .iter()
            .map(|p| {
                let dx = p.x - le.x;
                let dy = p.y - le.y;
                Point2::new((dx * c - dy * s) / chord, (dx * s + dy * c) / chord)
            })
            .collect();
        Self::new(self.name.clone(), points)
    }

    /// Upper surface ordered leading edge to trailing edge.
    pub fn upper(&self) -> Vec<Point2> {
        if self.points.is_empty() {
            return Vec::new();
        }
        let le = self.leading_edge_index();
        self.points[..=le].iter().rev().copied().collect()
    }

    /// Lower surface ordered leading edge to trailing edge.
    pub fn lower(&self) -> Vec<Point2> {
        if self.points.is_empty() {
            return Vec::new();
        }
        let le = self.leading_edge_index();
        self.points[le..].to_vec()
    }

    /// Maximum thickness and the x where it occurs.
    pub fn max_thickness(&self) -> (f64, f64) {
        let lower = self.lower();
        let mut best = (0.0, 0.0);
        for p in self.upper() {
            if let Some(yl) = interpolate_y(&lower, p.x) {
                let t = p.y - yl;
                if t > best.0 {
                    best = (t, p.x);
                }
            }
        }
        best
    }

    pub fn scaled(&self, factor: f64) -> Self {
        let points = self
            .points
            .iter()
            .map(|p| Point2::new(p.x * factor, p.y * factor))
            .collect();
        Self::new(self.name.clone(), points)
    }

    /// Rotate about `pivot`. Positive angles pitch the nose up.
    pub fn rotated_about(&self, pivot: Point2, angle_deg: f64) -> Self {
        let (s, c) = (-angle_deg.to_radians()).sin_cos();
        let points = self
            .points
            .iter()
            .map(|p| {
                let dx = p.x - pivot.x;
                let dy = p.y - pivot.y;
                Point2::new(pivot.x + dx * c - dy * s, pivot.y + dx * s + dy * c)
            })
            .collect();
        Self::new(self.name.clone(), points)
    }

    /// Shoelace area, positive for counter-clockwise loops.
    pub fn signed_area(&self) -> f64 {
        let n = self.points.len();
        if n < 3 {
            return 0.0;
        }
        let mut acc = 0.0;
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[(i + 1) % n];
            acc += a.x * b.y - b.x * a.y;
        }
        acc * 0.5
    }

    /// Header-less `x,y` rows.
    pub fn to_csv_string(&self) -> String {
        let mut out = String::with_capacity(self.points.len() * 24);
        for p in &self.points {
            let _ = writeln!(out, "{},{}", p.x, p.y);
        }
        out
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), ProfileError> {
        let path = path.as_ref();
        fs::write(path, self.to_csv_string()).map_err(|source| ProfileError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File-system friendly version of the name.
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }
}

/// Lowercase, alphanumerics kept, everything else collapsed to `-`.
pub fn slugify(name: &str) -> String {
    let mut out = String::new();
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        "airfoil".to_string()
    } else {
        out
    }
}

/// Linear interpolation of y at x on a surface ordered by increasing x.
pub fn interpolate_y(surface: &[Point2], x: f64) -> Option<f64> {
    for w in surface.windows(2) {
        let (a, b) = (w[0], w[1]);
        let (lo, hi) = if a.x <= b.x { (a, b) } else { (b, a) };
        if x >= lo.x && x <= hi.x {
            if (hi.x - lo.x).abs() <= f64::EPSILON {
                return Some(lo.y.max(hi.y));
            }
            let t = (x - lo.x) / (hi.x - lo.x);
            return Some(lo.y + t * (hi.y - lo.y));
        }
    }
    None
}

fn parse_pair(tokens: &[&str]) -> Option<Point2> {
    if tokens.len() < 2 {
        return None;
    }
    let x = tokens[0].parse::<f64>().ok()?;
    let y = tokens[1].parse::<f64>().ok()?;
    Some(Point2::new(x, y))
}

fn is_column_header(tokens: &[&str]) -> bool {
    tokens.len() == 2
        && tokens[0].eq_ignore_ascii_case("x")
        && (tokens[1].eq_ignore_ascii_case("y") || tokens[1].eq_ignore_ascii_case("z"))
}

fn is_lednicer_counts(p: Point2) -> bool {
    p.x > 1.5 && p.y > 1.5 && p.x.fract() == 0.0 && p.y.fract() == 0.0
}

fn merge_lednicer(upper: &[Point2], lower: &[Point2]) -> Vec<Point2> {
    let mut points: Vec<Point2> = upper.iter().rev().copied().collect();
    let skip_shared_le = match (upper.first(), lower.first()) {
        (Some(a), Some(b)) => a.distance(b) <= 1e-12,
        _ => false,
    };
    let start = usize::from(skip_shared_le);
    points.extend_from_slice(&lower[start..]);
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SELIG: &str = "NACA 0012 coarse
1.0 0.0
0.5 0.06
0.0 0.0
0.5 -0.06
1.0 0.0
";

    const LEDNICER: &str = "TEST LEDNICER

3. 3.

0.0 0.0
0.5 0.05
1.0 0.0

0.0 0.0
0.5 -0.04
1.0 0.0
";

    #[test]
    fn test_parse_selig_with_name() {
        let (p, fmt) = Profile::parse_detect(SELIG, "fallback").unwrap();
        assert_eq!(fmt, CoordinateFormat::Selig);
        assert_eq!(p.name, "NACA 0012 coarse");
        assert_eq!(p.points.len(), 5);
        assert_eq!(p.leading_edge_index(), 2);
    }

    #[test]
    fn test_parse_lednicer_converts_to_selig_order() {
        let (p, fmt) = Profile::parse_detect(LEDNICER, "x").unwrap();
        assert_eq!(fmt, CoordinateFormat::Lednicer);
        assert_eq!(p.points.len(), 5);
        assert_eq!(p.points[0], Point2::new(1.0, 0.0));
        assert_eq!(p.points[1], Point2::new(0.5, 0.05));
        assert_eq!(p.points[2], Point2::new(0.0, 0.0));
        assert_eq!(p.points[3], Point2::new(0.5, -0.04));
    }

    #[test]
    fn test_parse_lednicer_count_mismatch() {
        let text = "BAD\n3. 3.\n0.0 0.0\n0.5 0.05\n1.0 0.0\n0.0 0.0\n";
        let err = Profile::parse(text, "x").unwrap_err();
        assert!(matches!(err, ProfileError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_parse_lednicer_huge_counts() {
        let text = "X\n1e20 1e20\n0 0\n1 0\n0.5 0.1\n";
        let err = Profile::parse(text, "x").unwrap_err();
        assert!(matches!(err, ProfileError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_parse_csv_with_header_uses_fallback_name() {
        let text = "x,y\n1,0\n0,0\n1,-0.01\n";
        let (p, fmt) = Profile::parse_detect(text, "clark-y").unwrap();
        assert_eq!(fmt, CoordinateFormat::Csv);
        assert_eq!(p.name, "clark-y");
        assert_eq!(p.points.len(), 3);
    }

    #[test]
    fn test_parse_reports_line_number() {
        let text = "NAME\n1.0 0.0\n0.5 oops\n";
        match Profile::parse(text, "x") {
            Err(ProfileError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_too_few_points() {
        let err = Profile::parse("1 0\n0 0\n", "x").unwrap_err();
        assert!(matches!(err, ProfileError::TooFewPoints(2)));
    }

    #[test]
    fn test_normalized_unit_chord() {
        let p = Profile::parse(SELIG, "x").unwrap().scaled(250.0);
        let n = p.normalized();
        assert!((n.chord() - 1.0).abs() < 1e-12);
        assert!(n.leading_edge().x.abs() < 1e-12);
        assert!((n.trailing_edge().x - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_normalized_removes_incidence() {
        let p = Profile::parse(SELIG, "x").unwrap();
        let tilted = p.rotated_about(Point2::new(0.25, 0.0), 10.0);
        let n = tilted.normalized();
        assert!(n.trailing_edge().y.abs() < 1e-12);
    }

    #[test]
    fn test_rotation_nose_up() {
        let p = Profile::parse(SELIG, "x").unwrap();
        let r = p.rotated_about(Point2::new(0.25, 0.0), 5.0);
        // nose up means leading edge rises and trailing edge drops
        assert!(r.leading_edge().y > 0.0);
        assert!(r.trailing_edge().y < 0.0);
    }

    #[test]
    fn test_surfaces_and_thickness() {
        let p = Profile::parse(SELIG, "x").unwrap();
        assert_eq!(p.upper().first().unwrap().x, 0.0);
        assert_eq!(p.lower().last().unwrap().x, 1.0);
        let (t, x) = p.max_thickness();
        assert!((t - 0.12).abs() < 1e-12);
        assert!((x - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_selig_order_is_counter_clockwise() {
        let p = Profile::parse(SELIG, "x").unwrap();
        assert!(p.signed_area() > 0.0);
    }

    #[test]
    fn test_closed_appends_once() {
        let text = "1.0 0.001\n0.0 0.0\n1.0 -0.001\n";
        let p = Profile::parse(text, "open").unwrap();
        assert!(!p.is_closed(1e-9));
        let c = p.closed();
        assert_eq!(c.points.len(), 4);
        assert!(c.is_closed(1e-9));
        assert_eq!(c.closed().points.len(), 4);
    }

    #[test]
    fn test_csv_round_trip_through_file() {
        let dir = tempdir().unwrap();
        let p = Profile::parse(SELIG, "x").unwrap();
        let path = dir.path().join("foil.csv");
        p.write_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("1,0\n"));
        let back = Profile::from_file(&path).unwrap();
        assert_eq!(back.name, "foil");
        assert_eq!(back.points, p.points);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("NACA 2412"), "naca-2412");
        assert_eq!(slugify("  Clark Y (smoothed) "), "clark-y-smoothed");
        assert_eq!(slugify("***"), "airfoil");
    }
}
