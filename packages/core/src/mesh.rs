//! Model derivation from a sparse reconstruction exported as text.
//!
//! `points3D.txt` rows look like `ID X Y Z R G B ERROR TRACK[]`; lines
//! starting with `#` are comments.

use std::fmt::Write as _;

use parry3d_f64::na;
use parry3d_f64::transformation::try_convex_hull;

use crate::{CoreError, Dimensions};

/// Points needed before the reconstructed hull is preferred over the
/// dimension box.
pub const MIN_HULL_POINTS: usize = 4;

/// One reconstructed point with its colour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rgb: [u8; 3],
}

/// Parse the text export of a sparse model.
pub fn parse_points3d(text: &str) -> Result<Vec<Point3>, CoreError> {
    let mut points = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 7 {
            return Err(CoreError::invalid_input(format!(
                "points3D line {} has {} fields",
                number + 1,
                fields.len()
            )));
        }
        let coord = |i: usize| {
            fields[i].parse::<f64>().map_err(|_| {
                CoreError::invalid_input(format!("points3D line {}: bad coordinate", number + 1))
            })
        };
        let colour = |i: usize| {
            fields[i].parse::<u8>().map_err(|_| {
                CoreError::invalid_input(format!("points3D line {}: bad colour", number + 1))
            })
        };
        points.push(Point3 {
            x: coord(1)?,
            y: coord(2)?,
            z: coord(3)?,
            rgb: [colour(4)?, colour(5)?, colour(6)?],
        });
    }
    Ok(points)
}

/// ASCII PLY with coloured vertices.
pub fn to_ply(points: &[Point3]) -> String {
    let mut out = String::with_capacity(200 + points.len() * 40);
    out.push_str("ply\nformat ascii 1.0\n");
    let _ = writeln!(out, "element vertex {}", points.len());
    out.push_str(
        "property float x\nproperty float y\nproperty float z\n\
         property uchar red\nproperty uchar green\nproperty uchar blue\nend_header\n",
    );
    for p in points {
        let _ = writeln!(
            out,
            "{} {} {} {} {} {}",
            p.x, p.y, p.z, p.rgb[0], p.rgb[1], p.rgb[2]
        );
    }
    out
}

/// Axis-aligned box as min/max corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundingBox {
    pub fn of(points: &[Point3]) -> Option<Self> {
        let first = points.first()?;
        let mut bb = BoundingBox {
            min: [first.x, first.y, first.z],
            max: [first.x, first.y, first.z],
        };
        for p in &points[1..] {
            for (axis, v) in [p.x, p.y, p.z].into_iter().enumerate() {
                bb.min[axis] = bb.min[axis].min(v);
                bb.max[axis] = bb.max[axis].max(v);
            }
        }
        Some(bb)
    }

    /// Box of the object's physical size, in meters, centred on the origin.
    pub fn from_dimensions(dimensions: &Dimensions) -> Self {
        let (l, w, h) = dimensions.in_meters();
        BoundingBox {
            min: [-l / 2.0, -w / 2.0, -h / 2.0],
            max: [l / 2.0, w / 2.0, h / 2.0],
        }
    }

    fn is_degenerate(&self) -> bool {
        (0..3).any(|axis| self.max[axis] - self.min[axis] <= f64::EPSILON)
    }
}

/// Wavefront OBJ of a box: 8 vertices, 12 triangles.
pub fn box_obj(bb: &BoundingBox) -> String {
    let [x0, y0, z0] = bb.min;
    let [x1, y1, z1] = bb.max;
    let vertices = [
        [x0, y0, z0],
        [x1, y0, z0],
        [x1, y1, z0],
        [x0, y1, z0],
        [x0, y0, z1],
        [x1, y0, z1],
        [x1, y1, z1],
        [x0, y1, z1],
    ];
    const FACES: [[u8; 3]; 12] = [
        [1, 3, 2],
        [1, 4, 3],
        [5, 6, 7],
        [5, 7, 8],
        [1, 2, 6],
        [1, 6, 5],
        [2, 3, 7],
        [2, 7, 6],
        [3, 4, 8],
        [3, 8, 7],
        [4, 1, 5],
        [4, 5, 8],
    ];
    let mut out = String::from("# scan mesh\n");
    for [x, y, z] in vertices {
        let _ = writeln!(out, "v {x} {y} {z}");
    }
    for [a, b, c] in FACES {
        let _ = writeln!(out, "f {a} {b} {c}");
    }
    out
}

/// Triangulated convex hull of the points, or `None` when they do not span
/// a volume.
pub fn convex_hull(points: &[Point3]) -> Option<(Vec<[f64; 3]>, Vec<[u32; 3]>)> {
    if points.len() < MIN_HULL_POINTS || BoundingBox::of(points)?.is_degenerate() {
        return None;
    }
    let input: Vec<na::Point3<f64>> = points
        .iter()
        .map(|p| na::Point3::new(p.x, p.y, p.z))
        .collect();
    let (vertices, faces) = try_convex_hull(&input).ok()?;
    if faces.len() < 4 {
        return None;
    }
    let vertices = vertices.iter().map(|v| [v.x, v.y, v.z]).collect();
    Some((vertices, faces))
}

/// Wavefront OBJ of a triangle mesh with 0-based face indices.
pub fn mesh_obj(vertices: &[[f64; 3]], faces: &[[u32; 3]]) -> String {
    let mut out = String::from("# scan mesh\n");
    let _ = writeln!(out, "# {} vertices, {} faces", vertices.len(), faces.len());
    for [x, y, z] in vertices {
        let _ = writeln!(out, "v {x} {y} {z}");
    }
    for [a, b, c] in faces {
        let _ = writeln!(out, "f {} {} {}", a + 1, b + 1, c + 1);
    }
    out
}

/// Mesh for a job: the convex hull of its points, or the dimension box when
/// the reconstruction is too sparse to span a volume.
pub fn build_mesh(points: &[Point3], dimensions: &Dimensions) -> String {
    match convex_hull(points) {
        Some((vertices, faces)) => mesh_obj(&vertices, &faces),
        None => box_obj(&BoundingBox::from_dimensions(dimensions)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# 3D point list with one line of data per point:
#   POINT3D_ID, X, Y, Z, R, G, B, ERROR, TRACK[] as (IMAGE_ID, POINT2D_IDX)
# Number of points: 4, mean track length: 2
1 0.5 -1.0 2.0 255 0 0 0.7 1 10 2 11
2 1.5 1.0 0.0 0 255 0 0.3 1 12 3 4
3 -0.5 0.0 1.0 0 0 255 0.4 2 5 3 9
4 0.0 0.2 -1.0 10 20 30 0.1 1 1 2 2
";

    fn dims() -> Dimensions {
        Dimensions::new(50.0, 40.0, 100.0).unwrap()
    }

    #[test]
    fn parses_points_and_skips_comments() {
        let points = parse_points3d(SAMPLE).unwrap();
        assert_eq!(points.len(), 4);
        assert_eq!(points[0].rgb, [255, 0, 0]);
        assert_eq!(points[3].z, -1.0);
        assert!(parse_points3d("1 0 0\n").is_err());
    }

    #[test]
    fn ply_header_counts_vertices() {
        let points = parse_points3d(SAMPLE).unwrap();
        let ply = to_ply(&points);
        assert!(ply.starts_with("ply\nformat ascii 1.0\nelement vertex 4\n"));
        assert!(ply.contains("property uchar red"));
        assert_eq!(ply.lines().filter(|l| l.ends_with(" 255 0 0")).count(), 1);
    }

    fn faces(obj: &str) -> Vec<[usize; 3]> {
        obj.lines()
            .filter_map(|l| l.strip_prefix("f "))
            .map(|l| {
                let idx: Vec<usize> = l.split(' ').map(|i| i.parse().unwrap()).collect();
                [idx[0], idx[1], idx[2]]
            })
            .collect()
    }

    #[test]
    fn tetrahedron_hull_keeps_every_point() {
        let points = parse_points3d(SAMPLE).unwrap();
        let obj = build_mesh(&points, &dims());
        assert_eq!(obj.lines().filter(|l| l.starts_with("v ")).count(), 4);
        let faces = faces(&obj);
        assert_eq!(faces.len(), 4);
        assert!(faces.iter().flatten().all(|i| (1..=4).contains(i)));
        assert!(obj.contains("v 1.5 1 0"));
    }

    #[test]
    fn interior_points_are_dropped_from_the_hull() {
        let mut rows = String::new();
        let corners = [
            [1, 0, 0],
            [-1, 0, 0],
            [0, 1, 0],
            [0, -1, 0],
            [0, 0, 1],
            [0, 0, -1],
        ];
        for (id, [x, y, z]) in corners.into_iter().enumerate() {
            rows.push_str(&format!("{} {x} {y} {z} 1 1 1 0.1\n", id + 1));
        }
        rows.push_str("7 0.1 0.2 0.1 1 1 1 0.1\n");
        let points = parse_points3d(&rows).unwrap();
        assert_eq!(points.len(), 7);

        let obj = build_mesh(&points, &dims());
        assert_eq!(obj.lines().filter(|l| l.starts_with("v ")).count(), 6);
        assert_eq!(faces(&obj).len(), 8);
        assert!(!obj.contains("v 0.1 0.2 0.1"));
    }

    #[test]
    fn flat_reconstructions_use_the_dimension_box() {
        let rows = "1 0 0 0 1 1 1 0.1\n2 1 0 0 1 1 1 0.1\n3 0 1 0 1 1 1 0.1\n4 1 1 0 1 1 1 0.1\n";
        let points = parse_points3d(rows).unwrap();
        assert!(convex_hull(&points).is_none());
        let obj = build_mesh(&points, &dims());
        assert!(obj.contains("v -0.25 -0.2 -0.5"));
    }

    #[test]
    fn sparse_models_fall_back_to_the_dimension_box() {
        let points = parse_points3d("1 0 0 0 1 2 3 0.1\n").unwrap();
        let obj = build_mesh(&points, &dims());
        assert!(obj.contains("v -0.25 -0.2 -0.5"));
        assert!(obj.contains("v 0.25 0.2 0.5"));
    }
}
