//! Triangle meshes: OBJ read/write and the tube fallback.

use super::skeleton::Skeleton;
use crate::types::Point;
use std::io::{self, Write};
use thiserror::Error;

/// Number of sides of each synthesized tube segment.
pub const TUBE_SIDES: usize = 8;

/// Radius floor for tube segments, so zero-radius nodes stay visible.
const MIN_TUBE_RADIUS: f64 = 0.05;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("expected {expected} vertices, got {actual}")]
    VertexCount { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Point>,
    /// Zero-based vertex indices.
    pub faces: Vec<[usize; 3]>,
}

impl Mesh {
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Same faces with new vertex positions.
    pub fn with_vertices(&self, vertices: Vec<Point>) -> Result<Self, MeshError> {
        if vertices.len() != self.vertices.len() {
            return Err(MeshError::VertexCount {
                expected: self.vertices.len(),
                actual: vertices.len(),
            });
        }
        Ok(Self {
            vertices,
            faces: self.faces.clone(),
        })
    }

    /// Parse the `v` and `f` records of an OBJ file. Polygons are fan
    /// triangulated; texture/normal references (`f 1/2/3 ...`) are ignored.
    pub fn parse_obj(text: &str) -> Result<Self, MeshError> {
        let mut mesh = Mesh::default();
        for (lineno, raw) in text.lines().enumerate() {
            let mut fields = raw.split_whitespace();
            match fields.next() {
                Some("v") => {
                    let coords: Vec<f64> = fields
                        .take(3)
                        .map(|f| f.parse::<f64>())
                        .collect::<Result<_, _>>()
                        .map_err(|e| MeshError::Parse {
                            line: lineno + 1,
                            reason: e.to_string(),
                        })?;
                    if coords.len() != 3 {
                        return Err(MeshError::Parse {
                            line: lineno + 1,
                            reason: "vertex needs three coordinates".into(),
                        });
                    }
                    mesh.vertices.push([coords[0], coords[1], coords[2]]);
                }
                Some("f") => {
                    let mut corners = Vec::new();
                    for field in fields {
                        let index = field
                            .split('/')
                            .next()
                            .and_then(|i| i.parse::<usize>().ok())
                            .filter(|i| *i >= 1)
                            .ok_or_else(|| MeshError::Parse {
                                line: lineno + 1,
                                reason: format!("bad face index '{field}'"),
                            })?;
                        corners.push(index - 1);
                    }
                    if corners.len() < 3 {
                        return Err(MeshError::Parse {
                            line: lineno + 1,
                            reason: "face needs at least three vertices".into(),
                        });
                    }
                    for pair in corners[1..].windows(2) {
                        mesh.faces.push([corners[0], pair[0], pair[1]]);
                    }
                }
                _ => {}
            }
        }

        if let Some(bad) = mesh.faces.iter().flatten().find(|i| **i >= mesh.vertices.len()) {
            return Err(MeshError::Parse {
                line: 0,
                reason: format!("face references vertex {} of {}", bad + 1, mesh.vertices.len()),
            });
        }
        Ok(mesh)
    }

    pub fn write_obj(&self, out: &mut impl Write) -> io::Result<()> {
        for v in &self.vertices {
            writeln!(out, "v {} {} {}", v[0], v[1], v[2])?;
        }
        for f in &self.faces {
            writeln!(out, "f {} {} {}", f[0] + 1, f[1] + 1, f[2] + 1)?;
        }
        Ok(())
    }
}

/// Synthesize a coarse surface from a skeleton: one open tube per
/// parent-child segment, and an octahedron for every node without edges.
///
/// Positions and radii are multiplied by `scale`. Always succeeds; an empty
/// skeleton yields an empty mesh.
pub fn tube_mesh(skeleton: &Skeleton, scale: f64) -> Mesh {
    let nodes = skeleton.nodes();
    let mut mesh = Mesh::default();
    let mut has_edge = vec![false; nodes.len()];

    for (parent, child) in skeleton.edges() {
        has_edge[parent] = true;
        has_edge[child] = true;
        let a = mul(nodes[parent].position, scale);
        let b = mul(nodes[child].position, scale);
        let axis = sub(b, a);
        let length = norm(axis);
        if length <= f64::EPSILON {
            continue;
        }
        let dir = mul(axis, 1.0 / length);
        let (u, v) = orthonormal_frame(dir);
        let ra = (nodes[parent].radius * scale).max(MIN_TUBE_RADIUS * scale);
        let rb = (nodes[child].radius * scale).max(MIN_TUBE_RADIUS * scale);

        let base = mesh.vertices.len();
        for (center, radius) in [(a, ra), (b, rb)] {
            for side in 0..TUBE_SIDES {
                let theta = std::f64::consts::TAU * side as f64 / TUBE_SIDES as f64;
                let offset = add(mul(u, theta.cos() * radius), mul(v, theta.sin() * radius));
                mesh.vertices.push(add(center, offset));
            }
        }
        for side in 0..TUBE_SIDES {
            let next = (side + 1) % TUBE_SIDES;
            let (a0, a1) = (base + side, base + next);
            let (b0, b1) = (base + TUBE_SIDES + side, base + TUBE_SIDES + next);
            mesh.faces.push([a0, b0, a1]);
            mesh.faces.push([a1, b0, b1]);
        }
    }

    for (idx, node) in nodes.iter().enumerate() {
        if !has_edge[idx] {
            let radius = (node.radius * scale).max(MIN_TUBE_RADIUS * scale);
            push_octahedron(&mut mesh, mul(node.position, scale), radius);
        }
    }
    mesh
}

fn push_octahedron(mesh: &mut Mesh, center: Point, radius: f64) {
    let base = mesh.vertices.len();
    let offsets: [Point; 6] = [
        [radius, 0.0, 0.0],
        [-radius, 0.0, 0.0],
        [0.0, radius, 0.0],
        [0.0, -radius, 0.0],
        [0.0, 0.0, radius],
        [0.0, 0.0, -radius],
    ];
    for o in offsets {
        mesh.vertices.push(add(center, o));
    }
    for (x, y) in [(0, 2), (2, 1), (1, 3), (3, 0)] {
        mesh.faces.push([base + x, base + y, base + 4]);
        mesh.faces.push([base + y, base + x, base + 5]);
    }
}

/// Two unit vectors perpendicular to `dir` and to each other.
fn orthonormal_frame(dir: Point) -> (Point, Point) {
    // Cross with the world axis least aligned with `dir`.
    let helper = if dir[0].abs() <= dir[1].abs() && dir[0].abs() <= dir[2].abs() {
        [1.0, 0.0, 0.0]
    } else if dir[1].abs() <= dir[2].abs() {
        [0.0, 1.0, 0.0]
    } else {
        [0.0, 0.0, 1.0]
    };
    let u = cross(dir, helper);
    let u = mul(u, 1.0 / norm(u));
    let v = cross(dir, u);
    (u, v)
}

fn add(a: Point, b: Point) -> Point {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn sub(a: Point, b: Point) -> Point {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn mul(a: Point, s: f64) -> Point {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn cross(a: Point, b: Point) -> Point {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: Point) -> f64 {
    (a[0] * a[0] + a[1] * a[1] + a[2] * a[2]).sqrt()
}
