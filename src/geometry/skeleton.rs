//! Skeleton forest and SWC serialization.
//!
//! SWC is a whitespace-separated text format, one node per line:
//!
//! ```text
//! # id type x y z radius parent
//! 1 1 100.0 200.0 300.0 2.5 -1
//! 2 3 101.0 201.0 301.0 1.0 1
//! ```
//!
//! Node ids in a file are arbitrary positive integers. In memory, parents are
//! indices into [`Skeleton::nodes`]; writing renumbers nodes `1..=n` in
//! storage order.

use crate::types::Point;
use std::collections::HashMap;
use std::io::{self, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SkeletonError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("node {node} references missing parent {parent}")]
    MissingParent { node: usize, parent: usize },
    #[error("node {0} is its own ancestor")]
    Cycle(usize),
    #[error("expected {expected} positions, got {actual}")]
    PositionCount { expected: usize, actual: usize },
}

/// One skeleton node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// SWC structure type (0 = undefined, 1 = soma, 2 = axon, 3 = dendrite).
    pub kind: u8,
    pub position: Point,
    pub radius: f64,
    /// Index of the parent node, `None` for roots.
    pub parent: Option<usize>,
}

/// A forest of rooted trees. Construction guarantees every parent index is in
/// range and no node is its own ancestor.
#[derive(Debug, Clone, PartialEq)]
pub struct Skeleton {
    nodes: Vec<Node>,
}

impl Skeleton {
    pub fn new(nodes: Vec<Node>) -> Result<Self, SkeletonError> {
        for (idx, node) in nodes.iter().enumerate() {
            if let Some(parent) = node.parent {
                if parent >= nodes.len() {
                    return Err(SkeletonError::MissingParent { node: idx, parent });
                }
                if parent == idx {
                    return Err(SkeletonError::Cycle(idx));
                }
            }
        }
        check_acyclic(&nodes)?;
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn positions(&self) -> Vec<Point> {
        self.nodes.iter().map(|n| n.position).collect()
    }

    /// Same topology and radii with new positions, as returned by a transform.
    pub fn with_positions(&self, positions: Vec<Point>) -> Result<Self, SkeletonError> {
        if positions.len() != self.nodes.len() {
            return Err(SkeletonError::PositionCount {
                expected: self.nodes.len(),
                actual: positions.len(),
            });
        }
        let nodes = self
            .nodes
            .iter()
            .zip(positions)
            .map(|(node, position)| Node {
                position,
                ..node.clone()
            })
            .collect();
        Ok(Self { nodes })
    }

    /// (parent, child) index pairs.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(child, n)| n.parent.map(|p| (p, child)))
    }

    /// Total length of all parent-child segments.
    pub fn cable_length(&self) -> f64 {
        self.edges()
            .map(|(p, c)| distance(self.nodes[p].position, self.nodes[c].position))
            .sum()
    }

    pub fn parse_swc(text: &str) -> Result<Self, SkeletonError> {
        let mut rows = Vec::new();
        let mut index_of: HashMap<i64, usize> = HashMap::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 7 {
                return Err(SkeletonError::Parse {
                    line: lineno + 1,
                    reason: format!("expected 7 columns, found {}", fields.len()),
                });
            }
            let num = |i: usize| -> Result<f64, SkeletonError> {
                let value = fields[i].parse::<f64>().map_err(|e| SkeletonError::Parse {
                    line: lineno + 1,
                    reason: format!("column {}: {e}", i + 1),
                })?;
                if !value.is_finite() {
                    return Err(SkeletonError::Parse {
                        line: lineno + 1,
                        reason: format!("column {}: {value} is not finite", i + 1),
                    });
                }
                Ok(value)
            };
            // Ids, types and parents are integers; `1.5` is an error, not node 1.
            let int = |i: usize| -> Result<i64, SkeletonError> {
                fields[i].parse::<i64>().map_err(|e| SkeletonError::Parse {
                    line: lineno + 1,
                    reason: format!("column {}: {:?} is not an integer ({e})", i + 1, fields[i]),
                })
            };
            let id = int(0)?;
            let kind = int(1)?;
            let position = [num(2)?, num(3)?, num(4)?];
            let radius = num(5)?;
            let parent = int(6)?;

            if index_of.insert(id, rows.len()).is_some() {
                return Err(SkeletonError::Parse {
                    line: lineno + 1,
                    reason: format!("duplicate node id {id}"),
                });
            }
            rows.push((kind.clamp(0, u8::MAX as i64) as u8, position, radius, parent, lineno + 1));
        }

        let mut nodes = Vec::with_capacity(rows.len());
        for (kind, position, radius, parent_id, line) in rows {
            let parent = if parent_id < 0 {
                None
            } else {
                Some(*index_of.get(&parent_id).ok_or_else(|| SkeletonError::Parse {
                    line,
                    reason: format!("parent id {parent_id} not present"),
                })?)
            };
            nodes.push(Node {
                kind,
                position,
                radius,
                parent,
            });
        }
        Self::new(nodes)
    }

    /// Write SWC with positions and radii multiplied by `scale`.
    pub fn write_swc(&self, out: &mut impl Write, scale: f64) -> io::Result<()> {
        writeln!(out, "# id type x y z radius parent")?;
        for (idx, node) in self.nodes.iter().enumerate() {
            let parent = node.parent.map(|p| (p + 1) as i64).unwrap_or(-1);
            writeln!(
                out,
                "{} {} {} {} {} {} {}",
                idx + 1,
                node.kind,
                node.position[0] * scale,
                node.position[1] * scale,
                node.position[2] * scale,
                node.radius * scale,
                parent
            )?;
        }
        Ok(())
    }
}

fn distance(a: Point, b: Point) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

/// Walk each node's ancestor chain once, colouring nodes so the whole check
/// stays linear.
fn check_acyclic(nodes: &[Node]) -> Result<(), SkeletonError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unseen,
        OnPath,
        Done,
    }

    let mut marks = vec![Mark::Unseen; nodes.len()];
    let mut path = Vec::new();

    for start in 0..nodes.len() {
        let mut current = Some(start);
        while let Some(idx) = current {
            match marks[idx] {
                Mark::Done => break,
                Mark::OnPath => return Err(SkeletonError::Cycle(idx)),
                Mark::Unseen => {
                    marks[idx] = Mark::OnPath;
                    path.push(idx);
                    current = nodes[idx].parent;
                }
            }
        }
        for idx in path.drain(..) {
            marks[idx] = Mark::Done;
        }
    }
    Ok(())
}
