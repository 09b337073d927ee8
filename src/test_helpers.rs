//! Shared test utilities for the treewarp test suite.
//!
//! Skeleton fixtures are in nanometre-scale source coordinates, positioned so
//! the default classifier (z boundary at 150 000, primary at or above) puts
//! them where their names say.
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let templates = test_templates();
//! let skeleton = y_skeleton();          // confidently primary
//! let spanning = spanning_skeleton();   // half on each side
//! ```

use crate::config::default_templates;
use crate::geometry::{Node, Skeleton};
use crate::types::{Point, TemplateSpace};

// =========================================================================
// Templates
// =========================================================================

/// The stock templates with a coarse 2-micron pitch so volume tests stay
/// small. Ids, names, aliases and extents are unchanged.
pub fn test_templates() -> Vec<TemplateSpace> {
    default_templates()
        .into_iter()
        .map(|mut t| {
            t.pitch = [2.0, 2.0, 2.0];
            t
        })
        .collect()
}

// =========================================================================
// Skeletons
// =========================================================================

fn chain_from(nodes: &mut Vec<Node>, parent: Option<usize>, points: impl IntoIterator<Item = Point>) {
    let mut parent = parent;
    for position in points {
        nodes.push(Node {
            kind: 3,
            position,
            radius: 350.0,
            parent,
        });
        parent = Some(nodes.len() - 1);
    }
}

/// A trunk of 30 nodes that forks into two 15-node branches, entirely above
/// the default boundary.
pub fn y_skeleton() -> Skeleton {
    let mut nodes = Vec::new();
    chain_from(
        &mut nodes,
        None,
        (0..30).map(|i| [300_000.0, 150_000.0, 152_000.0 + 500.0 * i as f64]),
    );
    nodes[0].kind = 1;
    let fork = nodes.len() - 1;
    let top = 152_000.0 + 500.0 * 29.0;
    chain_from(
        &mut nodes,
        Some(fork),
        (1..=15).map(|i| [300_000.0 + 700.0 * i as f64, 150_000.0, top]),
    );
    chain_from(
        &mut nodes,
        Some(fork),
        (1..=15).map(|i| [300_000.0 - 700.0 * i as f64, 150_000.0 + 300.0 * i as f64, top]),
    );
    Skeleton::new(nodes).unwrap_or_else(|e| panic!("fixture skeleton invalid: {e}"))
}

/// 40 nodes entirely below the default boundary.
pub fn secondary_skeleton() -> Skeleton {
    let mut nodes = Vec::new();
    chain_from(
        &mut nodes,
        None,
        (0..40).map(|i| [150_000.0, 100_000.0, 100_000.0 + 1_000.0 * i as f64]),
    );
    Skeleton::new(nodes).unwrap_or_else(|e| panic!("fixture skeleton invalid: {e}"))
}

/// 40 nodes, half on each side of the default boundary.
pub fn spanning_skeleton() -> Skeleton {
    let mut nodes = Vec::new();
    chain_from(
        &mut nodes,
        None,
        (0..40).map(|i| [150_000.0, 100_000.0, 130_000.0 + 1_000.0 * i as f64]),
    );
    Skeleton::new(nodes).unwrap_or_else(|e| panic!("fixture skeleton invalid: {e}"))
}

/// SWC text for a fixture, as a geometry source directory would hold it.
pub fn swc_text(skeleton: &Skeleton) -> String {
    let mut buf = Vec::new();
    skeleton
        .write_swc(&mut buf, 1.0)
        .unwrap_or_else(|e| panic!("write to Vec failed: {e}"));
    String::from_utf8(buf).unwrap_or_else(|e| panic!("SWC is not UTF-8: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ClassifierConfig;
    use crate::types::Region;

    #[test]
    fn fixtures_classify_as_named() {
        let c = ClassifierConfig::default();
        let y = c.classify(&y_skeleton().positions());
        assert_eq!((y.region, y.confidence), (Region::Primary, 1.0));
        let s = c.classify(&secondary_skeleton().positions());
        assert_eq!((s.region, s.confidence), (Region::Secondary, 1.0));
        let both = c.classify(&spanning_skeleton().positions());
        assert_eq!(both.region, Region::Primary);
        assert_eq!(c.required_regions(both).len(), 2);
    }

    #[test]
    fn y_skeleton_has_one_fork() {
        let skel = y_skeleton();
        assert_eq!(skel.len(), 60);
        let mut children = vec![0; skel.len()];
        for (p, _) in skel.edges() {
            children[p] += 1;
        }
        assert_eq!(children.iter().filter(|c| **c == 2).count(), 1);
    }

    #[test]
    fn fixtures_fit_the_stock_templates_after_scaling() {
        let brain = &test_templates()[0];
        for p in y_skeleton().positions() {
            for axis in 0..3 {
                let v = p[axis] * brain.node_scale;
                assert!(v >= brain.extent.min[axis] && v <= brain.extent.max[axis]);
            }
        }
    }
}
