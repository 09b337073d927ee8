//! Config-backed affine provider.
//!
//! Each configured step is a 3×4 row-major matrix `[R | t]`, applied as
//! `p' = R·p + t`. Steps are looked up by (source, target), with the target
//! matched exactly; a step with no entry is [`TransformError::Unsupported`],
//! which is what drives the router's fallback to the next candidate.

use super::{TransformError, TransformProvider};
use crate::route::ChainStep;
use crate::types::{Point, Region};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AffineStep {
    pub source: String,
    pub target: String,
    /// Restrict to one region; `None` applies to both.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    /// Rows of `[R | t]`.
    pub matrix: [[f64; 4]; 3],
}

impl AffineStep {
    pub const IDENTITY: [[f64; 4]; 3] = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
    ];

    fn matches(&self, step: &ChainStep) -> bool {
        self.source == step.source
            && self.target == step.target
            && self.region.is_none_or(|r| r == step.region)
    }

    fn transform(&self, p: Point) -> Point {
        let m = &self.matrix;
        [
            m[0][0] * p[0] + m[0][1] * p[1] + m[0][2] * p[2] + m[0][3],
            m[1][0] * p[0] + m[1][1] * p[1] + m[1][2] * p[2] + m[1][3],
            m[2][0] * p[0] + m[2][1] * p[1] + m[2][2] * p[2] + m[2][3],
        ]
    }
}

/// Thread-safe: pure arithmetic over immutable config.
#[derive(Debug, Clone, Default)]
pub struct AffineRegistry {
    steps: Vec<AffineStep>,
}

impl AffineRegistry {
    pub fn new(steps: Vec<AffineStep>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl TransformProvider for AffineRegistry {
    fn apply(&self, points: &[Point], step: &ChainStep) -> Result<Vec<Point>, TransformError> {
        // Region-specific entries take precedence over generic ones.
        let entry = self
            .steps
            .iter()
            .find(|s| s.region.is_some() && s.matches(step))
            .or_else(|| self.steps.iter().find(|s| s.matches(step)))
            .ok_or_else(|| TransformError::Unsupported { step: step.clone() })?;
        Ok(points.iter().map(|p| entry.transform(*p)).collect())
    }
}
