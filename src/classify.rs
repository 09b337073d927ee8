//! Region classification.
//!
//! An item is assigned to the region holding most of its nodes, measured along
//! one axis against a boundary value. Items sitting in the ambiguous band get
//! the configured default region and usually the other region's target too,
//! since they meaningfully occupy both.

use crate::types::{Axis, Point, Region};
use serde::{Deserialize, Serialize};

/// Fraction above which the primary side wins outright.
pub const PRIMARY_BAND: f64 = 0.6;
/// Fraction below which the secondary side wins outright.
pub const SECONDARY_BAND: f64 = 0.4;

/// Which side of the boundary counts as the primary region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimarySide {
    AtOrAbove,
    Below,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    pub axis: Axis,
    /// Boundary value along `axis`, in source-space units.
    pub boundary: f64,
    pub primary_side: PrimarySide,
    /// Region returned for items in the ambiguous band.
    pub default_region: Region,
    /// Below this confidence the other region's target is requested too.
    pub spans_both_below: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            axis: Axis::Z,
            boundary: 150_000.0,
            primary_side: PrimarySide::AtOrAbove,
            default_region: Region::Primary,
            spans_both_below: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub region: Region,
    pub confidence: f64,
}

impl ClassifierConfig {
    fn on_primary_side(&self, value: f64) -> bool {
        match self.primary_side {
            PrimarySide::AtOrAbove => value >= self.boundary,
            PrimarySide::Below => value < self.boundary,
        }
    }

    /// Classify an item by its node positions. Never fails.
    pub fn classify(&self, positions: &[Point]) -> Classification {
        if positions.is_empty() {
            return Classification {
                region: Region::Primary,
                confidence: 1.0,
            };
        }
        let axis = self.axis.index();
        let primary = positions
            .iter()
            .filter(|p| self.on_primary_side(p[axis]))
            .count();
        let r = primary as f64 / positions.len() as f64;

        if r > PRIMARY_BAND {
            Classification {
                region: Region::Primary,
                confidence: r,
            }
        } else if r < SECONDARY_BAND {
            Classification {
                region: Region::Secondary,
                confidence: 1.0 - r,
            }
        } else {
            Classification {
                region: self.default_region,
                confidence: r,
            }
        }
    }

    /// Regions whose targets should be built, classified region first.
    pub fn required_regions(&self, classification: Classification) -> Vec<Region> {
        let mut regions = vec![classification.region];
        if classification.confidence < self.spans_both_below {
            regions.push(classification.region.other());
        }
        regions
    }
}
