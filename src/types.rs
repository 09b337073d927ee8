//! Shared types used across all pipeline stages.
//!
//! These types are serialized into the state file and the per-target
//! `metadata.json` sidecar, so their serde representation is part of the
//! on-disk format.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 3D position in whatever physical units the owning space uses.
pub type Point = [f64; 3];

/// Coarse anatomical partition used to route an item to a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Primary,
    Secondary,
}

impl Region {
    /// The region on the other side of the boundary.
    pub fn other(self) -> Self {
        match self {
            Region::Primary => Region::Secondary,
            Region::Secondary => Region::Primary,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Region::Primary => "primary",
            Region::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the three derived artifact formats.
///
/// The order of the variants is the generation order: the skeleton is always
/// written first because the other formats are derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Skeleton,
    Mesh,
    Volume,
}

impl Format {
    pub const ALL: [Format; 3] = [Format::Skeleton, Format::Mesh, Format::Volume];

    /// Fixed filename for this format. Distinct items never share a directory,
    /// so the filename carries no identity.
    pub fn filename(self) -> &'static str {
        match self {
            Format::Skeleton => "volume.swc",
            Format::Mesh => "volume_man.obj",
            Format::Volume => "volume.nrrd",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Format::Skeleton => "skeleton",
            Format::Mesh => "mesh",
            Format::Volume => "volume",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = String;

    /// Accepts the format names and their file-extension aliases
    /// (`swc`, `obj`, `nrrd`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skeleton" | "swc" => Ok(Format::Skeleton),
            "mesh" | "obj" => Ok(Format::Mesh),
            "volume" | "nrrd" => Ok(Format::Volume),
            other => Err(format!(
                "unknown format '{other}' (expected skeleton|swc, mesh|obj, volume|nrrd)"
            )),
        }
    }
}

/// Parse a comma-separated format list, dropping duplicates and keeping
/// generation order.
pub fn parse_format_list(list: &str) -> Result<Vec<Format>, String> {
    let mut formats = Vec::new();
    for part in list.split(',').filter(|p| !p.trim().is_empty()) {
        let format: Format = part.parse()?;
        if !formats.contains(&format) {
            formats.push(format);
        }
    }
    if formats.is_empty() {
        return Err("at least one format is required".into());
    }
    formats.sort();
    Ok(formats)
}

/// Spatial axis used by the region classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// Axis-aligned physical bounds of a template.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Extent {
    pub min: Point,
    pub max: Point,
}

/// A canonical target coordinate space.
///
/// Immutable reference data: loaded once from config and shared by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateSpace {
    /// Short-form id used as the output directory name (e.g. `VFB_00101567`).
    pub id: String,
    /// Human name, also the name transform steps target (e.g. `JRC2018U`).
    pub name: String,
    /// Synonym names that resolve to this template.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    pub region: Region,
    pub extent: Extent,
    /// Voxel size along x, y, z in physical units.
    pub pitch: Point,
    /// Multiplier from transformed-geometry units to the template's physical
    /// units (e.g. `0.001` for nanometres into microns).
    #[serde(default = "default_node_scale")]
    pub node_scale: f64,
    #[serde(default = "default_units")]
    pub units: String,
}

fn default_node_scale() -> f64 {
    1.0
}

fn default_units() -> String {
    "microns".to_string()
}

impl TemplateSpace {
    /// True if `name` is this template's id, name, or one of its aliases.
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.id == name || self.aliases.iter().any(|a| a == name)
    }

    /// Voxel grid dimensions implied by the extent and pitch.
    pub fn grid_dims(&self) -> [usize; 3] {
        let mut dims = [0usize; 3];
        for (axis, dim) in dims.iter_mut().enumerate() {
            let span = self.extent.max[axis] - self.extent.min[axis];
            *dim = (span / self.pitch[axis]).ceil().max(1.0) as usize;
        }
        dims
    }

    /// Total voxels in the grid, or `None` if the count overflows `usize`.
    pub fn voxel_count(&self) -> Option<usize> {
        let [x, y, z] = self.grid_dims();
        x.checked_mul(y)?.checked_mul(z)
    }
}
