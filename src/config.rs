//! Pipeline configuration module.
//!
//! Handles loading, validating, and merging `treewarp.toml`. Stock defaults
//! are overridden by the user file, which is overridden by command-line flags.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [input]
//! skeleton_dir = "skeletons"      # {id}.swc files
//! # mesh_dir = "meshes"           # {id}.obj native meshes (optional)
//! source_space = "BANC"
//! strip_prefixes = ["BANC_", "VFB_"]
//!
//! [output]
//! dir = "/IMAGE_WRITE/treewarp"
//! default_prefix = "/IMAGE_WRITE" # swapped for $TREEWARP_OUTPUT_ROOT
//! formats = ["skeleton", "mesh", "volume"]
//! min_artifact_bytes = 1000
//! skip_existing = true
//! state_file = "processing_state.json"
//!
//! [processing]
//! max_workers = 1
//! checkpoint_every = 10
//! timeout_secs = 300
//! serialize_transforms = false
//!
//! [classifier]
//! axis = "z"
//! boundary = 150000.0
//! primary_side = "at_or_above"
//! default_region = "primary"
//! spans_both_below = 0.8
//!
//! [routing]
//! intermediate = "JRC2018F"
//! primary = ["JRC2018U"]
//! secondary = ["JRC2018VNCunisex", "JRCVNC2018U"]
//! allow_approximate = true
//! allow_unregistered = false
//!
//! [transforms]
//! provider = "affine"
//!
//! [[templates]]
//! id = "VFB_00101567"
//! name = "JRC2018U"
//! # ...
//! ```
//!
//! ## Partial Configuration
//!
//! The file is sparse: override just the values you want. Arrays (including
//! `[[templates]]`) replace the stock value as a whole. Unknown keys are
//! rejected to catch typos early.

use crate::classify::ClassifierConfig;
use crate::collaborators::{AffineStep, CommandConfig};
use crate::route::RoutingConfig;
use crate::types::{Extent, Format, Region, TemplateSpace};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Largest volume grid a template may describe (one byte per voxel).
const MAX_GRID_VOXELS: usize = 1 << 31;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "treewarp.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Full pipeline configuration.
///
/// All fields have defaults. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub input: InputConfig,
    pub output: OutputConfig,
    pub processing: ProcessingConfig,
    pub classifier: ClassifierConfig,
    pub routing: RoutingConfig,
    pub transforms: TransformsConfig,
    pub templates: Vec<TemplateSpace>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: InputConfig::default(),
            output: OutputConfig::default(),
            processing: ProcessingConfig::default(),
            classifier: ClassifierConfig::default(),
            routing: RoutingConfig::default(),
            transforms: TransformsConfig::default(),
            templates: default_templates(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputConfig {
    pub skeleton_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_dir: Option<PathBuf>,
    /// Name of the space raw geometry lives in; the first chain step starts here.
    pub source_space: String,
    /// Prefixes removed from raw ids before validation.
    pub strip_prefixes: Vec<String>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            skeleton_dir: PathBuf::from("skeletons"),
            mesh_dir: None,
            source_space: "BANC".into(),
            strip_prefixes: vec!["BANC_".into(), "VFB_".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// Leading part of `dir` replaced by `$TREEWARP_OUTPUT_ROOT` when set.
    pub default_prefix: PathBuf,
    pub formats: Vec<Format>,
    /// Existing files at or below this size are regenerated.
    pub min_artifact_bytes: u64,
    pub skip_existing: bool,
    /// Relative paths are resolved against the output base directory.
    pub state_file: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/IMAGE_WRITE/treewarp"),
            default_prefix: PathBuf::from("/IMAGE_WRITE"),
            formats: Format::ALL.to_vec(),
            min_artifact_bytes: 1000,
            skip_existing: true,
            state_file: PathBuf::from("processing_state.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    pub max_workers: usize,
    /// Completed items between periodic state checkpoints.
    pub checkpoint_every: usize,
    /// Per-call bound on collaborator calls. `0` disables the bound.
    pub timeout_secs: u64,
    /// Route every transform call through one lock. Required to run a
    /// provider that is not thread-safe with more than one worker.
    pub serialize_transforms: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            checkpoint_every: 10,
            timeout_secs: 300,
            serialize_transforms: false,
        }
    }
}

impl ProcessingConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Affine,
    Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransformsConfig {
    pub provider: ProviderKind,
    pub affine: Vec<AffineStep>,
    pub command: CommandConfig,
}

impl Default for TransformsConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Affine,
            affine: Vec::new(),
            command: CommandConfig::default(),
        }
    }
}

impl TransformsConfig {
    /// Thread safety of the configured provider.
    pub fn provider_thread_safe(&self) -> bool {
        match self.provider {
            ProviderKind::Affine => true,
            ProviderKind::Command => self.command.thread_safe,
        }
    }
}

/// The two stock templates: the unisex brain and the unisex VNC.
pub fn default_templates() -> Vec<TemplateSpace> {
    let pitch = [0.5189161, 0.5189161, 1.0];
    vec![
        TemplateSpace {
            id: "VFB_00101567".into(),
            name: "JRC2018U".into(),
            aliases: vec![],
            region: Region::Primary,
            extent: Extent {
                min: [0.0, 0.0, 0.0],
                max: [627.3695649, 293.1875965, 173.0],
            },
            pitch,
            node_scale: 0.001,
            units: "microns".into(),
        },
        TemplateSpace {
            id: "VFB_00200000".into(),
            name: "JRC2018VNCunisex".into(),
            aliases: vec!["JRCVNC2018U".into()],
            region: Region::Secondary,
            extent: Extent {
                min: [0.0, 0.0, 0.0],
                max: [300.0, 200.0, 400.0],
            },
            pitch,
            node_scale: 0.001,
            units: "microns".into(),
        },
    ]
}

impl PipelineConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        if self.output.formats.is_empty() {
            return invalid("output.formats must name at least one format".into());
        }
        if self.processing.max_workers == 0 {
            return invalid("processing.max_workers must be at least 1".into());
        }
        if self.processing.checkpoint_every == 0 {
            return invalid("processing.checkpoint_every must be at least 1".into());
        }
        let spans = self.classifier.spans_both_below;
        if !(spans > 0.0 && spans <= 1.0) {
            return invalid(format!(
                "classifier.spans_both_below must be in (0, 1], got {spans}"
            ));
        }
        if !self.classifier.boundary.is_finite() {
            return invalid("classifier.boundary must be a finite number".into());
        }
        if self.input.source_space.trim().is_empty() {
            return invalid("input.source_space must not be empty".into());
        }
        if self.routing.intermediate.trim().is_empty() {
            return invalid("routing.intermediate must not be empty".into());
        }

        if self.templates.is_empty() {
            return invalid("at least one [[templates]] entry is required".into());
        }
        for t in &self.templates {
            if t.id.trim().is_empty() || t.id.contains(['/', '\\']) {
                return invalid(format!("template id '{}' is not a valid directory name", t.id));
            }
            if t.pitch.iter().any(|p| !(p.is_finite() && *p > 0.0)) {
                return invalid(format!("template {}: pitch must be positive", t.id));
            }
            if t.extent.min.iter().chain(&t.extent.max).any(|v| !v.is_finite()) {
                return invalid(format!("template {}: extent bounds must be finite", t.id));
            }
            if (0..3).any(|a| !(t.extent.max[a] > t.extent.min[a])) {
                return invalid(format!("template {}: extent must be non-empty on every axis", t.id));
            }
            if !(t.node_scale.is_finite() && t.node_scale > 0.0) {
                return invalid(format!("template {}: node_scale must be positive", t.id));
            }
            if t.voxel_count().is_none_or(|n| n > MAX_GRID_VOXELS) {
                return invalid(format!(
                    "template {}: extent / pitch gives a voxel grid over {MAX_GRID_VOXELS} voxels",
                    t.id
                ));
            }
        }

        for region in [Region::Primary, Region::Secondary] {
            for candidate in self.routing.candidates(region) {
                if !self.templates.iter().any(|t| t.answers_to(candidate)) {
                    return invalid(format!(
                        "routing.{region} candidate '{candidate}' does not name a configured template"
                    ));
                }
            }
        }

        if self.processing.max_workers > 1
            && !self.transforms.provider_thread_safe()
            && !self.processing.serialize_transforms
        {
            return invalid(format!(
                "processing.max_workers = {} with a transform provider that is not thread-safe; \
                 set max_workers = 1 or processing.serialize_transforms = true",
                self.processing.max_workers
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the base layer user overrides are merged onto.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(PipelineConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay (arrays included) replace base values.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value. `Ok(None)` if it does not exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto the stock defaults and deserialize.
///
/// Not validated: callers apply CLI overrides first, then call
/// [`PipelineConfig::validate`].
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<PipelineConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    Ok(merged.try_into()?)
}

/// Load and validate the config at `path`, falling back to stock defaults
/// when the file does not exist.
pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let config = resolve_config(load_raw_config(path)?)?;
    config.validate()?;
    Ok(config)
}

/// Returns a fully-commented stock `treewarp.toml` with all keys and
/// explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# treewarp configuration
# ======================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Input
# ---------------------------------------------------------------------------
[input]
# Directory of {id}.swc skeletons. Also the work list when no ids are given.
skeleton_dir = "skeletons"

# Directory of {id}.obj native meshes, in the same space as the skeletons.
# When unset (or a mesh is missing) a tube mesh is built from the skeleton.
# mesh_dir = "meshes"

# Space the raw geometry lives in. Every chain starts here.
source_space = "BANC"

# Prefixes stripped from ids before validation ("BANC_123" -> "123").
strip_prefixes = ["BANC_", "VFB_"]

# ---------------------------------------------------------------------------
# Output
# ---------------------------------------------------------------------------
[output]
# Artifacts go to {dir}/{template_id}/{item_id}/.
dir = "/IMAGE_WRITE/treewarp"

# If dir starts with this prefix and $TREEWARP_OUTPUT_ROOT is set, the prefix
# is replaced by the environment value.
default_prefix = "/IMAGE_WRITE"

# Any of "skeleton", "mesh", "volume". The skeleton is always written.
formats = ["skeleton", "mesh", "volume"]

# Existing files larger than this are treated as done and not regenerated.
min_artifact_bytes = 1000
skip_existing = true

# Resume state. Relative paths are inside the output directory.
state_file = "processing_state.json"

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Parallel workers. More than 1 requires a thread-safe transform provider or
# serialize_transforms = true.
max_workers = 1

# Save state after this many completed items (and always at the end).
checkpoint_every = 10

# Bound on each fetch / transform call, in seconds. 0 disables it.
timeout_secs = 300

# Run all transform calls under one lock.
serialize_transforms = false

# ---------------------------------------------------------------------------
# Region classification
# ---------------------------------------------------------------------------
[classifier]
# Axis and boundary (source-space units) separating the two regions.
axis = "z"
boundary = 150000.0

# Which side of the boundary is the primary region: "at_or_above" or "below".
primary_side = "at_or_above"

# Region assigned when 40-60% of nodes are on the primary side.
default_region = "primary"

# Below this confidence the other region's template is written as well.
spans_both_below = 0.8

# ---------------------------------------------------------------------------
# Routing
# ---------------------------------------------------------------------------
[routing]
# Every item is first moved into this space.
intermediate = "JRC2018F"

# Template names tried in order for each region.
primary = ["JRC2018U"]
secondary = ["JRC2018VNCunisex", "JRCVNC2018U"]

# When no template is reachable, write intermediate-space coordinates.
allow_approximate = true

# When even the intermediate space is unreachable, write raw coordinates.
allow_unregistered = false

# ---------------------------------------------------------------------------
# Transform provider
# ---------------------------------------------------------------------------
[transforms]
# "affine": 3x4 matrices listed below. "command": an external program.
provider = "affine"

# [[transforms.affine]]
# source = "BANC"
# target = "JRC2018F"
# region = "primary"         # optional
# matrix = [[0.001, 0, 0, 0], [0, 0.001, 0, 0], [0, 0, 0.001, 0]]

[transforms.command]
# Placeholders: {input} {output} {source} {target} {region}
program = "Rscript"
args = ["transform_points.R", "{input}", "{output}", "{source}", "{target}", "{region}"]
thread_safe = false

# ---------------------------------------------------------------------------
# Templates
# ---------------------------------------------------------------------------
[[templates]]
id = "VFB_00101567"
name = "JRC2018U"
region = "primary"
extent = { min = [0.0, 0.0, 0.0], max = [627.3695649, 293.1875965, 173.0] }
pitch = [0.5189161, 0.5189161, 1.0]
node_scale = 0.001
units = "microns"

[[templates]]
id = "VFB_00200000"
name = "JRC2018VNCunisex"
aliases = ["JRCVNC2018U"]
region = "secondary"
extent = { min = [0.0, 0.0, 0.0], max = [300.0, 200.0, 400.0] }
pitch = [0.5189161, 0.5189161, 1.0]
node_scale = 0.001
units = "microns"
"##
}
