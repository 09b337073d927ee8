//! Deterministic output addressing.
//!
//! Every artifact lives at
//!
//! ```text
//! {base}/{template_id}/{item_id}/{format filename}
//! ```
//!
//! The filename is a constant per format ([`Format::filename`]); two items
//! never collide because their directories differ. `base` is the nominal
//! output directory, except that when the nominal path starts with the
//! configured default prefix and `TREEWARP_OUTPUT_ROOT` is set, that prefix
//! is swapped for the environment value. The environment is read once, when
//! the resolver is built.

use crate::identity::ItemId;
use crate::types::Format;
use std::io;
use std::path::{Path, PathBuf};

/// Environment variable that relocates the default output prefix.
pub const OUTPUT_ROOT_ENV: &str = "TREEWARP_OUTPUT_ROOT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    base: PathBuf,
}

impl PathResolver {
    /// Build a resolver with an explicit override (tests, embedding).
    pub fn new(nominal: &Path, default_prefix: &Path, override_root: Option<&Path>) -> Self {
        Self {
            base: substitute_prefix(nominal, default_prefix, override_root),
        }
    }

    /// Build a resolver, reading [`OUTPUT_ROOT_ENV`] now.
    pub fn from_env(nominal: &Path, default_prefix: &Path) -> Self {
        let override_root = std::env::var_os(OUTPUT_ROOT_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self::new(nominal, default_prefix, override_root.as_deref())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn target_dir(&self, item: &ItemId, template_id: &str) -> PathBuf {
        self.base.join(template_id).join(item.as_str())
    }

    pub fn artifact_path(&self, item: &ItemId, template_id: &str, format: Format) -> PathBuf {
        self.target_dir(item, template_id).join(format.filename())
    }

    /// Create the target directory (and parents) if needed. Idempotent.
    pub fn ensure_target_dir(&self, item: &ItemId, template_id: &str) -> io::Result<PathBuf> {
        let dir = self.target_dir(item, template_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Replace `default_prefix` at the start of `nominal` with `override_root`.
///
/// Component-wise: `/data/out` does not start with `/data/o`.
pub fn substitute_prefix(
    nominal: &Path,
    default_prefix: &Path,
    override_root: Option<&Path>,
) -> PathBuf {
    match override_root {
        Some(root) => match nominal.strip_prefix(default_prefix) {
            Ok(rest) if rest.as_os_str().is_empty() => root.to_path_buf(),
            Ok(rest) => root.join(rest),
            Err(_) => nominal.to_path_buf(),
        },
        None => nominal.to_path_buf(),
    }
}
