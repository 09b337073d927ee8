//! Work-list discovery.
//!
//! When no ids are given on the command line, the work list is every `*.swc`
//! file directly inside the skeleton directory, by file stem:
//!
//! ```text
//! skeletons/
//! ├── 720575941350274352.swc   → "720575941350274352"
//! ├── BANC_720575941350274353.swc → "BANC_720575941350274353" (prefix stripped later)
//! ├── notes.txt                → ignored
//! └── old/                     → ignored (not recursed)
//! ```
//!
//! Ids are returned raw and sorted; parsing and prefix stripping happen when
//! the run is planned, so malformed names surface as failed items rather than
//! disappearing silently. [`SwcDirectory`](crate::collaborators::SwcDirectory)
//! built with the same prefixes finds `BANC_…` files again by the stripped id.

use std::path::Path;
use thiserror::Error;
use walkdir::WalkDir;

const SKELETON_EXTENSION: &str = "swc";

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("skeleton directory {0} does not exist")]
    MissingDir(String),
    #[error("could not list skeleton directory: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Raw ids of every skeleton file in `dir`, sorted.
pub fn discover_items(dir: &Path) -> Result<Vec<String>, ScanError> {
    if !dir.is_dir() {
        return Err(ScanError::MissingDir(dir.display().to_string()));
    }
    let mut ids = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        let is_swc = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case(SKELETON_EXTENSION));
        if !is_swc {
            continue;
        }
        if let Some(stem) = path.file_stem() {
            ids.push(stem.to_string_lossy().into_owned());
        }
    }
    Ok(ids)
}
