//! Item identity parsing.
//!
//! Item ids arrive from several places: positional CLI arguments, SWC
//! filenames discovered on disk, and the persisted state file. Upstream
//! datasets often decorate them with a dataset prefix, so the same object can
//! show up as `720575941350274352`, `BANC_720575941350274352`, or
//! `VFB_720575941350274352`. Every entry point runs through [`parse_item_id`]
//! so those spellings collapse onto one key.
//!
//! ## Accepted Shapes
//!
//! - `"720575941350274352"` → `720575941350274352`
//! - `"BANC_720575941350274352"` → `720575941350274352` (prefix stripped)
//! - `"  neuron-7 "` → `neuron-7` (whitespace trimmed)
//! - `"BANC_"`, `""`, `"a/b"`, `"../x"` → error
//!
//! Only ASCII alphanumerics, `_` and `-` survive, because the id becomes a
//! directory name under every template.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("empty item id '{0}'")]
    Empty(String),
    #[error("item id '{raw}' contains invalid character '{ch}'")]
    InvalidChar { raw: String, ch: char },
}

/// Validated item identity, safe to use as a path component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the id is purely numeric (the usual segment-id shape).
    pub fn is_numeric(&self) -> bool {
        self.0.bytes().all(|b| b.is_ascii_digit())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ItemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Parse a raw id, stripping the first matching prefix from `strip_prefixes`.
pub fn parse_item_id(raw: &str, strip_prefixes: &[String]) -> Result<ItemId, IdentityError> {
    let trimmed = raw.trim();
    let bare = strip_prefixes
        .iter()
        .filter(|p| !p.is_empty())
        .find_map(|p| trimmed.strip_prefix(p.as_str()))
        .unwrap_or(trimmed);

    if bare.is_empty() {
        return Err(IdentityError::Empty(raw.to_string()));
    }
    if let Some(ch) = bare
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(IdentityError::InvalidChar {
            raw: raw.to_string(),
            ch,
        });
    }
    Ok(ItemId(bare.to_string()))
}
