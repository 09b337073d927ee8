//! # Treewarp
//!
//! Resumable batch registration of 3D tree skeletons into template spaces.
//! Each item is a neuron skeleton in a source coordinate space; treewarp
//! decides which anatomical region(s) it occupies, transforms it into every
//! matching template, and writes skeleton, mesh and volume artifacts per
//! template. Progress is checkpointed so an interrupted batch picks up where
//! it stopped.
//!
//! # Architecture
//!
//! ```text
//! ids ─► plan ─► fetch ─► classify ─► route ─► generate ─► record ─► checkpoint
//!         │                 │           │          │
//!       state           classify      route    artifacts
//! ```
//!
//! Everything that touches the outside world (geometry storage, transform
//! execution, native meshes) sits behind a trait in [`collaborators`], so the
//! orchestration runs unchanged against files on disk, an external transform
//! program, or in-memory test doubles.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`pipeline`] | Work planning, the worker pool, per-item processing, checkpoint cadence |
//! | [`classify`] | Region decision from node positions along one axis |
//! | [`route`] | Transform chains, candidate templates, approximate and unregistered fallbacks |
//! | [`artifacts`] | Skeleton, mesh and volume writers, skip rules, `metadata.json` sidecar |
//! | [`state`] | Persistent per-item records, atomic checkpoints, legacy upgrade |
//! | [`paths`] | Output root override and per-item/per-template layout |
//! | [`collaborators`] | Geometry, mesh and transform traits plus shipped implementations |
//! | [`geometry`] | SWC skeletons, OBJ meshes, tube mesh generation |
//! | [`identity`] | Item id parsing and normalization |
//! | [`config`] | `treewarp.toml` loading, merging and validation |
//! | [`scan`] | Work-list discovery from the skeleton directory |
//! | [`types`] | Shared vocabulary: points, regions, formats, template spaces |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Success Means Every File Exists
//!
//! An item is only recorded as a success after its primary skeleton is on
//! disk. A resumed run trusts success records and skips those items entirely;
//! anything else (failed, pending, unknown) is retried.
//!
//! ## Atomic Writes Everywhere
//!
//! Artifacts and the state file are written to a temporary file beside the
//! destination and renamed into place. A crash leaves either the old file or
//! the new one, never a truncated file that the size-based skip rule would
//! mistake for a finished artifact.

pub mod artifacts;
pub mod classify;
pub mod collaborators;
pub mod config;
pub mod geometry;
pub mod identity;
pub mod output;
pub mod paths;
pub mod pipeline;
pub mod route;
pub mod scan;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;
