//! Artifact generation for one routed target.
//!
//! For each target the generator writes, in order:
//!
//! 1. **Skeleton** (`volume.swc`): always, and first. Failure here is fatal
//!    for the item; everything else is derived from the skeleton.
//! 2. **Mesh** (`volume_man.obj`): the item's native mesh moved through the
//!    same transform steps as the skeleton, or a tube mesh synthesized from
//!    the skeleton when no native mesh can be had.
//! 3. **Volume** (`volume.nrrd`): nodes rasterized into the template's fixed
//!    voxel grid, gzip-encoded NRRD.
//!
//! Non-primary targets get the skeleton only. Mesh and volume failures are
//! logged and left out of the result.
//!
//! ## Skip rule
//!
//! Before writing a format, an existing file larger than `min_bytes` is taken
//! as already done and reported as present rather than created. This is what
//! makes re-runs cheap, and it means a stale file is only replaced by
//! deleting it or by turning `skip_existing` off.
//!
//! ## Atomic writes
//!
//! Every file is written to a temp file in its target directory and renamed
//! into place, so an interrupted run leaves either the old file, the new file,
//! or nothing, never a truncated file that the skip rule would accept.
//!
//! A `metadata.json` sidecar describing the target is rewritten whenever at
//! least one format was created.

mod volume;

pub use volume::{MARK, VoxelGrid, rasterize, write_nrrd};

use crate::geometry::{Mesh, Skeleton, tube_mesh};
use crate::identity::ItemId;
use crate::paths::PathResolver;
use crate::route::{RouteKind, RoutedTarget};
use crate::types::{Format, Point};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Sidecar filename, next to the artifacts.
pub const METADATA_FILENAME: &str = "metadata.json";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("{format}: IO error on {path}: {source}")]
    Io {
        format: Format,
        path: PathBuf,
        source: io::Error,
    },
    #[error("{format}: {reason}")]
    Invalid { format: Format, reason: String },
}

/// Where a written mesh came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshOrigin {
    Native,
    Tube,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Created,
    Present,
}

/// Result of generating one target's artifacts.
#[derive(Debug, Default)]
pub struct TargetArtifacts {
    pub files: BTreeMap<Format, PathBuf>,
    pub outcomes: BTreeMap<Format, FileOutcome>,
    /// Non-fatal failures, already logged.
    pub failed: Vec<ArtifactError>,
    pub mesh_origin: Option<MeshOrigin>,
    /// Nodes that fell outside the template's voxel grid.
    pub outside_grid: usize,
}

impl TargetArtifacts {
    pub fn created(&self) -> impl Iterator<Item = Format> + '_ {
        self.outcomes
            .iter()
            .filter(|(_, o)| **o == FileOutcome::Created)
            .map(|(f, _)| *f)
    }

    pub fn present(&self) -> impl Iterator<Item = Format> + '_ {
        self.outcomes
            .iter()
            .filter(|(_, o)| **o == FileOutcome::Present)
            .map(|(f, _)| *f)
    }
}

/// One target's worth of input to [`ArtifactGenerator::generate`].
pub struct TargetInput<'a> {
    pub item: &'a ItemId,
    pub source_space: &'a str,
    pub routed: &'a RoutedTarget,
    /// Skeleton with positions already in the target space.
    pub skeleton: &'a Skeleton,
    pub is_primary: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactGenerator {
    paths: PathResolver,
    formats: Vec<Format>,
    skip_existing: bool,
    min_bytes: u64,
}

impl ArtifactGenerator {
    pub fn new(paths: PathResolver, formats: Vec<Format>, skip_existing: bool, min_bytes: u64) -> Self {
        Self {
            paths,
            formats,
            skip_existing,
            min_bytes,
        }
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    /// Formats to produce for a target: skeleton first, then the requested
    /// extras for primary targets.
    pub fn formats_for(&self, is_primary: bool) -> Vec<Format> {
        let mut formats = vec![Format::Skeleton];
        if is_primary {
            formats.extend(self.formats.iter().copied().filter(|f| *f != Format::Skeleton));
        }
        formats
    }

    fn already_present(&self, path: &Path) -> bool {
        self.skip_existing && is_present(path, self.min_bytes)
    }

    /// Write the target's artifacts.
    ///
    /// `native_mesh` is only called when a mesh is actually going to be
    /// written; it returns the transformed native mesh or `None`.
    pub fn generate<F>(&self, input: &TargetInput<'_>, native_mesh: F) -> Result<TargetArtifacts, ArtifactError>
    where
        F: FnOnce() -> Option<Mesh>,
    {
        let template = &input.routed.template;
        let scale = template.node_scale;
        let dir = self
            .paths
            .ensure_target_dir(input.item, &template.id)
            .map_err(|source| ArtifactError::Io {
                format: Format::Skeleton,
                path: self.paths.target_dir(input.item, &template.id),
                source,
            })?;

        let mut result = TargetArtifacts::default();
        let mut native_mesh = Some(native_mesh);

        for format in self.formats_for(input.is_primary) {
            let path = dir.join(format.filename());
            if self.already_present(&path) {
                tracing::debug!(item = %input.item, template = %template.id, %format, "already present");
                result.files.insert(format, path);
                result.outcomes.insert(format, FileOutcome::Present);
                continue;
            }

            let written = match format {
                Format::Skeleton => write_atomic(&path, format, |w| input.skeleton.write_swc(w, scale)),
                Format::Mesh => {
                    let native = native_mesh.take().and_then(|f| f());
                    let (mesh, origin) = match native {
                        Some(mesh) => (scale_mesh(&mesh, scale), MeshOrigin::Native),
                        None => (tube_mesh(input.skeleton, scale), MeshOrigin::Tube),
                    };
                    result.mesh_origin = Some(origin);
                    write_atomic(&path, format, |w| mesh.write_obj(w))
                }
                Format::Volume => {
                    let scaled: Vec<Point> = input
                        .skeleton
                        .positions()
                        .into_iter()
                        .map(|p| [p[0] * scale, p[1] * scale, p[2] * scale])
                        .collect();
                    let (grid, outside) = rasterize(template, &scaled);
                    if outside > 0 {
                        tracing::warn!(
                            item = %input.item,
                            template = %template.id,
                            outside,
                            total = scaled.len(),
                            "nodes outside template grid"
                        );
                    }
                    result.outside_grid = outside;
                    write_atomic(&path, format, |w| write_nrrd(w, &grid, &template.units))
                }
            };

            match written {
                Ok(()) => {
                    tracing::debug!(item = %input.item, template = %template.id, %format, "written");
                    result.files.insert(format, path);
                    result.outcomes.insert(format, FileOutcome::Created);
                }
                Err(e) if format == Format::Skeleton => return Err(e),
                Err(e) => {
                    tracing::warn!(item = %input.item, template = %template.id, error = %e, "format failed");
                    result.failed.push(e);
                }
            }
        }

        if result.created().next().is_some()
            && let Err(e) = write_sidecar(&dir, input, &result)
        {
            tracing::warn!(item = %input.item, template = %template.id, error = %e, "could not write metadata sidecar");
        }
        Ok(result)
    }
}

/// True if `path` exists and is larger than `min_bytes`.
pub fn is_present(path: &Path, min_bytes: u64) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > min_bytes)
}

fn scale_mesh(mesh: &Mesh, scale: f64) -> Mesh {
    Mesh {
        vertices: mesh
            .vertices
            .iter()
            .map(|v| [v[0] * scale, v[1] * scale, v[2] * scale])
            .collect(),
        faces: mesh.faces.clone(),
    }
}

/// Write through a temp file in the destination directory, then rename.
pub fn write_atomic<F>(path: &Path, format: Format, write: F) -> Result<(), ArtifactError>
where
    F: FnOnce(&mut BufWriter<&mut std::fs::File>) -> io::Result<()>,
{
    let io_err = |source: io::Error| ArtifactError::Io {
        format,
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().ok_or_else(|| ArtifactError::Invalid {
        format,
        reason: format!("{} has no parent directory", path.display()),
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        write(&mut writer).map_err(io_err)?;
        writer.flush().map_err(io_err)?;
    }
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// SHA-256 of a file's contents, as lowercase hex.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarFile {
    pub path: String,
    pub sha256: String,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sidecar {
    pub item_id: String,
    pub source_space: String,
    pub template_id: String,
    pub template_name: String,
    pub route: RouteKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate: Option<String>,
    pub primary: bool,
    pub processed_at: DateTime<Utc>,
    pub units: String,
    pub voxel_pitch: Point,
    pub node_count: usize,
    pub cable_length: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_origin: Option<MeshOrigin>,
    pub files: BTreeMap<Format, SidecarFile>,
}

fn write_sidecar(dir: &Path, input: &TargetInput<'_>, result: &TargetArtifacts) -> Result<(), ArtifactError> {
    let template = &input.routed.template;
    let mut files = BTreeMap::new();
    for (format, path) in &result.files {
        let sha256 = hash_file(path).map_err(|source| ArtifactError::Io {
            format: *format,
            path: path.clone(),
            source,
        })?;
        files.insert(
            *format,
            SidecarFile {
                path: path.to_string_lossy().into_owned(),
                sha256,
            },
        );
    }
    let sidecar = Sidecar {
        item_id: input.item.to_string(),
        source_space: input.source_space.to_string(),
        template_id: template.id.clone(),
        template_name: template.name.clone(),
        route: input.routed.kind,
        alternate: input.routed.alternate.clone(),
        primary: input.is_primary,
        processed_at: Utc::now(),
        units: template.units.clone(),
        voxel_pitch: template.pitch,
        node_count: input.skeleton.len(),
        cable_length: input.skeleton.cable_length() * template.node_scale,
        mesh_origin: result.mesh_origin,
        files,
    };
    let path = dir.join(METADATA_FILENAME);
    write_atomic(&path, Format::Skeleton, |w| {
        serde_json::to_writer_pretty(&mut *w, &sidecar).map_err(io::Error::other)?;
        w.write_all(b"\n")
    })
}
