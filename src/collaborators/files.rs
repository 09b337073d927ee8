//! Directory-backed geometry and mesh sources.
//!
//! Files may be named by the bare id or with one of the source prefixes that
//! id parsing strips (`BANC_5.swc` serves item `5`). The bare name wins when
//! both exist.

use super::{FetchError, GeometrySource, MeshSource};
use crate::geometry::{Mesh, Skeleton};
use crate::identity::ItemId;
use std::io;
use std::path::{Path, PathBuf};

/// Reads `{dir}/{id}.swc`, or `{dir}/{prefix}{id}.swc`.
#[derive(Debug, Clone)]
pub struct SwcDirectory {
    dir: PathBuf,
    prefixes: Vec<String>,
}

impl SwcDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prefixes: Vec::new(),
        }
    }

    /// Also look for files named with these prefixes.
    pub fn with_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.prefixes = prefixes;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &ItemId) -> PathBuf {
        locate(&self.dir, id, "swc", &self.prefixes)
    }
}

impl GeometrySource for SwcDirectory {
    fn fetch(&self, id: &ItemId) -> Result<Skeleton, FetchError> {
        let text = read(&self.path_for(id), id)?;
        Skeleton::parse_swc(&text).map_err(|e| FetchError::Unreadable {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Reads `{dir}/{id}.obj`, or `{dir}/{prefix}{id}.obj`. A missing file means
/// the item has no native mesh.
#[derive(Debug, Clone)]
pub struct ObjDirectory {
    dir: PathBuf,
    prefixes: Vec<String>,
}

impl ObjDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prefixes: Vec::new(),
        }
    }

    pub fn with_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.prefixes = prefixes;
        self
    }
}

impl MeshSource for ObjDirectory {
    fn fetch(&self, id: &ItemId) -> Result<Option<Mesh>, FetchError> {
        let path = locate(&self.dir, id, "obj", &self.prefixes);
        let text = match read(&path, id) {
            Ok(text) => text,
            Err(FetchError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mesh = Mesh::parse_obj(&text).map_err(|e| FetchError::Unreadable {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        Ok((!mesh.is_empty()).then_some(mesh))
    }
}

/// First existing spelling of the item's file; the bare name if none exist.
fn locate(dir: &Path, id: &ItemId, extension: &str, prefixes: &[String]) -> PathBuf {
    let bare = dir.join(format!("{id}.{extension}"));
    if bare.is_file() {
        return bare;
    }
    prefixes
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| dir.join(format!("{p}{id}.{extension}")))
        .find(|path| path.is_file())
        .unwrap_or(bare)
}

fn read(path: &Path, id: &ItemId) -> Result<String, FetchError> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => FetchError::NotFound(id.to_string()),
        _ => FetchError::Unreadable {
            id: id.to_string(),
            reason: format!("{}: {e}", path.display()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::parse_item_id;
    use std::fs;
    use tempfile::TempDir;

    fn id(raw: &str) -> ItemId {
        parse_item_id(raw, &[]).unwrap()
    }

    #[test]
    fn swc_directory_reads_by_id() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("42.swc"), "1 1 0 0 0 1 -1\n2 3 1 0 0 1 1\n").unwrap();
        let source = SwcDirectory::new(tmp.path());
        assert_eq!(source.fetch(&id("42")).unwrap().len(), 2);
    }

    #[test]
    fn swc_directory_not_found_is_distinct() {
        let tmp = TempDir::new().unwrap();
        let source = SwcDirectory::new(tmp.path());
        assert!(matches!(source.fetch(&id("1")), Err(FetchError::NotFound(_))));
    }

    #[test]
    fn swc_directory_reports_bad_files() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("3.swc"), "1 1 0 0\n").unwrap();
        let source = SwcDirectory::new(tmp.path());
        assert!(matches!(source.fetch(&id("3")), Err(FetchError::Unreadable { .. })));
    }

    #[test]
    fn swc_directory_finds_prefixed_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("BANC_5.swc"), "1 1 0 0 0 1 -1\n").unwrap();
        let source = SwcDirectory::new(tmp.path()).with_prefixes(vec!["BANC_".into(), "VFB_".into()]);
        assert_eq!(source.path_for(&id("5")), tmp.path().join("BANC_5.swc"));
        assert_eq!(source.fetch(&id("5")).unwrap().len(), 1);
    }

    #[test]
    fn swc_directory_prefers_bare_name() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("5.swc"), "1 1 0 0 0 1 -1\n2 3 1 0 0 1 1\n").unwrap();
        fs::write(tmp.path().join("BANC_5.swc"), "1 1 0 0 0 1 -1\n").unwrap();
        let source = SwcDirectory::new(tmp.path()).with_prefixes(vec!["BANC_".into()]);
        assert_eq!(source.fetch(&id("5")).unwrap().len(), 2);
    }

    #[test]
    fn swc_directory_without_prefixes_ignores_prefixed_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("BANC_5.swc"), "1 1 0 0 0 1 -1\n").unwrap();
        let source = SwcDirectory::new(tmp.path());
        assert!(matches!(source.fetch(&id("5")), Err(FetchError::NotFound(_))));
    }

    #[test]
    fn obj_directory_finds_prefixed_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("VFB_9.obj"), "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n").unwrap();
        let source = ObjDirectory::new(tmp.path()).with_prefixes(vec!["BANC_".into(), "VFB_".into()]);
        assert_eq!(source.fetch(&id("9")).unwrap().unwrap().faces.len(), 1);
    }

    #[test]
    fn obj_directory_missing_file_is_no_mesh() {
        let tmp = TempDir::new().unwrap();
        let source = ObjDirectory::new(tmp.path());
        assert!(source.fetch(&id("9")).unwrap().is_none());
    }

    #[test]
    fn obj_directory_reads_mesh() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("9.obj"), "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n").unwrap();
        let mesh = ObjDirectory::new(tmp.path()).fetch(&id("9")).unwrap().unwrap();
        assert_eq!(mesh.faces.len(), 1);
    }
}
