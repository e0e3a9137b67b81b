//! Object-store abstraction.
//!
//! Every path the core touches is slash-separated and resolved under a
//! project-prefixed root; the trait is indifferent to whether the
//! implementation backs onto local disk or a remote bucket. Errors
//! distinguish *not-found* from *transient* so callers can choose between
//! rebuild-from-scratch and retry (see [`StoreError`]).

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("transient store failure for {path}: {source}")]
    Transient { path: String, source: io::Error },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Uniform file/remote operations the core consumes. All paths are
/// relative to the store's project root.
pub trait ObjectStore: Send + Sync {
    fn exists(&self, path: &str) -> bool;
    fn get(&self, remote: &str, local: &Path) -> StoreResult<()>;
    fn put(&self, local: &Path, remote: &str) -> StoreResult<()>;
    /// Atomic-ish overwrite of `path` with `bytes`.
    fn pipe(&self, path: &str, bytes: &[u8]) -> StoreResult<()>;
    fn cat(&self, path: &str) -> StoreResult<Vec<u8>>;
    fn cat_many(&self, paths: &[String]) -> StoreResult<BTreeMap<String, Vec<u8>>> {
        let mut out = BTreeMap::new();
        for path in paths {
            out.insert(path.clone(), self.cat(path)?);
        }
        Ok(out)
    }
    fn ls(&self, prefix: &str) -> StoreResult<Vec<String>>;
    fn glob(&self, pattern: &str) -> StoreResult<Vec<String>>;
    fn rm(&self, path: &str) -> StoreResult<()>;
    fn rm_many(&self, paths: &[String]) -> StoreResult<()> {
        for path in paths {
            self.rm(path)?;
        }
        Ok(())
    }
    fn size(&self, path: &str) -> StoreResult<u64>;
    fn isfile(&self, path: &str) -> bool;
    fn isdir(&self, path: &str) -> bool;
}

/// Local-disk object store, rooted at `root`. Creates parent directories
/// on write (`auto_mkdir`).
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn transient(path: &str, source: io::Error) -> StoreError {
        StoreError::Transient {
            path: path.to_string(),
            source,
        }
    }
}

impl ObjectStore for LocalObjectStore {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn get(&self, remote: &str, local: &Path) -> StoreResult<()> {
        let src = self.resolve(remote);
        if !src.exists() {
            return Err(StoreError::NotFound(remote.to_string()));
        }
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::transient(remote, e))?;
        }
        fs::copy(&src, local).map_err(|e| Self::transient(remote, e))?;
        Ok(())
    }

    fn put(&self, local: &Path, remote: &str) -> StoreResult<()> {
        let dst = self.resolve(remote);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::transient(remote, e))?;
        }
        fs::copy(local, &dst).map_err(|e| Self::transient(remote, e))?;
        Ok(())
    }

    fn pipe(&self, path: &str, bytes: &[u8]) -> StoreResult<()> {
        let dst = self.resolve(path);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::transient(path, e))?;
        }
        let tmp = dst.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| Self::transient(path, e))?;
        fs::rename(&tmp, &dst).map_err(|e| Self::transient(path, e))?;
        Ok(())
    }

    fn cat(&self, path: &str) -> StoreResult<Vec<u8>> {
        let p = self.resolve(path);
        fs::read(&p).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound(path.to_string())
            } else {
                Self::transient(path, e)
            }
        })
    }

    fn ls(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let dir = self.resolve(prefix);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| Self::transient(prefix, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Self::transient(prefix, e))?;
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            out.push(rel);
        }
        out.sort();
        Ok(out)
    }

    fn glob(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let full_pattern = self.resolve(pattern);
        let matcher = globset::Glob::new(&full_pattern.to_string_lossy())
            .map_err(|e| Self::transient(pattern, io::Error::other(e)))?
            .compile_matcher();

        // Walk from the root of the pattern's literal prefix downward.
        let base = literal_prefix_dir(&self.root, pattern);
        let mut out = Vec::new();
        if base.exists() {
            walk(&base, &mut |p| {
                if matcher.is_match(p) {
                    out.push(
                        p.strip_prefix(&self.root)
                            .unwrap()
                            .to_string_lossy()
                            .replace('\\', "/"),
                    );
                }
            })
            .map_err(|e| Self::transient(pattern, e))?;
        }
        out.sort();
        Ok(out)
    }

    fn rm(&self, path: &str) -> StoreResult<()> {
        let p = self.resolve(path);
        match fs::remove_file(&p) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::transient(path, e)),
        }
    }

    fn size(&self, path: &str) -> StoreResult<u64> {
        let p = self.resolve(path);
        let meta = fs::metadata(&p).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound(path.to_string())
            } else {
                Self::transient(path, e)
            }
        })?;
        Ok(meta.len())
    }

    fn isfile(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn isdir(&self, path: &str) -> bool {
        self.resolve(path).is_dir()
    }
}

/// The directory to start a recursive walk from: everything before the
/// first path segment containing a glob metacharacter.
fn literal_prefix_dir(root: &Path, pattern: &str) -> PathBuf {
    let mut dir = root.to_path_buf();
    for segment in pattern.split('/') {
        if segment.contains(['*', '?', '[']) {
            break;
        }
        dir.push(segment);
    }
    dir
}

fn walk(dir: &Path, visit: &mut impl FnMut(&Path)) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, visit)?;
        } else {
            visit(&path);
        }
    }
    Ok(())
}
