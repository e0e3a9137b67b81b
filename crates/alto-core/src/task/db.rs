//! Persistent task signature DB at `<project>/.alto.json`.
//!
//! Distinct from [`crate::store::ObjectStore`]: the build-DB is always
//! local to the project checkout (spec.md §6 "Build-DB layout"), so it is
//! read and written directly against the filesystem rather than routed
//! through the pluggable store.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AltoError;
use crate::paths::ALTO_DB_FILE;

#[derive(Debug, Default, Serialize, Deserialize)]
struct SignatureDb {
    #[serde(flatten)]
    signatures: HashMap<String, Value>,
}

/// A task identity -> signature mapping backed by a single JSON file.
pub struct BuildDb {
    path: PathBuf,
    db: SignatureDb,
}

impl BuildDb {
    /// Loads `<project_root>/.alto.json`, or starts empty if absent.
    pub fn load(project_root: &Path) -> Result<Self, AltoError> {
        let path = project_root.join(ALTO_DB_FILE);
        let db = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| AltoError::config(format!("malformed build db at {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SignatureDb::default(),
            Err(e) => return Err(AltoError::config(format!("cannot read {}: {e}", path.display()))),
        };
        Ok(Self { path, db })
    }

    pub fn get(&self, identity: &str) -> Option<&Value> {
        self.db.signatures.get(identity)
    }

    pub fn set(&mut self, identity: &str, signature: Value) {
        self.db.signatures.insert(identity.to_string(), signature);
    }

    pub fn save(&self) -> Result<(), AltoError> {
        let bytes = serde_json::to_vec_pretty(&self.db)
            .map_err(|e| AltoError::config(format!("cannot serialize build db: {e}")))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| AltoError::config(format!("cannot create {}: {e}", parent.display())))?;
        }
        fs::write(&self.path, bytes)
            .map_err(|e| AltoError::config(format!("cannot write {}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_empty_when_file_is_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let db = BuildDb::load(tmp.path()).unwrap();
        assert!(db.get("build:tap-csv").is_none());
    }

    #[test]
    fn set_then_save_then_reload_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut db = BuildDb::load(tmp.path()).unwrap();
        db.set("build:tap-csv", serde_json::json!({"requirement": "tap-csv==1.0"}));
        db.save().unwrap();

        let reloaded = BuildDb::load(tmp.path()).unwrap();
        assert_eq!(
            reloaded.get("build:tap-csv").unwrap(),
            &serde_json::json!({"requirement": "tap-csv==1.0"})
        );
        assert!(tmp.path().join(ALTO_DB_FILE).exists());
    }
}
