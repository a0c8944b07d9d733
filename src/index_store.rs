//! Durable keyed storage for serialized index artifacts.
//!
//! One file per document under a configurable root, written atomically.
//! A missing artifact is a recoverable condition: the document simply
//! contributes nothing to retrieval.

use std::path::{Path, PathBuf};

use crate::error::Result;

pub struct IndexStore {
    root: PathBuf,
}

impl IndexStore {
    /// Open the store, creating the root directory if needed.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn artifact_path(&self, document_id: &str) -> PathBuf {
        self.root.join(format!("doc_{document_id}.index"))
    }

    /// Store an artifact, fully replacing any prior one for the same key.
    /// Writes to a temp file and renames so readers never see a torn write.
    pub fn put(&self, document_id: &str, bytes: &[u8]) -> Result<()> {
        let path = self.artifact_path(document_id);
        let tmp = self.root.join(format!(".doc_{document_id}.index.tmp"));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Fetch an artifact. `None` means the document has no artifact.
    pub fn get(&self, document_id: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.artifact_path(document_id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an artifact if present (document deletion cascade).
    pub fn delete(&self, document_id: &str) -> Result<()> {
        match std::fs::remove_file(self.artifact_path(document_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
