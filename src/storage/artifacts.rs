//! Durable storage for serialized model artifacts
//!
//! Artifacts are addressed by `(project, model hash)`. The filesystem store
//! lays them out as `{root}/projects/{project}/models/{hash}.json` and
//! replaces files by atomic rename, so a reader sees either the previous
//! artifact or the new one, never a partial write.

use super::traits::{ProjectId, StorageError, StorageResult};
use dashmap::DashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const ARTIFACT_EXT: &str = "json";

/// Byte storage for model artifacts
pub trait ArtifactStore: Send + Sync {
    /// Read an artifact. `Ok(None)` when none has been written.
    fn read(&self, project: ProjectId, hash: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Write an artifact, replacing any previous one atomically
    fn write(&self, project: ProjectId, hash: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Delete an artifact. Fails with `ArtifactNotFound` when absent.
    fn delete(&self, project: ProjectId, hash: &str) -> StorageResult<()>;

    fn exists(&self, project: ProjectId, hash: &str) -> StorageResult<bool>;

    /// Hashes of every artifact stored for a project
    fn list(&self, project: ProjectId) -> StorageResult<Vec<String>>;

    /// Drop every artifact of a project
    fn delete_project(&self, project: ProjectId) -> StorageResult<()>;
}

/// Write `bytes` to `path` via a temporary sibling, fsync, then rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::Corrupt(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| -> StorageResult<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Filesystem-backed artifact store
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn models_dir(&self, project: ProjectId) -> PathBuf {
        self.root
            .join("projects")
            .join(project.to_string())
            .join("models")
    }

    fn path(&self, project: ProjectId, hash: &str) -> PathBuf {
        self.models_dir(project)
            .join(format!("{}.{}", hash, ARTIFACT_EXT))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn read(&self, project: ProjectId, hash: &str) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(self.path(project, hash)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, project: ProjectId, hash: &str, bytes: &[u8]) -> StorageResult<()> {
        write_atomic(&self.path(project, hash), bytes)
    }

    fn delete(&self, project: ProjectId, hash: &str) -> StorageResult<()> {
        match fs::remove_file(self.path(project, hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::ArtifactNotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, project: ProjectId, hash: &str) -> StorageResult<bool> {
        Ok(self.path(project, hash).is_file())
    }

    fn list(&self, project: ProjectId) -> StorageResult<Vec<String>> {
        let dir = self.models_dir(project);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut hashes = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                // Skip in-flight temporaries
                if !stem.starts_with('.') {
                    hashes.push(stem.to_string());
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    fn delete_project(&self, project: ProjectId) -> StorageResult<()> {
        let dir = self.models_dir(project);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory artifact store (useful for testing)
#[derive(Default)]
pub struct InMemoryArtifactStore {
    artifacts: DashMap<(ProjectId, String), Vec<u8>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn read(&self, project: ProjectId, hash: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .artifacts
            .get(&(project, hash.to_string()))
            .map(|entry| entry.value().clone()))
    }

    fn write(&self, project: ProjectId, hash: &str, bytes: &[u8]) -> StorageResult<()> {
        self.artifacts
            .insert((project, hash.to_string()), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, project: ProjectId, hash: &str) -> StorageResult<()> {
        self.artifacts
            .remove(&(project, hash.to_string()))
            .map(|_| ())
            .ok_or_else(|| StorageError::ArtifactNotFound(hash.to_string()))
    }

    fn exists(&self, project: ProjectId, hash: &str) -> StorageResult<bool> {
        Ok(self.artifacts.contains_key(&(project, hash.to_string())))
    }

    fn list(&self, project: ProjectId) -> StorageResult<Vec<String>> {
        let mut hashes: Vec<String> = self
            .artifacts
            .iter()
            .filter(|entry| entry.key().0 == project)
            .map(|entry| entry.key().1.clone())
            .collect();
        hashes.sort();
        Ok(hashes)
    }

    fn delete_project(&self, project: ProjectId) -> StorageResult<()> {
        self.artifacts.retain(|key, _| key.0 != project);
        Ok(())
    }
}
