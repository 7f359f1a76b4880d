//! Persistent code storage.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::{Source, SourceRegistry};
use crate::base::SourceId;
use crate::error::{CoreError, Result};

/// File extension of loadable sources.
pub const SOURCE_EXTENSION: &str = "pure";

/// Where source content is persisted.
pub trait CodeStorage: Send + Sync {
    /// Current content, or `None` if the source no longer exists.
    fn read(&self, id: &SourceId) -> Result<Option<String>>;
    fn write(&self, id: &SourceId, content: &str) -> Result<()>;
    fn delete(&self, id: &SourceId) -> Result<()>;
    fn move_source(&self, from: &SourceId, to: &SourceId) -> Result<()>;
    /// Ids of every stored source, sorted.
    fn list(&self) -> Result<Vec<SourceId>>;
}

/// Sources stored as files below a root directory.
///
/// Source id `/repo/a.pure` lives at `<root>/repo/a.pure`.
#[derive(Clone, Debug)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, id: &SourceId) -> PathBuf {
        self.root.join(id.as_str().trim_start_matches('/'))
    }

    fn id_for(&self, path: &Path) -> Option<SourceId> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments: Vec<_> = relative.components().map(|c| c.as_os_str().to_string_lossy()).collect();
        Some(SourceId::new(format!("/{}", segments.join("/"))))
    }

    /// Register every `*.pure` file below the root as a mutable source.
    pub fn load_directory(&self, registry: &SourceRegistry) -> Result<usize> {
        if !self.root.is_dir() {
            return Err(CoreError::invalid_argument(format!(
                "Directory not found: {}",
                self.root.display()
            )));
        }
        let mut errors = Vec::new();
        let mut loaded = 0;
        for id in self.list()? {
            let result = self
                .read(&id)
                .and_then(|content| registry.register_source(Source::new(id.clone(), content.unwrap_or_default(), false, false)));
            match result {
                Ok(_) => loaded += 1,
                Err(e) => errors.push(format!("{id}: {e}")),
            }
        }
        if errors.is_empty() {
            tracing::debug!(root = %self.root.display(), loaded, "loaded sources from directory");
            Ok(loaded)
        } else {
            Err(CoreError::invalid_argument(format!(
                "Failed to load {} file(s):\n  {}",
                errors.len(),
                errors.join("\n  ")
            )))
        }
    }
}

impl CodeStorage for DirectoryStorage {
    fn read(&self, id: &SourceId) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(id)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, id: &SourceId, content: &str) -> Result<()> {
        let path = self.path_for(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    fn delete(&self, id: &SourceId) -> Result<()> {
        match fs::remove_file(self.path_for(id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn move_source(&self, from: &SourceId, to: &SourceId) -> Result<()> {
        let target = self.path_for(to);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.path_for(from), target)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<SourceId>> {
        let mut ids = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = entry.map_err(|e| CoreError::Io(e.into()))?;
            let is_source = entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == SOURCE_EXTENSION);
            if let Some(id) = is_source.then(|| self.id_for(entry.path())).flatten() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
