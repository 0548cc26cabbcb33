//! Shared registry of files offered for download
//!
//! The registry is written by the presentation layer and read by request
//! handlers. Readers never hold a live reference: every read returns an
//! immutable [`Snapshot`], and every mutation swaps in a fresh one under a
//! single lock, so a handler can never observe a half-applied batch.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

/// Immutable view of the registry at one point in time
pub type Snapshot = Arc<[FileDescriptor]>;

/// A file offered for download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    name: String,
    #[serde(rename = "size")]
    size_bytes: u64,
    path: String,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size_bytes: u64, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            path: path.into(),
        }
    }

    /// Describe a file on disk
    ///
    /// # Returns
    /// * `Ok(FileDescriptor)` for a regular file
    /// * `Err` if the path cannot be inspected or is not a file
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self::new(name, metadata.len(), path.to_string_lossy()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Registry key
    pub fn path(&self) -> &str {
        &self.path
    }
}

struct Inner {
    files: Snapshot,
    version: u64,
}

/// Thread-safe ordered collection of [`FileDescriptor`]s, unique by path
#[derive(Clone)]
pub struct FileRegistry {
    inner: Arc<RwLock<Inner>>,
    observers: Arc<watch::Sender<Snapshot>>,
}

impl Default for FileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FileRegistry {
    pub fn new() -> Self {
        let files: Snapshot = Arc::from(Vec::new());
        let (observers, _) = watch::channel(files.clone());
        Self {
            inner: Arc::new(RwLock::new(Inner { files, version: 0 })),
            observers: Arc::new(observers),
        }
    }

    /// Insert a descriptor unless its path is already registered
    ///
    /// # Returns
    /// * `true` if the registry changed
    pub fn add(&self, descriptor: FileDescriptor) -> bool {
        self.mutate(|files| {
            if files.iter().any(|f| f.path == descriptor.path) {
                return false;
            }
            files.push(descriptor);
            true
        })
    }

    /// Remove the entry with the given path
    ///
    /// # Returns
    /// * `true` if an entry was removed
    pub fn remove(&self, path: &str) -> bool {
        self.mutate(|files| {
            let before = files.len();
            files.retain(|f| f.path != path);
            files.len() != before
        })
    }

    /// Swap the whole sequence in one step
    ///
    /// Duplicate paths in `list` are collapsed, keeping the first occurrence.
    pub fn replace_all(&self, list: Vec<FileDescriptor>) {
        self.mutate(move |files| {
            let mut deduped: Vec<FileDescriptor> = Vec::with_capacity(list.len());
            for descriptor in list {
                if !deduped.iter().any(|f| f.path == descriptor.path) {
                    deduped.push(descriptor);
                }
            }
            *files = deduped;
            true
        });
    }

    /// Immutable copy of the current contents
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.files.clone()
    }

    /// Incremented on every effective mutation
    pub fn version(&self) -> u64 {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.version
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Observe published snapshots
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.observers.subscribe()
    }

    /// Apply `f` to a private copy and publish it if `f` reports a change
    fn mutate<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Vec<FileDescriptor>) -> bool,
    {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut files = inner.files.to_vec();
        if !f(&mut files) {
            return false;
        }

        let snapshot: Snapshot = Arc::from(files);
        inner.files = snapshot.clone();
        inner.version += 1;
        // Published under the write lock so observers see versions in order
        self.observers.send_replace(snapshot);
        tracing::debug!("File registry now v{} with {} entries", inner.version, inner.files.len());
        true
    }
}
