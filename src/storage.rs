//! Directory-backed file storage.
//!
//! Files live flat in a single directory and are addressed by name. Names
//! that would escape the directory are rejected.
//!
//! Concurrent writes to the same name are not serialized: the last writer
//! wins.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, trace};

/// Storage errors
#[derive(Debug)]
pub enum StorageError {
    /// No file with this name
    NotFound(String),
    /// Name is empty or contains path components
    InvalidName(String),
    /// Filesystem failure
    Io(io::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::NotFound(name) => write!(f, "File {} not found", name),
            StorageError::InvalidName(name) => write!(f, "Invalid filename: {:?}", name),
            StorageError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}

/// Flat file store rooted at one directory
#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Open a store, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Arc<Self>, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        info!(root = %root.display(), "Initializing storage");
        Ok(Arc::new(Self { root }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client supplied name inside the root
    fn path_for(&self, name: &str) -> Result<PathBuf, StorageError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains('/')
            && !name.contains('\\')
            && !name.contains('\0');
        if !valid {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    /// File names in directory enumeration order
    pub async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        trace!(count = names.len(), "Listed files");
        Ok(names)
    }

    /// Read a whole file
    pub async fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(name)?;
        match fs::read(&path).await {
            Ok(bytes) => {
                trace!(name, size = bytes.len(), "File read");
                Ok(bytes)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Create or overwrite a file
    pub async fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(name)?;
        fs::write(&path, data).await?;
        trace!(name, size = data.len(), "File written");
        Ok(())
    }

    /// Remove a file
    pub async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                trace!(name, "File deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, Arc<Storage>) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("files")).unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_write_read() {
        let (_dir, storage) = open();

        storage.write("a.bin", b"hello").await.unwrap();
        assert_eq!(storage.read("a.bin").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_overwrite_last_write_wins() {
        let (_dir, storage) = open();

        storage.write("a.bin", b"first").await.unwrap();
        storage.write("a.bin", b"second").await.unwrap();
        assert_eq!(storage.read("a.bin").await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_read_missing() {
        let (_dir, storage) = open();

        match storage.read("nope.bin").await {
            Err(StorageError::NotFound(name)) => assert_eq!(name, "nope.bin"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_is_stable() {
        let (_dir, storage) = open();

        assert!(storage.list().await.unwrap().is_empty());

        storage.write("a.bin", b"1").await.unwrap();
        storage.write("b.bin", b"2").await.unwrap();
        std::fs::create_dir(storage.root().join("subdir")).unwrap();

        let mut first = storage.list().await.unwrap();
        let mut second = storage.list().await.unwrap();
        first.sort();
        second.sort();
        assert_eq!(first, vec!["a.bin", "b.bin"]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, storage) = open();

        storage.write("a.bin", b"1").await.unwrap();
        storage.delete("a.bin").await.unwrap();
        assert!(matches!(
            storage.delete("a.bin").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_components() {
        let (_dir, storage) = open();

        for name in ["", "..", "../escape", "sub/file", "a\\b"] {
            assert!(
                matches!(
                    storage.write(name, b"x").await,
                    Err(StorageError::InvalidName(_))
                ),
                "accepted {:?}",
                name
            );
        }
    }
}
