//! Typed filesystem operations.
//!
//! Thin async wrappers over `tokio::fs`, plus the [`ExistingFile`] newtype
//! separating "a path that has been checked to name a regular file" from a
//! raw path string.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A path validated to point at an existing regular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingFile(PathBuf);

impl ExistingFile {
    /// Validate that `path` names a regular file.
    pub async fn check(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(Self(path))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// File name component of the validated path.
    pub fn file_name(&self) -> &std::ffi::OsStr {
        // A regular file always has a final component.
        self.0.file_name().unwrap_or(self.0.as_os_str())
    }
}

pub async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Create an empty file, failing if it already exists.
pub async fn create_file(path: &Path) -> io::Result<()> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map(|_| ())
}

pub async fn create_directory(path: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(path).await
}

/// A directory removed from disk when the handle drops.
pub fn create_temp_dir() -> io::Result<TempDir> {
    tempfile::tempdir()
}

pub async fn delete_file(path: &Path) -> io::Result<()> {
    tokio::fs::remove_file(path).await
}

pub async fn delete_directory(path: &Path) -> io::Result<()> {
    tokio::fs::remove_dir_all(path).await
}

pub async fn read_text(path: &Path) -> io::Result<String> {
    tokio::fs::read_to_string(path).await
}

pub async fn write_text(path: &Path, contents: &str) -> io::Result<()> {
    tokio::fs::write(path, contents).await
}

pub async fn copy_file(from: &ExistingFile, to: &Path) -> io::Result<u64> {
    tokio::fs::copy(from.path(), to).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_round_trip() {
        let dir = create_temp_dir().unwrap();
        let path = dir.path().join("note.txt");
        write_text(&path, "hello\n").await.unwrap();
        assert_eq!(read_text(&path).await.unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn exists_reports_files_and_directories() {
        let dir = create_temp_dir().unwrap();
        assert!(exists(dir.path()).await);
        assert!(!exists(&dir.path().join("missing")).await);
    }

    #[tokio::test]
    async fn create_file_refuses_to_overwrite() {
        let dir = create_temp_dir().unwrap();
        let path = dir.path().join("once");
        create_file(&path).await.unwrap();
        assert!(create_file(&path).await.is_err());
    }

    #[tokio::test]
    async fn existing_file_rejects_directories_and_missing_paths() {
        let dir = create_temp_dir().unwrap();
        assert!(ExistingFile::check(dir.path()).await.is_err());
        assert!(ExistingFile::check(dir.path().join("nope")).await.is_err());

        let path = dir.path().join("real");
        write_text(&path, "x").await.unwrap();
        let file = ExistingFile::check(&path).await.unwrap();
        assert_eq!(file.path(), path);
        assert_eq!(file.file_name(), "real");
    }

    #[tokio::test]
    async fn copy_preserves_contents() {
        let dir = create_temp_dir().unwrap();
        let src = dir.path().join("src");
        write_text(&src, "payload").await.unwrap();
        let src = ExistingFile::check(&src).await.unwrap();

        let dst = dir.path().join("dst");
        copy_file(&src, &dst).await.unwrap();
        assert_eq!(read_text(&dst).await.unwrap(), "payload");
    }

    #[tokio::test]
    async fn delete_operations_remove_their_targets() {
        let dir = create_temp_dir().unwrap();
        let file = dir.path().join("f");
        write_text(&file, "x").await.unwrap();
        delete_file(&file).await.unwrap();
        assert!(!exists(&file).await);

        let sub = dir.path().join("sub/inner");
        create_directory(&sub).await.unwrap();
        write_text(&sub.join("f"), "x").await.unwrap();
        delete_directory(&dir.path().join("sub")).await.unwrap();
        assert!(!exists(&dir.path().join("sub")).await);
    }
}
