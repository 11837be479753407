//! Filesystem helpers for installed configuration and TLS material.
//!
//! All replacements go through a temporary file in the destination directory
//! followed by `rename`, so readers only ever see the old or the new content.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::render::Fingerprint;

/// Suffix of in-flight temporary files.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Temporary sibling used while replacing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}{}", name, TEMP_SUFFIX))
}

/// Replace `path` with `contents` via write-temp-then-rename.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_with_mode(path, contents, None).await
}

/// Like [`write_atomic`], readable by the owner only.
pub async fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_with_mode(path, contents, Some(0o600)).await
}

async fn write_with_mode(path: &Path, contents: &[u8], mode: Option<u32>) -> io::Result<()> {
    let temp = temp_path(path);
    let result = async {
        let mut file = fs::File::create(&temp).await?;
        if let Some(mode) = mode {
            file.set_permissions(std::fs::Permissions::from_mode(mode)).await?;
        }
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp).await;
    }
    result
}

/// Read a file, `None` when it does not exist.
pub async fn read_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Fingerprint of a file's content, `None` when it does not exist.
pub async fn fingerprint_file(path: &Path) -> io::Result<Option<Fingerprint>> {
    Ok(read_if_exists(path)
        .await?
        .map(|contents| Fingerprint::of(&contents)))
}

/// Remove a file; a missing file is not an error.
pub async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Write only when the content differs. Returns whether a write happened.
pub async fn write_if_changed(path: &Path, contents: &[u8], private: bool) -> io::Result<bool> {
    if read_if_exists(path).await?.as_deref() == Some(contents) {
        return Ok(false);
    }
    if private {
        write_private(path, contents).await?;
    } else {
        write_atomic(path, contents).await?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nginx.conf");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(fs::read(&path).await.unwrap(), b"second");
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_private_file_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.key");

        write_private(&path, b"key").await.unwrap();
        let mode = fs::metadata(&path).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");

        assert_eq!(read_if_exists(&path).await.unwrap(), None);
        assert_eq!(fingerprint_file(&path).await.unwrap(), None);
        remove_if_exists(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_if_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.crt");

        assert!(write_if_changed(&path, b"pem", false).await.unwrap());
        assert!(!write_if_changed(&path, b"pem", false).await.unwrap());
        assert!(write_if_changed(&path, b"rotated", false).await.unwrap());
    }

    #[test]
    fn test_temp_path_is_hidden_sibling() {
        assert_eq!(
            temp_path(Path::new("/etc/nginx/nginx.conf")),
            PathBuf::from("/etc/nginx/.nginx.conf.tmp")
        );
    }
}
