//! Object storage seam and archive packing.
//!
//! The orchestrators never talk to a storage backend directly; they go
//! through [`ObjectStore`], a four-method trait (download, upload, delete,
//! exists) that deliberately knows nothing about buckets, credentials, or
//! retry semantics. [`FsObjectStore`] backs the trait with a plain
//! directory, which is both the local-deployment implementation and the
//! test double; a cloud-bucket implementation slots in behind the same
//! trait without touching the orchestrators.
//!
//! Also here: the .tar.gz unpack and repack helpers shared by conversion
//! (unpack source, repack output site) and publish (unpack converted site,
//! repack under the permanent name).

use crate::error::ConvertError;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Minimal blob-storage interface for source archives, converted sites,
/// and QA logs.
///
/// Keys are forward-slash paths relative to the store root, e.g.
/// `"1234.tar.gz"` or `"qa/1234_stdout.txt"`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the object at `key` into the local file `dest`.
    async fn download(&self, key: &str, dest: &Path) -> Result<(), ConvertError>;

    /// Store the local file `src` as the object `key`, replacing any
    /// existing object.
    async fn upload(&self, key: &str, src: &Path) -> Result<(), ConvertError>;

    /// Remove the object at `key`. Deleting a missing object is a no-op.
    async fn delete(&self, key: &str) -> Result<(), ConvertError>;

    /// Whether an object exists at `key`.
    async fn exists(&self, key: &str) -> Result<bool, ConvertError>;
}

/// Directory-backed [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a key under the root, refusing traversal outside it.
    fn resolve(&self, key: &str) -> Result<PathBuf, ConvertError> {
        let rel = Path::new(key);
        let escapes = rel.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes || key.is_empty() {
            return Err(ConvertError::UnrecognisedBlob {
                name: key.to_string(),
            });
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn download(&self, key: &str, dest: &Path) -> Result<(), ConvertError> {
        let path = self.resolve(key)?;
        tokio::fs::copy(&path, dest)
            .await
            .map_err(|e| ConvertError::DownloadFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        debug!("Downloaded '{}' to {}", key, dest.display());
        Ok(())
    }

    async fn upload(&self, key: &str, src: &Path) -> Result<(), ConvertError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConvertError::UploadFailed {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
        }
        tokio::fs::copy(src, &path)
            .await
            .map_err(|e| ConvertError::UploadFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        debug!("Uploaded {} as '{}'", src.display(), key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ConvertError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConvertError::UploadFailed {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, ConvertError> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }
}

/// Unpack a `.tar.gz` archive into `dest`, creating it as needed.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<(), ConvertError> {
    let file = File::open(archive).map_err(|e| ConvertError::ArchiveExtract {
        path: archive.to_path_buf(),
        source: e,
    })?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(dest).map_err(|e| ConvertError::ArchiveExtract {
        path: archive.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// Pack the *contents* of `dir` (not the directory itself) into a new
/// `.tar.gz` at `dest`.
///
/// Entries are stored relative to `dir`, so unpacking elsewhere reproduces
/// the tree without a leading scratch-path component.
pub fn pack_dir(dir: &Path, dest: &Path) -> Result<(), ConvertError> {
    let workdir_err = |e: std::io::Error| ConvertError::WorkDir {
        path: dest.to_path_buf(),
        source: e,
    };
    let file = File::create(dest).map_err(workdir_err)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", dir).map_err(workdir_err)?;
    let encoder = builder.into_inner().map_err(workdir_err)?;
    encoder.finish().map_err(workdir_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_round_trip() {
        let store_dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(store_dir.path());

        let src = scratch.path().join("up.txt");
        std::fs::write(&src, b"payload").unwrap();

        assert!(!store.exists("a/b.txt").await.unwrap());
        store.upload("a/b.txt", &src).await.unwrap();
        assert!(store.exists("a/b.txt").await.unwrap());

        let dest = scratch.path().join("down.txt");
        store.download("a/b.txt", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");

        store.delete("a/b.txt").await.unwrap();
        assert!(!store.exists("a/b.txt").await.unwrap());
    }

    #[tokio::test]
    async fn delete_of_missing_object_is_noop() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(store_dir.path());
        assert!(store.delete("never/uploaded.tar.gz").await.is_ok());
    }

    #[tokio::test]
    async fn download_of_missing_object_fails() {
        let store_dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(store_dir.path());
        let result = store
            .download("nope.tar.gz", &scratch.path().join("x"))
            .await;
        assert!(matches!(result, Err(ConvertError::DownloadFailed { .. })));
    }

    #[tokio::test]
    async fn traversal_keys_rejected() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(store_dir.path());
        for key in ["../escape.txt", "/abs.txt", "a/../../b", ""] {
            let result = store.exists(key).await;
            assert!(
                matches!(result, Err(ConvertError::UnrecognisedBlob { .. })),
                "key {key:?} should be rejected"
            );
        }
    }

    #[test]
    fn pack_then_unpack_reproduces_tree() {
        let scratch = tempfile::tempdir().unwrap();
        let tree = scratch.path().join("site");
        std::fs::create_dir_all(tree.join("sub")).unwrap();
        std::fs::write(tree.join("index.html"), b"<html/>").unwrap();
        std::fs::write(tree.join("sub/fig.svg"), b"<svg/>").unwrap();

        let archive = scratch.path().join("site.tar.gz");
        pack_dir(&tree, &archive).unwrap();

        let out = scratch.path().join("unpacked");
        unpack_archive(&archive, &out).unwrap();
        assert_eq!(std::fs::read(out.join("index.html")).unwrap(), b"<html/>");
        assert_eq!(std::fs::read(out.join("sub/fig.svg")).unwrap(), b"<svg/>");
    }

    #[test]
    fn unpack_of_garbage_fails() {
        let scratch = tempfile::tempdir().unwrap();
        let bogus = scratch.path().join("bogus.tar.gz");
        std::fs::write(&bogus, b"not a gzip stream").unwrap();
        let result = unpack_archive(&bogus, &scratch.path().join("out"));
        assert!(matches!(result, Err(ConvertError::ArchiveExtract { .. })));
    }
}
