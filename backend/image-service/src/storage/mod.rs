/// Filesystem blob store rooted at `UPLOAD_DIR`
///
/// Blobs are addressed by storage-relative paths with forward slashes,
/// e.g. `original/<uuid>.png` or `thumbnails/<stem>_100x100.jpg`. The same
/// relative path is what records persist and what public URLs are built from.
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

pub const ORIGINAL_AREA: &str = "original";
pub const THUMBNAIL_AREA: &str = "thumbnails";
pub const PUBLIC_PREFIX: &str = "/uploads";

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Absolute, empty, or escaping (`..`) relative path
    #[error("invalid blob path: {0}")]
    InvalidPath(String),

    #[error("blob io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listing entry used by the reconciler
#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub path: String,
    pub modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open the store, creating the root and its two areas if missing.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(root.join(ORIGINAL_AREA)).await?;
        fs::create_dir_all(root.join(THUMBNAIL_AREA)).await?;
        debug!(root = %root.display(), "Blob store ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write an uploaded original under a fresh unique name and return its
    /// relative path. Only the extension of `suggested_name` is kept.
    pub async fn store(&self, bytes: &[u8], suggested_name: &str) -> Result<String, BlobError> {
        let file_name = match extension_of(suggested_name) {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };
        let relative = format!("{ORIGINAL_AREA}/{file_name}");
        self.write(&relative, bytes).await?;
        Ok(relative)
    }

    /// Write `bytes` at `relative`, replacing any existing blob atomically.
    pub async fn write(&self, relative: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let target = self.resolve(relative)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut tmp = target.clone().into_os_string();
        tmp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, bytes).await?;
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn read(&self, relative: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.resolve(relative)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(relative.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a blob. Returns `false` when it did not exist.
    pub async fn delete(&self, relative: &str) -> Result<bool, BlobError> {
        let path = self.resolve(relative)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, relative: &str) -> bool {
        match self.resolve(relative) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Map a relative blob path onto the filesystem, refusing anything that
    /// could point outside the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, BlobError> {
        let path = Path::new(relative);
        if relative.is_empty() || path.is_absolute() {
            return Err(BlobError::InvalidPath(relative.to_string()));
        }
        if !path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(BlobError::InvalidPath(relative.to_string()));
        }
        Ok(self.root.join(path))
    }

    /// Turn a path under the root (absolute or root-prefixed) into the
    /// relative form. Already-relative paths are returned normalized.
    pub fn relativize(&self, path: &Path) -> Result<String, BlobError> {
        let stripped = match path.strip_prefix(&self.root) {
            Ok(rest) => rest,
            Err(_) if path.is_absolute() => {
                return Err(BlobError::InvalidPath(path.display().to_string()))
            }
            Err(_) => path,
        };

        let parts: Vec<String> = stripped
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(Ok(part.to_string_lossy().into_owned())),
                Component::CurDir => None,
                _ => Some(Err(())),
            })
            .collect::<Result<_, _>>()
            .map_err(|_| BlobError::InvalidPath(path.display().to_string()))?;

        if parts.is_empty() {
            return Err(BlobError::InvalidPath(path.display().to_string()));
        }
        Ok(parts.join("/"))
    }

    /// Public URL a client can fetch the blob from.
    pub fn public_url(relative: &str) -> String {
        format!("{PUBLIC_PREFIX}/{}", relative.trim_start_matches('/'))
    }

    /// Every regular file in one area, temp files included.
    pub async fn list(&self, area: &str) -> Result<Vec<BlobEntry>, BlobError> {
        let dir = self.resolve(area)?;
        let mut entries = Vec::new();
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            entries.push(BlobEntry {
                path: format!("{area}/{}", entry.file_name().to_string_lossy()),
                modified: metadata.modified()?,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

/// Lower-cased extension of a client filename, if it has a sane one.
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, BlobStore) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_store_read_delete() {
        let (_dir, store) = store().await;

        let path = store.store(b"hello", "Cat Photo.PNG").await.unwrap();
        assert!(path.starts_with("original/"));
        assert!(path.ends_with(".png"));
        assert_eq!(store.read(&path).await.unwrap(), b"hello");
        assert!(store.exists(&path).await);

        assert!(store.delete(&path).await.unwrap());
        assert!(!store.delete(&path).await.unwrap());
        assert!(matches!(
            store.read(&path).await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_store_names_are_unique() {
        let (_dir, store) = store().await;
        let a = store.store(b"a", "same.jpg").await.unwrap();
        let b = store.store(b"b", "same.jpg").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_resolve_rejects_escapes() {
        let (_dir, store) = store().await;
        assert!(store.resolve("../etc/passwd").is_err());
        assert!(store.resolve("original/../../x").is_err());
        assert!(store.resolve("/etc/passwd").is_err());
        assert!(store.resolve("").is_err());
        assert!(store.resolve("original/a.png").is_ok());
        assert!(!store.exists("../outside").await);
    }

    #[tokio::test]
    async fn test_relativize() {
        let (_dir, store) = store().await;
        let absolute = store.root().join("original").join("a.png");
        assert_eq!(store.relativize(&absolute).unwrap(), "original/a.png");
        assert_eq!(
            store.relativize(Path::new("./thumbnails/b.jpg")).unwrap(),
            "thumbnails/b.jpg"
        );
        assert!(store.relativize(Path::new("/somewhere/else.png")).is_err());
        assert!(store.relativize(Path::new("../x.png")).is_err());
    }

    #[tokio::test]
    async fn test_list_area() {
        let (_dir, store) = store().await;
        store.write("thumbnails/a_1x1.jpg", b"1").await.unwrap();
        store.write("thumbnails/b_1x1.jpg", b"2").await.unwrap();

        let entries = store.list(THUMBNAIL_AREA).await.unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["thumbnails/a_1x1.jpg", "thumbnails/b_1x1.jpg"]);
    }

    #[test]
    fn test_extension_and_url() {
        assert_eq!(extension_of("photo.JPEG").as_deref(), Some("jpeg"));
        assert_eq!(extension_of("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(extension_of("weird.p g"), None);
        assert_eq!(
            BlobStore::public_url("thumbnails/a.jpg"),
            "/uploads/thumbnails/a.jpg"
        );
    }
}
