use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const ORIGINAL_DIR: &str = "original";
const VISUALIZED_DIR: &str = "visualized";

/// An upload written to the `original/` directory
#[derive(Debug, Clone)]
pub struct StoredUpload {
    /// Generated name shared by the original and its visualization
    pub file_name: String,
    /// Full path of the original
    pub original_path: PathBuf,
}

/// Directory-based image storage split into original and visualized areas
pub struct FileStore {
    root: PathBuf,
    original_dir: PathBuf,
    visualized_dir: PathBuf,
}

impl FileStore {
    /// Create the store and make sure both directories exist
    pub async fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let store = Self {
            original_dir: root.join(ORIGINAL_DIR),
            visualized_dir: root.join(VISUALIZED_DIR),
            root,
        };

        store.ensure_dirs().await?;

        info!(root = %store.root.display(), "File store initialized");

        Ok(store)
    }

    /// Create both storage directories; a no-op when they already exist
    pub async fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.original_dir).await?;
        fs::create_dir_all(&self.visualized_dir).await?;
        Ok(())
    }

    /// Generate a stored file name
    /// Format: {YYYYMMDD_HHMMSS}_{uuid}_{sanitized original name}
    ///
    /// The timestamp keeps directory listings in upload order; the UUID makes
    /// two uploads of the same name within one second land in different files.
    pub fn generate_file_name(original_name: &str, now: DateTime<Utc>) -> String {
        format!(
            "{timestamp}_{id}_{name}",
            timestamp = now.format("%Y%m%d_%H%M%S"),
            id = Uuid::new_v4().simple(),
            name = sanitize_file_name(original_name),
        )
    }

    /// Write an uploaded image to the original area
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    pub async fn store_original(&self, original_name: &str, bytes: &[u8]) -> io::Result<StoredUpload> {
        self.ensure_dirs().await?;

        let file_name = Self::generate_file_name(original_name, Utc::now());
        let original_path = self.original_dir.join(&file_name);

        fs::write(&original_path, bytes).await?;

        debug!(path = %original_path.display(), "Original image stored");

        Ok(StoredUpload {
            file_name,
            original_path,
        })
    }

    /// Write a visualization for `file_name` to the visualized area
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    pub async fn store_visualization(&self, file_name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        self.ensure_dirs().await?;

        let path = self.visualized_dir.join(file_name);
        fs::write(&path, bytes).await?;

        debug!(path = %path.display(), "Visualization stored");

        Ok(path)
    }

    /// Read a stored image back
    pub async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path).await
    }

    /// Remove a stored image, ignoring files that are already gone
    pub async fn remove(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "Stored image removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = %path.display(), "Failed to remove stored image"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn original_dir(&self) -> &Path {
        &self.original_dir
    }

    pub fn visualized_dir(&self) -> &Path {
        &self.visualized_dir
    }
}

/// Sanitize an uploaded file name so it stays inside the storage directory
fn sanitize_file_name(name: &str) -> String {
    // Browsers on Windows may send the full client path
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(name);

    let sanitized: String = base
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    let trimmed = sanitized.trim_start_matches('.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

/// File name portion of an upload, used as the default title
pub fn display_name(name: &str) -> &str {
    name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_generate_file_name_format() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        let name = FileStore::generate_file_name("test_image.jpg", now);

        assert!(name.starts_with("20240115_103045_"));
        assert!(name.ends_with("_test_image.jpg"));

        let id = &name["20240115_103045_".len()..name.len() - "_test_image.jpg".len()];
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_same_name_same_second_is_unique() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        assert_ne!(
            FileStore::generate_file_name("photo.png", now),
            FileStore::generate_file_name("photo.png", now)
        );
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("test_image.jpg"), "test_image.jpg");
        assert_eq!(sanitize_file_name("my photo (1).jpg"), "my_photo__1_.jpg");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\cat.png"), "cat.png");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name(".."), "upload");
        assert_eq!(sanitize_file_name(""), "upload");
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("cat.png"), "cat.png");
        assert_eq!(display_name("C:\\Users\\me\\cat.png"), "cat.png");
    }

    #[tokio::test]
    async fn test_store_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("uploads")).await.unwrap();

        assert!(store.original_dir().is_dir());
        assert!(store.visualized_dir().is_dir());

        let upload = store
            .store_original("test_image.jpg", b"fake image content")
            .await
            .unwrap();
        assert!(upload.original_path.starts_with(store.original_dir()));

        let bytes = store.read(&upload.original_path).await.unwrap();
        let visualized = store
            .store_visualization(&upload.file_name, &bytes)
            .await
            .unwrap();
        assert_eq!(visualized, store.visualized_dir().join(&upload.file_name));
        assert_eq!(store.read(&visualized).await.unwrap(), b"fake image content");

        store.remove(&upload.original_path).await;
        assert!(!upload.original_path.exists());
        // Removing twice is fine
        store.remove(&upload.original_path).await;
    }

    #[tokio::test]
    async fn test_recreates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();

        std::fs::remove_dir_all(store.original_dir()).unwrap();

        let upload = store.store_original("a.png", b"x").await.unwrap();
        assert!(upload.original_path.exists());
    }
}
