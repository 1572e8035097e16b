//! Media store implementations: local filesystem for production, an
//! in-memory double for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use trueque_core::connectors::MediaStore;
use trueque_core::{CoreError, CoreResult};
use uuid::Uuid;

fn extension_for(key: &str, content_type: &str) -> String {
    if let Some(ext) = Path::new(key).extension().and_then(|e| e.to_str()) {
        return ext.to_ascii_lowercase();
    }
    match content_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
    .to_string()
}

/// Stores objects as files under a root directory, addressed by a base URL.
pub struct LocalMediaStore {
    root: PathBuf,
    base_url: String,
}

impl LocalMediaStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }

    fn file_for(&self, url: &str) -> CoreResult<PathBuf> {
        let name = url
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty() && !n.contains("..") && !n.contains('\\'))
            .ok_or_else(|| CoreError::InvalidInput(format!("malformed media url {url}")))?;
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl MediaStore for LocalMediaStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> CoreResult<String> {
        let file_name = format!(
            "{}.{}",
            Uuid::new_v4().simple(),
            extension_for(key, content_type)
        );
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        tokio::fs::write(self.root.join(&file_name), bytes)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            file_name
        ))
    }

    async fn delete(&self, url: &str) -> CoreResult<()> {
        let path = self.file_for(url)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Already gone is fine; deletes are best-effort by contract.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Internal(e.to_string())),
        }
    }
}

/// Test double holding objects in a map.
#[derive(Default)]
pub struct InMemoryMediaStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.objects
            .lock()
            .map(|objects| objects.contains_key(url))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MediaStore for InMemoryMediaStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> CoreResult<String> {
        let url = format!(
            "mem://{}.{}",
            Uuid::new_v4().simple(),
            extension_for(key, content_type)
        );
        self.objects
            .lock()
            .map_err(|_| CoreError::Internal("media lock poisoned".to_string()))?
            .insert(url.clone(), bytes);
        Ok(url)
    }

    async fn delete(&self, url: &str) -> CoreResult<()> {
        self.objects
            .lock()
            .map_err(|_| CoreError::Internal("media lock poisoned".to_string()))?
            .remove(url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> LocalMediaStore {
        let root = std::env::temp_dir().join(format!("trueque-media-{}", Uuid::new_v4().simple()));
        LocalMediaStore::new(root, "/media")
    }

    #[tokio::test]
    async fn put_then_delete_roundtrip() {
        let store = temp_store();
        let url = store
            .put("photo.jpg", b"fake jpeg".to_vec(), "image/jpeg")
            .await
            .unwrap();
        assert!(url.starts_with("/media/"));
        assert!(url.ends_with(".jpg"));

        let path = store.file_for(&url).unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"fake jpeg");

        store.delete(&url).await.unwrap();
        assert!(!path.exists());
        // A second delete of a gone object is still fine.
        store.delete(&url).await.unwrap();
    }

    #[tokio::test]
    async fn extension_falls_back_to_content_type() {
        let store = temp_store();
        let url = store
            .put("upload", b"png bytes".to_vec(), "image/png")
            .await
            .unwrap();
        assert!(url.ends_with(".png"));
    }

    #[tokio::test]
    async fn delete_rejects_traversal_urls() {
        let store = temp_store();
        let result = store.delete("/media/..").await;
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn in_memory_double_tracks_objects() {
        let store = InMemoryMediaStore::new();
        let url = store
            .put("a.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();
        assert!(store.contains(&url));
        store.delete(&url).await.unwrap();
        assert!(store.is_empty());
    }
}
