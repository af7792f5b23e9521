//! Image handling around a turn.
//!
//! Inbound: the last image a user sent is saved to disk and remembered per
//! session until the next chat request uploads it. Outbound: image links in
//! a reply are fetched so the host can send the picture itself.

use dashmap::DashMap;
use relay_common::error::{RelayError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Download attempts before giving up.
pub const DOWNLOAD_ATTEMPTS: u32 = 3;
/// Fixed delay between download attempts.
pub const DOWNLOAD_RETRY_DELAY: Duration = Duration::from_secs(3);
/// Per-attempt download timeout.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(20);

// ============================================================================
// Image Cache
// ============================================================================

/// An inbound image waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    /// Host-side image id
    pub id: String,
    /// Local copy
    pub path: PathBuf,
}

impl CachedImage {
    /// Delete the local copy. Failures are logged, not returned.
    pub async fn discard(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove cached image");
        }
    }
}

/// Pending inbound image per session key. A newer image replaces an older one.
#[derive(Debug, Default)]
pub struct ImageCache {
    images: DashMap<String, CachedImage>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `image` for a session. A replaced image has its local copy deleted.
    pub async fn insert(&self, session_id: &str, image: CachedImage) {
        tracing::debug!(session_id, image_id = %image.id, path = %image.path.display(), "Set image cache");
        let path = image.path.clone();
        let previous = self.images.insert(session_id.to_string(), image);
        if let Some(previous) = previous {
            tracing::debug!(session_id, image_id = %previous.id, "Replaced pending image");
            // same id saves to the same file, keep it
            if previous.path != path {
                previous.discard().await;
            }
        }
    }

    /// Remove and return the pending image for a session.
    pub fn take(&self, session_id: &str) -> Option<CachedImage> {
        self.images.remove(session_id).map(|(_, image)| image)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.images.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

// ============================================================================
// Saving
// ============================================================================

fn extension_for_mime(mime: Option<&str>) -> &'static str {
    match mime {
        Some("image/png") => ".png",
        Some("image/gif") => ".gif",
        Some("image/bmp") => ".bmp",
        Some("image/tiff") => ".tiff",
        _ => ".jpg",
    }
}

/// File name for a saved image: the id's own extension, or one derived from the MIME type.
pub fn image_file_name(image_id: &str, mime: Option<&str>) -> String {
    // only the last path component, ids come from the host
    let name = Path::new(image_id)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());

    if Path::new(&name).extension().is_some() {
        name
    } else {
        format!("{name}{}", extension_for_mime(mime))
    }
}

/// Write image bytes under `dir`, creating it if needed.
pub async fn save_image(
    bytes: &[u8],
    image_id: &str,
    mime: Option<&str>,
    dir: &Path,
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(image_file_name(image_id, mime));
    tokio::fs::write(&path, bytes).await?;
    tracing::debug!(path = %path.display(), size = bytes.len(), "Saved image");
    Ok(path)
}

// ============================================================================
// Downloading
// ============================================================================

/// Fetches media by URL with a fixed retry policy.
#[derive(Debug, Clone)]
pub struct MediaDownloader {
    client: reqwest::Client,
    attempts: u32,
    retry_delay: Duration,
    timeout: Duration,
}

impl Default for MediaDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaDownloader {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            attempts: DOWNLOAD_ATTEMPTS,
            retry_delay: DOWNLOAD_RETRY_DELAY,
            timeout: DOWNLOAD_TIMEOUT,
        }
    }

    pub fn with_retry(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn try_download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).timeout(self.timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::remote_request(status.as_u16(), &body));
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Download `url`, retrying on any failure.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        tracing::debug!(url, "Downloading media");

        for attempt in 1..=self.attempts {
            match self.try_download(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    tracing::error!(
                        url,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Media download failed"
                    );
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(RelayError::TransientDownload {
            url: url.to_string(),
            attempts: self.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_file_name() {
        assert_eq!(image_file_name("abc.png", Some("image/jpeg")), "abc.png");
        assert_eq!(image_file_name("abc", Some("image/gif")), "abc.gif");
        assert_eq!(image_file_name("abc", Some("image/tiff")), "abc.tiff");
        assert_eq!(image_file_name("abc", Some("image/webp")), "abc.jpg");
        assert_eq!(image_file_name("abc", None), "abc.jpg");
        assert_eq!(image_file_name("../../etc/x", Some("image/png")), "x.png");
    }

    #[tokio::test]
    async fn test_save_image_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cache").join("images");

        let path = save_image(b"\x89PNG", "pic", Some("image/png"), &target)
            .await
            .unwrap();

        assert_eq!(path, target.join("pic.png"));
        assert_eq!(std::fs::read(&path).unwrap(), b"\x89PNG");
    }

    #[tokio::test]
    async fn test_cache_last_write_wins_and_take_removes() {
        let dir = tempfile::tempdir().unwrap();
        let a = save_image(b"a", "a.png", None, dir.path()).await.unwrap();
        let b = save_image(b"b", "b.png", None, dir.path()).await.unwrap();

        let cache = ImageCache::new();
        cache
            .insert("s-1", CachedImage { id: "a.png".into(), path: a.clone() })
            .await;
        cache
            .insert("s-1", CachedImage { id: "b.png".into(), path: b.clone() })
            .await;
        assert_eq!(cache.len(), 1);
        // the replaced image is gone from disk
        assert!(!a.exists());
        assert!(b.exists());

        let taken = cache.take("s-1").unwrap();
        assert_eq!(taken.id, "b.png");
        taken.discard().await;
        assert!(!a.exists());
        assert!(!b.exists());
        assert!(cache.take("s-1").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cache_same_image_twice_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = save_image(b"a", "a.png", None, dir.path()).await.unwrap();

        let cache = ImageCache::new();
        for _ in 0..2 {
            cache
                .insert("s-1", CachedImage { id: "a.png".into(), path: a.clone() })
                .await;
        }
        assert!(a.exists());
        assert!(cache.contains("s-1"));
    }

    #[tokio::test]
    async fn test_discard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_image(b"x", "a.jpg", None, dir.path()).await.unwrap();
        let image = CachedImage {
            id: "a.jpg".into(),
            path: path.clone(),
        };
        image.discard().await;
        assert!(!path.exists());
        // second discard only logs
        image.discard().await;
    }
}
