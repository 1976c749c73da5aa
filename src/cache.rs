//! Disk-backed store for remote grammars.
//!
//! A remote URI maps to a stable path under the cache directory, so a
//! restart reuses earlier downloads. Concurrent requests for a URI that is
//! not cached yet share one download through a [`DownloadHandle`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{ContentModelError, Result};
use crate::http_client::ResourceFetcher;

/// How long a [`ResourceCacheStore::force_download`] grant stays usable.
const FORCE_DOWNLOAD_GRANT: Duration = Duration::from_secs(30);

/// Resource cache store configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceStoreConfig {
    /// Cache directory path
    pub directory: PathBuf,
    /// Whether remote resources may be downloaded at all
    pub download_external_resources: bool,
    /// Age after which a downloaded file is fetched again
    pub resource_ttl_hours: Option<u64>,
    /// How long a failed download is remembered; 0 disables
    pub negative_ttl_seconds: u64,
}

impl Default for ResourceStoreConfig {
    fn default() -> Self {
        Self {
            directory: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("xml-content-model"),
            download_external_resources: true,
            resource_ttl_hours: None,
            negative_ttl_seconds: 30,
        }
    }
}

/// Metadata for cached resources, stored as JSON next to the resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CacheMetadata {
    pub fn new(url: String, ttl: Option<Duration>) -> Self {
        let now = Utc::now();
        let expires_at = ttl.map(|ttl| {
            now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(24))
        });

        Self {
            url,
            created_at: now,
            expires_at,
            size_bytes: 0,
            etag: None,
            last_modified: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| Utc::now() > expires_at)
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size_bytes = size;
        self
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_last_modified(mut self, last_modified: Option<String>) -> Self {
        self.last_modified = last_modified;
        self
    }
}

/// Why a download did not produce a file. Shared by every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot download {uri}: {message}")]
pub struct DownloadFailure {
    pub uri: String,
    pub message: String,
    pub status: Option<u16>,
}

impl DownloadFailure {
    fn from_error(uri: &str, error: &ContentModelError) -> Self {
        let status = match error {
            ContentModelError::HttpStatus { status, .. } => Some(*status),
            ContentModelError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        };
        Self {
            uri: uri.to_string(),
            message: error.to_string(),
            status,
        }
    }
}

type DownloadFuture = Shared<BoxFuture<'static, std::result::Result<PathBuf, DownloadFailure>>>;

/// Awaitable, cancellable handle on a running download.
///
/// Dropping a handle or timing out on it never stops the download.
#[derive(Clone)]
pub struct DownloadHandle {
    id: Uuid,
    uri: String,
    path: PathBuf,
    future: DownloadFuture,
    abort: AbortHandle,
}

impl DownloadHandle {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Where the resource will be stored.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn wait(&self) -> std::result::Result<PathBuf, DownloadFailure> {
        self.future.clone().await
    }

    /// `None` if the download is still running after `timeout`.
    pub async fn wait_timeout(
        &self,
        timeout: Duration,
    ) -> Option<std::result::Result<PathBuf, DownloadFailure>> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    pub fn is_finished(&self) -> bool {
        self.future.peek().is_some() || self.abort.is_finished()
    }

    /// Stops the download for every waiter.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn same_download(&self, other: &DownloadHandle) -> bool {
        self.id == other.id
    }
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("id", &self.id)
            .field("uri", &self.uri)
            .field("path", &self.path)
            .finish()
    }
}

/// Outcome of asking the store for a resource.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Ready(PathBuf),
    InProgress(DownloadHandle),
    /// Not cached and downloads are turned off.
    Disabled,
    Failed(DownloadFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    NotStarted,
    InProgress,
    Done(PathBuf),
    Failed(DownloadFailure),
}

type InFlight = Arc<Mutex<HashMap<String, DownloadHandle>>>;

/// Removes a download from the in-flight table when its task ends, including
/// when the task is aborted.
struct InFlightGuard {
    table: InFlight,
    uri: String,
    id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table.get(&self.uri).is_some_and(|h| h.id == self.id) {
            table.remove(&self.uri);
        }
    }
}

pub struct ResourceCacheStore {
    cache_dir: PathBuf,
    fetcher: Arc<dyn ResourceFetcher>,
    download_enabled: AtomicBool,
    resource_ttl: Option<Duration>,
    in_flight: InFlight,
    failures: Option<Cache<String, DownloadFailure>>,
    grants: Cache<String, ()>,
}

impl ResourceCacheStore {
    pub fn new(config: ResourceStoreConfig, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        let failures = (config.negative_ttl_seconds > 0).then(|| {
            Cache::builder()
                .max_capacity(1024)
                .time_to_live(Duration::from_secs(config.negative_ttl_seconds))
                .build()
        });
        let grants = Cache::builder()
            .max_capacity(1024)
            .time_to_live(FORCE_DOWNLOAD_GRANT)
            .build();

        Self {
            cache_dir: config.directory,
            fetcher,
            download_enabled: AtomicBool::new(config.download_external_resources),
            resource_ttl: config.resource_ttl_hours.map(|h| Duration::from_secs(h * 3600)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            failures,
            grants,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn is_download_enabled(&self) -> bool {
        self.download_enabled.load(Ordering::Acquire)
    }

    pub fn set_download_enabled(&self, enabled: bool) {
        self.download_enabled.store(enabled, Ordering::Release);
    }

    /// Only `http` and `https` resources go through the store.
    pub fn can_use_cache(&self, uri: &str) -> bool {
        Url::parse(uri).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
    }

    /// Local path for a remote URI: `<cache>/<scheme>/<host>[/<port>]/<path>`.
    pub fn resource_cache_path(&self, uri: &str) -> Result<PathBuf> {
        let invalid = |reason: &str| ContentModelError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ContentModelError::UnsupportedProtocol {
                uri: uri.to_string(),
                protocol: url.scheme().to_string(),
            });
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;

        let mut path = self.cache_dir.join(url.scheme()).join(host);
        if let Some(port) = url.port() {
            path.push(port.to_string());
        }
        let segments: Vec<&str> = url.path_segments().map(|s| s.collect()).unwrap_or_default();
        for segment in &segments {
            let lower = segment.to_ascii_lowercase();
            if matches!(lower.as_str(), ".." | "%2e%2e" | ".%2e" | "%2e.") {
                return Err(invalid("path traversal"));
            }
        }
        for segment in segments.iter().filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        if segments.last().is_none_or(|s| s.is_empty()) {
            path.push("index");
        }
        Ok(path)
    }

    pub async fn get_cached_resource(&self, uri: &str) -> Result<CacheLookup> {
        self.get_cached_resource_with(uri, false).await
    }

    /// Never waits for a download: a running download is returned as
    /// [`CacheLookup::InProgress`] for the caller to await or ignore.
    pub async fn get_cached_resource_with(
        &self,
        uri: &str,
        force_refresh: bool,
    ) -> Result<CacheLookup> {
        let path = self.resource_cache_path(uri)?;
        if let Some(handle) = self.in_flight_handle(uri) {
            return Ok(CacheLookup::InProgress(handle));
        }

        let expired = self.is_expired(&path).await;
        if !force_refresh && !expired && fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(CacheLookup::Ready(path));
        }
        if !force_refresh && let Some(failure) = self.recent_failure(uri).await {
            return Ok(CacheLookup::Failed(failure));
        }
        if !self.is_download_enabled() {
            if !self.grants.contains_key(uri) {
                return Ok(CacheLookup::Disabled);
            }
            self.grants.invalidate(uri).await;
        }

        Ok(self.start_or_join(uri, path, force_refresh || expired))
    }

    /// Allows one download of `uri` even while downloads are disabled, and
    /// forgets an earlier failure.
    pub async fn force_download(&self, uri: &str) -> Result<CacheLookup> {
        self.grants.insert(uri.to_string(), ()).await;
        if let Some(failures) = &self.failures {
            failures.invalidate(uri).await;
        }
        self.get_cached_resource(uri).await
    }

    pub async fn state(&self, uri: &str) -> DownloadState {
        if self.in_flight_handle(uri).is_some() {
            return DownloadState::InProgress;
        }
        if let Some(failure) = self.recent_failure(uri).await {
            return DownloadState::Failed(failure);
        }
        match self.resource_cache_path(uri) {
            Ok(path) if fs::try_exists(&path).await.unwrap_or(false) => DownloadState::Done(path),
            _ => DownloadState::NotStarted,
        }
    }

    /// Deletes every cached resource and forgets recorded failures.
    pub async fn evict_cache(&self) -> Result<()> {
        match fs::remove_dir_all(&self.cache_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ContentModelError::Cache(format!(
                    "Failed to evict {}: {}",
                    self.cache_dir.display(),
                    e
                )));
            }
        }
        if let Some(failures) = &self.failures {
            failures.invalidate_all();
        }
        info!(directory = %self.cache_dir.display(), "Evicted resource cache");
        Ok(())
    }

    pub async fn metadata(&self, uri: &str) -> Option<CacheMetadata> {
        let path = self.resource_cache_path(uri).ok()?;
        read_metadata(&path).await
    }

    fn in_flight_handle(&self, uri: &str) -> Option<DownloadHandle> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
            .cloned()
    }

    async fn recent_failure(&self, uri: &str) -> Option<DownloadFailure> {
        match &self.failures {
            Some(failures) => failures.get(uri).await,
            None => None,
        }
    }

    async fn is_expired(&self, path: &Path) -> bool {
        if self.resource_ttl.is_none() {
            return false;
        }
        read_metadata(path).await.is_some_and(|m| m.is_expired())
    }

    fn start_or_join(&self, uri: &str, path: PathBuf, replace_existing: bool) -> CacheLookup {
        let mut table = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = table.get(uri) {
            return CacheLookup::InProgress(handle.clone());
        }
        // A download may have finished since the unlocked check.
        if !replace_existing && path.is_file() {
            return CacheLookup::Ready(path);
        }

        let id = Uuid::new_v4();
        let guard = InFlightGuard {
            table: self.in_flight.clone(),
            uri: uri.to_string(),
            id,
        };
        let fetcher = self.fetcher.clone();
        let failures = self.failures.clone();
        let ttl = self.resource_ttl;
        let task_uri = uri.to_string();
        let task_path = path.clone();

        let task = tokio::spawn(async move {
            let _guard = guard;
            match download(fetcher.as_ref(), &task_uri, &task_path, ttl).await {
                Ok(()) => Ok(task_path),
                Err(e) => {
                    warn!(uri = %task_uri, error = %e, "Download failed");
                    let failure = DownloadFailure::from_error(&task_uri, &e);
                    if let Some(failures) = failures {
                        failures.insert(task_uri.clone(), failure.clone()).await;
                    }
                    Err(failure)
                }
            }
        });

        let abort = task.abort_handle();
        let failed_uri = uri.to_string();
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(DownloadFailure {
                    uri: failed_uri,
                    message: if e.is_cancelled() {
                        "download cancelled".to_string()
                    } else {
                        format!("download task failed: {e}")
                    },
                    status: None,
                }),
            }
        }
        .boxed()
        .shared();

        let handle = DownloadHandle {
            id,
            uri: uri.to_string(),
            path,
            future,
            abort,
        };
        table.insert(uri.to_string(), handle.clone());
        CacheLookup::InProgress(handle)
    }
}

impl std::fmt::Debug for ResourceCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCacheStore")
            .field("cache_dir", &self.cache_dir)
            .field("download_enabled", &self.is_download_enabled())
            .field("resource_ttl", &self.resource_ttl)
            .finish()
    }
}

async fn download(
    fetcher: &dyn ResourceFetcher,
    uri: &str,
    path: &Path,
    ttl: Option<Duration>,
) -> Result<()> {
    info!(uri, "Downloading resource");
    let fetched = fetcher.fetch(uri).await?;

    let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
        return Err(ContentModelError::Cache(format!(
            "Invalid cache path {}",
            path.display()
        )));
    };
    fs::create_dir_all(parent).await?;

    let temp = parent.join(format!(
        ".{}.{}.tmp",
        file_name.to_string_lossy(),
        Uuid::new_v4()
    ));
    fs::write(&temp, &fetched.data).await?;
    if let Err(e) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e.into());
    }

    let metadata = CacheMetadata::new(uri.to_string(), ttl)
        .with_size(fetched.data.len() as u64)
        .with_etag(fetched.etag)
        .with_last_modified(fetched.last_modified);
    if let Err(e) = write_metadata(path, &metadata).await {
        warn!(uri, error = %e, "Failed to write cache metadata");
    }

    info!(uri, path = %path.display(), "Downloaded resource");
    Ok(())
}

fn metadata_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".meta.json");
    path.with_file_name(name)
}

async fn read_metadata(path: &Path) -> Option<CacheMetadata> {
    let content = fs::read_to_string(metadata_path(path)).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Ignoring unreadable cache metadata");
            None
        }
    }
}

async fn write_metadata(path: &Path, metadata: &CacheMetadata) -> Result<()> {
    let content = serde_json::to_string_pretty(metadata)
        .map_err(|e| ContentModelError::Cache(format!("Failed to serialize metadata: {}", e)))?;
    fs::write(metadata_path(path), content).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::FetchedResource;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct StaticFetcher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ResourceFetcher for StaticFetcher {
        async fn fetch(&self, uri: &str) -> Result<FetchedResource> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ContentModelError::HttpStatus {
                    url: uri.to_string(),
                    status: 404,
                    message: "HTTP 404: Not Found".to_string(),
                });
            }
            Ok(FetchedResource {
                data: b"<xs:schema/>".to_vec(),
                etag: Some("\"abc\"".to_string()),
                last_modified: None,
            })
        }
    }

    fn store(temp_dir: &TempDir, fail: bool, config: ResourceStoreConfig) -> (ResourceCacheStore, Arc<StaticFetcher>) {
        let fetcher = Arc::new(StaticFetcher {
            calls: AtomicUsize::new(0),
            fail,
        });
        let config = ResourceStoreConfig {
            directory: temp_dir.path().to_path_buf(),
            ..config
        };
        (ResourceCacheStore::new(config, fetcher.clone()), fetcher)
    }

    #[test]
    fn test_cache_path_layout() {
        let temp_dir = TempDir::new().unwrap();
        let (store, _) = store(&temp_dir, false, ResourceStoreConfig::default());
        let root = temp_dir.path();

        assert_eq!(
            store.resource_cache_path("http://example.com/schemas/a.xsd").unwrap(),
            root.join("http").join("example.com").join("schemas").join("a.xsd")
        );
        assert_eq!(
            store.resource_cache_path("https://example.com:8443/a.xsd").unwrap(),
            root.join("https").join("example.com").join("8443").join("a.xsd")
        );
        assert_eq!(
            store.resource_cache_path("http://example.com/").unwrap(),
            root.join("http").join("example.com").join("index")
        );
        assert!(matches!(
            store.resource_cache_path("http://example.com/a/%2E%2E/b.xsd"),
            Err(ContentModelError::InvalidUri { .. })
        ));
        assert!(matches!(
            store.resource_cache_path("ftp://example.com/a.xsd"),
            Err(ContentModelError::UnsupportedProtocol { .. })
        ));
        assert!(store.can_use_cache("https://example.com/a.xsd"));
        assert!(!store.can_use_cache("file:///a.xsd"));
    }

    #[tokio::test]
    async fn test_download_then_ready() {
        let temp_dir = TempDir::new().unwrap();
        let (store, fetcher) = store(&temp_dir, false, ResourceStoreConfig::default());
        let uri = "http://example.com/a.xsd";

        let CacheLookup::InProgress(handle) = store.get_cached_resource(uri).await.unwrap() else {
            panic!("expected a download");
        };
        let path = handle.wait().await.unwrap();
        assert!(handle.is_finished());
        assert_eq!(std::fs::read(&path).unwrap(), b"<xs:schema/>");
        assert_eq!(store.state(uri).await, DownloadState::Done(path.clone()));

        let metadata = store.metadata(uri).await.unwrap();
        assert_eq!(metadata.size_bytes, 12);
        assert_eq!(metadata.etag.as_deref(), Some("\"abc\""));

        assert!(matches!(
            store.get_cached_resource(uri).await.unwrap(),
            CacheLookup::Ready(ready) if ready == path
        ));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        let CacheLookup::InProgress(refresh) = store.get_cached_resource_with(uri, true).await.unwrap() else {
            panic!("expected a refresh");
        };
        refresh.wait().await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disabled_is_distinct_from_failure() {
        let temp_dir = TempDir::new().unwrap();
        let (store, fetcher) = store(
            &temp_dir,
            false,
            ResourceStoreConfig {
                download_external_resources: false,
                ..Default::default()
            },
        );
        let uri = "http://example.com/a.xsd";

        assert!(matches!(store.get_cached_resource(uri).await.unwrap(), CacheLookup::Disabled));
        assert_eq!(store.state(uri).await, DownloadState::NotStarted);

        let CacheLookup::InProgress(handle) = store.force_download(uri).await.unwrap() else {
            panic!("expected a forced download");
        };
        handle.wait().await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(store.get_cached_resource(uri).await.unwrap(), CacheLookup::Ready(_)));
    }

    #[tokio::test]
    async fn test_failure_is_remembered_for_negative_ttl() {
        let temp_dir = TempDir::new().unwrap();
        let (store, fetcher) = store(&temp_dir, true, ResourceStoreConfig::default());
        let uri = "http://example.com/missing.xsd";

        let CacheLookup::InProgress(handle) = store.get_cached_resource(uri).await.unwrap() else {
            panic!("expected a download");
        };
        let failure = handle.wait().await.unwrap_err();
        assert_eq!(failure.status, Some(404));

        let CacheLookup::Failed(remembered) = store.get_cached_resource(uri).await.unwrap() else {
            panic!("expected the recorded failure");
        };
        assert_eq!(remembered, failure);
        assert!(matches!(store.state(uri).await, DownloadState::Failed(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_retried_without_negative_cache() {
        let temp_dir = TempDir::new().unwrap();
        let (store, fetcher) = store(
            &temp_dir,
            true,
            ResourceStoreConfig {
                negative_ttl_seconds: 0,
                ..Default::default()
            },
        );
        let uri = "http://example.com/missing.xsd";

        for _ in 0..2 {
            let CacheLookup::InProgress(handle) = store.get_cached_resource(uri).await.unwrap() else {
                panic!("expected a new download");
            };
            assert!(handle.wait().await.is_err());
            // Let the task drop its in-flight entry.
            while store.state(uri).await == DownloadState::InProgress {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_evict_cache() {
        let temp_dir = TempDir::new().unwrap();
        let (store, _) = store(&temp_dir, false, ResourceStoreConfig::default());
        let uri = "http://example.com/a.xsd";

        let CacheLookup::InProgress(handle) = store.get_cached_resource(uri).await.unwrap() else {
            panic!("expected a download");
        };
        let path = handle.wait().await.unwrap();
        store.evict_cache().await.unwrap();

        assert!(!path.exists());
        assert_eq!(store.state(uri).await, DownloadState::NotStarted);
    }

    #[test]
    fn test_metadata_expiry() {
        let fresh = CacheMetadata::new("http://example.com/a.xsd".to_string(), None);
        assert!(!fresh.is_expired());

        let expired = CacheMetadata::new("http://example.com/a.xsd".to_string(), Some(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(5));
        assert!(expired.is_expired());
    }
}
