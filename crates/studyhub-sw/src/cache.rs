//! Cache store: named generations of request → response snapshots.
//!
//! The store is shared by every worker of the origin and is last-writer-wins.
//! When bound to a snapshot file it is reloaded on construction and rewritten
//! after every mutation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use studyhub_net::{Request, Response};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace};
use url::Url;

use crate::{Result, ServiceWorkerError};

// ==================== Keys & Entries ====================

/// Request identity: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    /// Key for a request.
    pub fn for_request(request: &Request) -> Self {
        let mut url = request.url.clone();
        url.set_fragment(None);
        Self {
            method: request.method.as_str().to_string(),
            url: url.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for `request`.
    ///
    /// Only GET requests with a 2xx response can be captured.
    pub fn capture(request: &Request, response: &Response) -> Result<Self> {
        if request.method != Method::GET {
            return Err(ServiceWorkerError::CacheError(format!(
                "cannot cache {} request for {}",
                request.method, request.url
            )));
        }
        if !response.ok() {
            return Err(ServiceWorkerError::CacheError(format!(
                "cannot cache status {} for {}",
                response.status, request.url
            )));
        }

        let key = CacheKey::for_request(request);
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(Self {
            url: key.url,
            method: key.method,
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        })
    }

    /// Key this entry is stored under.
    pub fn key(&self) -> CacheKey {
        CacheKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("bad cached URL: {e}")))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(n, v);
            }
        }

        Ok(Response {
            url,
            status,
            headers,
            body: self.body.clone().into(),
            from_cache: true,
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Cache ====================

/// A single cache generation.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries, keyed by the `Display` form of [`CacheKey`].
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.entries.get(&CacheKey::for_request(request).to_string())
    }

    /// Store an entry, replacing any entry with the same key.
    pub fn insert(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key().to_string(), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, request: &Request) -> bool {
        self.entries
            .remove(&CacheKey::for_request(request).to_string())
            .is_some()
    }

    /// Get all keys.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.values().map(CacheEntry::key).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// All caches of an origin, in creation order.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CacheStorage {
    caches: Vec<Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache, creating it if needed. Returns whether it was created.
    pub fn open(&mut self, name: &str) -> (&mut Cache, bool) {
        match self.caches.iter().position(|c| c.name == name) {
            Some(index) => (&mut self.caches[index], false),
            None => {
                self.caches.push(Cache::new(name));
                let last = self.caches.len() - 1;
                (&mut self.caches[last], true)
            }
        }
    }

    /// Get a cache by name.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.iter().find(|c| c.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Cache> {
        self.caches.iter_mut().find(|c| c.name == name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        let before = self.caches.len();
        self.caches.retain(|c| c.name != name);
        self.caches.len() != before
    }

    /// Get all cache names.
    pub fn keys(&self) -> Vec<String> {
        self.caches.iter().map(|c| c.name.clone()).collect()
    }

    /// Match across all caches, oldest first.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.caches.iter().find_map(|c| c.match_request(request))
    }
}

// ==================== Cache Store ====================

/// Shared, optionally persistent handle to [`CacheStorage`].
#[derive(Debug, Clone, Default)]
pub struct CacheStore {
    inner: Arc<RwLock<CacheStorage>>,
    snapshot: Option<Arc<PathBuf>>,
    /// Held across serialize, write and rename of the snapshot.
    persist_lock: Arc<Mutex<()>>,
}

impl CacheStore {
    /// Create an in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store persisted to `path`, loading it if the file exists.
    pub async fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let storage = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<CacheStorage>(&raw).map_err(|e| {
                ServiceWorkerError::CacheError(format!("corrupt snapshot {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheStorage::new(),
            Err(e) => {
                return Err(ServiceWorkerError::CacheError(format!(
                    "cannot read snapshot {}: {e}",
                    path.display()
                )))
            }
        };

        info!(path = %path.display(), caches = storage.caches.len(), "Cache store loaded");

        Ok(Self {
            inner: Arc::new(RwLock::new(storage)),
            snapshot: Some(Arc::new(path)),
            persist_lock: Arc::default(),
        })
    }

    /// Open a cache, creating it if needed.
    pub async fn open(&self, name: &str) -> Result<CacheHandle> {
        let created = {
            let mut storage = self.inner.write().await;
            storage.open(name).1
        };
        if created {
            debug!(cache = name, "Cache created");
            self.persist().await?;
        }
        Ok(CacheHandle {
            name: name.to_string(),
            store: self.clone(),
        })
    }

    /// Handle to a cache that already exists.
    pub async fn get(&self, name: &str) -> Option<CacheHandle> {
        self.has(name).await.then(|| CacheHandle {
            name: name.to_string(),
            store: self.clone(),
        })
    }

    /// Check if a cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.inner.read().await.has(name)
    }

    /// Delete a cache. Returns whether it existed.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let deleted = self.inner.write().await.delete(name);
        if deleted {
            debug!(cache = name, "Cache deleted");
            self.persist().await?;
        }
        Ok(deleted)
    }

    /// Names of all caches, in creation order.
    pub async fn keys(&self) -> Vec<String> {
        self.inner.read().await.keys()
    }

    /// Match a request across all caches.
    pub async fn match_request(&self, request: &Request) -> Option<CacheEntry> {
        self.inner.read().await.match_request(request).cloned()
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = self.snapshot.as_deref() else {
            return Ok(());
        };
        let _writer = self.persist_lock.lock().await;

        // Serialized under the writer lock so a later state never loses to an
        // earlier one.
        let raw = {
            let storage = self.inner.read().await;
            serde_json::to_vec(&*storage)
                .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?
        };

        // Write beside the target and rename so readers never see a torn file.
        let tmp = path.with_extension("tmp");
        let write = async {
            tokio::fs::write(&tmp, &raw).await?;
            tokio::fs::rename(&tmp, path).await
        };
        write.await.map_err(|e| {
            ServiceWorkerError::CacheError(format!(
                "cannot write snapshot {}: {e}",
                path.display()
            ))
        })?;

        trace!(path = %path.display(), bytes = raw.len(), "Cache snapshot written");
        Ok(())
    }
}

/// Handle to one named cache in a [`CacheStore`].
#[derive(Debug, Clone)]
pub struct CacheHandle {
    name: String,
    store: CacheStore,
}

impl CacheHandle {
    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request in this cache only.
    pub async fn match_request(&self, request: &Request) -> Option<CacheEntry> {
        let storage = self.store.inner.read().await;
        storage
            .get(&self.name)
            .and_then(|c| c.match_request(request))
            .cloned()
    }

    /// Store a response for a request.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<()> {
        let entry = CacheEntry::capture(request, response)?;
        trace!(cache = %self.name, key = %entry.key(), "Cache put");
        {
            let mut storage = self.store.inner.write().await;
            self.cache_in(&mut storage)?.insert(entry);
        }
        self.store.persist().await
    }

    /// Store every pair, or nothing if any pair cannot be cached.
    pub async fn put_all(&self, pairs: &[(Request, Response)]) -> Result<()> {
        let entries = pairs
            .iter()
            .map(|(request, response)| CacheEntry::capture(request, response))
            .collect::<Result<Vec<_>>>()?;
        {
            let mut storage = self.store.inner.write().await;
            let cache = self.cache_in(&mut storage)?;
            for entry in entries {
                cache.insert(entry);
            }
        }
        self.store.persist().await
    }

    /// Delete the entry for a request.
    pub async fn delete(&self, request: &Request) -> Result<bool> {
        let deleted = {
            let mut storage = self.store.inner.write().await;
            storage
                .get_mut(&self.name)
                .map(|c| c.delete(request))
                .unwrap_or(false)
        };
        if deleted {
            self.store.persist().await?;
        }
        Ok(deleted)
    }

    /// Keys of all entries in this cache.
    pub async fn keys(&self) -> Vec<CacheKey> {
        let storage = self.store.inner.read().await;
        storage.get(&self.name).map(Cache::keys).unwrap_or_default()
    }

    /// Writes never bring back a cache deleted after this handle was opened.
    fn cache_in<'a>(&self, storage: &'a mut CacheStorage) -> Result<&'a mut Cache> {
        storage
            .get_mut(&self.name)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("cache {} was deleted", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> Request {
        Request::get_str(url).unwrap()
    }

    fn ok(url: &str, body: &str) -> Response {
        Response::new(Url::parse(url).unwrap(), StatusCode::OK, body.to_string())
            .with_header(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("text/css"),
            )
    }

    #[test]
    fn test_cache_key_ignores_fragment() {
        let a = CacheKey::for_request(&get("http://localhost/chris/#notes"));
        let b = CacheKey::for_request(&get("http://localhost/chris/"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET http://localhost/chris/");
    }

    #[test]
    fn test_capture_rejects_non_get() {
        let url = Url::parse("http://localhost/chris/api").unwrap();
        let request = Request::new(Method::POST, url.clone());
        let response = Response::new(url, StatusCode::OK, "");
        assert!(matches!(
            CacheEntry::capture(&request, &response),
            Err(ServiceWorkerError::CacheError(_))
        ));
    }

    #[test]
    fn test_capture_rejects_error_status() {
        let request = get("http://localhost/chris/missing.css");
        let response = Response::new(request.url.clone(), StatusCode::NOT_FOUND, "");
        assert!(CacheEntry::capture(&request, &response).is_err());
    }

    #[test]
    fn test_entry_restores_response() {
        let request = get("http://localhost/chris/style.css");
        let entry = CacheEntry::capture(&request, &ok("http://localhost/chris/style.css", "body{}"))
            .unwrap();

        let response = entry.to_response().unwrap();
        assert!(response.from_cache);
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text().unwrap(), "body{}");
        assert_eq!(response.headers["content-type"], "text/css");
    }

    #[test]
    fn test_cache_storage() {
        let mut storage = CacheStorage::new();

        assert!(!storage.has("v1"));

        let (_, created) = storage.open("v1");
        assert!(created);
        let (_, created) = storage.open("v1");
        assert!(!created);
        assert!(storage.has("v1"));

        assert!(storage.delete("v1"));
        assert!(!storage.has("v1"));
        assert!(!storage.delete("v1"));
    }

    #[tokio::test]
    async fn test_miss_is_none() {
        let store = CacheStore::new();
        let cache = store.open("studyhub-v4").await.unwrap();
        assert!(cache.match_request(&get("http://localhost/chris/")).await.is_none());
        assert!(store.match_request(&get("http://localhost/chris/")).await.is_none());
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let store = CacheStore::new();
        let cache = store.open("studyhub-v4").await.unwrap();
        let request = get("http://localhost/chris/style.css");

        cache
            .put(&request, &ok("http://localhost/chris/style.css", "a"))
            .await
            .unwrap();
        cache
            .put(&request, &ok("http://localhost/chris/style.css", "b"))
            .await
            .unwrap();

        let entry = store.match_request(&request).await.unwrap();
        assert_eq!(entry.body, b"b");
        assert_eq!(cache.keys().await.len(), 1);

        assert!(cache.delete(&request).await.unwrap());
        assert!(cache.match_request(&request).await.is_none());
    }

    #[tokio::test]
    async fn test_put_all_is_all_or_nothing() {
        let store = CacheStore::new();
        let cache = store.open("studyhub-v4").await.unwrap();

        let good = get("http://localhost/chris/");
        let bad = get("http://localhost/chris/gone.png");
        let pairs = vec![
            (good.clone(), ok("http://localhost/chris/", "<html>")),
            (
                bad.clone(),
                Response::new(bad.url.clone(), StatusCode::NOT_FOUND, ""),
            ),
        ];

        assert!(cache.put_all(&pairs).await.is_err());
        assert!(cache.match_request(&good).await.is_none());
    }

    #[tokio::test]
    async fn test_keys_in_creation_order() {
        let store = CacheStore::new();
        store.open("studyhub-v3").await.unwrap();
        store.open("studyhub-v4").await.unwrap();
        store.open("studyhub-v3").await.unwrap();

        assert_eq!(store.keys().await, vec!["studyhub-v3", "studyhub-v4"]);
        assert!(store.delete("studyhub-v3").await.unwrap());
        assert_eq!(store.keys().await, vec!["studyhub-v4"]);
    }

    #[tokio::test]
    async fn test_persistence_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");
        let request = get("http://localhost/chris/index.html");

        {
            let store = CacheStore::persistent(&path).await.unwrap();
            let cache = store.open("studyhub-v4").await.unwrap();
            cache
                .put(&request, &ok("http://localhost/chris/index.html", "<html>"))
                .await
                .unwrap();
            store.open("studyhub-v3").await.unwrap();
            store.delete("studyhub-v3").await.unwrap();
        }

        let reopened = CacheStore::persistent(&path).await.unwrap();
        assert_eq!(reopened.keys().await, vec!["studyhub-v4"]);
        let entry = reopened.match_request(&request).await.unwrap();
        assert_eq!(entry.body, b"<html>");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_all_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");
        let store = CacheStore::persistent(&path).await.unwrap();
        let cache = store.open("studyhub-v4").await.unwrap();

        let puts = (0..64).map(|i| {
            let cache = cache.clone();
            tokio::spawn(async move {
                let url = format!("http://localhost/chris/notes/{i}");
                cache.put(&get(&url), &ok(&url, "note")).await
            })
        });
        for result in futures::future::join_all(puts).await {
            result.unwrap().unwrap();
        }

        let reopened = CacheStore::persistent(&path).await.unwrap();
        let reopened_cache = reopened.get("studyhub-v4").await.unwrap();
        assert_eq!(reopened_cache.keys().await.len(), 64);
        assert!(!dir.path().join("caches.tmp").exists());
    }

    #[tokio::test]
    async fn test_put_does_not_recreate_deleted_cache() {
        let store = CacheStore::new();
        let stale = store.open("studyhub-v3").await.unwrap();
        store.delete("studyhub-v3").await.unwrap();

        let request = get("http://localhost/chris/app.js");
        let result = stale
            .put(&request, &ok("http://localhost/chris/app.js", "v3"))
            .await;
        assert!(matches!(result, Err(ServiceWorkerError::NotFound(_))));
        assert!(!store.has("studyhub-v3").await);
        assert!(store.get("studyhub-v3").await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(matches!(
            CacheStore::persistent(&path).await,
            Err(ServiceWorkerError::CacheError(_))
        ));
    }
}
