//! Cache API: named caches of request → response snapshots.
//!
//! The worker only sees the [`CacheStorage`] and [`Cache`] traits; the
//! in-memory implementation backs tests and the probe tool.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use pwakit_net::{NetError, Request, Response};
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::ServiceWorkerError;

// ==================== Keys and entries ====================

/// Request identity used as a cache key: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: Method,
    pub url: Url,
}

impl CacheKey {
    /// Create a key. The URL fragment is dropped.
    pub fn new(method: Method, mut url: Url) -> Self {
        url.set_fragment(None);
        Self { method, url }
    }

    /// Key for a GET of `url`.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Key for a request.
    pub fn from_request(request: &Request) -> Self {
        Self::new(request.method.clone(), request.url.clone())
    }
}

/// A stored response snapshot.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Final response URL.
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CachedResponse {
    /// Snapshot a response, consuming its body.
    pub fn from_response(mut response: Response) -> Result<Self, NetError> {
        let body = response.take_body()?;
        Ok(Self {
            url: response.url,
            status: response.status,
            headers: response.headers,
            body,
            cached_at: now_millis(),
        })
    }

    /// Build a fresh readable response from the snapshot.
    pub fn to_response(&self) -> Response {
        let mut response = Response::new(self.url.clone(), self.status).with_body(self.body.clone());
        response.headers = self.headers.clone();
        response
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ==================== Traits ====================

/// One named cache.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Cache name.
    fn name(&self) -> &str;

    /// Look up a stored response.
    async fn match_request(&self, key: &CacheKey) -> Option<CachedResponse>;

    /// Store one entry, replacing any entry with the same key.
    async fn put(&self, key: CacheKey, response: CachedResponse) -> Result<(), ServiceWorkerError>;

    /// Store a batch. Either every entry is written or none is.
    async fn put_all(
        &self,
        entries: Vec<(CacheKey, CachedResponse)>,
    ) -> Result<(), ServiceWorkerError>;

    /// Delete one entry. Returns whether it existed.
    async fn delete(&self, key: &CacheKey) -> bool;

    /// Snapshot of stored keys in insertion order.
    async fn keys(&self) -> Vec<CacheKey>;
}

/// The set of named caches for one origin (`caches`).
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a cache, creating it if missing.
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, ServiceWorkerError>;

    /// Get an existing cache without creating it.
    async fn get(&self, name: &str) -> Option<Arc<dyn Cache>>;

    /// Check if a cache exists.
    async fn has(&self, name: &str) -> bool;

    /// Delete a cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> bool;

    /// All cache names in creation order.
    async fn keys(&self) -> Vec<String>;
}

// ==================== In-memory implementation ====================

#[derive(Debug, Default)]
struct Entries {
    order: Vec<CacheKey>,
    map: HashMap<CacheKey, CachedResponse>,
}

impl Entries {
    fn insert(&mut self, key: CacheKey, response: CachedResponse) {
        if self.map.insert(key.clone(), response).is_some() {
            self.order.retain(|k| k != &key);
        }
        self.order.push(key);
    }
}

/// A cache held in memory.
#[derive(Debug)]
pub struct MemoryCache {
    name: String,
    entries: RwLock<Entries>,
}

impl MemoryCache {
    /// Create a new empty cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(Entries::default()),
        }
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.order.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, key: &CacheKey) -> Option<CachedResponse> {
        self.entries.read().await.map.get(key).cloned()
    }

    async fn put(&self, key: CacheKey, response: CachedResponse) -> Result<(), ServiceWorkerError> {
        trace!(cache = %self.name, url = %key.url, "put");
        self.entries.write().await.insert(key, response);
        Ok(())
    }

    async fn put_all(
        &self,
        entries: Vec<(CacheKey, CachedResponse)>,
    ) -> Result<(), ServiceWorkerError> {
        // one write guard for the whole batch
        let mut guard = self.entries.write().await;
        for (key, response) in entries {
            guard.insert(key, response);
        }
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> bool {
        let mut guard = self.entries.write().await;
        if guard.map.remove(key).is_some() {
            guard.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    async fn keys(&self) -> Vec<CacheKey> {
        self.entries.read().await.order.clone()
    }
}

/// Cache storage held in memory.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<Vec<Arc<MemoryCache>>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cache with its concrete type.
    pub async fn get_memory(&self, name: &str) -> Option<Arc<MemoryCache>> {
        self.caches.read().await.iter().find(|c| c.name == name).cloned()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        if let Some(cache) = caches.iter().find(|c| c.name == name) {
            return Ok(cache.clone());
        }

        let cache = Arc::new(MemoryCache::new(name));
        caches.push(cache.clone());
        Ok(cache)
    }

    async fn get(&self, name: &str) -> Option<Arc<dyn Cache>> {
        self.get_memory(name).await.map(|c| c as Arc<dyn Cache>)
    }

    async fn has(&self, name: &str) -> bool {
        self.caches.read().await.iter().any(|c| c.name == name)
    }

    async fn delete(&self, name: &str) -> bool {
        let mut caches = self.caches.write().await;
        let before = caches.len();
        caches.retain(|c| c.name != name);
        caches.len() != before
    }

    async fn keys(&self) -> Vec<String> {
        self.caches
            .read()
            .await
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }
}
