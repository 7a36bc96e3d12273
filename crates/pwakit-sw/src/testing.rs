//! In-memory network and storage for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hashbrown::HashMap;
use http::StatusCode;
use pwakit_net::{Fetcher, NetError, Request, Response};
use tokio::sync::watch;

use crate::cache::{Cache, CacheStorage, MemoryCacheStorage};
use crate::ServiceWorkerError;

enum Route {
    Serve(u16, &'static str),
    Fail,
}

/// Canned responses keyed by URL. Unknown URLs fail like a dead host.
#[derive(Default)]
pub struct FakeNetwork {
    routes: Mutex<HashMap<String, Route>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl FakeNetwork {
    pub fn serve(&self, url: &str, status: u16, body: &'static str) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), Route::Serve(status, body));
    }

    pub fn fail(&self, url: &str) {
        self.routes.lock().unwrap().insert(url.to_string(), Route::Fail);
    }

    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("offline".into()));
        }

        match self.routes.lock().unwrap().get(request.url.as_str()) {
            Some(Route::Serve(status, body)) => {
                let status = StatusCode::from_u16(*status).unwrap();
                Ok(Response::new(request.url.clone(), status).with_body(*body))
            }
            Some(Route::Fail) | None => Err(NetError::RequestFailed(format!(
                "no route to {}",
                request.url
            ))),
        }
    }
}

/// Memory storage whose cache deletions can be held until released.
pub struct GatedCacheStorage {
    inner: MemoryCacheStorage,
    gate: watch::Sender<bool>,
}

impl Default for GatedCacheStorage {
    fn default() -> Self {
        Self {
            inner: MemoryCacheStorage::new(),
            gate: watch::channel(true).0,
        }
    }
}

impl GatedCacheStorage {
    pub fn hold_deletes(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_deletes(&self) {
        self.gate.send_replace(true);
    }
}

#[async_trait]
impl CacheStorage for GatedCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, ServiceWorkerError> {
        self.inner.open(name).await
    }

    async fn get(&self, name: &str) -> Option<Arc<dyn Cache>> {
        self.inner.get(name).await
    }

    async fn has(&self, name: &str) -> bool {
        self.inner.has(name).await
    }

    async fn delete(&self, name: &str) -> bool {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.inner.delete(name).await
    }

    async fn keys(&self) -> Vec<String> {
        self.inner.keys().await
    }
}
