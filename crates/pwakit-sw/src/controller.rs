//! The asset cache controller: install, activate and fetch handling.
//!
//! The controller holds no mutable state of its own. Everything it remembers
//! lives in the injected [`CacheStorage`]; the network is reached only through
//! the injected [`Fetcher`].

use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use http::{Method, StatusCode};
use pwakit_net::{Fetcher, Origin, Request, Response};
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use crate::cache::{Cache, CacheKey, CacheStorage, CachedResponse};
use crate::config::WorkerConfig;
use crate::ServiceWorkerError;

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Cache that was seeded.
    pub cache_name: String,
    /// Number of assets stored.
    pub seeded: usize,
    /// Activate without waiting for old pages to close.
    pub skip_waiting: bool,
}

/// Result of activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOutcome {
    /// Old generations that were deleted.
    pub deleted: Vec<String>,
    /// Take control of open pages now.
    pub claim_clients: bool,
}

/// What to do with an intercepted request.
#[derive(Debug)]
pub enum InterceptOutcome {
    /// Not handled; the host fetches it as if no worker existed.
    Passthrough,
    /// Answer with this response.
    Respond(Response),
}

/// Cache-first controller for the app shell.
pub struct AssetCacheController {
    config: WorkerConfig,
    script_url: Url,
    origin: Origin,
    assets: Vec<Url>,
    fallback: CacheKey,
    caches: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl std::fmt::Debug for AssetCacheController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCacheController")
            .field("cache_name", &self.config.cache_name)
            .field("script_url", &self.script_url.as_str())
            .field("assets", &self.assets.len())
            .finish_non_exhaustive()
    }
}

impl AssetCacheController {
    /// Create a controller. Asset paths are resolved against `script_url`.
    pub fn new(
        config: WorkerConfig,
        script_url: Url,
        caches: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;

        let resolve = |path: &str| {
            script_url.join(path).map_err(|e| {
                ServiceWorkerError::RegistrationFailed(format!("bad asset path {path:?}: {e}"))
            })
        };

        let assets = config
            .assets
            .iter()
            .map(|a| resolve(a))
            .collect::<Result<Vec<_>, _>>()?;
        let fallback = CacheKey::get(resolve(&config.offline_fallback)?);

        Ok(Self {
            origin: Origin::from_url(&script_url),
            config,
            script_url,
            assets,
            fallback,
            caches,
            fetcher,
        })
    }

    /// Name of the current cache generation.
    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    /// Script URL the controller was created for.
    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    /// Resolved asset URLs, in manifest order.
    pub fn assets(&self) -> &[Url] {
        &self.assets
    }

    pub(crate) fn caches(&self) -> &Arc<dyn CacheStorage> {
        &self.caches
    }

    // ==================== Install ====================

    /// Seed the current cache with every asset, all or nothing.
    #[instrument(skip(self), fields(cache = %self.config.cache_name))]
    pub async fn on_install(&self) -> Result<InstallOutcome, ServiceWorkerError> {
        let existed = self.caches.has(self.cache_name()).await;
        let cache = self.caches.open(self.cache_name()).await?;

        match self.seed(cache.as_ref()).await {
            Ok(seeded) => {
                info!(seeded, "App shell cached");
                Ok(InstallOutcome {
                    cache_name: self.config.cache_name.clone(),
                    seeded,
                    skip_waiting: self.config.skip_waiting,
                })
            }
            Err(e) => {
                if !existed {
                    self.caches.delete(self.cache_name()).await;
                }
                warn!(error = %e, "Install failed, nothing cached");
                Err(e)
            }
        }
    }

    async fn seed(&self, cache: &dyn Cache) -> Result<usize, ServiceWorkerError> {
        let entries = try_join_all(self.assets.iter().map(|url| self.fetch_asset(url))).await?;
        let seeded = entries.len();
        cache.put_all(entries).await?;
        Ok(seeded)
    }

    async fn fetch_asset(&self, url: &Url) -> Result<(CacheKey, CachedResponse), ServiceWorkerError> {
        let request = Request::get(url.clone());
        let response = self
            .fetcher
            .fetch(&request)
            .await
            .map_err(|e| ServiceWorkerError::InstallFailed(format!("{url}: {e}")))?;

        if response.status != StatusCode::OK {
            return Err(ServiceWorkerError::InstallFailed(format!(
                "{url}: status {}",
                response.status
            )));
        }

        trace!(url = %url, "Asset fetched");
        Ok((
            CacheKey::from_request(&request),
            CachedResponse::from_response(response)?,
        ))
    }

    // ==================== Activate ====================

    /// Delete every cache generation except the current one.
    #[instrument(skip(self), fields(cache = %self.config.cache_name))]
    pub async fn on_activate(&self) -> ActivateOutcome {
        let stale: Vec<String> = self
            .caches
            .keys()
            .await
            .into_iter()
            .filter(|name| name != self.cache_name())
            .collect();

        let results = join_all(stale.iter().map(|name| self.caches.delete(name))).await;
        let deleted: Vec<String> = stale
            .into_iter()
            .zip(results)
            .filter_map(|(name, removed)| removed.then_some(name))
            .collect();

        if !deleted.is_empty() {
            info!(?deleted, "Old caches removed");
        }

        ActivateOutcome {
            deleted,
            claim_clients: self.config.claim_clients,
        }
    }

    // ==================== Fetch ====================

    /// Cache-first handling of one request.
    ///
    /// Non-GET requests pass through. A miss goes to the network; a 200
    /// same-origin response is copied into the cache. When the network fails
    /// a navigation gets the offline shell, anything else gets the error.
    #[instrument(skip(self, request), fields(url = %request.url, method = %request.method))]
    pub async fn on_intercept(
        &self,
        request: &Request,
    ) -> Result<InterceptOutcome, ServiceWorkerError> {
        if request.method != Method::GET {
            trace!("Not a GET, passing through");
            return Ok(InterceptOutcome::Passthrough);
        }

        let key = CacheKey::from_request(request);
        if let Some(hit) = self.lookup(&key).await {
            debug!("Served from cache");
            return Ok(InterceptOutcome::Respond(hit.to_response()));
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.status != StatusCode::OK {
                    debug!(status = %response.status, "Not caching non-200 response");
                    return Ok(InterceptOutcome::Respond(response));
                }

                if self.origin.contains(&response.url) {
                    let copy = response.try_clone()?;
                    self.store(key, copy).await;
                } else {
                    debug!(origin = %Origin::from_url(&response.url), "Not caching cross-origin response");
                }

                Ok(InterceptOutcome::Respond(response))
            }
            Err(e) if request.is_navigation() => match self.lookup(&self.fallback).await {
                Some(shell) => {
                    info!(error = %e, "Offline, serving app shell");
                    Ok(InterceptOutcome::Respond(shell.to_response()))
                }
                None => {
                    warn!(error = %e, "Offline and app shell not cached");
                    Err(e.into())
                }
            },
            Err(e) => {
                debug!(error = %e, "Network failed");
                Err(e.into())
            }
        }
    }

    async fn lookup(&self, key: &CacheKey) -> Option<CachedResponse> {
        let cache = self.caches.get(self.cache_name()).await?;
        cache.match_request(key).await
    }

    /// Write a response copy into the current cache. Failures are logged only.
    async fn store(&self, key: CacheKey, copy: Response) {
        let url = key.url.clone();
        let result: Result<(), ServiceWorkerError> = async {
            let snapshot = CachedResponse::from_response(copy)?;
            let cache = self.caches.open(self.cache_name()).await?;
            cache.put(key, snapshot).await
        }
        .await;

        match result {
            Ok(()) => trace!(url = %url, "Stored in cache"),
            Err(e) => warn!(url = %url, error = %e, "Cache write failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::testing::FakeNetwork;

    const BASE: &str = "https://app.test/playground/";

    fn controller(
        config: WorkerConfig,
        storage: Arc<MemoryCacheStorage>,
        network: Arc<FakeNetwork>,
    ) -> AssetCacheController {
        let script = Url::parse(BASE).unwrap().join("sw.js").unwrap();
        AssetCacheController::new(config, script, storage, network).unwrap()
    }

    fn small_config(name: &str) -> WorkerConfig {
        WorkerConfig {
            cache_name: name.to_string(),
            assets: vec!["./".into(), "./index.html".into(), "./style.css".into()],
            ..Default::default()
        }
    }

    fn serve_shell(network: &FakeNetwork) {
        network.serve(BASE, 200, "root");
        network.serve(&format!("{BASE}index.html"), 200, "<html>shell</html>");
        network.serve(&format!("{BASE}style.css"), 200, "body{}");
    }

    fn url(path: &str) -> Url {
        Url::parse(BASE).unwrap().join(path).unwrap()
    }

    #[test]
    fn test_assets_resolve_against_script() {
        let c = controller(
            WorkerConfig::default(),
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(FakeNetwork::default()),
        );
        let assets: Vec<&str> = c.assets().iter().map(Url::as_str).collect();
        assert_eq!(assets[0], "https://app.test/playground/");
        assert_eq!(assets[3], "https://app.test/playground/app.js?v=5");
        assert_eq!(c.cache_name(), "pwa-playground-v3");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = WorkerConfig {
            cache_name: String::new(),
            ..Default::default()
        };
        let result = AssetCacheController::new(
            config,
            url("sw.js"),
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(FakeNetwork::default()),
        );
        assert!(matches!(result, Err(ServiceWorkerError::Common(_))));
    }

    #[tokio::test]
    async fn test_install_seeds_all_assets() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = Arc::new(FakeNetwork::default());
        serve_shell(&network);

        let c = controller(small_config("v1"), storage.clone(), network.clone());
        let outcome = c.on_install().await.unwrap();

        assert_eq!(outcome.seeded, 3);
        assert!(outcome.skip_waiting);
        assert_eq!(storage.get_memory("v1").await.unwrap().len().await, 3);
    }

    #[tokio::test]
    async fn test_install_is_atomic() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = Arc::new(FakeNetwork::default());
        serve_shell(&network);
        network.serve(&format!("{BASE}style.css"), 404, "missing");

        let c = controller(small_config("v1"), storage.clone(), network.clone());
        let err = c.on_install().await.unwrap_err();

        assert!(matches!(err, ServiceWorkerError::InstallFailed(_)));
        assert!(!storage.has("v1").await);

        // any status but 200 counts as a failure
        network.serve(&format!("{BASE}style.css"), 204, "");
        assert!(c.on_install().await.is_err());
        assert!(!storage.has("v1").await);
    }

    #[tokio::test]
    async fn test_install_failure_keeps_existing_generation_untouched() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = Arc::new(FakeNetwork::default());
        serve_shell(&network);

        let c = controller(small_config("v1"), storage.clone(), network.clone());
        c.on_install().await.unwrap();

        network.fail(&format!("{BASE}index.html"));
        assert!(c.on_install().await.is_err());
        assert_eq!(storage.get_memory("v1").await.unwrap().len().await, 3);
    }

    #[tokio::test]
    async fn test_activate_deletes_other_generations() {
        let storage = Arc::new(MemoryCacheStorage::new());
        for name in ["v1", "v2", "v3", "other-app"] {
            storage.open(name).await.unwrap();
        }

        let c = controller(
            small_config("v3"),
            storage.clone(),
            Arc::new(FakeNetwork::default()),
        );
        let outcome = c.on_activate().await;

        assert_eq!(outcome.deleted, vec!["v1", "v2", "other-app"]);
        assert!(outcome.claim_clients);
        assert_eq!(storage.keys().await, vec!["v3".to_string()]);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = Arc::new(FakeNetwork::default());
        serve_shell(&network);

        let c = controller(small_config("v1"), storage, network.clone());
        c.on_install().await.unwrap();
        network.go_offline();
        let before = network.calls();

        let outcome = c.on_intercept(&Request::get(url("style.css"))).await.unwrap();
        let InterceptOutcome::Respond(response) = outcome else {
            panic!("expected a response");
        };
        assert_eq!(response.text().unwrap(), "body{}");
        assert_eq!(network.calls(), before);
    }

    #[tokio::test]
    async fn test_miss_stores_same_origin_200() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = Arc::new(FakeNetwork::default());
        network.serve(&format!("{BASE}data.json"), 200, "{}");

        let c = controller(small_config("v1"), storage.clone(), network);
        let InterceptOutcome::Respond(response) =
            c.on_intercept(&Request::get(url("data.json"))).await.unwrap()
        else {
            panic!("expected a response");
        };

        // caller copy still readable after the stored copy was consumed
        assert_eq!(response.text().unwrap(), "{}");
        let cache = storage.get_memory("v1").await.unwrap();
        let stored = cache
            .match_request(&CacheKey::get(url("data.json")))
            .await
            .unwrap();
        assert_eq!(&stored.body[..], b"{}");
    }

    #[tokio::test]
    async fn test_non_200_and_cross_origin_not_stored() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = Arc::new(FakeNetwork::default());
        network.serve(&format!("{BASE}missing.js"), 404, "nope");
        network.serve(&format!("{BASE}partial"), 206, "part");
        network.serve("https://cdn.test/lib.js", 200, "lib");

        let c = controller(small_config("v1"), storage.clone(), network);

        for target in [
            url("missing.js"),
            url("partial"),
            Url::parse("https://cdn.test/lib.js").unwrap(),
        ] {
            let outcome = c.on_intercept(&Request::get(target)).await.unwrap();
            assert!(matches!(outcome, InterceptOutcome::Respond(_)));
        }

        assert!(storage.get("v1").await.is_none());
    }

    #[tokio::test]
    async fn test_non_get_passes_through() {
        let network = Arc::new(FakeNetwork::default());
        let c = controller(
            small_config("v1"),
            Arc::new(MemoryCacheStorage::new()),
            network.clone(),
        );

        let post = Request::post(url("api"), bytes::Bytes::from_static(b"x"));
        assert!(matches!(
            c.on_intercept(&post).await.unwrap(),
            InterceptOutcome::Passthrough
        ));
        assert_eq!(network.calls(), 0);
    }

    #[tokio::test]
    async fn test_offline_navigation_gets_shell() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = Arc::new(FakeNetwork::default());
        serve_shell(&network);

        let c = controller(small_config("v1"), storage, network.clone());
        c.on_install().await.unwrap();
        network.go_offline();

        let nav = Request::navigate(url("some/deep/page"));
        let InterceptOutcome::Respond(response) = c.on_intercept(&nav).await.unwrap() else {
            panic!("expected the shell");
        };
        assert_eq!(response.text().unwrap(), "<html>shell</html>");

        let sub = Request::get(url("some/deep/image.png"));
        assert!(matches!(
            c.on_intercept(&sub).await,
            Err(ServiceWorkerError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_navigation_without_shell_fails() {
        let network = Arc::new(FakeNetwork::default());
        network.go_offline();
        let c = controller(
            small_config("v1"),
            Arc::new(MemoryCacheStorage::new()),
            network,
        );

        let nav = Request::navigate(url(""));
        assert!(matches!(
            c.on_intercept(&nav).await,
            Err(ServiceWorkerError::Network(_))
        ));
    }
}
