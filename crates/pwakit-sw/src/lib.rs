//! # PwaKit Service Worker
//!
//! Offline asset worker for a single web app: caches the app shell at
//! install, drops old cache generations at activation and answers requests
//! cache-first.
//!
//! ## Features
//!
//! - **Lifecycle**: install, activate, fetch, message
//! - **Cache API**: injected [`CacheStorage`] with an in-memory backend
//! - **Fetch interception**: cache-first with offline shell for navigations
//! - **Control channel**: list or clear the cache over a message port
//! - **Clients API**: claim open pages on activation
//!
//! ## Architecture
//!
//! ```text
//! WorkerHost (navigator.serviceWorker + runtime)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       ├── active (ServiceWorker)
//!     │       └── scope
//!     │
//!     └── ServiceWorker ── AssetCacheController
//!                              ├── CacheStorage (caches)
//!                              │       └── Cache: Request → Response
//!                              └── Fetcher (network)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use pwakit_common::CommonError;
use pwakit_net::NetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod cache;
pub mod clients;
pub mod config;
mod control;
pub mod controller;
pub mod host;
pub mod notification;

#[cfg(test)]
mod testing;

pub use cache::{Cache, CacheKey, CacheStorage, CachedResponse, MemoryCache, MemoryCacheStorage};
pub use clients::{Client, ClientMatchOptions, ClientType, Clients};
pub use config::{HostConfig, WorkerConfig};
pub use controller::{ActivateOutcome, AssetCacheController, InstallOutcome, InterceptOutcome};
pub use host::{RegistrationOptions, RegistrationStatus, ServiceWorkerEvent, WorkerHost};
pub use notification::{LogNotifier, Notification, NotificationOptions, Notifier};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Network(#[from] NetError),

    #[error(transparent)]
    Common(#[from] CommonError),
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Script evaluated, not yet installing.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,

    /// Event handlers.
    pub controller: Arc<AssetCacheController>,
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("script_url", &self.script_url.as_str())
            .field("state", &self.state)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(script_url: Url, controller: Arc<AssetCacheController>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
            controller,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Last update time.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Start installing a new worker. Replaces any worker still installing.
    pub fn update(&mut self, mut worker: ServiceWorker) -> ServiceWorkerId {
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;
        if let Some(mut previous) = self.installing.replace(worker) {
            previous.set_state(ServiceWorkerState::Redundant);
        }
        self.last_update_check = Some(Instant::now());
        id
    }

    /// Transition installing to waiting. Ignored if `id` is no longer installing.
    pub fn install_complete(&mut self, id: ServiceWorkerId) -> bool {
        match self.installing.take() {
            Some(mut worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Installed);
                if let Some(mut old) = self.waiting.replace(worker) {
                    old.set_state(ServiceWorkerState::Redundant);
                }
                true
            }
            other => {
                self.installing = other;
                false
            }
        }
    }

    /// Discard the installing worker after a failed install.
    pub fn install_failed(&mut self, id: ServiceWorkerId, error: &str) -> Option<ServiceWorker> {
        match self.installing.take() {
            Some(mut worker) if worker.id == id => {
                worker.error = Some(error.to_string());
                worker.set_state(ServiceWorkerState::Redundant);
                Some(worker)
            }
            other => {
                self.installing = other;
                None
            }
        }
    }

    /// Move the waiting worker to `Activating`. The previous active worker
    /// keeps serving until [`finish_activation`](Self::finish_activation).
    pub fn begin_activation(&mut self) -> Option<&ServiceWorker> {
        let worker = self.waiting.as_mut()?;
        worker.set_state(ServiceWorkerState::Activating);
        Some(worker)
    }

    /// Promote the activating worker. Returns the worker it replaced.
    pub fn finish_activation(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activated);

        let mut old = self.active.replace(worker);
        if let Some(ref mut old) = old {
            old.set_state(ServiceWorkerState::Redundant);
        }
        old
    }

    /// Unregister (mark every worker redundant).
    pub fn unregister(&mut self) {
        for slot in [&mut self.active, &mut self.waiting, &mut self.installing] {
            if let Some(mut worker) = slot.take() {
                worker.set_state(ServiceWorkerState::Redundant);
            }
        }
    }
}
