//! Worker host (`navigator.serviceWorker` plus the runtime behind it).
//!
//! The host owns the single registration of its origin, drives the worker
//! lifecycle and routes fetches, control messages and notifications to the
//! active [`AssetCacheController`].

use std::sync::Arc;

use async_trait::async_trait;
use pwakit_channel::{ChannelError, MessageTarget, WorkerMessage};
use pwakit_common::{retry_with_backoff, OptionExt};
use pwakit_net::{Fetcher, Origin, Request, Response};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{Client, ClientMatchOptions, Clients};
use crate::config::{HostConfig, WorkerConfig};
use crate::controller::{ActivateOutcome, AssetCacheController, InterceptOutcome};
use crate::notification::{LogNotifier, Notification, NotificationOptions, Notifier};
use crate::{
    ServiceWorker, ServiceWorkerError, ServiceWorkerId, ServiceWorkerRegistration,
    ServiceWorkerState,
};

/// Registration options.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope URL. Defaults to the directory of the script.
    pub scope: Option<String>,
}

/// Page-visible registration indicator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegistrationStatus {
    /// `register` was never called.
    #[default]
    NotRegistered,
    /// Installed, waiting for the previous worker to let go.
    Waiting { scope: Url },
    /// A worker controls the scope.
    Active { scope: Url },
    /// Registration or install failed.
    Failed(String),
    /// The runtime has no service worker support.
    Unsupported,
}

impl RegistrationStatus {
    /// Short label for a status line.
    pub fn indicator(&self) -> &'static str {
        match self {
            RegistrationStatus::NotRegistered => "SW not registered",
            RegistrationStatus::Waiting { .. } => "SW waiting",
            RegistrationStatus::Active { .. } => "SW active",
            RegistrationStatus::Failed(_) => "SW error",
            RegistrationStatus::Unsupported => "SW not available",
        }
    }

    /// Whether a worker is serving.
    pub fn is_active(&self) -> bool {
        matches!(self, RegistrationStatus::Active { .. })
    }
}

/// Service worker events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new worker started installing.
    UpdateFound { scope: Url },
    /// A client got a new controller.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

/// Runtime hosting one offline worker per origin.
pub struct WorkerHost {
    config: HostConfig,
    caches: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    notifier: Arc<dyn Notifier>,
    registration: RwLock<Option<ServiceWorkerRegistration>>,
    status: RwLock<RegistrationStatus>,
    clients: RwLock<Clients>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl WorkerHost {
    /// Create a new host. Notifications go to the log until
    /// [`with_notifier`](Self::with_notifier) replaces the sink.
    pub fn new(
        config: HostConfig,
        caches: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                config,
                caches,
                fetcher,
                notifier: Arc::new(LogNotifier),
                registration: RwLock::new(None),
                status: RwLock::new(RegistrationStatus::NotRegistered),
                clients: RwLock::new(Clients::new()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Use a different notification sink.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // nobody listening is fine
        let _ = self.event_tx.send(event);
    }

    async fn set_status(&self, status: RegistrationStatus) {
        *self.status.write().await = status;
    }

    async fn fail(&self, error: ServiceWorkerError) -> ServiceWorkerError {
        warn!(error = %error, "Service worker registration failed");
        self.set_status(RegistrationStatus::Failed(error.to_string())).await;
        error
    }

    // ==================== Registration ====================

    /// Register the worker script and run its install.
    ///
    /// A failure is recorded in [`registration_status`](Self::registration_status)
    /// and returned; any previously active worker keeps serving.
    pub async fn register(
        &self,
        script_url: &str,
        worker: WorkerConfig,
        options: RegistrationOptions,
    ) -> Result<(), ServiceWorkerError> {
        if !self.config.enabled {
            self.set_status(RegistrationStatus::Unsupported).await;
            return Err(ServiceWorkerError::RegistrationFailed(
                "service workers are not supported".into(),
            ));
        }

        let (script_url, scope) = match self.resolve_scope(script_url, &options) {
            Ok(resolved) => resolved,
            Err(e) => return Err(self.fail(e).await),
        };

        let controller = match AssetCacheController::new(
            worker,
            script_url.clone(),
            self.caches.clone(),
            self.fetcher.clone(),
        ) {
            Ok(controller) => Arc::new(controller),
            Err(e) => return Err(self.fail(e).await),
        };

        // A registration for a new scope stays staged until its install
        // succeeds; the current one keeps serving meanwhile.
        let worker = ServiceWorker::new(script_url.clone(), controller.clone());
        let (id, mut staged) = {
            let mut slot = self.registration.write().await;
            if slot.as_ref().is_some_and(|r| r.scope != scope) {
                let mut staged = ServiceWorkerRegistration::new(scope.clone());
                (staged.update(worker), Some(staged))
            } else {
                let registration =
                    slot.get_or_insert_with(|| ServiceWorkerRegistration::new(scope.clone()));
                (registration.update(worker), None)
            }
        };

        info!(worker = %id, script = %script_url, scope = %scope, "Installing service worker");
        self.emit(ServiceWorkerEvent::UpdateFound {
            scope: scope.clone(),
        });
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: id,
            new_state: ServiceWorkerState::Installing,
        });

        let installed =
            retry_with_backoff(&self.config.install_retry, || controller.on_install()).await;

        let outcome = match installed {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(staged) = staged.as_mut() {
                    staged.install_failed(id, &e.to_string());
                } else if let Some(registration) = self.registration.write().await.as_mut() {
                    registration.install_failed(id, &e.to_string());
                }
                self.emit(ServiceWorkerEvent::StateChange {
                    worker_id: id,
                    new_state: ServiceWorkerState::Redundant,
                });
                return Err(self.fail(e).await);
            }
        };

        let activate_now = {
            let mut slot = self.registration.write().await;
            if let Some(mut staged) = staged {
                if let Some(mut old) = slot.take() {
                    info!(old = %old.scope, new = %scope, "Replacing registration");
                    self.release_all(&old).await;
                    old.unregister();
                }
                staged.install_complete(id);
                *slot = Some(staged);
                true
            } else {
                let Some(registration) = slot.as_mut() else {
                    return Err(ServiceWorkerError::StateError(
                        "registration removed during install".into(),
                    ));
                };
                if !registration.install_complete(id) {
                    debug!(worker = %id, "Install superseded by a newer registration");
                    return Ok(());
                }
                outcome.skip_waiting || registration.active.is_none()
            }
        };

        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: id,
            new_state: ServiceWorkerState::Installed,
        });

        if activate_now {
            self.activate_waiting().await?;
        } else {
            info!(worker = %id, "Installed, waiting for the active worker to be released");
            self.set_status(RegistrationStatus::Waiting { scope }).await;
        }

        Ok(())
    }

    fn resolve_scope(
        &self,
        script_url: &str,
        options: &RegistrationOptions,
    ) -> Result<(Url, Url), ServiceWorkerError> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(format!("{script_url}: {e}")))?;

        let max_scope = script_url
            .join("./")
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;

        let scope = match &options.scope {
            Some(s) => script_url
                .join(s)
                .map_err(|e| ServiceWorkerError::RegistrationFailed(format!("scope {s}: {e}")))?,
            None => max_scope.clone(),
        };

        let origin = Origin::from_url(&scope);
        if self.config.require_secure_origin && !origin.is_secure() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "origin {origin} is not secure"
            )));
        }

        if !origin.contains(&script_url) {
            return Err(ServiceWorkerError::SecurityError(format!(
                "script {script_url} is not on origin {origin}"
            )));
        }

        if !scope.as_str().starts_with(max_scope.as_str()) {
            return Err(ServiceWorkerError::SecurityError(format!(
                "scope {scope} is outside the script directory {max_scope}"
            )));
        }

        Ok((script_url, scope))
    }

    /// Activate the waiting worker: evict old caches, then claim clients if
    /// the worker asks for it.
    pub async fn activate_waiting(&self) -> Result<ActivateOutcome, ServiceWorkerError> {
        let (id, controller) = {
            let mut slot = self.registration.write().await;
            let registration = slot
                .as_mut()
                .ok_or_else(|| ServiceWorkerError::NotFound("registration".into()))?;
            registration
                .begin_activation()
                .map(|w| (w.id, w.controller.clone()))
                .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".into()))?
        };
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: id,
            new_state: ServiceWorkerState::Activating,
        });

        // runs without the registration lock
        let outcome = controller.on_activate().await;

        let scope = {
            let mut slot = self.registration.write().await;
            let registration = slot
                .as_mut()
                .filter(|r| r.waiting.as_ref().map(|w| w.id) == Some(id))
                .ok_or_else(|| {
                    ServiceWorkerError::StateError("activation superseded".into())
                })?;

            if let Some(old) = registration.finish_activation() {
                self.clients.write().await.release(old.id);
                self.emit(ServiceWorkerEvent::StateChange {
                    worker_id: old.id,
                    new_state: ServiceWorkerState::Redundant,
                });
            }
            registration.scope.clone()
        };
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: id,
            new_state: ServiceWorkerState::Activated,
        });

        if outcome.claim_clients {
            let claimed = self.clients.write().await.claim(id, &scope);
            for client_id in claimed {
                self.emit(ServiceWorkerEvent::ControllerChange {
                    client_id,
                    worker_id: id,
                });
            }
        }

        info!(worker = %id, scope = %scope, "Service worker active");
        self.set_status(RegistrationStatus::Active { scope }).await;
        Ok(outcome)
    }

    /// Unregister. Returns false when nothing was registered.
    pub async fn unregister(&self) -> bool {
        let Some(mut registration) = self.registration.write().await.take() else {
            return false;
        };
        self.release_all(&registration).await;
        registration.unregister();
        self.set_status(RegistrationStatus::NotRegistered).await;
        info!(scope = %registration.scope, "Service worker unregistered");
        true
    }

    async fn release_all(&self, registration: &ServiceWorkerRegistration) {
        if let Some(active) = registration.get_active() {
            self.clients.write().await.release(active.id);
        }
    }

    /// Current page-visible status.
    pub async fn registration_status(&self) -> RegistrationStatus {
        self.status.read().await.clone()
    }

    /// Scope of the current registration.
    pub async fn scope(&self) -> Option<Url> {
        self.registration.read().await.as_ref().map(|r| r.scope.clone())
    }

    /// Controller of the active worker.
    pub async fn active_controller(&self) -> Option<Arc<AssetCacheController>> {
        self.active_worker().await.map(|(_, c)| c)
    }

    async fn active_worker(&self) -> Option<(Url, Arc<AssetCacheController>)> {
        let slot = self.registration.read().await;
        let registration = slot.as_ref()?;
        let active = registration.get_active()?;
        Some((registration.scope.clone(), active.controller.clone()))
    }

    // ==================== Fetch ====================

    /// Route a request from a page through the active worker.
    ///
    /// Navigations outside the scope and requests made while no worker is
    /// active go straight to the network.
    pub async fn dispatch_fetch(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        let controller = match self.active_worker().await {
            Some((scope, _)) if request.is_navigation() && !in_scope(&scope, &request.url) => None,
            Some((_, controller)) => Some(controller),
            None => None,
        };

        let Some(controller) = controller else {
            return Ok(self.fetcher.fetch(request).await?);
        };

        match controller.on_intercept(request).await? {
            InterceptOutcome::Respond(response) => Ok(response),
            InterceptOutcome::Passthrough => Ok(self.fetcher.fetch(request).await?),
        }
    }

    // ==================== Clients ====================

    /// Track a new window. It is controlled right away if a worker is active
    /// for its URL. Returns the client ID.
    pub async fn connect_client(&self, url: Url) -> String {
        let mut client = Client::window(url);
        if let Some(active) = self.registration.read().await.as_ref().and_then(|r| {
            r.get_active()
                .filter(|_| in_scope(&r.scope, &client.url))
                .map(|w| w.id)
        }) {
            client.controller = Some(active);
        }

        let id = client.id.clone();
        debug!(client = %id, url = %client.url, controlled = client.is_controlled(), "Client connected");
        self.clients.write().await.add(client);
        id
    }

    /// Forget a window.
    pub async fn disconnect_client(&self, id: &str) -> bool {
        self.clients.write().await.remove(id).is_some()
    }

    /// Client by ID.
    pub async fn client(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    /// Clients controlled by the active worker.
    pub async fn controlled_clients(&self) -> Vec<Client> {
        let Some(active) = self
            .registration
            .read()
            .await
            .as_ref()
            .and_then(|r| r.get_active().map(|w| w.id))
        else {
            return Vec::new();
        };

        self.clients
            .read()
            .await
            .match_all(active, &ClientMatchOptions::default())
            .into_iter()
            .cloned()
            .collect()
    }

    // ==================== Notifications ====================

    /// Show a notification through the active worker's registration.
    pub async fn show_notification(
        &self,
        title: impl Into<String>,
        options: NotificationOptions,
    ) -> Result<(), ServiceWorkerError> {
        self.active_controller()
            .await
            .ok_or_not_found("active service worker")?;

        let notification = Notification {
            title: title.into(),
            options,
        };
        self.notifier.show(&notification).await
    }
}

#[async_trait]
impl MessageTarget for WorkerHost {
    async fn has_controller(&self) -> bool {
        self.active_controller().await.is_some()
    }

    async fn post_message(&self, message: WorkerMessage) -> Result<(), ChannelError> {
        let controller = self
            .active_controller()
            .await
            .ok_or(ChannelError::NoController)?;
        controller.on_control_message(message).await;
        Ok(())
    }
}

fn in_scope(scope: &Url, url: &Url) -> bool {
    url.as_str().starts_with(scope.as_str())
}
