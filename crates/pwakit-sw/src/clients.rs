//! Clients API: pages the worker controls.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

use crate::ServiceWorkerId;

/// A client (controlled page).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Worker controlling this client, if any.
    pub controller: Option<ServiceWorkerId>,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

impl Client {
    /// Create an uncontrolled window client.
    pub fn window(url: Url) -> Self {
        Self {
            id: format!("client-{}", uuid_simple()),
            url,
            client_type: ClientType::Window,
            controller: None,
        }
    }

    /// Check if controlled by any worker.
    pub fn is_controlled(&self) -> bool {
        self.controller.is_some()
    }
}

/// Options for `clients.matchAll()`.
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Match clients controlled by `worker`, plus uncontrolled ones if asked.
    pub fn match_all(&self, worker: ServiceWorkerId, options: &ClientMatchOptions) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| c.controller == Some(worker) || options.include_uncontrolled)
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect()
    }

    /// Make `worker` the controller of every client inside `scope`.
    ///
    /// Returns the IDs whose controller changed.
    pub fn claim(&mut self, worker: ServiceWorkerId, scope: &Url) -> Vec<String> {
        self.clients
            .values_mut()
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect()
    }

    /// Drop control for every client of `worker`.
    pub fn release(&mut self, worker: ServiceWorkerId) {
        for client in self.clients.values_mut() {
            if client.controller == Some(worker) {
                client.controller = None;
            }
        }
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no clients are tracked.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Generate a simple UUID-like string.
fn uuid_simple() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!(
        "{:016x}-{:04x}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_window_client() {
        let a = Client::window(url("https://app.test/"));
        let b = Client::window(url("https://app.test/"));

        assert_eq!(a.client_type, ClientType::Window);
        assert!(!a.is_controlled());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_claim_respects_scope() {
        let worker = ServiceWorkerId::new();
        let mut clients = Clients::new();
        let inside = Client::window(url("https://app.test/playground/index.html"));
        let outside = Client::window(url("https://app.test/other/"));
        let inside_id = inside.id.clone();
        clients.add(inside);
        clients.add(outside);

        let claimed = clients.claim(worker, &url("https://app.test/playground/"));
        assert_eq!(claimed, vec![inside_id.clone()]);
        assert!(clients.get(&inside_id).unwrap().is_controlled());

        // second claim changes nothing
        assert!(clients.claim(worker, &url("https://app.test/playground/")).is_empty());
    }

    #[test]
    fn test_match_all() {
        let worker = ServiceWorkerId::new();
        let mut clients = Clients::new();
        clients.add(Client::window(url("https://app.test/a")));
        clients.add(Client::window(url("https://elsewhere.test/")));
        clients.claim(worker, &url("https://app.test/"));

        assert_eq!(clients.match_all(worker, &ClientMatchOptions::default()).len(), 1);

        let everything = ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::All,
        };
        assert_eq!(clients.match_all(worker, &everything).len(), 2);

        let workers_only = ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::Worker,
        };
        assert!(clients.match_all(worker, &workers_only).is_empty());
    }

    #[test]
    fn test_release_and_remove() {
        let worker = ServiceWorkerId::new();
        let mut clients = Clients::new();
        let client = Client::window(url("https://app.test/"));
        let id = client.id.clone();
        clients.add(client);
        clients.claim(worker, &url("https://app.test/"));

        clients.release(worker);
        assert!(!clients.get(&id).unwrap().is_controlled());

        assert!(clients.remove(&id).is_some());
        assert!(clients.is_empty());
    }
}
