//! Clients: the application pages a worker can see, focus, open and control.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;
use url::Url;

use crate::{Result, ServiceWorkerError, ServiceWorkerId};

/// A client (open page or worker).
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

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
    /// An uncontrolled, unfocused window client.
    pub fn window(url: Url) -> Self {
        Self {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    /// Also return clients not controlled by `controller`.
    pub include_uncontrolled: bool,
    /// Restrict to a client type; `All` matches every type.
    pub client_type: ClientType,
    /// The worker asking; controlled clients are those it controls.
    pub controller: Option<ServiceWorkerId>,
}

/// Clients registry, in the order clients were added.
#[derive(Debug, Default)]
pub struct Clients {
    clients: Vec<Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.iter().find(|c| c.id == id)
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.push(client);
    }

    /// Number of clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Match all clients.
    pub fn match_all(&self, options: &ClientMatchOptions) -> Vec<&Client> {
        self.clients
            .iter()
            .filter(|c| options.include_uncontrolled || c.controller == options.controller)
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect()
    }

    /// Focus a window client; every other client loses focus.
    pub fn focus(&mut self, id: &str) -> Result<Client> {
        let target = self
            .get(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id}")))?;
        if target.client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }

        for client in &mut self.clients {
            client.focused = client.id == id;
        }
        debug!(client = id, "Client focused");
        self.get(id)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id}")))
    }

    /// Open and focus a new window.
    pub fn open_window(&mut self, url: Url) -> Client {
        for client in &mut self.clients {
            client.focused = false;
        }
        let mut client = Client::window(url);
        client.focused = true;
        debug!(client = %client.id, url = %client.url, "Window opened");
        self.clients.push(client.clone());
        client
    }

    /// Take control of every window whose URL passes `in_scope`.
    ///
    /// Returns the IDs of clients whose controller changed.
    pub fn claim(
        &mut self,
        worker: ServiceWorkerId,
        in_scope: impl Fn(&Url) -> bool,
    ) -> Vec<String> {
        self.clients
            .iter_mut()
            .filter(|c| c.client_type == ClientType::Window && in_scope(&c.url))
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect()
    }
}
