use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const DIRECTIVE_CHANNEL_CAPACITY: usize = 1024;

/// An instruction for the connection router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Directive {
    Connect { client: String, backend: String },
    Message { client: String, text: String },
    Disconnect { client: String, reason: String },
}

impl Directive {
    pub fn client(&self) -> &str {
        match self {
            Directive::Connect { client, .. }
            | Directive::Message { client, .. }
            | Directive::Disconnect { client, .. } => client,
        }
    }
}

/// What the orchestrator needs to know about, and ask of, the router.
pub trait Router: Send + Sync {
    fn connected_clients(&self) -> usize;
    fn occupancy(&self, backend: &str) -> usize;
    fn current_backend(&self, client: &str) -> Option<String>;
    fn is_online(&self, client: &str) -> bool;
    fn clients_on(&self, backend: &str) -> Vec<String>;
    fn send(&self, directive: Directive);
}

/// Router state rebuilt from reported events; directives go to subscribers.
#[derive(Debug)]
pub struct TrackedRouter {
    /// Online clients and the backend each is on, if any yet.
    clients: Mutex<HashMap<String, Option<String>>>,
    directives: broadcast::Sender<Directive>,
}

impl Default for TrackedRouter {
    fn default() -> Self {
        let (directives, _) = broadcast::channel(DIRECTIVE_CHANNEL_CAPACITY);
        Self {
            clients: Mutex::new(HashMap::new()),
            directives,
        }
    }
}

impl TrackedRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn clients(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<String>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn login(&self, client: &str) {
        self.clients().entry(client.to_string()).or_insert(None);
    }

    /// Record that `client` landed on `backend`; returns the backend it left.
    pub fn connected(&self, client: &str, backend: &str) -> Option<String> {
        self.clients()
            .insert(client.to_string(), Some(backend.to_string()))
            .flatten()
    }

    /// Forget `client`; returns the backend it was on.
    pub fn disconnect(&self, client: &str) -> Option<String> {
        self.clients().remove(client).flatten()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Directive> {
        self.directives.subscribe()
    }
}

impl Router for TrackedRouter {
    fn connected_clients(&self) -> usize {
        self.clients().len()
    }

    fn occupancy(&self, backend: &str) -> usize {
        self.clients()
            .values()
            .filter(|b| b.as_deref() == Some(backend))
            .count()
    }

    fn current_backend(&self, client: &str) -> Option<String> {
        self.clients().get(client).cloned().flatten()
    }

    fn is_online(&self, client: &str) -> bool {
        self.clients().contains_key(client)
    }

    fn clients_on(&self, backend: &str) -> Vec<String> {
        let mut clients: Vec<String> = self
            .clients()
            .iter()
            .filter(|(_, b)| b.as_deref() == Some(backend))
            .map(|(c, _)| c.clone())
            .collect();
        clients.sort();
        clients
    }

    fn send(&self, directive: Directive) {
        tracing::debug!(client = %directive.client(), ?directive, "directive");
        // nobody listening is fine
        let _ = self.directives.send(directive);
    }
}
