//! Client registry: the pages a worker can message and claim.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};
use url::Url;

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
}

/// A connected page or worker.
#[derive(Debug)]
struct Client {
    url: Url,
    client_type: ClientType,
    controlled: bool,
    port: mpsc::UnboundedSender<Value>,
}

/// Summary of a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: String,
    pub url: Url,
    pub client_type: ClientType,
    pub controlled: bool,
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Clients API.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Client>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. The receiver gets every message posted to it.
    pub async fn connect(
        &self,
        url: Url,
        client_type: ClientType,
        controlled: bool,
    ) -> (String, mpsc::UnboundedReceiver<Value>) {
        let (port, rx) = mpsc::unbounded_channel();
        let id = next_client_id();
        debug!(client_id = %id, url = %url, controlled, "Client connected");
        self.clients.write().await.insert(
            id.clone(),
            Client {
                url,
                client_type,
                controlled,
                port,
            },
        );
        (id, rx)
    }

    pub async fn disconnect(&self, id: &str) -> bool {
        self.clients.write().await.remove(id).is_some()
    }

    pub async fn get(&self, id: &str) -> Option<ClientInfo> {
        self.clients.read().await.get(id).map(|c| ClientInfo {
            id: id.to_string(),
            url: c.url.clone(),
            client_type: c.client_type,
            controlled: c.controlled,
        })
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Take control of every uncontrolled client whose URL passes `in_scope`.
    /// Returns the claimed ids.
    pub async fn claim(&self, in_scope: impl Fn(&Url) -> bool) -> Vec<String> {
        let mut clients = self.clients.write().await;
        let mut claimed: Vec<String> = clients
            .iter_mut()
            .filter(|(_, c)| !c.controlled && in_scope(&c.url))
            .map(|(id, c)| {
                c.controlled = true;
                id.clone()
            })
            .collect();
        claimed.sort();
        claimed
    }

    /// Post to every controlled window client. Returns how many received it.
    pub async fn broadcast(&self, message: &Value) -> usize {
        let clients = self.clients.read().await;
        let mut delivered = 0;
        for (id, client) in clients.iter() {
            if !client.controlled || client.client_type != ClientType::Window {
                continue;
            }
            if client.port.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                trace!(client_id = %id, "Client port closed, skipping");
            }
        }
        delivered
    }
}
