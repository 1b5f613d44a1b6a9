//! App-id keyed client registry.
//!
//! An ordinary value owned by the application, for code that needs to look
//! up the client of an app without threading the handle through.

use dashmap::DashMap;

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::transport::Transport;

/// Clients by app id.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<String, Client>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The client of `app_id`, if registered.
    pub fn get(&self, app_id: &str) -> Option<Client> {
        self.clients.get(app_id).map(|c| c.clone())
    }

    /// Register a client under its app id. Returns the client it replaced.
    pub fn insert(&self, client: Client) -> Option<Client> {
        self.clients.insert(client.config().app_id.clone(), client)
    }

    /// The registered client of `config.app_id`, or a newly opened one.
    ///
    /// When two callers race, the first registration wins and the other
    /// client is shut down.
    pub async fn get_or_open(
        &self,
        config: ClientConfig,
        transport: impl Transport + 'static,
    ) -> Result<Client, ClientError> {
        if let Some(client) = self.get(&config.app_id) {
            return Ok(client);
        }
        let app_id = config.app_id.clone();
        let opened = Client::open(config, transport).await?;
        let winner = self
            .clients
            .entry(app_id)
            .or_insert_with(|| opened.clone())
            .clone();
        if !winner.ptr_eq(&opened) {
            opened.shutdown().await;
        }
        Ok(winner)
    }

    /// Unregister and return the client of `app_id`.
    pub fn remove(&self, app_id: &str) -> Option<Client> {
        self.clients.remove(app_id).map(|(_, c)| c)
    }

    /// Registered app ids.
    pub fn app_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Shut down and unregister every client.
    pub async fn shutdown_all(&self) {
        let clients: Vec<Client> = self.clients.iter().map(|e| e.value().clone()).collect();
        self.clients.clear();
        for client in clients {
            client.shutdown().await;
        }
    }
}
