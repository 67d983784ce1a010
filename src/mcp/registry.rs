//! Process-wide table of live MCP connections keyed by endpoint id.
//!
//! An entry exists only for a connection whose transport, liveness probe and
//! catalog all succeeded. Connect and disconnect for one id are serialized by
//! a per-id lock; different ids proceed in parallel.

use super::catalog::{fetch_catalog, CapabilityCatalog};
use super::descriptor::{EndpointDescriptor, TransportKind};
use super::error::{ConnectFailure, RefreshError};
use super::negotiator::{TransportConnector, TransportNegotiator};
use super::protocol::{format_rpc_error, format_unexpected_server_message, ServerInfo};
use super::transport::{is_method_not_found, McpTransport, TransportTimeouts};
use rust_mcp_schema::schema_utils::{RequestFromClient, ServerMessage};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(skip)]
    pub transport: Arc<dyn McpTransport>,
    pub descriptor: EndpointDescriptor,
    pub server_info: ServerInfo,
    pub catalog: CapabilityCatalog,
    pub transport_used: TransportKind,
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.descriptor.id)
            .field("transport_used", &self.transport_used)
            .field("server_info", &self.server_info)
            .field("tools", &self.catalog.tools.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionOutcome {
    Connected(Arc<Connection>),
    Failed { id: String, message: String },
}

impl ConnectionOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionOutcome::Connected(_))
    }

    pub fn id(&self) -> &str {
        match self {
            ConnectionOutcome::Connected(connection) => connection.id(),
            ConnectionOutcome::Failed { id, .. } => id,
        }
    }
}

pub struct ConnectionRegistry {
    connector: Arc<dyn TransportConnector>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    id_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            connector,
            connections: RwLock::new(HashMap::new()),
            id_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Registry backed by real processes and network transports.
    pub fn with_timeouts(timeouts: TransportTimeouts) -> Self {
        Self::new(Arc::new(TransportNegotiator::with_timeouts(timeouts)))
    }

    async fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.id_locks
            .lock()
            .await
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the per-id lock entry once no other caller holds or awaits it.
    /// Clones are only handed out under the map lock, so the count is exact.
    async fn release_id_lock(&self, id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.id_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
    }

    /// Connects an endpoint, replacing any existing connection for its id.
    /// Failures come back as `ConnectionOutcome::Failed`, never as a
    /// half-open entry.
    pub async fn connect(&self, descriptor: EndpointDescriptor) -> ConnectionOutcome {
        let id = descriptor.id.clone();
        let lock = self.id_lock(&id).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.connect_locked(descriptor).await
        };
        self.release_id_lock(&id, lock).await;
        outcome
    }

    async fn connect_locked(&self, descriptor: EndpointDescriptor) -> ConnectionOutcome {
        let id = descriptor.id.clone();
        self.disconnect_locked(&id).await;

        info!(server_id = %id, transport = %descriptor.kind(), "Connecting MCP server");
        let live = match self.connector.connect(&descriptor).await {
            Ok(live) => live,
            Err(err) => {
                let failure = ConnectFailure::classify(descriptor.kind(), &err.to_string());
                warn!(server_id = %id, error = %err, "MCP connection failed");
                return ConnectionOutcome::Failed {
                    id,
                    message: failure.to_string(),
                };
            }
        };

        if let Err(raw) = probe(live.transport.as_ref()).await {
            let failure = ConnectFailure::classify(live.used, &raw);
            warn!(server_id = %id, error = %raw, "MCP liveness probe failed");
            close_quietly(&id, live.transport.as_ref()).await;
            return ConnectionOutcome::Failed {
                id,
                message: failure.to_string(),
            };
        }

        let catalog = match fetch_catalog(live.transport.as_ref()).await {
            Ok(catalog) => catalog,
            Err(err) => {
                let failure = ConnectFailure::classify(live.used, &err.0);
                warn!(server_id = %id, error = %err, "MCP capability listing failed");
                close_quietly(&id, live.transport.as_ref()).await;
                return ConnectionOutcome::Failed {
                    id,
                    message: failure.to_string(),
                };
            }
        };

        let connection = Arc::new(Connection {
            transport: live.transport,
            descriptor,
            server_info: live.server_info,
            catalog,
            transport_used: live.used,
        });
        self.connections
            .write()
            .await
            .insert(id.clone(), connection.clone());
        info!(
            server_id = %id,
            transport = %connection.transport_used,
            tools = connection.catalog.tools.len(),
            prompts = connection.catalog.prompts.len(),
            resources = connection.catalog.resources.len(),
            "MCP server connected"
        );
        ConnectionOutcome::Connected(connection)
    }

    /// Closes and forgets a connection. Unknown ids are a no-op.
    pub async fn disconnect(&self, id: &str) {
        let lock = self.id_lock(id).await;
        {
            let _guard = lock.lock().await;
            self.disconnect_locked(id).await;
        }
        self.release_id_lock(id, lock).await;
    }

    async fn disconnect_locked(&self, id: &str) {
        let removed = self.connections.write().await.remove(id);
        if let Some(connection) = removed {
            close_quietly(id, connection.transport.as_ref()).await;
            info!(server_id = %id, "MCP server disconnected");
        }
    }

    pub async fn disconnect_all(&self) {
        for id in self.list_ids().await {
            self.disconnect(&id).await;
        }
    }

    /// Probes a connection and evicts it when the probe fails.
    pub async fn validate(&self, id: &str) -> bool {
        let Some(connection) = self.get(id).await else {
            return false;
        };
        match probe(connection.transport.as_ref()).await {
            Ok(()) => true,
            Err(err) => {
                warn!(server_id = %id, error = %err, "MCP connection failed validation");
                self.evict(&connection).await;
                false
            }
        }
    }

    /// Validates every registered id in turn and returns the survivors.
    pub async fn validate_all(&self) -> Vec<String> {
        let mut alive = Vec::new();
        for id in self.list_ids().await {
            if self.validate(&id).await {
                alive.push(id);
            }
        }
        alive
    }

    /// Re-lists capabilities and replaces the snapshot wholesale. Total
    /// failure evicts the connection.
    pub async fn refresh_catalog(&self, id: &str) -> Result<Arc<Connection>, RefreshError> {
        let lock = self.id_lock(id).await;
        let refreshed = {
            let _guard = lock.lock().await;
            self.refresh_locked(id).await
        };
        self.release_id_lock(id, lock).await;
        refreshed
    }

    async fn refresh_locked(&self, id: &str) -> Result<Arc<Connection>, RefreshError> {
        let connection = self
            .get(id)
            .await
            .ok_or_else(|| RefreshError::NotConnected {
                server_id: id.to_string(),
            })?;

        match fetch_catalog(connection.transport.as_ref()).await {
            Ok(catalog) => {
                let refreshed = Arc::new(Connection {
                    catalog,
                    ..Connection::clone(&connection)
                });
                self.connections
                    .write()
                    .await
                    .insert(id.to_string(), refreshed.clone());
                debug!(server_id = %id, tools = refreshed.catalog.tools.len(), "MCP catalog refreshed");
                Ok(refreshed)
            }
            Err(source) => {
                warn!(server_id = %id, error = %source, "MCP catalog refresh failed");
                self.evict(&connection).await;
                Err(RefreshError::Unavailable {
                    server_id: id.to_string(),
                    source,
                })
            }
        }
    }

    /// Removes the entry only if it still refers to this connection, so a
    /// concurrent reconnect is never torn down by a stale failure.
    async fn evict(&self, connection: &Arc<Connection>) {
        let id = connection.id();
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(id) {
                Some(current) if Arc::ptr_eq(current, connection) => connections.remove(id),
                _ => None,
            }
        };
        if removed.is_some() {
            info!(server_id = %id, "Evicted MCP connection");
        }
        close_quietly(id, connection.transport.as_ref()).await;
    }

    pub async fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(id).cloned()
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        self.connections.read().await.contains_key(id)
    }
}

/// Lightweight tool listing. A server without tools support answers
/// method-not-found, which still proves the session is alive.
async fn probe(transport: &dyn McpTransport) -> Result<(), String> {
    let response = transport
        .send_request(RequestFromClient::ListToolsRequest(None))
        .await?;
    if is_method_not_found(&response) {
        return Ok(());
    }
    match response {
        ServerMessage::Response(_) => Ok(()),
        ServerMessage::Error(error) => Err(format_rpc_error(&error.error)),
        other => Err(format_unexpected_server_message(&other)),
    }
}

async fn close_quietly(id: &str, transport: &dyn McpTransport) {
    if let Err(err) = transport.close().await {
        debug!(server_id = %id, error = %err, "Ignoring MCP close failure");
    }
}

#[cfg(test)]
mod tests;
