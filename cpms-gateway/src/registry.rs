//! Connection registry
//!
//! Maps a charger identity to its live connection. A connection handle is the
//! sending half of the connection's outbound queue; a single writer task per
//! socket drains that queue, so writes to one charger are serialized.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Item on a connection's outbound queue
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Text frame
    Frame(String),
    /// Close the socket with the given code, then stop writing
    Close { code: u16, reason: String },
}

#[derive(Debug, Error)]
#[error("Connection to {0} is closed")]
pub struct ConnectionClosed(pub String);

/// Live connection of one charger
#[derive(Debug)]
pub struct ChargerConnection {
    charger_id: String,
    connection_id: Uuid,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Outbound>,
}

impl ChargerConnection {
    pub fn new(charger_id: impl Into<String>, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            charger_id: charger_id.into(),
            connection_id: Uuid::new_v4(),
            connected_at: Utc::now(),
            outbound,
        }
    }

    /// Connection plus the receiving end of its outbound queue
    pub fn channel(charger_id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(charger_id, tx), rx)
    }

    pub fn charger_id(&self) -> &str {
        &self.charger_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Whether the writer side is still draining the queue
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queue a text frame
    pub async fn send_text(&self, text: String) -> Result<(), ConnectionClosed> {
        self.outbound
            .send(Outbound::Frame(text))
            .await
            .map_err(|_| ConnectionClosed(self.charger_id.clone()))
    }

    /// Queue a close frame
    pub async fn close(&self, code: u16, reason: impl Into<String>) -> Result<(), ConnectionClosed> {
        self.outbound
            .send(Outbound::Close {
                code,
                reason: reason.into(),
            })
            .await
            .map_err(|_| ConnectionClosed(self.charger_id.clone()))
    }
}

/// Charger identity -> live connection
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<ChargerConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a connection, returning the one it superseded (if any)
    pub fn register(&self, connection: Arc<ChargerConnection>) -> Option<Arc<ChargerConnection>> {
        let charger_id = connection.charger_id().to_string();
        let previous = self
            .connections
            .write()
            .insert(charger_id.clone(), connection);

        match &previous {
            Some(old) => info!(
                "Charger {} reconnected, superseding connection {}",
                charger_id,
                old.connection_id()
            ),
            None => debug!("Registered charger {}", charger_id),
        }

        previous
    }

    /// Remove the mapping only if it still points at `connection`
    pub fn unregister(&self, charger_id: &str, connection: &ChargerConnection) -> bool {
        let mut connections = self.connections.write();

        let current = connections
            .get(charger_id)
            .map(|c| c.connection_id() == connection.connection_id())
            .unwrap_or(false);

        if current {
            connections.remove(charger_id);
            debug!("Unregistered charger {}", charger_id);
        } else {
            debug!(
                "Ignoring stale unregister for {} (connection {})",
                charger_id,
                connection.connection_id()
            );
        }

        current
    }

    pub fn get(&self, charger_id: &str) -> Option<Arc<ChargerConnection>> {
        self.connections.read().get(charger_id).cloned()
    }

    pub fn is_connected(&self, charger_id: &str) -> bool {
        self.connections.read().contains_key(charger_id)
    }

    /// Identities with a registered connection
    pub fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}
