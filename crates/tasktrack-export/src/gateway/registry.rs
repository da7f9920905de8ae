//! Connection bookkeeping for the gateway.

use crate::events::ExportEvent;
use crate::job::JobId;
use crate::metrics::GatewayMetrics;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

/// Identity of one client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connected clients and the jobs each one observes.
///
/// Bindings outlive their connection so a reconnecting client can claim
/// them with [`ConnectionRegistry::rebind`].
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, UnboundedSender<ExportEvent>>>,
    bindings: RwLock<HashMap<JobId, ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection and returns its event stream.
    pub fn subscribe(&self) -> (ConnectionId, UnboundedReceiver<ExportEvent>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let count = {
            let mut connections = self.connections.write();
            connections.insert(id.clone(), tx);
            connections.len()
        };
        GatewayMetrics::update_connections(count);
        debug!(connection_id = %id, "Gateway client subscribed");
        (id, rx)
    }

    /// Drops a connection. Its job bindings are kept.
    pub fn unsubscribe(&self, id: &ConnectionId) {
        let count = {
            let mut connections = self.connections.write();
            connections.remove(id);
            connections.len()
        };
        GatewayMetrics::update_connections(count);
        debug!(connection_id = %id, "Gateway client unsubscribed");
    }

    /// Returns true if the connection is live.
    pub fn is_connected(&self, id: &ConnectionId) -> bool {
        self.connections.read().contains_key(id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Routes a job's events to a connection.
    pub fn bind(&self, job_id: &JobId, connection: &ConnectionId) {
        self.bindings.write().insert(job_id.clone(), connection.clone());
    }

    /// Connection a job's events go to.
    pub fn binding(&self, job_id: &JobId) -> Option<ConnectionId> {
        self.bindings.read().get(job_id).cloned()
    }

    /// Forgets a job's binding.
    pub fn unbind(&self, job_id: &JobId) {
        self.bindings.write().remove(job_id);
    }

    /// Jobs bound to a connection.
    pub fn jobs_for(&self, connection: &ConnectionId) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = self
            .bindings
            .read()
            .iter()
            .filter(|(_, c)| *c == connection)
            .map(|(j, _)| j.clone())
            .collect();
        jobs.sort();
        jobs
    }

    /// Moves every binding of `old` to `new`. Returns the moved jobs.
    pub fn rebind(&self, old: &ConnectionId, new: &ConnectionId) -> Vec<JobId> {
        let mut moved = Vec::new();
        for (job_id, connection) in self.bindings.write().iter_mut() {
            if connection == old {
                *connection = new.clone();
                moved.push(job_id.clone());
            }
        }
        moved.sort();
        moved
    }

    /// Sends an event to one connection. Returns false if it is gone.
    pub fn send_to(&self, connection: &ConnectionId, event: ExportEvent) -> bool {
        let name = event.name();
        let delivered = match self.connections.read().get(connection) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        };
        if delivered {
            GatewayMetrics::event_sent(name);
        } else if self.connections.read().contains_key(connection) {
            self.unsubscribe(connection);
        }
        delivered
    }

    /// Sends a job event to the job's bound connection, if any.
    pub fn publish(&self, job_id: &JobId, event: ExportEvent) -> bool {
        match self.binding(job_id) {
            Some(connection) => self.send_to(&connection, event),
            None => false,
        }
    }
}
