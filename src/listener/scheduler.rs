//! Poll scheduler: exactly one listener per room with an inbound account.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{DatabaseError, MailError};
use crate::listener::mail_listener::{ListenerDeps, ListenerHandle, ListenerStatus, spawn_listener};
use crate::store::RoomInbound;

/// Owns the listener registry, keyed by room.
pub struct PollScheduler {
    deps: ListenerDeps,
    listeners: RwLock<HashMap<String, ListenerHandle>>,
}

impl PollScheduler {
    pub fn new(deps: ListenerDeps) -> Self {
        Self {
            deps,
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Start a listener for every persisted inbound account.
    ///
    /// An error here means the account list could not be read; callers treat
    /// it as fatal.
    pub async fn bootstrap(&self) -> Result<usize, DatabaseError> {
        let accounts = self.deps.store.list_inbound_accounts().await?;
        let count = accounts.len();
        for entry in accounts {
            self.start(entry, false).await;
        }
        info!(count, "Started mail listeners");
        Ok(count)
    }

    /// Start a listener for the room, replacing any running one.
    pub async fn start(&self, entry: RoomInbound, silent: bool) {
        let room = entry.room.key.clone();
        let handle = spawn_listener(entry, silent, self.deps.clone());
        let previous = self.listeners.write().await.insert(room.clone(), handle);
        if let Some(previous) = previous {
            previous.cancel();
            debug!(room = %room, "Replaced running listener");
        }
    }

    /// Stop the room's listener. Returns false if none was running.
    pub async fn stop(&self, room: &str) -> bool {
        match self.listeners.write().await.remove(room) {
            Some(handle) => {
                handle.cancel();
                debug!(room, "Listener stopped");
                true
            }
            None => false,
        }
    }

    pub async fn status(&self, room: &str) -> Option<ListenerStatus> {
        self.listeners.read().await.get(room).map(ListenerHandle::status)
    }

    /// Rooms with a registered listener, sorted.
    pub async fn active_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.listeners.read().await.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// List the mailboxes of the room's account over its live connection.
    pub async fn list_mailboxes(&self, room: &str) -> Result<Vec<String>, MailError> {
        let listeners = self.listeners.read().await;
        let handle = listeners
            .get(room)
            .ok_or_else(|| MailError::Protocol("no mail listener for this room".into()))?;
        handle.list_mailboxes().await
    }

    /// Stop every listener.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, ListenerHandle)> =
            self.listeners.write().await.drain().collect();
        for (_, handle) in &drained {
            handle.cancel();
        }
        info!(count = drained.len(), "Mail listeners shut down");
    }
}
