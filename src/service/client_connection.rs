use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::network::Connection;
use crate::protocol::{Packet, UserInfo};
use crate::AppResult;

/// Server side view of one connected client.
pub struct ClientConnection {
    conn: Arc<Connection>,
    user: RwLock<Option<UserInfo>>,
    connected: AtomicBool,
}

impl ClientConnection {
    pub fn new(conn: Arc<Connection>) -> Self {
        ClientConnection {
            conn,
            user: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn send_packet(&self, packet: Packet) -> AppResult<()> {
        self.conn.send_packet(packet)
    }

    /// The user logged in on this connection, if any.
    pub fn user(&self) -> Option<UserInfo> {
        self.user.read().clone()
    }

    pub fn set_user(&self, user: Option<UserInfo>) {
        *self.user.write() = user;
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.read().is_some()
    }

    pub fn is_secure(&self) -> bool {
        self.conn.is_secure()
    }

    /// Set once the handshake has completed, cleared when the connection closes.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.conn.is_open()
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn shutdown_with_reason(&self, reason: &str) {
        self.conn.shutdown_with_reason(reason);
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id())
            .field("peer", &self.conn.peer())
            .field("user", &self.user.read().as_ref().map(|u| u.username.clone()))
            .field("secure", &self.is_secure())
            .finish()
    }
}

/// Live client connections, keyed by connection id.
///
/// Filled by the accept path once a handshake succeeds and emptied by each
/// connection's close listener.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<u64, Arc<ClientConnection>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        ClientRegistry::default()
    }

    pub fn insert(&self, client: Arc<ClientConnection>) {
        self.clients.insert(client.id(), client);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<ClientConnection>> {
        self.clients.remove(&id).map(|(_, client)| client)
    }

    pub fn get(&self, id: u64) -> Option<Arc<ClientConnection>> {
        self.clients.get(&id).map(|client| client.clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Copy of the current clients, so callers never hold a shard lock while
    /// sending.
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Connections `user_id` is logged in on.
    pub fn find_user(&self, user_id: Uuid) -> Vec<Arc<ClientConnection>> {
        self.snapshot()
            .into_iter()
            .filter(|client| client.user().is_some_and(|user| user.user_id == user_id))
            .collect()
    }

    /// Sends `packet` to every live client, or only to logged in ones.
    /// Returns how many clients it was queued for.
    pub fn broadcast_packet(&self, packet: &Packet, only_authenticated: bool) -> usize {
        let mut sent = 0;
        for client in self.snapshot() {
            if only_authenticated && !client.is_authenticated() {
                continue;
            }
            // a client closing concurrently just misses the broadcast
            match client.send_packet(packet.clone()) {
                Ok(()) => sent += 1,
                Err(e) => debug!(client_id = client.id(), "broadcast skipped: {}", e),
            }
        }
        trace!("Broadcast {} to {} clients", packet.packet_type(), sent);
        sent
    }
}
