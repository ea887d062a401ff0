use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::connection::{Connection, ListenerId, PacketListener};
use crate::protocol::Packet;

pub const LOST_CONNECTION: &str = "Lost connection to peer.";

/// Tracks when the peer last sent anything. Any packet counts as a sign of
/// life, not just PING.
#[derive(Debug)]
pub struct KeepAlive {
    last_seen: Mutex<Instant>,
}

impl KeepAlive {
    fn new() -> Self {
        KeepAlive {
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }
}

impl PacketListener for KeepAlive {
    fn packet_received(&self, _packet: &Packet) {
        *self.last_seen.lock() = Instant::now();
    }
}

/// Closes `conn` once it has been silent for `timeout`.
///
/// Registers a listener that refreshes the deadline on every inbound packet
/// and spawns the task that watches it. The task ends with the connection.
pub fn monitor_keep_alive(conn: &Arc<Connection>, timeout: Duration) -> ListenerId {
    let keep_alive = Arc::new(KeepAlive::new());
    let listener_id = conn.add_packet_listener(keep_alive.clone());
    let weak = Arc::downgrade(conn);
    let closed = conn.close_token();
    let connection_id = conn.id();

    tokio::spawn(async move {
        watch(weak, keep_alive, timeout, closed).await;
        debug!(connection_id, "keep-alive monitor exited");
    });
    listener_id
}

async fn watch(
    conn: Weak<Connection>,
    keep_alive: Arc<KeepAlive>,
    timeout: Duration,
    closed: tokio_util::sync::CancellationToken,
) {
    loop {
        let deadline = keep_alive.last_seen() + timeout;
        tokio::select! {
            _ = closed.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }
        if keep_alive.last_seen().elapsed() < timeout {
            continue;
        }
        if let Some(conn) = conn.upgrade() {
            warn!(
                connection_id = conn.id(),
                "no packet from {} for {:?}", conn.peer(), timeout
            );
            conn.close(LOST_CONNECTION);
        }
        return;
    }
}
