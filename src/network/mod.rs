//! Packet transport between client and server.
//!
//! - [`PacketCodec`] frames packets on a byte stream.
//! - [`Connection`] runs the receive loop and the writer task for one stream
//!   and fans inbound packets out to its listeners.
//! - [`monitor_keep_alive`] closes connections whose peer went quiet.
//! - [`StreamUpgrader`] is the hook for running connections over a secure stream.

pub use connection::{Connection, ConnectionListener, ListenerId, PacketListener};
pub use frame::PacketCodec;
pub use keep_alive::{monitor_keep_alive, KeepAlive, LOST_CONNECTION};
pub use transport::{BoxedStream, PacketStream, StreamUpgrader, TransportKind, UpgradeFuture};

mod connection;
mod frame;
mod keep_alive;
mod transport;

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{Connection, TransportKind};

    /// Two unstarted connections talking to each other over an in-memory pipe.
    pub fn connection_pair() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Connection::new(1, Box::new(a), TransportKind::Plain, "left", 1024 * 1024),
            Connection::new(2, Box::new(b), TransportKind::Plain, "right", 1024 * 1024),
        )
    }

    /// Polls `condition` until it holds, panicking after two seconds.
    pub async fn wait_until(condition: impl Fn() -> bool) {
        let wait = async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .expect("condition not reached in time");
    }
}
