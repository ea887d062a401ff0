//! The scripted connection handshake.
//!
//! ```text
//! server                      client
//!   OK (ready)        ->
//!                     <-      HELLO
//!   HELLO             ->
//!                     <-      VERSION
//!   OK | NOK, VERSION ->
//!                     <-      OK
//!   OK | SECURE(port) ->
//! ```
//!
//! Each arrow the local side waits on is a [`PendingReply`] registered before
//! the packet that provokes it goes out, bounded by the handshake timeout.

pub use client::{ClientHandshake, VERSIONS_INCOMPATIBLE};
pub use notification_waiter::NotificationWaiter;
pub use reply_waiter::{PendingReply, ReplyWaiter};
pub use server::ServerHandshake;

mod client;
mod notification_waiter;
mod reply_waiter;
mod server;

/// How a successful handshake ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Connected,
    /// The server only talks over a secure stream on `port`; this connection
    /// has been closed.
    UpgradeRequired { port: u16 },
}
