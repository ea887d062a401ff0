use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Any duplex byte stream a [`super::Connection`] can run over: a TCP socket,
/// a TLS session wrapping one, or an in-memory pipe.
pub trait PacketStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> PacketStream for T {}

pub type BoxedStream = Box<dyn PacketStream>;

/// What kind of stream a connection runs over, fixed when it is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Plain,
    Secure,
}

impl TransportKind {
    pub fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Secure)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Plain => write!(f, "plain"),
            TransportKind::Secure => write!(f, "secure"),
        }
    }
}

pub type UpgradeFuture = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send>>;

/// Turns a freshly connected or accepted socket into a secure stream.
///
/// The server runs it on every socket accepted on the secure port, the client
/// runs it after the server answered the handshake with SECURE. No upgrader
/// installed means secure connections are unavailable.
pub trait StreamUpgrader: Send + Sync + 'static {
    fn upgrade(&self, stream: TcpStream) -> UpgradeFuture;
}
