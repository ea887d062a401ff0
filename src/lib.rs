pub mod client;
pub mod handshake;
pub mod network;
pub mod protocol;
pub mod request;
pub mod service;
pub mod store;
pub mod utils;

pub use client::{Client, ClientConfig};
pub use network::{Connection, ConnectionListener, PacketListener, StreamUpgrader, TransportKind};
pub use protocol::{Packet, PacketType, Payload, PROTOCOL_VERSION};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, BiddrConfig, ClientConnection,
    Daemon, Server, Shutdown,
};
pub use store::{AuctionStore, MemoryStore};
