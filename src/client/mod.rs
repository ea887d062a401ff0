//! The client side of the protocol: connect with the handshake, then talk to
//! the server with plain sends or correlated requests.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use crate::handshake::{ClientHandshake, HandshakeOutcome, PendingReply};
use crate::network::{
    monitor_keep_alive, BoxedStream, Connection, ConnectionListener, ListenerId, PacketListener,
    StreamUpgrader, TransportKind,
};
use crate::protocol::{
    ItemInfo, Packet, PacketType, Payload, RegisterUser, SearchOptions, UserInfo,
    PROTOCOL_VERSION,
};
use crate::{AppError, AppResult};

pub const SECURE_REQUIRED: &str = "Server requires a secure connection";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server's plain listener.
    pub address: String,
    pub protocol_version: i64,
    /// Bound for each handshake step and each request.
    pub timeout: Duration,
    pub ping_timeout: Duration,
    pub max_package_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            address: "127.0.0.1:4730".to_string(),
            protocol_version: PROTOCOL_VERSION,
            timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(30),
            max_package_size: 4 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    fn host(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.address)
    }
}

/// Echoes every PING straight back.
struct PingResponder {
    conn: Weak<Connection>,
}

impl PacketListener for PingResponder {
    fn packet_received(&self, packet: &Packet) {
        if !packet.is(PacketType::Ping) {
            return;
        }
        if let Some(conn) = self.conn.upgrade() {
            trace!("pong");
            let _ = conn.send_packet(Packet::ping());
        }
    }
}

/// A connected client.
#[derive(Debug)]
pub struct Client {
    conn: Arc<Connection>,
    config: ClientConfig,
}

impl Client {
    /// Connects to `config.address`. A server that requires a secure
    /// connection fails this with [`AppError::ConnectionFailed`].
    pub async fn connect(config: ClientConfig) -> AppResult<Client> {
        Client::connect_with(config, None).await
    }

    /// Connects, following a SECURE redirect through `upgrader` when given.
    pub async fn connect_with(
        config: ClientConfig,
        upgrader: Option<Arc<dyn StreamUpgrader>>,
    ) -> AppResult<Client> {
        let socket = dial(&config.address).await?;
        let peer = config.address.clone();
        let port = match Client::handshake(Box::new(socket), TransportKind::Plain, peer, &config).await? {
            (conn, HandshakeOutcome::Connected) => return Ok(Client::ready(conn, config)),
            (_, HandshakeOutcome::UpgradeRequired { port }) => port,
        };

        let Some(upgrader) = upgrader else {
            return Err(AppError::ConnectionFailed(SECURE_REQUIRED.to_string()));
        };
        let secure_address = format!("{}:{}", config.host(), port);
        info!("Server requested a secure connection, reconnecting to {}", secure_address);
        let socket = dial(&secure_address).await?;
        let stream = upgrader
            .upgrade(socket)
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("Secure upgrade failed: {}", e)))?;

        match Client::handshake(stream, TransportKind::Secure, secure_address, &config).await? {
            (conn, HandshakeOutcome::Connected) => Ok(Client::ready(conn, config)),
            (_, HandshakeOutcome::UpgradeRequired { .. }) => Err(AppError::ConnectionFailed(
                "Server asked to upgrade an already secure connection.".to_string(),
            )),
        }
    }

    /// Runs the handshake over an already open stream.
    pub async fn connect_stream(
        stream: BoxedStream,
        transport: TransportKind,
        peer: impl Into<String>,
        config: ClientConfig,
    ) -> AppResult<Client> {
        match Client::handshake(stream, transport, peer.into(), &config).await? {
            (conn, HandshakeOutcome::Connected) => Ok(Client::ready(conn, config)),
            (_, HandshakeOutcome::UpgradeRequired { .. }) => {
                Err(AppError::ConnectionFailed(SECURE_REQUIRED.to_string()))
            }
        }
    }

    async fn handshake(
        stream: BoxedStream,
        transport: TransportKind,
        peer: String,
        config: &ClientConfig,
    ) -> AppResult<(Arc<Connection>, HandshakeOutcome)> {
        let conn = Connection::new(0, stream, transport, peer, config.max_package_size);
        // the server pings right after the handshake, answer from the start
        conn.add_packet_listener(Arc::new(PingResponder {
            conn: Arc::downgrade(&conn),
        }));
        let outcome = ClientHandshake::new(&conn, config.protocol_version, config.timeout)
            .run()
            .await?;
        Ok((conn, outcome))
    }

    fn ready(conn: Arc<Connection>, config: ClientConfig) -> Client {
        monitor_keep_alive(&conn, config.ping_timeout);
        info!("Connected to {} over {}", conn.peer(), conn.transport());
        Client { conn, config }
    }

    pub fn send_packet(&self, packet: Packet) -> AppResult<()> {
        self.conn.send_packet(packet)
    }

    /// Sends `packet` and waits for the first reply of one of `expected`.
    ///
    /// The reply waiter is registered before the send, so a fast reply cannot
    /// slip past it.
    pub async fn request(&self, packet: Packet, expected: &[PacketType]) -> AppResult<Packet> {
        let packet_type = packet.packet_type();
        let reply = PendingReply::expect(&self.conn, expected);
        self.conn.send_packet(packet)?;
        match reply.wait(self.config.timeout).await {
            Some(reply) => {
                debug!("{} answered with {}", packet_type, reply.packet_type());
                Ok(reply)
            }
            None if !self.conn.is_open() => Err(AppError::ConnectionClosed(
                self.conn.close_reason().unwrap_or_default(),
            )),
            None => Err(AppError::Timeout(format!("no reply to {}", packet_type))),
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> AppResult<UserInfo> {
        let reply = self
            .request(
                Packet::with_payload(
                    PacketType::Login,
                    Payload::Credentials(vec![username.to_string(), password.to_string()]),
                ),
                &[PacketType::LoginSuccess, PacketType::LoginFail],
            )
            .await?;
        match reply.into_payload() {
            Payload::User(user) => Ok(user),
            Payload::Text(reason) => Err(AppError::OperationFailure(reason)),
            other => Err(AppError::MalformedProtocol(format!("login reply {:?}", other))),
        }
    }

    pub fn logout(&self) -> AppResult<()> {
        self.send_packet(Packet::logout())
    }

    pub async fn register(&self, registration: RegisterUser) -> AppResult<UserInfo> {
        let reply = self
            .request(
                Packet::with_payload(PacketType::Register, Payload::Registration(registration)),
                &[PacketType::RegisterSuccess, PacketType::RegisterFail],
            )
            .await?;
        match reply.into_payload() {
            Payload::User(user) => Ok(user),
            Payload::Text(reason) => Err(AppError::OperationFailure(reason)),
            other => Err(AppError::MalformedProtocol(format!("register reply {:?}", other))),
        }
    }

    pub async fn search(&self, options: SearchOptions) -> AppResult<Vec<ItemInfo>> {
        let reply = self
            .request(
                Packet::with_payload(PacketType::Search, Payload::Search(options)),
                &[PacketType::SearchResults],
            )
            .await?;
        match reply.into_payload() {
            Payload::Items(items) => Ok(items),
            Payload::Empty => Ok(Vec::new()),
            other => Err(AppError::MalformedProtocol(format!("search reply {:?}", other))),
        }
    }

    pub fn add_packet_listener(&self, listener: Arc<dyn PacketListener>) -> ListenerId {
        self.conn.add_packet_listener(listener)
    }

    pub fn remove_packet_listener(&self, id: ListenerId) -> bool {
        self.conn.remove_packet_listener(id)
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        self.conn.add_connection_listener(listener)
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_open()
    }

    pub fn is_secure(&self) -> bool {
        self.conn.is_secure()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.conn.close_reason()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Says goodbye with a DISCONNECT and closes. Safe to call twice.
    pub fn shutdown(&self) {
        self.conn.shutdown();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.conn.shutdown();
    }
}

async fn dial(address: &str) -> AppResult<TcpStream> {
    TcpStream::connect(address)
        .await
        .map_err(|e| AppError::ConnectionFailed(format!("Could not connect to {}: {}", address, e)))
}
