use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{HandshakeOutcome, PendingReply};
use crate::network::Connection;
use crate::protocol::{Packet, PacketType};
use crate::service::BiddrConfig;
use crate::{AppError, AppResult};

/// Server half of the connection handshake.
///
/// The connection must already be started. Every step registers its waiter
/// before sending the packet that provokes the reply and waits at most
/// `handshake.timeout_ms`. Any failure tells the client why with a DISCONNECT
/// and closes the connection.
pub struct ServerHandshake<'a> {
    conn: &'a Arc<Connection>,
    config: &'a BiddrConfig,
    secure_available: bool,
}

impl<'a> ServerHandshake<'a> {
    /// `secure_available` says whether this server can accept connections on
    /// the secure port at all.
    pub fn new(conn: &'a Arc<Connection>, config: &'a BiddrConfig, secure_available: bool) -> Self {
        ServerHandshake {
            conn,
            config,
            secure_available,
        }
    }

    pub async fn run(&self) -> AppResult<HandshakeOutcome> {
        self.until_ready().await?;
        self.negotiate_security()
    }

    /// Everything up to the client's final OK. The client is still waiting
    /// for [`ServerHandshake::negotiate_security`] afterwards.
    pub async fn until_ready(&self) -> AppResult<()> {
        self.await_hello().await?;
        let version = self.say_hello().await?;
        self.check_version(version)?;
        self.await_client_ready().await
    }

    // READY: tell the client we are here, then expect its HELLO
    async fn await_hello(&self) -> AppResult<()> {
        let hello = PendingReply::expect(self.conn, &[PacketType::Hello]);
        self.conn.send_packet(Packet::was_ok(true))?;
        match hello.wait(self.config.handshake_timeout()).await {
            Some(_) => Ok(()),
            None => Err(self.fail("Client failed to send hello.")),
        }
    }

    async fn say_hello(&self) -> AppResult<i64> {
        let version = PendingReply::register(self.conn, |packet: &Packet| {
            packet
                .is(PacketType::Version)
                .then(|| packet.payload().as_number())
        });
        self.conn.send_packet(Packet::hello(self.config.random_greeting()))?;
        match version.wait(self.config.handshake_timeout()).await {
            Some(Some(version)) => Ok(version),
            // a VERSION without a number is as good as a wrong one
            Some(None) => Ok(-1),
            None => Err(self.fail("Client failed to respond to hello and send version.")),
        }
    }

    fn check_version(&self, client_version: i64) -> AppResult<()> {
        let server_version = self.config.general.protocol_version;
        if client_version == server_version {
            return Ok(());
        }
        // best effort, the client may already be gone
        let _ = self.conn.send_packet(Packet::was_ok(false));
        Err(self.fail(&format!(
            "Client version ({}) is incompatible with server version ({}).",
            client_version, server_version
        )))
    }

    async fn await_client_ready(&self) -> AppResult<()> {
        let ready = PendingReply::expect(self.conn, &[PacketType::Ok]);
        self.conn.send_packet(Packet::was_ok(true))?;
        self.conn
            .send_packet(Packet::version(self.config.general.protocol_version))?;
        match ready.wait(self.config.handshake_timeout()).await {
            Some(_) => Ok(()),
            None => Err(self.fail("Client never got ready.")),
        }
    }

    /// Sends the closing OK, or SECURE and closes when the client must move
    /// to the secure port.
    pub fn negotiate_security(&self) -> AppResult<HandshakeOutcome> {
        if !self.config.secure.enable || self.conn.is_secure() {
            self.conn.send_packet(Packet::was_ok(true))?;
            info!(connection_id = self.conn.id(), peer = self.conn.peer(), "handshake complete");
            return Ok(HandshakeOutcome::Connected);
        }
        if !self.secure_available {
            warn!(
                connection_id = self.conn.id(),
                "secure listening is enabled but no upgrader is installed, accepting plain connection"
            );
            self.conn.send_packet(Packet::was_ok(true))?;
            return Ok(HandshakeOutcome::Connected);
        }

        let port = self.config.secure.port;
        self.conn.send_packet(Packet::secure(port))?;
        // no DISCONNECT: SECURE already tells the client what to do next
        self.conn.close("Client redirected to secure port.");
        debug!(connection_id = self.conn.id(), port, "client redirected to secure port");
        Ok(HandshakeOutcome::UpgradeRequired { port })
    }

    fn fail(&self, reason: &str) -> AppError {
        warn!(connection_id = self.conn.id(), peer = self.conn.peer(), "handshake failed: {}", reason);
        self.conn.shutdown_with_reason(reason);
        AppError::ConnectionFailed(reason.to_string())
    }
}
