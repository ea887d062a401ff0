use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{HandshakeOutcome, PendingReply};
use crate::network::Connection;
use crate::protocol::{Packet, PacketType};
use crate::{AppError, AppResult};

pub const VERSIONS_INCOMPATIBLE: &str = "Server/Client versions are not compatible.";

enum VersionVerdict {
    Rejected,
    Accepted(i64),
}

/// Client half of the connection handshake, the mirror of
/// [`super::ServerHandshake`].
///
/// Takes an unstarted connection: the wait for the server's READY is
/// registered before the receive loop starts so it cannot be missed. On
/// failure the connection is closed without sending anything else.
pub struct ClientHandshake<'a> {
    conn: &'a Arc<Connection>,
    protocol_version: i64,
    timeout: Duration,
}

impl<'a> ClientHandshake<'a> {
    pub fn new(conn: &'a Arc<Connection>, protocol_version: i64, timeout: Duration) -> Self {
        ClientHandshake {
            conn,
            protocol_version,
            timeout,
        }
    }

    pub async fn run(&self) -> AppResult<HandshakeOutcome> {
        self.await_ready().await?;
        self.say_hello().await?;
        self.exchange_version().await?;
        self.negotiate_security().await
    }

    async fn await_ready(&self) -> AppResult<()> {
        let ready = PendingReply::expect(self.conn, &[PacketType::Ok]);
        self.conn.start()?;
        match ready.wait(self.timeout).await {
            Some(_) => Ok(()),
            None => Err(self.fail("Server never connected.")),
        }
    }

    async fn say_hello(&self) -> AppResult<()> {
        let hello = PendingReply::expect(self.conn, &[PacketType::Hello]);
        self.conn.send_packet(Packet::hello("Hello"))?;
        match hello.wait(self.timeout).await {
            Some(reply) => {
                debug!(
                    connection_id = self.conn.id(),
                    "server says {}",
                    reply.payload().as_text().unwrap_or_default()
                );
                Ok(())
            }
            None => Err(self.fail("Handshake was unsuccessful.")),
        }
    }

    // the server answers VERSION with its verdict followed by its own VERSION;
    // both are collected in one wait
    async fn exchange_version(&self) -> AppResult<()> {
        let mut accepted = false;
        let mut server_version: Option<i64> = None;
        let verdict = PendingReply::register(self.conn, move |packet: &Packet| {
            match packet.packet_type() {
                PacketType::Nok => return Some(VersionVerdict::Rejected),
                PacketType::Ok => accepted = true,
                PacketType::Version => server_version = Some(packet.payload().as_number().unwrap_or(-1)),
                _ => return None,
            }
            match (accepted, server_version) {
                (true, Some(version)) => Some(VersionVerdict::Accepted(version)),
                _ => None,
            }
        });
        self.conn.send_packet(Packet::version(self.protocol_version))?;

        match verdict.wait(self.timeout).await {
            Some(VersionVerdict::Accepted(version)) if version == self.protocol_version => Ok(()),
            Some(VersionVerdict::Accepted(version)) => {
                let _ = self.conn.send_packet(Packet::was_ok(false));
                Err(self.fail(&format!(
                    "Server version ({}) is incompatible with client version ({}).",
                    version, self.protocol_version
                )))
            }
            Some(VersionVerdict::Rejected) | None => Err(self.fail(VERSIONS_INCOMPATIBLE)),
        }
    }

    async fn negotiate_security(&self) -> AppResult<HandshakeOutcome> {
        let verdict = PendingReply::expect(self.conn, &[PacketType::Secure, PacketType::Ok]);
        self.conn.send_packet(Packet::was_ok(true))?;
        let Some(reply) = verdict.wait(self.timeout).await else {
            return Err(self.fail("Server never completed the handshake."));
        };
        if !reply.is(PacketType::Secure) {
            return Ok(HandshakeOutcome::Connected);
        }
        let port = reply
            .payload()
            .as_number()
            .and_then(|port| u16::try_from(port).ok());
        match port {
            Some(port) => {
                self.conn.close("Server requested a secure connection.");
                Ok(HandshakeOutcome::UpgradeRequired { port })
            }
            None => Err(self.fail("Server sent an invalid secure port.")),
        }
    }

    fn fail(&self, reason: &str) -> AppError {
        warn!(connection_id = self.conn.id(), "handshake failed: {}", reason);
        self.conn.close(reason);
        AppError::ConnectionFailed(reason.to_string())
    }
}
