use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use super::{BiddrConfig, ClientConnection, ClientRegistry, Shutdown};
use crate::handshake::{HandshakeOutcome, ServerHandshake};
use crate::network::{monitor_keep_alive, BoxedStream, Connection, StreamUpgrader, TransportKind};
use crate::protocol::Packet;
use crate::request::{PacketHandler, Task, TaskContext};
use crate::store::AuctionStore;
use crate::utils::{WorkerPool, WorkerPoolConfig};
use crate::{AppError, AppResult};

pub const SERVER_SHUTTING_DOWN: &str = "Server shutting down.";

/// The auction server: accepts connections, runs the handshake on each of
/// them and hands the survivors to the worker pool.
///
/// Cheap to clone; clones share the registry, the pool and the id counter.
#[derive(Clone)]
pub struct Server {
    config: Arc<BiddrConfig>,
    registry: Arc<ClientRegistry>,
    pool: Arc<WorkerPool<Task>>,
    next_connection_id: Arc<AtomicU64>,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    upgrader: Option<Arc<dyn StreamUpgrader>>,
    is_shut_down: Arc<AtomicBool>,
}

impl Server {
    pub fn new(
        config: Arc<BiddrConfig>,
        store: Arc<dyn AuctionStore>,
        notify_shutdown: broadcast::Sender<()>,
    ) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let pool_registry = registry.clone();
        let pool_config = config.clone();
        let pool = WorkerPool::new(
            WorkerPoolConfig::from(&config.worker_pool),
            notify_shutdown.clone(),
            move |queue| TaskContext {
                store,
                registry: pool_registry,
                queue,
                config: pool_config,
            },
        );

        Server {
            limit_connections: Arc::new(Semaphore::new(config.network.max_connection.max(1))),
            config,
            registry,
            pool: Arc::new(pool),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            notify_shutdown,
            upgrader: None,
            is_shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Installs the hook that wraps sockets accepted on the secure port.
    pub fn with_upgrader(mut self, upgrader: Arc<dyn StreamUpgrader>) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    pub fn config(&self) -> &Arc<BiddrConfig> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    pub fn secure_available(&self) -> bool {
        self.config.secure.enable && self.upgrader.is_some()
    }

    /// Runs the handshake on `stream` and, when it succeeds, registers the
    /// client and starts serving its requests.
    ///
    /// A client redirected to the secure port is not registered; that ends
    /// with [`AppError::ConnectionClosed`].
    pub async fn accept_and_handshake(
        &self,
        stream: BoxedStream,
        transport: TransportKind,
        peer: String,
    ) -> AppResult<Arc<ClientConnection>> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(
            connection_id,
            stream,
            transport,
            peer,
            self.config.network.max_package_size,
        );
        conn.start()?;

        let handshake = ServerHandshake::new(&conn, &self.config, self.upgrader.is_some());
        handshake.until_ready().await?;

        let client = Arc::new(ClientConnection::new(conn.clone()));
        client.set_connected(true);

        // removal is wired up before the client becomes visible
        let registry = self.registry.clone();
        let weak_client = Arc::downgrade(&client);
        conn.add_connection_listener(Arc::new(move |reason: &str| {
            if let Some(client) = weak_client.upgrade() {
                client.set_connected(false);
            }
            registry.remove(connection_id);
            info!("Client #{} disconnected: {}", connection_id, reason);
        }));
        self.registry.insert(client.clone());
        if !conn.is_open() {
            self.registry.remove(connection_id);
            return Err(AppError::ConnectionClosed(format!(
                "client #{} left during registration",
                connection_id
            )));
        }

        // the client may send requests as soon as it reads the final OK
        conn.add_packet_listener(Arc::new(PacketHandler::new(
            &client,
            self.pool.queue(),
            self.config.clone(),
        )));
        monitor_keep_alive(&conn, self.config.ping_timeout());

        // a redirect closes the connection, and the close listener unregisters it
        if let HandshakeOutcome::UpgradeRequired { port } = handshake.negotiate_security()? {
            return Err(AppError::ConnectionClosed(format!(
                "client #{} redirected to secure port {}",
                connection_id, port
            )));
        }
        conn.send_packet(Packet::ping())?;

        info!(
            "Client #{} connected from {} over {}",
            connection_id,
            conn.peer(),
            conn.transport()
        );
        Ok(client)
    }

    /// Sends `packet` to every live client, or only to logged in ones.
    pub fn broadcast_packet(&self, packet: &Packet, only_authenticated: bool) -> usize {
        self.registry.broadcast_packet(packet, only_authenticated)
    }

    /// Accepts plain connections on `listener` until shutdown.
    pub async fn run(&self, listener: TcpListener) -> AppResult<()> {
        self.accept_loop(listener, TransportKind::Plain).await
    }

    /// Accepts connections on the secure port, upgrading each socket before
    /// the handshake.
    pub async fn run_secure(&self, listener: TcpListener) -> AppResult<()> {
        if self.upgrader.is_none() {
            return Err(AppError::IllegalStateError(
                "secure listener started without an upgrader".to_string(),
            ));
        }
        self.accept_loop(listener, TransportKind::Secure).await
    }

    async fn accept_loop(&self, listener: TcpListener, transport: TransportKind) -> AppResult<()> {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::IllegalStateError(format!("connection limiter closed: {}", e)))?;

            let (socket, peer) = tokio::select! {
                res = Self::accept(&listener) => res?,
                _ = shutdown.recv() => {
                    debug!("{} accept loop exit after recv shutdown signal", transport);
                    return Ok(());
                }
            };
            debug!("accepted {} connection from {}", transport, peer);

            let server = self.clone();
            tokio::spawn(async move {
                let stream = match server.open_stream(socket, transport).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Failed to set up stream for {}: {}", peer, e);
                        return;
                    }
                };
                match server.accept_and_handshake(stream, transport, peer.clone()).await {
                    Ok(client) => {
                        // hold the permit for as long as the client stays connected
                        client.connection().close_token().cancelled().await;
                    }
                    Err(AppError::ConnectionClosed(reason)) => debug!("{}", reason),
                    Err(e) => warn!("Client from {} failed to connect: {}", peer, e),
                }
                drop(permit);
            });
        }
    }

    async fn open_stream(&self, socket: TcpStream, transport: TransportKind) -> AppResult<BoxedStream> {
        match (&self.upgrader, transport) {
            (Some(upgrader), TransportKind::Secure) => Ok(upgrader.upgrade(socket).await?),
            _ => Ok(Box::new(socket)),
        }
    }

    async fn accept(listener: &TcpListener) -> AppResult<(TcpStream, String)> {
        let mut backoff = 1;

        loop {
            match listener.accept().await {
                Ok((socket, addr)) => return Ok((socket, addr.to_string())),
                Err(err) => {
                    if backoff > 64 {
                        error!("accept tcp server error: {}", err);
                        return Err(err.into());
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }

    /// Tells every client the server is going away, then stops the pool.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.is_shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let clients = self.registry.snapshot();
        info!("Shutting down, disconnecting {} clients", clients.len());
        for client in clients {
            client.shutdown_with_reason(SERVER_SHUTTING_DOWN);
        }
        self.pool.close();
        // no receivers left is fine
        let _ = self.notify_shutdown.send(());
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("clients", &self.registry.len())
            .field("secure_available", &self.secure_available())
            .finish()
    }
}
