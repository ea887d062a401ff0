use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::SinkExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::transport::{BoxedStream, TransportKind};
use super::PacketCodec;
use crate::protocol::{Packet, PacketType};
use crate::{AppError, AppResult};

/// Receives every packet that arrives on a [`Connection`].
///
/// Called on the connection's receive loop, in registration order. Must not
/// block: anything slow belongs on the worker pool.
pub trait PacketListener: Send + Sync {
    fn packet_received(&self, packet: &Packet);
}

impl<F> PacketListener for F
where
    F: Fn(&Packet) + Send + Sync,
{
    fn packet_received(&self, packet: &Packet) {
        self(packet)
    }
}

/// Told once when a [`Connection`] closes, whatever the cause.
pub trait ConnectionListener: Send + Sync {
    fn connection_closed(&self, reason: &str);
}

impl<F> ConnectionListener for F
where
    F: Fn(&str) + Send + Sync,
{
    fn connection_closed(&self, reason: &str) {
        self(reason)
    }
}

/// Handle returned when registering a listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Halves {
    reader: FramedRead<ReadHalf<BoxedStream>, PacketCodec>,
    writer: FramedWrite<WriteHalf<BoxedStream>, PacketCodec>,
    outbound_rx: mpsc::UnboundedReceiver<Packet>,
}

/// A framed, bidirectional packet channel over one byte stream.
///
/// Reading and writing run on two separate tasks over the two halves of the
/// stream, so a slow write never holds up delivery of inbound packets and the
/// other way round. Outbound packets go through an unbounded queue: sending
/// never blocks and packets leave in the order they were queued.
///
/// Closing is idempotent. Whatever closes the channel first (explicit
/// shutdown, read failure, DISCONNECT from the peer, keep-alive expiry) wins,
/// and the connection listeners hear about it exactly once.
pub struct Connection {
    id: u64,
    peer: String,
    transport: TransportKind,
    halves: Mutex<Option<Halves>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    packet_listeners: RwLock<Vec<(ListenerId, Arc<dyn PacketListener>)>>,
    connection_listeners: RwLock<Vec<(ListenerId, Arc<dyn ConnectionListener>)>>,
    next_listener_id: AtomicU64,
    open: AtomicBool,
    closed: CancellationToken,
    close_reason: Mutex<Option<String>>,
}

impl Connection {
    /// Wraps `stream`. Nothing is read until [`Connection::start`] is called,
    /// which leaves room to register listeners for the very first packet.
    pub fn new(
        id: u64,
        stream: BoxedStream,
        transport: TransportKind,
        peer: impl Into<String>,
        max_frame_length: usize,
    ) -> Arc<Connection> {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Connection {
            id,
            peer: peer.into(),
            transport,
            halves: Mutex::new(Some(Halves {
                reader: FramedRead::new(read_half, PacketCodec::new(max_frame_length)),
                writer: FramedWrite::new(write_half, PacketCodec::new(max_frame_length)),
                outbound_rx,
            })),
            outbound: Mutex::new(Some(outbound_tx)),
            packet_listeners: RwLock::new(Vec::new()),
            connection_listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
        })
    }

    /// Spawns the receive loop and the writer task. Only the first call does
    /// anything; a second one is an error.
    pub fn start(self: &Arc<Self>) -> AppResult<()> {
        let halves = self.halves.lock().take().ok_or_else(|| {
            AppError::IllegalStateError(format!("connection {} already started", self.id))
        })?;

        let writer_conn = self.clone();
        tokio::spawn(async move {
            writer_conn
                .write_loop(halves.writer, halves.outbound_rx)
                .await
        });

        let reader_conn = self.clone();
        tokio::spawn(async move { reader_conn.receive_loop(halves.reader).await });

        debug!(connection_id = self.id, peer = %self.peer, "connection started");
        Ok(())
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut reader: FramedRead<ReadHalf<BoxedStream>, PacketCodec>,
    ) {
        let closed = self.closed.clone();
        loop {
            let next = tokio::select! {
                next = reader.next() => next,
                _ = closed.cancelled() => break,
            };

            match next {
                Some(Ok(packet)) => {
                    trace!(connection_id = self.id, "Received packet. Type: {}", packet.packet_type());
                    self.dispatch(&packet);
                    if packet.is(PacketType::Disconnect) {
                        let reason = packet
                            .payload()
                            .as_text()
                            .unwrap_or("Peer disconnected.")
                            .to_string();
                        self.close(&reason);
                        break;
                    }
                }
                Some(Err(AppError::MalformedProtocol(e))) => {
                    warn!(connection_id = self.id, "Malformed packet from {}: {}", self.peer, e);
                    self.close(&format!("Protocol version mismatch: {}", e));
                    break;
                }
                Some(Err(e)) => {
                    self.close(&format!("Connection lost: {}", e));
                    break;
                }
                None => {
                    self.close("Connection closed by peer.");
                    break;
                }
            }
        }
        debug!(connection_id = self.id, "receive loop exited");
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: FramedWrite<WriteHalf<BoxedStream>, PacketCodec>,
        mut outbound_rx: mpsc::UnboundedReceiver<Packet>,
    ) {
        // the queue ends once the connection closes and drops its sender;
        // anything already queued (e.g. a DISCONNECT) is still written first
        while let Some(packet) = outbound_rx.recv().await {
            let packet_type = packet.packet_type();
            if let Err(e) = writer.send(packet).await {
                error!(
                    connection_id = self.id,
                    "Failed to send packet. Type: {} Reason: {}", packet_type, e
                );
                self.close(&format!("Failed to send packet: {}", e));
                return;
            }
            trace!(connection_id = self.id, "Sent packet. Type: {}", packet_type);
        }
        if let Err(e) = writer.close().await {
            debug!(connection_id = self.id, "error closing write half: {}", e);
        }
        debug!(connection_id = self.id, "writer exited");
    }

    fn dispatch(&self, packet: &Packet) {
        // snapshot so listeners may add or remove listeners from inside the callback
        let listeners: Vec<Arc<dyn PacketListener>> = self
            .packet_listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.packet_received(packet);
        }
    }

    /// Queues `packet` for sending. Fails only when the connection is closed;
    /// a write error later on closes the connection instead.
    pub fn send_packet(&self, packet: Packet) -> AppResult<()> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(AppError::PacketSendFailed(format!(
                "{} on closed connection {}",
                packet.packet_type(),
                self.id
            )));
        };
        tx.send(packet).map_err(|e| {
            AppError::PacketSendFailed(format!(
                "{} on closed connection {}",
                e.0.packet_type(),
                self.id
            ))
        })
    }

    pub fn add_packet_listener(&self, listener: Arc<dyn PacketListener>) -> ListenerId {
        let id = self.next_listener_id();
        self.packet_listeners.write().push((id, listener));
        id
    }

    pub fn remove_packet_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.packet_listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        before != listeners.len()
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        let id = self.next_listener_id();
        self.connection_listeners.write().push((id, listener));
        id
    }

    pub fn remove_connection_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.connection_listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        before != listeners.len()
    }

    pub fn packet_listener_count(&self) -> usize {
        self.packet_listeners.read().len()
    }

    fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Closes the connection, telling the peer with a DISCONNECT first.
    pub fn shutdown(&self) {
        self.shutdown_with_reason("Connection closed.");
    }

    /// Like [`Connection::shutdown`], with `reason` in the DISCONNECT packet.
    pub fn shutdown_with_reason(&self, reason: &str) -> bool {
        self.close_inner(reason, true)
    }

    /// Closes the connection without telling the peer. Used when the peer is
    /// already gone or has just said goodbye itself.
    pub fn close(&self, reason: &str) -> bool {
        self.close_inner(reason, false)
    }

    fn close_inner(&self, reason: &str, notify_peer: bool) -> bool {
        if !self.open.swap(false, Ordering::SeqCst) {
            return false;
        }
        *self.close_reason.lock() = Some(reason.to_string());

        if let Some(tx) = self.outbound.lock().take() {
            if notify_peer {
                // best effort, the writer may already be gone
                let _ = tx.send(Packet::disconnect(reason));
            }
        }
        // never started: dropping the halves closes the stream
        self.halves.lock().take();
        self.closed.cancel();

        info!(connection_id = self.id, peer = %self.peer, "connection closed: {}", reason);
        self.fire_connection_closed(reason);
        true
    }

    fn fire_connection_closed(&self, reason: &str) {
        let listeners: Vec<Arc<dyn ConnectionListener>> = self
            .connection_listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.connection_closed(reason);
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// Token cancelled when the connection closes; lets monitors stop with it.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("transport", &self.transport)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!(connection_id = self.id, "connection dropped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use bytes::BufMut;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::network::test_util::{connection_pair, wait_until};

    #[derive(Default)]
    struct Recorder {
        packets: Mutex<Vec<(usize, PacketType)>>,
    }

    struct Tagged {
        tag: usize,
        recorder: Arc<Recorder>,
    }

    impl PacketListener for Tagged {
        fn packet_received(&self, packet: &Packet) {
            self.recorder
                .packets
                .lock()
                .push((self.tag, packet.packet_type()));
        }
    }

    fn closed_counter(conn: &Connection) -> Arc<AtomicUsize> {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        conn.add_connection_listener(Arc::new(move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        fired
    }

    #[tokio::test]
    async fn delivers_in_order_to_listeners_in_registration_order() {
        let (left, right) = connection_pair();
        let recorder = Arc::new(Recorder::default());
        for tag in 0..2 {
            right.add_packet_listener(Arc::new(Tagged {
                tag,
                recorder: recorder.clone(),
            }));
        }
        left.start().unwrap();
        right.start().unwrap();

        left.send_packet(Packet::hello("hi")).unwrap();
        left.send_packet(Packet::version(1)).unwrap();

        wait_until(|| recorder.packets.lock().len() == 4).await;
        assert_eq!(
            *recorder.packets.lock(),
            vec![
                (0, PacketType::Hello),
                (1, PacketType::Hello),
                (0, PacketType::Version),
                (1, PacketType::Version),
            ]
        );
    }

    #[tokio::test]
    async fn listener_can_remove_itself_while_being_called() {
        let (left, right) = connection_pair();
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let conn = right.clone();
        let own_id = slot.clone();
        let counter = calls.clone();
        let id = right.add_packet_listener(Arc::new(move |_: &Packet| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *own_id.lock() {
                conn.remove_packet_listener(id);
            }
        }));
        *slot.lock() = Some(id);

        left.start().unwrap();
        right.start().unwrap();
        left.send_packet(Packet::ping()).unwrap();
        left.send_packet(Packet::ping()).unwrap();

        wait_until(|| right.packet_listener_count() == 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_fires_once() {
        let (left, right) = connection_pair();
        let fired = closed_counter(&left);
        left.start().unwrap();
        right.start().unwrap();

        assert!(left.shutdown_with_reason("bye"));
        assert!(!left.shutdown_with_reason("bye again"));
        left.shutdown();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!left.is_open());
        assert_eq!(left.close_reason().as_deref(), Some("bye"));
    }

    #[tokio::test]
    async fn shutdown_sends_disconnect_to_the_peer() {
        let (left, right) = connection_pair();
        let reasons = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = reasons.clone();
        right.add_connection_listener(Arc::new(move |reason: &str| {
            sink.lock().push(reason.to_string());
        }));
        left.start().unwrap();
        right.start().unwrap();

        left.shutdown_with_reason("Server shutting down.");

        wait_until(|| !right.is_open()).await;
        assert_eq!(*reasons.lock(), vec!["Server shutting down.".to_string()]);
    }

    #[tokio::test]
    async fn peer_going_away_closes_once() {
        let (left, right) = connection_pair();
        let fired = closed_counter(&right);
        left.start().unwrap();
        right.start().unwrap();

        left.close("gone");
        wait_until(|| !right.is_open()).await;
        right.shutdown();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (left, _right) = connection_pair();
        left.close("done");
        let err = left.send_packet(Packet::ping()).unwrap_err();
        assert!(matches!(err, AppError::PacketSendFailed(_)));
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let (left, _right) = connection_pair();
        left.start().unwrap();
        assert!(left.start().is_err());
    }

    #[tokio::test]
    async fn malformed_frame_is_a_version_mismatch() {
        let (mut raw, other) = tokio::io::duplex(1024);
        let conn = Connection::new(9, Box::new(other), TransportKind::Plain, "raw", 1024);
        conn.start().unwrap();

        let body = b"\x00\x01\x02 not json";
        let mut frame = bytes::BytesMut::new();
        frame.put_u32(body.len() as u32);
        frame.put_slice(body);
        raw.write_all(&frame).await.unwrap();

        wait_until(|| !conn.is_open()).await;
        assert!(conn
            .close_reason()
            .unwrap()
            .starts_with("Protocol version mismatch"));
    }
}
