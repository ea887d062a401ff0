use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::NotificationWaiter;
use crate::network::{Connection, ListenerId, PacketListener};
use crate::protocol::{Packet, PacketType};

type Matcher<T> = Box<dyn FnMut(&Packet) -> Option<T> + Send>;

/// Packet listener that captures the first packet its matcher accepts and
/// notifies whoever is waiting for it.
///
/// The matcher may keep state across packets, e.g. to collect two packets and
/// only answer once both are in.
pub struct ReplyWaiter<T> {
    waiter: NotificationWaiter,
    matcher: Mutex<Matcher<T>>,
    reply: Mutex<Option<T>>,
}

impl<T: Send + 'static> ReplyWaiter<T> {
    pub fn new(matcher: impl FnMut(&Packet) -> Option<T> + Send + 'static) -> Self {
        ReplyWaiter {
            waiter: NotificationWaiter::new(),
            matcher: Mutex::new(Box::new(matcher)),
            reply: Mutex::new(None),
        }
    }

    fn has_reply(&self) -> bool {
        self.reply.lock().is_some()
    }

    fn take_reply(&self) -> Option<T> {
        self.reply.lock().take()
    }
}

impl<T: Send + 'static> PacketListener for ReplyWaiter<T> {
    fn packet_received(&self, packet: &Packet) {
        let mut reply = self.reply.lock();
        if reply.is_some() {
            return;
        }
        let matched = (self.matcher.lock())(packet);
        if matched.is_some() {
            *reply = matched;
            drop(reply);
            self.waiter.notify();
        }
    }
}

/// A reply waiter registered on a connection.
///
/// Register it before sending the packet that provokes the reply; dropping it
/// removes the listener so it never fires on later packets.
pub struct PendingReply<T: Send + 'static> {
    conn: Arc<Connection>,
    listener_id: ListenerId,
    waiter: Arc<ReplyWaiter<T>>,
}

impl<T: Send + 'static> PendingReply<T> {
    pub fn register(
        conn: &Arc<Connection>,
        matcher: impl FnMut(&Packet) -> Option<T> + Send + 'static,
    ) -> Self {
        let waiter = Arc::new(ReplyWaiter::new(matcher));
        let listener_id = conn.add_packet_listener(waiter.clone());
        PendingReply {
            conn: conn.clone(),
            listener_id,
            waiter,
        }
    }

    /// Waits for the reply. `None` when it did not arrive within `timeout` or
    /// the connection closed first.
    pub async fn wait(self, timeout: Duration) -> Option<T> {
        let closed = self.conn.close_token();
        let waiter = &self.waiter;
        tokio::select! {
            _ = waiter.waiter.wait_for_reply_or(timeout, || waiter.has_reply()) => {}
            _ = closed.cancelled() => {}
        }
        // a reply that raced the close still counts
        self.waiter.take_reply()
    }
}

impl PendingReply<Packet> {
    /// Waits for the first packet of any of `types`.
    pub fn expect(conn: &Arc<Connection>, types: &[PacketType]) -> Self {
        let types = types.to_vec();
        PendingReply::register(conn, move |packet: &Packet| {
            types
                .contains(&packet.packet_type())
                .then(|| packet.clone())
        })
    }
}

impl<T: Send + 'static> Drop for PendingReply<T> {
    fn drop(&mut self) {
        self.conn.remove_packet_listener(self.listener_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_util::connection_pair;

    #[tokio::test]
    async fn captures_first_matching_packet() {
        let (left, right) = connection_pair();
        left.start().unwrap();
        right.start().unwrap();

        let pending = PendingReply::expect(&right, &[PacketType::Version]);
        left.send_packet(Packet::hello("hi")).unwrap();
        left.send_packet(Packet::version(7)).unwrap();
        left.send_packet(Packet::version(8)).unwrap();

        let reply = pending.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply.payload().as_number(), Some(7));
        assert_eq!(right.packet_listener_count(), 0);
    }

    #[tokio::test]
    async fn reply_before_wait_is_not_lost() {
        let (left, right) = connection_pair();
        left.start().unwrap();
        right.start().unwrap();

        let pending = PendingReply::expect(&right, &[PacketType::Ok]);
        left.send_packet(Packet::was_ok(true)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(pending.wait(Duration::from_millis(10)).await.is_some());
    }

    #[tokio::test]
    async fn stateful_matcher_collects_two_packets() {
        let (left, right) = connection_pair();
        left.start().unwrap();
        right.start().unwrap();

        let mut seen_ok = false;
        let pending = PendingReply::register(&right, move |packet: &Packet| {
            match packet.packet_type() {
                PacketType::Ok => seen_ok = true,
                PacketType::Version if seen_ok => return packet.payload().as_number(),
                _ => {}
            }
            None
        });
        left.send_packet(Packet::was_ok(true)).unwrap();
        left.send_packet(Packet::version(3)).unwrap();

        assert_eq!(pending.wait(Duration::from_secs(2)).await, Some(3));
    }

    #[tokio::test]
    async fn closed_connection_ends_the_wait() {
        let (left, right) = connection_pair();
        left.start().unwrap();
        right.start().unwrap();

        let pending = PendingReply::expect(&right, &[PacketType::Ok]);
        left.shutdown();

        let started = tokio::time::Instant::now();
        assert!(pending.wait(Duration::from_secs(10)).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
