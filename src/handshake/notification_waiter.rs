use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct WaitState {
    signal: Option<oneshot::Sender<()>>,
    timed_out: bool,
}

/// A one-shot rendezvous between a task waiting for a reply and the receive
/// loop that sees it arrive.
///
/// `notify` only counts while a wait is armed: a notification nobody is
/// waiting for is dropped, it does not carry over to the next wait.
#[derive(Debug, Default)]
pub struct NotificationWaiter {
    state: Mutex<WaitState>,
}

impl NotificationWaiter {
    pub fn new() -> Self {
        NotificationWaiter::default()
    }

    /// Waits until [`NotificationWaiter::notify`] is called or `timeout` runs out.
    ///
    /// Returns `true` when notified, `false` on timeout.
    pub async fn wait_for_reply(&self, timeout: Duration) -> bool {
        self.wait_for_reply_or(timeout, || false).await
    }

    /// Like [`NotificationWaiter::wait_for_reply`], but first checks `ready`
    /// after arming. A reply that was captured before the wait began then
    /// counts as a notification instead of being lost.
    pub async fn wait_for_reply_or(&self, timeout: Duration, ready: impl Fn() -> bool) -> bool {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.timed_out = true;
            state.signal = Some(tx);
        }

        if ready() {
            let mut state = self.state.lock();
            state.signal = None;
            state.timed_out = false;
            return true;
        }

        let _ = tokio::time::timeout(timeout, rx).await;

        let mut state = self.state.lock();
        // still armed means nobody notified us in time
        if state.signal.take().is_some() {
            state.timed_out = true;
        }
        !state.timed_out
    }

    /// Releases the current wait, if any.
    pub fn notify(&self) {
        let mut state = self.state.lock();
        if let Some(signal) = state.signal.take() {
            state.timed_out = false;
            let _ = signal.send(());
        }
    }

    /// Outcome of the last wait.
    pub fn is_timed_out(&self) -> bool {
        self.state.lock().timed_out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn notify_releases_the_wait() {
        let waiter = Arc::new(NotificationWaiter::new());
        let notifier = waiter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            notifier.notify();
        });

        assert!(waiter.wait_for_reply(Duration::from_secs(2)).await);
        assert!(!waiter.is_timed_out());
    }

    #[tokio::test]
    async fn no_notify_times_out() {
        let waiter = NotificationWaiter::new();
        let started = std::time::Instant::now();
        assert!(!waiter.wait_for_reply(Duration::from_millis(200)).await);
        let elapsed = started.elapsed();
        assert!(waiter.is_timed_out());
        assert!(
            elapsed >= Duration::from_millis(150) && elapsed <= Duration::from_millis(250),
            "timed out after {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn notify_without_a_wait_is_forgotten() {
        let waiter = NotificationWaiter::new();
        waiter.notify();
        assert!(!waiter.wait_for_reply(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn ready_check_short_circuits() {
        let waiter = NotificationWaiter::new();
        assert!(waiter.wait_for_reply_or(Duration::from_secs(5), || true).await);
        assert!(!waiter.is_timed_out());
    }
}
