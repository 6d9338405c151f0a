//! Keepalive tracking and the ping task.

use super::ErrorSink;
use mqttkit_protocol::{MqttError, Packet};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const MIN_TICK: Duration = Duration::from_millis(10);

/// Traffic timestamps shared by the I/O tasks. Any successful write or read
/// counts as activity.
#[derive(Debug)]
pub(crate) struct KeepaliveState {
    last_sent: Instant,
    last_received: Instant,
    ping_sent_at: Option<Instant>,
}

impl Default for KeepaliveState {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            last_sent: now,
            last_received: now,
            ping_sent_at: None,
        }
    }
}

impl KeepaliveState {
    pub(crate) fn record_sent(&mut self) {
        self.last_sent = Instant::now();
    }

    pub(crate) fn record_received(&mut self) {
        self.last_received = Instant::now();
    }

    pub(crate) fn record_ping_sent(&mut self, at: Instant) {
        self.ping_sent_at = Some(at);
    }

    pub(crate) fn record_pong_received(&mut self) {
        self.ping_sent_at = None;
    }

    pub(crate) fn ping_outstanding(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// A ping is due when none is outstanding and either direction has been
    /// idle for a whole keepalive period.
    pub(crate) fn ping_due(&self, now: Instant, keep_alive: Duration) -> bool {
        self.ping_sent_at.is_none()
            && (now.saturating_duration_since(self.last_sent) >= keep_alive
                || now.saturating_duration_since(self.last_received) >= keep_alive)
    }

    pub(crate) fn is_timeout(&self, now: Instant, ping_timeout: Duration) -> bool {
        self.ping_sent_at
            .is_some_and(|sent_at| now.saturating_duration_since(sent_at) >= ping_timeout)
    }
}

/// Checks four times per keepalive period. Reports `KeepAliveTimeout` when
/// a PINGREQ has gone unanswered for `ping_timeout`.
pub(super) async fn keepalive_task(
    state: Arc<Mutex<KeepaliveState>>,
    priority: mpsc::Sender<Packet>,
    keep_alive: Duration,
    ping_timeout: Duration,
    errors: ErrorSink,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval((keep_alive / 4).max(MIN_TICK));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        let now = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            now = interval.tick() => now,
        };

        let due = {
            let mut state = state.lock();
            if state.is_timeout(now, ping_timeout) {
                tracing::error!(?ping_timeout, "Keepalive timeout - no PINGRESP received");
                errors.report(MqttError::KeepAliveTimeout);
                break;
            }
            let due = state.ping_due(now, keep_alive);
            if due {
                state.record_ping_sent(now);
            }
            due
        };

        if due {
            tracing::trace!("Sending PINGREQ");
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                sent = priority.send(Packet::PingReq) => sent.is_ok(),
            };
            if !sent {
                break;
            }
        }
    }
    tracing::debug!("Keepalive task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ping_due_after_idle_period() {
        let state = KeepaliveState::default();
        let keep_alive = Duration::from_secs(2);
        assert!(!state.ping_due(Instant::now(), keep_alive));
        tokio::time::advance(keep_alive).await;
        assert!(state.ping_due(Instant::now(), keep_alive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiving_alone_does_not_postpone_ping() {
        let mut state = KeepaliveState::default();
        let keep_alive = Duration::from_secs(2);
        tokio::time::advance(Duration::from_secs(1)).await;
        state.record_received();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(state.ping_due(Instant::now(), keep_alive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_only_while_ping_outstanding() {
        let mut state = KeepaliveState::default();
        let timeout = Duration::from_secs(1);
        state.record_ping_sent(Instant::now());
        assert!(state.ping_outstanding());
        assert!(!state.ping_due(Instant::now(), Duration::ZERO));

        tokio::time::advance(timeout).await;
        assert!(state.is_timeout(Instant::now(), timeout));

        state.record_pong_received();
        assert!(!state.is_timeout(Instant::now(), timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_pings_then_times_out() {
        let state = Arc::new(Mutex::new(KeepaliveState::default()));
        let (priority, mut queue) = mpsc::channel(4);
        let (sink, mut errors) = ErrorSink::channel();
        let task = tokio::spawn(keepalive_task(
            Arc::clone(&state),
            priority,
            Duration::from_secs(2),
            Duration::from_secs(1),
            sink,
            CancellationToken::new(),
        ));

        assert_eq!(queue.recv().await, Some(Packet::PingReq));
        let sent_at = Instant::now();
        assert_eq!(errors.recv().await, Some(MqttError::KeepAliveTimeout));
        assert!(sent_at.elapsed() <= Duration::from_millis(1500));
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_stops_on_cancel() {
        let state = Arc::new(Mutex::new(KeepaliveState::default()));
        let (priority, _queue) = mpsc::channel(4);
        let (sink, _errors) = ErrorSink::channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(keepalive_task(
            state,
            priority,
            Duration::from_secs(2),
            Duration::from_secs(1),
            sink,
            cancel.clone(),
        ));
        cancel.cancel();
        task.await.unwrap();
    }
}
