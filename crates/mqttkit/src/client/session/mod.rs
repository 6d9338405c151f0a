//! The tasks that drive one network connection.
//!
//! A session owns five tasks: the reader, the logic task that runs the
//! QoS state machines, a writer for the outbound publish queue, a writer
//! for ACKs/PINGREQ/SUBSCRIBE and friends, and the keepalive timer. They
//! share one cancellation token. The first task to hit an error reports it
//! through the session's error channel and the connection watcher tears
//! everything down.

mod handlers;
mod keepalive;
mod reader;
mod writer;

pub(crate) use keepalive::KeepaliveState;

use super::inner::ClientInner;
use crate::options::ClientOptions;
use crate::token::PublishToken;
use crate::transport::{PacketReader, PacketWriter};
use mqttkit_protocol::packet::{DisconnectPacket, PublishPacket};
use mqttkit_protocol::{MqttError, Packet};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) type SharedWriter = Arc<tokio::sync::Mutex<PacketWriter>>;

const PRIORITY_QUEUE_DEPTH: usize = 64;
const INBOUND_QUEUE_DEPTH: usize = 64;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// A publish waiting for the outbound writer.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) publish: PublishPacket,
    pub(crate) token: PublishToken,
}

/// Capacity-one error channel. Only the first failure of a session is
/// kept; later ones are consequences of it.
#[derive(Debug, Clone)]
pub(crate) struct ErrorSink(mpsc::Sender<MqttError>);

impl ErrorSink {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<MqttError>) {
        let (tx, rx) = mpsc::channel(1);
        (Self(tx), rx)
    }

    pub(crate) fn report(&self, err: MqttError) {
        if let Err(mpsc::error::TrySendError::Full(err)) = self.0.try_send(err) {
            tracing::debug!(error = %err, "Dropping secondary session error");
        }
    }
}

/// Count of publishes handed to the outbound queue and not yet written.
#[derive(Debug, Default)]
pub(crate) struct Backlog {
    pending: AtomicUsize,
    empty: Notify,
}

impl Backlog {
    pub(crate) fn add(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.empty.notify_waiters();
        }
    }

    /// Resolves once the count reaches zero.
    pub(crate) async fn drained(&self) {
        loop {
            let notified = self.empty.notified();
            tokio::pin!(notified);
            // registered before the check so a concurrent `done` is not missed
            notified.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Handles for submitting work to a running session.
#[derive(Debug, Clone)]
pub(crate) struct Links {
    pub(crate) outbound: mpsc::Sender<Envelope>,
    pub(crate) backlog: Arc<Backlog>,
    pub(crate) priority: mpsc::Sender<Packet>,
    pub(crate) cancel: CancellationToken,
}

impl Links {
    /// Queues a control packet unless the session is shutting down.
    pub(crate) async fn send_priority(&self, packet: Packet) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.priority.send(packet) => sent.is_ok(),
        }
    }

    /// Queues a publish. Hands the envelope back if the session is gone.
    pub(crate) async fn send_publish(&self, envelope: Envelope) -> Result<(), Envelope> {
        if self.cancel.is_cancelled() {
            return Err(envelope);
        }
        self.backlog.add();
        self.outbound.send(envelope).await.map_err(|e| {
            self.backlog.done();
            e.0
        })
    }
}

pub(crate) struct Session {
    pub(crate) links: Links,
    writer: SharedWriter,
    priority_task: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cancelled", &self.links.cancel.is_cancelled())
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawns the session tasks on an established connection. The returned
    /// receiver yields the first error any task hits.
    pub(crate) fn start(
        inner: &Arc<ClientInner>,
        reader: PacketReader,
        writer: PacketWriter,
        options: &ClientOptions,
    ) -> (Self, mpsc::Receiver<MqttError>) {
        let cancel = CancellationToken::new();
        let (errors, error_rx) = ErrorSink::channel();
        let (outbound, outbound_rx) = mpsc::channel(options.message_channel_depth.max(1));
        let (priority, priority_rx) = mpsc::channel(PRIORITY_QUEUE_DEPTH);
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        let backlog = Arc::new(Backlog::default());
        let keepalive = Arc::new(Mutex::new(KeepaliveState::default()));

        let writer_ctx = writer::WriterContext {
            inner: Arc::clone(inner),
            writer: Arc::clone(&writer),
            keepalive: Arc::clone(&keepalive),
            backlog: Arc::clone(&backlog),
            write_timeout: options.write_timeout,
            errors: errors.clone(),
            cancel: cancel.clone(),
        };

        let mut tasks = vec![
            tokio::spawn(reader::reader_task(
                reader,
                inbound,
                Arc::clone(&keepalive),
                errors.clone(),
                cancel.clone(),
            )),
            tokio::spawn(handlers::logic_task(
                handlers::Logic {
                    inner: Arc::clone(inner),
                    priority: priority.clone(),
                    keepalive: Arc::clone(&keepalive),
                    order_matters: options.order_matters,
                    cancel: cancel.clone(),
                },
                inbound_rx,
                errors.clone(),
            )),
            tokio::spawn(writer::outbound_writer_task(writer_ctx.clone(), outbound_rx)),
        ];
        let priority_task = tokio::spawn(writer::priority_writer_task(writer_ctx, priority_rx));

        if !options.keep_alive.is_zero() {
            tasks.push(tokio::spawn(keepalive::keepalive_task(
                keepalive,
                priority.clone(),
                options.keep_alive,
                options.effective_ping_timeout(),
                errors,
                cancel.clone(),
            )));
        }

        tracing::debug!(
            keep_alive = ?options.keep_alive,
            order_matters = options.order_matters,
            "Session started"
        );

        let session = Self {
            links: Links {
                outbound,
                backlog,
                priority,
                cancel,
            },
            writer,
            priority_task: Some(priority_task),
            tasks,
        };
        (session, error_rx)
    }

    /// Runs `future` as one of the session's tasks so that [`stop`](Self::stop)
    /// waits for it.
    pub(crate) fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(future));
    }

    /// Resolves once every queued publish has been written.
    pub(crate) async fn drained(&self) {
        self.links.backlog.drained().await;
    }

    /// Queues DISCONNECT behind anything already on the priority queue and
    /// waits up to `timeout` for it to be written.
    pub(crate) async fn send_disconnect(&mut self, timeout: Duration) {
        let packet = Packet::Disconnect(DisconnectPacket::default());
        if self.links.priority.try_send(packet).is_err() {
            tracing::debug!("Could not queue DISCONNECT");
            return;
        }
        if let Some(handle) = self.priority_task.as_mut() {
            if tokio::time::timeout(timeout, handle).await.is_ok() {
                self.priority_task = None;
            } else {
                tracing::debug!(?timeout, "DISCONNECT not written in time");
            }
        }
    }

    /// Cancels every task, waits for them to exit and closes the connection.
    pub(crate) async fn stop(self) {
        let Self {
            links,
            writer,
            priority_task,
            tasks,
        } = self;
        links.cancel.cancel();
        drop(links);

        for handle in priority_task.into_iter().chain(tasks) {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Session task ended abnormally");
            }
        }

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            writer.lock().await.shutdown().await;
        })
        .await
        {
            Ok(()) => tracing::debug!("Session stopped"),
            Err(_) => tracing::debug!("Timed out closing connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backlog_drained_when_empty() {
        let backlog = Backlog::default();
        tokio::time::timeout(Duration::from_millis(100), backlog.drained())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_backlog_wakes_waiter_on_last_write() {
        let backlog = Backlog::default();
        backlog.add();
        backlog.add();

        let drained = backlog.drained();
        tokio::pin!(drained);
        assert!(futures::poll!(drained.as_mut()).is_pending());

        backlog.done();
        assert!(futures::poll!(drained.as_mut()).is_pending());

        backlog.done();
        assert!(futures::poll!(drained.as_mut()).is_ready());
    }

    #[tokio::test]
    async fn test_backlog_waiter_on_another_task() {
        let backlog = Arc::new(Backlog::default());
        backlog.add();
        let waiter = tokio::spawn({
            let backlog = Arc::clone(&backlog);
            async move { backlog.drained().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        backlog.done();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
