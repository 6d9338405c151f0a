//! The two writer tasks.
//!
//! Both write through the same locked [`PacketWriter`]. The priority
//! writer carries everything except outbound PUBLISH so that ACKs and pings
//! are never stuck behind a full publish queue.

use super::{Backlog, Envelope, ErrorSink, KeepaliveState, SharedWriter};
use crate::client::inner::ClientInner;
use crate::store::inbound_key;
use mqttkit_protocol::{MqttError, Packet, QoS, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub(super) struct WriterContext {
    pub(super) inner: Arc<ClientInner>,
    pub(super) writer: SharedWriter,
    pub(super) keepalive: Arc<Mutex<KeepaliveState>>,
    pub(super) backlog: Arc<Backlog>,
    pub(super) write_timeout: Duration,
    pub(super) errors: ErrorSink,
    pub(super) cancel: CancellationToken,
}

enum Written {
    Done,
    Cancelled,
}

impl WriterContext {
    /// Writes one packet, bounded by `write_timeout` when it is non-zero and
    /// abandoned if the session is cancelled.
    async fn write(&self, packet: &Packet) -> Result<Written> {
        let write = async {
            let mut writer = self.writer.lock().await;
            if self.write_timeout.is_zero() {
                writer.write_packet(packet).await
            } else {
                tokio::time::timeout(self.write_timeout, writer.write_packet(packet))
                    .await
                    .map_err(|_| MqttError::WriteTimeout)?
            }
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Ok(Written::Cancelled),
            written = write => {
                written?;
                self.keepalive.lock().record_sent();
                Ok(Written::Done)
            }
        }
    }
}

pub(super) async fn outbound_writer_task(ctx: WriterContext, mut queue: mpsc::Receiver<Envelope>) {
    loop {
        let envelope = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => break,
            envelope = queue.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };
        let sent = send_publish(&ctx, envelope).await;
        ctx.backlog.done();
        match sent {
            Ok(Written::Done) => {}
            Ok(Written::Cancelled) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Publish write failed");
                ctx.errors.report(e);
                break;
            }
        }
    }

    queue.close();
    while let Ok(envelope) = queue.try_recv() {
        ctx.backlog.done();
        ctx.inner.park(envelope).await;
    }
    tracing::debug!("Outbound writer task stopped");
}

async fn send_publish(ctx: &WriterContext, envelope: Envelope) -> Result<Written> {
    let Envelope { mut publish, token } = envelope;
    let qos = publish.qos;
    if qos != QoS::AtMostOnce {
        let Some(packet_id) = ctx.inner.register_publish(&mut publish, &token).await else {
            return Ok(Written::Done);
        };
        tracing::trace!(packet_id, ?qos, topic = %publish.topic_name, "Sending publish");
    }

    let packet = Packet::Publish(publish);
    match ctx.write(&packet).await {
        Ok(Written::Done) => {
            if qos == QoS::AtMostOnce {
                token.complete(Ok(()));
            }
            Ok(Written::Done)
        }
        Ok(Written::Cancelled) => {
            if qos == QoS::AtMostOnce {
                token.fail(MqttError::NotConnected);
            }
            Ok(Written::Cancelled)
        }
        Err(e) => {
            if qos == QoS::AtMostOnce {
                token.fail(e.clone());
            }
            Err(e)
        }
    }
}

pub(super) async fn priority_writer_task(ctx: WriterContext, mut queue: mpsc::Receiver<Packet>) {
    loop {
        let packet = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => break,
            packet = queue.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        match ctx.write(&packet).await {
            Ok(Written::Done) => {}
            Ok(Written::Cancelled) => break,
            Err(e) => {
                tracing::debug!(error = %e, packet_type = ?packet.packet_type(), "Write failed");
                ctx.errors.report(e);
                break;
            }
        }

        match &packet {
            Packet::PubComp(pubcomp) => ctx.inner.forget(&inbound_key(pubcomp.packet_id)).await,
            Packet::Disconnect(_) => {
                tracing::debug!("DISCONNECT written");
                break;
            }
            _ => {}
        }
    }
    tracing::debug!("Priority writer task stopped");
}
