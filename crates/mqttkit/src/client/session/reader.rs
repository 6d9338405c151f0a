use super::{ErrorSink, KeepaliveState};
use crate::transport::PacketReader;
use mqttkit_protocol::Packet;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Decodes packets off the connection and hands them to the logic task.
pub(super) async fn reader_task(
    mut reader: PacketReader,
    inbound: mpsc::Sender<Packet>,
    keepalive: Arc<Mutex<KeepaliveState>>,
    errors: ErrorSink,
    cancel: CancellationToken,
) {
    tracing::debug!("Packet reader task started");
    loop {
        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            read = reader.read_packet() => read,
        };

        match read {
            Ok(packet) => {
                keepalive.lock().record_received();
                tracing::trace!(packet_type = ?packet.packet_type(), "Received packet");
                let forwarded = tokio::select! {
                    biased;
                    () = cancel.cancelled() => false,
                    sent = inbound.send(packet) => sent.is_ok(),
                };
                if !forwarded {
                    break;
                }
            }
            Err(e) => {
                if !cancel.is_cancelled() {
                    tracing::debug!(error = %e, "Read failed");
                    errors.report(e);
                }
                break;
            }
        }
    }
    tracing::debug!("Packet reader task stopped");
}
