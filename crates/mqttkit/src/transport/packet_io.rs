//! Framed packet reading and writing over a split [`Connection`].

use super::{BoxedStream, Connection};
use bytes::BytesMut;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use mqttkit_protocol::{MqttError, Packet, ProtocolVersion, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const READ_BUFFER_CAPACITY: usize = 4096;

type WsStream = WebSocketStream<BoxedStream>;

enum ReaderInner {
    Stream(ReadHalf<BoxedStream>),
    WebSocket(SplitStream<WsStream>),
}

pub struct PacketReader {
    inner: ReaderInner,
    buffer: BytesMut,
    protocol_version: ProtocolVersion,
    max_packet_size: usize,
}

pub enum PacketWriter {
    Stream {
        writer: WriteHalf<BoxedStream>,
        protocol_version: ProtocolVersion,
    },
    WebSocket {
        sink: SplitSink<WsStream, Message>,
        protocol_version: ProtocolVersion,
    },
}

impl Connection {
    pub fn split(
        self,
        protocol_version: ProtocolVersion,
        max_packet_size: usize,
    ) -> (PacketReader, PacketWriter) {
        let (reader, writer) = match self {
            Self::Stream(stream) => {
                let (read, write) = tokio::io::split(stream);
                (
                    ReaderInner::Stream(read),
                    PacketWriter::Stream {
                        writer: write,
                        protocol_version,
                    },
                )
            }
            Self::WebSocket(ws) => {
                let (sink, stream) = (*ws).split();
                (
                    ReaderInner::WebSocket(stream),
                    PacketWriter::WebSocket {
                        sink,
                        protocol_version,
                    },
                )
            }
        };
        (
            PacketReader {
                inner: reader,
                buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
                protocol_version,
                max_packet_size,
            },
            writer,
        )
    }
}

fn websocket_error(e: &tokio_tungstenite::tungstenite::Error) -> MqttError {
    MqttError::Io(format!("WebSocket: {e}"))
}

impl PacketReader {
    /// Reads until one whole packet is buffered. Packets may straddle reads
    /// and WebSocket frames.
    pub async fn read_packet(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) =
                Packet::try_decode(&mut self.buffer, self.protocol_version, self.max_packet_size)?
            {
                tracing::trace!(packet_type = ?packet.packet_type(), "Read packet");
                return Ok(packet);
            }

            match &mut self.inner {
                ReaderInner::Stream(reader) => {
                    if reader.read_buf(&mut self.buffer).await? == 0 {
                        return Err(MqttError::ConnectionClosedByPeer);
                    }
                }
                ReaderInner::WebSocket(stream) => match stream.next().await {
                    Some(Ok(Message::Binary(data))) => self.buffer.extend_from_slice(&data),
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(MqttError::ConnectionClosedByPeer)
                    }
                    Some(Ok(Message::Text(_))) => {
                        return Err(MqttError::ProtocolError(
                            "text WebSocket frame received".to_string(),
                        ))
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(websocket_error(&e)),
                },
            }
        }
    }
}

impl PacketWriter {
    pub fn protocol_version(&self) -> ProtocolVersion {
        match self {
            Self::Stream {
                protocol_version, ..
            }
            | Self::WebSocket {
                protocol_version, ..
            } => *protocol_version,
        }
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let bytes = packet.to_bytes(self.protocol_version())?;
        tracing::trace!(packet_type = ?packet.packet_type(), len = bytes.len(), "Write packet");
        match self {
            Self::Stream { writer, .. } => {
                writer.write_all(&bytes).await?;
                writer.flush().await?;
            }
            Self::WebSocket { sink, .. } => {
                sink.send(Message::Binary(bytes.freeze()))
                    .await
                    .map_err(|e| websocket_error(&e))?;
            }
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let result = match self {
            Self::Stream { writer, .. } => writer.shutdown().await.map_err(MqttError::from),
            Self::WebSocket { sink, .. } => sink.close().await.map_err(|e| websocket_error(&e)),
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "Error closing connection");
        }
    }
}
