//! A scripted broker for driving the client from tests. Each test reads
//! the client's packets and answers them by hand.

#![allow(dead_code)]

use bytes::BytesMut;
use mqttkit::protocol::packet::{ConnAckPacket, ConnectPacket};
use mqttkit::protocol::Packet;
use mqttkit::{ConnectReturnCode, ProtocolVersion};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct MockBroker {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockBroker {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    /// Rebinds a known address, for tests where the broker comes up late.
    pub async fn bind_at(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        Self { listener, addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub async fn accept(&self) -> BrokerConnection {
        let (stream, _) = tokio::time::timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .expect("client did not connect")
            .unwrap();
        BrokerConnection {
            stream,
            buffer: BytesMut::new(),
            version: ProtocolVersion::V311,
        }
    }

    /// Accepts a connection and completes the CONNECT handshake.
    pub async fn accept_session(&self, session_present: bool) -> (BrokerConnection, ConnectPacket) {
        let mut connection = self.accept().await;
        let connect = connection.handshake(session_present).await;
        (connection, connect)
    }
}

pub struct BrokerConnection {
    stream: TcpStream,
    buffer: BytesMut,
    version: ProtocolVersion,
}

impl BrokerConnection {
    /// Next packet from the client, or `None` once it closes the connection.
    pub async fn recv(&mut self) -> Option<Packet> {
        tokio::time::timeout(RECV_TIMEOUT, self.read_packet())
            .await
            .expect("timed out waiting for a packet from the client")
    }

    async fn read_packet(&mut self) -> Option<Packet> {
        loop {
            if let Some(packet) = Packet::try_decode(&mut self.buffer, self.version, usize::MAX)
                .expect("client sent a malformed packet")
            {
                return Some(packet);
            }
            match self.stream.read_buf(&mut self.buffer).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Like [`recv`](Self::recv) but answers PINGREQ along the way.
    pub async fn recv_answering_pings(&mut self) -> Option<Packet> {
        loop {
            match self.recv().await? {
                Packet::PingReq => self.send(Packet::PingResp).await,
                other => return Some(other),
            }
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        let bytes = packet.to_bytes(self.version).unwrap();
        // the client may already be gone; tests assert on what it received
        let _ = self.stream.write_all(&bytes).await;
    }

    pub async fn expect_connect(&mut self) -> ConnectPacket {
        match self.recv().await {
            Some(Packet::Connect(connect)) => {
                self.version = connect.protocol_version;
                *connect
            }
            other => panic!("expected CONNECT, got {other:?}"),
        }
    }

    pub async fn handshake(&mut self, session_present: bool) -> ConnectPacket {
        let connect = self.expect_connect().await;
        self.send(Packet::ConnAck(ConnAckPacket::new(
            session_present,
            ConnectReturnCode::Accepted,
        )))
        .await;
        connect
    }

    /// Asserts that nothing arrives for `period`.
    pub async fn expect_silence(&mut self, period: Duration) {
        if let Ok(packet) = tokio::time::timeout(period, self.read_packet()).await {
            panic!("expected no traffic, got {packet:?}");
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
