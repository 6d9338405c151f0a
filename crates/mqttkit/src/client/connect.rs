//! Connection orchestration: the connect loop, establishing a session,
//! connection-loss handling, reconnect and shutdown.
//!
//! Every long wait here is raced against the status turning
//! `Disconnecting`, so a concurrent disconnect never has to wait out a
//! connect timeout or a backoff sleep.

use super::inner::ClientInner;
use super::resume::{self, ResumePolicy};
use super::session::Session;
use super::MqttClient;
use crate::options::ClientOptions;
use crate::status::{ConnectCompletion, Status};
use crate::token::{ConnectOutcome, ConnectToken};
use crate::transport::{self, Connection, PacketReader, PacketWriter};
use mqttkit_protocol::packet::{ConnAckPacket, ConnectPacket};
use mqttkit_protocol::{MqttError, Packet, Result};
use rand::seq::SliceRandom;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const CONNECTION_LOST_SITUATION: &str = "connection-lost";
const RECONNECT_SITUATION: &str = "reconnect";

/// A broker that has accepted CONNECT.
struct Established {
    reader: PacketReader,
    writer: PacketWriter,
    connack: ConnAckPacket,
    broker: Url,
}

async fn until_disconnecting(status: &mut watch::Receiver<Status>) {
    let disconnecting = status
        .wait_for(|s| *s == Status::Disconnecting)
        .await
        .is_ok();
    if !disconnecting {
        std::future::pending::<()>().await;
    }
}

/// Runs `future` unless a disconnect starts first.
async fn unless_disconnecting<F: Future>(
    status: &mut watch::Receiver<Status>,
    future: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = until_disconnecting(status) => None,
        output = future => Some(output),
    }
}

fn build_connect(options: &ClientOptions) -> ConnectPacket {
    let (username, password) = options.credentials();
    let mut connect = ConnectPacket::new(options.client_id.clone(), options.protocol_version)
        .with_clean_session(options.clean_session)
        .with_keep_alive(options.keep_alive_secs())
        .with_credentials(username, password)
        .with_properties(options.connect_properties.clone());
    if let Some(will) = &options.will {
        connect = connect.with_will(will.clone());
    }
    connect
}

async fn connect_broker(options: &ClientOptions, broker: &Url) -> Result<Established> {
    let tls_config = match &options.on_connect_attempt {
        Some(hook) => hook(broker, options.tls_config.clone()),
        None => options.tls_config.clone(),
    };
    let connection = match &options.custom_open_connection {
        Some(open) => Connection::from(open(broker.clone()).await?),
        None => transport::dial(broker, tls_config).await?,
    };
    let (mut reader, mut writer) =
        connection.split(options.protocol_version, options.max_packet_size);

    writer
        .write_packet(&Packet::Connect(Box::new(build_connect(options))))
        .await?;

    match reader.read_packet().await? {
        Packet::ConnAck(connack) => {
            if let Some(err) = connack.return_code.into_error() {
                writer.shutdown().await;
                return Err(err);
            }
            Ok(Established {
                reader,
                writer,
                connack,
                broker: broker.clone(),
            })
        }
        other => {
            writer.shutdown().await;
            Err(MqttError::ProtocolError(format!(
                "expected CONNACK, received {:?}",
                other.packet_type()
            )))
        }
    }
}

/// Tries each broker once, in order or shuffled. Returns the last error if
/// none accepts.
async fn attempt_connection(options: &ClientOptions) -> Result<Established> {
    let mut brokers = options.servers.clone();
    if brokers.is_empty() {
        return Err(MqttError::Configuration("no broker configured".to_string()));
    }
    if options.randomize_brokers {
        brokers.shuffle(&mut rand::thread_rng());
    }

    let mut last_error = MqttError::ConnectTimeout;
    for broker in &brokers {
        tracing::debug!(broker = %broker, client_id = %options.client_id, "Connecting");
        match tokio::time::timeout(options.connect_timeout, connect_broker(options, broker)).await
        {
            Ok(Ok(established)) => return Ok(established),
            Ok(Err(e)) => {
                tracing::warn!(broker = %broker, error = %e, "Connection attempt failed");
                last_error = e;
            }
            Err(_) => {
                tracing::warn!(broker = %broker, timeout = ?options.connect_timeout, "Connection attempt timed out");
                last_error = MqttError::ConnectTimeout;
            }
        }
    }
    Err(last_error)
}

/// Body of [`MqttClient::connect`].
pub(super) async fn run_connect(
    inner: Arc<ClientInner>,
    completion: ConnectCompletion,
    token: ConnectToken,
) {
    let options = inner.options();
    let mut status = inner.status.subscribe();

    if let Err(e) = inner.store.open().await {
        tracing::error!(error = %e, "Cannot open store");
        let err = completion.complete(false).err().unwrap_or(e);
        token.fail(err);
        return;
    }
    if options.clean_session {
        if let Err(e) = inner.store.reset().await {
            tracing::warn!(error = %e, "Failed to reset store for clean session");
        }
        inner.message_ids.fail_all(&MqttError::NotConnected);
    }

    loop {
        let Some(attempt) = unless_disconnecting(&mut status, attempt_connection(&options)).await
        else {
            let err = completion
                .complete(false)
                .err()
                .unwrap_or(MqttError::AbortedConnection);
            token.fail(err);
            return;
        };

        match attempt {
            Ok(established) => {
                match establish(&inner, established, completion).await {
                    Ok(outcome) => {
                        token.complete(Ok(outcome));
                    }
                    Err(e) => {
                        token.fail(e);
                    }
                }
                return;
            }
            Err(e) if options.connect_retry => {
                tracing::warn!(error = %e, retry_in = ?options.connect_retry_interval, "Connect failed, retrying");
                let slept = unless_disconnecting(
                    &mut status,
                    tokio::time::sleep(options.connect_retry_interval),
                )
                .await;
                if slept.is_none() {
                    let err = completion
                        .complete(false)
                        .err()
                        .unwrap_or(MqttError::AbortedConnection);
                    token.fail(err);
                    return;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Connect failed");
                let err = completion.complete(false).err().unwrap_or(e);
                token.fail(err);
                return;
            }
        }
    }
}

/// Starts the session on an accepted connection and reports the connect as
/// complete. Fails only if a disconnect won the race.
async fn establish(
    inner: &Arc<ClientInner>,
    established: Established,
    completion: ConnectCompletion,
) -> Result<ConnectOutcome> {
    let options = inner.options();
    let Established {
        reader,
        writer,
        connack,
        broker,
    } = established;
    let reconnect = completion.is_reconnect();

    let (mut session, errors) = Session::start(inner, reader, writer, &options);
    let links = session.links.clone();

    let policy = ResumePolicy {
        clean_session: options.clean_session,
        resume_subs: options.resume_subs,
        max_publish_in_flight: options.max_resume_pub_in_flight,
    };
    let restore_subscriptions =
        reconnect && !connack.session_present && !(options.resume_subs && !options.clean_session);
    {
        let inner = Arc::clone(inner);
        let links = links.clone();
        session.spawn(async move {
            if restore_subscriptions {
                resume::resubscribe(Arc::clone(&inner), links.clone()).await;
            }
            resume::resume(inner, links, policy).await;
        });
    }
    *inner.session.lock() = Some(session);

    if let Err(e) = completion.complete(true) {
        tracing::debug!(error = %e, "Disconnect requested while connecting");
        if let Some(session) = inner.take_session() {
            session.stop().await;
        }
        return Err(e);
    }

    tracing::info!(
        broker = %broker,
        session_present = connack.session_present,
        reconnect,
        "Connected"
    );
    spawn_watcher(Arc::clone(inner), errors, links.cancel);

    if let Some(on_connect) = &options.on_connect {
        on_connect(&MqttClient::from_inner(Arc::clone(inner)));
    }

    Ok(ConnectOutcome {
        return_code: connack.return_code,
        session_present: connack.session_present,
    })
}

/// Waits for the first session error and hands it to connection-loss
/// handling. Exits quietly when the session is stopped on purpose.
fn spawn_watcher(
    inner: Arc<ClientInner>,
    mut errors: mpsc::Receiver<MqttError>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let err = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            err = errors.recv() => match err {
                Some(err) => err,
                None => return,
            },
        };
        connection_lost(inner, err).await;
    });
}

async fn connection_lost(inner: Arc<ClientInner>, err: MqttError) {
    let options = inner.options();
    let reconnect = options.auto_reconnect && !matches!(err, MqttError::ServerDisconnected(_));
    tracing::warn!(error = %err, reconnect, "Connection lost");

    let handler = match inner.status.connection_lost(reconnect).await {
        Ok(handler) => handler,
        Err(e) => {
            tracing::debug!(error = %e, "Connection loss superseded");
            return;
        }
    };

    if let Some(session) = inner.take_session() {
        session.stop().await;
    }
    if let Some(on_lost) = &options.on_connection_lost {
        on_lost(&MqttClient::from_inner(Arc::clone(&inner)), &err);
    }

    if !handler.reconnect_requested() {
        inner.message_ids.fail_all(&err);
        inner.store.close().await;
        if let Err(e) = handler.proceed(false) {
            tracing::debug!(error = %e, "Status already moved on");
        }
        return;
    }

    match handler.proceed(true) {
        Ok(Some(completion)) => {
            tokio::spawn(reconnect_loop(inner, completion));
        }
        Ok(None) => {}
        Err(e) => {
            tracing::debug!(error = %e, "Disconnect requested during connection loss");
            inner.message_ids.fail_all(&MqttError::NotConnected);
            inner.store.close().await;
        }
    }
}

async fn reconnect_loop(inner: Arc<ClientInner>, completion: ConnectCompletion) {
    let mut status = inner.status.subscribe();
    let client = MqttClient::from_inner(Arc::clone(&inner));
    let first = inner.options();

    // Immediate first attempt, unless connections keep dropping.
    let slept = unless_disconnecting(
        &mut status,
        inner.backoff.sleep(
            CONNECTION_LOST_SITUATION,
            RECONNECT_INITIAL_DELAY,
            first.max_reconnect_interval,
            first.connect_timeout,
            true,
        ),
    )
    .await;
    if slept.is_none() {
        abort_reconnect(completion);
        return;
    }

    loop {
        let mut options = inner.options();
        if let Some(on_reconnecting) = options.on_reconnecting.clone() {
            on_reconnecting(&client, &mut options);
            *inner.options.write() = options.clone();
        }

        let Some(attempt) = unless_disconnecting(&mut status, attempt_connection(&options)).await
        else {
            abort_reconnect(completion);
            return;
        };

        match attempt {
            Ok(established) => {
                inner.backoff.reset(RECONNECT_SITUATION);
                if let Err(e) = establish(&inner, established, completion).await {
                    tracing::debug!(error = %e, "Reconnect abandoned");
                }
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reconnect failed");
                let slept = unless_disconnecting(
                    &mut status,
                    inner.backoff.sleep(
                        RECONNECT_SITUATION,
                        RECONNECT_INITIAL_DELAY,
                        options.max_reconnect_interval,
                        options.connect_timeout,
                        false,
                    ),
                )
                .await;
                if slept.is_none() {
                    abort_reconnect(completion);
                    return;
                }
            }
        }
    }
}

fn abort_reconnect(completion: ConnectCompletion) {
    if let Err(e) = completion.complete(false) {
        tracing::debug!(error = %e, "Reconnect cancelled");
    }
}

/// Body of [`MqttClient::disconnect`] and [`MqttClient::force_disconnect`].
/// With `quiesce`, queued publishes get that long to be written before
/// DISCONNECT is sent; without it the connection is just dropped.
pub(super) async fn shutdown(inner: Arc<ClientInner>, quiesce: Option<Duration>) -> Result<()> {
    let done = inner.status.disconnecting().await?;

    if let Some(mut session) = inner.take_session() {
        if let Some(quiesce) = quiesce {
            let deadline = Instant::now() + quiesce;
            if tokio::time::timeout_at(deadline, session.drained())
                .await
                .is_err()
            {
                tracing::debug!(?quiesce, "Quiesce period expired with publishes queued");
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            session.send_disconnect(remaining).await;
        }
        session.stop().await;
    }

    inner.message_ids.fail_all(&MqttError::NotConnected);
    inner.store.close().await;
    done.complete();
    tracing::info!("Disconnected");
    Ok(())
}
