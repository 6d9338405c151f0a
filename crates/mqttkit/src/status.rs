//! Connection status state machine.
//!
//! Every transition that takes time (connecting, disconnecting, handling a
//! lost connection) hands back a continuation. The caller must consume it to
//! finish the transition; dropping it finishes the transition as a failure
//! so no waiter is left blocked.
//!
//! ```text
//! disconnected --connecting()--> connecting --complete(true)--> connected
//!                                     \--complete(false)--> disconnected
//! connected --disconnecting()--> disconnecting --complete()--> disconnected
//! connected --connection_lost(r)--> disconnecting --proceed(true), r--> reconnecting
//! reconnecting --complete(true)--> connected
//! ```

use mqttkit_protocol::{MqttError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Reconnecting,
    Connected,
    Disconnecting,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Reconnecting => "reconnecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Fires once, when the transition in progress yields control.
#[derive(Debug, Clone)]
struct ActionLatch(Arc<watch::Sender<bool>>);

impl ActionLatch {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    fn release(&self) {
        self.0.send_replace(true);
    }

    async fn wait(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

#[derive(Debug)]
struct Inner {
    status: Status,
    will_reconnect: bool,
    action: Option<ActionLatch>,
}

#[derive(Debug)]
pub struct ConnectionStatus {
    inner: Mutex<Inner>,
    observed: watch::Sender<Status>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        let (observed, _) = watch::channel(Status::Disconnected);
        Self {
            inner: Mutex::new(Inner {
                status: Status::Disconnected,
                will_reconnect: false,
                action: None,
            }),
            observed,
        }
    }
}

impl ConnectionStatus {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn status(&self) -> Status {
        self.inner.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    /// Connected, or in the process of (re)establishing a connection.
    pub fn is_connection_open(&self) -> bool {
        matches!(
            self.status(),
            Status::Connected | Status::Connecting | Status::Reconnecting
        )
    }

    /// Watch channel that mirrors every status change.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.observed.subscribe()
    }

    fn set(&self, inner: &mut Inner, status: Status) {
        inner.status = status;
        self.observed.send_replace(status);
    }

    fn release_action(inner: &mut Inner) {
        if let Some(latch) = inner.action.take() {
            latch.release();
        }
    }

    pub fn connecting(self: &Arc<Self>) -> Result<ConnectCompletion> {
        let mut inner = self.inner.lock();
        match inner.status {
            Status::Connected | Status::Reconnecting => Err(MqttError::AlreadyConnected),
            Status::Disconnected => {
                self.set(&mut inner, Status::Connecting);
                inner.action = Some(ActionLatch::new());
                Ok(ConnectCompletion::new(Arc::clone(self), false))
            }
            other => Err(MqttError::InvalidState(format!(
                "cannot connect while {other}"
            ))),
        }
    }

    fn connected(&self, success: bool, reconnect: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let result = if inner.status == Status::Disconnecting {
            Err(if reconnect {
                MqttError::DisconnectionRequested
            } else {
                MqttError::AbortedConnection
            })
        } else {
            let next = if success {
                Status::Connected
            } else {
                Status::Disconnected
            };
            self.set(&mut inner, next);
            Ok(())
        };
        Self::release_action(&mut inner);
        result
    }

    /// Begins a user-requested disconnect. Waits for an in-progress connect,
    /// reconnect or disconnect to yield first.
    pub async fn disconnecting(self: &Arc<Self>) -> Result<DisconnectCompletion> {
        let (previous, pending) = {
            let mut inner = self.inner.lock();
            match inner.status {
                Status::Disconnected => return Err(MqttError::AlreadyDisconnected),
                Status::Disconnecting => {
                    inner.will_reconnect = false;
                    (Status::Disconnecting, inner.action.clone())
                }
                previous => {
                    self.set(&mut inner, Status::Disconnecting);
                    let pending = matches!(previous, Status::Connecting | Status::Reconnecting)
                        .then(|| inner.action.clone())
                        .flatten();
                    (previous, pending)
                }
            }
        };

        if let Some(latch) = pending {
            latch.wait().await;
        }

        let mut inner = self.inner.lock();
        match previous {
            Status::Disconnecting => Err(MqttError::AlreadyDisconnected),
            Status::Reconnecting if inner.status == Status::Disconnected => {
                Err(MqttError::AlreadyDisconnected)
            }
            _ => {
                if inner.status != Status::Disconnecting {
                    self.set(&mut inner, Status::Disconnecting);
                }
                inner.action = Some(ActionLatch::new());
                Ok(DisconnectCompletion {
                    status: Some(Arc::clone(self)),
                })
            }
        }
    }

    fn disconnection_completed(&self) {
        let mut inner = self.inner.lock();
        self.set(&mut inner, Status::Disconnected);
        Self::release_action(&mut inner);
    }

    /// Records that the network connection dropped. The returned handler
    /// decides, once the session is torn down, whether to reconnect.
    pub async fn connection_lost(self: &Arc<Self>, will_reconnect: bool) -> Result<LostHandler> {
        let pending = {
            let mut inner = self.inner.lock();
            match inner.status {
                Status::Disconnected => return Err(MqttError::AlreadyDisconnected),
                Status::Disconnecting => return Err(MqttError::DisconnectionInProgress),
                previous => {
                    inner.will_reconnect = will_reconnect;
                    self.set(&mut inner, Status::Disconnecting);
                    matches!(previous, Status::Connecting | Status::Reconnecting)
                        .then(|| inner.action.clone())
                        .flatten()
                }
            }
        };

        if let Some(latch) = pending {
            latch.wait().await;
            if !will_reconnect {
                let mut inner = self.inner.lock();
                self.set(&mut inner, Status::Disconnected);
                return Err(MqttError::AlreadyDisconnected);
            }
        }

        self.inner.lock().action = Some(ActionLatch::new());
        Ok(LostHandler {
            status: Some(Arc::clone(self)),
            reconnect_requested: will_reconnect,
        })
    }

    fn lost_handled(self: &Arc<Self>, proceed: bool, reconnect_requested: bool) -> Result<Option<ConnectCompletion>> {
        let mut inner = self.inner.lock();
        if !inner.will_reconnect || !proceed {
            self.set(&mut inner, Status::Disconnected);
            Self::release_action(&mut inner);
            if !reconnect_requested || !proceed {
                return Ok(None);
            }
            return Err(MqttError::DisconnectionRequested);
        }
        self.set(&mut inner, Status::Reconnecting);
        Ok(Some(ConnectCompletion::new(Arc::clone(self), true)))
    }
}

/// Finishes a connect or reconnect. Dropping it reports failure.
#[must_use]
#[derive(Debug)]
pub struct ConnectCompletion {
    status: Option<Arc<ConnectionStatus>>,
    reconnect: bool,
}

impl ConnectCompletion {
    fn new(status: Arc<ConnectionStatus>, reconnect: bool) -> Self {
        Self {
            status: Some(status),
            reconnect,
        }
    }

    pub fn is_reconnect(&self) -> bool {
        self.reconnect
    }

    /// Fails with `AbortedConnection` (or `DisconnectionRequested` for a
    /// reconnect) when a disconnect arrived while the attempt was running.
    pub fn complete(mut self, success: bool) -> Result<()> {
        match self.status.take() {
            Some(status) => status.connected(success, self.reconnect),
            None => Ok(()),
        }
    }
}

impl Drop for ConnectCompletion {
    fn drop(&mut self) {
        if let Some(status) = self.status.take() {
            let _ = status.connected(false, self.reconnect);
        }
    }
}

#[must_use]
#[derive(Debug)]
pub struct DisconnectCompletion {
    status: Option<Arc<ConnectionStatus>>,
}

impl DisconnectCompletion {
    pub fn complete(mut self) {
        if let Some(status) = self.status.take() {
            status.disconnection_completed();
        }
    }
}

impl Drop for DisconnectCompletion {
    fn drop(&mut self) {
        if let Some(status) = self.status.take() {
            status.disconnection_completed();
        }
    }
}

#[must_use]
#[derive(Debug)]
pub struct LostHandler {
    status: Option<Arc<ConnectionStatus>>,
    reconnect_requested: bool,
}

impl LostHandler {
    pub fn reconnect_requested(&self) -> bool {
        self.reconnect_requested
    }

    /// `Ok(Some(..))` only when a reconnect was requested, `proceed` is true
    /// and no disconnect arrived meanwhile. A disconnect that arrived during
    /// teardown yields `DisconnectionRequested`.
    pub fn proceed(mut self, proceed: bool) -> Result<Option<ConnectCompletion>> {
        match self.status.take() {
            Some(status) => status.lost_handled(proceed, self.reconnect_requested),
            None => Ok(None),
        }
    }
}

impl Drop for LostHandler {
    fn drop(&mut self) {
        if let Some(status) = self.status.take() {
            let _ = status.lost_handled(false, self.reconnect_requested);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_connect_success_and_failure() {
        let status = ConnectionStatus::new();
        let completion = status.connecting().unwrap();
        assert_eq!(status.status(), Status::Connecting);
        assert!(status.is_connection_open());
        completion.complete(true).unwrap();
        assert!(status.is_connected());

        assert_eq!(status.connecting().unwrap_err(), MqttError::AlreadyConnected);

        let status = ConnectionStatus::new();
        status.connecting().unwrap().complete(false).unwrap();
        assert_eq!(status.status(), Status::Disconnected);
    }

    #[test]
    fn test_dropped_completion_fails_connect() {
        let status = ConnectionStatus::new();
        drop(status.connecting().unwrap());
        assert_eq!(status.status(), Status::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_when_disconnected() {
        let status = ConnectionStatus::new();
        assert_eq!(
            status.disconnecting().await.unwrap_err(),
            MqttError::AlreadyDisconnected
        );
    }

    #[tokio::test]
    async fn test_graceful_disconnect() {
        let status = ConnectionStatus::new();
        status.connecting().unwrap().complete(true).unwrap();
        let done = status.disconnecting().await.unwrap();
        assert_eq!(status.status(), Status::Disconnecting);
        done.complete();
        assert_eq!(status.status(), Status::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_aborts() {
        let status = ConnectionStatus::new();
        let completion = status.connecting().unwrap();

        let disconnecting = {
            let status = Arc::clone(&status);
            tokio::spawn(async move { status.disconnecting().await })
        };
        while status.status() != Status::Disconnecting {
            tokio::task::yield_now().await;
        }

        assert_eq!(completion.complete(true), Err(MqttError::AbortedConnection));
        let done = disconnecting.await.unwrap().unwrap();
        done.complete();
        assert_eq!(status.status(), Status::Disconnected);
    }

    #[tokio::test]
    async fn test_lost_then_reconnect() {
        let status = ConnectionStatus::new();
        status.connecting().unwrap().complete(true).unwrap();

        let handler = status.connection_lost(true).await.unwrap();
        assert_eq!(status.status(), Status::Disconnecting);
        assert_eq!(
            status.connection_lost(true).await.unwrap_err(),
            MqttError::DisconnectionInProgress
        );

        let completion = handler.proceed(true).unwrap().unwrap();
        assert!(completion.is_reconnect());
        assert_eq!(status.status(), Status::Reconnecting);
        completion.complete(true).unwrap();
        assert!(status.is_connected());
    }

    #[tokio::test]
    async fn test_lost_without_reconnect() {
        let status = ConnectionStatus::new();
        status.connecting().unwrap().complete(true).unwrap();
        let handler = status.connection_lost(false).await.unwrap();
        assert!(handler.proceed(true).unwrap().is_none());
        assert_eq!(status.status(), Status::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_during_lost_handling_cancels_reconnect() {
        let status = ConnectionStatus::new();
        status.connecting().unwrap().complete(true).unwrap();
        let handler = status.connection_lost(true).await.unwrap();

        let disconnecting = {
            let status = Arc::clone(&status);
            tokio::spawn(async move { status.disconnecting().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            handler.proceed(true).unwrap_err(),
            MqttError::DisconnectionRequested
        );
        assert_eq!(
            disconnecting.await.unwrap().unwrap_err(),
            MqttError::AlreadyDisconnected
        );
        assert_eq!(status.status(), Status::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_during_reconnect() {
        let status = ConnectionStatus::new();
        status.connecting().unwrap().complete(true).unwrap();
        let completion = status
            .connection_lost(true)
            .await
            .unwrap()
            .proceed(true)
            .unwrap()
            .unwrap();

        let disconnecting = {
            let status = Arc::clone(&status);
            tokio::spawn(async move { status.disconnecting().await })
        };
        while status.status() != Status::Disconnecting {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            completion.complete(true),
            Err(MqttError::DisconnectionRequested)
        );
        disconnecting.await.unwrap().unwrap().complete();
        assert_eq!(status.status(), Status::Disconnected);
    }

    #[tokio::test]
    async fn test_observed_status() {
        let status = ConnectionStatus::new();
        let mut rx = status.subscribe();
        status.connecting().unwrap().complete(true).unwrap();
        rx.wait_for(|s| *s == Status::Connected).await.unwrap();
    }
}
