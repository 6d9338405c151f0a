//! One-shot completion handles returned by every client operation.
//!
//! A token is completed exactly once, by whichever task finishes the flow
//! (the logic task on ACK, a writer on QoS 0 write, the orchestrator on
//! CONNACK or teardown). Any number of clones may wait on it.

use mqttkit_protocol::{ConnectReturnCode, MqttError, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct TokenInner<T> {
    state: watch::Sender<Option<Result<T>>>,
    packet_id: AtomicU16,
}

pub struct Token<T> {
    inner: Arc<TokenInner<T>>,
}

impl<T> Clone for Token<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Token<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("complete", &self.inner.state.borrow().is_some())
            .field("packet_id", &self.inner.packet_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Clone> Default for Token<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Token<T> {
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            inner: Arc::new(TokenInner {
                state,
                packet_id: AtomicU16::new(0),
            }),
        }
    }

    pub(crate) fn failed(err: MqttError) -> Self {
        let token = Self::new();
        token.complete(Err(err));
        token
    }

    /// Returns `false` if the token had already been completed; the first
    /// outcome always wins.
    pub(crate) fn complete(&self, outcome: Result<T>) -> bool {
        let mut outcome = Some(outcome);
        self.inner.state.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub(crate) fn fail(&self, err: MqttError) -> bool {
        self.complete(Err(err))
    }

    pub(crate) fn set_packet_id(&self, packet_id: u16) {
        self.inner.packet_id.store(packet_id, Ordering::Release);
    }

    /// Waits for completion. Always returns `true`; the return value exists
    /// so `wait` and [`wait_timeout`](Self::wait_timeout) read alike.
    pub async fn wait(&self) -> bool {
        let mut rx = self.inner.state.subscribe();
        let completed = rx.wait_for(Option::is_some).await.is_ok();
        completed
    }

    /// `false` if `timeout` elapsed before completion.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait())
            .await
            .unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.borrow().is_some()
    }

    /// The failure, if the token completed with one.
    pub fn error(&self) -> Option<MqttError> {
        match &*self.inner.state.borrow() {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// `None` until the token completes.
    pub fn result(&self) -> Option<Result<T>> {
        self.inner.state.borrow().clone()
    }

    /// Packet identifier assigned to the flow, or 0 when none was needed.
    pub fn packet_id(&self) -> u16 {
        self.inner.packet_id.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub return_code: ConnectReturnCode,
    pub session_present: bool,
}

/// Per-filter SUBACK return codes. Codes of 0x80 and above are refusals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub granted: BTreeMap<String, u8>,
}

pub type ConnectToken = Token<ConnectOutcome>;
pub type PublishToken = Token<()>;
pub type SubscribeToken = Token<SubscribeOutcome>;
pub type UnsubscribeToken = Token<()>;
pub type DisconnectToken = Token<()>;

impl Token<ConnectOutcome> {
    /// The CONNACK return code, or the refusal that failed the connect.
    pub fn return_code(&self) -> Option<ConnectReturnCode> {
        match self.result()? {
            Ok(outcome) => Some(outcome.return_code),
            Err(MqttError::ConnectionRefused(code)) => Some(code),
            Err(MqttError::BadUsernameOrPassword) => Some(ConnectReturnCode::BadUsernameOrPassword),
            Err(MqttError::NotAuthorized) => Some(ConnectReturnCode::NotAuthorized),
            Err(_) => None,
        }
    }

    pub fn session_present(&self) -> bool {
        matches!(self.result(), Some(Ok(outcome)) if outcome.session_present)
    }
}

impl Token<SubscribeOutcome> {
    pub fn granted_qos(&self) -> BTreeMap<String, u8> {
        match self.result() {
            Some(Ok(outcome)) => outcome.granted,
            _ => BTreeMap::new(),
        }
    }
}
