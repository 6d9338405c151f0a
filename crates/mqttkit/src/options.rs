//! Client configuration.

use crate::client::MqttClient;
use crate::router::MessageHandler;
use crate::store::{MemoryStore, Store};
use crate::transport::{self, BoxedStream};
use bytes::Bytes;
use futures::future::BoxFuture;
use mqttkit_protocol::constants::DEFAULT_MAX_PACKET_SIZE;
use mqttkit_protocol::packet::LastWill;
use mqttkit_protocol::{MqttError, Properties, ProtocolVersion, Result};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Runs after every successful connect and reconnect.
pub type OnConnectHandler = Arc<dyn Fn(&MqttClient) + Send + Sync>;

/// Runs once a lost connection has been torn down, before any reconnect.
pub type ConnectionLostHandler = Arc<dyn Fn(&MqttClient, &MqttError) + Send + Sync>;

/// Runs before each reconnect attempt and may adjust the options used for it.
pub type ReconnectHandler = Arc<dyn Fn(&MqttClient, &mut ClientOptions) + Send + Sync>;

/// Runs before dialing each broker and returns the TLS configuration to use.
pub type ConnectionAttemptHandler = Arc<
    dyn Fn(&Url, Option<Arc<rustls::ClientConfig>>) -> Option<Arc<rustls::ClientConfig>>
        + Send
        + Sync,
>;

/// Supplies username and password on every connect attempt.
pub type CredentialsProvider = Arc<dyn Fn() -> (Option<String>, Option<Bytes>) + Send + Sync>;

/// Replaces the built-in dialers.
pub type OpenConnectionFn = Arc<dyn Fn(Url) -> BoxFuture<'static, Result<BoxedStream>> + Send + Sync>;

#[derive(Clone)]
pub struct ClientOptions {
    pub servers: Vec<Url>,
    pub randomize_brokers: bool,
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
    pub clean_session: bool,
    /// Run handlers on the logic task, in arrival order, before the ACK is
    /// sent. When false each message is handed to a spawned task.
    pub order_matters: bool,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub credentials_provider: Option<CredentialsProvider>,
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// Zero disables keepalive.
    pub keep_alive: Duration,
    /// How long a PINGREQ may go unanswered. `None` means half of
    /// `keep_alive`.
    pub ping_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Zero disables the per-write deadline.
    pub write_timeout: Duration,
    pub connect_retry: bool,
    pub connect_retry_interval: Duration,
    pub auto_reconnect: bool,
    pub max_reconnect_interval: Duration,
    pub resume_subs: bool,
    /// Zero means unlimited.
    pub max_resume_pub_in_flight: usize,
    pub store: Arc<dyn Store>,
    pub on_connect: Option<OnConnectHandler>,
    pub on_connection_lost: Option<ConnectionLostHandler>,
    pub on_reconnecting: Option<ReconnectHandler>,
    pub on_connect_attempt: Option<ConnectionAttemptHandler>,
    pub custom_open_connection: Option<OpenConnectionFn>,
    pub default_publish_handler: Option<MessageHandler>,
    /// MQTT 5 CONNECT properties.
    pub connect_properties: Properties,
    pub max_packet_size: usize,
    /// Capacity of the outbound publish queue.
    pub message_channel_depth: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            randomize_brokers: false,
            client_id: String::new(),
            protocol_version: ProtocolVersion::V311,
            clean_session: true,
            order_matters: true,
            will: None,
            username: None,
            password: None,
            credentials_provider: None,
            tls_config: None,
            keep_alive: Duration::from_secs(30),
            ping_timeout: None,
            connect_timeout: Duration::from_secs(30),
            write_timeout: Duration::ZERO,
            connect_retry: false,
            connect_retry_interval: Duration::from_secs(30),
            auto_reconnect: true,
            max_reconnect_interval: Duration::from_secs(10 * 60),
            resume_subs: false,
            max_resume_pub_in_flight: 0,
            store: Arc::new(MemoryStore::new()),
            on_connect: None,
            on_connection_lost: None,
            on_reconnecting: None,
            on_connect_attempt: None,
            custom_open_connection: None,
            default_publish_handler: None,
            connect_properties: Properties::new(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            message_channel_depth: 100,
        }
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let servers: Vec<&str> = self.servers.iter().map(Url::as_str).collect();
        f.debug_struct("ClientOptions")
            .field("servers", &servers)
            .field("client_id", &self.client_id)
            .field("protocol_version", &self.protocol_version)
            .field("clean_session", &self.clean_session)
            .field("order_matters", &self.order_matters)
            .field("will", &self.will.as_ref().map(|w| &w.topic))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls_config.is_some())
            .field("keep_alive", &self.keep_alive)
            .field("ping_timeout", &self.effective_ping_timeout())
            .field("connect_timeout", &self.connect_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("connect_retry", &self.connect_retry)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("resume_subs", &self.resume_subs)
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// Appends a broker URI. Accepted schemes are `tcp`/`mqtt`,
    /// `ssl`/`tls`/`tcps`/`mqtts`, `ws`, `wss` and `unix`.
    ///
    /// # Errors
    /// `Configuration` if the URI does not parse or the scheme is unknown.
    pub fn add_broker(mut self, uri: &str) -> Result<Self> {
        let url = Url::parse(uri)
            .map_err(|e| MqttError::Configuration(format!("invalid broker URI {uri:?}: {e}")))?;
        if !transport::is_supported_scheme(url.scheme()) {
            return Err(MqttError::Configuration(format!(
                "unsupported broker scheme {:?}",
                url.scheme()
            )));
        }
        self.servers.push(url);
        Ok(self)
    }

    #[must_use]
    pub fn with_randomized_brokers(mut self, randomize: bool) -> Self {
        self.randomize_brokers = randomize;
        self
    }

    #[must_use]
    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    #[must_use]
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    #[must_use]
    pub fn with_order_matters(mut self, order_matters: bool) -> Self {
        self.order_matters = order_matters;
        self
    }

    #[must_use]
    pub fn with_will(mut self, will: LastWill) -> Self {
        self.will = Some(will);
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl AsRef<[u8]>) -> Self {
        self.username = Some(username.into());
        self.password = Some(Bytes::copy_from_slice(password.as_ref()));
        self
    }

    #[must_use]
    pub fn with_credentials_provider(mut self, provider: CredentialsProvider) -> Self {
        self.credentials_provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Overrides how long a PINGREQ may go unanswered before the
    /// connection is dropped. Without this the timeout is half of the
    /// keepalive interval, and follows later changes to `keep_alive`.
    #[must_use]
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_retry(mut self, retry: bool, interval: Duration) -> Self {
        self.connect_retry = retry;
        self.connect_retry_interval = interval;
        self
    }

    #[must_use]
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    #[must_use]
    pub fn with_max_reconnect_interval(mut self, interval: Duration) -> Self {
        self.max_reconnect_interval = interval;
        self
    }

    #[must_use]
    pub fn with_resume_subs(mut self, resume: bool) -> Self {
        self.resume_subs = resume;
        self
    }

    #[must_use]
    pub fn with_max_resume_pub_in_flight(mut self, limit: usize) -> Self {
        self.max_resume_pub_in_flight = limit;
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_on_connect(mut self, handler: OnConnectHandler) -> Self {
        self.on_connect = Some(handler);
        self
    }

    #[must_use]
    pub fn with_on_connection_lost(mut self, handler: ConnectionLostHandler) -> Self {
        self.on_connection_lost = Some(handler);
        self
    }

    #[must_use]
    pub fn with_on_reconnecting(mut self, handler: ReconnectHandler) -> Self {
        self.on_reconnecting = Some(handler);
        self
    }

    #[must_use]
    pub fn with_on_connect_attempt(mut self, handler: ConnectionAttemptHandler) -> Self {
        self.on_connect_attempt = Some(handler);
        self
    }

    #[must_use]
    pub fn with_custom_open_connection(mut self, open: OpenConnectionFn) -> Self {
        self.custom_open_connection = Some(open);
        self
    }

    #[must_use]
    pub fn with_default_publish_handler(mut self, handler: MessageHandler) -> Self {
        self.default_publish_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn with_connect_properties(mut self, properties: Properties) -> Self {
        self.connect_properties = properties;
        self
    }

    #[must_use]
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    #[must_use]
    pub fn with_message_channel_depth(mut self, depth: usize) -> Self {
        self.message_channel_depth = depth.max(1);
        self
    }

    /// Keepalive declares the connection dead once a PINGREQ has been
    /// outstanding this long.
    pub fn effective_ping_timeout(&self) -> Duration {
        self.ping_timeout.unwrap_or(self.keep_alive / 2)
    }

    /// Keepalive in whole seconds as CONNECT carries it.
    pub fn keep_alive_secs(&self) -> u16 {
        u16::try_from(self.keep_alive.as_secs()).unwrap_or(u16::MAX)
    }

    /// Username and password for the next attempt, preferring the provider.
    pub(crate) fn credentials(&self) -> (Option<String>, Option<Bytes>) {
        match &self.credentials_provider {
            Some(provider) => provider(),
            None => (self.username.clone(), self.password.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ClientOptions::new("c1");
        assert_eq!(options.client_id, "c1");
        assert!(options.clean_session);
        assert!(options.order_matters);
        assert!(options.auto_reconnect);
        assert_eq!(options.protocol_version, ProtocolVersion::V311);
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
        assert_eq!(options.effective_ping_timeout(), Duration::from_secs(15));
        assert_eq!(options.keep_alive_secs(), 30);
    }

    #[test]
    fn test_ping_timeout_follows_keep_alive_until_set() {
        let options = ClientOptions::new("c").with_keep_alive(Duration::from_secs(10));
        assert_eq!(options.effective_ping_timeout(), Duration::from_secs(5));

        let options = options.with_ping_timeout(Duration::from_secs(2));
        assert_eq!(options.effective_ping_timeout(), Duration::from_secs(2));
        let options = options.with_keep_alive(Duration::from_secs(60));
        assert_eq!(options.effective_ping_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_add_broker() {
        let options = ClientOptions::new("c")
            .add_broker("tcp://localhost:1883")
            .unwrap()
            .add_broker("wss://example.com/mqtt")
            .unwrap();
        assert_eq!(options.servers.len(), 2);
        assert_eq!(options.servers[1].scheme(), "wss");

        assert!(matches!(
            ClientOptions::new("c").add_broker("not a uri"),
            Err(MqttError::Configuration(_))
        ));
        assert!(matches!(
            ClientOptions::new("c").add_broker("http://example.com"),
            Err(MqttError::Configuration(_))
        ));
    }

    #[test]
    fn test_credentials_provider_wins() {
        let options = ClientOptions::new("c")
            .with_credentials("static", "pw")
            .with_credentials_provider(Arc::new(|| (Some("dynamic".to_string()), None)));
        assert_eq!(options.credentials(), (Some("dynamic".to_string()), None));

        let options = ClientOptions::new("c").with_credentials("static", "pw");
        assert_eq!(
            options.credentials(),
            (Some("static".to_string()), Some(Bytes::from_static(b"pw")))
        );
    }

    #[test]
    fn test_keep_alive_saturates() {
        let options = ClientOptions::new("c").with_keep_alive(Duration::from_secs(100_000));
        assert_eq!(options.keep_alive_secs(), u16::MAX);
    }

    #[test]
    fn test_debug_redacts_password() {
        let options = ClientOptions::new("c").with_credentials("u", "secret");
        let debug = format!("{options:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("<redacted>"));
    }
}
