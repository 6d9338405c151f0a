#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::type_complexity)]

//! Asynchronous MQTT client for MQTT 3.1, 3.1.1 and 5.0 brokers.
//!
//! ```rust,no_run
//! use mqttkit::{ClientOptions, MqttClient, QoS};
//!
//! # async fn run() -> mqttkit::Result<()> {
//! let options = ClientOptions::new("sensor-7").add_broker("tcp://localhost:1883")?;
//! let client = MqttClient::new(options);
//!
//! let token = client.connect();
//! token.wait().await;
//! if let Some(err) = token.error() {
//!     return Err(err);
//! }
//!
//! client
//!     .publish("sensors/7/temperature", QoS::AtLeastOnce, false, "21.5")
//!     .await
//!     .wait()
//!     .await;
//! client.disconnect(std::time::Duration::from_millis(250)).wait().await;
//! # Ok(())
//! # }
//! ```
//!
//! Every operation returns a [`Token`] that completes once the broker has
//! acknowledged the flow (or the flow failed). Outbound QoS 1 and 2 state
//! lives in a [`Store`] so in-flight messages survive reconnects, and with a
//! [`FileStore`], process restarts.

pub mod backoff;
pub mod client;
pub mod message_ids;
pub mod options;
pub mod router;
pub mod status;
pub mod store;
pub mod token;
pub mod transport;

pub use mqttkit_protocol as protocol;
pub use mqttkit_protocol::packet::LastWill;
pub use mqttkit_protocol::{
    ConnectReturnCode, ErrorKind, MqttError, Properties, ProtocolVersion, QoS, Result,
};

pub use client::MqttClient;
pub use options::ClientOptions;
pub use router::{Message, MessageHandler};
pub use status::Status;
pub use store::{FileStore, MemoryStore, OrderedMemoryStore, Store};
pub use token::{
    ConnectOutcome, ConnectToken, DisconnectToken, PublishToken, SubscribeOutcome,
    SubscribeToken, Token, UnsubscribeToken,
};
