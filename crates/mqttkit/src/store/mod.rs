//! Persistence for in-flight QoS 1 and 2 state.
//!
//! Keys are `o.<id>` for flows this client started (PUBLISH, PUBREL,
//! SUBSCRIBE, UNSUBSCRIBE awaiting their ACK) and `i.<id>` for inbound QoS 2
//! flows awaiting PUBREL or PUBCOMP. The client writes an entry before the
//! packet goes on the wire and deletes it once the flow terminates, so on
//! reconnect everything in the store is exactly what must be resumed.

mod file;
mod memory;
mod ordered;


pub use file::FileStore;
pub use memory::MemoryStore;
pub use ordered::OrderedMemoryStore;

use futures::future::BoxFuture;
use mqttkit_protocol::{Packet, Result};

const INBOUND_PREFIX: &str = "i.";
const OUTBOUND_PREFIX: &str = "o.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[must_use]
pub fn inbound_key(packet_id: u16) -> String {
    format!("{INBOUND_PREFIX}{packet_id}")
}

#[must_use]
pub fn outbound_key(packet_id: u16) -> String {
    format!("{OUTBOUND_PREFIX}{packet_id}")
}

/// Splits a store key into its direction and packet identifier.
#[must_use]
pub fn parse_key(key: &str) -> Option<(Direction, u16)> {
    let (direction, id) = if let Some(id) = key.strip_prefix(INBOUND_PREFIX) {
        (Direction::Inbound, id)
    } else {
        (Direction::Outbound, key.strip_prefix(OUTBOUND_PREFIX)?)
    };
    match id.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(packet_id) => Some((direction, packet_id)),
    }
}

/// Key/value store of control packets.
///
/// Implementations lock internally; every method takes `&self` and returns
/// a boxed future so a store can be shared as `Arc<dyn Store>`. Operations
/// before [`open`](Store::open) or after [`close`](Store::close) fail with
/// `MqttError::Persistence`.
pub trait Store: Send + Sync {
    /// Idempotent.
    fn open(&self) -> BoxFuture<'_, Result<()>>;

    fn put<'a>(&'a self, key: &'a str, packet: &'a Packet) -> BoxFuture<'a, Result<()>>;

    /// `Ok(None)` when the key is absent.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Packet>>>;

    fn all(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Deleting an absent key is not an error.
    fn del<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;

    fn close(&self) -> BoxFuture<'_, ()>;

    /// Removes every entry.
    fn reset(&self) -> BoxFuture<'_, Result<()>>;
}

pub(crate) fn not_open() -> mqttkit_protocol::MqttError {
    mqttkit_protocol::MqttError::Persistence("store is not open".to_string())
}
