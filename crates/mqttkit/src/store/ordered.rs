use super::{not_open, Store};
use futures::future::{self, BoxFuture, FutureExt};
use mqttkit_protocol::{Packet, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct State {
    opened: bool,
    next_seq: u64,
    messages: HashMap<String, (u64, Packet)>,
}

/// In-memory store whose [`all`](Store::all) lists keys in the order they
/// were first written. Overwriting a key keeps its position.
#[derive(Debug, Default)]
pub struct OrderedMemoryStore {
    state: RwLock<State>,
}

impl OrderedMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> Result<T> {
        let mut state = self.state.write();
        if !state.opened {
            return Err(not_open());
        }
        Ok(f(&mut state))
    }
}

impl Store for OrderedMemoryStore {
    fn open(&self) -> BoxFuture<'_, Result<()>> {
        self.state.write().opened = true;
        future::ready(Ok(())).boxed()
    }

    fn put<'a>(&'a self, key: &'a str, packet: &'a Packet) -> BoxFuture<'a, Result<()>> {
        let result = self.with_state(|state| {
            let seq = match state.messages.get(key) {
                Some((seq, _)) => *seq,
                None => {
                    state.next_seq += 1;
                    state.next_seq
                }
            };
            state.messages.insert(key.to_string(), (seq, packet.clone()));
        });
        future::ready(result).boxed()
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Packet>>> {
        let result =
            self.with_state(|state| state.messages.get(key).map(|(_, packet)| packet.clone()));
        future::ready(result).boxed()
    }

    fn all(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        let result = self.with_state(|state| {
            let mut keys: Vec<(u64, &String)> = state
                .messages
                .iter()
                .map(|(key, (seq, _))| (*seq, key))
                .collect();
            keys.sort_unstable_by_key(|(seq, _)| *seq);
            keys.into_iter().map(|(_, key)| key.clone()).collect()
        });
        future::ready(result).boxed()
    }

    fn del<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        let result = self.with_state(|state| {
            state.messages.remove(key);
        });
        future::ready(result).boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.state.write().opened = false;
        future::ready(()).boxed()
    }

    fn reset(&self) -> BoxFuture<'_, Result<()>> {
        let result = self.with_state(|state| state.messages.clear());
        future::ready(result).boxed()
    }
}
