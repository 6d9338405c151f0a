use super::{not_open, Store};
use futures::future::{self, BoxFuture, FutureExt};
use mqttkit_protocol::{Packet, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct State {
    opened: bool,
    messages: HashMap<String, Packet>,
}

impl State {
    fn check_open(&self) -> Result<()> {
        if self.opened {
            Ok(())
        } else {
            Err(not_open())
        }
    }
}

/// Unordered in-memory store. Contents survive `close` and a later `open`,
/// so a client reusing the store resumes its flows; they do not survive the
/// process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn put_now(&self, key: &str, packet: &Packet) -> Result<()> {
        let mut state = self.state.write();
        state.check_open()?;
        state.messages.insert(key.to_string(), packet.clone());
        Ok(())
    }

    fn get_now(&self, key: &str) -> Result<Option<Packet>> {
        let state = self.state.read();
        state.check_open()?;
        Ok(state.messages.get(key).cloned())
    }

    fn all_now(&self) -> Result<Vec<String>> {
        let state = self.state.read();
        state.check_open()?;
        Ok(state.messages.keys().cloned().collect())
    }

    fn del_now(&self, key: &str) -> Result<()> {
        let mut state = self.state.write();
        state.check_open()?;
        if state.messages.remove(key).is_none() {
            tracing::trace!(key, "Deleting absent key");
        }
        Ok(())
    }

    fn reset_now(&self) -> Result<()> {
        let mut state = self.state.write();
        state.check_open()?;
        state.messages.clear();
        Ok(())
    }
}

impl Store for MemoryStore {
    fn open(&self) -> BoxFuture<'_, Result<()>> {
        self.state.write().opened = true;
        future::ready(Ok(())).boxed()
    }

    fn put<'a>(&'a self, key: &'a str, packet: &'a Packet) -> BoxFuture<'a, Result<()>> {
        future::ready(self.put_now(key, packet)).boxed()
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Packet>>> {
        future::ready(self.get_now(key)).boxed()
    }

    fn all(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        future::ready(self.all_now()).boxed()
    }

    fn del<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        future::ready(self.del_now(key)).boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.state.write().opened = false;
        future::ready(()).boxed()
    }

    fn reset(&self) -> BoxFuture<'_, Result<()>> {
        future::ready(self.reset_now()).boxed()
    }
}
