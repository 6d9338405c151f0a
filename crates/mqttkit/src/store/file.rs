//! Directory-of-files store.
//!
//! Each entry is `<dir>/<key>.msg` holding the packet's MQTT 5 wire
//! encoding. Overwrites go through a backup: the current `.msg` is renamed
//! to `.bkp`, the new `.msg` is written, then the `.bkp` is removed. A
//! `.bkp` found on [`open`](Store::open) means a write was interrupted, and
//! it replaces whatever `.msg` is beside it.

use super::{not_open, Store};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use mqttkit_protocol::{MqttError, Packet, ProtocolVersion, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

const MSG_EXT: &str = "msg";
const BKP_EXT: &str = "bkp";
const TMP_EXT: &str = "tmp";

/// MQTT 5 carries every field of every packet variant, so one encoding
/// serves whichever protocol version wrote the entry.
const STORAGE_VERSION: ProtocolVersion = ProtocolVersion::V5;

/// Writers take the lock exclusively so a put and a delete of the same key
/// never interleave their renames.
#[derive(Debug)]
pub struct FileStore {
    directory: PathBuf,
    opened: RwLock<bool>,
}

fn persistence_error(action: &str, path: &Path, e: &std::io::Error) -> MqttError {
    MqttError::Persistence(format!("failed to {action} {}: {e}", path.display()))
}

impl FileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            opened: RwLock::new(false),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path(&self, key: &str, ext: &str) -> PathBuf {
        self.directory.join(format!("{key}.{ext}"))
    }

    fn check_key(key: &str) -> Result<()> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(MqttError::Persistence(format!("invalid store key {key:?}")));
        }
        Ok(())
    }

    /// Keys of every file in the directory with extension `ext`.
    async fn keys_with_extension(&self, ext: &str) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.directory)
            .await
            .map_err(|e| persistence_error("list", &self.directory, &e))?;
        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| persistence_error("list", &self.directory, &e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
            if let Some(key) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }

    /// Promotes interrupted-write backups and removes stray temp files.
    /// Called by `open`.
    pub async fn restore(&self) -> Result<()> {
        for key in self.keys_with_extension(BKP_EXT).await? {
            let backup = self.path(&key, BKP_EXT);
            let target = self.path(&key, MSG_EXT);
            tracing::warn!(key = %key, "Restoring entry from backup after interrupted write");
            fs::rename(&backup, &target)
                .await
                .map_err(|e| persistence_error("restore", &backup, &e))?;
        }
        for key in self.keys_with_extension(TMP_EXT).await? {
            let temp = self.path(&key, TMP_EXT);
            if let Err(e) = fs::remove_file(&temp).await {
                tracing::warn!(path = %temp.display(), error = %e, "Failed to remove temp file");
            }
        }
        Ok(())
    }

    async fn write_file_atomic(&self, key: &str, data: &[u8]) -> Result<()> {
        let temp = self.path(key, TMP_EXT);
        let target = self.path(key, MSG_EXT);

        let mut file = File::create(&temp)
            .await
            .map_err(|e| persistence_error("create", &temp, &e))?;
        file.write_all(data)
            .await
            .map_err(|e| persistence_error("write", &temp, &e))?;
        file.flush()
            .await
            .map_err(|e| persistence_error("flush", &temp, &e))?;
        file.sync_data()
            .await
            .map_err(|e| persistence_error("sync", &temp, &e))?;
        drop(file);

        fs::rename(&temp, &target)
            .await
            .map_err(|e| persistence_error("rename", &temp, &e))
    }

    async fn remove_if_present(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence_error("remove", path, &e)),
        }
    }

    async fn open_dir(&self) -> Result<()> {
        let mut opened = self.opened.write().await;
        if *opened {
            return Ok(());
        }
        fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| persistence_error("create", &self.directory, &e))?;
        self.restore().await?;
        *opened = true;
        tracing::debug!(directory = %self.directory.display(), "Opened file store");
        Ok(())
    }

    async fn put_file(&self, key: &str, packet: &Packet) -> Result<()> {
        let opened = self.opened.write().await;
        if !*opened {
            return Err(not_open());
        }
        Self::check_key(key)?;
        let data = packet.to_bytes(STORAGE_VERSION)?;

        let current = self.path(key, MSG_EXT);
        let backup = self.path(key, BKP_EXT);
        let overwriting = match fs::rename(&current, &backup).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(persistence_error("back up", &current, &e)),
        };
        self.write_file_atomic(key, &data).await?;
        if overwriting {
            Self::remove_if_present(&backup).await?;
        }
        Ok(())
    }

    async fn get_file(&self, key: &str) -> Result<Option<Packet>> {
        let opened = self.opened.read().await;
        if !*opened {
            return Err(not_open());
        }
        Self::check_key(key)?;
        let path = self.path(key, MSG_EXT);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(persistence_error("read", &path, &e)),
        };
        let packet = Packet::decode(&mut Bytes::from(data), STORAGE_VERSION).map_err(|e| {
            MqttError::Persistence(format!("corrupt entry {}: {e}", path.display()))
        })?;
        Ok(Some(packet))
    }

    async fn all_files(&self) -> Result<Vec<String>> {
        let opened = self.opened.read().await;
        if !*opened {
            return Err(not_open());
        }
        self.keys_with_extension(MSG_EXT).await
    }

    async fn del_file(&self, key: &str) -> Result<()> {
        let opened = self.opened.write().await;
        if !*opened {
            return Err(not_open());
        }
        Self::check_key(key)?;
        Self::remove_if_present(&self.path(key, MSG_EXT)).await?;
        Self::remove_if_present(&self.path(key, BKP_EXT)).await
    }

    async fn reset_dir(&self) -> Result<()> {
        let opened = self.opened.write().await;
        if !*opened {
            return Err(not_open());
        }
        for ext in [MSG_EXT, BKP_EXT, TMP_EXT] {
            for key in self.keys_with_extension(ext).await? {
                Self::remove_if_present(&self.path(&key, ext)).await?;
            }
        }
        Ok(())
    }
}

impl Store for FileStore {
    fn open(&self) -> BoxFuture<'_, Result<()>> {
        self.open_dir().boxed()
    }

    fn put<'a>(&'a self, key: &'a str, packet: &'a Packet) -> BoxFuture<'a, Result<()>> {
        self.put_file(key, packet).boxed()
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Packet>>> {
        self.get_file(key).boxed()
    }

    fn all(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        self.all_files().boxed()
    }

    fn del<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        self.del_file(key).boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            *self.opened.write().await = false;
        }
        .boxed()
    }

    fn reset(&self) -> BoxFuture<'_, Result<()>> {
        self.reset_dir().boxed()
    }
}
