//! Pluggable persistence for the service configuration.
//!
//! A persister is an opaque byte store plus a change signal. The core
//! never interprets the bytes here; parsing and validation live in the
//! pipeline so that a persister can be backed by anything that can
//! hold a blob and fan out a notification.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::error::PersistError;

/// Capacity of the change-signal channel. Signals are coalescible (a
/// reload always reads the latest bytes) so lag is harmless.
pub const CHANGE_SIGNAL_CAPACITY: usize = 16;

/// Storage and change notification for serialized configs.
#[async_trait]
pub trait ConfigPersister: Send + Sync {
    /// Most recently persisted config.
    async fn read(&self) -> Result<Vec<u8>, PersistError>;

    /// Every persisted version, in no particular order.
    async fn read_history(&self) -> Result<Vec<Vec<u8>>, PersistError>;

    /// Durably store `raw` and signal all watchers.
    async fn persist_and_notify(&self, raw: Vec<u8>) -> Result<(), PersistError>;

    /// Subscribe to change signals, one per persisted version.
    fn watch(&self) -> broadcast::Receiver<()>;
}

/// In-memory persister for embedding and tests.
#[derive(Debug)]
pub struct MemoryPersister {
    history: Mutex<Vec<Vec<u8>>>,
    notify: broadcast::Sender<()>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(CHANGE_SIGNAL_CAPACITY);
        Self { history: Mutex::new(Vec::new()), notify }
    }

    /// A persister already holding `raw` as its current config, so a
    /// service can start without waiting for a first persist.
    pub fn with_initial(raw: Vec<u8>) -> Self {
        let persister = Self::new();
        persister.history.lock().expect("persister history lock poisoned").push(raw);
        persister
    }
}

impl Default for MemoryPersister {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigPersister for MemoryPersister {
    async fn read(&self) -> Result<Vec<u8>, PersistError> {
        self.history
            .lock()
            .expect("persister history lock poisoned")
            .last()
            .cloned()
            .ok_or(PersistError::NoConfig)
    }

    async fn read_history(&self) -> Result<Vec<Vec<u8>>, PersistError> {
        Ok(self.history.lock().expect("persister history lock poisoned").clone())
    }

    async fn persist_and_notify(&self, raw: Vec<u8>) -> Result<(), PersistError> {
        self.history.lock().expect("persister history lock poisoned").push(raw);
        // Send fails only with no live watchers, which is fine.
        let _ = self.notify.send(());
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }
}

/// The one field inspected before a write; everything else stays
/// opaque to the persister.
#[derive(Deserialize)]
struct VersionProbe {
    version: u64,
}

fn peek_version(raw: &[u8]) -> Option<u64> {
    serde_json::from_slice::<VersionProbe>(raw).ok().map(|probe| probe.version)
}

/// Filesystem persister: one current file plus an archive directory of
/// prior versions.
///
/// The current config is written via temp-file-and-rename so readers
/// never observe a partial write. A write whose `version` is not newer
/// than the stored one is rejected with [`PersistError::Conflict`], so
/// a mutation drafted from a stale snapshot cannot silently roll back
/// an externally edited file. Bytes without a readable version are
/// stored as-is.
#[derive(Debug)]
pub struct DiskPersister {
    current: PathBuf,
    archive: PathBuf,
    seq: AtomicU64,
    notify: broadcast::Sender<()>,
}

impl DiskPersister {
    /// Open (creating if needed) a persister rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        let archive = dir.join("archive");
        tokio::fs::create_dir_all(&archive).await?;
        let (notify, _) = broadcast::channel(CHANGE_SIGNAL_CAPACITY);
        Ok(Self {
            current: dir.join("config.json"),
            archive,
            seq: AtomicU64::new(0),
            notify,
        })
    }

    fn archive_name(&self) -> String {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("cfg-{:020}-{:06}.json", nanos, seq)
    }
}

#[async_trait]
impl ConfigPersister for DiskPersister {
    async fn read(&self) -> Result<Vec<u8>, PersistError> {
        match tokio::fs::read(&self.current).await {
            Ok(raw) => Ok(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PersistError::NoConfig),
            Err(e) => Err(PersistError::Io(e)),
        }
    }

    async fn read_history(&self) -> Result<Vec<Vec<u8>>, PersistError> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.archive).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.path());
        }
        names.sort();
        let mut history = Vec::with_capacity(names.len());
        for path in names {
            history.push(tokio::fs::read(&path).await?);
        }
        Ok(history)
    }

    async fn persist_and_notify(&self, raw: Vec<u8>) -> Result<(), PersistError> {
        if let Some(submitted) = peek_version(&raw) {
            if let Ok(current_raw) = tokio::fs::read(&self.current).await {
                if let Some(current) = peek_version(&current_raw) {
                    if submitted <= current {
                        return Err(PersistError::Conflict { submitted, current });
                    }
                }
            }
        }
        let tmp = self.current.with_extension("json.tmp");
        tokio::fs::write(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, &self.current).await?;
        tokio::fs::write(self.archive.join(self.archive_name()), &raw).await?;
        let _ = self.notify.send(());
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }
}
