//! Single-writer mutation and reload discipline over [`ServiceConfig`].
//!
//! Mutations never install their result directly: they persist through
//! the [`ConfigPersister`], whose change signal drives the one install
//! path shared with externally originated edits.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tokio::sync::Mutex;

use crate::config::{apply_defaults, validate, ConfigPersister, ServiceConfig};
use crate::error::{ConfigError, PersistError};

/// Holds the live config snapshot and mediates all writes.
pub struct ConfigPipeline {
    persister: Arc<dyn ConfigPersister>,
    current: ArcSwap<ServiceConfig>,
    /// Highest version handed to the persister; keeps versions strictly
    /// increasing even while earlier writes are still propagating back
    /// through the watch loop.
    submitted: Mutex<u64>,
}

impl ConfigPipeline {
    pub fn new(persister: Arc<dyn ConfigPersister>) -> Self {
        Self {
            persister,
            current: ArcSwap::from_pointee(ServiceConfig::with_defaults()),
            submitted: Mutex::new(0),
        }
    }

    /// The config most recently loaded from the persister.
    pub fn current(&self) -> Arc<ServiceConfig> {
        self.current.load_full()
    }

    /// Subscribe to the persister's change signal.
    pub fn watch(&self) -> broadcast::Receiver<()> {
        self.persister.watch()
    }

    /// Copy-update-persist-notify.
    ///
    /// `edit` runs against a deep clone of the live config; the result
    /// is defaulted, validated, stamped and handed to the persister.
    /// Installation happens only when the resulting change signal is
    /// consumed by the reload loop.
    pub async fn mutate<F>(&self, user: &str, edit: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut ServiceConfig) -> Result<(), ConfigError>,
    {
        let mut submitted = self.submitted.lock().await;
        let mut draft = ServiceConfig::clone(&self.current.load());
        let base = draft.version.max(*submitted);

        edit(&mut draft)?;
        apply_defaults(&mut draft);
        validate(&draft)?;

        draft.user = user.to_string();
        draft.date = chrono::Utc::now().timestamp();
        draft.version = base + 1;

        let raw = draft
            .to_bytes()
            .map_err(|e| ConfigError::Invalid(format!("could not serialize config: {}", e)))?;
        self.persister.persist_and_notify(raw).await.map_err(|e| match e {
            PersistError::Conflict { submitted, current } => {
                ConfigError::VersionConflict { submitted, current }
            }
            other => ConfigError::PersistenceFailed(other),
        })?;

        *submitted = base + 1;
        tracing::info!(version = base + 1, user = %user, "configuration persisted");
        Ok(())
    }

    /// Read, parse, default and validate the persisted config, and make
    /// it the current snapshot.
    pub async fn load(&self) -> Result<Arc<ServiceConfig>, ConfigError> {
        let raw = self.persister.read().await.map_err(ConfigError::PersistenceFailed)?;
        let mut cfg = ServiceConfig::from_bytes(&raw)
            .map_err(|e| ConfigError::Invalid(format!("could not parse config: {}", e)))?;
        apply_defaults(&mut cfg);
        validate(&cfg)?;
        let cfg = Arc::new(cfg);
        self.current.store(cfg.clone());
        Ok(cfg)
    }

    /// All readable persisted versions, newest version first. Versions
    /// that no longer parse are logged and skipped.
    pub async fn historical(&self) -> Result<Vec<ServiceConfig>, ConfigError> {
        let raws =
            self.persister.read_history().await.map_err(ConfigError::PersistenceFailed)?;
        let mut configs = Vec::with_capacity(raws.len());
        for raw in raws {
            match ServiceConfig::from_bytes(&raw) {
                Ok(cfg) => configs.push(cfg),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable historical config");
                }
            }
        }
        configs.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(configs)
    }
}
