//! Settings store: local cache in front of an opaque durable key-value backend.
//!
//! The cache is authoritative. `set` updates it first and then attempts the
//! durable write; a failed write keeps the new value, flags the store as
//! degraded, and emits `SessionEvent::PersistenceFailed`. Callers still get
//! the error back so they can surface it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use veil_core::PersistenceError;

use crate::bus::{EventBus, SessionEvent};

/// Chosen project/storage folder.
pub const STORAGE_FOLDER: &str = "storage.folder";
/// Whether bootstrap routes through the anonymizing transport.
pub const TRANSPORT_ANONYMIZE: &str = "transport.anonymize";
/// JSON list of joined communities.
pub const COMMUNITY_MEMBERSHIPS: &str = "communities.memberships";

/// The durable store. Implementations may block briefly; calls are rare.
pub trait KeyValueBackend: Send + Sync {
    fn read(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn write(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn keys(&self) -> anyhow::Result<Vec<String>>;
}

// ── File backend ──────────────────────────────────────────────────────────────

/// JSON object on disk. Every write rewrites the file via temp + rename.
pub struct FileBackend {
    path: PathBuf,
    values: Mutex<Option<BTreeMap<String, String>>>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            values: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn load_locked(&self, slot: &mut Option<BTreeMap<String, String>>) -> anyhow::Result<()> {
        if slot.is_some() {
            return Ok(());
        }
        let map = match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("invalid settings file: {}", self.path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        *slot = Some(map);
        Ok(())
    }
}

impl KeyValueBackend for FileBackend {
    fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut slot = self.values.lock();
        self.load_locked(&mut slot)?;
        Ok(slot.as_ref().and_then(|m| m.get(key).cloned()))
    }

    fn write(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut slot = self.values.lock();
        self.load_locked(&mut slot)?;
        let mut next = slot.clone().unwrap_or_default();
        next.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(&next)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        *slot = Some(next);
        Ok(())
    }

    fn keys(&self) -> anyhow::Result<Vec<String>> {
        let mut slot = self.values.lock();
        self.load_locked(&mut slot)?;
        Ok(slot
            .as_ref()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }
}

// ── Memory backend ────────────────────────────────────────────────────────────

/// In-process backend. `set_unreachable(true)` makes every call fail, to
/// exercise degraded operation.
#[derive(Default)]
pub struct MemoryBackend {
    values: Mutex<BTreeMap<String, String>>,
    unreachable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            anyhow::bail!("durable store unreachable");
        }
        Ok(())
    }
}

impl KeyValueBackend for MemoryBackend {
    fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.check()?;
        Ok(self.values.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.check()?;
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn keys(&self) -> anyhow::Result<Vec<String>> {
        self.check()?;
        Ok(self.values.lock().keys().cloned().collect())
    }
}

// ── Settings store ────────────────────────────────────────────────────────────

pub struct SettingsStore {
    cache: DashMap<String, String>,
    backend: Arc<dyn KeyValueBackend>,
    degraded: AtomicBool,
    bus: EventBus<SessionEvent>,
}

impl SettingsStore {
    /// Build the store and pull every durable value into the cache.
    /// An unreadable backend leaves the cache empty and the store degraded.
    pub fn load(backend: Arc<dyn KeyValueBackend>, bus: EventBus<SessionEvent>) -> Self {
        let store = Self {
            cache: DashMap::new(),
            backend,
            degraded: AtomicBool::new(false),
            bus,
        };

        match store.backend.keys() {
            Ok(keys) => {
                for key in keys {
                    match store.backend.read(&key) {
                        Ok(Some(value)) => {
                            store.cache.insert(key, value);
                        }
                        Ok(None) => {}
                        Err(e) => store.degrade(PersistenceError::ReadFailed {
                            key,
                            reason: format!("{e:#}"),
                        }),
                    }
                }
                tracing::debug!(count = store.cache.len(), "settings loaded");
            }
            Err(e) => store.degrade(PersistenceError::ReadFailed {
                key: "*".into(),
                reason: format!("{e:#}"),
            }),
        }
        store
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.cache.get(key).map(|v| v.value().clone())
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_str(&v).ok())
    }

    /// Write-through update. The cache always takes the new value and a
    /// `SettingChanged` event always fires; the error only reports that the
    /// durable copy is behind.
    pub fn set(&self, key: &str, value: impl Into<String>) -> Result<(), PersistenceError> {
        let value = value.into();
        let previous = self.cache.insert(key.to_string(), value.clone());

        let result = self.backend.write(key, &value).map_err(|e| {
            PersistenceError::WriteFailed {
                key: key.to_string(),
                reason: format!("{e:#}"),
            }
        });
        if let Err(e) = &result {
            self.degrade(e.clone());
        }

        if previous.as_deref() != Some(value.as_str()) {
            tracing::debug!(key, "setting changed");
            self.bus.publish(&SessionEvent::SettingChanged {
                key: key.to_string(),
                value,
            });
        }
        result
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PersistenceError> {
        let text = serde_json::to_string(value).map_err(|e| PersistenceError::WriteFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.set(key, text)
    }

    pub fn all(&self) -> BTreeMap<String, String> {
        self.cache
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// True once any durable read or write has failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn degrade(&self, error: PersistenceError) {
        self.degraded.store(true, Ordering::SeqCst);
        tracing::warn!(error = %error, "settings persistence degraded, using local cache");
        self.bus.publish(&SessionEvent::PersistenceFailed(error));
    }
}
