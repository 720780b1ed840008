//! Durable key/value configuration.
//!
//! The configuration is a single JSON object (`config.json`). Every change is
//! written through to disk before it becomes visible, and bumps a generation
//! counter that subscribers observe through a `tokio::sync::watch` channel.

use crate::error::{Result, StoreError};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::info;

/// Configuration store with change notification.
pub struct ConfigStore {
    path: Option<PathBuf>,
    values: RwLock<Map<String, Value>>,
    changes: watch::Sender<u64>,
}

impl ConfigStore {
    /// Load the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a JSON object.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bytes = fs::read(&path)?;
        let values = match serde_json::from_slice(&bytes)? {
            Value::Object(map) => map,
            _ => {
                return Err(StoreError::Serialization(format!(
                    "{} is not a JSON object",
                    path.display()
                )))
            }
        };
        Ok(Self::build(Some(path), values))
    }

    /// A configuration that is never written to disk.
    #[must_use]
    pub fn in_memory(values: Map<String, Value>) -> Self {
        Self::build(None, values)
    }

    fn build(path: Option<PathBuf>, values: Map<String, Value>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            path,
            values: RwLock::new(values),
            changes,
        }
    }

    /// The backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get one value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    /// A copy of the whole configuration.
    #[must_use]
    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.read().clone()
    }

    /// Insert or replace a value. Returns `false` when the value was already set.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be written; the
    /// in-memory view is left unchanged in that case.
    pub fn upsert(&self, key: &str, value: Value) -> Result<bool> {
        let mut values = self.values.write();
        if values.get(key) == Some(&value) {
            return Ok(false);
        }
        let mut next = values.clone();
        next.insert(key.to_string(), value);
        self.persist(&next)?;
        *values = next;
        drop(values);

        info!(key, "Configuration updated");
        self.changes.send_modify(|generation| *generation += 1);
        Ok(true)
    }

    /// Remove a value. Returns `false` when the key was absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be written.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut values = self.values.write();
        if !values.contains_key(key) {
            return Ok(false);
        }
        let mut next = values.clone();
        next.remove(key);
        self.persist(&next)?;
        *values = next;
        drop(values);

        info!(key, "Configuration key removed");
        self.changes.send_modify(|generation| *generation += 1);
        Ok(true)
    }

    /// Subscribe to change notifications. The value is a generation counter.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn persist(&self, values: &Map<String, Value>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
