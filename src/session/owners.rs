//! Durable session ownership records.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the ownership store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Disk write failed; the in-memory state is still correct.
    #[error("failed to persist ownership store: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failed.
    #[error("failed to encode ownership store: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One ownership record: who created a session, and when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// Persistent mapping of session id to owning user.
///
/// The whole map is held in memory and rewritten to disk on every mutation
/// via write-to-temp + rename, so a crash mid-write never corrupts the file.
/// The disk write happens outside the in-memory lock; a separate flush lock
/// keeps concurrent writers ordered.
#[derive(Debug)]
pub struct OwnershipStore {
    path: PathBuf,
    records: Mutex<HashMap<String, OwnerRecord>>,
    flush_lock: Mutex<()>,
}

impl OwnershipStore {
    /// Load the store from `path`, creating an empty one when the file is
    /// absent. Malformed entries are dropped with a warning; a malformed file
    /// starts over empty rather than refusing to boot.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(raw) => Self::parse_tolerant(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                log::warn!(
                    "could not read ownership store {}: {}; starting empty",
                    path.display(),
                    e
                );
                HashMap::new()
            }
        };

        if !records.is_empty() {
            log::info!(
                "loaded {} ownership record(s) from {}",
                records.len(),
                path.display()
            );
        }

        Self {
            path,
            records: Mutex::new(records),
            flush_lock: Mutex::new(()),
        }
    }

    fn parse_tolerant(raw: &str) -> HashMap<String, OwnerRecord> {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("ownership store is not valid JSON: {}; starting empty", e);
                return HashMap::new();
            }
        };

        let Some(map) = value.as_object() else {
            log::warn!("ownership store is not a JSON object; starting empty");
            return HashMap::new();
        };

        let mut records = HashMap::new();
        for (id, entry) in map {
            match serde_json::from_value::<OwnerRecord>(entry.clone()) {
                Ok(record) => {
                    records.insert(id.clone(), record);
                }
                Err(e) => {
                    log::warn!("dropping malformed ownership entry for {}: {}", id, e);
                }
            }
        }
        records
    }

    /// Record that `username` owns `session_id`.
    pub fn put(&self, session_id: &str, username: &str) -> Result<(), StoreError> {
        {
            let mut records = self.records.lock().expect("ownership lock poisoned");
            records.insert(
                session_id.to_string(),
                OwnerRecord {
                    username: username.to_string(),
                    created_at: Utc::now(),
                },
            );
        }
        self.flush()
    }

    /// Remove an ownership record. Removing an absent record is a no-op.
    pub fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        let removed = {
            let mut records = self.records.lock().expect("ownership lock poisoned");
            records.remove(session_id).is_some()
        };
        if removed {
            self.flush()?;
        }
        Ok(())
    }

    /// Owner of a session, if any.
    pub fn get(&self, session_id: &str) -> Option<String> {
        self.records
            .lock()
            .expect("ownership lock poisoned")
            .get(session_id)
            .map(|r| r.username.clone())
    }

    /// All session ids owned by a user.
    pub fn list_by_user(&self, username: &str) -> Vec<String> {
        self.records
            .lock()
            .expect("ownership lock poisoned")
            .iter()
            .filter(|(_, r)| r.username == username)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of sessions owned by a user.
    pub fn count_user(&self, username: &str) -> usize {
        self.records
            .lock()
            .expect("ownership lock poisoned")
            .values()
            .filter(|r| r.username == username)
            .count()
    }

    /// All tracked session ids.
    pub fn all_ids(&self) -> Vec<String> {
        self.records
            .lock()
            .expect("ownership lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Write the current map to disk atomically. The flush lock orders
    /// concurrent writers so an older snapshot can never overwrite a newer
    /// one; the data lock is only held long enough to clone the map.
    fn flush(&self) -> Result<(), StoreError> {
        let _guard = self.flush_lock.lock().expect("ownership flush lock poisoned");

        let snapshot = self
            .records
            .lock()
            .expect("ownership lock poisoned")
            .clone();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.tmp_path();
        let encoded = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(&tmp_path, encoded)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
