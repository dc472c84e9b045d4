// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable key/value state shared by the pipeline stages.
//!
//! All persistent relayer state (checkpoints, nonce cache) goes through
//! [`StateStore`]. Keys are flat strings scoped by relay id, e.g.
//! `eth-to-stc:lastProcessedBlock`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{RelayerError, RelayerResult};

pub fn last_processed_block_key(relay_id: &str) -> String {
    format!("{}:lastProcessedBlock", relay_id)
}

pub fn nonce_key(relay_id: &str) -> String {
    format!("{}:nonce", relay_id)
}

pub fn nonce_lock_key(relay_id: &str) -> String {
    format!("lock:{}:nonce", relay_id)
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> RelayerResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> RelayerResult<()>;

    async fn get_u64(&self, key: &str) -> RelayerResult<Option<u64>> {
        match self.get(key).await? {
            Some(raw) => raw
                .parse::<u64>()
                .map(Some)
                .map_err(|e| {
                    RelayerError::StorageError(format!(
                        "value for key {} is not a u64: {} ({})",
                        key, raw, e
                    ))
                }),
            None => Ok(None),
        }
    }

    async fn set_u64(&self, key: &str, value: u64) -> RelayerResult<()> {
        self.set(key, &value.to_string()).await
    }
}

/// A JSON file on local disk. Suitable for a single-node deployment where
/// the relayer owns its state directory.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    state: Mutex<HashMap<String, String>>,
}

impl FileStateStore {
    pub async fn open(path: impl AsRef<Path>) -> RelayerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                RelayerError::SerializationError(format!(
                    "state file {} is not valid JSON: {}",
                    path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(RelayerError::StorageError(format!(
                    "failed to read state file {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn persist(&self, state: &HashMap<String, String>) -> RelayerResult<()> {
        let raw = serde_json::to_string_pretty(state)
            .map_err(|e| RelayerError::SerializationError(e.to_string()))?;
        // Write to a sibling file then rename so a crash mid-write cannot
        // leave a truncated state file behind.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, raw).await.map_err(|e| {
            RelayerError::StorageError(format!(
                "failed to write state file {}: {}",
                tmp.display(),
                e
            ))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            RelayerError::StorageError(format!(
                "failed to replace state file {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &str) -> RelayerResult<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> RelayerResult<()> {
        let mut state = self.state.lock().await;
        state.insert(key.to_string(), value.to_string());
        self.persist(&state).await
    }
}

/// In-memory store. Used in tests and ephemeral dev runs where losing the
/// checkpoint on restart is acceptable.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<dyn StateStore> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> RelayerResult<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> RelayerResult<()> {
        let mut state = self.state.lock().await;
        state.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(
            last_processed_block_key("eth-to-stc"),
            "eth-to-stc:lastProcessedBlock"
        );
        assert_eq!(nonce_key("eth-to-stc"), "eth-to-stc:nonce");
        assert_eq!(nonce_lock_key("eth-to-stc"), "lock:eth-to-stc:nonce");
    }

    #[tokio::test]
    async fn test_memory_store_get_set() {
        let store = MemoryStateStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
        store.set("a", "1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some("1".to_string()));
        store.set_u64("b", 42).await.unwrap();
        assert_eq!(store.get_u64("b").await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_get_u64_rejects_garbage() {
        let store = MemoryStateStore::new();
        store.set("height", "not-a-number").await.unwrap();
        let err = store.get_u64("height").await.unwrap_err();
        assert!(matches!(err, RelayerError::StorageError(_)));
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = FileStateStore::open(&path).await.unwrap();
            store.set("eth-to-stc:lastProcessedBlock", "4100").await.unwrap();
            store.set("eth-to-stc:nonce", "7").await.unwrap();
        }
        let store = FileStateStore::open(&path).await.unwrap();
        assert_eq!(
            store.get_u64("eth-to-stc:lastProcessedBlock").await.unwrap(),
            Some(4100)
        );
        assert_eq!(store.get_u64("eth-to-stc:nonce").await.unwrap(), Some(7));
        assert_eq!(store.get("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, "{ nope").await.unwrap();
        let err = FileStateStore::open(&path).await.unwrap_err();
        assert!(matches!(err, RelayerError::SerializationError(_)));
    }
}
