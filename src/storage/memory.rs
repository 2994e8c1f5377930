use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::storage::{check_mode_name, ModeOutput, Store, StoreError, StoredOutput};

/// In-process store, useful for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    outputs: Mutex<HashMap<String, Vec<u8>>>,
    reads: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed raw JSON for a mode, as if a previous run had written it
    pub async fn put_raw(&self, mode: &str, json: impl Into<Vec<u8>>) {
        self.outputs.lock().await.insert(mode.to_string(), json.into());
    }

    /// Decoded output last written for `mode`
    pub async fn output(&self, mode: &str) -> Option<ModeOutput> {
        let outputs = self.outputs.lock().await;
        outputs
            .get(mode)
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }

    /// Modes whose output was read, in order
    pub async fn reads(&self) -> Vec<String> {
        self.reads.lock().await.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn write(&self, mode: &str, output: &ModeOutput) -> Result<(), StoreError> {
        check_mode_name(mode)?;
        let bytes = serde_json::to_vec(output)?;
        self.outputs.lock().await.insert(mode.to_string(), bytes);
        Ok(())
    }

    async fn read(&self, mode: &str) -> Result<StoredOutput, StoreError> {
        self.reads.lock().await.push(mode.to_string());

        let outputs = self.outputs.lock().await;
        let bytes = outputs
            .get(mode)
            .ok_or_else(|| StoreError::NotFound(mode.to_string()))?;

        StoredOutput::from_slice(bytes).map_err(|source| StoreError::Corrupt {
            mode: mode.to_string(),
            source,
        })
    }
}
