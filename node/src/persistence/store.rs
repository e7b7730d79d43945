//! Trade list stores

use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{TradeRecord, TradeStore};
use crate::error::{PersistenceError, PersistenceResult};

/// JSON file written atomically (temp file + rename)
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, records: &[TradeRecord]) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create data dir {}", dir.display()))?;
        }
        let json = serde_json::to_vec_pretty(records).context("Failed to serialize trade list")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to move trade list into {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl TradeStore for JsonFileStore {
    async fn save(&self, records: &[TradeRecord]) -> PersistenceResult<()> {
        self.write(records)
            .await
            .map_err(|e| PersistenceError::Io(format!("{e:#}")))
    }

    async fn load(&self) -> PersistenceResult<Vec<TradeRecord>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PersistenceError::Io(format!(
                    "Failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Serialization(e.to_string()))
    }
}

/// Store kept in memory, shared between node restarts in tests
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<TradeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn save(&self, records: &[TradeRecord]) -> PersistenceResult<()> {
        let mut stored = self
            .records
            .lock()
            .map_err(|_| PersistenceError::Io("memory store poisoned".to_string()))?;
        *stored = records.to_vec();
        Ok(())
    }

    async fn load(&self) -> PersistenceResult<Vec<TradeRecord>> {
        self.records
            .lock()
            .map(|r| r.clone())
            .map_err(|_| PersistenceError::Io("memory store poisoned".to_string()))
    }
}
