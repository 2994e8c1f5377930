use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::storage::{check_mode_name, ModeOutput, Store, StoreError, StoredOutput};

/// Stores each mode's output as `{dir}/{mode}.json`
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, mode: &str) -> Result<PathBuf, StoreError> {
        check_mode_name(mode)?;
        Ok(self.dir.join(format!("{}.json", mode)))
    }

    fn temp_path_for(&self, mode: &str) -> PathBuf {
        self.dir.join(format!(".{}.json.{}.tmp", mode, uuid::Uuid::new_v4()))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn write(&self, mode: &str, output: &ModeOutput) -> Result<(), StoreError> {
        let target = self.path_for(mode)?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;

        let contents = serde_json::to_vec_pretty(output)?;
        let temp = self.temp_path_for(mode);

        // Write aside then rename so readers never see a half-written file
        fs::write(&temp, contents)
            .await
            .map_err(|e| io_error(&temp, e))?;

        if let Err(e) = fs::rename(&temp, &target).await {
            fs::remove_file(&temp).await.ok();
            return Err(io_error(&target, e));
        }

        debug!("Saved {} records to {}", output.data.len(), target.display());
        Ok(())
    }

    async fn read(&self, mode: &str) -> Result<StoredOutput, StoreError> {
        let path = self.path_for(mode)?;

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(mode.to_string()))
            }
            Err(e) => return Err(io_error(&path, e)),
        };

        StoredOutput::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            mode: mode.to_string(),
            source,
        })
    }
}
