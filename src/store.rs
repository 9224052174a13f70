//! JSON file backed [`WatermarkStore`].
//!
//! State lives in a small object `{ "last_scan_time": <ms> }`. Writes go to a
//! sibling temp file which is then renamed over the target, so a crash during
//! a write leaves either the old or the new content on disk.

use crate::model::{PersistedState, Watermark};
use crate::traits::{StoreError, WatermarkStore};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Clone)]
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

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl WatermarkStore for JsonFileStore {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self) -> Result<Option<Watermark>, StoreError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: PersistedState = serde_json::from_slice(&data)?;
        Ok(Some(state.last_scan_time))
    }

    async fn save(&self, watermark: Watermark) -> Result<(), StoreError> {
        let state = PersistedState {
            last_scan_time: watermark,
        };
        let data = serde_json::to_vec_pretty(&state)?;
        let temp = self.temp_path();

        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!(path = %self.path.display(), %watermark, "Watermark persisted");
        Ok(())
    }
}
