use crate::model::Watermark;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to parse stored state: {0}")]
    InvalidContent(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Durable home of the harvester watermark.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Human-readable location, used in log lines.
    fn describe(&self) -> String;

    /// Loads the stored watermark. `Ok(None)` means nothing was stored yet.
    async fn load(&self) -> Result<Option<Watermark>, StoreError>;

    /// Replaces the stored watermark.
    async fn save(&self, watermark: Watermark) -> Result<(), StoreError>;
}
