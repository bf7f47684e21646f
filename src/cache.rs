//! Single-slot store for the last good remote analysis.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::CacheError;
use crate::types::AnalysisResult;

#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Replace the stored entry.
    async fn save(&self, result: &AnalysisResult) -> Result<(), CacheError>;

    /// Return the stored entry as saved.
    async fn load(&self) -> Result<AnalysisResult, CacheError>;
}

/// JSON file cache. Writes go to a sibling temp file which is synced and then
/// renamed over the target, so readers never observe a partial write.
#[derive(Debug, Clone)]
pub struct FileResultCache {
    path: PathBuf,
}

impl FileResultCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "cache".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ResultCache for FileResultCache {
    async fn save(&self, result: &AnalysisResult) -> Result<(), CacheError> {
        let data =
            serde_json::to_vec_pretty(result).map_err(|e| CacheError::Corrupt(e.to_string()))?;

        let temp_path = self.temp_path();
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), bytes = data.len(), "cache saved");
        Ok(())
    }

    async fn load(&self) -> Result<AnalysisResult, CacheError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(CacheError::Empty),
            Err(e) => return Err(CacheError::Io(e)),
        };

        serde_json::from_slice(&data).map_err(|e| CacheError::Corrupt(e.to_string()))
    }
}

/// In-process cache, mainly for tests and cache-less runs.
#[derive(Debug, Default)]
pub struct MemoryResultCache {
    slot: Mutex<Option<AnalysisResult>>,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(result: AnalysisResult) -> Self {
        Self {
            slot: Mutex::new(Some(result)),
        }
    }

    pub fn peek(&self) -> Option<AnalysisResult> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn save(&self, result: &AnalysisResult) -> Result<(), CacheError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|e| CacheError::Corrupt(format!("lock poisoned: {}", e)))?;
        *slot = Some(result.clone());
        Ok(())
    }

    async fn load(&self) -> Result<AnalysisResult, CacheError> {
        let slot = self
            .slot
            .lock()
            .map_err(|e| CacheError::Corrupt(format!("lock poisoned: {}", e)))?;
        slot.clone().ok_or(CacheError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResultSource, Severity};
    use tempfile::TempDir;

    fn sample(forecast: u32) -> AnalysisResult {
        AnalysisResult {
            forecast,
            forecast_reasoning: "weekend admissions".to_string(),
            severity: Severity::Warning,
            risk_reasoning: "88% projected".to_string(),
            action_plan: "prepare overflow ward".to_string(),
            source: ResultSource::Remote,
        }
    }

    #[tokio::test]
    async fn file_round_trip() {
        let tmp = TempDir::new().unwrap();
        let cache = FileResultCache::new(tmp.path().join("agent_cache.json"));

        cache.save(&sample(176)).await.unwrap();

        assert_eq!(cache.load().await.unwrap(), sample(176));
        assert!(!cache.temp_path().exists());
    }

    #[tokio::test]
    async fn save_replaces_stale_temp_file() {
        let tmp = TempDir::new().unwrap();
        let cache = FileResultCache::new(tmp.path().join("agent_cache.json"));
        // left behind by a write that crashed before the rename
        std::fs::write(cache.temp_path(), b"{\"forec").unwrap();

        cache.save(&sample(181)).await.unwrap();

        assert_eq!(cache.load().await.unwrap(), sample(181));
        assert!(!cache.temp_path().exists());
    }

    #[tokio::test]
    async fn file_overwrite_keeps_latest() {
        let tmp = TempDir::new().unwrap();
        let cache = FileResultCache::new(tmp.path().join("agent_cache.json"));

        cache.save(&sample(150)).await.unwrap();
        cache.save(&sample(190)).await.unwrap();

        assert_eq!(cache.load().await.unwrap().forecast, 190);
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let cache = FileResultCache::new(tmp.path().join("nothing.json"));

        assert!(matches!(cache.load().await, Err(CacheError::Empty)));
    }

    #[tokio::test]
    async fn garbage_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("agent_cache.json");
        std::fs::write(&path, b"{\"forecast\": ").unwrap();

        let cache = FileResultCache::new(path);

        assert!(matches!(cache.load().await, Err(CacheError::Corrupt(_))));
    }

    #[tokio::test]
    async fn memory_cache() {
        let cache = MemoryResultCache::new();
        assert!(matches!(cache.load().await, Err(CacheError::Empty)));

        cache.save(&sample(160)).await.unwrap();
        assert_eq!(cache.load().await.unwrap(), sample(160));
        assert_eq!(cache.peek(), Some(sample(160)));
    }
}
