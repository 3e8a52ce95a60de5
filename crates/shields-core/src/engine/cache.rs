//! On-disk cache of compiled engines
//!
//! Each engine type has its own folder under `engines/` holding the
//! serialized engine and an `info.json` describing what it was built from.
//! `info.json` is written last, so a folder without it is never loaded.

use crate::engine::CompileFingerprint;
use crate::error::ShieldsError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shields_types::EngineType;
use std::path::{Path, PathBuf};
use tokio::fs;

const ENGINE_FILE: &str = "engine.dat";
const INFO_FILE: &str = "info.json";

/// Bumped when the serialized layout changes so stale caches are ignored
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Metadata stored next to a cached engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEngineInfo {
    pub format_version: u32,
    pub fingerprint: CompileFingerprint,
    pub compiled_at: DateTime<Utc>,
}

/// Cache folder of one engine type
#[derive(Debug, Clone)]
pub struct EngineCache {
    folder: PathBuf,
}

impl EngineCache {
    pub fn new(engines_dir: &Path, engine_type: EngineType) -> Self {
        Self {
            folder: engines_dir.join(engine_type.cache_folder_name()),
        }
    }

    /// Load the cached engine bytes, `None` when nothing is cached
    pub async fn load(&self) -> Result<Option<(CachedEngineInfo, Vec<u8>)>, ShieldsError> {
        let info_path = self.folder.join(INFO_FILE);
        if !info_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&info_path).await?;
        let info: CachedEngineInfo = serde_json::from_str(&content)
            .map_err(|e| ShieldsError::CacheLoad(format!("{}: {}", info_path.display(), e)))?;

        if info.format_version != CACHE_FORMAT_VERSION {
            return Err(ShieldsError::CacheLoad(format!(
                "cache format {} is not {}",
                info.format_version, CACHE_FORMAT_VERSION
            )));
        }

        let data = fs::read(self.folder.join(ENGINE_FILE))
            .await
            .map_err(|e| ShieldsError::CacheLoad(format!("engine data unreadable: {}", e)))?;

        Ok(Some((info, data)))
    }

    /// Replace the cached engine
    pub async fn save(&self, fingerprint: &CompileFingerprint, data: &[u8]) -> Result<(), ShieldsError> {
        fs::create_dir_all(&self.folder).await?;

        let info_path = self.folder.join(INFO_FILE);
        if info_path.exists() {
            fs::remove_file(&info_path).await?;
        }

        let engine_tmp = self.folder.join(format!("{}.tmp", ENGINE_FILE));
        fs::write(&engine_tmp, data).await?;
        fs::rename(&engine_tmp, self.folder.join(ENGINE_FILE)).await?;

        let info = CachedEngineInfo {
            format_version: CACHE_FORMAT_VERSION,
            fingerprint: fingerprint.clone(),
            compiled_at: Utc::now(),
        };
        let info_tmp = self.folder.join(format!("{}.tmp", INFO_FILE));
        fs::write(&info_tmp, serde_json::to_string_pretty(&info)?).await?;
        fs::rename(&info_tmp, &info_path).await?;

        Ok(())
    }

    /// Remove the cached engine
    pub async fn clear(&self) -> Result<(), ShieldsError> {
        if self.folder.exists() {
            fs::remove_dir_all(&self.folder).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shields_types::{FilterListInfo, Source};
    use tempfile::TempDir;

    fn fingerprint() -> CompileFingerprint {
        CompileFingerprint {
            infos: vec![FilterListInfo {
                source: Source::filter_list("a"),
                version: "1.0.0".to_string(),
            }],
            resources_version: Some("7".to_string()),
        }
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let cache = EngineCache::new(dir.path(), EngineType::Standard);
        assert!(cache.load().await.unwrap().is_none());

        cache.save(&fingerprint(), b"engine-bytes").await.unwrap();

        let (info, data) = cache.load().await.unwrap().unwrap();
        assert_eq!(info.fingerprint, fingerprint());
        assert_eq!(data, b"engine-bytes");

        cache.clear().await.unwrap();
        assert!(cache.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_engine_data_is_cache_error() {
        let dir = TempDir::new().unwrap();
        let cache = EngineCache::new(dir.path(), EngineType::Aggressive);
        cache.save(&fingerprint(), b"bytes").await.unwrap();
        fs::remove_file(cache.folder.join(ENGINE_FILE)).await.unwrap();

        let result = cache.load().await;
        assert!(matches!(result, Err(ShieldsError::CacheLoad(_))));
    }
}
