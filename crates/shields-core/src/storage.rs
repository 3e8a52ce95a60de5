//! Storage layer for JSON state (compiled engines and rule lists live in
//! their own caches)

use crate::error::ShieldsError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shields_types::{AppState, FilterListSetting, Settings};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

const SETTINGS_FILE: &str = "settings.json";
const FILTER_LISTS_FILE: &str = "filter_lists.json";
const APP_STATE_FILE: &str = "app_state.json";

/// Storage manager for the Shields data directory
#[derive(Clone)]
#[derive(Debug)]
pub struct Storage {
    /// Data directory
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance
    pub async fn new(data_dir: PathBuf) -> Result<Self, ShieldsError> {
        fs::create_dir_all(&data_dir).await?;
        fs::create_dir_all(data_dir.join("components")).await?;
        fs::create_dir_all(data_dir.join("engines")).await?;

        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Root of downloaded component folders
    pub fn components_dir(&self) -> PathBuf {
        self.data_dir.join("components")
    }

    /// Root of the compiled engine cache folders
    pub fn engines_dir(&self) -> PathBuf {
        self.data_dir.join("engines")
    }

    pub fn content_blockers_db_path(&self) -> PathBuf {
        self.data_dir.join("content_blockers.db")
    }

    // ========================================================================
    // Component paths
    // ========================================================================

    /// Component paths are persisted relative to the components directory
    /// so the data directory can move between launches.
    pub fn relative_component_path(&self, path: &Path) -> PathBuf {
        path.strip_prefix(self.components_dir())
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    pub fn absolute_component_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.components_dir().join(path)
        }
    }

    // ========================================================================
    // JSON files
    // ========================================================================

    /// Load settings, falling back to defaults when missing or unreadable
    pub async fn load_settings(&self) -> Result<Settings, ShieldsError> {
        self.read_json(SETTINGS_FILE).await
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), ShieldsError> {
        self.write_json(SETTINGS_FILE, settings).await
    }

    /// Load the filter list settings
    pub async fn load_filter_lists(&self) -> Result<Vec<FilterListSetting>, ShieldsError> {
        self.read_json(FILTER_LISTS_FILE).await
    }

    pub async fn save_filter_lists(&self, lists: &[FilterListSetting]) -> Result<(), ShieldsError> {
        self.write_json(FILTER_LISTS_FILE, lists).await
    }

    pub async fn load_app_state(&self) -> Result<AppState, ShieldsError> {
        self.read_json(APP_STATE_FILE).await
    }

    pub async fn save_app_state(&self, state: &AppState) -> Result<(), ShieldsError> {
        self.write_json(APP_STATE_FILE, state).await
    }

    async fn read_json<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, ShieldsError> {
        let path = self.data_dir.join(name);

        if !path.exists() {
            return Ok(T::default());
        }

        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str(&content) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", name, e);
                Ok(T::default())
            }
        }
    }

    async fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), ShieldsError> {
        let path = self.data_dir.join(name);
        let tmp_path = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(value)?;

        fs::write(&tmp_path, content).await?;
        fs::rename(&tmp_path, &path).await?;

        Ok(())
    }
}
