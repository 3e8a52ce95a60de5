//! Filter list sources
//!
//! The [`SourceProvider`] trait is how the managers learn which filter lists
//! exist, which are enabled and which engine each one compiles into.
//! [`FilterListSourceProvider`] is the implementation backed by the
//! persisted filter list settings.

use parking_lot::RwLock;
use shields_types::{BlocklistType, EngineType, FileInfo, FilterListSetting, Source};
use std::path::{Path, PathBuf};

/// File name of a filter list inside its component folder
pub const FILTER_LIST_FILE_NAME: &str = "list.txt";

/// Supplies the set of filter lists the managers work with
pub trait SourceProvider: Send + Sync {
    /// All enabled sources, in compile order
    fn enabled_sources(&self) -> Vec<Source>;

    /// Every source (enabled or not) that compiles into `engine_type`
    fn sources(&self, engine_type: EngineType) -> Vec<Source>;

    /// Downloaded files left from a previous launch, used to rebuild an
    /// engine when its compiled cache is missing
    fn legacy_cache_files(&self, engine_type: EngineType) -> Vec<FileInfo>;

    fn enabled_sources_for(&self, engine_type: EngineType) -> Vec<Source> {
        let enabled = self.enabled_sources();
        self.sources(engine_type)
            .into_iter()
            .filter(|source| enabled.contains(source))
            .collect()
    }

    /// Native blocklists of the enabled sources on `engine_type`
    fn enabled_blocklist_types(&self, engine_type: EngineType) -> Vec<BlocklistType> {
        self.enabled_sources_for(engine_type)
            .iter()
            .filter_map(|source| source.blocklist_type(engine_type))
            .collect()
    }

    /// Native blocklists of every known source on `engine_type`
    fn blocklist_types(&self, engine_type: EngineType) -> Vec<BlocklistType> {
        self.sources(engine_type)
            .iter()
            .filter_map(|source| source.blocklist_type(engine_type))
            .collect()
    }
}

/// Source provider backed by [`FilterListSetting`]s
#[derive(Debug)]
pub struct FilterListSourceProvider {
    settings: RwLock<Vec<FilterListSetting>>,
    components_dir: PathBuf,
}

impl FilterListSourceProvider {
    pub fn new(settings: Vec<FilterListSetting>, components_dir: PathBuf) -> Self {
        Self {
            settings: RwLock::new(settings),
            components_dir,
        }
    }

    /// Snapshot of the current settings
    pub fn settings(&self) -> Vec<FilterListSetting> {
        self.settings.read().clone()
    }

    /// Enable or disable a source. Returns false when the source is unknown.
    pub fn set_enabled(&self, source: &Source, is_enabled: bool) -> bool {
        let mut settings = self.settings.write();
        match settings.iter_mut().find(|setting| &setting.source == source) {
            Some(setting) => {
                setting.is_enabled = is_enabled;
                true
            }
            None => false,
        }
    }

    /// Add a setting or replace the existing one for the same source
    pub fn upsert(&self, setting: FilterListSetting) {
        let mut settings = self.settings.write();
        match settings.iter_mut().find(|s| s.source == setting.source) {
            Some(existing) => *existing = setting,
            None => settings.push(setting),
        }
    }

    /// The downloaded file of `setting`, if its folder holds one
    pub fn file_info(&self, setting: &FilterListSetting) -> Option<FileInfo> {
        let folder = setting.folder_path.as_ref()?;
        let folder = if folder.is_absolute() {
            folder.clone()
        } else {
            self.components_dir.join(folder)
        };

        file_info_from_component_folder(setting.source.clone(), &folder)
    }

    /// Settings sorted by their list order, unordered lists first
    fn sorted_settings(&self) -> Vec<FilterListSetting> {
        let mut settings = self.settings();
        settings.sort_by_key(|setting| setting.order.unwrap_or(0));
        settings
    }

    fn compiles_into(setting: &FilterListSetting, engine_type: EngineType) -> bool {
        match engine_type {
            EngineType::Standard => !setting.source.is_custom() && !setting.is_always_aggressive,
            // Custom lists are always compiled aggressively
            EngineType::Aggressive => setting.source.is_custom() || setting.is_always_aggressive,
        }
    }
}

impl SourceProvider for FilterListSourceProvider {
    fn enabled_sources(&self) -> Vec<Source> {
        let settings = self.sorted_settings();
        let (custom, lists): (Vec<_>, Vec<_>) = settings
            .into_iter()
            .filter(|setting| setting.is_enabled)
            .partition(|setting| setting.source.is_custom());

        lists
            .into_iter()
            .chain(custom)
            .map(|setting| setting.source)
            .collect()
    }

    fn sources(&self, engine_type: EngineType) -> Vec<Source> {
        self.sorted_settings()
            .into_iter()
            .filter(|setting| Self::compiles_into(setting, engine_type))
            .map(|setting| setting.source)
            .collect()
    }

    fn legacy_cache_files(&self, engine_type: EngineType) -> Vec<FileInfo> {
        self.sorted_settings()
            .iter()
            .filter(|setting| !setting.source.is_custom())
            .filter(|setting| setting.is_always_aggressive == engine_type.is_always_aggressive())
            .filter_map(|setting| self.file_info(setting))
            .collect()
    }
}

/// Build a [`FileInfo`] from a downloaded component folder.
///
/// Component folders are named after their version and hold the list as
/// [`FILTER_LIST_FILE_NAME`].
pub fn file_info_from_component_folder(source: Source, folder: &Path) -> Option<FileInfo> {
    let file_path = folder.join(FILTER_LIST_FILE_NAME);
    if !file_path.exists() {
        return None;
    }

    let version = folder.file_name()?.to_string_lossy().into_owned();
    Some(FileInfo::new(source, version, file_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setting(source: Source, order: i32, is_always_aggressive: bool) -> FilterListSetting {
        FilterListSetting {
            source,
            is_enabled: true,
            is_always_aggressive,
            order: Some(order),
            folder_path: None,
        }
    }

    #[test]
    fn test_sources_are_split_by_engine() {
        let provider = FilterListSourceProvider::new(
            vec![
                setting(Source::filter_list("regional"), 2, false),
                setting(Source::filter_list("annoyances"), 1, true),
                setting(Source::custom_list("mine"), 0, false),
                setting(Source::filter_list("default"), 0, false),
            ],
            PathBuf::from("/components"),
        );

        assert_eq!(
            provider.sources(EngineType::Standard),
            vec![Source::filter_list("default"), Source::filter_list("regional")]
        );
        assert_eq!(
            provider.sources(EngineType::Aggressive),
            vec![Source::custom_list("mine"), Source::filter_list("annoyances")]
        );
    }

    #[test]
    fn test_disabled_sources_are_not_enabled_for_engine() {
        let provider = FilterListSourceProvider::new(
            vec![
                setting(Source::filter_list("a"), 0, false),
                setting(Source::filter_list("b"), 1, false),
            ],
            PathBuf::from("/components"),
        );
        assert!(provider.set_enabled(&Source::filter_list("b"), false));
        assert!(!provider.set_enabled(&Source::filter_list("missing"), false));

        assert_eq!(
            provider.enabled_sources_for(EngineType::Standard),
            vec![Source::filter_list("a")]
        );
        assert_eq!(provider.blocklist_types(EngineType::Standard).len(), 2);
        assert_eq!(provider.enabled_blocklist_types(EngineType::Standard).len(), 1);
    }

    #[test]
    fn test_legacy_cache_files_use_component_folders() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("regional").join("1.0.7");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join(FILTER_LIST_FILE_NAME), "||ads.example^").unwrap();

        let mut with_folder = setting(Source::filter_list("regional"), 0, false);
        with_folder.folder_path = Some(PathBuf::from("regional/1.0.7"));
        let mut missing_file = setting(Source::filter_list("other"), 1, false);
        missing_file.folder_path = Some(PathBuf::from("other/1.0.0"));

        let provider =
            FilterListSourceProvider::new(vec![with_folder, missing_file], dir.path().to_path_buf());

        let files = provider.legacy_cache_files(EngineType::Standard);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].version(), "1.0.7");
        assert_eq!(files[0].source(), &Source::filter_list("regional"));
        assert!(provider.legacy_cache_files(EngineType::Aggressive).is_empty());
    }
}
