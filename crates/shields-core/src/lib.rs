//! Shields Core - filter list compilation and caching
//!
//! This crate keeps compiled ad-block engines and native content-blocker
//! rule lists in step with the filter lists a user has enabled, and answers
//! the per-request and per-frame queries made while pages load.

mod content_blocker;
mod engine;
mod error;
mod pool;
mod source;
mod storage;

pub use content_blocker::*;
pub use engine::*;
pub use error::*;
pub use pool::*;
pub use source::*;
pub use storage::*;

use futures::future::join_all;
use parking_lot::RwLock;
use shields_types::{
    AppState, BlocklistType, CosmeticFilterModel, Domain, EngineType, FileInfo,
    GenericBlocklistType, ManagerEvent, ResourceType, ResourcesInfo, RuleList, ScriptType,
    Settings, ShieldType, Source,
};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use url::Url;

/// File name of the resources bundle inside its component folder
pub const RESOURCES_FILE_NAME: &str = "resources.json";

/// Coordinates the engine managers and the content blocker manager
pub struct GroupsManager {
    standard_manager: EngineManager,
    aggressive_manager: EngineManager,
    content_blocker_manager: ContentBlockerManager,
    source_provider: Arc<dyn SourceProvider>,
    /// Newest resources bundle seen
    resources_info: Arc<RwLock<Option<ResourcesInfo>>>,
    storage: Storage,
    pool: CompilePool,
    event_tx: broadcast::Sender<ManagerEvent>,
}

impl GroupsManager {
    /// Create a manager over `storage`. Nothing is loaded until
    /// [`GroupsManager::load_resources_from_cache`] and
    /// [`GroupsManager::load_engines_from_cache`] are called.
    pub async fn new(
        storage: Storage,
        settings: &Settings,
        source_provider: Arc<dyn SourceProvider>,
    ) -> Result<Self, ShieldsError> {
        let pool = CompilePool::new(settings.max_concurrent_compiles);
        let (event_tx, _) = broadcast::channel(settings.event_capacity.max(1));

        let engines_dir = storage.engines_dir();
        let standard_manager = EngineManager::new(
            EngineType::Standard,
            &engines_dir,
            settings,
            pool.clone(),
            event_tx.clone(),
        );
        let aggressive_manager = EngineManager::new(
            EngineType::Aggressive,
            &engines_dir,
            settings,
            pool.clone(),
            event_tx.clone(),
        );
        let content_blocker_manager = ContentBlockerManager::new(
            storage.content_blockers_db_path(),
            pool.clone(),
            event_tx.clone(),
        )
        .await?;

        Ok(Self {
            standard_manager,
            aggressive_manager,
            content_blocker_manager,
            source_provider,
            resources_info: Arc::new(RwLock::new(None)),
            storage,
            pool,
            event_tx,
        })
    }

    /// Subscribe to manager events
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.event_tx.subscribe()
    }

    pub fn manager(&self, engine_type: EngineType) -> &EngineManager {
        match engine_type {
            EngineType::Standard => &self.standard_manager,
            EngineType::Aggressive => &self.aggressive_manager,
        }
    }

    pub fn content_blocker_manager(&self) -> &ContentBlockerManager {
        &self.content_blocker_manager
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn resources_info(&self) -> Option<ResourcesInfo> {
        self.resources_info.read().clone()
    }

    pub fn has_engine(&self, engine_type: EngineType) -> bool {
        self.manager(engine_type).has_engine()
    }

    /// Wait for background compiles, including scheduled delayed compiles
    pub async fn wait_for_background_tasks(&self) {
        self.pool.wait_idle().await;
    }

    /// Drop cached query results of every engine
    pub fn did_receive_memory_warning(&self) {
        for engine_type in EngineType::ALL {
            self.manager(engine_type).clear_caches();
        }
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Restore the resources bundle recorded on a previous launch
    pub async fn load_resources_from_cache(&self) -> Result<(), ShieldsError> {
        let app_state = self.storage.load_app_state().await?;

        match self.cached_resources_info(&app_state) {
            Some(resources_info) => {
                debug!("Using cached resources v{}", resources_info.version);
                *self.resources_info.write() = Some(resources_info);
            }
            None => debug!("No cached resources"),
        }

        Ok(())
    }

    fn cached_resources_info(&self, app_state: &AppState) -> Option<ResourcesInfo> {
        if let Some(folder) = &app_state.last_resources_folder_path {
            let folder = self.storage.absolute_component_path(folder);
            let file = folder.join(RESOURCES_FILE_NAME);
            if file.exists() {
                return Some(ResourcesInfo::from_file_path(file));
            }
        }

        if let Some(file) = &app_state.last_resources_file_path {
            let file = self.storage.absolute_component_path(file);
            if file.exists() {
                return Some(ResourcesInfo::from_file_path(file));
            }
        }

        None
    }

    /// Compile every bundled rule list that is missing or outdated
    pub async fn load_bundled_data_if_needed(&self) {
        join_all(
            GenericBlocklistType::ALL
                .into_iter()
                .map(|generic_type| self.content_blocker_manager.ensure_bundled_rule_list(generic_type)),
        )
        .await;
    }

    /// Load each engine from its cache. The standard engine falls back to
    /// compiling the lists left by a previous launch.
    pub async fn load_engines_from_cache(&self) {
        join_all(
            EngineType::ALL
                .into_iter()
                .map(|engine_type| self.load_engine_from_cache(engine_type)),
        )
        .await;
    }

    async fn load_engine_from_cache(&self, engine_type: EngineType) {
        let manager = self.manager(engine_type);
        let resources_info = self.resources_info();

        if manager.load_from_cache(resources_info.as_ref()).await {
            return;
        }

        // Aggressive lists arrive through the downloader
        if engine_type != EngineType::Standard {
            return;
        }

        let legacy_files = self.source_provider.legacy_cache_files(engine_type);
        if legacy_files.is_empty() {
            return;
        }

        info!("Rebuilding {} engine from {} downloaded lists", engine_type, legacy_files.len());
        for file_info in legacy_files {
            manager.add(file_info);
        }

        manager
            .compile_immediately_if_needed(
                &self.source_provider.enabled_sources(),
                resources_info.as_ref(),
                &self.content_blocker_manager,
            )
            .await;
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Record a freshly downloaded resources bundle
    pub async fn did_update_resources_component(&self, path: &Path) -> Result<(), ShieldsError> {
        let app_state = AppState {
            last_resources_file_path: Some(self.storage.relative_component_path(path)),
            last_resources_folder_path: None,
        };
        self.storage.save_app_state(&app_state).await?;

        self.update_if_needed(ResourcesInfo::from_file_path(path));
        Ok(())
    }

    /// Adopt `resources_info` if it is newer than the current bundle.
    /// Engines pick it up on their next compile.
    pub fn update_if_needed(&self, resources_info: ResourcesInfo) -> bool {
        {
            let mut current = self.resources_info.write();
            if let Some(current) = current.as_ref() {
                if !resources_info.is_newer_than(current) {
                    return false;
                }
            }
            *current = Some(resources_info.clone());
        }

        for engine_type in EngineType::ALL {
            self.manager(engine_type).update(resources_info.clone());
        }

        info!("Resources updated to v{}", resources_info.version);
        let _ = self.event_tx.send(ManagerEvent::ResourcesUpdated {
            version: resources_info.version,
        });
        true
    }

    // ========================================================================
    // Filter list updates
    // ========================================================================

    /// Register a downloaded list and schedule a delayed compile
    pub fn update(&self, file_info: FileInfo) {
        self.update_file_infos(std::slice::from_ref(&file_info));
    }

    /// Register downloaded lists and schedule delayed compiles
    pub fn update_file_infos(&self, file_infos: &[FileInfo]) {
        let enabled_sources = self.source_provider.enabled_sources();
        let resources_info = self.resources_info();

        for engine_type in EngineType::ALL {
            if !self.register_files(engine_type, file_infos, &enabled_sources, false) {
                continue;
            }
            self.manager(engine_type).compile_delayed_if_needed(
                &enabled_sources,
                resources_info.as_ref(),
                &self.content_blocker_manager,
            );
        }
    }

    /// Register a downloaded list and compile right away
    pub async fn update_immediately(&self, file_info: FileInfo) {
        self.update_file_infos_immediately(std::slice::from_ref(&file_info))
            .await;
    }

    /// Register downloaded lists, build their rule lists and compile right
    /// away
    pub async fn update_file_infos_immediately(&self, file_infos: &[FileInfo]) {
        let enabled_sources = self.source_provider.enabled_sources();
        let resources_info = self.resources_info();

        for engine_type in EngineType::ALL {
            if !self.register_files(engine_type, file_infos, &enabled_sources, true) {
                continue;
            }

            self.ensure_content_blockers(&enabled_sources, engine_type)
                .await;

            self.manager(engine_type)
                .compile_immediately_if_needed(
                    &enabled_sources,
                    resources_info.as_ref(),
                    &self.content_blocker_manager,
                )
                .await;
        }
    }

    /// Add the files that belong to `engine_type` to its registry. Rule
    /// lists of enabled files are built in the background unless the caller
    /// builds them itself. Returns whether any file was added.
    fn register_files(
        &self,
        engine_type: EngineType,
        file_infos: &[FileInfo],
        enabled_sources: &[Source],
        caller_builds_rule_lists: bool,
    ) -> bool {
        let manager = self.manager(engine_type);
        let sources = self.source_provider.sources(engine_type);
        let mut updated = false;

        for file_info in file_infos {
            if !sources.contains(file_info.source()) {
                continue;
            }

            if enabled_sources.contains(file_info.source()) && !caller_builds_rule_lists {
                self.build_rule_list_in_background(file_info.clone(), engine_type);
            }

            manager.add(file_info.clone());
            updated = true;
        }

        updated
    }

    fn build_rule_list_in_background(&self, file_info: FileInfo, engine_type: EngineType) {
        let content_blocker_manager = self.content_blocker_manager.clone();
        self.pool.spawn(async move {
            content_blocker_manager
                .ensure_rule_list(&file_info, engine_type)
                .await;
        });
    }

    /// Make sure every registered file of `enabled_sources` on
    /// `engine_type` has its rule lists
    pub async fn ensure_content_blockers(&self, enabled_sources: &[Source], engine_type: EngineType) {
        let files = self.manager(engine_type).compilable_files(enabled_sources);
        join_all(files.iter().map(|file_info| {
            self.content_blocker_manager
                .ensure_rule_list(file_info, engine_type)
        }))
        .await;
    }

    /// Forget a list and schedule a delayed compile
    pub fn remove_file_info(&self, source: &Source) {
        self.remove_file_infos(std::slice::from_ref(source));
    }

    pub fn remove_file_infos(&self, sources: &[Source]) {
        let enabled_sources = self.source_provider.enabled_sources();
        let resources_info = self.resources_info();

        for engine_type in EngineType::ALL {
            let manager = self.manager(engine_type);
            for source in sources {
                manager.remove_info(source);
            }
            manager.compile_delayed_if_needed(
                &enabled_sources,
                resources_info.as_ref(),
                &self.content_blocker_manager,
            );
        }
    }

    /// Forget a list and compile right away
    pub async fn remove_file_info_immediately(&self, source: &Source) {
        self.remove_file_infos_immediately(std::slice::from_ref(source))
            .await;
    }

    pub async fn remove_file_infos_immediately(&self, sources: &[Source]) {
        let enabled_sources = self.source_provider.enabled_sources();
        let resources_info = self.resources_info();

        for engine_type in EngineType::ALL {
            let manager = self.manager(engine_type);
            for source in sources {
                manager.remove_info(source);
            }
            manager
                .compile_immediately_if_needed(
                    &enabled_sources,
                    resources_info.as_ref(),
                    &self.content_blocker_manager,
                )
                .await;
        }
    }

    // ========================================================================
    // Compiling
    // ========================================================================

    /// Compile each engine whose enabled lists have all been downloaded
    pub fn compile_engines_if_files_are_ready(&self) {
        for engine_type in EngineType::ALL {
            self.compile_engine_if_files_are_ready(engine_type);
        }
    }

    /// Compile `engine_type` in the background once every enabled list of
    /// it has been downloaded
    pub fn compile_engine_if_files_are_ready(&self, engine_type: EngineType) {
        let manager = self.manager(engine_type).clone();
        let enabled_sources = self.source_provider.enabled_sources_for(engine_type);
        let available = manager.compilable_files(&enabled_sources);

        if available.len() != enabled_sources.len() {
            debug!(
                "{} engine waiting for {} of {} lists",
                engine_type,
                enabled_sources.len() - available.len(),
                enabled_sources.len()
            );
            return;
        }

        let resources_info = self.resources_info();
        let content_blocker_manager = self.content_blocker_manager.clone();
        self.pool.spawn(async move {
            manager
                .compile_immediately_if_needed(
                    &enabled_sources,
                    resources_info.as_ref(),
                    &content_blocker_manager,
                )
                .await;
        });
    }

    /// Compile every engine whose inputs changed, waiting for the result
    pub async fn compile_engines_if_needed(&self) {
        let enabled_sources = self.source_provider.enabled_sources();
        let resources_info = self.resources_info();

        join_all(EngineType::ALL.into_iter().map(|engine_type| {
            self.manager(engine_type).compile_immediately_if_needed(
                &enabled_sources,
                resources_info.as_ref(),
                &self.content_blocker_manager,
            )
        }))
        .await;
    }

    // ========================================================================
    // Rule lists
    // ========================================================================

    /// Rule lists to install for a page on `domain`
    pub async fn rule_lists(&self, domain: &Domain) -> HashSet<Arc<RuleList>> {
        let is_aggressive = domain.block_level.is_aggressive();
        let valid_types = self.valid_blocklist_types(domain);

        join_all(valid_types.iter().map(|blocklist_type| async move {
            let mode = blocklist_type.mode(is_aggressive);
            match self.content_blocker_manager.rule_list(blocklist_type, mode).await {
                Ok(rule_list) => Some(rule_list),
                Err(e) => {
                    if !e.is_recoverable() {
                        error!("Failed to load rule list {}: {}", blocklist_type, e);
                    }
                    None
                }
            }
        }))
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    fn valid_blocklist_types(&self, domain: &Domain) -> BTreeSet<BlocklistType> {
        if domain.all_shields_off {
            return BTreeSet::new();
        }

        let mut types: BTreeSet<BlocklistType> = self
            .content_blocker_manager
            .valid_generic_types(domain)
            .into_iter()
            .map(BlocklistType::Generic)
            .collect();

        if !domain.is_shield_expected(ShieldType::AdBlockAndTp) {
            return types;
        }

        for engine_type in EngineType::ALL {
            types.extend(self.source_provider.enabled_blocklist_types(engine_type));
        }

        types
    }

    /// Remove cached rule lists of blocklists that no longer exist.
    /// Returns the identifiers removed.
    pub async fn cleanup_invalid_rule_lists(&self) -> Result<Vec<String>, ShieldsError> {
        let mut valid_types = BlocklistType::all_static_types();
        for engine_type in EngineType::ALL {
            valid_types.extend(self.source_provider.blocklist_types(engine_type));
        }

        self.content_blocker_manager
            .cleanup_invalid_rule_lists(&valid_types)
            .await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Engines that apply to `domain`, standard first
    pub fn cached_engines(&self, domain: &Domain) -> Vec<Arc<CompiledEngine>> {
        if !domain.is_shield_expected(ShieldType::AdBlockAndTp) {
            return Vec::new();
        }

        let mut engine_types = vec![EngineType::Standard];
        if domain.block_level.is_aggressive() {
            engine_types.push(EngineType::Aggressive);
        }

        engine_types
            .into_iter()
            .filter_map(|engine_type| self.manager(engine_type).engine())
            .collect()
    }

    /// Whether any engine that applies to `domain` blocks the request
    pub async fn should_block(
        &self,
        request_url: &Url,
        source_url: &Url,
        resource_type: ResourceType,
        domain: &Domain,
    ) -> bool {
        let engines = self.cached_engines(domain);
        if engines.is_empty() {
            return false;
        }

        let is_aggressive_mode = domain.block_level.is_aggressive();
        join_all(engines.iter().map(|engine| async move {
            engine.should_block(request_url, source_url, resource_type, is_aggressive_mode)
        }))
        .await
        .into_iter()
        .any(|blocked| blocked)
    }

    /// Scripts the engines that apply to `domain` need in a frame
    pub async fn make_engine_script_types(
        &self,
        frame_url: &Url,
        is_main_frame: bool,
        is_de_amp_enabled: bool,
        domain: &Domain,
    ) -> HashSet<ScriptType> {
        let engines = self.cached_engines(domain);

        join_all(engines.iter().enumerate().map(|(order, engine)| async move {
            let result =
                engine.make_engine_script_types(frame_url, is_main_frame, is_de_amp_enabled, order);
            if let Err(e) = &result {
                error!("Failed to build {} engine scripts: {}", engine.engine_type(), e);
            }
            debug_assert!(result.is_ok(), "engine scripts must build");
            result.unwrap_or_default()
        }))
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    /// Cosmetic models of the engines that apply to `domain`, tagged with
    /// whether they came from an always-aggressive engine
    pub async fn cosmetic_filter_models(
        &self,
        frame_url: &Url,
        domain: &Domain,
    ) -> Vec<(bool, Arc<CosmeticFilterModel>)> {
        let engines = self.cached_engines(domain);

        join_all(engines.iter().map(|engine| async move {
            let result = engine.cosmetic_filter_model(frame_url);
            if let Err(e) = &result {
                error!("Failed to build {} cosmetic model: {}", engine.engine_type(), e);
            }
            debug_assert!(result.is_ok(), "cosmetic models must build");
            result
                .ok()
                .flatten()
                .map(|model| (engine.engine_type().is_always_aggressive(), model))
        }))
        .await
        .into_iter()
        .flatten()
        .collect()
    }
}

impl Clone for GroupsManager {
    fn clone(&self) -> Self {
        Self {
            standard_manager: self.standard_manager.clone(),
            aggressive_manager: self.aggressive_manager.clone(),
            content_blocker_manager: self.content_blocker_manager.clone(),
            source_provider: Arc::clone(&self.source_provider),
            resources_info: Arc::clone(&self.resources_info),
            storage: self.storage.clone(),
            pool: self.pool.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}
