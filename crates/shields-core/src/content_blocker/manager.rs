//! Content Blocker Manager - compiles, stores and serves native rule lists

use crate::content_blocker::{
    apply_mode, bundled_rules, encode_rule_list, rules_from_filter_text, RuleListStore,
};
use crate::error::ShieldsError;
use crate::pool::CompilePool;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use shields_types::{
    compare_versions, BlockingMode, BlocklistType, Domain, EngineType, FileInfo,
    GenericBlocklistType, ManagerEvent, RuleList,
};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Version and modes cached for one blocklist
#[derive(Debug, Clone)]
struct CachedVersion {
    version: String,
    modes: BTreeSet<BlockingMode>,
}

/// Manages compiled rule lists
#[derive(Clone)]
pub struct ContentBlockerManager {
    store: RuleListStore,
    /// What the store holds, kept in memory so lookups stay synchronous
    index: Arc<RwLock<HashMap<BlocklistType, CachedVersion>>>,
    /// Rule lists already read from the store
    loaded: Arc<RwLock<HashMap<(BlocklistType, BlockingMode), Arc<RuleList>>>>,
    /// Serializes writes so the version check and the store update are atomic
    write_lock: Arc<tokio::sync::Mutex<()>>,
    pool: CompilePool,
    event_tx: broadcast::Sender<ManagerEvent>,
}

impl ContentBlockerManager {
    /// Open the rule list database and index what it holds
    pub async fn new<P: AsRef<Path>>(
        db_path: P,
        pool: CompilePool,
        event_tx: broadcast::Sender<ManagerEvent>,
    ) -> Result<Self, ShieldsError> {
        let store = RuleListStore::new(db_path).await?;

        let mut index: HashMap<BlocklistType, CachedVersion> = HashMap::new();
        for stored in store.load_index().await? {
            let entry = index
                .entry(stored.blocklist_type)
                .or_insert_with(|| CachedVersion {
                    version: stored.version.clone(),
                    modes: BTreeSet::new(),
                });
            if entry.version == stored.version {
                entry.modes.insert(stored.mode);
            }
        }

        debug!("Indexed {} cached blocklists", index.len());

        Ok(Self {
            store,
            index: Arc::new(RwLock::new(index)),
            loaded: Arc::new(RwLock::new(HashMap::new())),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            pool,
            event_tx,
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Modes of `blocklist_type` that are not cached at `version`
    pub fn missing_modes(&self, blocklist_type: &BlocklistType, version: &str) -> BTreeSet<BlockingMode> {
        let allowed = blocklist_type.allowed_modes();
        match self.index.read().get(blocklist_type) {
            Some(cached) if cached.version == version => {
                allowed.difference(&cached.modes).copied().collect()
            }
            _ => allowed,
        }
    }

    /// Cached version of `blocklist_type`, if any
    pub fn cached_version(&self, blocklist_type: &BlocklistType) -> Option<String> {
        self.index
            .read()
            .get(blocklist_type)
            .map(|cached| cached.version.clone())
    }

    /// Every cached blocklist with its version and modes
    pub fn cached_rule_lists(&self) -> Vec<(BlocklistType, String, BTreeSet<BlockingMode>)> {
        let mut cached: Vec<_> = self
            .index
            .read()
            .iter()
            .map(|(blocklist_type, cached)| {
                (blocklist_type.clone(), cached.version.clone(), cached.modes.clone())
            })
            .collect();
        cached.sort_by(|a, b| a.0.cmp(&b.0));
        cached
    }

    /// The compiled rule list of `blocklist_type` in `mode`
    pub async fn rule_list(
        &self,
        blocklist_type: &BlocklistType,
        mode: BlockingMode,
    ) -> Result<Arc<RuleList>, ShieldsError> {
        let key = (blocklist_type.clone(), mode);
        if let Some(rule_list) = self.loaded.read().get(&key) {
            return Ok(rule_list.clone());
        }

        let is_cached = self
            .index
            .read()
            .get(blocklist_type)
            .map(|cached| cached.modes.contains(&mode))
            .unwrap_or(false);
        if !is_cached {
            return Err(ShieldsError::NotFound(blocklist_type.rule_list_identifier(mode)));
        }

        let rule_list = self
            .store
            .load(blocklist_type, mode)
            .await?
            .map(Arc::new)
            .ok_or_else(|| ShieldsError::NotFound(blocklist_type.rule_list_identifier(mode)))?;

        self.loaded.write().insert(key, rule_list.clone());
        Ok(rule_list)
    }

    /// Bundled blocklists that apply to `domain`
    pub fn valid_generic_types(&self, domain: &Domain) -> BTreeSet<GenericBlocklistType> {
        let mut types = BTreeSet::new();
        if domain.all_shields_off {
            return types;
        }

        if domain.block_level.is_enabled() {
            types.insert(GenericBlocklistType::BlockAds);
            types.insert(GenericBlocklistType::BlockTrackers);
        }
        if domain.block_all_cookies {
            types.insert(GenericBlocklistType::BlockCookies);
        }
        if domain.upgrade_mixed_content {
            types.insert(GenericBlocklistType::UpgradeMixedContent);
        }

        types
    }

    // ========================================================================
    // Compiling
    // ========================================================================

    /// Compile a downloaded filter list into `modes`
    pub async fn compile_rule_list(
        &self,
        path: &Path,
        blocklist_type: &BlocklistType,
        version: &str,
        modes: &BTreeSet<BlockingMode>,
    ) -> Result<(), ShieldsError> {
        let target = blocklist_type.identifier();
        let path: PathBuf = path.to_path_buf();

        self.compile_rules(blocklist_type, version, modes, move || {
            let text = std::fs::read_to_string(&path).map_err(|e| ShieldsError::compile(&target, e))?;
            rules_from_filter_text(&target, &text)
        })
        .await
    }

    /// Compile a bundled blocklist into `modes`
    pub async fn compile_bundled_rule_list(
        &self,
        generic_type: GenericBlocklistType,
        modes: &BTreeSet<BlockingMode>,
    ) -> Result<(), ShieldsError> {
        self.compile_rules(
            &BlocklistType::Generic(generic_type),
            generic_type.version(),
            modes,
            move || bundled_rules(generic_type),
        )
        .await
    }

    /// Make sure the rule lists of a downloaded file exist in every mode.
    /// A list that fails to compile contributes no rules.
    pub async fn ensure_rule_list(&self, file_info: &FileInfo, engine_type: EngineType) {
        let Some(blocklist_type) = file_info.source().blocklist_type(engine_type) else {
            return;
        };

        let modes = self.missing_modes(&blocklist_type, file_info.version());
        if modes.is_empty() {
            return;
        }

        if let Err(e) = self
            .compile_rule_list(
                &file_info.local_file_path,
                &blocklist_type,
                file_info.version(),
                &modes,
            )
            .await
        {
            warn!("Failed to compile rule list {}: {}", blocklist_type, e);
        }
    }

    /// Make sure a bundled blocklist is cached at its current version
    pub async fn ensure_bundled_rule_list(&self, generic_type: GenericBlocklistType) {
        let blocklist_type = BlocklistType::Generic(generic_type);
        let modes = self.missing_modes(&blocklist_type, generic_type.version());
        if modes.is_empty() {
            return;
        }

        let result = self.compile_bundled_rule_list(generic_type, &modes).await;
        if let Err(e) = &result {
            error!("Bundled rule list {} failed to compile: {}", blocklist_type, e);
        }
        debug_assert!(result.is_ok(), "bundled rule lists must compile");
    }

    async fn compile_rules<F>(
        &self,
        blocklist_type: &BlocklistType,
        version: &str,
        modes: &BTreeSet<BlockingMode>,
        load_rules: F,
    ) -> Result<(), ShieldsError>
    where
        F: FnOnce() -> Result<Vec<Value>, ShieldsError> + Send + 'static,
    {
        if modes.is_empty() {
            return Ok(());
        }

        let job_type = blocklist_type.clone();
        let job_version = version.to_string();
        let job_modes = modes.clone();
        let rule_lists = self
            .pool
            .run_blocking(move || {
                let rules = load_rules()?;
                job_modes
                    .iter()
                    .map(|&mode| -> Result<RuleList, ShieldsError> {
                        let identifier = job_type.rule_list_identifier(mode);
                        let mode_rules = apply_mode(&rules, mode);
                        let encoded = encode_rule_list(&identifier, &mode_rules)?;
                        Ok(RuleList {
                            identifier,
                            blocklist_type: job_type.clone(),
                            mode,
                            version: job_version.clone(),
                            rule_count: mode_rules.len(),
                            encoded,
                            compiled_at: Utc::now(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .await?;

        self.store_rule_lists(blocklist_type, version, rule_lists).await
    }

    async fn store_rule_lists(
        &self,
        blocklist_type: &BlocklistType,
        version: &str,
        rule_lists: Vec<RuleList>,
    ) -> Result<(), ShieldsError> {
        let _guard = self.write_lock.lock().await;

        if let Some(cached) = self.cached_version(blocklist_type) {
            if compare_versions(&cached, version) == Ordering::Greater {
                debug!(
                    "Keeping {} v{}, not storing older v{}",
                    blocklist_type, cached, version
                );
                return Ok(());
            }
        }

        let removed = self
            .store
            .replace_version(blocklist_type, version, &rule_lists)
            .await?;

        {
            let mut index = self.index.write();
            let entry = index
                .entry(blocklist_type.clone())
                .or_insert_with(|| CachedVersion {
                    version: version.to_string(),
                    modes: BTreeSet::new(),
                });
            if entry.version != version {
                entry.version = version.to_string();
                entry.modes.clear();
            }
            entry.modes.extend(rule_lists.iter().map(|rule_list| rule_list.mode));
        }

        {
            let mut loaded = self.loaded.write();
            loaded.retain(|(loaded_type, _), rule_list| {
                loaded_type != blocklist_type || rule_list.version == version
            });
            for rule_list in &rule_lists {
                loaded.insert(
                    (blocklist_type.clone(), rule_list.mode),
                    Arc::new(rule_list.clone()),
                );
            }
        }

        info!(
            "Compiled {} v{} ({} modes)",
            blocklist_type,
            version,
            rule_lists.len()
        );
        for rule_list in &rule_lists {
            let _ = self.event_tx.send(ManagerEvent::RuleListCompiled {
                identifier: rule_list.identifier.clone(),
                version: rule_list.version.clone(),
            });
        }
        if !removed.is_empty() {
            let _ = self
                .event_tx
                .send(ManagerEvent::RuleListsRemoved { identifiers: removed });
        }

        Ok(())
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Remove every cached rule list whose blocklist is not in `valid_types`.
    /// Returns the identifiers removed.
    pub async fn cleanup_invalid_rule_lists(
        &self,
        valid_types: &BTreeSet<BlocklistType>,
    ) -> Result<Vec<String>, ShieldsError> {
        let _guard = self.write_lock.lock().await;

        let invalid: Vec<BlocklistType> = self
            .index
            .read()
            .keys()
            .filter(|blocklist_type| !valid_types.contains(blocklist_type))
            .cloned()
            .collect();
        if invalid.is_empty() {
            return Ok(Vec::new());
        }

        let removed = self.store.delete_types(&invalid).await?;

        {
            let mut index = self.index.write();
            for blocklist_type in &invalid {
                index.remove(blocklist_type);
            }
        }
        self.loaded
            .write()
            .retain(|(blocklist_type, _), _| valid_types.contains(blocklist_type));

        info!("Removed {} stale rule lists", removed.len());
        let _ = self.event_tx.send(ManagerEvent::RuleListsRemoved {
            identifiers: removed.clone(),
        });

        Ok(removed)
    }
}
