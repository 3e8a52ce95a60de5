//! Engine Manager - owns the compiled engine of one engine type
//!
//! This keeps the registry of downloaded filter lists and decides when they
//! get compiled:
//! - Delayed compiles collapse bursts of list updates into one pass
//! - Immediate compiles are awaited by the caller
//! - A compile whose inputs match the live engine is skipped
//! - Compiles for one engine type never overlap

use crate::content_blocker::ContentBlockerManager;
use crate::engine::{
    CompileFingerprint, CompiledEngine, Debouncer, EngineCache, FilterListGroup,
};
use crate::pool::CompilePool;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use shields_types::{
    compare_versions, EngineType, FileInfo, ManagerEvent, ResourcesInfo, Settings, Source,
};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// What a compile request ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileOutcome {
    /// A new engine replaced the previous one
    Compiled,
    /// The engine was dropped because none of its lists remain
    Cleared,
    /// The live engine already matches the inputs
    Skipped,
    /// The compile failed and the previous engine was kept
    Failed,
}

/// Mutable registry state, guarded by one lock
#[derive(Debug, Default)]
struct ManagerState {
    /// Downloaded files, one per source
    files: Vec<FileInfo>,
    resources_info: Option<ResourcesInfo>,
    /// Fingerprint of the live engine
    applied: Option<CompileFingerprint>,
    /// Fingerprint a delayed compile is waiting to build
    scheduled: Option<CompileFingerprint>,
    /// A source of the live engine was removed from the registry
    stale_engine: bool,
}

/// Manages the compiled engine of one [`EngineType`]
#[derive(Clone)]
pub struct EngineManager {
    engine_type: EngineType,
    state: Arc<Mutex<ManagerState>>,
    engine: Arc<ArcSwapOption<CompiledEngine>>,
    /// Held for the whole of every compile or cache load
    compile_lock: Arc<tokio::sync::Mutex<()>>,
    cache: EngineCache,
    debouncer: Arc<Debouncer>,
    pool: CompilePool,
    compile_count: Arc<AtomicUsize>,
    query_cache_capacity: u64,
    event_tx: broadcast::Sender<ManagerEvent>,
}

impl EngineManager {
    /// Create a manager with no engine loaded
    pub fn new(
        engine_type: EngineType,
        engines_dir: &Path,
        settings: &Settings,
        pool: CompilePool,
        event_tx: broadcast::Sender<ManagerEvent>,
    ) -> Self {
        Self {
            engine_type,
            state: Arc::new(Mutex::new(ManagerState::default())),
            engine: Arc::new(ArcSwapOption::empty()),
            compile_lock: Arc::new(tokio::sync::Mutex::new(())),
            cache: EngineCache::new(engines_dir, engine_type),
            debouncer: Arc::new(Debouncer::new(settings.compile_delay(), pool.clone())),
            pool,
            compile_count: Arc::new(AtomicUsize::new(0)),
            query_cache_capacity: settings.query_cache_capacity,
            event_tx,
        }
    }

    pub fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    /// The live engine, if one is compiled or loaded
    pub fn engine(&self) -> Option<Arc<CompiledEngine>> {
        self.engine.load_full()
    }

    pub fn has_engine(&self) -> bool {
        self.engine.load().is_some()
    }

    /// Number of compiles started since creation
    pub fn compile_count(&self) -> usize {
        self.compile_count.load(AtomicOrdering::SeqCst)
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register a downloaded file, replacing any file of the same source
    pub fn add(&self, file_info: FileInfo) {
        let mut state = self.state.lock();
        match state
            .files
            .iter_mut()
            .find(|existing| existing.source() == file_info.source())
        {
            Some(existing) => *existing = file_info,
            None => state.files.push(file_info),
        }
    }

    /// Forget the file of `source`
    pub fn remove_info(&self, source: &Source) {
        let mut state = self.state.lock();
        state.files.retain(|file_info| file_info.source() != source);
        if state
            .applied
            .as_ref()
            .map(|applied| applied.contains(source))
            .unwrap_or(false)
        {
            state.stale_engine = true;
        }
    }

    /// Remember the resources to compile with. Older bundles are ignored.
    pub fn update(&self, resources_info: ResourcesInfo) {
        let mut state = self.state.lock();
        let is_newer = state
            .resources_info
            .as_ref()
            .map(|current| compare_versions(&resources_info.version, &current.version) != Ordering::Less)
            .unwrap_or(true);
        if is_newer {
            state.resources_info = Some(resources_info);
        }
    }

    pub fn resources_info(&self) -> Option<ResourcesInfo> {
        self.state.lock().resources_info.clone()
    }

    /// Registered files whose source is enabled, in registration order
    pub fn compilable_files(&self, enabled_sources: &[Source]) -> Vec<FileInfo> {
        self.state
            .lock()
            .files
            .iter()
            .filter(|file_info| enabled_sources.contains(file_info.source()))
            .cloned()
            .collect()
    }

    fn group_for(&self, enabled_sources: &[Source]) -> FilterListGroup {
        FilterListGroup {
            files: self.compilable_files(enabled_sources),
            resources_info: self.resources_info(),
        }
    }

    /// Whether an empty compile set should drop the live engine
    fn should_clear(state: &ManagerState, enabled_sources: &[Source]) -> bool {
        state.stale_engine
            || state
                .applied
                .as_ref()
                .map(|applied| applied.sources().any(|source| !enabled_sources.contains(source)))
                .unwrap_or(false)
    }

    // ========================================================================
    // Compiling
    // ========================================================================

    /// Compile now unless the live engine already matches the inputs
    pub async fn compile_immediately_if_needed(
        &self,
        enabled_sources: &[Source],
        resources_info: Option<&ResourcesInfo>,
        content_blockers: &ContentBlockerManager,
    ) -> CompileOutcome {
        if let Some(resources_info) = resources_info {
            self.update(resources_info.clone());
        }

        let _guard = self.compile_lock.lock().await;
        let group = self.group_for(enabled_sources);
        self.compile_group(group, enabled_sources, content_blockers)
            .await
    }

    /// Schedule a compile after the idle window. Each call restarts the
    /// window, and the compile uses the registry as it is when it fires.
    pub fn compile_delayed_if_needed(
        &self,
        enabled_sources: &[Source],
        resources_info: Option<&ResourcesInfo>,
        content_blockers: &ContentBlockerManager,
    ) {
        if let Some(resources_info) = resources_info {
            self.update(resources_info.clone());
        }

        let group = self.group_for(enabled_sources);
        let fingerprint = group.fingerprint();
        {
            let mut state = self.state.lock();
            if group.is_empty() && !Self::should_clear(&state, enabled_sources) {
                debug!("Nothing to compile for {} engine", self.engine_type);
                return;
            }
            if state.applied.as_ref() == Some(&fingerprint)
                || state.scheduled.as_ref() == Some(&fingerprint)
            {
                debug!("{} engine is already up to date", self.engine_type);
                return;
            }
            state.scheduled = Some(fingerprint);
        }

        debug!("Scheduling {} engine compile", self.engine_type);

        let manager = self.clone();
        let enabled_sources = enabled_sources.to_vec();
        let content_blockers = content_blockers.clone();
        self.debouncer.schedule(move || async move {
            let _guard = manager.compile_lock.lock().await;
            manager.state.lock().scheduled = None;
            let group = manager.group_for(&enabled_sources);
            manager
                .compile_group(group, &enabled_sources, &content_blockers)
                .await;
        });
    }

    /// Wait for a scheduled delayed compile to run
    pub async fn wait_for_pending_compile(&self) {
        self.debouncer.join().await;
    }

    /// Must be called with `compile_lock` held
    async fn compile_group(
        &self,
        group: FilterListGroup,
        enabled_sources: &[Source],
        content_blockers: &ContentBlockerManager,
    ) -> CompileOutcome {
        if group.is_empty() {
            let should_clear = Self::should_clear(&self.state.lock(), enabled_sources);
            return if should_clear {
                self.clear_engine().await
            } else {
                CompileOutcome::Skipped
            };
        }

        let fingerprint = group.fingerprint();
        if self.state.lock().applied.as_ref() == Some(&fingerprint) {
            debug!("{} engine is already up to date", self.engine_type);
            return CompileOutcome::Skipped;
        }

        info!(
            "Compiling {} engine from {} lists",
            self.engine_type,
            group.files.len()
        );
        self.compile_count.fetch_add(1, AtomicOrdering::SeqCst);

        let engine_type = self.engine_type;
        let capacity = self.query_cache_capacity;
        let job_group = group.clone();
        let result = self
            .pool
            .run_blocking(move || {
                let engine = CompiledEngine::compile(engine_type, &job_group, capacity)?;
                let data = engine.serialize()?;
                Ok((engine, data))
            })
            .await;

        let (engine, data) = match result {
            Ok(compiled) => compiled,
            Err(e) => {
                warn!("Failed to compile {} engine: {}", self.engine_type, e);
                return CompileOutcome::Failed;
            }
        };

        // Unreadable lists are missing from the engine's fingerprint, so a
        // later compile picks them up once they can be read
        let fingerprint = engine.fingerprint().clone();
        let sources = engine.source_count();
        self.engine.store(Some(Arc::new(engine)));
        {
            let mut state = self.state.lock();
            state.applied = Some(fingerprint.clone());
            state.stale_engine = false;
        }

        if let Err(e) = self.cache.save(&fingerprint, &data).await {
            warn!("Failed to cache {} engine: {}", self.engine_type, e);
        }

        info!("Compiled {} engine ({} lists)", self.engine_type, sources);
        let _ = self.event_tx.send(ManagerEvent::EngineCompiled {
            engine_type: self.engine_type,
            sources,
            resources_version: fingerprint.resources_version.clone(),
        });

        // Lists registered from a previous launch may not have rule lists yet
        let content_blockers = content_blockers.clone();
        let engine_type = self.engine_type;
        self.pool.spawn(async move {
            for file_info in &group.files {
                content_blockers.ensure_rule_list(file_info, engine_type).await;
            }
        });

        CompileOutcome::Compiled
    }

    async fn clear_engine(&self) -> CompileOutcome {
        let previous = self.engine.swap(None);
        {
            let mut state = self.state.lock();
            state.applied = None;
            state.stale_engine = false;
        }

        if let Err(e) = self.cache.clear().await {
            warn!("Failed to clear {} engine cache: {}", self.engine_type, e);
        }

        if previous.is_none() {
            return CompileOutcome::Skipped;
        }

        info!("Cleared {} engine, no lists remain", self.engine_type);
        let _ = self.event_tx.send(ManagerEvent::EngineCleared {
            engine_type: self.engine_type,
        });
        CompileOutcome::Cleared
    }

    // ========================================================================
    // Cache
    // ========================================================================

    /// Load the engine compiled on a previous launch. Returns false when no
    /// usable cache exists.
    pub async fn load_from_cache(&self, resources_info: Option<&ResourcesInfo>) -> bool {
        if let Some(resources_info) = resources_info {
            self.update(resources_info.clone());
        }

        let _guard = self.compile_lock.lock().await;

        let (info, data) = match self.cache.load().await {
            Ok(Some(cached)) => cached,
            Ok(None) => {
                debug!("No cached {} engine", self.engine_type);
                return false;
            }
            Err(e) => {
                warn!("Ignoring cached {} engine: {}", self.engine_type, e);
                return false;
            }
        };

        let resources_info = self.resources_info();
        let mut fingerprint = info.fingerprint;
        if let Some(resources_info) = &resources_info {
            fingerprint.resources_version = Some(resources_info.version.clone());
        }

        let engine_type = self.engine_type;
        let capacity = self.query_cache_capacity;
        let result = self
            .pool
            .run_blocking(move || {
                CompiledEngine::from_serialized(
                    engine_type,
                    fingerprint,
                    &data,
                    resources_info.as_ref(),
                    capacity,
                )
            })
            .await;

        match result {
            Ok(engine) => {
                let sources = engine.source_count();
                {
                    let mut state = self.state.lock();
                    state.applied = Some(engine.fingerprint().clone());
                    state.stale_engine = false;
                }
                self.engine.store(Some(Arc::new(engine)));

                info!(
                    "Loaded {} engine from cache ({} lists, compiled {})",
                    self.engine_type, sources, info.compiled_at
                );
                let _ = self.event_tx.send(ManagerEvent::EngineLoadedFromCache {
                    engine_type: self.engine_type,
                    sources,
                });
                true
            }
            Err(e) => {
                warn!("Failed to load cached {} engine: {}", self.engine_type, e);
                false
            }
        }
    }

    /// Drop cached query results of the live engine
    pub fn clear_caches(&self) {
        if let Some(engine) = self.engine.load_full() {
            let dropped = engine.cached_query_count();
            engine.clear_caches();
            debug!("Dropped {} cached queries of {} engine", dropped, self.engine_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shields_types::ResourceType;
    use tempfile::TempDir;
    use url::Url;

    struct Fixture {
        dir: TempDir,
        manager: EngineManager,
        content_blockers: ContentBlockerManager,
        events: broadcast::Receiver<ManagerEvent>,
    }

    async fn fixture(compile_delay_ms: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            compile_delay_ms,
            ..Settings::default()
        };
        let pool = CompilePool::new(2);
        let (event_tx, events) = broadcast::channel(64);
        let manager = EngineManager::new(
            EngineType::Standard,
            &dir.path().join("engines"),
            &settings,
            pool.clone(),
            event_tx.clone(),
        );
        let content_blockers =
            ContentBlockerManager::new(dir.path().join("content_blockers.db"), pool, event_tx)
                .await
                .unwrap();

        Fixture {
            dir,
            manager,
            content_blockers,
            events,
        }
    }

    fn write_list(dir: &TempDir, name: &str, version: &str, rules: &str) -> FileInfo {
        let folder = dir.path().join(name).join(version);
        std::fs::create_dir_all(&folder).unwrap();
        let path = folder.join("list.txt");
        std::fs::write(&path, rules).unwrap();
        FileInfo::new(Source::filter_list(name), version, path)
    }

    fn blocks(manager: &EngineManager, request: &str) -> bool {
        manager
            .engine()
            .map(|engine| {
                engine.should_block(
                    &Url::parse(request).unwrap(),
                    &Url::parse("https://site.example.org/").unwrap(),
                    ResourceType::Script,
                    false,
                )
            })
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_identical_inputs_compile_once() {
        let f = fixture(60_000).await;
        let file = write_list(&f.dir, "a", "1.0.0", "||ads.example.com^\n");
        f.manager.add(file);
        let enabled = vec![Source::filter_list("a")];

        let first = f
            .manager
            .compile_immediately_if_needed(&enabled, None, &f.content_blockers)
            .await;
        let second = f
            .manager
            .compile_immediately_if_needed(&enabled, None, &f.content_blockers)
            .await;

        assert_eq!(first, CompileOutcome::Compiled);
        assert_eq!(second, CompileOutcome::Skipped);
        assert_eq!(f.manager.compile_count(), 1);
        assert!(blocks(&f.manager, "https://ads.example.com/x.js"));
    }

    #[tokio::test]
    async fn test_delayed_compiles_collapse() {
        let f = fixture(50).await;
        let enabled = vec![Source::filter_list("a")];

        for version in ["1.0.0", "1.0.1", "1.0.2"] {
            let file = write_list(&f.dir, "a", version, "||ads.example.com^\n");
            f.manager.add(file);
            f.manager
                .compile_delayed_if_needed(&enabled, None, &f.content_blockers);
        }

        assert!(!f.manager.has_engine());
        f.manager.wait_for_pending_compile().await;

        assert_eq!(f.manager.compile_count(), 1);
        let engine = f.manager.engine().unwrap();
        assert_eq!(engine.fingerprint().infos[0].version, "1.0.2");
    }

    #[tokio::test]
    async fn test_failed_compile_keeps_previous_engine() {
        let f = fixture(60_000).await;
        let enabled = vec![Source::filter_list("a")];
        f.manager
            .add(write_list(&f.dir, "a", "1.0.0", "||ads.example.com^\n"));
        f.manager
            .compile_immediately_if_needed(&enabled, None, &f.content_blockers)
            .await;

        f.manager.add(FileInfo::new(
            Source::filter_list("a"),
            "1.0.1",
            f.dir.path().join("missing.txt"),
        ));
        let outcome = f
            .manager
            .compile_immediately_if_needed(&enabled, None, &f.content_blockers)
            .await;

        assert_eq!(outcome, CompileOutcome::Failed);
        assert!(blocks(&f.manager, "https://ads.example.com/x.js"));
        assert_eq!(f.manager.engine().unwrap().fingerprint().infos[0].version, "1.0.0");
    }

    #[tokio::test]
    async fn test_list_readable_later_is_compiled_in() {
        let f = fixture(60_000).await;
        let enabled = vec![Source::filter_list("a"), Source::filter_list("b")];
        f.manager
            .add(write_list(&f.dir, "a", "1", "||ads.a.test^\n"));
        let b_path = f.dir.path().join("b").join("1").join("list.txt");
        f.manager
            .add(FileInfo::new(Source::filter_list("b"), "1", b_path.clone()));

        let first = f
            .manager
            .compile_immediately_if_needed(&enabled, None, &f.content_blockers)
            .await;
        assert_eq!(first, CompileOutcome::Compiled);
        assert!(!f.manager.engine().unwrap().fingerprint().contains(&Source::filter_list("b")));

        write_list(&f.dir, "b", "1", "||ads.b.test^\n");
        let second = f
            .manager
            .compile_immediately_if_needed(&enabled, None, &f.content_blockers)
            .await;

        assert_eq!(second, CompileOutcome::Compiled);
        assert!(blocks(&f.manager, "https://ads.b.test/x.js"));
        assert_eq!(f.manager.engine().unwrap().source_count(), 2);
    }

    #[tokio::test]
    async fn test_removing_last_source_clears_engine() {
        let mut f = fixture(60_000).await;
        let source = Source::filter_list("a");
        f.manager
            .add(write_list(&f.dir, "a", "1.0.0", "||ads.example.com^\n"));
        f.manager
            .compile_immediately_if_needed(&[source.clone()], None, &f.content_blockers)
            .await;

        f.manager.remove_info(&source);
        let outcome = f
            .manager
            .compile_immediately_if_needed(&[source], None, &f.content_blockers)
            .await;

        assert_eq!(outcome, CompileOutcome::Cleared);
        assert!(!f.manager.has_engine());

        let mut saw_cleared = false;
        while let Ok(event) = f.events.try_recv() {
            if matches!(event, ManagerEvent::EngineCleared { .. }) {
                saw_cleared = true;
            }
        }
        assert!(saw_cleared);
    }

    #[tokio::test]
    async fn test_cached_engine_survives_restart() {
        let f = fixture(60_000).await;
        let enabled = vec![Source::filter_list("a")];
        f.manager
            .add(write_list(&f.dir, "a", "1.0.0", "||ads.example.com^\n"));
        f.manager
            .compile_immediately_if_needed(&enabled, None, &f.content_blockers)
            .await;

        let (event_tx, _) = broadcast::channel(8);
        let restarted = EngineManager::new(
            EngineType::Standard,
            &f.dir.path().join("engines"),
            &Settings::default(),
            CompilePool::new(1),
            event_tx,
        );
        assert!(restarted.load_from_cache(None).await);
        assert!(blocks(&restarted, "https://ads.example.com/x.js"));

        // An empty registry after launch keeps the cached engine
        let outcome = restarted
            .compile_immediately_if_needed(&enabled, None, &f.content_blockers)
            .await;
        assert_eq!(outcome, CompileOutcome::Skipped);
        assert!(restarted.has_engine());
        assert_eq!(restarted.compile_count(), 0);
    }

    #[tokio::test]
    async fn test_older_resources_are_ignored() {
        let f = fixture(60_000).await;
        f.manager
            .update(ResourcesInfo::from_file_path("/r/1.0.5/resources.json"));
        f.manager
            .update(ResourcesInfo::from_file_path("/r/1.0.4/resources.json"));

        assert_eq!(f.manager.resources_info().unwrap().version, "1.0.5");
    }
}
