//! A compiled filtering engine with per-engine query caches

use crate::engine::{CompileFingerprint, FilterListGroup};
use crate::error::ShieldsError;
use adblock::lists::{FilterSet, ParseOptions};
use adblock::request::Request;
use adblock::resources::Resource;
use adblock::Engine;
use moka::sync::Cache;
use shields_types::{
    CosmeticFilterModel, EngineScriptConfiguration, EngineType, ResourceType, ResourcesInfo,
    ScriptType,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

type BlockKey = (String, String, ResourceType, bool);

/// An engine built from one [`FilterListGroup`]
pub struct CompiledEngine {
    engine_type: EngineType,
    fingerprint: CompileFingerprint,
    engine: Engine,
    /// Network decisions keyed by request url, source url, type and mode
    block_results: Cache<BlockKey, bool>,
    /// Cosmetic models keyed by frame url, `None` when nothing applies
    cosmetic_models: Cache<String, Option<Arc<CosmeticFilterModel>>>,
}

impl CompiledEngine {
    /// Compile the lists of `group`. This is CPU heavy and blocks.
    ///
    /// Lists that cannot be read are skipped and left out of the
    /// fingerprint. The compile fails only when none of them can be read.
    pub fn compile(
        engine_type: EngineType,
        group: &FilterListGroup,
        cache_capacity: u64,
    ) -> Result<Self, ShieldsError> {
        let mut filter_set = FilterSet::new(false);
        let mut compiled = FilterListGroup {
            files: Vec::with_capacity(group.files.len()),
            resources_info: group.resources_info.clone(),
        };

        for file_info in &group.files {
            match std::fs::read_to_string(&file_info.local_file_path) {
                Ok(text) => {
                    filter_set.add_filter_list(&text, ParseOptions::default());
                    compiled.files.push(file_info.clone());
                }
                Err(e) => warn!(
                    "Skipping {} v{} for {} engine: {}",
                    file_info.source(),
                    file_info.version(),
                    engine_type,
                    e
                ),
            }
        }

        if compiled.is_empty() {
            return Err(ShieldsError::compile(
                format!("{} engine", engine_type),
                "none of the filter lists could be read",
            ));
        }

        let mut engine = Engine::from_filter_set(filter_set, true);
        if let Some(resources_info) = &group.resources_info {
            apply_resources(&mut engine, resources_info);
        }

        debug!(
            "Compiled {} engine from {} lists",
            engine_type,
            compiled.files.len()
        );

        Ok(Self::with_engine(
            engine_type,
            compiled.fingerprint(),
            engine,
            cache_capacity,
        ))
    }

    /// Restore an engine from bytes produced by [`CompiledEngine::serialize`]
    pub fn from_serialized(
        engine_type: EngineType,
        fingerprint: CompileFingerprint,
        data: &[u8],
        resources_info: Option<&ResourcesInfo>,
        cache_capacity: u64,
    ) -> Result<Self, ShieldsError> {
        let mut engine = Engine::new(true);
        engine
            .deserialize(data)
            .map_err(|e| ShieldsError::CacheLoad(format!("{:?}", e)))?;

        if let Some(resources_info) = resources_info {
            apply_resources(&mut engine, resources_info);
        }

        Ok(Self::with_engine(
            engine_type,
            fingerprint,
            engine,
            cache_capacity,
        ))
    }

    fn with_engine(
        engine_type: EngineType,
        fingerprint: CompileFingerprint,
        engine: Engine,
        cache_capacity: u64,
    ) -> Self {
        Self {
            engine_type,
            fingerprint,
            engine,
            block_results: Cache::new(cache_capacity),
            cosmetic_models: Cache::new(cache_capacity),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ShieldsError> {
        self.engine
            .serialize_raw()
            .map_err(|e| ShieldsError::Serialization(format!("{:?}", e)))
    }

    pub fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    /// List versions and resources version this engine was built from
    pub fn fingerprint(&self) -> &CompileFingerprint {
        &self.fingerprint
    }

    pub fn source_count(&self) -> usize {
        self.fingerprint.infos.len()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Whether a network request should be blocked.
    ///
    /// Outside aggressive mode only third-party requests are blocked,
    /// unless this engine is always aggressive.
    pub fn should_block(
        &self,
        request_url: &Url,
        source_url: &Url,
        resource_type: ResourceType,
        is_aggressive_mode: bool,
    ) -> bool {
        let key = (
            request_url.to_string(),
            source_url.to_string(),
            resource_type,
            is_aggressive_mode,
        );
        if let Some(blocked) = self.block_results.get(&key) {
            return blocked;
        }

        let request = Request::new(request_url.as_str(), source_url.as_str(), resource_type.as_str())
            .or_else(|_| Request::new(request_url.as_str(), "", "other"));

        let blocked = match request {
            Ok(request) => {
                let applies = is_aggressive_mode
                    || self.engine_type.is_always_aggressive()
                    || request.is_third_party;
                applies && self.engine.check_network_request(&request).matched
            }
            Err(_) => {
                debug!("Unparseable request, allowing: {}", request_url);
                false
            }
        };

        self.block_results.insert(key, blocked);
        blocked
    }

    /// Cosmetic filtering for a frame, `None` when nothing applies
    pub fn cosmetic_filter_model(
        &self,
        frame_url: &Url,
    ) -> Result<Option<Arc<CosmeticFilterModel>>, ShieldsError> {
        if !matches!(frame_url.scheme(), "http" | "https") {
            return Ok(None);
        }

        if let Some(cached) = self.cosmetic_models.get(frame_url.as_str()) {
            return Ok(cached);
        }

        let resources = self.engine.url_cosmetic_resources(frame_url.as_str());
        let model: CosmeticFilterModel = serde_json::from_value(serde_json::to_value(&resources)?)?;
        let model = (!model.is_empty()).then(|| Arc::new(model));

        self.cosmetic_models
            .insert(frame_url.to_string(), model.clone());
        Ok(model)
    }

    /// Scripts this engine needs injected into a frame
    pub fn make_engine_script_types(
        &self,
        frame_url: &Url,
        is_main_frame: bool,
        is_de_amp_enabled: bool,
        order: usize,
    ) -> Result<HashSet<ScriptType>, ShieldsError> {
        let mut script_types = HashSet::new();

        if let Some(model) = self.cosmetic_filter_model(frame_url)? {
            if !model.injected_script.is_empty() {
                script_types.insert(ScriptType::EngineScript(EngineScriptConfiguration {
                    frame_url: frame_url.to_string(),
                    is_main_frame,
                    source: model.injected_script.clone(),
                    order,
                    is_de_amp_enabled,
                }));
            }
        }

        Ok(script_types)
    }

    /// Number of query results currently cached
    pub fn cached_query_count(&self) -> u64 {
        self.block_results.run_pending_tasks();
        self.cosmetic_models.run_pending_tasks();
        self.block_results.entry_count() + self.cosmetic_models.entry_count()
    }

    /// Drop cached query results
    pub fn clear_caches(&self) {
        self.block_results.invalidate_all();
        self.cosmetic_models.invalidate_all();
    }
}

impl fmt::Debug for CompiledEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledEngine")
            .field("engine_type", &self.engine_type)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Load the scriptlet resources into `engine`. An engine without resources
/// still blocks, so failures only warn.
fn apply_resources(engine: &mut Engine, resources_info: &ResourcesInfo) {
    match read_resources(resources_info) {
        Ok(resources) => engine.use_resources(resources),
        Err(e) => warn!(
            "Resources v{} not applied: {}",
            resources_info.version, e
        ),
    }
}

fn read_resources(resources_info: &ResourcesInfo) -> Result<Vec<Resource>, ShieldsError> {
    let text = std::fs::read_to_string(&resources_info.local_file_path)?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shields_types::{FileInfo, Source};
    use tempfile::TempDir;

    fn group_with(dir: &TempDir, rules: &str) -> FilterListGroup {
        let path = dir.path().join("list.txt");
        std::fs::write(&path, rules).unwrap();
        FilterListGroup {
            files: vec![FileInfo::new(Source::filter_list("test"), "1.0.0", path)],
            resources_info: None,
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_should_block_matches_rules() {
        let dir = TempDir::new().unwrap();
        let group = group_with(&dir, "||ads.example.com^\n");
        let engine = CompiledEngine::compile(EngineType::Standard, &group, 100).unwrap();

        assert!(engine.should_block(
            &url("https://ads.example.com/banner.js"),
            &url("https://news.example.org/"),
            ResourceType::Script,
            false,
        ));
        assert!(!engine.should_block(
            &url("https://cdn.example.org/app.js"),
            &url("https://news.example.org/"),
            ResourceType::Script,
            false,
        ));
        // Cached answers are stable
        assert!(engine.should_block(
            &url("https://ads.example.com/banner.js"),
            &url("https://news.example.org/"),
            ResourceType::Script,
            false,
        ));
    }

    #[test]
    fn test_first_party_requests_need_aggressive_mode() {
        let dir = TempDir::new().unwrap();
        let group = group_with(&dir, "||ads.a.test^\n");
        let request = url("https://ads.a.test/x.js");
        let source = url("https://ads.a.test/");

        let standard = CompiledEngine::compile(EngineType::Standard, &group, 100).unwrap();
        assert!(!standard.should_block(&request, &source, ResourceType::Script, false));
        assert!(standard.should_block(&request, &source, ResourceType::Script, true));
        assert!(standard.should_block(
            &request,
            &url("https://news.b.test/"),
            ResourceType::Script,
            false,
        ));

        let aggressive = CompiledEngine::compile(EngineType::Aggressive, &group, 100).unwrap();
        assert!(aggressive.should_block(&request, &source, ResourceType::Script, false));
    }

    #[test]
    fn test_unreadable_lists_are_left_out_of_fingerprint() {
        let dir = TempDir::new().unwrap();
        let mut group = group_with(&dir, "||ads.example.com^\n");
        group.files.push(FileInfo::new(
            Source::filter_list("late"),
            "1.0.0",
            dir.path().join("late.txt"),
        ));

        let engine = CompiledEngine::compile(EngineType::Standard, &group, 100).unwrap();
        assert_eq!(engine.source_count(), 1);
        assert!(!engine.fingerprint().contains(&Source::filter_list("late")));
        assert_ne!(engine.fingerprint(), &group.fingerprint());
    }

    #[test]
    fn test_compile_fails_without_readable_lists() {
        let group = FilterListGroup {
            files: vec![FileInfo::new(
                Source::filter_list("gone"),
                "1.0.0",
                "/nonexistent/list.txt",
            )],
            resources_info: None,
        };

        let result = CompiledEngine::compile(EngineType::Standard, &group, 100);
        assert!(matches!(result, Err(ShieldsError::Compile { .. })));
    }

    #[test]
    fn test_serialized_engine_keeps_rules() {
        let dir = TempDir::new().unwrap();
        let group = group_with(&dir, "||tracker.example.net^\n");
        let engine = CompiledEngine::compile(EngineType::Aggressive, &group, 100).unwrap();
        let data = engine.serialize().unwrap();

        let restored = CompiledEngine::from_serialized(
            EngineType::Aggressive,
            engine.fingerprint().clone(),
            &data,
            None,
            100,
        )
        .unwrap();

        assert_eq!(restored.fingerprint(), engine.fingerprint());
        assert!(restored.should_block(
            &url("https://tracker.example.net/pixel.gif"),
            &url("https://shop.example.com/"),
            ResourceType::Image,
            false,
        ));
    }

    #[test]
    fn test_cosmetic_model_for_hidden_selectors() {
        let dir = TempDir::new().unwrap();
        let group = group_with(&dir, "example.com##.sponsored\n");
        let engine = CompiledEngine::compile(EngineType::Standard, &group, 100).unwrap();

        let model = engine
            .cosmetic_filter_model(&url("https://example.com/article"))
            .unwrap()
            .unwrap();
        assert!(model.hide_selectors.contains(".sponsored"));

        let other = engine
            .cosmetic_filter_model(&url("https://other.org/"))
            .unwrap();
        assert!(other.is_none());

        assert!(engine
            .cosmetic_filter_model(&url("about:blank"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_no_scripts_without_scriptlets() {
        let dir = TempDir::new().unwrap();
        let group = group_with(&dir, "example.com##.sponsored\n");
        let engine = CompiledEngine::compile(EngineType::Standard, &group, 100).unwrap();

        let scripts = engine
            .make_engine_script_types(&url("https://example.com/"), true, false, 0)
            .unwrap();
        assert!(scripts.is_empty());
    }
}
