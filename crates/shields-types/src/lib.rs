//! Shared types for Shields
//!
//! This crate contains the data structures shared by the core library and
//! the CLI: filter-list sources and their downloaded files, blocklist
//! identities, per-domain shield settings and the values handed back to the
//! browsing layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Sources
// ============================================================================

/// Component id of the default ad-block list.
///
/// Its native rules ship with the app as [`GenericBlocklistType::BlockAds`],
/// so it never gets a per-source blocklist.
pub const DEFAULT_LIST_COMPONENT_ID: &str = "iodkpdagapdfkphljnddpjlldadblomo";

/// Identifies a single filter list
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    /// A subscription list delivered as a component
    FilterList { component_id: String },
    /// A list the user added by URL
    CustomList { uuid: String },
}

impl Source {
    pub fn filter_list(component_id: impl Into<String>) -> Self {
        Self::FilterList {
            component_id: component_id.into(),
        }
    }

    pub fn custom_list(uuid: impl Into<String>) -> Self {
        Self::CustomList { uuid: uuid.into() }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::FilterList { component_id } => component_id,
            Self::CustomList { uuid } => uuid,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Self::CustomList { .. })
    }

    /// The native blocklist compiled for this source on the given engine,
    /// or `None` when its rules are bundled instead.
    pub fn blocklist_type(&self, engine_type: EngineType) -> Option<BlocklistType> {
        match self {
            Self::FilterList { component_id } if component_id == DEFAULT_LIST_COMPONENT_ID => None,
            _ => Some(BlocklistType::EngineSource {
                source: self.clone(),
                engine_type,
            }),
        }
    }

    fn kind_str(&self) -> &'static str {
        match self {
            Self::FilterList { .. } => "filter-list",
            Self::CustomList { .. } => "custom-list",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind_str(), self.id())
    }
}

/// Version identity of one filter list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterListInfo {
    pub source: Source,
    pub version: String,
}

/// A downloaded filter list that is ready to be compiled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub filter_list_info: FilterListInfo,
    pub local_file_path: PathBuf,
}

impl FileInfo {
    pub fn new(source: Source, version: impl Into<String>, local_file_path: impl Into<PathBuf>) -> Self {
        Self {
            filter_list_info: FilterListInfo {
                source,
                version: version.into(),
            },
            local_file_path: local_file_path.into(),
        }
    }

    pub fn source(&self) -> &Source {
        &self.filter_list_info.source
    }

    pub fn version(&self) -> &str {
        &self.filter_list_info.version
    }
}

/// The shared scriptlet/resource bundle every engine is built with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesInfo {
    pub local_file_path: PathBuf,
    pub version: String,
}

impl ResourcesInfo {
    /// Component files live in a folder named after their version, so the
    /// version is taken from the parent folder of `path`.
    pub fn from_file_path(path: impl Into<PathBuf>) -> Self {
        let local_file_path = path.into();
        let version = local_file_path
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            local_file_path,
            version,
        }
    }

    /// Whether this bundle should replace `current`
    pub fn is_newer_than(&self, current: &ResourcesInfo) -> bool {
        compare_versions(&self.version, &current.version) == Ordering::Greater
    }
}

/// Orders component version strings.
///
/// Versions are split on `.`; parts that are both integers compare
/// numerically (so `"10" > "9"`), anything else compares as text. When one
/// version is a prefix of the other the longer one is newer.
pub fn compare_versions(lhs: &str, rhs: &str) -> Ordering {
    let mut lhs_parts = lhs.split('.');
    let mut rhs_parts = rhs.split('.');

    loop {
        match (lhs_parts.next(), rhs_parts.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => {
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

// ============================================================================
// Engine Types
// ============================================================================

/// The two independently compiled engine configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Standard,
    Aggressive,
}

impl EngineType {
    pub const ALL: [EngineType; 2] = [EngineType::Standard, EngineType::Aggressive];

    /// Lists on the aggressive engine block first-party requests even when
    /// the domain is on the standard level.
    pub fn is_always_aggressive(self) -> bool {
        matches!(self, Self::Aggressive)
    }

    pub fn cache_folder_name(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cache_folder_name())
    }
}

// ============================================================================
// Blocklist Types
// ============================================================================

/// Rule lists bundled with the app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenericBlocklistType {
    BlockAds,
    BlockTrackers,
    BlockCookies,
    UpgradeMixedContent,
}

impl GenericBlocklistType {
    pub const ALL: [GenericBlocklistType; 4] = [
        GenericBlocklistType::BlockAds,
        GenericBlocklistType::BlockTrackers,
        GenericBlocklistType::BlockCookies,
        GenericBlocklistType::UpgradeMixedContent,
    ];

    /// Version of the bundled asset. Bump when the asset changes so cached
    /// rule lists are rebuilt.
    pub fn version(self) -> &'static str {
        match self {
            Self::BlockAds => "2",
            Self::BlockTrackers => "2",
            Self::BlockCookies => "1",
            Self::UpgradeMixedContent => "1",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlockAds => "block-ads",
            Self::BlockTrackers => "block-trackers",
            Self::BlockCookies => "block-cookies",
            Self::UpgradeMixedContent => "upgrade-mixed-content",
        }
    }
}

/// How a native rule list treats first-party loads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockingMode {
    /// Bundled lists, which have a single form
    General,
    /// Blocking rules only apply to third-party loads
    Standard,
    /// Rules apply as written
    Aggressive,
}

impl BlockingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Standard => "standard",
            Self::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for BlockingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(Self::General),
            "standard" => Ok(Self::Standard),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(format!("Unknown blocking mode: {}", other)),
        }
    }
}

/// Identity of a native rule list
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlocklistType {
    Generic(GenericBlocklistType),
    EngineSource { source: Source, engine_type: EngineType },
}

impl BlocklistType {
    /// Every bundled blocklist
    pub fn all_static_types() -> BTreeSet<BlocklistType> {
        GenericBlocklistType::ALL
            .into_iter()
            .map(BlocklistType::Generic)
            .collect()
    }

    pub fn allowed_modes(&self) -> BTreeSet<BlockingMode> {
        match self {
            Self::Generic(_) => BTreeSet::from([BlockingMode::General]),
            Self::EngineSource { engine_type, .. } if engine_type.is_always_aggressive() => {
                BTreeSet::from([BlockingMode::Aggressive])
            }
            Self::EngineSource { .. } => {
                BTreeSet::from([BlockingMode::Standard, BlockingMode::Aggressive])
            }
        }
    }

    /// The mode to load for a page on the given shield level
    pub fn mode(&self, is_aggressive_mode: bool) -> BlockingMode {
        match self {
            Self::Generic(_) => BlockingMode::General,
            Self::EngineSource { engine_type, .. }
                if engine_type.is_always_aggressive() || is_aggressive_mode =>
            {
                BlockingMode::Aggressive
            }
            Self::EngineSource { .. } => BlockingMode::Standard,
        }
    }

    pub fn identifier(&self) -> String {
        match self {
            Self::Generic(generic_type) => format!("generic-{}", generic_type.as_str()),
            Self::EngineSource {
                source,
                engine_type,
            } => format!("{}-{}-{}", engine_type, source.kind_str(), source.id()),
        }
    }

    pub fn rule_list_identifier(&self, mode: BlockingMode) -> String {
        format!("{}-{}", self.identifier(), mode)
    }
}

impl fmt::Display for BlocklistType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

/// A compiled native rule list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleList {
    pub identifier: String,
    pub blocklist_type: BlocklistType,
    pub mode: BlockingMode,
    pub version: String,
    pub rule_count: usize,
    /// Encoded rule document handed to the native content blocker
    pub encoded: String,
    pub compiled_at: DateTime<Utc>,
}

impl PartialEq for RuleList {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier && self.version == other.version
    }
}

impl Eq for RuleList {}

impl Hash for RuleList {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
        self.version.hash(state);
    }
}

// ============================================================================
// Domain Types
// ============================================================================

/// Ad and tracker blocking level for a site
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShieldLevel {
    Disabled,
    #[default]
    Standard,
    Aggressive,
}

impl ShieldLevel {
    pub fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub fn is_aggressive(self) -> bool {
        matches!(self, Self::Aggressive)
    }
}

/// Shields that can be expected on a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShieldType {
    AdBlockAndTp,
}

/// Shield settings for the site being loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    #[serde(default)]
    pub all_shields_off: bool,
    #[serde(default)]
    pub block_level: ShieldLevel,
    #[serde(default)]
    pub block_all_cookies: bool,
    #[serde(default = "default_upgrade_mixed_content")]
    pub upgrade_mixed_content: bool,
}

fn default_upgrade_mixed_content() -> bool {
    true
}

impl Domain {
    pub fn with_level(block_level: ShieldLevel) -> Self {
        Self {
            block_level,
            ..Self::default()
        }
    }

    pub fn shields_off() -> Self {
        Self {
            all_shields_off: true,
            ..Self::default()
        }
    }

    pub fn is_shield_expected(&self, shield: ShieldType) -> bool {
        if self.all_shields_off {
            return false;
        }

        match shield {
            ShieldType::AdBlockAndTp => self.block_level.is_enabled(),
        }
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self {
            all_shields_off: false,
            block_level: ShieldLevel::Standard,
            block_all_cookies: false,
            upgrade_mixed_content: default_upgrade_mixed_content(),
        }
    }
}

// ============================================================================
// Query Types
// ============================================================================

/// Kind of resource a request loads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Document,
    Subdocument,
    Script,
    Stylesheet,
    Image,
    Font,
    Xhr,
    Media,
    Websocket,
    Ping,
    Other,
}

impl ResourceType {
    /// Request type string understood by the filtering engine
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Subdocument => "subdocument",
            Self::Script => "script",
            Self::Stylesheet => "stylesheet",
            Self::Image => "image",
            Self::Font => "font",
            Self::Xhr => "xmlhttprequest",
            Self::Media => "media",
            Self::Websocket => "websocket",
            Self::Ping => "ping",
            Self::Other => "other",
        }
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "document" | "main_frame" => Ok(Self::Document),
            "subdocument" | "sub_frame" => Ok(Self::Subdocument),
            "script" => Ok(Self::Script),
            "stylesheet" => Ok(Self::Stylesheet),
            "image" => Ok(Self::Image),
            "font" => Ok(Self::Font),
            "xhr" | "xmlhttprequest" => Ok(Self::Xhr),
            "media" => Ok(Self::Media),
            "websocket" => Ok(Self::Websocket),
            "ping" => Ok(Self::Ping),
            "other" => Ok(Self::Other),
            other => Err(format!("Unknown resource type: {}", other)),
        }
    }
}

/// A script an engine needs injected into a frame
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "configuration", rename_all = "snake_case")]
pub enum ScriptType {
    EngineScript(EngineScriptConfiguration),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineScriptConfiguration {
    pub frame_url: String,
    pub is_main_frame: bool,
    pub source: String,
    /// Position of the engine that produced the script, scripts run in order
    pub order: usize,
    pub is_de_amp_enabled: bool,
}

/// Cosmetic filtering instructions for one frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosmeticFilterModel {
    #[serde(default)]
    pub hide_selectors: BTreeSet<String>,
    #[serde(default)]
    pub procedural_actions: BTreeSet<String>,
    #[serde(default)]
    pub exceptions: BTreeSet<String>,
    #[serde(default)]
    pub injected_script: String,
    #[serde(default)]
    pub generichide: bool,
}

impl CosmeticFilterModel {
    pub fn is_empty(&self) -> bool {
        self.hide_selectors.is_empty()
            && self.procedural_actions.is_empty()
            && self.injected_script.is_empty()
            && !self.generichide
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Idle window before a debounced engine compile runs
    #[serde(default = "default_compile_delay_ms")]
    pub compile_delay_ms: u64,
    /// Upper bound on engine and rule-list compiles running at once
    #[serde(default = "default_max_concurrent_compiles")]
    pub max_concurrent_compiles: usize,
    /// Entries kept per engine in each query cache
    #[serde(default = "default_query_cache_capacity")]
    pub query_cache_capacity: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_compile_delay_ms() -> u64 {
    60_000
}

fn default_max_concurrent_compiles() -> usize {
    2
}

fn default_query_cache_capacity() -> u64 {
    1_000
}

fn default_event_capacity() -> usize {
    256
}

impl Settings {
    pub fn compile_delay(&self) -> Duration {
        Duration::from_millis(self.compile_delay_ms)
    }

    /// Default location of the data directory
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("shields"))
            .unwrap_or_else(|| PathBuf::from(".shields"))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            compile_delay_ms: default_compile_delay_ms(),
            max_concurrent_compiles: default_max_concurrent_compiles(),
            query_cache_capacity: default_query_cache_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// User settings for one filter list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterListSetting {
    pub source: Source,
    pub is_enabled: bool,
    #[serde(default)]
    pub is_always_aggressive: bool,
    #[serde(default)]
    pub order: Option<i32>,
    /// Last downloaded component folder, relative to the components directory
    #[serde(default)]
    pub folder_path: Option<PathBuf>,
}

/// Pointers persisted between launches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    #[serde(default)]
    pub last_resources_file_path: Option<PathBuf>,
    /// Older releases stored the component folder instead of the file
    #[serde(default)]
    pub last_resources_folder_path: Option<PathBuf>,
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ManagerEvent {
    EngineCompiled {
        engine_type: EngineType,
        sources: usize,
        resources_version: Option<String>,
    },
    EngineLoadedFromCache {
        engine_type: EngineType,
        sources: usize,
    },
    EngineCleared {
        engine_type: EngineType,
    },
    RuleListCompiled {
        identifier: String,
        version: String,
    },
    RuleListsRemoved {
        identifiers: Vec<String>,
    },
    ResourcesUpdated {
        version: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_versions_numeric_parts() {
        assert_eq!(compare_versions("1.0.10", "1.0.9"), Ordering::Greater);
        assert_eq!(compare_versions("10", "9"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2"), Ordering::Equal);
        assert_eq!(compare_versions("1.2", "1.2.1"), Ordering::Less);
        assert_eq!(compare_versions("1.b", "1.a"), Ordering::Greater);
    }

    #[test]
    fn test_resources_info_version_from_folder() {
        let info = ResourcesInfo::from_file_path("/components/resources/1.0.42/resources.json");
        assert_eq!(info.version, "1.0.42");

        let older = ResourcesInfo::from_file_path("/components/resources/1.0.9/resources.json");
        assert!(info.is_newer_than(&older));
        assert!(!older.is_newer_than(&info));
        assert!(!info.is_newer_than(&info));
    }

    #[test]
    fn test_default_list_has_no_blocklist() {
        let default_list = Source::filter_list(DEFAULT_LIST_COMPONENT_ID);
        assert_eq!(default_list.blocklist_type(EngineType::Standard), None);

        let regional = Source::filter_list("regional");
        assert_eq!(
            regional.blocklist_type(EngineType::Aggressive),
            Some(BlocklistType::EngineSource {
                source: regional.clone(),
                engine_type: EngineType::Aggressive,
            })
        );
    }

    #[test]
    fn test_blocklist_modes() {
        let generic = BlocklistType::Generic(GenericBlocklistType::BlockAds);
        assert_eq!(generic.mode(true), BlockingMode::General);
        assert_eq!(generic.allowed_modes(), BTreeSet::from([BlockingMode::General]));

        let standard = Source::custom_list("abc")
            .blocklist_type(EngineType::Standard)
            .unwrap();
        assert_eq!(standard.mode(false), BlockingMode::Standard);
        assert_eq!(standard.mode(true), BlockingMode::Aggressive);

        let aggressive = Source::custom_list("abc")
            .blocklist_type(EngineType::Aggressive)
            .unwrap();
        assert_eq!(aggressive.mode(false), BlockingMode::Aggressive);
        assert_eq!(
            aggressive.allowed_modes(),
            BTreeSet::from([BlockingMode::Aggressive])
        );
        assert_ne!(standard.identifier(), aggressive.identifier());
    }

    #[test]
    fn test_domain_shield_expectations() {
        assert!(Domain::default().is_shield_expected(ShieldType::AdBlockAndTp));
        assert!(!Domain::shields_off().is_shield_expected(ShieldType::AdBlockAndTp));
        assert!(!Domain::with_level(ShieldLevel::Disabled).is_shield_expected(ShieldType::AdBlockAndTp));
    }

    #[test]
    fn test_blocklist_type_json_key_is_stable() {
        let blocklist_type = Source::filter_list("abc")
            .blocklist_type(EngineType::Standard)
            .unwrap();
        let encoded = serde_json::to_string(&blocklist_type).unwrap();
        let decoded: BlocklistType = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, blocklist_type);
    }
}
