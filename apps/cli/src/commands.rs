//! CLI command implementations

use crate::output::{domain_for, parse_source, print_output, truncate};
use crate::progress::CompileProgress;
use crate::{ListAction, OutputFormat};
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use serde::Serialize;
use shields_core::{FilterListSourceProvider, GroupsManager, SourceProvider, Storage};
use shields_types::{
    BlockingMode, EngineType, FileInfo, FilterListSetting, ResourceType, ScriptType, ShieldLevel,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{Table, Tabled};
use tracing::debug;
use url::Url;

/// Everything a command needs, opened from the data directory
pub struct App {
    pub groups: GroupsManager,
    storage: Storage,
    provider: Arc<FilterListSourceProvider>,
}

impl App {
    /// Open the data directory and restore cached engines
    pub async fn open(data_dir: PathBuf) -> Result<Self> {
        debug!("Opening data directory {}", data_dir.display());
        let storage = Storage::new(data_dir).await?;
        let settings = storage.load_settings().await?;
        let lists = storage.load_filter_lists().await?;

        let provider = Arc::new(FilterListSourceProvider::new(lists, storage.components_dir()));
        let groups = GroupsManager::new(storage.clone(), &settings, provider.clone()).await?;

        groups.load_resources_from_cache().await?;
        groups.load_engines_from_cache().await;

        Ok(Self {
            groups,
            storage,
            provider,
        })
    }

    async fn save_lists(&self) -> Result<()> {
        self.storage
            .save_filter_lists(&self.provider.settings())
            .await?;
        Ok(())
    }

    /// Downloaded files of every known list
    fn downloaded_files(&self) -> Vec<FileInfo> {
        self.provider
            .settings()
            .iter()
            .filter_map(|setting| self.provider.file_info(setting))
            .collect()
    }
}

fn parse_url(value: &str) -> Result<Url> {
    Url::parse(value).with_context(|| format!("Invalid URL: {}", value))
}

// ============================================================================
// Sync
// ============================================================================

#[derive(Serialize)]
struct EngineStatus {
    engine_type: EngineType,
    compiled: bool,
    sources: usize,
    resources_version: Option<String>,
}

#[derive(Serialize)]
struct SyncReport {
    engines: Vec<EngineStatus>,
    rule_lists: usize,
    /// Enabled lists that have not been downloaded yet
    missing: Vec<String>,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for engine in &self.engines {
            if engine.compiled {
                writeln!(
                    f,
                    "{} {} engine: {} list(s){}",
                    style("✓").green().bold(),
                    style(engine.engine_type).bold(),
                    engine.sources,
                    engine
                        .resources_version
                        .as_ref()
                        .map(|v| format!(", resources v{}", v))
                        .unwrap_or_default()
                )?;
            } else {
                writeln!(
                    f,
                    "{} {} engine: not compiled",
                    style("○").dim(),
                    style(engine.engine_type).bold()
                )?;
            }
        }

        write!(f, "{} rule list(s) cached", style(self.rule_lists).bold())?;

        for source in &self.missing {
            write!(f, "\n{} {} has not been downloaded", style("!").yellow(), source)?;
        }
        Ok(())
    }
}

pub async fn sync(app: &App, format: OutputFormat) -> Result<()> {
    let progress = CompileProgress::start("Compiling filter lists", app.groups.subscribe());

    app.groups.load_bundled_data_if_needed().await;

    let files = app.downloaded_files();
    if !files.is_empty() {
        app.groups.update_file_infos_immediately(&files).await;
    }
    app.groups.compile_engines_if_needed().await;
    app.groups.wait_for_background_tasks().await;

    progress.finish("Filter lists are up to date");

    let downloaded: Vec<_> = files.iter().map(|file| file.source().clone()).collect();
    let missing = app
        .provider
        .enabled_sources()
        .into_iter()
        .filter(|source| !downloaded.contains(source))
        .map(|source| source.to_string())
        .collect();

    let engines = EngineType::ALL
        .into_iter()
        .map(|engine_type| {
            let engine = app.groups.manager(engine_type).engine();
            EngineStatus {
                engine_type,
                compiled: engine.is_some(),
                sources: engine.as_ref().map(|e| e.source_count()).unwrap_or(0),
                resources_version: engine.and_then(|e| e.fingerprint().resources_version.clone()),
            }
        })
        .collect();

    let report = SyncReport {
        engines,
        rule_lists: app.groups.content_blocker_manager().cached_rule_lists().len(),
        missing,
    };

    print_output(&report, format)
}

// ============================================================================
// Query Commands
// ============================================================================

#[derive(Serialize)]
struct CheckResult {
    url: String,
    source: String,
    resource_type: ResourceType,
    blocked: bool,
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.blocked {
            write!(f, "{} blocked: {}", style("✗").red().bold(), self.url)
        } else {
            write!(f, "{} allowed: {}", style("✓").green().bold(), self.url)
        }
    }
}

pub async fn check(
    app: &App,
    url: &str,
    source: &str,
    resource_type: ResourceType,
    level: ShieldLevel,
    format: OutputFormat,
) -> Result<()> {
    let request_url = parse_url(url)?;
    let source_url = parse_url(source)?;
    let domain = domain_for(level, false, true);

    if level.is_enabled() && app.groups.cached_engines(&domain).is_empty() {
        eprintln!(
            "{} No compiled engine, run `shields sync` first",
            style("!").yellow()
        );
    }

    let blocked = app
        .groups
        .should_block(&request_url, &source_url, resource_type, &domain)
        .await;

    print_output(
        &CheckResult {
            url: url.to_string(),
            source: source.to_string(),
            resource_type,
            blocked,
        },
        format,
    )
}

#[derive(Serialize)]
struct CosmeticEntry {
    always_aggressive: bool,
    hide_selectors: Vec<String>,
    procedural_actions: usize,
    exceptions: usize,
    has_injected_script: bool,
    generichide: bool,
}

#[derive(Serialize)]
struct CosmeticReport {
    frame_url: String,
    models: Vec<CosmeticEntry>,
    scripts: Vec<ScriptType>,
}

impl fmt::Display for CosmeticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.models.is_empty() {
            write!(f, "{}", style("No cosmetic filters").dim())?;
        }

        for (index, model) in self.models.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            writeln!(
                f,
                "{} {} engine",
                style("•").cyan(),
                if model.always_aggressive { "aggressive" } else { "standard" }
            )?;
            write!(
                f,
                "    {} selector(s), {} procedural, {} exception(s){}{}",
                model.hide_selectors.len(),
                model.procedural_actions,
                model.exceptions,
                if model.has_injected_script { ", scriptlets" } else { "" },
                if model.generichide { ", generichide" } else { "" }
            )?;
            for selector in model.hide_selectors.iter().take(10) {
                write!(f, "\n    {}", style(selector).dim())?;
            }
        }

        if !self.scripts.is_empty() {
            write!(f, "\n{} engine script(s)", self.scripts.len())?;
        }
        Ok(())
    }
}

pub async fn cosmetic(
    app: &App,
    url: &str,
    level: ShieldLevel,
    is_main_frame: bool,
    is_de_amp_enabled: bool,
    format: OutputFormat,
) -> Result<()> {
    let frame_url = parse_url(url)?;
    let domain = domain_for(level, false, true);

    let models = app
        .groups
        .cosmetic_filter_models(&frame_url, &domain)
        .await
        .into_iter()
        .map(|(always_aggressive, model)| CosmeticEntry {
            always_aggressive,
            hide_selectors: model.hide_selectors.iter().cloned().collect(),
            procedural_actions: model.procedural_actions.len(),
            exceptions: model.exceptions.len(),
            has_injected_script: !model.injected_script.is_empty(),
            generichide: model.generichide,
        })
        .collect();

    let mut scripts: Vec<_> = app
        .groups
        .make_engine_script_types(&frame_url, is_main_frame, is_de_amp_enabled, &domain)
        .await
        .into_iter()
        .collect();
    scripts.sort_by_key(|script| match script {
        ScriptType::EngineScript(configuration) => configuration.order,
    });

    print_output(
        &CosmeticReport {
            frame_url: url.to_string(),
            models,
            scripts,
        },
        format,
    )
}

// ============================================================================
// Rule List Commands
// ============================================================================

#[derive(Serialize, Tabled)]
struct RuleListRow {
    identifier: String,
    mode: BlockingMode,
    version: String,
    rules: usize,
}

pub async fn rule_lists(
    app: &App,
    level: ShieldLevel,
    block_all_cookies: bool,
    upgrade_mixed_content: bool,
    format: OutputFormat,
) -> Result<()> {
    app.groups.load_bundled_data_if_needed().await;

    let domain = domain_for(level, block_all_cookies, upgrade_mixed_content);
    let mut rows: Vec<RuleListRow> = app
        .groups
        .rule_lists(&domain)
        .await
        .into_iter()
        .map(|rule_list| RuleListRow {
            identifier: rule_list.identifier.clone(),
            mode: rule_list.mode,
            version: rule_list.version.clone(),
            rules: rule_list.rule_count,
        })
        .collect();
    rows.sort_by(|a, b| a.identifier.cmp(&b.identifier));

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Table => {
            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if rows.is_empty() {
                println!("{}", style("No rule lists apply").dim());
                return Ok(());
            }

            for row in &rows {
                println!(
                    "{} {} {} [{} rules]",
                    style("•").cyan(),
                    style(&row.identifier).bold(),
                    style(format!("v{}", row.version)).dim(),
                    row.rules
                );
            }
        }
    }

    Ok(())
}

pub async fn cleanup(app: &App, format: OutputFormat) -> Result<()> {
    let removed = app.groups.cleanup_invalid_rule_lists().await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&removed)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            if removed.is_empty() {
                println!("{}", style("Nothing to clean up").dim());
            } else {
                println!(
                    "{} Removed {} rule list(s)",
                    style("✓").green().bold(),
                    removed.len()
                );
                for identifier in &removed {
                    println!("  {}", style(identifier).dim());
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Resources
// ============================================================================

pub async fn resources(app: &App, file: &Path, format: OutputFormat) -> Result<()> {
    let file = tokio::fs::canonicalize(file)
        .await
        .with_context(|| format!("Resources file not found: {}", file.display()))?;

    let previous = app.groups.resources_info();
    app.groups.did_update_resources_component(&file).await?;
    let current = app
        .groups
        .resources_info()
        .ok_or_else(|| anyhow!("Resources were not recorded"))?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&current)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            if previous.as_ref() == Some(&current) {
                println!(
                    "{} Resources v{} are already current",
                    style("•").dim(),
                    current.version
                );
            } else {
                println!(
                    "{} Using resources v{}, run `shields sync` to rebuild engines",
                    style("✓").green().bold(),
                    current.version
                );
            }
        }
    }

    Ok(())
}

// ============================================================================
// Filter List Commands
// ============================================================================

#[derive(Serialize, Tabled)]
struct ListRow {
    source: String,
    enabled: bool,
    engine: EngineType,
    order: String,
    downloaded: String,
}

fn list_row(provider: &FilterListSourceProvider, setting: &FilterListSetting) -> ListRow {
    let engine = if setting.source.is_custom() || setting.is_always_aggressive {
        EngineType::Aggressive
    } else {
        EngineType::Standard
    };

    ListRow {
        source: truncate(&setting.source.to_string(), 48),
        enabled: setting.is_enabled,
        engine,
        order: setting
            .order
            .map(|order| order.to_string())
            .unwrap_or_else(|| "-".to_string()),
        downloaded: provider
            .file_info(setting)
            .map(|file| file.version().to_string())
            .unwrap_or_else(|| "-".to_string()),
    }
}

pub async fn list_action(app: &App, action: ListAction, format: OutputFormat) -> Result<()> {
    match action {
        ListAction::List => {
            let rows: Vec<ListRow> = app
                .provider
                .settings()
                .iter()
                .map(|setting| list_row(&app.provider, setting))
                .collect();

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
                OutputFormat::Table => {
                    println!("{}", Table::new(rows));
                }
                OutputFormat::Human => {
                    if rows.is_empty() {
                        println!("{}", style("No filter lists").dim());
                        return Ok(());
                    }

                    for row in &rows {
                        let icon = if row.enabled {
                            style("✓").green()
                        } else {
                            style("○").dim()
                        };
                        println!(
                            "{} {} {} [{}]",
                            icon,
                            style(&row.source).bold(),
                            style(format!("v{}", row.downloaded)).dim(),
                            row.engine
                        );
                    }
                }
            }
        }

        ListAction::Add {
            id,
            custom,
            folder,
            aggressive,
            order,
            disabled,
        } => {
            let setting = FilterListSetting {
                source: parse_source(&id, custom),
                is_enabled: !disabled,
                is_always_aggressive: aggressive,
                order,
                folder_path: folder.map(|folder| app.storage.relative_component_path(&folder)),
            };

            app.provider.upsert(setting.clone());
            app.save_lists().await?;

            if app.provider.file_info(&setting).is_none() {
                eprintln!(
                    "{} {} has no downloaded list yet",
                    style("!").yellow(),
                    setting.source
                );
            }
            println!("{} Added {}", style("✓").green().bold(), setting.source);
        }

        ListAction::Enable { id, custom } => set_enabled(app, &id, custom, true).await?,

        ListAction::Disable { id, custom } => set_enabled(app, &id, custom, false).await?,
    }

    Ok(())
}

async fn set_enabled(app: &App, id: &str, custom: bool, is_enabled: bool) -> Result<()> {
    let source = parse_source(id, custom);
    if !app.provider.set_enabled(&source, is_enabled) {
        bail!("Unknown filter list: {}", source);
    }
    app.save_lists().await?;

    println!(
        "{} {} {}, run `shields sync` to rebuild engines",
        style("✓").green().bold(),
        if is_enabled { "Enabled" } else { "Disabled" },
        source
    );
    Ok(())
}
