//! Shields CLI - compile and query ad-block filter lists
//!
//! Drives a `GroupsManager` over a data directory: downloaded filter lists
//! are compiled into engines and content-blocker rule lists, and requests or
//! frames can be checked against them.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use shields_types::{ResourceType, Settings, ShieldLevel};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Shields - ad-block engine compiler
#[derive(Parser)]
#[command(name = "shields")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for Shields
    #[arg(long, env = "SHIELDS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

/// Shield level of the page a query is made for
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum Level {
    Off,
    Standard,
    Aggressive,
}

impl From<Level> for ShieldLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Off => ShieldLevel::Disabled,
            Level::Standard => ShieldLevel::Standard,
            Level::Aggressive => ShieldLevel::Aggressive,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile engines and rule lists from the downloaded filter lists
    Sync,

    /// Check whether a request would be blocked
    Check {
        /// Request URL
        url: String,

        /// URL of the page making the request
        #[arg(short, long)]
        source: String,

        /// Resource type of the request
        #[arg(short = 't', long = "type", default_value = "other", value_parser = parse_resource_type)]
        resource_type: ResourceType,

        /// Shield level of the page
        #[arg(short, long, default_value = "standard")]
        level: Level,
    },

    /// Show cosmetic filters and engine scripts for a frame
    Cosmetic {
        /// Frame URL
        url: String,

        /// Shield level of the page
        #[arg(short, long, default_value = "standard")]
        level: Level,

        /// Treat the frame as a subframe
        #[arg(long)]
        subframe: bool,

        /// Enable de-AMP in the engine scripts
        #[arg(long)]
        de_amp: bool,
    },

    /// Show the rule lists that apply to a page
    RuleLists {
        /// Shield level of the page
        #[arg(short, long, default_value = "standard")]
        level: Level,

        /// Block all cookies on the page
        #[arg(long)]
        block_cookies: bool,

        /// Do not upgrade mixed content
        #[arg(long)]
        no_upgrade_mixed_content: bool,
    },

    /// Filter list management
    Lists {
        #[command(subcommand)]
        action: ListAction,
    },

    /// Register a downloaded resources bundle
    Resources {
        /// Path to the resources file inside its version folder
        file: PathBuf,
    },

    /// Delete rule lists that no known list needs
    Cleanup,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ListAction {
    /// List all filter lists
    List,

    /// Add or replace a filter list
    Add {
        /// Component id, or uuid with --custom
        id: String,

        /// The list was added by the user
        #[arg(long)]
        custom: bool,

        /// Downloaded version folder, relative to the components directory
        #[arg(long)]
        folder: Option<PathBuf>,

        /// Compile the list into the aggressive engine
        #[arg(long)]
        aggressive: bool,

        /// Position in the compile order
        #[arg(long)]
        order: Option<i32>,

        /// Add the list disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Enable a filter list
    Enable {
        id: String,

        #[arg(long)]
        custom: bool,
    },

    /// Disable a filter list
    Disable {
        id: String,

        #[arg(long)]
        custom: bool,
    },
}

fn parse_resource_type(value: &str) -> Result<ResourceType, String> {
    value.parse()
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "shields_core=debug,shields_cli=debug"
    } else {
        "shields_core=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "shields", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(Settings::default_data_dir);
    let app = commands::App::open(data_dir).await?;

    match cli.command {
        Commands::Sync => commands::sync(&app, cli.output).await?,

        Commands::Check {
            url,
            source,
            resource_type,
            level,
        } => commands::check(&app, &url, &source, resource_type, level.into(), cli.output).await?,

        Commands::Cosmetic {
            url,
            level,
            subframe,
            de_amp,
        } => commands::cosmetic(&app, &url, level.into(), !subframe, de_amp, cli.output).await?,

        Commands::RuleLists {
            level,
            block_cookies,
            no_upgrade_mixed_content,
        } => {
            commands::rule_lists(
                &app,
                level.into(),
                block_cookies,
                !no_upgrade_mixed_content,
                cli.output,
            )
            .await?
        }

        Commands::Lists { action } => commands::list_action(&app, action, cli.output).await?,

        Commands::Resources { file } => commands::resources(&app, &file, cli.output).await?,

        Commands::Cleanup => commands::cleanup(&app, cli.output).await?,

        Commands::Completions { .. } => {}
    }

    app.groups.wait_for_background_tasks().await;
    Ok(())
}
