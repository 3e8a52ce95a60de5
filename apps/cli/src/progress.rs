//! Progress display for compiles run by the CLI

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use shields_types::ManagerEvent;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Spinner that reports manager events while a command runs
pub struct CompileProgress {
    spinner: ProgressBar,
    listener: JoinHandle<()>,
}

impl CompileProgress {
    pub fn start(message: &str, mut events: broadcast::Receiver<ManagerEvent>) -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            spinner.set_style(template);
        }
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(100));

        let bar = spinner.clone();
        let listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(line) = describe_event(&event) {
                            bar.println(line);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self { spinner, listener }
    }

    pub fn finish(self, message: &str) {
        self.listener.abort();
        self.spinner.finish_with_message(format!(
            "{} {}",
            style("✓").green().bold(),
            message
        ));
    }
}

fn describe_event(event: &ManagerEvent) -> Option<String> {
    let line = match event {
        ManagerEvent::EngineCompiled {
            engine_type,
            sources,
            resources_version,
        } => format!(
            "  {} compiled {} engine from {} list(s){}",
            style("●").cyan(),
            engine_type,
            sources,
            resources_version
                .as_ref()
                .map(|v| format!(", resources v{}", v))
                .unwrap_or_default()
        ),
        ManagerEvent::EngineLoadedFromCache {
            engine_type,
            sources,
        } => format!(
            "  {} loaded {} engine from cache ({} list(s))",
            style("●").dim(),
            engine_type,
            sources
        ),
        ManagerEvent::EngineCleared { engine_type } => {
            format!("  {} cleared {} engine", style("○").yellow(), engine_type)
        }
        ManagerEvent::RuleListCompiled {
            identifier,
            version,
        } => format!(
            "  {} rule list {} v{}",
            style("●").cyan(),
            identifier,
            version
        ),
        ManagerEvent::RuleListsRemoved { identifiers } if !identifiers.is_empty() => format!(
            "  {} removed {} outdated rule list(s)",
            style("○").dim(),
            identifiers.len()
        ),
        ManagerEvent::ResourcesUpdated { version } => {
            format!("  {} resources v{}", style("●").cyan(), version)
        }
        _ => return None,
    };

    Some(line)
}
