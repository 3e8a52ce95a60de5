//! Output formatting utilities

use crate::OutputFormat;
use serde::Serialize;
use shields_types::{Domain, ShieldLevel, Source};

/// Print output in the specified format
pub fn print_output<T: Serialize + std::fmt::Display>(
    value: &T,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!("{}", value);
        }
    }
    Ok(())
}

/// Parse a list id from the command line
pub fn parse_source(id: &str, custom: bool) -> Source {
    if custom {
        Source::custom_list(id)
    } else {
        Source::filter_list(id)
    }
}

/// Domain settings for a query made from the command line
pub fn domain_for(level: ShieldLevel, block_all_cookies: bool, upgrade_mixed_content: bool) -> Domain {
    Domain {
        all_shields_off: false,
        block_level: level,
        block_all_cookies,
        upgrade_mixed_content,
    }
}

/// Shorten long values for table cells
pub fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }

    let kept: String = value.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-rather-long-identifier", 10), "a-rathe...");
    }
}
