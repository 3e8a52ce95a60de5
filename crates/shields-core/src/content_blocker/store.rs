//! SQLite-backed persistence for compiled rule lists
//!
//! One row per (blocklist, mode). Replacing a version happens in one
//! transaction, so readers never see two versions of the same blocklist.

use crate::error::ShieldsError;
use chrono::{DateTime, Utc};
use shields_types::{BlockingMode, BlocklistType, RuleList};
use sqlx::{sqlite::{SqliteConnectOptions, SqlitePool}, Row, SqlitePool as Pool};
use std::path::Path;

/// Cached version and mode of one stored rule list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRuleList {
    pub blocklist_type: BlocklistType,
    pub mode: BlockingMode,
    pub version: String,
}

/// Database of compiled rule lists
#[derive(Clone, Debug)]
pub struct RuleListStore {
    pool: Pool,
}

impl RuleListStore {
    /// Open (or create) the database
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, ShieldsError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rule_lists (
                blocklist_type TEXT NOT NULL,
                mode TEXT NOT NULL,
                identifier TEXT NOT NULL,
                version TEXT NOT NULL,
                rule_count INTEGER NOT NULL,
                encoded TEXT NOT NULL,
                compiled_at TEXT NOT NULL,
                PRIMARY KEY (blocklist_type, mode)
            );

            CREATE INDEX IF NOT EXISTS idx_rule_lists_identifier ON rule_lists(identifier);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Store `rule_lists` (all of one blocklist and version) and drop every
    /// other version of that blocklist. Returns the identifiers removed.
    pub async fn replace_version(
        &self,
        blocklist_type: &BlocklistType,
        version: &str,
        rule_lists: &[RuleList],
    ) -> Result<Vec<String>, ShieldsError> {
        let key = type_key(blocklist_type)?;
        let mut tx = self.pool.begin().await?;

        for rule_list in rule_lists {
            sqlx::query(
                r#"
                INSERT INTO rule_lists (
                    blocklist_type, mode, identifier, version, rule_count, encoded, compiled_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(blocklist_type, mode) DO UPDATE SET
                    identifier = excluded.identifier,
                    version = excluded.version,
                    rule_count = excluded.rule_count,
                    encoded = excluded.encoded,
                    compiled_at = excluded.compiled_at
                "#,
            )
            .bind(&key)
            .bind(rule_list.mode.as_str())
            .bind(&rule_list.identifier)
            .bind(&rule_list.version)
            .bind(rule_list.rule_count as i64)
            .bind(&rule_list.encoded)
            .bind(rule_list.compiled_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        let removed = sqlx::query(
            "SELECT identifier FROM rule_lists WHERE blocklist_type = ? AND version != ?",
        )
        .bind(&key)
        .bind(version)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("identifier"))
        .collect();

        sqlx::query("DELETE FROM rule_lists WHERE blocklist_type = ? AND version != ?")
            .bind(&key)
            .bind(version)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(removed)
    }

    /// Load one rule list
    pub async fn load(
        &self,
        blocklist_type: &BlocklistType,
        mode: BlockingMode,
    ) -> Result<Option<RuleList>, ShieldsError> {
        let row = sqlx::query("SELECT * FROM rule_lists WHERE blocklist_type = ? AND mode = ?")
            .bind(type_key(blocklist_type)?)
            .bind(mode.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_rule_list).transpose()
    }

    /// Versions and modes of everything stored, without the rule payloads
    pub async fn load_index(&self) -> Result<Vec<StoredRuleList>, ShieldsError> {
        let rows = sqlx::query("SELECT blocklist_type, mode, version FROM rule_lists")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredRuleList {
                    blocklist_type: parse_type_key(&row.get::<String, _>("blocklist_type"))?,
                    mode: parse_mode(&row.get::<String, _>("mode"))?,
                    version: row.get("version"),
                })
            })
            .collect()
    }

    /// Delete every rule list of the given blocklists. Returns the
    /// identifiers removed.
    pub async fn delete_types(&self, blocklist_types: &[BlocklistType]) -> Result<Vec<String>, ShieldsError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = Vec::new();

        for blocklist_type in blocklist_types {
            let key = type_key(blocklist_type)?;

            let identifiers = sqlx::query("SELECT identifier FROM rule_lists WHERE blocklist_type = ?")
                .bind(&key)
                .fetch_all(&mut *tx)
                .await?;
            removed.extend(
                identifiers
                    .into_iter()
                    .map(|row| row.get::<String, _>("identifier")),
            );

            sqlx::query("DELETE FROM rule_lists WHERE blocklist_type = ?")
                .bind(&key)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(removed)
    }
}

fn type_key(blocklist_type: &BlocklistType) -> Result<String, ShieldsError> {
    Ok(serde_json::to_string(blocklist_type)?)
}

fn parse_type_key(key: &str) -> Result<BlocklistType, ShieldsError> {
    Ok(serde_json::from_str(key)?)
}

fn parse_mode(mode: &str) -> Result<BlockingMode, ShieldsError> {
    mode.parse().map_err(ShieldsError::Serialization)
}

fn row_to_rule_list(row: sqlx::sqlite::SqliteRow) -> Result<RuleList, ShieldsError> {
    Ok(RuleList {
        identifier: row.get("identifier"),
        blocklist_type: parse_type_key(&row.get::<String, _>("blocklist_type"))?,
        mode: parse_mode(&row.get::<String, _>("mode"))?,
        version: row.get("version"),
        rule_count: row.get::<i64, _>("rule_count") as usize,
        encoded: row.get("encoded"),
        compiled_at: DateTime::parse_from_rfc3339(row.get::<String, _>("compiled_at").as_str())
            .map_err(|e| ShieldsError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shields_types::{EngineType, GenericBlocklistType, Source};
    use tempfile::TempDir;

    fn rule_list(blocklist_type: &BlocklistType, mode: BlockingMode, version: &str) -> RuleList {
        RuleList {
            identifier: blocklist_type.rule_list_identifier(mode),
            blocklist_type: blocklist_type.clone(),
            mode,
            version: version.to_string(),
            rule_count: 1,
            encoded: r#"[{"trigger":{"url-filter":"ads"},"action":{"type":"block"}}]"#.to_string(),
            compiled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_replace_version_drops_old_rows() {
        let dir = TempDir::new().unwrap();
        let store = RuleListStore::new(dir.path().join("rules.db")).await.unwrap();
        let blocklist_type = Source::filter_list("a")
            .blocklist_type(EngineType::Standard)
            .unwrap();

        store
            .replace_version(
                &blocklist_type,
                "1",
                &[
                    rule_list(&blocklist_type, BlockingMode::Standard, "1"),
                    rule_list(&blocklist_type, BlockingMode::Aggressive, "1"),
                ],
            )
            .await
            .unwrap();

        let removed = store
            .replace_version(
                &blocklist_type,
                "2",
                &[rule_list(&blocklist_type, BlockingMode::Standard, "2")],
            )
            .await
            .unwrap();

        assert_eq!(removed, vec![blocklist_type.rule_list_identifier(BlockingMode::Aggressive)]);
        let index = store.load_index().await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].version, "2");

        let loaded = store
            .load(&blocklist_type, BlockingMode::Standard)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.version, "2");
        assert!(store
            .load(&blocklist_type, BlockingMode::Aggressive)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_types() {
        let dir = TempDir::new().unwrap();
        let store = RuleListStore::new(dir.path().join("rules.db")).await.unwrap();
        let generic = BlocklistType::Generic(GenericBlocklistType::BlockAds);

        store
            .replace_version(&generic, "2", &[rule_list(&generic, BlockingMode::General, "2")])
            .await
            .unwrap();

        let removed = store.delete_types(&[generic.clone()]).await.unwrap();
        assert_eq!(removed, vec!["generic-block-ads-general".to_string()]);
        assert!(store.load_index().await.unwrap().is_empty());
    }
}
