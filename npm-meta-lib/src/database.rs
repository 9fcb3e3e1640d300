//! Embedded libSQL database for npm-meta metadata
//!
//! Provides an async database layer backed by libSQL (a SQLite fork) for
//! storing notes, tags and quick links keyed by NPM stream id.

use crate::error::{MetaError, Result};
use crate::storage::MetadataStore;
use crate::types::{Metadata, MetadataRecord, QuickLink, RuleId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Schema DDL applied on every database open (idempotent via IF NOT EXISTS).
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stream_meta (
    rule_id INTEGER PRIMARY KEY,
    note TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '[]',
    quick_links TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// `store_meta` key set once the legacy table has been copied.
const LEGACY_IMPORT_KEY: &str = "legacy_import_done";

/// Additive migrations for databases created by older releases.
const ALTER_MIGRATIONS: &[&str] = &["ALTER TABLE stream_meta ADD COLUMN orphaned_since TEXT"];

/// Embedded libSQL database holding one row per annotated rule.
pub struct MetaDatabase {
    // Kept alive so the connection remains valid for the database's lifetime.
    #[allow(dead_code)]
    db: libsql::Database,
    conn: libsql::Connection,
}

impl MetaDatabase {
    // ── Constructors ────────────────────────────────────────────────

    /// Open (or create) the database file at the given path.
    pub async fn open(path: &str) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| {
                tracing::error!(
                    path = %std::path::Path::new(path).display(),
                    error = %e,
                    "Database open failed"
                );
                MetaError::store(format!("Failed to open database: {}", e))
            })?;
        let conn = db
            .connect()
            .map_err(|e| MetaError::store(format!("Failed to connect: {}", e)))?;
        let instance = Self { db, conn };
        instance.run_migrations().await?;
        instance
            .conn
            .execute_batch("PRAGMA journal_mode = WAL;")
            .await
            .map_err(|e| MetaError::store(format!("Failed to set PRAGMAs: {}", e)))?;
        instance.import_legacy_rows().await?;
        Ok(instance)
    }

    /// Open an in-memory database (for testing).
    pub async fn in_memory() -> Result<Self> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| MetaError::store(format!("Failed to open in-memory database: {}", e)))?;
        let conn = db
            .connect()
            .map_err(|e| MetaError::store(format!("Failed to connect: {}", e)))?;
        let instance = Self { db, conn };
        instance.run_migrations().await?;
        Ok(instance)
    }

    async fn run_migrations(&self) -> Result<()> {
        tracing::debug!("Applying database schema");
        self.conn.execute_batch(SCHEMA).await.map_err(|e| {
            tracing::error!(error = %e, "Schema creation failed");
            MetaError::store(format!("Failed to run migrations: {}", e))
        })?;

        // Ignore errors: the column already exists on current databases
        for migration in ALTER_MIGRATIONS {
            match self.conn.execute(migration, ()).await {
                Ok(_) => tracing::debug!("Migration applied: {}", migration),
                Err(_) => tracing::debug!("Migration skipped (already applied): {}", migration),
            }
        }

        Ok(())
    }

    /// Copy rows from the `streams` table written by earlier releases.
    ///
    /// Its `memo` column becomes the note and the doc/test/repo URL columns
    /// become quick links. Runs at most once per database: the copy and the
    /// `store_meta` marker are committed together, so records deleted later
    /// are not brought back on the next open. The legacy table is not modified.
    async fn import_legacy_rows(&self) -> Result<()> {
        if self.legacy_import_done().await? {
            return Ok(());
        }

        let mut rows = self
            .conn
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'streams'",
                (),
            )
            .await
            .map_err(|e| MetaError::store(e.to_string()))?;
        if rows
            .next()
            .await
            .map_err(|e| MetaError::store(e.to_string()))?
            .is_none()
        {
            return Ok(());
        }

        let mut rows = self
            .conn
            .query(
                "SELECT npm_id, memo, doc_url, test_url, repo_url FROM streams",
                (),
            )
            .await
            .map_err(|e| MetaError::store(e.to_string()))?;

        let mut legacy = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| MetaError::store(e.to_string()))? {
            let rule_id: i64 = row.get(0).map_err(|e| MetaError::store(e.to_string()))?;
            let memo: Option<String> = row.get(1).map_err(|e| MetaError::store(e.to_string()))?;
            let mut metadata = Metadata::default().with_note(memo.unwrap_or_default());
            for (index, label) in [(2, "docs"), (3, "test"), (4, "repo")] {
                let url: Option<String> =
                    row.get(index).map_err(|e| MetaError::store(e.to_string()))?;
                if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
                    metadata = metadata.with_link(label, url);
                }
            }
            legacy.push(MetadataRecord::new(rule_id, metadata));
        }

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| MetaError::store(format!("Failed to start import: {}", e)))?;
        let mut imported = 0usize;
        for record in &legacy {
            // Existing records win over legacy rows
            let (sql, params) = record_insert(record, "INSERT OR IGNORE")?;
            imported += tx
                .execute(&sql, params)
                .await
                .map_err(|e| MetaError::store(e.to_string()))? as usize;
        }
        tx.execute(
            "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2)",
            libsql::params![LEGACY_IMPORT_KEY, Utc::now().to_rfc3339()],
        )
        .await
        .map_err(|e| MetaError::store(e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| MetaError::store(format!("Failed to commit import: {}", e)))?;

        tracing::info!(imported, "Imported legacy stream annotations");
        Ok(())
    }

    async fn legacy_import_done(&self) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT value FROM store_meta WHERE key = ?1",
                libsql::params![LEGACY_IMPORT_KEY],
            )
            .await
            .map_err(|e| MetaError::store(e.to_string()))?;
        Ok(rows
            .next()
            .await
            .map_err(|e| MetaError::store(e.to_string()))?
            .is_some())
    }

    // ── Record CRUD ─────────────────────────────────────────────────

    /// Insert or replace a record.
    pub async fn put_record(&self, record: &MetadataRecord) -> Result<()> {
        let (sql, params) = record_insert(record, "INSERT OR REPLACE")?;
        self.conn
            .execute(&sql, params)
            .await
            .map_err(|e| MetaError::store(e.to_string()))?;
        Ok(())
    }

    /// Set or clear the orphan mark without touching the metadata columns.
    pub async fn mark_orphaned(
        &self,
        rule_id: RuleId,
        orphaned_since: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE stream_meta SET orphaned_since = ?2 WHERE rule_id = ?1",
                libsql::params![rule_id, orphaned_since.map(|t| t.to_rfc3339())],
            )
            .await
            .map_err(|e| MetaError::store(e.to_string()))?;
        Ok(())
    }

    /// Get the record for a rule.
    pub async fn get_record(&self, rule_id: RuleId) -> Result<Option<MetadataRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT rule_id, note, tags, quick_links, updated_at, orphaned_since FROM stream_meta WHERE rule_id = ?1",
                libsql::params![rule_id],
            )
            .await
            .map_err(|e| MetaError::store(e.to_string()))?;

        if let Some(row) = rows.next().await.map_err(|e| MetaError::store(e.to_string()))? {
            Ok(Some(self.row_to_record(&row)?))
        } else {
            Ok(None)
        }
    }

    /// List every record, ordered by rule id.
    pub async fn list_records(&self) -> Result<Vec<MetadataRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT rule_id, note, tags, quick_links, updated_at, orphaned_since FROM stream_meta ORDER BY rule_id",
                (),
            )
            .await
            .map_err(|e| MetaError::store(e.to_string()))?;

        let mut result = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| MetaError::store(e.to_string()))? {
            result.push(self.row_to_record(&row)?);
        }
        Ok(result)
    }

    /// Remove the record for a rule.
    pub async fn remove_record(&self, rule_id: RuleId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM stream_meta WHERE rule_id = ?1",
                libsql::params![rule_id],
            )
            .await
            .map_err(|e| MetaError::store(e.to_string()))?;
        Ok(())
    }

    /// Parse a row from stream_meta into a MetadataRecord.
    /// Columns expected: rule_id, note, tags, quick_links, updated_at, orphaned_since.
    fn row_to_record(&self, row: &libsql::Row) -> Result<MetadataRecord> {
        let rule_id: i64 = row.get(0).map_err(|e| MetaError::store(e.to_string()))?;
        let note: String = row.get(1).map_err(|e| MetaError::store(e.to_string()))?;
        let tags_json: String = row.get(2).map_err(|e| MetaError::store(e.to_string()))?;
        let links_json: String = row.get(3).map_err(|e| MetaError::store(e.to_string()))?;
        let updated_at_str: String = row.get(4).map_err(|e| MetaError::store(e.to_string()))?;
        let orphaned_str: Option<String> =
            row.get(5).map_err(|e| MetaError::store(e.to_string()))?;

        let tags: BTreeSet<String> = serde_json::from_str(&tags_json)
            .map_err(|e| MetaError::store(format!("Invalid tags for rule {}: {}", rule_id, e)))?;
        let quick_links: Vec<QuickLink> = serde_json::from_str(&links_json).map_err(|e| {
            MetaError::store(format!("Invalid quick links for rule {}: {}", rule_id, e))
        })?;

        Ok(MetadataRecord {
            rule_id,
            metadata: Metadata {
                note,
                tags,
                quick_links,
            },
            updated_at: parse_timestamp(&updated_at_str)?,
            orphaned_since: orphaned_str.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

/// Build an insert statement for a record. `verb` picks the conflict policy.
fn record_insert(record: &MetadataRecord, verb: &str) -> Result<(String, Vec<libsql::Value>)> {
    let tags_json = serde_json::to_string(&record.metadata.tags)?;
    let links_json = serde_json::to_string(&record.metadata.quick_links)?;
    let sql = format!(
        "{} INTO stream_meta (rule_id, note, tags, quick_links, updated_at, orphaned_since) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        verb
    );
    let params = vec![
        libsql::Value::Integer(record.rule_id),
        libsql::Value::Text(record.metadata.note.clone()),
        libsql::Value::Text(tags_json),
        libsql::Value::Text(links_json),
        libsql::Value::Text(record.updated_at.to_rfc3339()),
        record
            .orphaned_since
            .map(|t| libsql::Value::Text(t.to_rfc3339()))
            .unwrap_or(libsql::Value::Null),
    ];
    Ok((sql, params))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| MetaError::store(format!("Invalid timestamp: {}", e)))?
        .with_timezone(&Utc))
}

#[async_trait]
impl MetadataStore for MetaDatabase {
    async fn get(&self, rule_id: RuleId) -> Result<Option<MetadataRecord>> {
        self.get_record(rule_id).await
    }

    async fn upsert(&self, record: &MetadataRecord) -> Result<()> {
        self.put_record(record).await
    }

    async fn delete(&self, rule_id: RuleId) -> Result<()> {
        self.remove_record(rule_id).await
    }

    async fn list_all(&self) -> Result<Vec<MetadataRecord>> {
        self.list_records().await
    }

    async fn set_orphaned_since(
        &self,
        rule_id: RuleId,
        orphaned_since: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.mark_orphaned(rule_id, orphaned_since).await
    }
}
