use std::path::Path;

use anyhow::{anyhow, Context, Result};
use bidstamp_core::{
    BidRecord, Collection, DocumentId, Payload, StoredDocument, TimeSyncRecord, TransactionId,
};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS bids (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  document_id TEXT NOT NULL UNIQUE,
  owner TEXT NOT NULL,
  data_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS time_synchronization (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  document_id TEXT NOT NULL UNIQUE,
  transaction_id TEXT,
  client_ip TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  data_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_time_synchronization_transaction_id
  ON time_synchronization(transaction_id, seq);
";

/// Append-only document store for bids and time-sync records.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub bid_documents: i64,
    pub time_sync_documents: i64,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed document store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration_1()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![1_i64, now_rfc3339()?],
        )
        .context("failed to record migration version 1")?;
        tx.commit().context("failed to commit migration v1")?;
        Ok(())
    }

    /// Persist one bid document and return its stored form.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn insert_bid(&mut self, record: &BidRecord) -> Result<StoredDocument<BidRecord>> {
        let id = DocumentId::new();
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO bids(document_id, owner, data_json, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                id.to_string(),
                record.owner,
                serde_json::to_string(&record.data).context("failed to serialize bid payload")?,
                now_rfc3339()?,
            ],
        )
        .context("failed to insert bid document")?;
        tx.commit().context("failed to commit bid transaction")?;

        Ok(StoredDocument { id, record: record.clone() })
    }

    /// Persist one time-sync document and return its stored form.
    ///
    /// The payload's `txID` is indexed when it is a string; otherwise the document is kept
    /// but never matches a transaction lookup.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn insert_time_sync(
        &mut self,
        record: &TimeSyncRecord,
    ) -> Result<StoredDocument<TimeSyncRecord>> {
        let id = DocumentId::new();
        let transaction_id = record.transaction_id();
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO time_synchronization(
                document_id, transaction_id, client_ip, timestamp, data_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                transaction_id.as_ref().map(TransactionId::as_str),
                record.client_ip,
                record.timestamp,
                serde_json::to_string(&record.data)
                    .context("failed to serialize time-sync payload")?,
                now_rfc3339()?,
            ],
        )
        .context("failed to insert time-sync document")?;
        tx.commit().context("failed to commit time-sync transaction")?;

        Ok(StoredDocument { id, record: record.clone() })
    }

    /// Load every bid document in insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_bids(&self) -> Result<Vec<StoredDocument<BidRecord>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT document_id, owner, data_json FROM bids ORDER BY seq ASC")?;
        let mut rows = stmt.query([])?;
        let mut documents = Vec::new();

        while let Some(row) = rows.next()? {
            let id = parse_document_id(&row.get::<_, String>(0)?)?;
            documents.push(StoredDocument {
                id,
                record: BidRecord { owner: row.get(1)?, data: parse_payload(row, 2)? },
            });
        }

        Ok(documents)
    }

    /// Load the time-sync documents recorded for `txid`, in insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn find_time_syncs(
        &self,
        txid: &TransactionId,
    ) -> Result<Vec<StoredDocument<TimeSyncRecord>>> {
        let mut stmt = self.conn.prepare(
            "SELECT document_id, client_ip, timestamp, data_json
             FROM time_synchronization
             WHERE transaction_id = ?1
             ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query(params![txid.as_str()])?;
        let mut documents = Vec::new();

        while let Some(row) = rows.next()? {
            let id = parse_document_id(&row.get::<_, String>(0)?)?;
            documents.push(StoredDocument {
                id,
                record: TimeSyncRecord {
                    client_ip: row.get(1)?,
                    timestamp: row.get(2)?,
                    data: parse_payload(row, 3)?,
                },
            });
        }

        Ok(documents)
    }

    /// Timestamps recorded for `txid`, in insertion order.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn timestamps_for_transaction(&self, txid: &TransactionId) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp FROM time_synchronization WHERE transaction_id = ?1 ORDER BY seq ASC",
        )?;
        let timestamps = stmt
            .query_map(params![txid.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to read timestamps for transaction {txid}"))?;
        Ok(timestamps)
    }

    /// Number of documents stored in one collection.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count(&self, collection: Collection) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", collection.as_str());
        self.conn
            .query_row(&sql, [], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to count {} documents", collection.as_str()))
    }

    /// Run `SQLite` quick_check and report document counts plus schema status.
    ///
    /// # Errors
    /// Returns an error when the checks cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;
        let schema_status = self.schema_status()?;
        let (bid_documents, time_sync_documents) = if schema_status.pending_versions.is_empty() {
            (self.count(Collection::Bids)?, self.count(Collection::TimeSynchronization)?)
        } else {
            (0, 0)
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            bid_documents,
            time_sync_documents,
            schema_status,
        })
    }

    /// Close the underlying connection, surfacing any error `SQLite` reports on shutdown.
    ///
    /// # Errors
    /// Returns an error when the connection cannot be closed cleanly.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| err).context("failed to close sqlite database")
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_document_id(raw: &str) -> Result<DocumentId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(DocumentId(parsed))
}

fn parse_payload(row: &Row<'_>, index: usize) -> Result<Payload> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).context("failed to deserialize stored payload")
}
