use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{CrmError, Result};

pub const DEFAULT_LEDGER_PATH: &str = ".crm/migrations.db";

struct SchemaStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const SCHEMA_STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        name: "applied_scripts",
        sql: "CREATE TABLE applied_scripts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_name TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                statements INTEGER NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
    },
    SchemaStep {
        version: 2,
        name: "applied_scripts_sha_index",
        sql: "CREATE INDEX idx_applied_scripts_sha256 ON applied_scripts(sha256);",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedScript {
    pub file_name: String,
    pub sha256: String,
    pub statements: usize,
    pub applied_at_unix: i64,
}

pub struct MigrationLedger {
    connection: Connection,
}

impl MigrationLedger {
    /// Open (creating if needed) the ledger at `path` and bring its schema
    /// up to date.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|error| {
                CrmError::Ledger(format!("failed to create {}: {error}", parent.display()))
            })?;
        }
        let connection = Connection::open(path)
            .map_err(|error| CrmError::Ledger(format!("failed to open {}: {error}", path.display())))?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .map_err(ledger_error("failed to enable WAL journal mode"))?;
        let ledger = Self { connection };
        ledger.ensure_schema()?;
        Ok(ledger)
    }

    pub fn schema_version(&self) -> Result<u32> {
        let version: i64 = self
            .connection
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .map_err(ledger_error("failed to read ledger schema version"))?;
        u32::try_from(version)
            .map_err(|_| CrmError::Ledger(format!("ledger schema version out of range: {version}")))
    }

    /// Most recent application of a script with this content hash.
    pub fn last_applied(&self, sha256: &str) -> Result<Option<AppliedScript>> {
        self.connection
            .query_row(
                "SELECT file_name, sha256, statements, applied_at_unix
                 FROM applied_scripts WHERE sha256 = ?1
                 ORDER BY id DESC LIMIT 1",
                params![sha256],
                row_to_applied,
            )
            .optional()
            .map_err(ledger_error("failed to query applied scripts"))
    }

    pub fn record(&self, file_name: &str, sha256: &str, statements: usize) -> Result<()> {
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|error| CrmError::Ledger(format!("system clock error: {error}")))?
            .as_secs();
        self.connection
            .execute(
                "INSERT INTO applied_scripts (file_name, sha256, statements, applied_at_unix)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    file_name,
                    sha256,
                    i64::try_from(statements).unwrap_or(i64::MAX),
                    i64::try_from(now_unix).unwrap_or(i64::MAX),
                ],
            )
            .map_err(ledger_error("failed to record applied script"))?;
        Ok(())
    }

    /// All recorded applications, oldest first.
    pub fn history(&self) -> Result<Vec<AppliedScript>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT file_name, sha256, statements, applied_at_unix
                 FROM applied_scripts ORDER BY id ASC",
            )
            .map_err(ledger_error("failed to prepare history query"))?;
        let rows = statement
            .query_map([], row_to_applied)
            .map_err(ledger_error("failed to read history"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(ledger_error("failed to read history row"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    applied_at_unix INTEGER NOT NULL
                );",
            )
            .map_err(ledger_error("failed to create schema_migrations table"))?;
        let current = self.schema_version()?;
        for step in SCHEMA_STEPS {
            if step.version <= current {
                continue;
            }
            self.apply_step(step)?;
        }
        Ok(())
    }

    fn apply_step(&self, step: &SchemaStep) -> Result<()> {
        self.connection
            .execute_batch("SAVEPOINT ledger_schema")
            .map_err(ledger_error("failed to create savepoint"))?;

        let result = (|| -> Result<()> {
            self.connection.execute_batch(step.sql).map_err(|error| {
                CrmError::Ledger(format!(
                    "schema step v{:03}_{} failed: {error}",
                    step.version, step.name
                ))
            })?;
            let now_unix = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|duration| duration.as_secs())
                .unwrap_or(0);
            self.connection
                .execute(
                    "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
                    params![
                        i64::from(step.version),
                        step.name,
                        i64::try_from(now_unix).unwrap_or(i64::MAX),
                    ],
                )
                .map_err(ledger_error("failed to record schema step"))?;
            Ok(())
        })();

        match result {
            Ok(()) => self
                .connection
                .execute_batch("RELEASE SAVEPOINT ledger_schema")
                .map_err(ledger_error("failed to release savepoint")),
            Err(error) => {
                let _ = self
                    .connection
                    .execute_batch("ROLLBACK TO SAVEPOINT ledger_schema");
                let _ = self.connection.execute_batch("RELEASE SAVEPOINT ledger_schema");
                Err(error)
            }
        }
    }
}

fn row_to_applied(row: &rusqlite::Row<'_>) -> rusqlite::Result<AppliedScript> {
    let statements: i64 = row.get(2)?;
    Ok(AppliedScript {
        file_name: row.get(0)?,
        sha256: row.get(1)?,
        statements: usize::try_from(statements).unwrap_or(0),
        applied_at_unix: row.get(3)?,
    })
}

fn ledger_error(context: &'static str) -> impl Fn(rusqlite::Error) -> CrmError {
    move |error| CrmError::Ledger(format!("{context}: {error}"))
}
