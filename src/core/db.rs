//! Storage backend: SQLite connection, pragmas, transactions, migrations.
//!
//! This module owns every statement that touches the database file. Higher
//! layers (store, graph, documents, queries) go through [`Database`] so that
//! pragma discipline, savepoint bookkeeping, and error reclassification live
//! in one place.
//!
//! - **WAL mode** for file-backed databases, foreign keys ON
//! - **Busy timeout** bounds lock waits; exceeding it surfaces as retryable
//! - **Savepoints**: nested `transaction` calls use `sp_<depth>` savepoints
//! - **Migrations**: ordered sparse ladder keyed by `PRAGMA user_version`

use crate::core::error::{ElementalError, ErrorKind};
use crate::core::schemas;
use crate::core::time;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Params, Row};
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CACHE_SIZE: i64 = -64_000; // KiB, negative per SQLite convention

/// Pragma overrides recognized by [`DbConfig`].
#[derive(Debug, Clone, Default)]
pub struct PragmaConfig {
    pub journal_mode: Option<String>,
    pub synchronous: Option<String>,
    pub foreign_keys: Option<bool>,
    pub cache_size: Option<i64>,
    pub busy_timeout_ms: Option<u64>,
}

/// Resource-acquisition configuration for opening a database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub path: String,
    pub create: bool,
    pub pragmas: PragmaConfig,
}

impl DbConfig {
    pub fn memory() -> Self {
        Self {
            path: ":memory:".to_string(),
            create: true,
            pragmas: PragmaConfig::default(),
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            create: true,
            pragmas: PragmaConfig::default(),
        }
    }

    /// Default on-disk location: `.elemental/elemental.db` under `root`.
    pub fn default_under(root: &Path) -> Self {
        let path = root
            .join(schemas::DB_DIR_NAME)
            .join(schemas::DB_FILE_NAME)
            .to_string_lossy()
            .to_string();
        Self::file(path)
    }
}

/// Transaction isolation, mapped to SQLite `BEGIN` flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    Deferred,
    Immediate,
    Exclusive,
}

impl Isolation {
    fn begin_sql(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Result of a mutating statement.
#[derive(Debug, Clone, Copy)]
pub struct RunResult {
    pub changes: usize,
    pub last_insert_rowid: i64,
}

/// Outcome of a migration run.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    pub applied: Vec<i64>,
}

/// One rung of the migration ladder. Versions are monotonically increasing
/// but may be sparse.
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

/// The built-in ladder for the element engine schema.
pub fn migration_ladder() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "elements and typed dependencies",
            statements: &[
                schemas::SCHEMA_V1_ELEMENTS,
                schemas::SCHEMA_V1_ELEMENTS_IDX_TYPE,
                schemas::SCHEMA_V1_ELEMENTS_IDX_TYPE_STATUS,
                schemas::SCHEMA_V1_ELEMENTS_IDX_ASSIGNEE,
                schemas::SCHEMA_V1_ELEMENTS_IDX_CREATED,
                schemas::SCHEMA_V1_DEPENDENCIES,
                schemas::SCHEMA_V1_DEPENDENCIES_IDX_SOURCE,
                schemas::SCHEMA_V1_DEPENDENCIES_IDX_TARGET,
            ],
        },
        Migration {
            version: 2,
            description: "document version chain",
            statements: &[
                schemas::SCHEMA_V2_DOCUMENT_VERSIONS,
                schemas::SCHEMA_V2_DOCUMENT_VERSIONS_IDX,
            ],
        },
        Migration {
            version: 3,
            description: "sync dirty-set and hierarchical child counters",
            statements: &[
                schemas::SCHEMA_V3_DIRTY_ELEMENTS,
                schemas::SCHEMA_V3_CHILD_COUNTERS,
            ],
        },
    ]
}

/// Aggregate statistics for diagnostics surfaces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub file_size: u64,
    pub table_count: i64,
    pub index_count: i64,
    pub schema_version: i64,
    pub dirty_count: i64,
    pub element_count: i64,
    pub wal_mode: bool,
}

/// Single-writer embedded SQL backend.
///
/// Owns the `rusqlite::Connection`; prepared statements are cached on the
/// connection and finalized when the database is dropped. Not `Sync`: the
/// store wraps it in a mutex to serialize writers.
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
    wal: bool,
    tx_depth: Cell<u32>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open a database per `config`, applying standard pragmas.
    ///
    /// `":memory:"` opens an anonymous in-memory database. Opening a missing
    /// file with `create = false` fails with a storage error.
    pub fn open(config: &DbConfig) -> Result<Self, ElementalError> {
        let in_memory = config.path == ":memory:";
        let path = (!in_memory).then(|| PathBuf::from(&config.path));

        if let Some(file) = &path {
            if config.create {
                if let Some(parent) = file.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
            } else if !file.exists() {
                return Err(ElementalError::database(format!(
                    "database file not found: {}",
                    file.display()
                ))
                .with_detail("path", serde_json::json!(config.path)));
            }
        }

        let conn = if in_memory {
            Connection::open_in_memory()?
        } else if config.create {
            Connection::open(&config.path)?
        } else {
            Connection::open_with_flags(
                &config.path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI,
            )?
        };

        let pragmas = &config.pragmas;
        let busy = pragmas.busy_timeout_ms.unwrap_or(DEFAULT_BUSY_TIMEOUT_MS);
        conn.busy_timeout(std::time::Duration::from_millis(busy))?;

        let journal = pragmas.journal_mode.clone().unwrap_or_else(|| {
            if in_memory { "MEMORY".to_string() } else { "WAL".to_string() }
        });
        let applied_journal: String = conn.query_row(
            &format!("PRAGMA journal_mode={journal};"),
            [],
            |row| row.get(0),
        )?;

        let synchronous = pragmas.synchronous.as_deref().unwrap_or("NORMAL");
        conn.execute_batch(&format!("PRAGMA synchronous={synchronous};"))?;

        let foreign_keys = pragmas.foreign_keys.unwrap_or(true);
        conn.execute_batch(&format!(
            "PRAGMA foreign_keys={};",
            if foreign_keys { "ON" } else { "OFF" }
        ))?;

        let cache_size = pragmas.cache_size.unwrap_or(DEFAULT_CACHE_SIZE);
        conn.execute_batch(&format!("PRAGMA cache_size={cache_size};"))?;

        Ok(Self {
            conn,
            path,
            wal: applied_journal.eq_ignore_ascii_case("wal"),
            tx_depth: Cell::new(0),
        })
    }

    /// Open an in-memory database with the full schema applied. Test and
    /// ephemeral-store convenience.
    pub fn open_in_memory() -> Result<Self, ElementalError> {
        let db = Self::open(&DbConfig::memory())?;
        db.migrate()?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Execute one or more statements without parameters.
    pub fn exec(&self, sql: &str) -> Result<(), ElementalError> {
        self.conn.execute_batch(sql).map_err(Into::into)
    }

    /// Execute a single parameterized mutation.
    pub fn run<P: Params>(&self, sql: &str, params: P) -> Result<RunResult, ElementalError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let changes = stmt.execute(params)?;
        Ok(RunResult {
            changes,
            last_insert_rowid: self.conn.last_insert_rowid(),
        })
    }

    /// Query all rows through `map`.
    pub fn query<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Vec<T>, ElementalError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, map)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Query at most one row through `map`.
    pub fn query_one<T, P, F>(
        &self,
        sql: &str,
        params: P,
        map: F,
    ) -> Result<Option<T>, ElementalError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare_cached(sql)?;
        stmt.query_row(params, map).optional().map_err(Into::into)
    }

    /// Scoped transaction. The outermost call issues `BEGIN`; nested calls
    /// open savepoints named `sp_<depth>`. Any error (or unwind) rolls the
    /// scope back before propagating.
    pub fn transaction<T, F>(&self, isolation: Isolation, f: F) -> Result<T, ElementalError>
    where
        F: FnOnce(&Self) -> Result<T, ElementalError>,
    {
        let depth = self.tx_depth.get();
        if depth == 0 {
            self.conn.execute_batch(isolation.begin_sql())?;
        } else {
            self.conn
                .execute_batch(&format!("SAVEPOINT sp_{depth}"))?;
        }
        self.tx_depth.set(depth + 1);
        let mut guard = TxGuard {
            db: self,
            depth,
            armed: true,
        };

        let value = f(self)?;

        if depth == 0 {
            self.conn.execute_batch("COMMIT")?;
        } else {
            self.conn.execute_batch(&format!("RELEASE sp_{depth}"))?;
        }
        guard.armed = false;
        Ok(value)
    }

    pub fn in_transaction(&self) -> bool {
        self.tx_depth.get() > 0
    }

    /// Apply the built-in migration ladder.
    pub fn migrate(&self) -> Result<MigrationReport, ElementalError> {
        self.migrate_with(&migration_ladder())
    }

    /// Apply an ordered, possibly sparse ladder. Each rung runs in its own
    /// transaction; a failing rung leaves the last successful version
    /// persisted in `PRAGMA user_version`.
    pub fn migrate_with(&self, ladder: &[Migration]) -> Result<MigrationReport, ElementalError> {
        let from_version = self.schema_version()?;
        let mut current = from_version;
        let mut applied = Vec::new();

        for rung in ladder {
            if rung.version <= current {
                continue;
            }
            let result = self.transaction(Isolation::Immediate, |db| {
                for sql in rung.statements {
                    db.exec(sql)?;
                }
                db.exec(&format!("PRAGMA user_version={}", rung.version))?;
                Ok(())
            });
            if let Err(err) = result {
                return Err(ElementalError::new(
                    ErrorKind::MigrationFailed,
                    format!(
                        "migration to version {} failed ({}): {}",
                        rung.version, rung.description, err.message
                    ),
                )
                .with_detail("fromVersion", serde_json::json!(from_version))
                .with_detail("failedVersion", serde_json::json!(rung.version))
                .with_detail("persistedVersion", serde_json::json!(current))
                .with_cause(err));
            }
            current = rung.version;
            applied.push(rung.version);
        }

        Ok(MigrationReport {
            from_version,
            to_version: current,
            applied,
        })
    }

    pub fn schema_version(&self) -> Result<i64, ElementalError> {
        self.conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(Into::into)
    }

    /// `PRAGMA integrity_check` reduced to a boolean.
    pub fn integrity_check(&self) -> Result<bool, ElementalError> {
        let verdict: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(verdict.eq_ignore_ascii_case("ok"))
    }

    /// Issue the engine's maintenance pragma.
    pub fn optimize(&self) -> Result<(), ElementalError> {
        self.exec("PRAGMA optimize")
    }

    pub fn stats(&self) -> Result<DbStats, ElementalError> {
        let file_size = match &self.path {
            Some(path) => fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            None => 0,
        };
        let table_count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )?;
        let index_count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )?;
        let dirty_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM dirty_elements", [], |row| row.get(0))
            .unwrap_or(0);
        let element_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM elements", [], |row| row.get(0))
            .unwrap_or(0);
        Ok(DbStats {
            file_size,
            table_count,
            index_count,
            schema_version: self.schema_version()?,
            dirty_count,
            element_count,
            wal_mode: self.wal,
        })
    }

    // --- Dirty set (consumed by the external sync layer) ---

    /// Idempotent mark; re-marking refreshes `marked_at`.
    pub fn mark_dirty(&self, element_id: &str) -> Result<(), ElementalError> {
        self.run(
            "INSERT INTO dirty_elements(element_id, marked_at) VALUES (?1, ?2)
             ON CONFLICT(element_id) DO UPDATE SET marked_at = excluded.marked_at",
            rusqlite::params![element_id, time::now_iso()],
        )?;
        Ok(())
    }

    pub fn get_dirty(&self) -> Result<Vec<String>, ElementalError> {
        self.query(
            "SELECT element_id FROM dirty_elements ORDER BY marked_at, element_id",
            [],
            |row| row.get(0),
        )
    }

    pub fn clear_all_dirty(&self) -> Result<usize, ElementalError> {
        Ok(self.run("DELETE FROM dirty_elements", [])?.changes)
    }

    pub fn clear_dirty(&self, ids: &[String]) -> Result<usize, ElementalError> {
        let mut cleared = 0;
        self.transaction(Isolation::Immediate, |db| {
            for id in ids {
                cleared += db
                    .run("DELETE FROM dirty_elements WHERE element_id = ?1", [id])?
                    .changes;
            }
            Ok(())
        })?;
        Ok(cleared)
    }

    // --- Hierarchical child counters ---

    /// Atomically increment and return the next child ordinal for `parent_id`.
    pub fn next_child(&self, parent_id: &str) -> Result<i64, ElementalError> {
        self.transaction(Isolation::Immediate, |db| {
            db.run(
                "INSERT INTO child_counters(parent_id, last_child) VALUES (?1, 1)
                 ON CONFLICT(parent_id) DO UPDATE SET last_child = last_child + 1",
                [parent_id],
            )?;
            let value = db
                .query_one(
                    "SELECT last_child FROM child_counters WHERE parent_id = ?1",
                    [parent_id],
                    |row| row.get(0),
                )?
                .unwrap_or(0);
            Ok(value)
        })
    }

    /// Read the counter without incrementing.
    pub fn peek_child(&self, parent_id: &str) -> Result<i64, ElementalError> {
        Ok(self
            .query_one(
                "SELECT last_child FROM child_counters WHERE parent_id = ?1",
                [parent_id],
                |row| row.get(0),
            )?
            .unwrap_or(0))
    }

    pub fn reset_child(&self, parent_id: &str) -> Result<(), ElementalError> {
        self.run(
            "INSERT INTO child_counters(parent_id, last_child) VALUES (?1, 0)
             ON CONFLICT(parent_id) DO UPDATE SET last_child = 0",
            [parent_id],
        )?;
        Ok(())
    }
}

/// Rollback-on-drop guard for [`Database::transaction`]. Restores the depth
/// counter and rolls the scope back unless the transaction committed.
struct TxGuard<'a> {
    db: &'a Database,
    depth: u32,
    armed: bool,
}

impl Drop for TxGuard<'_> {
    fn drop(&mut self) {
        self.db.tx_depth.set(self.depth);
        if self.armed {
            let sql = if self.depth == 0 {
                "ROLLBACK".to_string()
            } else {
                format!("ROLLBACK TO sp_{0}; RELEASE sp_{0}", self.depth)
            };
            let _ = self.db.conn.execute_batch(&sql);
        }
    }
}
