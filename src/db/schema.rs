//! Table definition for `sensor_readings` and the drift check that guards it.
//!
//! There is no versioned migration chain: when the live table lacks an
//! expected column it is copied aside and rebuilt from scratch. All of that
//! lives in [`migrate`] so a gentler strategy can replace it later.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::Local;
use rusqlite::{params, Connection, OptionalExtension};

use super::StorePaths;
use crate::{sink_info, sink_warn, utils::logging::LogSink};

pub const TABLE_NAME: &str = "sensor_readings";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub definition: &'static str,
}

/// Expected shape of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaDescriptor {
    pub table: &'static str,
    pub columns: &'static [ColumnSpec],
}

const fn column(name: &'static str, definition: &'static str) -> ColumnSpec {
    ColumnSpec { name, definition }
}

pub const READINGS_SCHEMA: SchemaDescriptor = SchemaDescriptor {
    table: TABLE_NAME,
    columns: &[
        column("id", "INTEGER PRIMARY KEY AUTOINCREMENT"),
        column("timestamp", "DATETIME DEFAULT CURRENT_TIMESTAMP"),
        column("temperature", "REAL NOT NULL"),
        column("humidity", "REAL NOT NULL"),
        column("pressure", "REAL NOT NULL"),
        column("air_quality", "INTEGER NOT NULL"),
        column("light_level", "INTEGER NOT NULL"),
        column("reading_date", "TEXT NOT NULL"),
        column("reading_time", "TEXT NOT NULL"),
        column("ip_address", "TEXT"),
        column("wifi_status", "TEXT"),
        column("ntp_sync", "TEXT"),
    ],
};

impl SchemaDescriptor {
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    pub fn create_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| format!("    {} {}", c.name, c.definition))
            .collect::<Vec<_>>()
            .join(",\n");
        format!("CREATE TABLE IF NOT EXISTS {} (\n{}\n);", self.table, columns)
    }

    /// Expected columns absent from `actual`, in declaration order.
    pub fn missing_from(&self, actual: &[String]) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| !actual.iter().any(|a| a == c.name))
            .map(|c| c.name.to_string())
            .collect()
    }

    /// Columns in `actual` this descriptor does not know about.
    pub fn unknown_in(&self, actual: &[String]) -> Vec<String> {
        actual
            .iter()
            .filter(|a| !self.columns.iter().any(|c| c.name == a.as_str()))
            .cloned()
            .collect()
    }
}

/// What a structural probe found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaState {
    Absent,
    Current { extra: Vec<String> },
    Stale { missing: Vec<String> },
}

/// Why a table was rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    MissingColumns(Vec<String>),
    /// The probe itself errored; kept distinct so a locked or corrupt file
    /// is not mistaken for real drift when reading logs.
    ProbeFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaOutcome {
    Unchanged,
    Created,
    Migrated {
        reason: StaleReason,
        backup: Option<PathBuf>,
    },
}

pub fn probe(conn: &Connection, schema: &SchemaDescriptor) -> Result<SchemaState> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![schema.table],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query sqlite_master")?;

    if existing.is_none() {
        return Ok(SchemaState::Absent);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", schema.table))
        .context("failed to prepare table_info")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>("name"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to read table_info")?;

    let missing = schema.missing_from(&columns);
    if missing.is_empty() {
        Ok(SchemaState::Current {
            extra: schema.unknown_in(&columns),
        })
    } else {
        Ok(SchemaState::Stale { missing })
    }
}

/// Bring `sensor_readings` to the expected shape.
///
/// Only a failure to create or rebuild the table is returned as an error;
/// probe failures and backup failures are logged and absorbed.
pub fn ensure(conn: &mut Connection, paths: &StorePaths, log: &dyn LogSink) -> Result<SchemaOutcome> {
    let probed = probe(conn, &READINGS_SCHEMA);
    reconcile(conn, paths, probed, log)
}

/// Act on what [`probe`] reported.
fn reconcile(
    conn: &mut Connection,
    paths: &StorePaths,
    probed: Result<SchemaState>,
    log: &dyn LogSink,
) -> Result<SchemaOutcome> {
    match probed {
        Ok(SchemaState::Current { extra }) => {
            if !extra.is_empty() {
                sink_info!(log, "{TABLE_NAME} has extra columns {extra:?}; leaving them in place");
            }
            Ok(SchemaOutcome::Unchanged)
        }
        Ok(SchemaState::Absent) => {
            conn.execute_batch(&READINGS_SCHEMA.create_sql())
                .with_context(|| format!("failed to create {TABLE_NAME}"))?;
            sink_info!(log, "Created table {TABLE_NAME}");
            Ok(SchemaOutcome::Created)
        }
        Ok(SchemaState::Stale { missing }) => {
            sink_warn!(log, "{TABLE_NAME} is missing columns {missing:?}; rebuilding");
            migrate(conn, paths, StaleReason::MissingColumns(missing), log)
        }
        Err(err) => {
            sink_warn!(log, "Schema probe failed ({err:#}); assuming {TABLE_NAME} is stale");
            migrate(conn, paths, StaleReason::ProbeFailed(format!("{err:#}")), log)
        }
    }
}

/// Destructive rebuild: back the file up, then drop and recreate the table.
pub fn migrate(
    conn: &mut Connection,
    paths: &StorePaths,
    reason: StaleReason,
    log: &dyn LogSink,
) -> Result<SchemaOutcome> {
    let backup = match backup_store(conn, paths) {
        Ok(Some(path)) => {
            sink_info!(log, "Backed up {} to {}", paths.db_path.display(), path.display());
            Some(path)
        }
        Ok(None) => None,
        Err(err) => {
            sink_warn!(log, "Backup before rebuild failed, continuing without it: {err:#}");
            None
        }
    };

    let tx = conn
        .transaction()
        .context("failed to open rebuild transaction")?;
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {};\n{}",
        READINGS_SCHEMA.table,
        READINGS_SCHEMA.create_sql()
    ))
    .with_context(|| format!("failed to rebuild {TABLE_NAME}"))?;
    tx.commit().context("failed to commit rebuild")?;

    sink_info!(log, "Rebuilt {TABLE_NAME} with the current column set");
    Ok(SchemaOutcome::Migrated { reason, backup })
}

fn backup_store(conn: &Connection, paths: &StorePaths) -> Result<Option<PathBuf>> {
    if paths.is_in_memory() || !paths.db_path.exists() {
        return Ok(None);
    }

    // Fold the WAL into the main file so the copy holds every committed row.
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        .context("failed to checkpoint WAL before backup")?;

    fs::create_dir_all(&paths.backup_dir).with_context(|| {
        format!("failed to create backup directory {}", paths.backup_dir.display())
    })?;

    let stamp = Local::now().format("%Y%m%d%H%M%S").to_string();
    let target = free_backup_path(&paths.backup_dir, &stamp);
    fs::copy(&paths.db_path, &target)
        .with_context(|| format!("failed to copy store to {}", target.display()))?;

    Ok(Some(target))
}

/// `backup_<stamp>.db`, or `backup_<stamp>_<n>.db` when rebuilds land in
/// the same second.
fn free_backup_path(dir: &Path, stamp: &str) -> PathBuf {
    let first = dir.join(format!("backup_{stamp}.db"));
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| dir.join(format!("backup_{stamp}_{n}.db")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::logging::{Level, MemoryLog, SilentLog};
    use anyhow::anyhow;
    use pretty_assertions::assert_eq;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn create_sql_lists_every_column() {
        let sql = READINGS_SCHEMA.create_sql();
        for name in READINGS_SCHEMA.column_names() {
            assert!(sql.contains(name), "{name} missing from {sql}");
        }
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS sensor_readings"));
    }

    #[test]
    fn missing_and_unknown_columns_are_separated() {
        let actual = columns(&["id", "timestamp", "temperature", "humidity", "legacy"]);

        let missing = READINGS_SCHEMA.missing_from(&actual);
        assert!(missing.contains(&"reading_date".to_string()));
        assert!(missing.contains(&"ip_address".to_string()));
        assert!(!missing.contains(&"temperature".to_string()));
        assert_eq!(READINGS_SCHEMA.unknown_in(&actual), columns(&["legacy"]));
    }

    #[test]
    fn probe_reports_absent_then_current() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(probe(&conn, &READINGS_SCHEMA).unwrap(), SchemaState::Absent);

        conn.execute_batch(&READINGS_SCHEMA.create_sql()).unwrap();
        assert_eq!(
            probe(&conn, &READINGS_SCHEMA).unwrap(),
            SchemaState::Current { extra: vec![] }
        );
    }

    #[test]
    fn in_memory_rebuild_skips_backup() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE sensor_readings (id INTEGER PRIMARY KEY, temperature REAL);")
            .unwrap();

        let outcome = ensure(&mut conn, &StorePaths::in_memory(), &SilentLog).unwrap();

        assert_eq!(
            outcome,
            SchemaOutcome::Migrated {
                reason: StaleReason::MissingColumns(columns(&[
                    "timestamp",
                    "humidity",
                    "pressure",
                    "air_quality",
                    "light_level",
                    "reading_date",
                    "reading_time",
                    "ip_address",
                    "wifi_status",
                    "ntp_sync",
                ])),
                backup: None,
            }
        );
        assert!(matches!(
            probe(&conn, &READINGS_SCHEMA).unwrap(),
            SchemaState::Current { .. }
        ));
    }

    #[test]
    fn unreadable_schema_rebuilds_and_says_why() {
        let mut conn = Connection::open_in_memory().unwrap();
        let memory = MemoryLog::new();

        let outcome = reconcile(
            &mut conn,
            &StorePaths::in_memory(),
            Err(anyhow!("database is locked")),
            &*memory,
        )
        .unwrap();

        assert_eq!(
            outcome,
            SchemaOutcome::Migrated {
                reason: StaleReason::ProbeFailed("database is locked".to_string()),
                backup: None,
            }
        );
        assert!(memory.contains(Level::Warn, "Schema probe failed"));
        assert_eq!(
            probe(&conn, &READINGS_SCHEMA).unwrap(),
            SchemaState::Current { extra: vec![] }
        );
    }

    #[test]
    fn same_second_backups_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let stamp = "20240501083000";

        let first = free_backup_path(dir.path(), stamp);
        assert_eq!(first, dir.path().join("backup_20240501083000.db"));
        fs::write(&first, b"first").unwrap();

        let second = free_backup_path(dir.path(), stamp);
        assert_eq!(second, dir.path().join("backup_20240501083000_1.db"));
        fs::write(&second, b"second").unwrap();

        assert_eq!(
            free_backup_path(dir.path(), stamp),
            dir.path().join("backup_20240501083000_2.db")
        );
        assert_eq!(fs::read(&first).unwrap(), b"first");
    }
}
