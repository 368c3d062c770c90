use std::{fs, path::Path};

use pretty_assertions::assert_eq;
use rusqlite::Connection;
use sensor_logger::{
    db::{ReadingStore, SchemaOutcome, StaleReason, StorePaths},
    models::SensorReading,
    utils::logging::SilentLog,
};

fn reading(temperature: f64) -> SensorReading {
    SensorReading {
        temperature,
        humidity: 50.0,
        pressure: 1013.25,
        air_quality: 42,
        light_level: 512,
        date: "2024-01-15".to_string(),
        time: "12:00:00".to_string(),
        ip_address: None,
        wifi_status: Some("connected".to_string()),
        ntp_sync: None,
    }
}

/// The table as an older firmware build created it, before `ip_address`.
fn seed_stale_table(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE sensor_readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
            temperature REAL NOT NULL,
            humidity REAL NOT NULL,
            pressure REAL NOT NULL,
            air_quality INTEGER NOT NULL,
            light_level INTEGER NOT NULL,
            reading_date TEXT NOT NULL,
            reading_time TEXT NOT NULL,
            wifi_status TEXT,
            ntp_sync TEXT
        );
        INSERT INTO sensor_readings
            (temperature, humidity, pressure, air_quality, light_level, reading_date, reading_time)
            VALUES (20.0, 40.0, 1000.0, 1, 2, '2023-12-31', '23:00:00');",
    )
    .unwrap();
}

fn backups_in(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("backup_") && name.ends_with(".db"))
        .collect()
}

#[tokio::test]
async fn reopening_a_current_store_keeps_its_rows() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::in_dir(dir.path());

    let store = ReadingStore::open(paths.clone(), SilentLog::shared()).unwrap();
    assert_eq!(store.schema_outcome(), &SchemaOutcome::Created);
    store.append(reading(21.5)).await.unwrap();
    drop(store);

    let store = ReadingStore::open(paths, SilentLog::shared()).unwrap();
    assert_eq!(store.schema_outcome(), &SchemaOutcome::Unchanged);
    assert_eq!(store.ensure_schema().await.unwrap(), SchemaOutcome::Unchanged);
    assert_eq!(store.count().await.unwrap(), 1);
    assert!(backups_in(dir.path()).is_empty());
}

#[tokio::test]
async fn stale_table_is_backed_up_and_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let backup_dir = dir.path().join("backups");
    let paths = StorePaths {
        db_path: dir.path().join("sensor_data.db"),
        backup_dir: backup_dir.clone(),
    };
    seed_stale_table(&paths.db_path);

    let store = ReadingStore::open(paths, SilentLog::shared()).unwrap();

    let backup = match store.schema_outcome() {
        SchemaOutcome::Migrated { reason, backup } => {
            assert_eq!(reason, &StaleReason::MissingColumns(vec!["ip_address".to_string()]));
            backup.clone().expect("a file store should be backed up")
        }
        other => panic!("expected a rebuild, got {other:?}"),
    };

    assert_eq!(backups_in(&backup_dir).len(), 1);
    assert!(backup.starts_with(&backup_dir));

    // The old row survives only in the copy.
    let copy = Connection::open(&backup).unwrap();
    let old_rows: i64 = copy
        .query_row("SELECT COUNT(*) FROM sensor_readings", [], |row| row.get(0))
        .unwrap();
    assert_eq!(old_rows, 1);
    assert_eq!(store.count().await.unwrap(), 0);

    // The rebuilt table takes every column.
    let mut full = reading(18.0);
    full.ip_address = Some("10.0.0.7".to_string());
    store.append(full).await.unwrap();
    let rows = store.latest(1).await.unwrap();
    assert_eq!(rows[0].reading.ip_address.as_deref(), Some("10.0.0.7"));
}

#[tokio::test]
async fn failed_backup_does_not_block_the_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let not_a_dir = dir.path().join("occupied");
    fs::write(&not_a_dir, b"plain file").unwrap();
    let paths = StorePaths {
        db_path: dir.path().join("sensor_data.db"),
        backup_dir: not_a_dir,
    };
    seed_stale_table(&paths.db_path);

    let store = ReadingStore::open(paths, SilentLog::shared()).unwrap();

    assert!(matches!(
        store.schema_outcome(),
        SchemaOutcome::Migrated { backup: None, .. }
    ));
    store.append(reading(25.0)).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn extra_columns_are_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::in_dir(dir.path());
    {
        let store = ReadingStore::open(paths.clone(), SilentLog::shared()).unwrap();
        store.append(reading(30.0)).await.unwrap();
    }
    {
        let conn = Connection::open(&paths.db_path).unwrap();
        conn.execute_batch("ALTER TABLE sensor_readings ADD COLUMN battery REAL;")
            .unwrap();
    }

    let store = ReadingStore::open(paths, SilentLog::shared()).unwrap();

    assert_eq!(store.schema_outcome(), &SchemaOutcome::Unchanged);
    assert_eq!(store.count().await.unwrap(), 1);
}
