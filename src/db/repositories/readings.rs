use anyhow::{Context, Result};
use rusqlite::params;

use crate::{
    db::{
        helpers::{parse_sqlite_timestamp, to_i64, to_u64},
        ReadingStore,
    },
    models::{SensorReading, StoredReading},
};

impl ReadingStore {
    /// Insert one reading and return its row id.
    ///
    /// `id` and `timestamp` are always left to SQLite. A failed insert is
    /// not retried; the reading is gone.
    pub async fn append(&self, reading: SensorReading) -> Result<i64> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sensor_readings (
                    temperature,
                    humidity,
                    pressure,
                    air_quality,
                    light_level,
                    reading_date,
                    reading_time,
                    ip_address,
                    wifi_status,
                    ntp_sync
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    reading.temperature,
                    reading.humidity,
                    reading.pressure,
                    reading.air_quality,
                    reading.light_level,
                    reading.date,
                    reading.time,
                    reading.ip_address,
                    reading.wifi_status,
                    reading.ntp_sync,
                ],
            )
            .with_context(|| "failed to insert sensor reading")?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Newest rows first.
    pub async fn latest(&self, limit: u64) -> Result<Vec<StoredReading>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT
                    id,
                    timestamp,
                    temperature,
                    humidity,
                    pressure,
                    air_quality,
                    light_level,
                    reading_date,
                    reading_time,
                    ip_address,
                    wifi_status,
                    ntp_sync
                FROM sensor_readings
                ORDER BY id DESC
                LIMIT ?1",
            )?;

            let mut rows = stmt.query(params![to_i64(limit)?])?;
            let mut readings = Vec::new();
            while let Some(row) = rows.next()? {
                let timestamp: String = row.get(1)?;
                readings.push(StoredReading {
                    id: row.get(0)?,
                    timestamp: parse_sqlite_timestamp(&timestamp, "timestamp")?,
                    reading: SensorReading {
                        temperature: row.get(2)?,
                        humidity: row.get(3)?,
                        pressure: row.get(4)?,
                        air_quality: row.get(5)?,
                        light_level: row.get(6)?,
                        date: row.get(7)?,
                        time: row.get(8)?,
                        ip_address: row.get(9)?,
                        wifi_status: row.get(10)?,
                        ntp_sync: row.get(11)?,
                    },
                });
            }

            Ok(readings)
        })
        .await
    }

    pub async fn count(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM sensor_readings", [], |row| row.get(0))
                .context("failed to count sensor readings")?;
            to_u64(count, "count")
        })
        .await
    }
}
