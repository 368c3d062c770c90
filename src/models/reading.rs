use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One parsed response frame from the gateway.
///
/// `date` and `time` are the device's own clock readings and are kept
/// verbatim; nothing downstream interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    #[serde(alias = "air_quality")]
    pub air_quality: i32,
    #[serde(alias = "light_level")]
    pub light_level: i32,
    pub date: String,
    pub time: String,
    #[serde(default, alias = "ip_address")]
    pub ip_address: Option<String>,
    #[serde(default, alias = "wifi_status")]
    pub wifi_status: Option<String>,
    #[serde(default, alias = "ntp_sync")]
    pub ntp_sync: Option<String>,
}

/// A row of `sensor_readings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReading {
    pub id: i64,
    /// Ingestion time assigned by SQLite, not by the device.
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub reading: SensorReading,
}
