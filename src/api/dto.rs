//! Wire shapes shared by the server handlers and the device client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::models::{DeviceName, SensorReading};

// ---------------------------------------------------------------------------
// Device endpoints
// ---------------------------------------------------------------------------

/// Request body for `POST /api/sensor-data/`.
///
/// Numeric fields are kept loose so that missing and non-numeric values can
/// be told apart from malformed JSON; numeric strings such as `"25.5"` are
/// accepted.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubmitReadingRequest {
    #[schema(value_type = Option<f64>)]
    pub temperature: Option<serde_json::Value>,
    #[schema(value_type = Option<f64>)]
    pub humidity: Option<serde_json::Value>,
    /// Any JSON value; only a string equal to the server's key passes.
    #[serde(default)]
    #[schema(value_type = String)]
    pub api_key: serde_json::Value,
}

/// Response for `POST /api/sensor-data/`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubmitReadingResponse {
    pub success: bool,
    pub message: String,
    pub data_id: i64,
    pub timestamp: DateTime<Utc>,
}

/// Response for `GET /api/get-setpoint/`. `updated_at` is null when no
/// setpoint has been stored and the default is reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SetpointResponse {
    pub setpoint_temperature: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeviceStatusEntry {
    pub is_on: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Response for `GET /api/get-device-status/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeviceStatusResponse {
    pub fan: DeviceStatusEntry,
    pub heater: DeviceStatusEntry,
}

impl DeviceStatusResponse {
    pub fn is_on(&self, device: DeviceName) -> bool {
        match device {
            DeviceName::Fan => self.fan.is_on,
            DeviceName::Heater => self.heater.is_on,
        }
    }
}

/// Response for `GET /api/latest-sensor/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LatestReadingResponse {
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
}

impl From<SensorReading> for LatestReadingResponse {
    fn from(r: SensorReading) -> Self {
        Self {
            temperature: r.temperature,
            humidity: r.humidity,
            timestamp: r.recorded_at,
        }
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HistoryReadingDto {
    pub id: i64,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
}

impl From<SensorReading> for HistoryReadingDto {
    fn from(r: SensorReading) -> Self {
        Self {
            id: r.id,
            temperature: r.temperature,
            humidity: r.humidity,
            timestamp: r.recorded_at,
        }
    }
}

/// Response for `GET /api/sensor-history/`. Readings are newest first.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HistoryResponse {
    pub page: i64,
    pub total_pages: i64,
    pub total: i64,
    pub readings: Vec<HistoryReadingDto>,
}

// ---------------------------------------------------------------------------
// Control commands
// ---------------------------------------------------------------------------

/// Request body for `POST /api/update-setpoint/`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdateSetpointRequest {
    #[schema(value_type = Option<f64>)]
    pub setpoint: Option<serde_json::Value>,
    /// Operator name recorded as the setpoint's provenance.
    pub set_by: Option<String>,
    /// Any JSON value; only a string equal to the server's key passes.
    #[serde(default)]
    #[schema(value_type = String)]
    pub api_key: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdateSetpointResponse {
    pub success: bool,
    pub message: String,
    pub setpoint: f64,
}

/// Request body for `POST /api/control-device/`. `action` is `"on"` or `"off"`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ControlDeviceRequest {
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub action: String,
    /// Any JSON value; only a string equal to the server's key passes.
    #[serde(default)]
    #[schema(value_type = String)]
    pub api_key: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ControlDeviceResponse {
    pub success: bool,
    pub message: String,
    pub device: DeviceName,
    pub status: bool,
}
