use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// Target temperature reported when no setpoint row is active.
pub const DEFAULT_SETPOINT_TEMPERATURE: f64 = 25.0;

/// The two actuators the system knows about. Stored as the lowercase name in
/// `device_states.device_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeviceName {
    Fan,
    Heater,
}

impl DeviceName {
    pub const ALL: [DeviceName; 2] = [DeviceName::Fan, DeviceName::Heater];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceName::Fan => "fan",
            DeviceName::Heater => "heater",
        }
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "fan" => Ok(Self::Fan),
            "heater" => Ok(Self::Heater),
            other => Err(anyhow::anyhow!("unknown device: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: i64,
    pub temperature: f64,
    pub humidity: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Raw `device_states` row; `device_name` is validated on conversion.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct DeviceStateRow {
    pub device_name: String,
    pub is_on: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub device_name: DeviceName,
    pub is_on: bool,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DeviceStateRow> for DeviceState {
    type Error = anyhow::Error;

    fn try_from(row: DeviceStateRow) -> anyhow::Result<Self> {
        Ok(Self {
            device_name: row.device_name.parse()?,
            is_on: row.is_on,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Setpoint {
    pub id: i64,
    pub target_temperature: f64,
    /// Operator who created this row, if known.
    pub set_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
}
