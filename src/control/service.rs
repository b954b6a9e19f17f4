use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

use crate::db::models::{DeviceName, DeviceState, DeviceStateRow, Setpoint};

/// Operator-facing writes to the setpoint and device state stores, plus the
/// reads the device polls.
#[derive(Debug, Clone)]
pub struct ControlService {
    pool: SqlitePool,
}

/// Current state of both actuators. `None` means the device has never been
/// switched and counts as off.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceStates {
    pub fan: Option<DeviceState>,
    pub heater: Option<DeviceState>,
}

impl DeviceStates {
    pub fn get(&self, device: DeviceName) -> Option<&DeviceState> {
        match device {
            DeviceName::Fan => self.fan.as_ref(),
            DeviceName::Heater => self.heater.as_ref(),
        }
    }

    pub fn is_on(&self, device: DeviceName) -> bool {
        self.get(device).is_some_and(|s| s.is_on)
    }
}

impl ControlService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn active_setpoint(&self) -> Result<Option<Setpoint>, sqlx::Error> {
        sqlx::query_as::<_, Setpoint>(
            r#"
            SELECT id, target_temperature, set_by, created_at, updated_at, is_active
            FROM setpoints
            WHERE is_active = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
    }

    /// Replaces the active setpoint with a new row.
    ///
    /// The deactivate and the insert share one transaction. The update is the
    /// first statement, so the transaction takes the write lock before
    /// touching anything and concurrent callers queue behind it; the
    /// `setpoints_single_active` index rejects any second active row.
    pub async fn set_setpoint(
        &self,
        target_temperature: f64,
        set_by: Option<&str>,
    ) -> Result<Setpoint, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE setpoints SET is_active = 0, updated_at = $1 WHERE is_active = 1")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        let setpoint = sqlx::query_as::<_, Setpoint>(
            r#"
            INSERT INTO setpoints (target_temperature, set_by, created_at, updated_at, is_active)
            VALUES ($1, $2, $3, $3, 1)
            RETURNING id, target_temperature, set_by, created_at, updated_at, is_active
            "#,
        )
        .bind(target_temperature)
        .bind(set_by)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            setpoint_id = setpoint.id,
            target_temperature,
            set_by = ?set_by,
            "Setpoint updated"
        );
        Ok(setpoint)
    }

    pub async fn device_state(&self, device: DeviceName) -> anyhow::Result<Option<DeviceState>> {
        let row = sqlx::query_as::<_, DeviceStateRow>(
            "SELECT device_name, is_on, updated_at FROM device_states WHERE device_name = $1",
        )
        .bind(device.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeviceState::try_from).transpose()
    }

    pub async fn device_states(&self) -> anyhow::Result<DeviceStates> {
        Ok(DeviceStates {
            fan: self.device_state(DeviceName::Fan).await?,
            heater: self.device_state(DeviceName::Heater).await?,
        })
    }

    /// Upserts the single row for `device`.
    pub async fn set_device_state(&self, device: DeviceName, is_on: bool) -> anyhow::Result<DeviceState> {
        let row = sqlx::query_as::<_, DeviceStateRow>(
            r#"
            INSERT INTO device_states (device_name, is_on, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (device_name) DO UPDATE
                SET is_on = excluded.is_on,
                    updated_at = excluded.updated_at
            RETURNING device_name, is_on, updated_at
            "#,
        )
        .bind(device.as_str())
        .bind(is_on)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        info!(device = %device, is_on, "Device state updated");
        DeviceState::try_from(row)
    }
}
