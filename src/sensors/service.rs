use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db::models::SensorReading;

/// Page size of the reading history listing.
pub const HISTORY_PAGE_SIZE: i64 = 50;

/// Append-only access to `sensor_readings`.
#[derive(Debug, Clone)]
pub struct SensorService {
    pool: SqlitePool,
}

/// One page of readings, newest first.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub page: i64,
    pub total_pages: i64,
    pub total: i64,
    pub readings: Vec<SensorReading>,
}

impl SensorService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Appends one reading stamped with the current time and returns the
    /// stored row.
    pub async fn record(&self, temperature: f64, humidity: f64) -> Result<SensorReading, sqlx::Error> {
        let reading = sqlx::query_as::<_, SensorReading>(
            r#"
            INSERT INTO sensor_readings (temperature, humidity, recorded_at)
            VALUES ($1, $2, $3)
            RETURNING id, temperature, humidity, recorded_at
            "#,
        )
        .bind(temperature)
        .bind(humidity)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        info!(
            data_id = reading.id,
            temperature = reading.temperature,
            humidity = reading.humidity,
            "Sensor reading recorded"
        );
        Ok(reading)
    }

    /// Most recent reading by `recorded_at`, `None` on an empty store.
    pub async fn latest(&self) -> Result<Option<SensorReading>, sqlx::Error> {
        sqlx::query_as::<_, SensorReading>(
            r#"
            SELECT id, temperature, humidity, recorded_at
            FROM sensor_readings
            ORDER BY recorded_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM sensor_readings")
            .fetch_one(&self.pool)
            .await
    }

    /// Returns page `page` (1-based) of the history. Pages below 1 clamp to
    /// the first page, pages past the end clamp to the last one.
    pub async fn history(&self, page: i64) -> Result<HistoryPage, sqlx::Error> {
        let total = self.count().await?;
        let total_pages = ((total + HISTORY_PAGE_SIZE - 1) / HISTORY_PAGE_SIZE).max(1);
        let page = page.clamp(1, total_pages);
        debug!(page, total_pages, total, "Fetching reading history");

        let readings = sqlx::query_as::<_, SensorReading>(
            r#"
            SELECT id, temperature, humidity, recorded_at
            FROM sensor_readings
            ORDER BY recorded_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(HISTORY_PAGE_SIZE)
        .bind((page - 1) * HISTORY_PAGE_SIZE)
        .fetch_all(&self.pool)
        .await?;

        Ok(HistoryPage { page, total_pages, total, readings })
    }
}
