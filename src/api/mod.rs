pub mod dto;
pub mod errors;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::SqlitePool;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use crate::{control::ControlService, sensors::SensorService};
use errors::ApiError;
use handlers::ApiDoc;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub sensors: SensorService,
    pub control: ControlService,
    api_key: Arc<str>,
}

impl AppState {
    pub fn new(pool: SqlitePool, api_key: impl Into<Arc<str>>) -> Self {
        Self {
            sensors: SensorService::new(pool.clone()),
            control: ControlService::new(pool),
            api_key: api_key.into(),
        }
    }

    /// Exact match against the configured shared secret. An empty key never
    /// matches.
    pub fn authorize(&self, presented: &str) -> Result<(), ApiError> {
        if !presented.is_empty() && presented == &*self.api_key {
            Ok(())
        } else {
            tracing::warn!("Rejected request with invalid API key");
            Err(ApiError::Unauthorized)
        }
    }
}

pub fn router(state: AppState) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route("/api/sensor-data/", post(handlers::submit_sensor_data))
        .route("/api/get-setpoint/", get(handlers::get_setpoint))
        .route("/api/get-device-status/", get(handlers::get_device_status))
        .route("/api/latest-sensor/", get(handlers::get_latest_sensor))
        .route("/api/sensor-history/", get(handlers::get_sensor_history))
        .route("/api/update-setpoint/", post(handlers::update_setpoint))
        .route("/api/control-device/", post(handlers::control_device))
        .with_state(state)
        .split_for_parts();

    router
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { axum::Json(api) }),
        )
}
