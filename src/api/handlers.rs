use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use utoipa::{IntoParams, OpenApi};

use super::{
    dto::{
        ControlDeviceRequest, ControlDeviceResponse, DeviceStatusEntry, DeviceStatusResponse,
        HistoryReadingDto, HistoryResponse, LatestReadingResponse, SetpointResponse,
        SubmitReadingRequest, SubmitReadingResponse, UpdateSetpointRequest, UpdateSetpointResponse,
    },
    errors::ApiError,
    AppState,
};
use crate::db::models::{DeviceName, DeviceState, DEFAULT_SETPOINT_TEMPERATURE};

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, IntoParams)]
pub struct ApiKeyParams {
    /// Shared secret configured on the server.
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoryParams {
    #[serde(default)]
    pub api_key: String,
    /// 1-based page number, defaults to 1.
    pub page: Option<i64>,
}

// ---------------------------------------------------------------------------
// Device endpoints
// ---------------------------------------------------------------------------

/// Record a new temperature/humidity reading from the device.
#[utoipa::path(
    post,
    path = "/api/sensor-data/",
    request_body = SubmitReadingRequest,
    responses(
        (status = 201, description = "Reading recorded", body = SubmitReadingResponse),
        (status = 400, description = "Malformed JSON, missing or non-numeric fields"),
        (status = 401, description = "Invalid API key"),
    ),
    tag = "device"
)]
pub async fn submit_sensor_data(
    State(state): State<AppState>,
    payload: Result<Json<SubmitReadingRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitReadingResponse>), ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::InvalidPayload(e.body_text()))?;
    state.authorize(body_key(&req.api_key))?;

    let (Some(temperature), Some(humidity)) = (req.temperature.as_ref(), req.humidity.as_ref())
    else {
        return Err(ApiError::InvalidPayload(
            "Missing temperature or humidity".to_owned(),
        ));
    };
    let temperature = parse_number("temperature", temperature)?;
    let humidity = parse_number("humidity", humidity)?;

    let reading = state.sensors.record(temperature, humidity).await?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitReadingResponse {
            success: true,
            message: "Sensor data recorded".to_owned(),
            data_id: reading.id,
            timestamp: reading.recorded_at,
        }),
    ))
}

/// Current target temperature, or the default when none has been set.
#[utoipa::path(
    get,
    path = "/api/get-setpoint/",
    params(ApiKeyParams),
    responses(
        (status = 200, description = "Active setpoint", body = SetpointResponse),
        (status = 401, description = "Invalid API key"),
    ),
    tag = "device"
)]
pub async fn get_setpoint(
    State(state): State<AppState>,
    Query(params): Query<ApiKeyParams>,
) -> Result<Json<SetpointResponse>, ApiError> {
    state.authorize(&params.api_key)?;

    let response = match state.control.active_setpoint().await? {
        Some(sp) => SetpointResponse {
            setpoint_temperature: sp.target_temperature,
            updated_at: Some(sp.updated_at),
        },
        None => SetpointResponse {
            setpoint_temperature: DEFAULT_SETPOINT_TEMPERATURE,
            updated_at: None,
        },
    };
    Ok(Json(response))
}

/// On/off state of the fan and heater. Devices never switched report off.
#[utoipa::path(
    get,
    path = "/api/get-device-status/",
    params(ApiKeyParams),
    responses(
        (status = 200, description = "Device states", body = DeviceStatusResponse),
        (status = 401, description = "Invalid API key"),
    ),
    tag = "device"
)]
pub async fn get_device_status(
    State(state): State<AppState>,
    Query(params): Query<ApiKeyParams>,
) -> Result<Json<DeviceStatusResponse>, ApiError> {
    state.authorize(&params.api_key)?;

    let states = state.control.device_states().await?;
    Ok(Json(DeviceStatusResponse {
        fan: status_entry(states.fan.as_ref()),
        heater: status_entry(states.heater.as_ref()),
    }))
}

/// Most recent reading.
#[utoipa::path(
    get,
    path = "/api/latest-sensor/",
    params(ApiKeyParams),
    responses(
        (status = 200, description = "Latest reading", body = LatestReadingResponse),
        (status = 401, description = "Invalid API key"),
        (status = 404, description = "No sensor data available"),
    ),
    tag = "device"
)]
pub async fn get_latest_sensor(
    State(state): State<AppState>,
    Query(params): Query<ApiKeyParams>,
) -> Result<Json<LatestReadingResponse>, ApiError> {
    state.authorize(&params.api_key)?;

    state
        .sensors
        .latest()
        .await?
        .map(|r| Json(r.into()))
        .ok_or(ApiError::NotFound("No sensor data available"))
}

/// Paged reading history, newest first.
#[utoipa::path(
    get,
    path = "/api/sensor-history/",
    params(HistoryParams),
    responses(
        (status = 200, description = "One page of readings", body = HistoryResponse),
        (status = 401, description = "Invalid API key"),
    ),
    tag = "device"
)]
pub async fn get_sensor_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    state.authorize(&params.api_key)?;

    let page = state.sensors.history(params.page.unwrap_or(1)).await?;
    Ok(Json(HistoryResponse {
        page: page.page,
        total_pages: page.total_pages,
        total: page.total,
        readings: page.readings.into_iter().map(HistoryReadingDto::from).collect(),
    }))
}

// ---------------------------------------------------------------------------
// Control commands
// ---------------------------------------------------------------------------

/// Replace the active setpoint.
#[utoipa::path(
    post,
    path = "/api/update-setpoint/",
    request_body = UpdateSetpointRequest,
    responses(
        (status = 200, description = "Setpoint updated", body = UpdateSetpointResponse),
        (status = 400, description = "Missing or non-numeric setpoint"),
        (status = 401, description = "Invalid API key"),
    ),
    tag = "control"
)]
pub async fn update_setpoint(
    State(state): State<AppState>,
    payload: Result<Json<UpdateSetpointRequest>, JsonRejection>,
) -> Result<Json<UpdateSetpointResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::InvalidPayload(e.body_text()))?;
    state.authorize(body_key(&req.api_key))?;

    let target = req
        .setpoint
        .as_ref()
        .ok_or_else(|| ApiError::InvalidPayload("Missing setpoint".to_owned()))
        .and_then(|v| parse_number("setpoint", v))?;

    let setpoint = state.control.set_setpoint(target, req.set_by.as_deref()).await?;

    Ok(Json(UpdateSetpointResponse {
        success: true,
        message: format!("Setpoint updated to {}°C", setpoint.target_temperature),
        setpoint: setpoint.target_temperature,
    }))
}

/// Switch the fan or heater on or off.
#[utoipa::path(
    post,
    path = "/api/control-device/",
    request_body = ControlDeviceRequest,
    responses(
        (status = 200, description = "Device state updated", body = ControlDeviceResponse),
        (status = 400, description = "Invalid device or action"),
        (status = 401, description = "Invalid API key"),
    ),
    tag = "control"
)]
pub async fn control_device(
    State(state): State<AppState>,
    payload: Result<Json<ControlDeviceRequest>, JsonRejection>,
) -> Result<Json<ControlDeviceResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::InvalidPayload(e.body_text()))?;
    state.authorize(body_key(&req.api_key))?;

    let device: DeviceName = req
        .device
        .parse()
        .map_err(|_| ApiError::InvalidPayload("Invalid device".to_owned()))?;
    let is_on = match req.action.as_str() {
        "on" => true,
        "off" => false,
        _ => return Err(ApiError::InvalidPayload("Invalid action".to_owned())),
    };

    let updated = state.control.set_device_state(device, is_on).await?;

    let label = match device {
        DeviceName::Fan => "Fan",
        DeviceName::Heater => "Heater",
    };
    Ok(Json(ControlDeviceResponse {
        success: true,
        message: format!("{label} turned {}", if is_on { "ON" } else { "OFF" }),
        device,
        status: updated.is_on,
    }))
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Accepts JSON numbers and numeric strings; rejects everything non-finite.
fn parse_number(field: &str, value: &Value) -> Result<f64, ApiError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| ApiError::InvalidPayload(format!("{field} must be a number")))
}

/// Key carried in a JSON body. Non-string keys never match.
fn body_key(value: &Value) -> &str {
    value.as_str().unwrap_or_default()
}

fn status_entry(state: Option<&DeviceState>) -> DeviceStatusEntry {
    DeviceStatusEntry {
        is_on: state.is_some_and(|s| s.is_on),
        last_updated: state.map(|s| s.updated_at),
    }
}

// ---------------------------------------------------------------------------
// OpenAPI document
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(
        submit_sensor_data,
        get_setpoint,
        get_device_status,
        get_latest_sensor,
        get_sensor_history,
        update_setpoint,
        control_device,
        health,
    ),
    components(schemas(
        SubmitReadingRequest,
        SubmitReadingResponse,
        SetpointResponse,
        DeviceStatusEntry,
        DeviceStatusResponse,
        LatestReadingResponse,
        HistoryReadingDto,
        HistoryResponse,
        UpdateSetpointRequest,
        UpdateSetpointResponse,
        ControlDeviceRequest,
        ControlDeviceResponse,
        DeviceName,
    )),
    tags(
        (name = "device",  description = "Endpoints polled by the aquarium device"),
        (name = "control", description = "Operator control commands"),
        (name = "system",  description = "System endpoints"),
    ),
    info(
        title = "Aquarium Monitor API",
        version = "0.1.0",
        description = "Sensor telemetry and actuator control for the aquarium controller"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
