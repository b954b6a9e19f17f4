use std::time::Duration;

use chrono::Utc;
use tokio::{net::TcpListener, sync::watch};

use aquarium_monitor::{
    agent::{ApiCall, DryRunOutputs, PollLoop, SensorSample, SimulatedSensor},
    api::{self, AppState},
    client::ApiClient,
    db::{self, models::DeviceName},
};

const KEY: &str = "e2e-secret";

/// Serves the full router on an ephemeral port and returns its base URL.
async fn spawn_server() -> (String, AppState) {
    let pool = db::create_pool("sqlite::memory:", 1).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let state = AppState::new(pool, KEY);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), state)
}

fn client(base_url: &str, key: &str) -> ApiClient {
    ApiClient::new(base_url, key, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn submitted_reading_becomes_latest() {
    let (url, _state) = spawn_server().await;
    let client = client(&url, KEY);

    assert!(client.latest_reading().await.unwrap().is_none());

    let before = Utc::now();
    let resp = client
        .submit_reading(&SensorSample { temperature: 25.5, humidity: 60.0 })
        .await
        .unwrap();
    let after = Utc::now();

    assert!(resp.success);
    assert!(resp.timestamp >= before && resp.timestamp <= after);

    let latest = client.latest_reading().await.unwrap().unwrap();
    assert_eq!(latest.temperature, 25.5);
    assert_eq!(latest.humidity, 60.0);
    assert_eq!(latest.timestamp, resp.timestamp);
}

#[tokio::test]
async fn wrong_key_is_rejected_end_to_end() {
    let (url, state) = spawn_server().await;
    let client = client(&url, "wrong");

    assert!(client
        .submit_reading(&SensorSample { temperature: 25.5, humidity: 60.0 })
        .await
        .is_err());
    assert!(client.fetch_setpoint().await.is_err());
    assert!(client.fetch_device_status().await.is_err());
    assert_eq!(state.sensors.count().await.unwrap(), 0);
}

#[tokio::test]
async fn fresh_server_reports_defaults() {
    let (url, _state) = spawn_server().await;
    let client = client(&url, KEY);

    let setpoint = client.fetch_setpoint().await.unwrap();
    assert_eq!(setpoint.setpoint_temperature, 25.0);
    assert!(setpoint.updated_at.is_none());

    let status = client.fetch_device_status().await.unwrap();
    assert!(!status.fan.is_on);
    assert!(!status.heater.is_on);
}

#[tokio::test]
async fn poll_cycle_follows_server_state() {
    let (url, state) = spawn_server().await;
    state.control.set_setpoint(23.5, Some("test")).await.unwrap();
    state.control.set_device_state(DeviceName::Fan, true).await.unwrap();

    let (_stop_tx, stop_rx) = watch::channel(false);
    let mut poll = PollLoop::new(
        client(&url, KEY),
        Box::new(SimulatedSensor::default()),
        Box::new(DryRunOutputs::default()),
        Duration::from_secs(30),
    );

    poll.run_cycle(&stop_rx).await;

    for call in ApiCall::ALL {
        assert_eq!(poll.api_errors(call), 0);
    }
    assert_eq!(poll.setpoint(), 23.5);
    assert_eq!(poll.last_known().commanded(DeviceName::Fan), Some(true));
    assert_eq!(poll.last_known().commanded(DeviceName::Heater), Some(false));
    assert_eq!(state.sensors.count().await.unwrap(), 1);

    state.control.set_device_state(DeviceName::Fan, false).await.unwrap();
    state.control.set_device_state(DeviceName::Heater, true).await.unwrap();
    poll.run_cycle(&stop_rx).await;

    assert_eq!(poll.last_known().commanded(DeviceName::Fan), Some(false));
    assert_eq!(poll.last_known().commanded(DeviceName::Heater), Some(true));
    assert_eq!(state.sensors.count().await.unwrap(), 2);
}
