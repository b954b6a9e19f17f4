//! Device agent: polls the local sensor, reports to the server and drives
//! the fan and heater relays from the server's device flags.

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use aquarium_monitor::{
    agent::{
        BoxedOutputs, BoxedSensor, DryRunOutputs, FileSensor, PollLoop, SimulatedSensor,
        SysfsOutputs,
    },
    client::ApiClient,
    config::{AgentConfig, SensorSource},
    shutdown::shutdown_signal,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = AgentConfig::from_env()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.default_log_filter())),
        )
        .init();

    info!(server_url = %config.server_url, "Starting aquarium agent");

    let client = ApiClient::from_config(&config)?;

    let sensor: BoxedSensor = match &config.sensor_source {
        SensorSource::Simulated => Box::new(SimulatedSensor::default()),
        SensorSource::File(path) => Box::new(FileSensor::new(path)),
    };

    let outputs: BoxedOutputs = if config.gpio_dry_run {
        Box::new(DryRunOutputs::default())
    } else {
        Box::new(
            SysfsOutputs::open(
                &config.gpio_root,
                config.fan_gpio,
                config.heater_gpio,
                config.relay_active_low,
            )
            .context("Failed to set up GPIO outputs")?,
        )
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    PollLoop::new(client, sensor, outputs, config.poll_interval)
        .with_api_error_log_every(config.api_error_log_every)
        .run(stop_rx)
        .await;

    info!("Aquarium agent stopped");
    Ok(())
}
