use std::{fs, io, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Plausible range of the DHT22-class sensors used on the device.
const MIN_TEMPERATURE: f64 = -40.0;
const MAX_TEMPERATURE: f64 = 125.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Degrees Celsius.
    pub temperature: f64,
    /// Relative humidity, percent.
    pub humidity: f64,
}

impl SensorSample {
    /// Rejects readings a working sensor cannot produce.
    pub fn validate(self) -> Result<Self, SensorError> {
        if !self.temperature.is_finite()
            || !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&self.temperature)
        {
            return Err(SensorError::OutOfRange(format!(
                "temperature {} outside {MIN_TEMPERATURE}..={MAX_TEMPERATURE}",
                self.temperature
            )));
        }
        if !self.humidity.is_finite() || !(0.0..=100.0).contains(&self.humidity) {
            return Err(SensorError::OutOfRange(format!(
                "humidity {} outside 0..=100",
                self.humidity
            )));
        }
        Ok(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("failed to read sensor source {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed sensor data: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("implausible reading: {0}")]
    OutOfRange(String),

    #[error("sensor did not respond")]
    NoResponse,
}

/// A temperature/humidity source. Reads are blocking and short.
pub trait Sensor {
    fn read(&mut self) -> Result<SensorSample, SensorError>;
}

/// Synthetic readings drifting around 25 °C / 60 %.
#[derive(Debug, Default)]
pub struct SimulatedSensor {
    tick: u64,
}

impl Sensor for SimulatedSensor {
    fn read(&mut self) -> Result<SensorSample, SensorError> {
        self.tick = self.tick.wrapping_add(1);
        SensorSample {
            temperature: 24.0 + (self.tick % 8) as f64 * 0.25,
            humidity: 58.0 + (self.tick % 6) as f64 * 0.5,
        }
        .validate()
    }
}

/// Reads `{"temperature": .., "humidity": ..}` from a file kept current by
/// an external sensor reader.
#[derive(Debug)]
pub struct FileSensor {
    path: PathBuf,
}

impl FileSensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Sensor for FileSensor {
    fn read(&mut self) -> Result<SensorSample, SensorError> {
        let raw = fs::read(&self.path).map_err(|source| SensorError::Io {
            path: self.path.clone(),
            source,
        })?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(SensorError::NoResponse);
        }
        serde_json::from_slice::<SensorSample>(&raw)?.validate()
    }
}
