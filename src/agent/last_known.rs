use crate::{
    agent::SensorSample,
    db::models::{DeviceName, DEFAULT_SETPOINT_TEMPERATURE},
};

/// Device-local copy of the last values seen from the sensor and the server,
/// used when a fetch fails. Never written back to the server.
#[derive(Debug, Clone, Default)]
pub struct LastKnown {
    sample: Option<SensorSample>,
    setpoint: Option<f64>,
    fan: Option<bool>,
    heater: Option<bool>,
}

impl LastKnown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_sample(&mut self, sample: SensorSample) {
        self.sample = Some(sample);
    }

    pub fn sample(&self) -> Option<SensorSample> {
        self.sample
    }

    pub fn update_setpoint(&mut self, target_temperature: f64) {
        self.setpoint = Some(target_temperature);
    }

    /// Last fetched setpoint, or the default before the first successful fetch.
    pub fn setpoint(&self) -> f64 {
        self.setpoint.unwrap_or(DEFAULT_SETPOINT_TEMPERATURE)
    }

    pub fn has_setpoint(&self) -> bool {
        self.setpoint.is_some()
    }

    pub fn record_commanded(&mut self, device: DeviceName, on: bool) {
        *self.slot(device) = Some(on);
    }

    /// State last written to `device`, `None` before the first write.
    pub fn commanded(&self, device: DeviceName) -> Option<bool> {
        match device {
            DeviceName::Fan => self.fan,
            DeviceName::Heater => self.heater,
        }
    }

    fn slot(&mut self, device: DeviceName) -> &mut Option<bool> {
        match device {
            DeviceName::Fan => &mut self.fan,
            DeviceName::Heater => &mut self.heater,
        }
    }
}
