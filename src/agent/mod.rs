//! Device-side poll loop: read the sensor, report the reading, fetch the
//! control state from the server and drive the fan and heater outputs.

mod last_known;
mod outputs;
mod sensor;

use std::time::Duration;

use tokio::{sync::watch, time};
use tracing::{debug, error, info, warn};

use crate::{
    api::dto::DeviceStatusResponse,
    client::ControlApi,
    db::models::DeviceName,
};

pub use last_known::LastKnown;
pub use outputs::{DryRunOutputs, OutputError, Outputs, SysfsOutputs};
pub use sensor::{FileSensor, Sensor, SensorError, SensorSample, SimulatedSensor};

pub type BoxedSensor = Box<dyn Sensor + Send>;
pub type BoxedOutputs = Box<dyn Outputs + Send>;

/// One step of a poll cycle. Steps run in declaration order; a failed step
/// either moves on to the next one or jumps straight to `Sleep`.
#[derive(Debug)]
enum Step {
    ReadSensor,
    SubmitReading(SensorSample),
    FetchSetpoint,
    FetchDeviceStatus,
    DriveOutputs(DeviceStatusResponse),
    Sleep,
}

/// Server calls made by the poll loop. Each keeps its own count of
/// consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiCall {
    SubmitReading,
    FetchSetpoint,
    FetchDeviceStatus,
}

impl ApiCall {
    pub const ALL: [ApiCall; 3] = [
        ApiCall::SubmitReading,
        ApiCall::FetchSetpoint,
        ApiCall::FetchDeviceStatus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ApiCall::SubmitReading => "submit reading",
            ApiCall::FetchSetpoint => "fetch setpoint",
            ApiCall::FetchDeviceStatus => "fetch device status",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

pub struct PollLoop<A> {
    api: A,
    sensor: BoxedSensor,
    outputs: BoxedOutputs,
    interval: Duration,
    api_error_log_every: u32,
    last_known: LastKnown,
    sensor_errors: u32,
    api_errors: [u32; 3],
}

impl<A: ControlApi> PollLoop<A> {
    pub fn new(api: A, sensor: BoxedSensor, outputs: BoxedOutputs, interval: Duration) -> Self {
        Self {
            api,
            sensor,
            outputs,
            interval,
            api_error_log_every: 10,
            last_known: LastKnown::new(),
            sensor_errors: 0,
            api_errors: [0; 3],
        }
    }

    /// Consecutive API failures are logged at warn level on the first and
    /// every `every`th occurrence, at debug level otherwise.
    pub fn with_api_error_log_every(mut self, every: u32) -> Self {
        self.api_error_log_every = every.max(1);
        self
    }

    /// Setpoint the device currently works with.
    pub fn setpoint(&self) -> f64 {
        self.last_known.setpoint()
    }

    pub fn last_known(&self) -> &LastKnown {
        &self.last_known
    }

    /// Consecutive failed sensor reads.
    pub fn sensor_errors(&self) -> u32 {
        self.sensor_errors
    }

    /// Consecutive failures of `call`.
    pub fn api_errors(&self, call: ApiCall) -> u32 {
        self.api_errors[call.index()]
    }

    /// Runs cycles until `stop` turns `true` (or its sender goes away), then
    /// switches both outputs off and releases them.
    ///
    /// A stop observed mid-cycle lets the running step finish and skips the
    /// rest of the cycle; requests in flight are not cancelled.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Poll loop started");

        loop {
            self.run_cycle(&stop).await;
            if stop_requested(&stop) {
                break;
            }

            tokio::select! {
                _ = time::sleep(self.interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }

    /// Runs one cycle, from `ReadSensor` up to (not including) the sleep.
    pub async fn run_cycle(&mut self, stop: &watch::Receiver<bool>) {
        let mut step = Step::ReadSensor;
        loop {
            if matches!(step, Step::Sleep) {
                return;
            }
            if stop_requested(stop) {
                debug!(?step, "Stop requested; skipping rest of cycle");
                return;
            }
            step = self.advance(step).await;
        }
    }

    async fn advance(&mut self, step: Step) -> Step {
        match step {
            Step::ReadSensor => match self.sensor.read() {
                Ok(sample) => {
                    if self.sensor_errors > 0 {
                        info!(failures = self.sensor_errors, "Sensor recovered");
                    }
                    self.sensor_errors = 0;
                    self.last_known.update_sample(sample);
                    debug!(
                        temperature = sample.temperature,
                        humidity = sample.humidity,
                        "Sensor read"
                    );
                    Step::SubmitReading(sample)
                }
                Err(e) => {
                    self.sensor_errors = self.sensor_errors.saturating_add(1);
                    if should_log(self.sensor_errors, self.api_error_log_every) {
                        warn!(error = %e, consecutive = self.sensor_errors, "Sensor read failed; skipping cycle");
                    } else {
                        debug!(error = %e, consecutive = self.sensor_errors, "Sensor read failed; skipping cycle");
                    }
                    Step::Sleep
                }
            },

            Step::SubmitReading(sample) => {
                match self.api.submit_reading(&sample).await {
                    Ok(resp) => {
                        self.api_succeeded(ApiCall::SubmitReading);
                        debug!(data_id = resp.data_id, timestamp = %resp.timestamp, "Reading submitted");
                    }
                    Err(e) => self.api_failed(ApiCall::SubmitReading, &e),
                }
                Step::FetchSetpoint
            }

            Step::FetchSetpoint => {
                match self.api.fetch_setpoint().await {
                    Ok(resp) => {
                        self.api_succeeded(ApiCall::FetchSetpoint);
                        if !self.last_known.has_setpoint()
                            || self.last_known.setpoint() != resp.setpoint_temperature
                        {
                            info!(setpoint = resp.setpoint_temperature, "Setpoint fetched");
                        }
                        self.last_known.update_setpoint(resp.setpoint_temperature);
                    }
                    Err(e) => {
                        self.api_failed(ApiCall::FetchSetpoint, &e);
                        debug!(setpoint = self.last_known.setpoint(), "Keeping last known setpoint");
                    }
                }
                Step::FetchDeviceStatus
            }

            Step::FetchDeviceStatus => match self.api.fetch_device_status().await {
                Ok(status) => {
                    self.api_succeeded(ApiCall::FetchDeviceStatus);
                    Step::DriveOutputs(status)
                }
                Err(e) => {
                    self.api_failed(ApiCall::FetchDeviceStatus, &e);
                    debug!("Device status unknown; holding outputs");
                    Step::Sleep
                }
            },

            Step::DriveOutputs(status) => {
                self.drive_outputs(&status);
                Step::Sleep
            }

            Step::Sleep => Step::Sleep,
        }
    }

    /// Each output follows the server flag for its device.
    fn drive_outputs(&mut self, status: &DeviceStatusResponse) {
        for device in DeviceName::ALL {
            let on = status.is_on(device);
            match self.outputs.set(device, on) {
                Ok(()) => {
                    if self.last_known.commanded(device) != Some(on) {
                        info!(device = %device, on, "Output switched");
                    }
                    self.last_known.record_commanded(device, on);
                }
                Err(e) => error!(device = %device, on, error = %e, "Failed to drive output"),
            }
        }
    }

    fn api_succeeded(&mut self, call: ApiCall) {
        let count = &mut self.api_errors[call.index()];
        if *count > 0 {
            info!(operation = call.as_str(), failures = *count, "Server call recovered");
        }
        *count = 0;
    }

    fn api_failed(&mut self, call: ApiCall, e: &anyhow::Error) {
        let count = &mut self.api_errors[call.index()];
        *count = count.saturating_add(1);
        let consecutive = *count;
        let error = format!("{e:#}");
        if should_log(consecutive, self.api_error_log_every) {
            warn!(operation = call.as_str(), error = %error, consecutive, "Server call failed");
        } else {
            debug!(operation = call.as_str(), error = %error, consecutive, "Server call failed");
        }
    }

    /// Consumes the loop, so it runs at most once.
    fn shutdown(mut self) {
        info!("Poll loop stopping; switching outputs off");
        for device in DeviceName::ALL {
            match self.outputs.set(device, false) {
                Ok(()) => self.last_known.record_commanded(device, false),
                Err(e) => error!(device = %device, error = %e, "Failed to switch output off"),
            }
        }
        if let Err(e) = self.outputs.release() {
            error!(error = %e, "Failed to release outputs");
        }
        info!("Outputs off and released");
    }
}

/// A dropped sender counts as a stop request.
fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

/// First failure and then every `every`th consecutive one.
fn should_log(consecutive: u32, every: u32) -> bool {
    consecutive == 1 || consecutive % every.max(1) == 0
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use anyhow::{anyhow, Result};
    use chrono::Utc;

    use super::*;
    use crate::api::dto::{DeviceStatusEntry, SetpointResponse, SubmitReadingResponse};

    // -----------------------------------------------------------------------
    // Fakes
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct ApiScript {
        /// `false` fails the call; an empty queue succeeds.
        submits: VecDeque<bool>,
        /// `None` fails the call; an empty queue returns 24.0.
        setpoints: VecDeque<Option<f64>>,
        /// `None` fails the call; an empty queue returns everything off.
        statuses: VecDeque<Option<(bool, bool)>>,
        submit_calls: u32,
        setpoint_calls: u32,
        status_calls: u32,
        /// Raises the stop flag while serving the next setpoint fetch.
        stop_on_setpoint: Option<watch::Sender<bool>>,
    }

    #[derive(Clone, Default)]
    struct FakeApi(Arc<Mutex<ApiScript>>);

    impl FakeApi {
        fn script(&self) -> std::sync::MutexGuard<'_, ApiScript> {
            self.0.lock().unwrap()
        }

        fn next_submit(&self) -> Result<SubmitReadingResponse> {
            let mut s = self.script();
            s.submit_calls += 1;
            if s.submits.pop_front().unwrap_or(true) {
                Ok(SubmitReadingResponse {
                    success: true,
                    message: "Sensor data recorded".to_owned(),
                    data_id: i64::from(s.submit_calls),
                    timestamp: Utc::now(),
                })
            } else {
                Err(anyhow!("connection refused"))
            }
        }

        fn next_setpoint(&self) -> Result<SetpointResponse> {
            let mut s = self.script();
            s.setpoint_calls += 1;
            if let Some(tx) = s.stop_on_setpoint.take() {
                tx.send(true).unwrap();
            }
            match s.setpoints.pop_front().unwrap_or(Some(24.0)) {
                Some(t) => Ok(SetpointResponse {
                    setpoint_temperature: t,
                    updated_at: Some(Utc::now()),
                }),
                None => Err(anyhow!("request timed out")),
            }
        }

        fn next_status(&self) -> Result<DeviceStatusResponse> {
            let mut s = self.script();
            s.status_calls += 1;
            match s.statuses.pop_front().unwrap_or(Some((false, false))) {
                Some((fan, heater)) => Ok(DeviceStatusResponse {
                    fan: DeviceStatusEntry { is_on: fan, last_updated: None },
                    heater: DeviceStatusEntry { is_on: heater, last_updated: None },
                }),
                None => Err(anyhow!("503 Service Unavailable")),
            }
        }
    }

    impl ControlApi for FakeApi {
        async fn submit_reading(&self, _sample: &SensorSample) -> Result<SubmitReadingResponse> {
            self.next_submit()
        }

        async fn fetch_setpoint(&self) -> Result<SetpointResponse> {
            self.next_setpoint()
        }

        async fn fetch_device_status(&self) -> Result<DeviceStatusResponse> {
            self.next_status()
        }
    }

    /// `false` entries fail the read; an empty queue reads 25.5 °C / 60 %.
    #[derive(Clone, Default)]
    struct FakeSensor(Arc<Mutex<VecDeque<bool>>>);

    impl FakeSensor {
        fn fail_next(&self, times: usize) {
            self.0.lock().unwrap().extend(std::iter::repeat(false).take(times));
        }
    }

    impl Sensor for FakeSensor {
        fn read(&mut self) -> Result<SensorSample, SensorError> {
            if self.0.lock().unwrap().pop_front().unwrap_or(true) {
                Ok(SensorSample { temperature: 25.5, humidity: 60.0 })
            } else {
                Err(SensorError::NoResponse)
            }
        }
    }

    #[derive(Default)]
    struct OutputLog {
        fan: bool,
        heater: bool,
        writes: Vec<(DeviceName, bool)>,
        releases: u32,
    }

    #[derive(Clone, Default)]
    struct FakeOutputs(Arc<Mutex<OutputLog>>);

    impl FakeOutputs {
        fn log(&self) -> std::sync::MutexGuard<'_, OutputLog> {
            self.0.lock().unwrap()
        }
    }

    impl Outputs for FakeOutputs {
        fn set(&mut self, device: DeviceName, on: bool) -> Result<(), OutputError> {
            let mut log = self.log();
            match device {
                DeviceName::Fan => log.fan = on,
                DeviceName::Heater => log.heater = on,
            }
            log.writes.push((device, on));
            Ok(())
        }

        fn release(&mut self) -> Result<(), OutputError> {
            self.log().releases += 1;
            Ok(())
        }
    }

    struct Harness {
        api: FakeApi,
        sensor: FakeSensor,
        outputs: FakeOutputs,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                api: FakeApi::default(),
                sensor: FakeSensor::default(),
                outputs: FakeOutputs::default(),
            }
        }

        fn poll_loop(&self) -> PollLoop<FakeApi> {
            PollLoop::new(
                self.api.clone(),
                Box::new(self.sensor.clone()),
                Box::new(self.outputs.clone()),
                Duration::from_secs(30),
            )
        }
    }

    // -----------------------------------------------------------------------
    // Cycle behaviour
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn healthy_cycle_runs_every_step_and_drives_outputs() {
        let h = Harness::new();
        h.api.script().statuses.push_back(Some((false, true)));
        let (_tx, rx) = watch::channel(false);
        let mut poll = h.poll_loop();

        poll.run_cycle(&rx).await;

        let script = h.api.script();
        assert_eq!((script.submit_calls, script.setpoint_calls, script.status_calls), (1, 1, 1));
        let log = h.outputs.log();
        assert!(!log.fan);
        assert!(log.heater);
        assert_eq!(log.writes, vec![(DeviceName::Fan, false), (DeviceName::Heater, true)]);
        assert_eq!(poll.last_known().commanded(DeviceName::Heater), Some(true));
    }

    #[tokio::test]
    async fn sensor_faults_skip_network_and_hold_outputs() {
        let h = Harness::new();
        h.api.script().statuses.push_back(Some((true, false)));
        let (_tx, rx) = watch::channel(false);
        let mut poll = h.poll_loop();

        poll.run_cycle(&rx).await;
        let writes_before = h.outputs.log().writes.len();

        h.sensor.fail_next(3);
        for _ in 0..3 {
            poll.run_cycle(&rx).await;
        }

        assert_eq!(poll.sensor_errors(), 3);
        let script = h.api.script();
        assert_eq!((script.submit_calls, script.setpoint_calls, script.status_calls), (1, 1, 1));
        drop(script);

        let log = h.outputs.log();
        assert_eq!(log.writes.len(), writes_before);
        assert!(log.fan);
        assert!(!log.heater);
        assert_eq!(log.releases, 0);
    }

    #[tokio::test]
    async fn sensor_recovery_resets_error_count() {
        let h = Harness::new();
        h.sensor.fail_next(2);
        let (_tx, rx) = watch::channel(false);
        let mut poll = h.poll_loop();

        poll.run_cycle(&rx).await;
        poll.run_cycle(&rx).await;
        assert_eq!(poll.sensor_errors(), 2);

        poll.run_cycle(&rx).await;
        assert_eq!(poll.sensor_errors(), 0);
        assert_eq!(h.api.script().submit_calls, 1);
    }

    #[tokio::test]
    async fn submit_failure_does_not_block_control_fetches() {
        let h = Harness::new();
        {
            let mut script = h.api.script();
            script.submits.push_back(false);
            script.statuses.push_back(Some((true, true)));
        }
        let (_tx, rx) = watch::channel(false);
        let mut poll = h.poll_loop();

        poll.run_cycle(&rx).await;

        let script = h.api.script();
        assert_eq!((script.submit_calls, script.setpoint_calls, script.status_calls), (1, 1, 1));
        let log = h.outputs.log();
        assert!(log.fan && log.heater);
    }

    #[tokio::test]
    async fn setpoint_defaults_before_first_successful_fetch() {
        let h = Harness::new();
        h.api.script().setpoints.push_back(None);
        let (_tx, rx) = watch::channel(false);
        let mut poll = h.poll_loop();

        poll.run_cycle(&rx).await;

        assert_eq!(poll.setpoint(), 25.0);
        assert!(!poll.last_known().has_setpoint());
        assert_eq!(poll.api_errors(ApiCall::FetchSetpoint), 1);
        assert_eq!(poll.api_errors(ApiCall::FetchDeviceStatus), 0);
    }

    #[tokio::test]
    async fn setpoint_fetch_failure_keeps_last_fetched_value() {
        let h = Harness::new();
        {
            let mut script = h.api.script();
            script.setpoints.push_back(Some(22.5));
            script.setpoints.push_back(None);
            script.setpoints.push_back(None);
        }
        let (_tx, rx) = watch::channel(false);
        let mut poll = h.poll_loop();

        poll.run_cycle(&rx).await;
        assert_eq!(poll.setpoint(), 22.5);

        poll.run_cycle(&rx).await;
        poll.run_cycle(&rx).await;

        assert_eq!(poll.setpoint(), 22.5);
        assert_eq!(h.api.script().status_calls, 3);
    }

    #[tokio::test]
    async fn device_status_failure_holds_outputs() {
        let h = Harness::new();
        {
            let mut script = h.api.script();
            script.statuses.push_back(Some((true, false)));
            script.statuses.push_back(None);
        }
        let (_tx, rx) = watch::channel(false);
        let mut poll = h.poll_loop();

        poll.run_cycle(&rx).await;
        poll.run_cycle(&rx).await;

        let log = h.outputs.log();
        assert_eq!(log.writes.len(), 2);
        assert!(log.fan);
        assert!(!log.heater);
        assert_eq!(poll.api_errors(ApiCall::FetchDeviceStatus), 1);
    }

    #[tokio::test]
    async fn sustained_submit_failures_are_counted_and_throttled() {
        let h = Harness::new();
        h.api.script().submits.extend(std::iter::repeat(false).take(12));
        let (_tx, rx) = watch::channel(false);
        let mut poll = h.poll_loop().with_api_error_log_every(10);

        let mut warned_cycles = Vec::new();
        for cycle in 1..=12 {
            poll.run_cycle(&rx).await;
            let consecutive = poll.api_errors(ApiCall::SubmitReading);
            assert_eq!(consecutive, cycle, "successful reads must not reset submit failures");
            if should_log(consecutive, 10) {
                warned_cycles.push(cycle);
            }
        }

        assert_eq!(warned_cycles, vec![1, 10]);
        assert_eq!(poll.api_errors(ApiCall::FetchSetpoint), 0);
        assert_eq!(poll.api_errors(ApiCall::FetchDeviceStatus), 0);
        assert_eq!(h.api.script().status_calls, 12);

        poll.run_cycle(&rx).await;
        assert_eq!(poll.api_errors(ApiCall::SubmitReading), 0);
    }

    #[tokio::test]
    async fn each_call_counts_its_own_failures() {
        let h = Harness::new();
        {
            let mut script = h.api.script();
            script.submits.extend([false, false]);
            script.setpoints.extend([None, Some(23.0)]);
            script.statuses.extend([Some((false, false)), None]);
        }
        let (_tx, rx) = watch::channel(false);
        let mut poll = h.poll_loop();

        poll.run_cycle(&rx).await;
        poll.run_cycle(&rx).await;

        assert_eq!(poll.api_errors(ApiCall::SubmitReading), 2);
        assert_eq!(poll.api_errors(ApiCall::FetchSetpoint), 0);
        assert_eq!(poll.api_errors(ApiCall::FetchDeviceStatus), 1);
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    fn off_writes(log: &OutputLog, device: DeviceName) -> usize {
        log.writes.iter().filter(|w| **w == (device, false)).count()
    }

    #[tokio::test]
    async fn stop_mid_cycle_finishes_step_then_switches_outputs_off_once() {
        let h = Harness::new();
        let (tx, rx) = watch::channel(false);
        {
            let mut script = h.api.script();
            script.statuses.push_back(Some((true, true)));
            script.stop_on_setpoint = Some(tx);
        }

        h.poll_loop().run(rx).await;

        let script = h.api.script();
        assert_eq!(script.setpoint_calls, 1);
        assert_eq!(script.status_calls, 0, "steps after the stop must be skipped");
        drop(script);

        let log = h.outputs.log();
        assert_eq!(log.writes, vec![(DeviceName::Fan, false), (DeviceName::Heater, false)]);
        assert_eq!(off_writes(&log, DeviceName::Fan), 1);
        assert_eq!(off_writes(&log, DeviceName::Heater), 1);
        assert_eq!(log.releases, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_sleep_ends_loop_after_full_cycles() {
        let h = Harness::new();
        {
            let mut script = h.api.script();
            script.statuses.push_back(Some((true, false)));
            script.statuses.push_back(Some((true, true)));
        }
        let (tx, rx) = watch::channel(false);

        let stopper = async move {
            time::sleep(Duration::from_secs(45)).await;
            tx.send(true).unwrap();
        };
        tokio::join!(h.poll_loop().run(rx), stopper);

        assert_eq!(h.api.script().submit_calls, 2);
        let log = h.outputs.log();
        assert!(!log.fan);
        assert!(!log.heater);
        assert_eq!(log.releases, 1);
        assert_eq!(
            log.writes[log.writes.len() - 2..],
            [(DeviceName::Fan, false), (DeviceName::Heater, false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn loop_keeps_running_through_sensor_faults_until_stopped() {
        let h = Harness::new();
        h.sensor.fail_next(3);
        let (tx, rx) = watch::channel(false);

        let sensor = h.sensor.clone();
        let api = h.api.clone();
        let outputs = h.outputs.clone();
        let stopper = async move {
            // Cycles run at 0 s, 30 s and 60 s.
            time::sleep(Duration::from_secs(75)).await;
            assert!(sensor.0.lock().unwrap().is_empty(), "three reads attempted");
            assert_eq!(api.script().submit_calls, 0);
            let log = outputs.log();
            assert!(log.writes.is_empty(), "outputs held while the sensor fails");
            assert_eq!(log.releases, 0, "loop must still be running");
            drop(log);
            tx.send(true).unwrap();
        };
        tokio::join!(h.poll_loop().run(rx), stopper);

        let log = h.outputs.log();
        assert_eq!(log.writes, vec![(DeviceName::Fan, false), (DeviceName::Heater, false)]);
        assert_eq!(log.releases, 1);
    }

    #[tokio::test]
    async fn dropped_stop_sender_counts_as_stop() {
        let h = Harness::new();
        let (tx, rx) = watch::channel(false);
        drop(tx);

        h.poll_loop().run(rx).await;

        assert_eq!(h.api.script().submit_calls, 0);
        assert_eq!(h.outputs.log().releases, 1);
    }

    #[test]
    fn should_log_first_and_every_nth() {
        let logged: Vec<u32> = (1..=25).filter(|n| should_log(*n, 10)).collect();
        assert_eq!(logged, vec![1, 10, 20]);
        assert!(should_log(7, 0));
    }
}
