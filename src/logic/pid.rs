//! PID monitoring logic.
//!
//! Polls a [`PidController`] every `timestep` while enabled and keeps the
//! last `buffer_length` samples of process value, control value and
//! setpoint. New samples are published on a `watch` channel. While saving is
//! on, every sample is also appended to a `tip_temperature_log` file.

use crate::hardware::capabilities::PidController;
use crate::logic::history::{DataLog, History, Precision};
use crate::logic::poll::PollLoop;
use crate::module::{Module, ModuleState, StateCell};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PV: usize = 0;
const CV: usize = 1;
const SP: usize = 2;

/// Options of a `type = "pid"` logic module.
#[derive(Debug, Clone, Deserialize)]
pub struct PidLogicConfig {
    /// Polling period in seconds
    #[serde(default = "default_timestep")]
    pub timestep: f64,
    /// Samples kept per channel
    #[serde(default = "default_buffer_length")]
    pub buffer_length: usize,
}

fn default_timestep() -> f64 {
    0.1
}

fn default_buffer_length() -> usize {
    1000
}

impl Default for PidLogicConfig {
    fn default() -> Self {
        Self {
            timestep: default_timestep(),
            buffer_length: default_buffer_length(),
        }
    }
}

/// One poll of the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PidSample {
    /// Process value
    pub process_value: f64,
    /// Control value
    pub control_value: f64,
    /// Setpoint
    pub setpoint: f64,
}

struct Shared {
    name: String,
    controller: Arc<dyn PidController>,
    history: StdMutex<History>,
    log: StdMutex<Option<DataLog>>,
    updates: watch::Sender<PidSample>,
}

impl Shared {
    async fn poll(&self) {
        let sample = match self.read().await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(module = %self.name, error = %e, "PID poll failed");
                return;
            }
        };
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(&[sample.process_value, sample.control_value, sample.setpoint]);
        self.updates.send_replace(sample);

        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = log.as_mut() {
            let row = [sample.process_value, sample.setpoint, sample.control_value];
            let formats = [Precision(3), Precision(6), Precision(6), Precision(3)];
            if let Err(e) = file.append(&row, &formats) {
                error!(module = %self.name, error = %e, "Writing temperature log failed, saving stopped");
                *log = None;
            }
        }
    }

    async fn read(&self) -> Result<PidSample> {
        Ok(PidSample {
            process_value: self.controller.get_process_value().await?,
            control_value: self.controller.get_control_value().await?,
            setpoint: self.controller.get_setpoint().await?,
        })
    }
}

/// Logic module monitoring and steering one PID controller.
pub struct PidLogic {
    name: String,
    timestep: Duration,
    output_dir: PathBuf,
    shared: Arc<Shared>,
    poll: PollLoop,
    state: StateCell,
}

impl PidLogic {
    /// Logic over `controller`; log files go to `output_dir`.
    pub fn new(
        name: &str,
        controller: Arc<dyn PidController>,
        config: PidLogicConfig,
        output_dir: PathBuf,
    ) -> Self {
        let (updates, _) = watch::channel(PidSample::default());
        Self {
            name: name.to_string(),
            timestep: Duration::from_secs_f64(config.timestep.max(1e-3)),
            output_dir,
            shared: Arc::new(Shared {
                name: name.to_string(),
                controller,
                history: StdMutex::new(History::new(3, config.buffer_length)),
                log: StdMutex::new(None),
                updates,
            }),
            poll: PollLoop::new(name),
            state: StateCell::new(),
        }
    }

    /// Receiver for every new sample.
    pub fn subscribe(&self) -> watch::Receiver<PidSample> {
        self.shared.updates.subscribe()
    }

    /// Poll the controller once, outside the loop.
    pub async fn poll_once(&self) {
        self.shared.poll().await
    }

    /// Samples kept per channel
    pub fn get_buffer_length(&self) -> usize {
        self.history().capacity()
    }

    /// Change the history length; the history is cleared.
    pub fn set_buffer_length(&self, length: usize) {
        self.shared
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resize(length);
    }

    /// Copy of the history: process value, control value, setpoint rows.
    pub fn history(&self) -> History {
        self.shared
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Start the polling loop.
    pub fn start_loop(&self) {
        let shared = Arc::clone(&self.shared);
        self.poll.start(self.timestep, move || {
            let shared = Arc::clone(&shared);
            async move { shared.poll().await }
        });
    }

    /// Stop the polling loop after the current poll.
    pub fn stop_loop(&self) {
        self.poll.stop();
    }

    /// Whether the polling loop runs
    pub fn get_enabled(&self) -> bool {
        self.poll.is_enabled()
    }

    /// Start or stop the polling loop.
    pub fn set_enabled(&self, enabled: bool) {
        match (enabled, self.get_enabled()) {
            (true, false) => self.start_loop(),
            (false, true) => self.stop_loop(),
            _ => {}
        }
    }

    /// Whether samples are being written to file
    pub fn get_saving_state(&self) -> bool {
        self.shared.log.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Open a new `<tag>_tip_temperature_log` file; returns its path.
    pub async fn start_saving(&self, tag: &str) -> Result<PathBuf> {
        let (process_unit, _) = self.shared.controller.get_process_unit();
        let (control_unit, _) = self.shared.controller.get_control_unit();
        let columns = [
            format!("process value ({})", process_unit),
            format!("set point ({})", process_unit),
            format!("control value ({})", control_unit),
        ];
        let log = DataLog::start(&self.output_dir, tag, "tip_temperature_log", &columns)?;
        let path = log.path().to_path_buf();
        let previous = self
            .shared
            .log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(log);
        if let Some(previous) = previous {
            previous.finish()?;
        }
        info!(module = %self.name, path = %path.display(), "Temperature logging started");
        Ok(path)
    }

    /// Close the log file, returning its path if one was open.
    pub fn stop_saving(&self) -> Result<Option<PathBuf>> {
        let log = self.shared.log.lock().unwrap_or_else(|e| e.into_inner()).take();
        match log {
            Some(log) => Ok(Some(log.finish()?)),
            None => Ok(None),
        }
    }

    /// Proportional gain
    pub async fn get_kp(&self) -> Result<f64> {
        self.shared.controller.get_kp().await
    }

    /// Set the proportional gain
    pub async fn set_kp(&self, kp: f64) -> Result<()> {
        self.shared.controller.set_kp(kp).await
    }

    /// Integral gain
    pub async fn get_ki(&self) -> Result<f64> {
        self.shared.controller.get_ki().await
    }

    /// Set the integral gain
    pub async fn set_ki(&self, ki: f64) -> Result<()> {
        self.shared.controller.set_ki(ki).await
    }

    /// Derivative gain
    pub async fn get_kd(&self) -> Result<f64> {
        self.shared.controller.get_kd().await
    }

    /// Set the derivative gain
    pub async fn set_kd(&self, kd: f64) -> Result<()> {
        self.shared.controller.set_kd(kd).await
    }

    /// Controller setpoint
    pub async fn get_setpoint(&self) -> Result<f64> {
        self.shared.controller.get_setpoint().await
    }

    /// Set the controller setpoint
    pub async fn set_setpoint(&self, setpoint: f64) -> Result<()> {
        self.shared.controller.set_setpoint(setpoint).await
    }

    /// Output in manual mode
    pub async fn get_manual_value(&self) -> Result<f64> {
        self.shared.controller.get_manual_value().await
    }

    /// Set the output for manual mode
    pub async fn set_manual_value(&self, value: f64) -> Result<()> {
        self.shared.controller.set_manual_value(value).await
    }

    /// Output limits; `None` if the controller has none
    pub async fn get_control_limits(&self) -> Result<Option<(f64, f64)>> {
        self.shared.controller.get_control_limit().await
    }

    /// Set the output limits
    pub async fn set_control_limits(&self, limits: (f64, f64)) -> Result<()> {
        self.shared.controller.set_control_limit(limits).await
    }

    /// Newest process value from the history
    pub fn get_pv(&self) -> f64 {
        self.history().last(PV)
    }

    /// Newest control value from the history
    pub fn get_cv(&self) -> f64 {
        self.history().last(CV)
    }

    /// Newest setpoint from the history
    pub fn get_sp(&self) -> f64 {
        self.history().last(SP)
    }
}

#[async_trait]
impl Module for PidLogic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_activate(&self) -> Result<()> {
        self.state.set(ModuleState::Idle);
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        self.poll.shutdown();
        self.stop_saving()?;
        self.state.set(ModuleState::Deactivated);
        Ok(())
    }

    fn state(&self) -> ModuleState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockPidController;

    fn logic(dir: PathBuf) -> (PidLogic, Arc<MockPidController>) {
        let controller = Arc::new(MockPidController::new(10.0));
        let config = PidLogicConfig {
            timestep: 0.1,
            buffer_length: 5,
        };
        (PidLogic::new("pidlogic", controller.clone(), config, dir), controller)
    }

    #[tokio::test(start_paused = true)]
    async fn loop_fills_history_and_publishes() {
        let (logic, controller) = logic(std::env::temp_dir());
        logic.on_activate().await.unwrap();
        controller.set_setpoint(4.0).await.unwrap();
        let mut updates = logic.subscribe();

        logic.set_enabled(true);
        assert!(logic.get_enabled());
        updates.changed().await.unwrap();
        assert_eq!(updates.borrow().setpoint, 4.0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        logic.set_enabled(false);
        let history = logic.history();
        assert_eq!(history.channel(SP), vec![4.0; 5]);
        assert_eq!(logic.get_pv(), 10.0);
        assert_eq!(logic.get_buffer_length(), 5);

        logic.set_buffer_length(8);
        assert_eq!(logic.history().channel(PV), vec![0.0; 8]);
    }

    #[tokio::test]
    async fn gains_pass_through() {
        let (logic, controller) = logic(std::env::temp_dir());
        logic.set_kp(12.0).await.unwrap();
        logic.set_manual_value(33.0).await.unwrap();
        assert_eq!(controller.get_kp().await.unwrap(), 12.0);
        assert_eq!(logic.get_manual_value().await.unwrap(), 33.0);
        assert_eq!(logic.get_control_limits().await.unwrap(), Some((0.0, 100.0)));
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn saving_writes_formatted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (logic, controller) = logic(dir.path().to_path_buf());
        controller.set_setpoint(4.0).await.unwrap();

        let path = logic.start_saving("tip1").await.unwrap();
        assert!(logic.get_saving_state());
        assert!(path.to_string_lossy().ends_with("_tip1_tip_temperature_log.dat"));
        logic.poll_once().await;
        logic.poll_once().await;
        assert_eq!(logic.stop_saving().unwrap(), Some(path.clone()));
        assert!(!logic.get_saving_state());

        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "# time (s)\tprocess value (K)\tset point (K)\tcontrol value (%)"
        );
        let fields: Vec<&str> = lines[1].split('\t').collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[1], "1.000000E+01");
        assert_eq!(fields[2], "4.000000E+00");
        assert_eq!(fields[3], "0.000E+00");
        assert_eq!(lines.len(), 3);
    }
}
