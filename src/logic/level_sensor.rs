//! Level sensor monitoring logic.
//!
//! Same polling scheme as the PID logic, over a [`LevelSensor`] channel:
//! level, high and low thresholds, and a numeric fill code.

use crate::hardware::capabilities::{FillStatus, LevelSensor};
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
use tracing::{error, info};

/// Options of a `type = "level_sensor"` logic module.
#[derive(Debug, Clone, Deserialize)]
pub struct LevelSensorLogicConfig {
    /// Polling period in seconds
    #[serde(default = "default_timestep")]
    pub timestep: f64,
    /// Samples kept per channel
    #[serde(default = "default_buffer_length")]
    pub buffer_length: usize,
    /// Sensor channel to watch
    #[serde(default = "default_channel")]
    pub channel: u8,
}

fn default_timestep() -> f64 {
    0.1
}

fn default_buffer_length() -> usize {
    1000
}

fn default_channel() -> u8 {
    1
}

impl Default for LevelSensorLogicConfig {
    fn default() -> Self {
        Self {
            timestep: default_timestep(),
            buffer_length: default_buffer_length(),
            channel: default_channel(),
        }
    }
}

/// Numeric code of a fill status for plotting and logging.
///
/// off = 0, filling with 0 min elapsed = 1, timeout = 2, filling or
/// unreadable = 3.
pub fn fill_code(status: FillStatus) -> f64 {
    match status {
        FillStatus::Off => 0.0,
        FillStatus::Filling(minutes) if minutes == 0.0 => 1.0,
        FillStatus::Timeout => 2.0,
        FillStatus::Filling(_) | FillStatus::Unknown => 3.0,
    }
}

/// One poll of the sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LevelSample {
    /// Measured level
    pub level: f64,
    /// Upper fill threshold
    pub high: f64,
    /// Lower fill threshold
    pub low: f64,
    /// See [`fill_code`]
    pub fill_code: f64,
}

struct Shared {
    name: String,
    channel: u8,
    sensor: Arc<dyn LevelSensor>,
    history: StdMutex<History>,
    log: StdMutex<Option<DataLog>>,
    updates: watch::Sender<LevelSample>,
}

impl Shared {
    async fn poll(&self) {
        let sample = LevelSample {
            level: self.sensor.get_level(self.channel).await,
            high: self.sensor.get_high_level(self.channel).await,
            low: self.sensor.get_low_level(self.channel).await,
            fill_code: fill_code(self.sensor.get_fill_status(self.channel).await),
        };
        let values = [sample.level, sample.high, sample.low, sample.fill_code];
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(&values);
        self.updates.send_replace(sample);

        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = log.as_mut() {
            let formats = [Precision(3), Precision(6), Precision(6), Precision(6), Precision(0)];
            if let Err(e) = file.append(&values, &formats) {
                error!(module = %self.name, error = %e, "Writing level log failed, saving stopped");
                *log = None;
            }
        }
    }
}

/// Logic module watching one level sensor channel.
pub struct LevelSensorLogic {
    name: String,
    timestep: Duration,
    output_dir: PathBuf,
    shared: Arc<Shared>,
    poll: PollLoop,
    state: StateCell,
}

impl LevelSensorLogic {
    /// Logic over `sensor`; log files go to `output_dir`.
    pub fn new(
        name: &str,
        sensor: Arc<dyn LevelSensor>,
        config: LevelSensorLogicConfig,
        output_dir: PathBuf,
    ) -> Self {
        let (updates, _) = watch::channel(LevelSample::default());
        Self {
            name: name.to_string(),
            timestep: Duration::from_secs_f64(config.timestep.max(1e-3)),
            output_dir,
            shared: Arc::new(Shared {
                name: name.to_string(),
                channel: config.channel,
                sensor,
                history: StdMutex::new(History::new(4, config.buffer_length)),
                log: StdMutex::new(None),
                updates,
            }),
            poll: PollLoop::new(name),
            state: StateCell::new(),
        }
    }

    /// Receiver for every new sample.
    pub fn subscribe(&self) -> watch::Receiver<LevelSample> {
        self.shared.updates.subscribe()
    }

    /// Poll the sensor once, outside the loop.
    pub async fn poll_once(&self) {
        self.shared.poll().await
    }

    /// Copy of the history: level, high, low, fill code rows.
    pub fn history(&self) -> History {
        self.shared
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
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

    /// Upper fill threshold of the watched channel
    pub async fn get_high_level(&self) -> f64 {
        self.shared.sensor.get_high_level(self.shared.channel).await
    }

    /// Set the upper fill threshold
    pub async fn set_high_level(&self, level: f64) {
        self.shared.sensor.set_high_level(level, self.shared.channel).await
    }

    /// Lower fill threshold of the watched channel
    pub async fn get_low_level(&self) -> f64 {
        self.shared.sensor.get_low_level(self.shared.channel).await
    }

    /// Set the lower fill threshold
    pub async fn set_low_level(&self, level: f64) {
        self.shared.sensor.set_low_level(level, self.shared.channel).await
    }

    /// Whether samples are being written to file
    pub fn get_saving_state(&self) -> bool {
        self.shared.log.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Open a new `<tag>_level_sensor_log` file; returns its path.
    pub fn start_saving(&self, tag: &str) -> Result<PathBuf> {
        let columns = [
            "level".to_string(),
            "high level".to_string(),
            "low level".to_string(),
            "fill status".to_string(),
        ];
        let log = DataLog::start(&self.output_dir, tag, "level_sensor_log", &columns)?;
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
        info!(module = %self.name, path = %path.display(), "Level logging started");
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
}

#[async_trait]
impl Module for LevelSensorLogic {
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
    use std::collections::BTreeMap;

    struct Dewar {
        level: StdMutex<f64>,
        high: StdMutex<f64>,
        fill: FillStatus,
    }

    #[async_trait]
    impl LevelSensor for Dewar {
        async fn measure_level(&self) -> f64 {
            *self.level.lock().unwrap()
        }
        async fn get_channel(&self) -> u8 {
            1
        }
        async fn select_channel(&self, _channel: u8) -> Result<()> {
            Ok(())
        }
        async fn get_level(&self, _channel: u8) -> f64 {
            let mut level = self.level.lock().unwrap();
            *level -= 1.0;
            *level
        }
        async fn get_full_status(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
        async fn get_fill_status(&self, _channel: u8) -> FillStatus {
            self.fill
        }
        async fn get_high_level(&self, _channel: u8) -> f64 {
            *self.high.lock().unwrap()
        }
        async fn get_low_level(&self, _channel: u8) -> f64 {
            20.0
        }
        async fn set_high_level(&self, level: f64, _channel: u8) {
            *self.high.lock().unwrap() = level;
        }
        async fn set_low_level(&self, _level: f64, _channel: u8) {}
        async fn get_type(&self, _channel: u8) -> Option<String> {
            Some("ln".into())
        }
        async fn set_control_mode(&self, _mode: &str, _channel: u8) {}
        async fn start_fill(&self, _channel: u8) {}
        async fn reset(&self) {}
    }

    fn dewar(fill: FillStatus) -> Arc<Dewar> {
        Arc::new(Dewar {
            level: StdMutex::new(80.0),
            high: StdMutex::new(90.0),
            fill,
        })
    }

    #[test]
    fn fill_codes() {
        assert_eq!(fill_code(FillStatus::Off), 0.0);
        assert_eq!(fill_code(FillStatus::Filling(0.0)), 1.0);
        assert_eq!(fill_code(FillStatus::Timeout), 2.0);
        assert_eq!(fill_code(FillStatus::Filling(3.5)), 3.0);
        assert_eq!(fill_code(FillStatus::Unknown), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_records_four_channels() {
        let config = LevelSensorLogicConfig {
            buffer_length: 3,
            ..Default::default()
        };
        let logic = LevelSensorLogic::new("lvl", dewar(FillStatus::Timeout), config, std::env::temp_dir());
        logic.set_enabled(true);
        tokio::time::sleep(Duration::from_millis(450)).await;
        logic.set_enabled(false);

        let history = logic.history();
        assert_eq!(history.channel(0), vec![78.0, 77.0, 76.0]);
        assert_eq!(history.last(1), 90.0);
        assert_eq!(history.last(2), 20.0);
        assert_eq!(history.last(3), 2.0);
    }

    #[tokio::test]
    async fn unreadable_fill_status_is_code_three() {
        let logic = LevelSensorLogic::new("lvl", dewar(FillStatus::Unknown), Default::default(), std::env::temp_dir());
        logic.poll_once().await;
        assert_eq!(logic.history().last(3), 3.0);
    }

    #[tokio::test]
    async fn thresholds_pass_through() {
        let sensor = dewar(FillStatus::Off);
        let logic = LevelSensorLogic::new("lvl", sensor.clone(), Default::default(), std::env::temp_dir());
        logic.set_high_level(75.0).await;
        assert_eq!(logic.get_high_level().await, 75.0);
        assert_eq!(logic.get_low_level().await, 20.0);
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn saving_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        let logic = LevelSensorLogic::new("lvl", dewar(FillStatus::Filling(2.0)), Default::default(), dir.path().to_path_buf());
        logic.start_saving("").unwrap();
        logic.poll_once().await;
        let path = logic.stop_saving().unwrap().unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        let row: Vec<&str> = text.lines().nth(1).unwrap().split('\t').collect();
        assert_eq!(row[1], "7.900000E+01");
        assert_eq!(row[4], "3E+00");
    }
}
