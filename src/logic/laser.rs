//! Laser logic and saturation curve measurement.
//!
//! The saturation curve steps the laser through a list of powers and records
//! the fluorescence count rate (mean and standard deviation) at each one.
//! It runs as a tokio task; the module is `Locked` while it runs.

use crate::data::fit::{fit_saturation, SaturationFit};
use crate::data::storage::save_table;
use crate::error::DaqError;
use crate::hardware::capabilities::{ControlMode, LaserState, ShutterState, SimpleLaser, SlowCounter};
use crate::logic::linspace;
use crate::module::{Module, ModuleState, StateCell};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Parameters of one saturation curve.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SaturationSettings {
    /// Dwell per power step in seconds
    #[serde(default = "default_time_per_point")]
    pub time_per_point: f64,
    /// First power in W
    #[serde(default = "default_start_power")]
    pub start_power: f64,
    /// Last power in W
    #[serde(default = "default_stop_power")]
    pub stop_power: f64,
    /// Number of power steps
    #[serde(default = "default_num_points")]
    pub num_points: usize,
    /// Power set after the curve, in W
    #[serde(default = "default_final_power")]
    pub final_power: f64,
    /// Counter samples averaged per step
    #[serde(default = "default_samples_per_point")]
    pub samples_per_point: usize,
}

fn default_time_per_point() -> f64 {
    4.0
}
fn default_start_power() -> f64 {
    1e-3
}
fn default_stop_power() -> f64 {
    22e-3
}
fn default_num_points() -> usize {
    17
}
fn default_final_power() -> f64 {
    3e-3
}
fn default_samples_per_point() -> usize {
    50
}

impl Default for SaturationSettings {
    fn default() -> Self {
        Self {
            time_per_point: default_time_per_point(),
            start_power: default_start_power(),
            stop_power: default_stop_power(),
            num_points: default_num_points(),
            final_power: default_final_power(),
            samples_per_point: default_samples_per_point(),
        }
    }
}

/// Options of a `type = "laser"` logic module.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaserLogicConfig {
    /// Defaults for [`LaserLogic::start_saturation_curve`]
    #[serde(default)]
    pub saturation: SaturationSettings,
}

/// One point of the saturation curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SaturationPoint {
    /// Laser power in W
    pub power: f64,
    /// Mean count rate
    pub fluorescence: f64,
    /// Standard deviation of the count rate
    pub stddev: f64,
}

/// What the connected laser can do, read once on activation.
#[derive(Debug, Clone, PartialEq)]
pub struct LaserCapabilities {
    /// Settable power range in W
    pub power_range: (f64, f64),
    /// Settable current range
    pub current_range: (f64, f64),
    /// Unit of current values
    pub current_unit: String,
    /// Constant power mode available
    pub can_power: bool,
    /// Constant current mode available
    pub can_current: bool,
    /// Analog modulation available
    pub can_analog_mod: bool,
    /// Digital modulation available
    pub can_digital_mod: bool,
    /// Laser has a shutter
    pub has_shutter: bool,
    /// Device information
    pub extra: String,
}

struct Measurement {
    laser: Arc<dyn SimpleLaser>,
    counter: Arc<dyn SlowCounter>,
    stop: AtomicBool,
    data: StdMutex<Vec<SaturationPoint>>,
    progress: watch::Sender<usize>,
    state: StateCell,
}

impl Measurement {
    async fn run(&self, name: &str, settings: SaturationSettings) -> Result<()> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clear();
        let powers = linspace(settings.start_power, settings.stop_power, settings.num_points);
        let dwell = Duration::from_secs_f64(settings.time_per_point.max(0.0));

        if self.laser.get_laser_state().await? == LaserState::Off {
            warn!(module = %name, "Measurement aborted. Laser is not ON.");
            return Ok(());
        }
        tokio::time::sleep(dwell).await;

        for power in powers {
            if self.stop.load(Ordering::SeqCst) {
                info!(module = %name, "Saturation curve stopped");
                break;
            }
            self.laser.set_power(power).await?;
            tokio::time::sleep(dwell).await;
            let (fluorescence, stddev) = self
                .counter
                .count_mean_std(settings.samples_per_point)
                .await?;
            let count = {
                let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
                data.push(SaturationPoint {
                    power,
                    fluorescence,
                    stddev,
                });
                data.len()
            };
            self.progress.send_replace(count);
        }

        self.laser.set_power(settings.final_power).await?;
        Ok(())
    }
}

/// Logic module for one laser and the counter watching its fluorescence.
pub struct LaserLogic {
    name: String,
    defaults: SaturationSettings,
    output_dir: PathBuf,
    measurement: Arc<Measurement>,
    task: StdMutex<Option<JoinHandle<Result<()>>>>,
    capabilities: StdMutex<Option<LaserCapabilities>>,
}

impl LaserLogic {
    /// Logic over `laser` and `counter`; data files go to `output_dir`.
    pub fn new(
        name: &str,
        laser: Arc<dyn SimpleLaser>,
        counter: Arc<dyn SlowCounter>,
        config: LaserLogicConfig,
        output_dir: PathBuf,
    ) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            name: name.to_string(),
            defaults: config.saturation,
            output_dir,
            measurement: Arc::new(Measurement {
                laser,
                counter,
                stop: AtomicBool::new(false),
                data: StdMutex::new(Vec::new()),
                progress,
                state: StateCell::new(),
            }),
            task: StdMutex::new(None),
            capabilities: StdMutex::new(None),
        }
    }

    fn laser(&self) -> &Arc<dyn SimpleLaser> {
        &self.measurement.laser
    }

    /// Capabilities read on activation
    pub fn capabilities(&self) -> Option<LaserCapabilities> {
        self.capabilities.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Switch the laser on, returns the resulting state
    pub async fn on(&self) -> Result<LaserState> {
        self.laser().on().await?;
        self.get_laser_state().await
    }

    /// Switch the laser off, returns the resulting state
    pub async fn off(&self) -> Result<LaserState> {
        self.laser().off().await?;
        self.get_laser_state().await
    }

    /// Emission state
    pub async fn get_laser_state(&self) -> Result<LaserState> {
        self.laser().get_laser_state().await
    }

    /// Measured power in W
    pub async fn get_power(&self) -> Result<f64> {
        self.laser().get_power().await
    }

    /// Set the output power in the way the active mode requires.
    ///
    /// Current mode is switched to power mode first. In the modulation modes
    /// the modulation power is set. Returns the measured power.
    pub async fn set_power(&self, watts: f64) -> Result<f64> {
        let laser = self.laser();
        match laser.get_control_mode().await? {
            ControlMode::Current => {
                laser.set_control_mode(ControlMode::Power).await?;
                laser.set_power(watts).await?;
            }
            ControlMode::Power => {
                laser.set_power(watts).await?;
            }
            ControlMode::ModulationDigital | ControlMode::ModulationAnalog => {
                laser.set_modulation_power(watts).await?;
            }
        }
        self.get_power().await
    }

    /// Measured current
    pub async fn get_current(&self) -> Result<f64> {
        self.laser().get_current().await
    }

    /// Set the current, returns the measured current
    pub async fn set_current(&self, current: f64) -> Result<f64> {
        self.laser().set_current(current).await?;
        self.get_current().await
    }

    /// Active control mode
    pub async fn get_control_mode(&self) -> Result<ControlMode> {
        self.laser().get_control_mode().await
    }

    /// Switch control mode
    pub async fn set_control_mode(&self, mode: ControlMode) -> Result<ControlMode> {
        self.laser().set_control_mode(mode).await
    }

    /// Settings used when none are given
    pub fn default_saturation_settings(&self) -> SaturationSettings {
        self.defaults
    }

    /// Start a saturation curve in the background.
    ///
    /// # Errors
    /// `ModuleBusy` while a curve is running, `ModuleNotActive` before
    /// activation.
    pub fn start_saturation_curve(&self, settings: SaturationSettings) -> Result<()> {
        match self.measurement.state.get() {
            ModuleState::Deactivated => {
                return Err(DaqError::ModuleNotActive(self.name.clone()).into());
            }
            ModuleState::Locked => {
                warn!(module = %self.name, "A measurement is currently running, stop it first!");
                return Err(DaqError::ModuleBusy.into());
            }
            ModuleState::Idle => {}
        }
        if !self.measurement.state.try_lock() {
            return Err(DaqError::ModuleBusy.into());
        }
        self.measurement.stop.store(false, Ordering::SeqCst);

        let measurement = Arc::clone(&self.measurement);
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            let result = measurement.run(&name, settings).await;
            if let Err(e) = &result {
                error!(module = %name, error = %e, "Saturation curve failed");
            }
            measurement.state.unlock();
            result
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Ask a running curve to stop after the current point.
    pub fn stop_saturation_curve(&self) {
        self.measurement.stop.store(true, Ordering::SeqCst);
    }

    /// Whether a curve is running
    pub fn is_measuring(&self) -> bool {
        self.measurement.state.get() == ModuleState::Locked
    }

    /// Wait for the running curve, if any, and return its outcome.
    pub async fn wait_for_saturation_curve(&self) -> Result<()> {
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        match handle {
            Some(handle) => handle.await.context("saturation task panicked")?,
            None => Ok(()),
        }
    }

    /// Receiver for the number of recorded points.
    pub fn subscribe_progress(&self) -> watch::Receiver<usize> {
        self.measurement.progress.subscribe()
    }

    /// Points recorded by the last curve
    pub fn saturation_data(&self) -> Vec<SaturationPoint> {
        self.measurement
            .data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Fit `I_sat * P / (P + P_sat) + slope * P + offset` to the last curve.
    pub fn fit_saturation(&self) -> Result<SaturationFit> {
        let data = self.saturation_data();
        let powers: Vec<f64> = data.iter().map(|p| p.power).collect();
        let counts: Vec<f64> = data.iter().map(|p| p.fluorescence).collect();
        let fit = fit_saturation(&powers, &counts)?;
        info!(
            module = %self.name,
            i_sat = fit.i_sat,
            p_sat = fit.p_sat,
            "Saturation fit"
        );
        Ok(fit)
    }

    /// Write the last curve to `<tag>_Saturation_data`, with the fit
    /// parameters in the header when the curve can be fitted.
    ///
    /// Returns `None` and logs a warning when there is nothing to save.
    pub fn save_saturation_data(&self, tag: &str) -> Result<Option<PathBuf>> {
        let data = self.saturation_data();
        if data.is_empty() {
            warn!(module = %self.name, "Sorry, there is no data to save. Start a measurement first.");
            return Ok(None);
        }
        let mut metadata = vec![("Points", data.len().to_string())];
        match self.fit_saturation() {
            Ok(fit) => metadata.extend(fit.metadata()),
            Err(e) => warn!(module = %self.name, error = %e, "Saving without a fit"),
        }
        let rows: Vec<Vec<f64>> = data
            .iter()
            .map(|p| vec![p.power, p.fluorescence, p.stddev])
            .collect();
        let path = save_table(
            &self.output_dir,
            tag,
            "Saturation_data",
            &metadata,
            &["Power (W)", "Fluorescence (c/s)", "Stddev (c/s)"],
            &rows,
        )?;
        info!(module = %self.name, path = %path.display(), "Saturation data saved");
        Ok(Some(path))
    }
}

#[async_trait]
impl Module for LaserLogic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_activate(&self) -> Result<()> {
        let laser = self.laser();
        if laser.get_control_mode().await? != ControlMode::Power {
            laser.set_control_mode(ControlMode::Power).await?;
        }
        let modes = laser.allowed_control_modes();
        let capabilities = LaserCapabilities {
            power_range: laser.power_range(),
            current_range: laser.current_range(),
            current_unit: laser.current_unit().to_string(),
            can_power: modes.contains(&ControlMode::Power),
            can_current: modes.contains(&ControlMode::Current),
            can_analog_mod: modes.contains(&ControlMode::ModulationAnalog),
            can_digital_mod: modes.contains(&ControlMode::ModulationDigital),
            has_shutter: laser.get_shutter_state().await? != ShutterState::NoShutter,
            extra: laser.get_extra_info().await?,
        };
        *self.capabilities.lock().unwrap_or_else(|e| e.into_inner()) = Some(capabilities);
        self.measurement.state.set(ModuleState::Idle);
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        self.stop_saturation_curve();
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.measurement.state.set(ModuleState::Deactivated);
        Ok(())
    }

    fn state(&self) -> ModuleState {
        self.measurement.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCounter, MockLaser};
    use tracing_test::traced_test;

    async fn logic(dir: PathBuf) -> (LaserLogic, Arc<MockLaser>) {
        let laser = Arc::new(MockLaser::new(0.03));
        let counter = Arc::new(MockCounter::new().excited_by(laser.clone()));
        let logic = LaserLogic::new("laserlogic", laser.clone(), counter, LaserLogicConfig::default(), dir);
        logic.on_activate().await.unwrap();
        (logic, laser)
    }

    fn quick() -> SaturationSettings {
        SaturationSettings {
            time_per_point: 0.5,
            num_points: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn activation_forces_power_mode() {
        let laser = Arc::new(MockLaser::new(0.03));
        laser.set_control_mode(ControlMode::Current).await.unwrap();
        let logic = LaserLogic::new(
            "laserlogic",
            laser.clone(),
            Arc::new(MockCounter::new()),
            LaserLogicConfig::default(),
            std::env::temp_dir(),
        );
        logic.on_activate().await.unwrap();
        assert_eq!(laser.get_control_mode().await.unwrap(), ControlMode::Power);
        let caps = logic.capabilities().unwrap();
        assert!(caps.can_current && !caps.can_analog_mod && caps.has_shutter);
    }

    #[tokio::test]
    async fn set_power_leaves_current_mode() {
        let (logic, laser) = logic(std::env::temp_dir()).await;
        logic.on().await.unwrap();
        logic.set_control_mode(ControlMode::Current).await.unwrap();
        let power = logic.set_power(0.01).await.unwrap();
        assert_eq!(power, 0.01);
        assert_eq!(laser.get_control_mode().await.unwrap(), ControlMode::Power);

        logic.set_control_mode(ControlMode::ModulationDigital).await.unwrap();
        logic.set_power(0.02).await.unwrap();
        assert_eq!(laser.get_power_setpoint().await.unwrap(), 0.02);
    }

    #[tokio::test(start_paused = true)]
    async fn curve_records_every_point_and_sets_final_power() {
        let (logic, laser) = logic(std::env::temp_dir()).await;
        assert_eq!(logic.on().await.unwrap(), LaserState::On);

        logic.start_saturation_curve(quick()).unwrap();
        assert!(logic.is_measuring());
        assert!(logic.start_saturation_curve(quick()).is_err());
        logic.wait_for_saturation_curve().await.unwrap();

        let data = logic.saturation_data();
        assert_eq!(data.len(), 5);
        assert!((data[0].power - 1e-3).abs() < 1e-12);
        assert!((data[4].power - 22e-3).abs() < 1e-12);
        assert!(data[4].fluorescence > data[0].fluorescence);
        assert_eq!(laser.get_power_setpoint().await.unwrap(), 3e-3);
        assert_eq!(logic.state(), ModuleState::Idle);
    }

    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn curve_aborts_when_laser_off() {
        let (logic, _laser) = logic(std::env::temp_dir()).await;
        logic.start_saturation_curve(quick()).unwrap();
        logic.wait_for_saturation_curve().await.unwrap();
        assert!(logic.saturation_data().is_empty());
        assert!(logs_contain("Laser is not ON"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_request_ends_curve_early() {
        let (logic, _laser) = logic(std::env::temp_dir()).await;
        logic.on().await.unwrap();
        let mut progress = logic.subscribe_progress();
        logic.start_saturation_curve(quick()).unwrap();
        progress.changed().await.unwrap();
        logic.stop_saturation_curve();
        logic.wait_for_saturation_curve().await.unwrap();
        assert!(logic.saturation_data().len() < 5);
    }

    #[traced_test]
    #[tokio::test]
    async fn saving_without_data_warns() {
        let (logic, _laser) = logic(std::env::temp_dir()).await;
        assert!(logic.save_saturation_data("x").unwrap().is_none());
        assert!(logs_contain("no data to save"));
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test(start_paused = true)]
    async fn saved_file_has_three_columns() {
        let dir = tempfile::tempdir().unwrap();
        let (logic, _laser) = logic(dir.path().to_path_buf()).await;
        logic.on().await.unwrap();
        logic.start_saturation_curve(quick()).unwrap();
        logic.wait_for_saturation_curve().await.unwrap();

        let path = logic.save_saturation_data("nv7").unwrap().unwrap();
        assert!(path.to_string_lossy().ends_with("_nv7_Saturation_data.dat"));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("# Power (W)\tFluorescence (c/s)\tStddev (c/s)"));
        assert_eq!(text.lines().filter(|l| !l.starts_with('#')).count(), 5);
        assert!(text.contains("# P_sat (W): "));
        assert!(text.contains("# I_sat (c/s): "));
    }

    #[tokio::test(start_paused = true)]
    async fn fit_recovers_counter_saturation() {
        let laser = Arc::new(MockLaser::new(0.03));
        let counter = MockCounter::new()
            .excited_by(laser.clone())
            .with_saturation(300e3, 4e-3);
        let logic = LaserLogic::new(
            "laserlogic",
            laser,
            Arc::new(counter),
            LaserLogicConfig::default(),
            std::env::temp_dir(),
        );
        logic.on_activate().await.unwrap();
        assert!(logic.fit_saturation().is_err());

        logic.on().await.unwrap();
        logic
            .start_saturation_curve(SaturationSettings {
                time_per_point: 0.1,
                ..Default::default()
            })
            .unwrap();
        logic.wait_for_saturation_curve().await.unwrap();

        let fit = logic.fit_saturation().unwrap();
        assert!((fit.p_sat / 4e-3 - 1.0).abs() < 0.2, "{:?}", fit);
        assert!((fit.eval(22e-3) / logic.saturation_data()[16].fluorescence - 1.0).abs() < 0.01);
    }
}
