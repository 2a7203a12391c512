//! Hardware interfaces
//!
//! Logic modules never see concrete drivers. They hold `Arc<dyn Trait>` handles
//! to the interfaces defined here, the same way a host resolves a connector to
//! whatever module satisfies a named interface:
//!
//! - A laser implements [`SimpleLaser`]
//! - A microwave source implements [`Microwave`]
//! - A temperature controller implements [`PidController`]
//! - A stage implements [`Motor`] and/or [`Movable`]
//! - A camera implements `ExposureControl + GainControl + CameraAcquisition`
//!
//! # Design Philosophy
//!
//! Each interface:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Keeps device limits in plain data structs next to the trait
//!
//! # Example
//!
//! ```rust,ignore
//! async fn ramp_power<L: SimpleLaser + ?Sized>(laser: &L, steps: &[f64]) -> Result<()> {
//!     let (min, max) = laser.power_range();
//!     for &p in steps {
//!         laser.set_power(p.clamp(min, max)).await?;
//!         tokio::time::sleep(Duration::from_millis(100)).await;
//!     }
//!     Ok(())
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Motion and scalar readout
// =============================================================================

/// Capability: Motion Control
///
/// Devices that can move to positions along one axis (stages, actuators).
///
/// # Contract
/// - Positions are in device-native units (typically um or degrees)
/// - `move_abs` and `move_rel` initiate motion but may return before completion
/// - `wait_settled` blocks until motion completes
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Move relative to current position
    async fn move_rel(&self, distance: f64) -> Result<()>;

    /// Get current position
    async fn position(&self) -> Result<f64>;

    /// Wait for motion to settle
    async fn wait_settled(&self) -> Result<()>;

    /// Stop motion immediately
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: photon counting with statistics.
#[async_trait]
pub trait SlowCounter: Send + Sync {
    /// Count `samples` bins and return (mean, standard deviation) in counts/s.
    async fn count_mean_std(&self, samples: usize) -> Result<(f64, f64)>;
}

// =============================================================================
// Lasers
// =============================================================================

/// What the laser regulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    /// Constant output power
    Power,
    /// Constant diode current
    Current,
    /// Digital modulation input
    ModulationDigital,
    /// Analog modulation input
    ModulationAnalog,
}

/// Emission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaserState {
    /// Not emitting
    Off,
    /// Emitting
    On,
    /// Interlock or key switch prevents emission
    Locked,
}

/// Shutter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutterState {
    /// Shutter closed
    Closed,
    /// Shutter open
    Open,
    /// Device has no shutter
    NoShutter,
}

/// Interface: simple CW laser.
///
/// Powers are in watts. Currents are in the unit returned by
/// [`current_unit`](SimpleLaser::current_unit).
#[async_trait]
pub trait SimpleLaser: Send + Sync {
    /// Settable power range (min, max) in W
    fn power_range(&self) -> (f64, f64);

    /// Measured output power
    async fn get_power(&self) -> Result<f64>;

    /// Requested output power
    async fn get_power_setpoint(&self) -> Result<f64>;

    /// Request output power, returns the setpoint the device accepted
    async fn set_power(&self, watts: f64) -> Result<f64>;

    /// Power setpoint used in modulation modes
    async fn set_modulation_power(&self, _watts: f64) -> Result<f64> {
        anyhow::bail!("Modulation power not supported by this laser")
    }

    /// Unit of all current values
    fn current_unit(&self) -> &str;

    /// Settable current range
    fn current_range(&self) -> (f64, f64);

    /// Measured current
    async fn get_current(&self) -> Result<f64>;

    /// Requested current
    async fn get_current_setpoint(&self) -> Result<f64>;

    /// Request current, returns the setpoint the device accepted
    async fn set_current(&self, current: f64) -> Result<f64>;

    /// Modes this laser can run in
    fn allowed_control_modes(&self) -> Vec<ControlMode>;

    /// Active control mode
    async fn get_control_mode(&self) -> Result<ControlMode>;

    /// Switch control mode, returns the mode now active
    async fn set_control_mode(&self, mode: ControlMode) -> Result<ControlMode>;

    /// Start emission
    async fn on(&self) -> Result<LaserState>;

    /// Stop emission
    async fn off(&self) -> Result<LaserState>;

    /// Emission state
    async fn get_laser_state(&self) -> Result<LaserState>;

    /// Dispatch to [`on`](SimpleLaser::on) or [`off`](SimpleLaser::off)
    async fn set_laser_state(&self, state: LaserState) -> Result<LaserState> {
        match state {
            LaserState::On => self.on().await,
            LaserState::Off => self.off().await,
            LaserState::Locked => anyhow::bail!("Cannot request the Locked state"),
        }
    }

    /// Shutter state
    async fn get_shutter_state(&self) -> Result<ShutterState>;

    /// Open or close the shutter, returns the resulting state
    async fn set_shutter_state(&self, state: ShutterState) -> Result<ShutterState>;

    /// Named temperatures in degrees Celsius
    async fn get_temperatures(&self) -> Result<BTreeMap<String, f64>>;

    /// Free-form device information
    async fn get_extra_info(&self) -> Result<String>;
}

// =============================================================================
// Microwave sources
// =============================================================================

/// Output mode of a microwave source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MicrowaveMode {
    /// Fixed frequency
    Cw,
    /// Frequency list stepped by trigger
    List,
    /// Linear sweep stepped by trigger
    Sweep,
}

/// Active trigger edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerEdge {
    /// Rising edge
    Rising,
    /// Falling edge
    Falling,
    /// Not triggered
    None,
}

/// Frequency configuration as reported by the device.
#[derive(Debug, Clone, PartialEq)]
pub enum FrequencyReadback {
    /// CW frequency in Hz
    Cw(f64),
    /// List entries in Hz
    List(Vec<f64>),
    /// Sweep start, stop and step in Hz
    Sweep {
        /// First frequency
        start: f64,
        /// Last frequency
        stop: f64,
        /// Step width
        step: f64,
    },
}

/// Device limits of a microwave source.
#[derive(Debug, Clone, PartialEq)]
pub struct MicrowaveLimits {
    /// Supported modes
    pub supported_modes: Vec<MicrowaveMode>,
    /// Minimum frequency in Hz
    pub min_frequency: f64,
    /// Maximum frequency in Hz
    pub max_frequency: f64,
    /// Minimum power in dBm
    pub min_power: f64,
    /// Maximum power in dBm
    pub max_power: f64,
    /// Minimum list step in Hz
    pub list_minstep: f64,
    /// Maximum list step in Hz
    pub list_maxstep: f64,
    /// Maximum number of list entries
    pub list_maxentries: usize,
    /// Minimum sweep step in Hz
    pub sweep_minstep: f64,
    /// Maximum sweep step in Hz
    pub sweep_maxstep: f64,
    /// Maximum number of sweep points
    pub sweep_maxentries: usize,
}

impl Default for MicrowaveLimits {
    fn default() -> Self {
        Self {
            supported_modes: vec![MicrowaveMode::Cw],
            min_frequency: 1e6,
            max_frequency: 1e9,
            min_power: -10.0,
            max_power: 0.0,
            list_minstep: 1e-3,
            list_maxstep: 1e9,
            list_maxentries: 1000,
            sweep_minstep: 1e-3,
            sweep_maxstep: 1e9,
            sweep_maxentries: 1000,
        }
    }
}

impl MicrowaveLimits {
    /// Frequency inside [min, max]
    pub fn frequency_in_range(&self, frequency: f64) -> bool {
        (self.min_frequency..=self.max_frequency).contains(&frequency)
    }

    /// Power inside [min, max]
    pub fn power_in_range(&self, power: f64) -> bool {
        (self.min_power..=self.max_power).contains(&power)
    }

    /// List length inside [1, max entries]
    pub fn list_len_in_range(&self, len: usize) -> bool {
        (1..=self.list_maxentries).contains(&len)
    }

    /// Sweep step inside [min step, max step]
    pub fn sweep_step_in_range(&self, step: f64) -> bool {
        (self.sweep_minstep..=self.sweep_maxstep).contains(&step)
    }
}

/// Interface: microwave source with CW, list and sweep output.
///
/// Frequencies in Hz, powers in dBm.
#[async_trait]
pub trait Microwave: Send + Sync {
    /// Device limits
    fn limits(&self) -> MicrowaveLimits;

    /// Switch the output off
    async fn off(&self) -> Result<()>;

    /// Current mode and whether the output is on
    async fn get_status(&self) -> Result<(MicrowaveMode, bool)>;

    /// Output power
    async fn get_power(&self) -> Result<f64>;

    /// Frequency configuration of the current mode
    async fn get_frequency(&self) -> Result<FrequencyReadback>;

    /// Output on in CW mode
    async fn cw_on(&self) -> Result<()>;

    /// Configure CW output; returns (frequency, power, mode) as read back
    async fn set_cw(&self, frequency: f64, power: f64) -> Result<(f64, f64, MicrowaveMode)>;

    /// Output on in list mode
    async fn list_on(&self) -> Result<()>;

    /// Configure list output; returns (frequencies, power, mode)
    async fn set_list(&self, frequencies: &[f64], power: f64) -> Result<(Vec<f64>, f64, MicrowaveMode)>;

    /// Jump back to the first list entry
    async fn reset_listpos(&self) -> Result<()>;

    /// Output on in sweep mode
    async fn sweep_on(&self) -> Result<()>;

    /// Configure sweep output; returns (start, stop, step, power, mode)
    async fn set_sweep(
        &self,
        start: f64,
        stop: f64,
        step: f64,
        power: f64,
    ) -> Result<(f64, f64, f64, f64, MicrowaveMode)>;

    /// Jump back to the sweep start
    async fn reset_sweeppos(&self) -> Result<()>;

    /// Configure the external trigger; returns (edge, timing) now active
    async fn set_ext_trigger(&self, edge: TriggerEdge, timing: f64) -> Result<(TriggerEdge, f64)>;

    /// Software trigger
    async fn trigger(&self) -> Result<()>;
}

// =============================================================================
// Temperature control
// =============================================================================

/// Interface: PID regulated process (temperature controllers).
#[async_trait]
pub trait PidController: Send + Sync {
    /// Proportional gain
    async fn get_kp(&self) -> Result<f64>;
    /// Set proportional gain
    async fn set_kp(&self, kp: f64) -> Result<()>;
    /// Integral gain
    async fn get_ki(&self) -> Result<f64>;
    /// Set integral gain
    async fn set_ki(&self, ki: f64) -> Result<()>;
    /// Derivative gain
    async fn get_kd(&self) -> Result<f64>;
    /// Set derivative gain
    async fn set_kd(&self, kd: f64) -> Result<()>;
    /// Setpoint
    async fn get_setpoint(&self) -> Result<f64>;
    /// Set setpoint
    async fn set_setpoint(&self, setpoint: f64) -> Result<()>;
    /// Manual output value
    async fn get_manual_value(&self) -> Result<f64>;
    /// Set manual output value
    async fn set_manual_value(&self, value: f64) -> Result<()>;
    /// Whether regulation is active
    async fn get_enabled(&self) -> Result<bool>;
    /// Start or stop regulation
    async fn set_enabled(&self, enabled: bool) -> Result<()>;
    /// Output limits, `None` when the device does not expose them
    async fn get_control_limit(&self) -> Result<Option<(f64, f64)>>;
    /// Set output limits
    async fn set_control_limit(&self, limit: (f64, f64)) -> Result<()>;
    /// Regulated quantity
    async fn get_process_value(&self) -> Result<f64>;
    /// Unit of the regulated quantity as (short, long)
    fn get_process_unit(&self) -> (String, String);
    /// Controller output
    async fn get_control_value(&self) -> Result<f64>;
    /// Unit of the controller output as (short, long)
    fn get_control_unit(&self) -> (String, String);
    /// Extra device information
    async fn get_extra(&self) -> Result<BTreeMap<String, String>>;
}

// =============================================================================
// Level sensors
// =============================================================================

/// Auto-fill state of a level sensor channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FillStatus {
    /// Filling is off
    Off,
    /// Fill ran into its timeout
    Timeout,
    /// Filling for the given minutes
    Filling(f64),
    /// The status could not be read
    Unknown,
}

/// Interface: cryogen level sensor with automatic refill control.
///
/// Communication failures are logged by the implementation and reported as
/// neutral values so polling loops keep running.
#[async_trait]
pub trait LevelSensor: Send + Sync {
    /// Level on the selected channel
    async fn measure_level(&self) -> f64;
    /// Selected channel (0 if unknown)
    async fn get_channel(&self) -> u8;
    /// Select channel 1 or 2
    async fn select_channel(&self, channel: u8) -> Result<()>;
    /// Select `channel` and measure
    async fn get_level(&self, channel: u8) -> f64;
    /// Collected status of the selected channel
    async fn get_full_status(&self) -> BTreeMap<String, String>;
    /// Auto-fill state
    async fn get_fill_status(&self, channel: u8) -> FillStatus;
    /// Upper fill threshold (-1 if unknown)
    async fn get_high_level(&self, channel: u8) -> f64;
    /// Lower fill threshold (-1 if unknown)
    async fn get_low_level(&self, channel: u8) -> f64;
    /// Set upper fill threshold
    async fn set_high_level(&self, level: f64, channel: u8);
    /// Set lower fill threshold
    async fn set_low_level(&self, level: f64, channel: u8);
    /// Sensor type, "lhe" or "ln"
    async fn get_type(&self, channel: u8) -> Option<String>;
    /// Automatic filling "off" or "auto"
    async fn set_control_mode(&self, mode: &str, channel: u8);
    /// Start a manual fill
    async fn start_fill(&self, channel: u8);
    /// Reset the device, clearing fills and timeouts
    async fn reset(&self);
}

// =============================================================================
// Motors
// =============================================================================

/// Limits of one motor axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorAxisConstraints {
    /// Axis label
    pub label: String,
    /// Position unit
    pub unit: String,
    /// Minimum position
    pub pos_min: f64,
    /// Maximum position
    pub pos_max: f64,
    /// Smallest step
    pub pos_step: f64,
    /// Minimum velocity
    pub vel_min: f64,
    /// Maximum velocity
    pub vel_max: f64,
}

/// Interface: multi-axis motor controller.
#[async_trait]
pub trait Motor: Send + Sync {
    /// Constraints keyed by axis label
    fn get_constraints(&self) -> BTreeMap<String, MotorAxisConstraints>;
    /// Relative move per axis
    async fn move_rel(&self, moves: &BTreeMap<String, f64>) -> Result<()>;
    /// Absolute move per axis
    async fn move_abs(&self, moves: &BTreeMap<String, f64>) -> Result<()>;
    /// Stop all axes
    async fn abort(&self) -> Result<()>;
    /// Positions of the given axes (all when empty)
    async fn get_pos(&self, axes: &[String]) -> Result<BTreeMap<String, f64>>;
    /// Status word per axis (1 = moving, 0 = idle)
    async fn get_status(&self, axes: &[String]) -> Result<BTreeMap<String, i32>>;
    /// Reference run
    async fn calibrate(&self, axes: &[String]) -> Result<()>;
    /// Velocity per axis
    async fn get_velocity(&self, axes: &[String]) -> Result<BTreeMap<String, f64>>;
    /// Set velocity per axis
    async fn set_velocity(&self, velocities: &BTreeMap<String, f64>) -> Result<()>;
}

// =============================================================================
// Vector magnets
// =============================================================================

/// Sweep direction of one magnet supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RampDirection {
    /// Towards the upper limit
    Up,
    /// Towards the lower limit
    Down,
    /// Towards zero
    Zero,
}

impl RampDirection {
    /// Argument of the `SWEEP` command
    pub fn command_word(self) -> &'static str {
        match self {
            RampDirection::Up => "UP",
            RampDirection::Down => "DOWN",
            RampDirection::Zero => "ZERO",
        }
    }
}

/// Interface: three-axis superconducting vector magnet.
///
/// Fields in tesla.
#[async_trait]
pub trait VectorMagnet: Send + Sync {
    /// Per-axis limits plus `rho` for the field magnitude
    fn get_constraints(&self) -> BTreeMap<String, f64>;
    /// Program a new target field without ramping
    async fn target_field(&self, x: f64, y: f64, z: f64) -> Result<()>;
    /// Programmed target
    fn get_field_target(&self) -> (f64, f64, f64);
    /// Ramp every axis towards its programmed limit
    async fn ramp(&self) -> Result<()>;
    /// Ramp every axis to zero field
    async fn ramp_to_zero(&self) -> Result<()>;
    /// Per axis: 1 when the target is reached, 0 while ramping
    async fn get_status(&self) -> Result<BTreeMap<String, i32>>;
}

// =============================================================================
// Cameras
// =============================================================================

/// One image frame, row-major.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel values
    pub buffer: Vec<u16>,
}

impl Frame {
    /// Allocate a zeroed frame
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            buffer: vec![0; (width as usize) * (height as usize)],
        }
    }

    /// Pixel at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.buffer.get((y * self.width + x) as usize).copied()
    }
}

/// Capability: Exposure Time Control
///
/// # Contract
/// - Exposure is in seconds (not milliseconds)
/// - Exposure applies to the next acquisition
#[async_trait]
pub trait ExposureControl: Send + Sync {
    /// Set exposure/integration time
    async fn set_exposure(&self, seconds: f64) -> Result<()>;

    /// Get current exposure setting
    async fn get_exposure(&self) -> Result<f64>;
}

/// Capability: sensor gain.
#[async_trait]
pub trait GainControl: Send + Sync {
    /// Set gain, returns the gain applied
    async fn set_gain(&self, gain: f64) -> Result<f64>;

    /// Current gain
    async fn get_gain(&self) -> Result<f64>;
}

/// Capability: single and live image acquisition.
#[async_trait]
pub trait CameraAcquisition: Send + Sync {
    /// Camera name for display
    fn get_name(&self) -> String;

    /// Image size (width, height)
    fn get_size(&self) -> (u32, u32);

    /// Whether live mode is available
    fn support_live_acquisition(&self) -> bool;

    /// Start continuous acquisition
    async fn start_live_acquisition(&self) -> Result<()>;

    /// Acquire one frame
    async fn start_single_acquisition(&self) -> Result<()>;

    /// Stop live or single acquisition
    async fn stop_acquisition(&self) -> Result<()>;

    /// Last acquired frame
    async fn get_acquired_data(&self) -> Result<Frame>;

    /// Ready for an acquisition
    async fn get_ready_state(&self) -> bool;

    /// Acquire `count` frames back to back
    async fn get_sequence(&self, count: usize) -> Result<Vec<Frame>>;
}

/// Combined trait for camera trait objects.
pub trait Camera: ExposureControl + GainControl + CameraAcquisition {}

/// Blanket implementation - any type implementing the three parts is a Camera
impl<T: ExposureControl + GainControl + CameraAcquisition> Camera for T {}

// =============================================================================
// SPM line scanner
// =============================================================================

/// Event delivered by a line scanner while a line runs.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    /// A batch of samples
    Data(Vec<f32>),
    /// The line is complete
    LineEnd,
}

/// Interface: scanning probe controller that executes whole lines.
#[async_trait]
pub trait LineScanner: Send + Sync {
    /// Parameters this controller can record
    fn available_params(&self) -> Vec<String>;
    /// Prepare a scan in `plane` with `line_points` samples per line
    async fn setup_scan_common(&self, plane: &str, line_points: usize, params: &[String]) -> Result<()>;
    /// Coordinates (um) and durations (s) of the next line
    async fn setup_scan_line(
        &self,
        x_start: f64,
        x_stop: f64,
        y_start: f64,
        y_stop: f64,
        time_forward: f64,
        time_back: f64,
    ) -> Result<()>;
    /// Start executing the configured line
    async fn scan_line(&self) -> Result<()>;
    /// Receiver for line events; only the first call returns `Some`
    async fn take_line_receiver(&self) -> Option<tokio::sync::mpsc::UnboundedReceiver<LineEvent>>;
    /// End the scan procedure
    async fn finish_scan(&self) -> Result<()>;
    /// Write to the controller log, returns its reply
    async fn send_log_message(&self, message: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockStage {
        position: std::sync::Mutex<f64>,
    }

    #[async_trait]
    impl Movable for MockStage {
        async fn move_abs(&self, position: f64) -> Result<()> {
            *self.position.lock().unwrap() = position;
            Ok(())
        }

        async fn move_rel(&self, distance: f64) -> Result<()> {
            *self.position.lock().unwrap() += distance;
            Ok(())
        }

        async fn position(&self) -> Result<f64> {
            Ok(*self.position.lock().unwrap())
        }

        async fn wait_settled(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_movable_trait() {
        let stage = MockStage {
            position: std::sync::Mutex::new(0.0),
        };

        stage.move_abs(10.0).await.unwrap();
        stage.move_rel(5.0).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 15.0);
        assert!(stage.stop().await.is_err());
    }

    #[test]
    fn microwave_limits_ranges() {
        let limits = MicrowaveLimits {
            min_frequency: 60e6,
            max_frequency: 6.8e9,
            list_maxentries: 2000,
            ..Default::default()
        };
        assert!(limits.frequency_in_range(2.87e9));
        assert!(!limits.frequency_in_range(7e9));
        assert!(limits.list_len_in_range(2000));
        assert!(!limits.list_len_in_range(2001));
        assert!(!limits.list_len_in_range(0));
    }

    #[test]
    fn frame_pixel_bounds() {
        let mut frame = Frame::new(4, 2);
        frame.buffer[5] = 9;
        assert_eq!(frame.pixel(1, 1), Some(9));
        assert_eq!(frame.pixel(4, 0), None);
    }

    #[test]
    fn ramp_direction_words() {
        assert_eq!(RampDirection::Up.command_word(), "UP");
        assert_eq!(RampDirection::Zero.command_word(), "ZERO");
    }
}
