//! Mock Hardware Implementations
//!
//! Simulated devices for tests and `--simulate` runs. All mock devices use
//! async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockStage` - single axis stage with speed-limited motion
//! - `MockCamera` - camera with single and live acquisition
//! - `MockLaser` - CW laser honouring power and current limits
//! - `MockCounter` - photon counter whose rate follows a saturation curve
//! - `MockPidController` - first-order thermal model
//!
//! # Performance Characteristics
//!
//! - MockStage: 10 units/sec motion speed, 50ms settling time
//! - MockCamera: frame readout takes the exposure time

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::hardware::capabilities::{
    CameraAcquisition, ControlMode, ExposureControl, Frame, GainControl, LaserState, Movable,
    PidController, ShutterState, SimpleLaser, SlowCounter,
};

// =============================================================================
// MockStage - Simulated Motion Stage
// =============================================================================

/// Mock motion stage with realistic timing
///
/// ```rust,ignore
/// let stage = MockStage::new();
/// stage.move_abs(10.0).await?; // Takes ~1 second
/// assert_eq!(stage.position().await?, 10.0);
/// ```
pub struct MockStage {
    position: Arc<RwLock<f64>>,
    speed_per_sec: f64,
}

impl MockStage {
    /// Create new mock stage at position 0.0
    pub fn new() -> Self {
        Self::with_position(0.0)
    }

    /// Create new mock stage at the given position
    pub fn with_position(initial_position: f64) -> Self {
        Self {
            position: Arc::new(RwLock::new(initial_position)),
            speed_per_sec: 10.0,
        }
    }

    /// Create mock stage with custom speed (units per second)
    pub fn with_speed(speed_per_sec: f64) -> Self {
        Self {
            position: Arc::new(RwLock::new(0.0)),
            speed_per_sec,
        }
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Movable for MockStage {
    async fn move_abs(&self, target: f64) -> Result<()> {
        let current = *self.position.read().await;
        let distance = (target - current).abs();
        let delay_ms = (distance / self.speed_per_sec * 1000.0) as u64;

        debug!(from = current, to = target, delay_ms, "MockStage moving");
        sleep(Duration::from_millis(delay_ms)).await;

        *self.position.write().await = target;
        Ok(())
    }

    async fn move_rel(&self, distance: f64) -> Result<()> {
        let current = *self.position.read().await;
        self.move_abs(current + distance).await
    }

    async fn position(&self) -> Result<f64> {
        Ok(*self.position.read().await)
    }

    async fn wait_settled(&self) -> Result<()> {
        sleep(Duration::from_millis(50)).await;
        Ok(())
    }
}

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Mock camera with single and live acquisition.
///
/// Frames are a flat background with Poisson-like noise; every frame takes
/// the exposure time to read out. Live frames are published on a broadcast
/// channel.
pub struct MockCamera {
    name: String,
    resolution: (u32, u32),
    frame_count: AtomicU64,
    live: Arc<AtomicBool>,
    exposure_s: Arc<RwLock<f64>>,
    gain: RwLock<f64>,
    last_frame: Arc<RwLock<Option<Frame>>>,
    frame_tx: tokio::sync::broadcast::Sender<Arc<Frame>>,
}

impl MockCamera {
    /// Create new mock camera with specified resolution
    pub fn new(width: u32, height: u32) -> Self {
        let (frame_tx, _) = tokio::sync::broadcast::channel(16);
        Self {
            name: "Prime 95B (simulated)".to_string(),
            resolution: (width, height),
            frame_count: AtomicU64::new(0),
            live: Arc::new(AtomicBool::new(false)),
            exposure_s: Arc::new(RwLock::new(1.0)),
            gain: RwLock::new(1.0),
            last_frame: Arc::new(RwLock::new(None)),
            frame_tx,
        }
    }

    /// Total number of frames produced
    pub fn get_frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// Subscribe to live frames
    pub fn subscribe_frames(&self) -> tokio::sync::broadcast::Receiver<Arc<Frame>> {
        self.frame_tx.subscribe()
    }

    fn synthesize(width: u32, height: u32, gain: f64) -> Frame {
        let mut frame = Frame::new(width, height);
        let mut rng = rand::thread_rng();
        for px in frame.buffer.iter_mut() {
            let counts = 100.0 * gain + rng.gen_range(-10.0..10.0) * gain.sqrt();
            *px = counts.clamp(0.0, u16::MAX as f64) as u16;
        }
        frame
    }

    async fn expose_once(&self) -> Frame {
        let exposure = *self.exposure_s.read().await;
        sleep(Duration::from_secs_f64(exposure)).await;
        let (w, h) = self.resolution;
        let frame = Self::synthesize(w, h, *self.gain.read().await);
        self.frame_count.fetch_add(1, Ordering::SeqCst);
        frame
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new(1200, 1200)
    }
}

#[async_trait]
impl ExposureControl for MockCamera {
    async fn set_exposure(&self, seconds: f64) -> Result<()> {
        if seconds <= 0.0 {
            return Err(anyhow!("Exposure must be positive, got {}", seconds));
        }
        *self.exposure_s.write().await = seconds;
        Ok(())
    }

    async fn get_exposure(&self) -> Result<f64> {
        Ok(*self.exposure_s.read().await)
    }
}

#[async_trait]
impl GainControl for MockCamera {
    async fn set_gain(&self, gain: f64) -> Result<f64> {
        *self.gain.write().await = gain;
        Ok(gain)
    }

    async fn get_gain(&self) -> Result<f64> {
        Ok(*self.gain.read().await)
    }
}

#[async_trait]
impl CameraAcquisition for MockCamera {
    fn get_name(&self) -> String {
        self.name.clone()
    }

    fn get_size(&self) -> (u32, u32) {
        self.resolution
    }

    fn support_live_acquisition(&self) -> bool {
        true
    }

    async fn start_live_acquisition(&self) -> Result<()> {
        if self.live.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("Live acquisition already running"));
        }

        let live = Arc::clone(&self.live);
        let exposure = Arc::clone(&self.exposure_s);
        let last = Arc::clone(&self.last_frame);
        let tx = self.frame_tx.clone();
        let gain = *self.gain.read().await;
        let (w, h) = self.resolution;

        tokio::spawn(async move {
            while live.load(Ordering::SeqCst) {
                let seconds = *exposure.read().await;
                sleep(Duration::from_secs_f64(seconds)).await;
                let frame = Self::synthesize(w, h, gain);
                *last.write().await = Some(frame.clone());
                // No subscribers is fine
                let _ = tx.send(Arc::new(frame));
            }
        });
        Ok(())
    }

    async fn start_single_acquisition(&self) -> Result<()> {
        if self.live.load(Ordering::SeqCst) {
            return Err(anyhow!("Camera is in live mode"));
        }
        let frame = self.expose_once().await;
        *self.last_frame.write().await = Some(frame);
        Ok(())
    }

    async fn stop_acquisition(&self) -> Result<()> {
        self.live.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_acquired_data(&self) -> Result<Frame> {
        self.last_frame
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("No frame acquired yet"))
    }

    async fn get_ready_state(&self) -> bool {
        !self.live.load(Ordering::SeqCst)
    }

    async fn get_sequence(&self, count: usize) -> Result<Vec<Frame>> {
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(self.expose_once().await);
        }
        if let Some(last) = frames.last() {
            *self.last_frame.write().await = Some(last.clone());
        }
        Ok(frames)
    }
}

// =============================================================================
// MockLaser
// =============================================================================

#[derive(Debug)]
struct LaserModel {
    power_setpoint: f64,
    current_setpoint: f64,
    mode: ControlMode,
    state: LaserState,
    shutter: ShutterState,
}

/// In-memory CW laser. Output power equals the setpoint while on.
pub struct MockLaser {
    model: StdMutex<LaserModel>,
    max_power: f64,
}

impl MockLaser {
    /// Laser with power range (0, `max_power`) W, off, in Power mode
    pub fn new(max_power: f64) -> Self {
        Self {
            model: StdMutex::new(LaserModel {
                power_setpoint: 0.0,
                current_setpoint: 0.0,
                mode: ControlMode::Power,
                state: LaserState::Off,
                shutter: ShutterState::Closed,
            }),
            max_power,
        }
    }

    fn with_model<R>(&self, f: impl FnOnce(&mut LaserModel) -> R) -> R {
        let mut model = self.model.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut model)
    }
}

impl Default for MockLaser {
    fn default() -> Self {
        Self::new(0.25)
    }
}

#[async_trait]
impl SimpleLaser for MockLaser {
    fn power_range(&self) -> (f64, f64) {
        (0.0, self.max_power)
    }

    async fn get_power(&self) -> Result<f64> {
        Ok(self.with_model(|m| match m.state {
            LaserState::On => m.power_setpoint,
            _ => 0.0,
        }))
    }

    async fn get_power_setpoint(&self) -> Result<f64> {
        Ok(self.with_model(|m| m.power_setpoint))
    }

    async fn set_power(&self, watts: f64) -> Result<f64> {
        let clamped = watts.clamp(0.0, self.max_power);
        if clamped != watts {
            warn!(requested = watts, applied = clamped, "Power outside range, clamped");
        }
        Ok(self.with_model(|m| {
            m.power_setpoint = clamped;
            clamped
        }))
    }

    async fn set_modulation_power(&self, watts: f64) -> Result<f64> {
        self.set_power(watts).await
    }

    fn current_unit(&self) -> &str {
        "%"
    }

    fn current_range(&self) -> (f64, f64) {
        (0.0, 100.0)
    }

    async fn get_current(&self) -> Result<f64> {
        Ok(self.with_model(|m| m.current_setpoint))
    }

    async fn get_current_setpoint(&self) -> Result<f64> {
        Ok(self.with_model(|m| m.current_setpoint))
    }

    async fn set_current(&self, current: f64) -> Result<f64> {
        let clamped = current.clamp(0.0, 100.0);
        Ok(self.with_model(|m| {
            m.current_setpoint = clamped;
            clamped
        }))
    }

    fn allowed_control_modes(&self) -> Vec<ControlMode> {
        vec![
            ControlMode::Power,
            ControlMode::Current,
            ControlMode::ModulationDigital,
        ]
    }

    async fn get_control_mode(&self) -> Result<ControlMode> {
        Ok(self.with_model(|m| m.mode))
    }

    async fn set_control_mode(&self, mode: ControlMode) -> Result<ControlMode> {
        if !self.allowed_control_modes().contains(&mode) {
            return Err(anyhow!("Control mode {:?} not supported", mode));
        }
        Ok(self.with_model(|m| {
            m.mode = mode;
            mode
        }))
    }

    async fn on(&self) -> Result<LaserState> {
        Ok(self.with_model(|m| {
            m.state = LaserState::On;
            m.state
        }))
    }

    async fn off(&self) -> Result<LaserState> {
        Ok(self.with_model(|m| {
            m.state = LaserState::Off;
            m.state
        }))
    }

    async fn get_laser_state(&self) -> Result<LaserState> {
        Ok(self.with_model(|m| m.state))
    }

    async fn get_shutter_state(&self) -> Result<ShutterState> {
        Ok(self.with_model(|m| m.shutter))
    }

    async fn set_shutter_state(&self, state: ShutterState) -> Result<ShutterState> {
        Ok(self.with_model(|m| {
            m.shutter = state;
            state
        }))
    }

    async fn get_temperatures(&self) -> Result<BTreeMap<String, f64>> {
        Ok(BTreeMap::from([
            ("psu".to_string(), 32.1),
            ("head".to_string(), 25.0),
        ]))
    }

    async fn get_extra_info(&self) -> Result<String> {
        Ok("Simulated laser".to_string())
    }
}

// =============================================================================
// MockCounter
// =============================================================================

/// Fluorescence counter following `I = I_sat * P / (P + P_sat)`.
///
/// The excitation power is read from the laser handed to
/// [`MockCounter::excited_by`]; without one the rate is `background`.
pub struct MockCounter {
    laser: Option<Arc<dyn SimpleLaser>>,
    saturation_rate: f64,
    saturation_power: f64,
    background: f64,
}

impl MockCounter {
    /// Counter with a 5 kc/s background and no excitation
    pub fn new() -> Self {
        Self {
            laser: None,
            saturation_rate: 400e3,
            saturation_power: 5e-3,
            background: 5e3,
        }
    }

    /// Derive the count rate from `laser`'s output power
    pub fn excited_by(mut self, laser: Arc<dyn SimpleLaser>) -> Self {
        self.laser = Some(laser);
        self
    }

    /// Override saturation rate (c/s) and saturation power (W)
    pub fn with_saturation(mut self, rate: f64, power: f64) -> Self {
        self.saturation_rate = rate;
        self.saturation_power = power;
        self
    }

    async fn rate(&self) -> Result<f64> {
        let power = match &self.laser {
            Some(laser) => laser.get_power().await?,
            None => 0.0,
        };
        Ok(self.background + self.saturation_rate * power / (power + self.saturation_power))
    }
}

impl Default for MockCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SlowCounter for MockCounter {
    async fn count_mean_std(&self, samples: usize) -> Result<(f64, f64)> {
        if samples == 0 {
            return Err(anyhow!("Need at least one sample"));
        }
        let rate = self.rate().await?;
        let spread = rate.sqrt();
        let values: Vec<f64> = {
            let mut rng = rand::thread_rng();
            (0..samples)
                .map(|_| rate + rng.gen_range(-spread..=spread))
                .collect()
        };
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Ok((mean, var.sqrt()))
    }
}

// =============================================================================
// MockPidController
// =============================================================================

#[derive(Debug, Clone)]
struct PidModel {
    kp: f64,
    ki: f64,
    kd: f64,
    setpoint: f64,
    manual: f64,
    enabled: bool,
    process: f64,
    output: f64,
}

/// Thermal stage that relaxes 10 % towards the setpoint per reading while
/// regulation is enabled.
pub struct MockPidController {
    model: StdMutex<PidModel>,
}

impl MockPidController {
    /// Stage at `temperature` K, setpoint equal to it, regulation off
    pub fn new(temperature: f64) -> Self {
        Self {
            model: StdMutex::new(PidModel {
                kp: 50.0,
                ki: 20.0,
                kd: 0.0,
                setpoint: temperature,
                manual: 0.0,
                enabled: false,
                process: temperature,
                output: 0.0,
            }),
        }
    }

    fn with_model<R>(&self, f: impl FnOnce(&mut PidModel) -> R) -> R {
        let mut model = self.model.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut model)
    }
}

impl Default for MockPidController {
    fn default() -> Self {
        Self::new(4.2)
    }
}

#[async_trait]
impl PidController for MockPidController {
    async fn get_kp(&self) -> Result<f64> {
        Ok(self.with_model(|m| m.kp))
    }
    async fn set_kp(&self, kp: f64) -> Result<()> {
        self.with_model(|m| m.kp = kp);
        Ok(())
    }
    async fn get_ki(&self) -> Result<f64> {
        Ok(self.with_model(|m| m.ki))
    }
    async fn set_ki(&self, ki: f64) -> Result<()> {
        self.with_model(|m| m.ki = ki);
        Ok(())
    }
    async fn get_kd(&self) -> Result<f64> {
        Ok(self.with_model(|m| m.kd))
    }
    async fn set_kd(&self, kd: f64) -> Result<()> {
        self.with_model(|m| m.kd = kd);
        Ok(())
    }
    async fn get_setpoint(&self) -> Result<f64> {
        Ok(self.with_model(|m| m.setpoint))
    }
    async fn set_setpoint(&self, setpoint: f64) -> Result<()> {
        self.with_model(|m| m.setpoint = setpoint);
        Ok(())
    }
    async fn get_manual_value(&self) -> Result<f64> {
        Ok(self.with_model(|m| m.manual))
    }
    async fn set_manual_value(&self, value: f64) -> Result<()> {
        self.with_model(|m| m.manual = value);
        Ok(())
    }
    async fn get_enabled(&self) -> Result<bool> {
        Ok(self.with_model(|m| m.enabled))
    }
    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.with_model(|m| m.enabled = enabled);
        Ok(())
    }
    async fn get_control_limit(&self) -> Result<Option<(f64, f64)>> {
        Ok(Some((0.0, 100.0)))
    }
    async fn set_control_limit(&self, _limit: (f64, f64)) -> Result<()> {
        Ok(())
    }
    async fn get_process_value(&self) -> Result<f64> {
        Ok(self.with_model(|m| {
            if m.enabled {
                let error = m.setpoint - m.process;
                m.process += 0.1 * error;
                m.output = (m.kp * error).clamp(0.0, 100.0);
            }
            m.process
        }))
    }
    fn get_process_unit(&self) -> (String, String) {
        ("K".to_string(), "Kelvin".to_string())
    }
    async fn get_control_value(&self) -> Result<f64> {
        Ok(self.with_model(|m| m.output))
    }
    fn get_control_unit(&self) -> (String, String) {
        ("%".to_string(), "percent".to_string())
    }
    async fn get_extra(&self) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_mock_stage_motion() {
        let stage = MockStage::new();
        stage.move_abs(10.0).await.unwrap();
        stage.move_rel(-2.5).await.unwrap();
        stage.wait_settled().await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 7.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_camera_single_and_sequence() {
        let camera = MockCamera::new(8, 4);
        assert!(camera.get_acquired_data().await.is_err());

        camera.set_exposure(0.01).await.unwrap();
        camera.start_single_acquisition().await.unwrap();
        let frame = camera.get_acquired_data().await.unwrap();
        assert_eq!((frame.width, frame.height), (8, 4));
        assert_eq!(frame.buffer.len(), 32);

        let frames = camera.get_sequence(3).await.unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(camera.get_frame_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_camera_live_mode() {
        let camera = MockCamera::new(4, 4);
        camera.set_exposure(0.05).await.unwrap();
        let mut frames = camera.subscribe_frames();

        camera.start_live_acquisition().await.unwrap();
        assert!(!camera.get_ready_state().await);
        assert!(camera.start_single_acquisition().await.is_err());
        assert!(camera.start_live_acquisition().await.is_err());

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.buffer.len(), 16);

        camera.stop_acquisition().await.unwrap();
        assert!(camera.get_ready_state().await);
    }

    #[tokio::test]
    async fn test_mock_laser_clamps_power() {
        let laser = MockLaser::new(0.1);
        assert_eq!(laser.set_power(0.5).await.unwrap(), 0.1);
        assert_eq!(laser.get_power().await.unwrap(), 0.0);
        laser.on().await.unwrap();
        assert_eq!(laser.get_power().await.unwrap(), 0.1);
        assert!(laser
            .set_control_mode(ControlMode::ModulationAnalog)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_mock_counter_saturates() {
        let laser: Arc<dyn SimpleLaser> = Arc::new(MockLaser::new(1.0));
        laser.on().await.unwrap();
        let counter = MockCounter::new().excited_by(Arc::clone(&laser));

        laser.set_power(1e-3).await.unwrap();
        let low = counter.rate().await.unwrap();
        laser.set_power(0.5).await.unwrap();
        let high = counter.rate().await.unwrap();
        assert!(high > low);
        assert!(high < 5e3 + 400e3);

        let (mean, std) = counter.count_mean_std(50).await.unwrap();
        assert!((mean - high).abs() < 2.0 * high.sqrt());
        assert!(std >= 0.0);
    }

    #[tokio::test]
    async fn test_mock_pid_converges() {
        let pid = MockPidController::new(10.0);
        pid.set_setpoint(4.0).await.unwrap();
        pid.set_enabled(true).await.unwrap();
        let mut pv = 0.0;
        for _ in 0..100 {
            pv = pid.get_process_value().await.unwrap();
        }
        assert!((pv - 4.0).abs() < 1e-3);
    }
}
