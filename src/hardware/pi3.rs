//! Pi3 stepper motor controller
//!
//! Protocol Overview:
//! - Serial 57600 baud 8N1, commands terminated with LF
//! - Every command is acknowledged with a single ACK byte (0x06); the command
//!   is resent until the ACK arrives, at most 10 times
//! - Queries send their reply line after the ACK
//! - Motors are numbered 0..=3 and addressed as axes `phi`, `x`, `y`, `z`
//!
//! Positions are exchanged in the configured [`StepUnit`].

use crate::error::DaqError;
use crate::hardware::capabilities::{Motor, MotorAxisConstraints};
use crate::hardware::transport::{InstrumentPort, PortOpener, PortSettings};
use crate::module::{Module, ModuleState, StateCell};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

const ACK: u8 = 0x06;
const MAX_SEND_TRIES: usize = 10;
const AXES: [&str; 4] = ["phi", "x", "y", "z"];

/// Unit of a position argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepUnit {
    /// Motor steps, integer only
    Steps,
    /// Degrees
    Deg,
    /// Multiples of pi
    Pi,
}

impl StepUnit {
    fn as_str(self) -> &'static str {
        match self {
            StepUnit::Steps => "steps",
            StepUnit::Deg => "deg",
            StepUnit::Pi => "pi",
        }
    }
}

/// Direction of a constant-speed rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    /// Clockwise
    Cw,
    /// Counter-clockwise
    Ccw,
    /// Stop rotating
    Stop,
}

impl Rotation {
    fn as_str(self) -> &'static str {
        match self {
            Rotation::Cw => "CW",
            Rotation::Ccw => "CCW",
            Rotation::Stop => "STOP",
        }
    }
}

/// Settings for [`Pi3Motor`].
#[derive(Debug, Clone, Deserialize)]
pub struct Pi3Config {
    /// Serial port
    #[serde(default = "default_com")]
    pub com: String,
    /// Unit used for moves and position readback
    #[serde(default = "default_unit")]
    pub unit: StepUnit,
    /// Reply timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Pause after opening the port
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_com() -> String {
    "COM5".to_string()
}

fn default_unit() -> StepUnit {
    StepUnit::Deg
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_settle_ms() -> u64 {
    500
}

impl Default for Pi3Config {
    fn default() -> Self {
        Self {
            com: default_com(),
            unit: default_unit(),
            timeout_ms: default_timeout_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

fn motor_number(axis: &str) -> Result<u8> {
    AXES.iter()
        .position(|a| *a == axis)
        .map(|m| m as u8)
        .ok_or_else(|| DaqError::InvalidArgument(format!("unknown axis '{}'", axis)).into())
}

fn check_motor(motor: u8) -> Result<()> {
    if motor > 3 {
        return Err(DaqError::InvalidArgument(format!("maximum motor is 3, got {}", motor)).into());
    }
    Ok(())
}

fn invalid(message: &str) -> anyhow::Error {
    DaqError::InvalidArgument(message.to_string()).into()
}

/// Driver for a Pi3 controller with up to four motors.
pub struct Pi3Motor {
    name: String,
    port: InstrumentPort,
    unit: StepUnit,
    settle: Duration,
    velocities: RwLock<BTreeMap<String, f64>>,
    state: StateCell,
}

impl Pi3Motor {
    /// Driver talking through `opener`.
    pub fn new(name: &str, config: &Pi3Config, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            name: name.to_string(),
            port: InstrumentPort::new(name, opener)
                .with_timeout(Duration::from_millis(config.timeout_ms)),
            unit: config.unit,
            settle: Duration::from_millis(config.settle_ms),
            velocities: RwLock::new(BTreeMap::new()),
            state: StateCell::new(),
        }
    }

    /// Driver for the configured serial port.
    pub fn from_config(name: &str, config: Pi3Config) -> Result<Self> {
        let opener = PortSettings::opener(&config.com, 57600)?;
        Ok(Self::new(name, &config, opener))
    }

    /// Send `command` until it is acknowledged, then read a reply line if
    /// `reply` is set.
    async fn transact(&self, command: &str, reply: bool) -> Result<Option<String>> {
        let mut session = self.port.lock().await?;
        let mut acknowledged = false;
        for attempt in 1..=MAX_SEND_TRIES {
            session.write_line(command).await?;
            let byte = session.read_byte().await?;
            if byte == ACK {
                acknowledged = true;
                break;
            }
            debug!(device = %self.name, command, attempt, byte, "No ACK, resending");
        }
        if !acknowledged {
            error!(device = %self.name, command, "Unable to send command");
            return Err(DaqError::Instrument(format!("{}: no ACK for '{}'", self.name, command)).into());
        }
        if reply {
            Ok(Some(session.read_line().await?))
        } else {
            Ok(None)
        }
    }

    async fn send(&self, command: &str) -> Result<()> {
        self.transact(command, false).await.map(|_| ())
    }

    async fn ask(&self, query: &str) -> Result<String> {
        self.transact(query, true)
            .await?
            .ok_or_else(|| DaqError::Instrument(format!("no reply to '{}'", query)).into())
    }

    async fn ask_parsed<T>(&self, query: &str) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        let reply = self.ask(query).await?;
        reply
            .trim()
            .parse()
            .with_context(|| format!("cannot parse reply '{}' to '{}'", reply, query))
    }

    fn format_position(&self, position: f64) -> Result<String> {
        if self.unit == StepUnit::Steps {
            if position.fract() != 0.0 {
                return Err(invalid("unit is steps, so the position must be an integer"));
            }
            Ok(format!("{}", position as i64))
        } else {
            Ok(format!("{}", position))
        }
    }

    fn axes_or_all(axes: &[String]) -> Vec<String> {
        if axes.is_empty() {
            vec![AXES[0].to_string()]
        } else {
            axes.to_vec()
        }
    }

    /// Stop all motors and reset the controller.
    pub async fn reset(&self) -> Result<()> {
        self.send("STOPALL").await?;
        self.send("*RST").await
    }

    /// Controller identification string.
    pub async fn get_idn(&self) -> Result<String> {
        self.ask("*IDN?").await
    }

    /// Store a new identification string (1 to 20 characters).
    pub async fn set_idn(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(invalid("IDN too short, min 1 character"));
        }
        if id.chars().count() > 20 {
            return Err(invalid("IDN too long, max 20 characters"));
        }
        self.send(&format!("*IDN {}", id)).await
    }

    /// Run to the optical zero of `motor`.
    pub async fn zero_motor(&self, motor: u8) -> Result<()> {
        check_motor(motor)?;
        self.send(&format!("ZERORUN {}", motor)).await
    }

    /// Energise or release `motor`.
    pub async fn enable_motor(&self, motor: u8, on: bool) -> Result<()> {
        check_motor(motor)?;
        self.send(&format!("ENABLE {} {}", motor, if on { 1 } else { 0 })).await
    }

    /// Raw value of analog input `channel`.
    pub async fn get_analog_value(&self, channel: u8) -> Result<i32> {
        check_motor(channel)?;
        self.ask_parsed(&format!("GETANALOG {}", channel)).await
    }

    /// Optical zero position in steps.
    pub async fn get_optical_zero_position(&self, motor: u8) -> Result<i64> {
        check_motor(motor)?;
        self.ask_parsed(&format!("GETOPTZEROPOS {}", motor)).await
    }

    /// Set the optical zero position in steps.
    pub async fn set_optical_zero_position(&self, motor: u8, position: i64) -> Result<()> {
        check_motor(motor)?;
        self.send(&format!("SETOPTZEROPOS {} {}", motor, position)).await
    }

    /// Gear ratio between motor and stage.
    pub async fn get_gear_ratio(&self, motor: u8) -> Result<f64> {
        check_motor(motor)?;
        self.ask_parsed(&format!("GETGEARRATIO {}", motor)).await
    }

    /// Set the gear ratio; `None` restores 60/18.
    pub async fn set_gear_ratio(&self, motor: u8, ratio: Option<f64>) -> Result<()> {
        check_motor(motor)?;
        let ratio = ratio.unwrap_or(60.0 / 18.0);
        self.send(&format!("SETGEARRATIO {} {}", motor, ratio)).await
    }

    /// Full steps per motor revolution.
    pub async fn get_steps_per_full_rotation(&self, motor: u8) -> Result<u32> {
        check_motor(motor)?;
        self.ask_parsed(&format!("GETFULLROT {}", motor)).await
    }

    /// Set full steps per revolution (200 or 400).
    pub async fn set_steps_per_full_rotation(&self, motor: u8, steps: u32) -> Result<()> {
        if steps != 200 && steps != 400 {
            return Err(invalid("steps must be either 200 or 400"));
        }
        check_motor(motor)?;
        self.send(&format!("SETFULLROT {} {}", motor, steps)).await
    }

    /// Microsteps per full step.
    pub async fn get_substeps(&self, motor: u8) -> Result<u32> {
        check_motor(motor)?;
        self.ask_parsed(&format!("GETSUBSTEPS {}", motor)).await
    }

    /// Set microsteps per full step (power of two, 1 to 16).
    pub async fn set_substeps(&self, motor: u8, substeps: u32) -> Result<()> {
        if !substeps.is_power_of_two() || substeps > 16 {
            return Err(invalid("substeps must be a power of two between 1 and 16"));
        }
        check_motor(motor)?;
        self.send(&format!("SETSUBSTEPS {} {}", motor, substeps)).await
    }

    /// Wait time between steps.
    pub async fn get_wait_time(&self, motor: u8) -> Result<u32> {
        check_motor(motor)?;
        self.ask_parsed(&format!("GETWAITTIME {}", motor)).await
    }

    /// Set the wait time between steps (at least 1).
    pub async fn set_wait_time(&self, motor: u8, wait_time: u32) -> Result<()> {
        if wait_time < 1 {
            return Err(invalid("waittime must be >= 1"));
        }
        check_motor(motor)?;
        self.send(&format!("SETWAITTIME {} {}", motor, wait_time)).await
    }

    /// Rotate continuously, one revolution per `seconds` (at least 5 s).
    pub async fn set_const_angular_velocity(
        &self,
        motor: u8,
        direction: Rotation,
        seconds: f64,
    ) -> Result<()> {
        if seconds < 5.0 {
            return Err(invalid("time must be >= 5.0 seconds"));
        }
        check_motor(motor)?;
        self.send(&format!("SETCONSTSPEED {} {} {}", motor, direction.as_str(), seconds))
            .await
    }

    /// Restore factory defaults.
    pub async fn factory_reset(&self) -> Result<()> {
        warn!(device = %self.name, "Factory reset");
        self.send("FACTORYRESET").await
    }
}

#[async_trait]
impl Module for Pi3Motor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_activate(&self) -> Result<()> {
        self.port.connect().await?;
        tokio::time::sleep(self.settle).await;
        info!(device = %self.name, "Pi3 motor controller connected");
        self.state.set(ModuleState::Idle);
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        self.port.disconnect().await;
        self.state.set(ModuleState::Deactivated);
        Ok(())
    }

    fn state(&self) -> ModuleState {
        self.state.get()
    }
}

#[async_trait]
impl Motor for Pi3Motor {
    fn get_constraints(&self) -> BTreeMap<String, MotorAxisConstraints> {
        let phi = MotorAxisConstraints {
            label: "phi".to_string(),
            unit: "degree".to_string(),
            pos_min: 0.0,
            pos_max: 360.0,
            pos_step: 1.0,
            vel_min: 1.0,
            vel_max: 20.0,
        };
        BTreeMap::from([(phi.label.clone(), phi)])
    }

    async fn move_rel(&self, moves: &BTreeMap<String, f64>) -> Result<()> {
        for (axis, delta) in moves {
            let motor = motor_number(axis)?;
            let position = self.format_position(*delta)?;
            self.send(&format!("MOVEREL {} {} {}", motor, position, self.unit.as_str()))
                .await?;
        }
        Ok(())
    }

    async fn move_abs(&self, moves: &BTreeMap<String, f64>) -> Result<()> {
        for (axis, target) in moves {
            let motor = motor_number(axis)?;
            if *target < 0.0 {
                return Err(invalid("position must be a positive value"));
            }
            let position = self.format_position(*target)?;
            self.send(&format!("MOVEABS {} {} {}", motor, position, self.unit.as_str()))
                .await?;
        }
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.send("STOPALL").await
    }

    async fn get_pos(&self, axes: &[String]) -> Result<BTreeMap<String, f64>> {
        let mut positions = BTreeMap::new();
        for axis in Self::axes_or_all(axes) {
            let motor = motor_number(&axis)?;
            let value = self
                .ask_parsed(&format!("GETPOS {} {}", motor, self.unit.as_str()))
                .await?;
            positions.insert(axis, value);
        }
        Ok(positions)
    }

    async fn get_status(&self, axes: &[String]) -> Result<BTreeMap<String, i32>> {
        let mut status = BTreeMap::new();
        for axis in Self::axes_or_all(axes) {
            let motor = motor_number(&axis)?;
            let moving = self.ask(&format!("ISMOVING {}", motor)).await? == "1";
            status.insert(axis, i32::from(moving));
        }
        Ok(status)
    }

    async fn calibrate(&self, axes: &[String]) -> Result<()> {
        for axis in Self::axes_or_all(axes) {
            self.zero_motor(motor_number(&axis)?).await?;
        }
        Ok(())
    }

    async fn get_velocity(&self, axes: &[String]) -> Result<BTreeMap<String, f64>> {
        let stored = self.velocities.read().await;
        let constraints = self.get_constraints();
        let mut velocities = BTreeMap::new();
        for axis in Self::axes_or_all(axes) {
            motor_number(&axis)?;
            let default = constraints.get(&axis).map(|c| c.vel_min).unwrap_or(1.0);
            velocities.insert(axis.clone(), stored.get(&axis).copied().unwrap_or(default));
        }
        Ok(velocities)
    }

    async fn set_velocity(&self, velocities: &BTreeMap<String, f64>) -> Result<()> {
        let constraints = self.get_constraints();
        let mut stored = self.velocities.write().await;
        for (axis, velocity) in velocities {
            motor_number(axis)?;
            if let Some(c) = constraints.get(axis) {
                if *velocity < c.vel_min || *velocity > c.vel_max {
                    return Err(DaqError::out_of_range("velocity", *velocity, c.vel_min, c.vel_max).into());
                }
            }
            stored.insert(axis.clone(), *velocity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{LineDevice, SimulatedOpener};

    #[derive(Default)]
    struct Pi3Model {
        log: Vec<String>,
        positions: [f64; 4],
        moving: [bool; 4],
        nak_budget: usize,
        idn: String,
    }

    impl LineDevice for Pi3Model {
        fn handle(&mut self, command: &str) -> Vec<u8> {
            self.log.push(command.to_string());
            if self.nak_budget > 0 {
                self.nak_budget -= 1;
                return vec![0x15];
            }
            let parts: Vec<&str> = command.split_whitespace().collect();
            let motor = |i: usize| -> usize { parts.get(i).and_then(|p| p.parse().ok()).unwrap_or(0) };
            let reply = match parts.first().copied().unwrap_or_default() {
                "MOVEREL" => {
                    self.positions[motor(1)] += parts[2].parse::<f64>().unwrap_or(0.0);
                    self.moving[motor(1)] = true;
                    None
                }
                "MOVEABS" => {
                    self.positions[motor(1)] = parts[2].parse().unwrap_or(0.0);
                    None
                }
                "STOPALL" => {
                    self.moving = [false; 4];
                    None
                }
                "GETPOS" => Some(self.positions[motor(1)].to_string()),
                "ISMOVING" => Some(if self.moving[motor(1)] { "1" } else { "0" }.to_string()),
                "*IDN?" => Some(self.idn.clone()),
                "*IDN" => {
                    self.idn = parts[1..].join(" ");
                    None
                }
                "GETGEARRATIO" => Some("3.3333".to_string()),
                "GETSUBSTEPS" => Some("4".to_string()),
                _ => None,
            };
            let mut out = vec![ACK];
            if let Some(reply) = reply {
                out.extend_from_slice(format!("{}\n", reply).as_bytes());
            }
            out
        }
    }

    async fn motor(unit: StepUnit) -> (Pi3Motor, SimulatedOpener<Pi3Model>) {
        let opener = SimulatedOpener::new(Pi3Model::default(), b'\n');
        let config = Pi3Config {
            unit,
            timeout_ms: 50,
            settle_ms: 0,
            ..Default::default()
        };
        let motor = Pi3Motor::new("pi3", &config, Arc::new(opener.clone()));
        motor.on_activate().await.unwrap();
        (motor, opener)
    }

    fn axis(name: &str, value: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([(name.to_string(), value)])
    }

    #[tokio::test]
    async fn moves_and_reads_position() {
        let (motor, opener) = motor(StepUnit::Deg).await;
        motor.move_abs(&axis("phi", 90.0)).await.unwrap();
        motor.move_rel(&axis("phi", 45.5)).await.unwrap();
        let pos = motor.get_pos(&[]).await.unwrap();
        assert_eq!(pos["phi"], 135.5);

        let log = opener.with_model(|m| m.log.clone());
        assert_eq!(log[0], "MOVEABS 0 90 deg");
        assert_eq!(log[1], "MOVEREL 0 45.5 deg");
        assert_eq!(log[2], "GETPOS 0 deg");
    }

    #[tokio::test]
    async fn status_and_abort() {
        let (motor, _) = motor(StepUnit::Deg).await;
        motor.move_rel(&axis("x", 1.0)).await.unwrap();
        let axes = vec!["x".to_string()];
        assert_eq!(motor.get_status(&axes).await.unwrap()["x"], 1);
        motor.abort().await.unwrap();
        assert_eq!(motor.get_status(&axes).await.unwrap()["x"], 0);
    }

    #[tokio::test]
    async fn step_moves_must_be_whole() {
        let (motor, opener) = motor(StepUnit::Steps).await;
        assert!(motor.move_rel(&axis("phi", 1.5)).await.is_err());
        motor.move_rel(&axis("phi", 200.0)).await.unwrap();
        assert_eq!(opener.with_model(|m| m.log.clone()), vec!["MOVEREL 0 200 steps"]);
    }

    #[tokio::test]
    async fn rejects_bad_targets() {
        let (motor, opener) = motor(StepUnit::Deg).await;
        assert!(motor.move_abs(&axis("phi", -1.0)).await.is_err());
        assert!(motor.move_abs(&axis("theta", 1.0)).await.is_err());
        assert!(motor.set_substeps(0, 3).await.is_err());
        assert!(motor.set_substeps(0, 32).await.is_err());
        assert!(motor.set_steps_per_full_rotation(0, 300).await.is_err());
        assert!(motor.set_const_angular_velocity(0, Rotation::Cw, 4.0).await.is_err());
        assert!(motor.set_idn("").await.is_err());
        assert!(motor.set_idn("abcdefghijklmnopqrstu").await.is_err());
        assert!(motor.zero_motor(4).await.is_err());
        assert!(opener.with_model(|m| m.log.is_empty()));
    }

    #[tokio::test]
    async fn resends_until_acknowledged() {
        let (motor, opener) = motor(StepUnit::Deg).await;
        opener.with_model(|m| m.nak_budget = 3);
        motor.abort().await.unwrap();
        assert_eq!(opener.with_model(|m| m.log.len()), 4);

        opener.with_model(|m| m.nak_budget = 20);
        assert!(motor.abort().await.is_err());
    }

    #[tokio::test]
    async fn drive_parameters() {
        let (motor, opener) = motor(StepUnit::Deg).await;
        motor.set_idn("rotator").await.unwrap();
        assert_eq!(motor.get_idn().await.unwrap(), "rotator");
        assert_eq!(motor.get_substeps(0).await.unwrap(), 4);
        assert!((motor.get_gear_ratio(0).await.unwrap() - 3.3333).abs() < 1e-9);
        motor.set_substeps(0, 8).await.unwrap();
        motor.set_const_angular_velocity(0, Rotation::Ccw, 10.0).await.unwrap();
        let log = opener.with_model(|m| m.log.clone());
        assert!(log.contains(&"SETSUBSTEPS 0 8".to_string()));
        assert!(log.contains(&"SETCONSTSPEED 0 CCW 10".to_string()));
    }

    #[tokio::test]
    async fn velocity_respects_constraints() {
        let (motor, _) = motor(StepUnit::Deg).await;
        assert!(motor.set_velocity(&axis("phi", 25.0)).await.is_err());
        motor.set_velocity(&axis("phi", 12.0)).await.unwrap();
        assert_eq!(motor.get_velocity(&[]).await.unwrap()["phi"], 12.0);
    }
}
