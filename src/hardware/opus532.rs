//! Laser Quantum Opus 532 driver
//!
//! Protocol Overview:
//! - Format: ASCII over RS-232, 19200 baud, CR terminated commands
//! - Replies carry a unit suffix (`100.000mW`, `25.3C`) and CRLF
//! - The controller needs time to answer; every exchange waits before
//!   collecting whatever arrived
//!
//! Only constant power operation is supported.

use crate::hardware::capabilities::{ControlMode, LaserState, ShutterState, SimpleLaser};
use crate::hardware::retry::retry_once;
use crate::hardware::transport::{InstrumentPort, PortOpener, PortSettings};
use crate::module::{Module, ModuleState, StateCell};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Lowest power the controller regulates, in W.
pub const MIN_POWER: f64 = 0.020;

/// Connection settings for [`Opus532`].
#[derive(Debug, Clone, Deserialize)]
pub struct Opus532Config {
    /// Serial resource
    #[serde(default = "default_resource")]
    pub resource: String,
    /// Maximum permitted power in W
    #[serde(default = "default_max_power")]
    pub max_power: f64,
    /// Wait before collecting a reply, in milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_resource() -> String {
    "COM4".to_string()
}

fn default_max_power() -> f64 {
    1.0
}

fn default_settle_ms() -> u64 {
    500
}

impl Default for Opus532Config {
    fn default() -> Self {
        Self {
            resource: default_resource(),
            max_power: default_max_power(),
            settle_ms: default_settle_ms(),
        }
    }
}

/// Strip a unit suffix and parse. Missing or malformed replies give NaN.
fn parse_with_unit(reply: &str, unit: &str) -> f64 {
    let value = reply.trim();
    value
        .strip_suffix(unit)
        .unwrap_or(value)
        .trim()
        .parse()
        .unwrap_or(f64::NAN)
}

/// Driver for the Opus 532 CW laser.
pub struct Opus532 {
    name: String,
    port: InstrumentPort,
    max_power: f64,
    settle: Duration,
    state: StateCell,
}

impl Opus532 {
    /// Driver talking through `opener`.
    pub fn new(name: &str, config: &Opus532Config, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            name: name.to_string(),
            port: InstrumentPort::new(name, opener).with_write_terminator("\r"),
            max_power: config.max_power,
            settle: Duration::from_millis(config.settle_ms),
            state: StateCell::new(),
        }
    }

    /// Driver for the configured serial port at 19200 baud.
    pub fn from_config(name: &str, config: Opus532Config) -> Result<Self> {
        let opener = PortSettings::opener(&config.resource, 19200)?;
        Ok(Self::new(name, &config, opener))
    }

    /// Send `text`, wait, return everything the laser sent back.
    async fn talk(&self, text: &str) -> Result<String> {
        retry_once(&self.port, text, || async move {
            let mut session = self.port.lock().await?;
            session.write_line(text).await?;
            session.read_available(self.settle).await
        })
        .await
    }
}

#[async_trait]
impl Module for Opus532 {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_activate(&self) -> Result<()> {
        self.port.connect().await?;
        self.talk("CONTROL=POWER").await?;
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
impl SimpleLaser for Opus532 {
    fn power_range(&self) -> (f64, f64) {
        (MIN_POWER, self.max_power)
    }

    async fn get_power(&self) -> Result<f64> {
        Ok(parse_with_unit(&self.talk("POWER?").await?, "mW") * 1e-3)
    }

    async fn get_power_setpoint(&self) -> Result<f64> {
        self.get_power().await
    }

    async fn set_power(&self, watts: f64) -> Result<f64> {
        let watts = if watts > self.max_power {
            warn!(
                laser = %self.name,
                requested = watts,
                max = self.max_power,
                "Power setpoint greater than max permissible power. Setting to minimum."
            );
            MIN_POWER
        } else {
            watts
        };
        let cmd = format!("POWER={}", watts * 1e3);
        self.talk(&cmd).await?;
        Ok(watts)
    }

    fn current_unit(&self) -> &str {
        ""
    }

    fn current_range(&self) -> (f64, f64) {
        (0.0, 100.0)
    }

    async fn get_current(&self) -> Result<f64> {
        Ok(0.0)
    }

    async fn get_current_setpoint(&self) -> Result<f64> {
        Ok(0.0)
    }

    async fn set_current(&self, _current: f64) -> Result<f64> {
        warn!(laser = %self.name, "Current control not available");
        Ok(0.0)
    }

    fn allowed_control_modes(&self) -> Vec<ControlMode> {
        vec![ControlMode::Power]
    }

    async fn get_control_mode(&self) -> Result<ControlMode> {
        Ok(ControlMode::Power)
    }

    async fn set_control_mode(&self, mode: ControlMode) -> Result<ControlMode> {
        if mode != ControlMode::Power {
            warn!(laser = %self.name, mode = ?mode, "Only power control is supported");
        }
        self.talk("CONTROL=POWER").await?;
        Ok(ControlMode::Power)
    }

    async fn on(&self) -> Result<LaserState> {
        self.talk("ON").await?;
        Ok(LaserState::On)
    }

    async fn off(&self) -> Result<LaserState> {
        self.talk("OFF").await?;
        Ok(LaserState::Off)
    }

    async fn get_laser_state(&self) -> Result<LaserState> {
        Ok(match self.talk("STATUS?").await?.trim() {
            "ENABLED" => LaserState::On,
            _ => LaserState::Off,
        })
    }

    async fn get_shutter_state(&self) -> Result<ShutterState> {
        Ok(ShutterState::Open)
    }

    async fn set_shutter_state(&self, _state: ShutterState) -> Result<ShutterState> {
        Ok(ShutterState::Open)
    }

    async fn get_temperatures(&self) -> Result<BTreeMap<String, f64>> {
        let laser = parse_with_unit(&self.talk("LASTEMP?").await?, "C");
        let psu = parse_with_unit(&self.talk("PSUTEMP?").await?, "C");
        Ok(BTreeMap::from([
            ("laser_temp_celsius".to_string(), laser),
            ("psu_temp_celsius".to_string(), psu),
        ]))
    }

    async fn get_extra_info(&self) -> Result<String> {
        self.talk("TIMERS?").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{ScriptedDevice, SimulatedOpener};
    use tracing_test::traced_test;

    fn opus(device: ScriptedDevice) -> (Opus532, SimulatedOpener<ScriptedDevice>) {
        let opener = SimulatedOpener::new(device, b'\r');
        let config = Opus532Config {
            settle_ms: 5,
            ..Default::default()
        };
        (Opus532::new("opus", &config, Arc::new(opener.clone())), opener)
    }

    #[test]
    fn unit_suffix_parsing() {
        assert_eq!(parse_with_unit("100.000mW\r\n", "mW"), 100.0);
        assert_eq!(parse_with_unit("25.3C\r\n", "C"), 25.3);
        assert!(parse_with_unit("", "mW").is_nan());
    }

    #[tokio::test]
    async fn power_in_watts() {
        let (laser, _) = opus(ScriptedDevice::new().reply("POWER?", "250.000mW\r\n"));
        laser.port.connect().await.unwrap();
        assert!((laser.get_power().await.unwrap() - 0.25).abs() < 1e-12);
    }

    #[tokio::test]
    #[traced_test]
    async fn excessive_power_falls_back_to_minimum() {
        let (laser, opener) = opus(ScriptedDevice::new().fallback(|_| Some("\r\n".into())));
        laser.port.connect().await.unwrap();

        assert_eq!(laser.set_power(2.0).await.unwrap(), MIN_POWER);
        assert!(logs_contain("greater than max permissible power"));
        let sent = opener.with_model(|d| d.commands().to_vec());
        assert_eq!(sent, vec!["POWER=20"]);
    }

    #[tokio::test]
    async fn activation_selects_power_control() {
        let (laser, opener) = opus(ScriptedDevice::new().fallback(|_| Some("\r\n".into())));
        laser.on_activate().await.unwrap();
        assert_eq!(
            opener.with_model(|d| d.commands().to_vec()),
            vec!["CONTROL=POWER"]
        );
    }

    #[tokio::test]
    async fn status_and_temperatures() {
        let device = ScriptedDevice::new()
            .reply("STATUS?", "ENABLED\r\n")
            .reply("LASTEMP?", "24.9C\r\n")
            .reply("PSUTEMP?", "30.5C\r\n");
        let (laser, _) = opus(device);
        laser.port.connect().await.unwrap();

        assert_eq!(laser.get_laser_state().await.unwrap(), LaserState::On);
        let temps = laser.get_temperatures().await.unwrap();
        assert_eq!(temps["laser_temp_celsius"], 24.9);
        assert_eq!(temps["psu_temp_celsius"], 30.5);
    }
}
