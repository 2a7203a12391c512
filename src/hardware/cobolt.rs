//! Cobolt 06-01 MLD diode laser driver
//!
//! Protocol Overview:
//! - Format: ASCII command/response over RS-232 (USB virtual COM)
//! - Terminator: CR on write, CRLF on read
//! - Every command is answered, setters with `OK`
//! - Queries: `l?` (emission), `p?` (power setpoint, W), `pa?` (output power, W),
//!   `i?` (current, %), `ilk?` (interlock), `hrs?` (operating hours)
//! - Commands: `l1`/`l0`, `p <W>`, `slc <%>`, `cp`/`ci`, `@cob1` (restart),
//!   `@cobas <0|1>` (autostart)
//!
//! # Example Usage
//!
//! ```no_run
//! use daq_modules::hardware::cobolt::{Cobolt06Mld, CoboltConfig};
//! use daq_modules::hardware::capabilities::SimpleLaser;
//! use daq_modules::module::Module;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let laser = Cobolt06Mld::from_config("cobolt", CoboltConfig::default())?;
//!     laser.on_activate().await?;
//!     laser.set_power(0.010).await?;
//!     laser.on().await?;
//!     println!("Output: {:.4} W", laser.get_power().await?);
//!     Ok(())
//! }
//! ```

use crate::error::DaqError;
use crate::hardware::capabilities::{ControlMode, LaserState, ShutterState, SimpleLaser};
use crate::hardware::retry::retry_once;
use crate::hardware::transport::{InstrumentPort, PortOpener, PortSettings};
use crate::module::{Module, ModuleState, StateCell};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Settable output power in W.
pub const POWER_RANGE: (f64, f64) = (0.0, 0.080);

/// Settable drive current in % of maximum.
pub const CURRENT_RANGE: (f64, f64) = (0.0, 100.0);

/// Connection settings for [`Cobolt06Mld`].
#[derive(Debug, Clone, Deserialize)]
pub struct CoboltConfig {
    /// Serial resource
    #[serde(default = "default_resource")]
    pub resource: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Reply timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_resource() -> String {
    "ASRL3::INSTR".to_string()
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_timeout_ms() -> u64 {
    1000
}

impl Default for CoboltConfig {
    fn default() -> Self {
        Self {
            resource: default_resource(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Driver for the Cobolt 06-01 MLD laser
///
/// Control mode and shutter are tracked in software; the head has no
/// shutter of its own.
pub struct Cobolt06Mld {
    name: String,
    port: InstrumentPort,
    state: StateCell,
    mode: RwLock<ControlMode>,
    shutter: RwLock<ShutterState>,
}

impl Cobolt06Mld {
    /// Driver talking through `opener`.
    pub fn new(name: &str, config: &CoboltConfig, opener: Arc<dyn PortOpener>) -> Self {
        let port = InstrumentPort::new(name, opener)
            .with_write_terminator("\r")
            .with_timeout(Duration::from_millis(config.timeout_ms));
        Self {
            name: name.to_string(),
            port,
            state: StateCell::new(),
            mode: RwLock::new(ControlMode::Power),
            shutter: RwLock::new(ShutterState::Closed),
        }
    }

    /// Driver for the configured serial resource.
    pub fn from_config(name: &str, config: CoboltConfig) -> Result<Self> {
        let opener = PortSettings::opener(&config.resource, config.baud_rate)?;
        Ok(Self::new(name, &config, opener))
    }

    async fn ask(&self, command: &str) -> Result<String> {
        retry_once(&self.port, command, || self.port.query(command)).await
    }

    async fn ask_f64(&self, command: &str) -> Result<f64> {
        let reply = self.ask(command).await?;
        reply
            .parse::<f64>()
            .with_context(|| format!("{}: cannot parse '{}' as number", command, reply))
    }

    async fn command(&self, command: &str) -> Result<()> {
        retry_once(&self.port, command, || async move {
            let reply = self.port.query(command).await?;
            if reply.eq_ignore_ascii_case("OK") {
                Ok(())
            } else {
                Err(DaqError::Instrument(format!("'{}' answered '{}'", command, reply)).into())
            }
        })
        .await
    }

    /// Interlock open.
    pub async fn get_interlock(&self) -> Result<bool> {
        Ok(self.ask_f64("ilk?").await? as i64 != 0)
    }

    /// Operating hours of the head.
    pub async fn get_operating_hours(&self) -> Result<f64> {
        self.ask_f64("hrs?").await
    }

    /// Laser output power.
    pub async fn get_output_power(&self) -> Result<f64> {
        self.ask_f64("pa?").await
    }

    /// Autostart on power-up.
    pub async fn get_autostart(&self) -> Result<bool> {
        Ok(self.ask_f64("@cobas?").await? as i64 != 0)
    }

    /// Enable or disable autostart.
    pub async fn set_autostart(&self, enabled: bool) -> Result<()> {
        let cmd = format!("@cobas {}", u8::from(enabled));
        self.command(&cmd).await
    }

    /// Restart the laser after an interlock or fault.
    pub async fn restart(&self) -> Result<()> {
        self.command("@cob1").await
    }

    /// Raw operating mode word.
    pub async fn get_operating_mode(&self) -> Result<String> {
        self.ask("gom?").await
    }
}

#[async_trait]
impl Module for Cobolt06Mld {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_activate(&self) -> Result<()> {
        self.port.connect().await?;
        self.set_autostart(false).await?;
        *self.shutter.write().await = ShutterState::Closed;
        *self.mode.write().await = ControlMode::Power;
        self.state.set(ModuleState::Idle);
        info!(laser = %self.name, "Cobolt laser ready");
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
impl SimpleLaser for Cobolt06Mld {
    fn power_range(&self) -> (f64, f64) {
        POWER_RANGE
    }

    async fn get_power(&self) -> Result<f64> {
        self.get_output_power().await
    }

    async fn get_power_setpoint(&self) -> Result<f64> {
        self.ask_f64("p?").await
    }

    async fn set_power(&self, watts: f64) -> Result<f64> {
        let (min, max) = POWER_RANGE;
        if !(min..=max).contains(&watts) {
            return Err(DaqError::out_of_range("power", watts, min, max).into());
        }
        let cmd = format!("p {}", watts);
        self.command(&cmd).await?;
        self.get_power_setpoint().await
    }

    fn current_unit(&self) -> &str {
        "%"
    }

    fn current_range(&self) -> (f64, f64) {
        CURRENT_RANGE
    }

    async fn get_current(&self) -> Result<f64> {
        self.ask_f64("i?").await
    }

    async fn get_current_setpoint(&self) -> Result<f64> {
        self.ask_f64("i?").await
    }

    async fn set_current(&self, current: f64) -> Result<f64> {
        let (min, max) = CURRENT_RANGE;
        if !(min..=max).contains(&current) {
            return Err(DaqError::out_of_range("current", current, min, max).into());
        }
        let cmd = format!("slc {}", current);
        self.command(&cmd).await?;
        self.get_current().await
    }

    fn allowed_control_modes(&self) -> Vec<ControlMode> {
        vec![ControlMode::Power, ControlMode::Current]
    }

    async fn get_control_mode(&self) -> Result<ControlMode> {
        Ok(*self.mode.read().await)
    }

    async fn set_control_mode(&self, mode: ControlMode) -> Result<ControlMode> {
        let cmd = match mode {
            ControlMode::Power => "cp",
            ControlMode::Current => "ci",
            other => {
                warn!(laser = %self.name, mode = ?other, "Control mode not supported");
                return Ok(*self.mode.read().await);
            }
        };
        self.command(cmd).await?;
        *self.mode.write().await = mode;
        Ok(mode)
    }

    async fn on(&self) -> Result<LaserState> {
        self.command("l1").await?;
        self.get_laser_state().await
    }

    async fn off(&self) -> Result<LaserState> {
        self.command("l0").await?;
        self.get_laser_state().await
    }

    async fn get_laser_state(&self) -> Result<LaserState> {
        let reply = self.ask("l?").await?;
        match reply.as_str() {
            "1" => Ok(LaserState::On),
            "0" if self.get_interlock().await? => Ok(LaserState::Locked),
            "0" => Ok(LaserState::Off),
            other => Err(DaqError::Instrument(format!("unexpected laser state '{}'", other)).into()),
        }
    }

    async fn get_shutter_state(&self) -> Result<ShutterState> {
        Ok(*self.shutter.read().await)
    }

    async fn set_shutter_state(&self, state: ShutterState) -> Result<ShutterState> {
        *self.shutter.write().await = state;
        Ok(state)
    }

    async fn get_temperatures(&self) -> Result<BTreeMap<String, f64>> {
        let head = self.ask_f64("rtemp?").await?;
        let psu = self.ask_f64("rbpt?").await?;
        Ok(BTreeMap::from([
            ("head".to_string(), head),
            ("psu".to_string(), psu),
        ]))
    }

    async fn get_extra_info(&self) -> Result<String> {
        let hours = self.get_operating_hours().await?;
        let mode = self.get_operating_mode().await?;
        Ok(format!(
            "Cobolt 06-01 MLD\noperating hours: {}\noperating mode: {}",
            hours, mode
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{LineDevice, SimulatedOpener};

    #[derive(Default)]
    struct CoboltModel {
        emitting: bool,
        power: f64,
        current: f64,
        autostart: bool,
        interlock_open: bool,
        log: Vec<String>,
    }

    impl LineDevice for CoboltModel {
        fn handle(&mut self, command: &str) -> Vec<u8> {
            self.log.push(command.to_string());
            let reply = match command {
                "l?" => u8::from(self.emitting).to_string(),
                "l1" => {
                    self.emitting = !self.interlock_open;
                    "OK".into()
                }
                "l0" => {
                    self.emitting = false;
                    "OK".into()
                }
                "p?" => self.power.to_string(),
                "pa?" => (if self.emitting { self.power } else { 0.0 }).to_string(),
                "i?" => self.current.to_string(),
                "ilk?" => u8::from(self.interlock_open).to_string(),
                "@cobas?" => u8::from(self.autostart).to_string(),
                "rtemp?" => "25.1".into(),
                "rbpt?" => "28.4".into(),
                "cp" | "ci" | "@cob1" => "OK".into(),
                cmd => {
                    if let Some(v) = cmd.strip_prefix("p ") {
                        self.power = v.parse().unwrap_or(0.0);
                    } else if let Some(v) = cmd.strip_prefix("slc ") {
                        self.current = v.parse().unwrap_or(0.0);
                    } else if let Some(v) = cmd.strip_prefix("@cobas ") {
                        self.autostart = v == "1";
                    } else {
                        return b"Syntax error: illegal command\r\n".to_vec();
                    }
                    "OK".into()
                }
            };
            format!("{}\r\n", reply).into_bytes()
        }
    }

    async fn laser(model: CoboltModel) -> (Cobolt06Mld, SimulatedOpener<CoboltModel>) {
        let opener = SimulatedOpener::new(model, b'\r');
        let config = CoboltConfig {
            timeout_ms: 50,
            ..Default::default()
        };
        let laser = Cobolt06Mld::new("cobolt", &config, Arc::new(opener.clone()));
        laser.on_activate().await.unwrap();
        (laser, opener)
    }

    #[tokio::test]
    async fn activation_disables_autostart() {
        let (laser, opener) = laser(CoboltModel {
            autostart: true,
            ..Default::default()
        })
        .await;
        assert_eq!(laser.state(), ModuleState::Idle);
        assert!(!laser.get_autostart().await.unwrap());
        assert_eq!(opener.with_model(|m| m.log[0].clone()), "@cobas 0");
    }

    #[tokio::test]
    async fn power_setpoint_is_read_back() {
        let (laser, _) = laser(CoboltModel::default()).await;
        assert_eq!(laser.set_power(0.025).await.unwrap(), 0.025);
        assert_eq!(laser.get_power().await.unwrap(), 0.0);

        assert_eq!(laser.on().await.unwrap(), LaserState::On);
        assert_eq!(laser.get_power().await.unwrap(), 0.025);
        assert_eq!(laser.off().await.unwrap(), LaserState::Off);
    }

    #[tokio::test]
    async fn out_of_range_power_never_reaches_device() {
        let (laser, opener) = laser(CoboltModel::default()).await;
        let err = laser.set_power(0.5).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DaqError>(),
            Some(DaqError::OutOfRange { .. })
        ));
        assert!(opener.with_model(|m| !m.log.iter().any(|c| c.starts_with("p "))));
    }

    #[tokio::test]
    async fn interlock_reports_locked() {
        let (laser, _) = laser(CoboltModel {
            interlock_open: true,
            ..Default::default()
        })
        .await;
        assert_eq!(laser.on().await.unwrap(), LaserState::Locked);
    }

    #[tokio::test]
    async fn interlock_polarity() {
        let (closed, _) = laser(CoboltModel::default()).await;
        assert!(!closed.get_interlock().await.unwrap());
        assert_eq!(closed.get_laser_state().await.unwrap(), LaserState::Off);

        let (open, opener) = laser(CoboltModel {
            interlock_open: true,
            ..Default::default()
        })
        .await;
        assert!(open.get_interlock().await.unwrap());
        assert_eq!(open.get_laser_state().await.unwrap(), LaserState::Locked);

        // Interlock closed again: ready, not locked.
        opener.with_model(|m| m.interlock_open = false);
        assert_eq!(open.get_laser_state().await.unwrap(), LaserState::Off);
    }

    #[tokio::test]
    async fn control_mode_commands() {
        let (laser, opener) = laser(CoboltModel::default()).await;
        assert_eq!(
            laser.set_control_mode(ControlMode::Current).await.unwrap(),
            ControlMode::Current
        );
        assert_eq!(laser.set_current(42.0).await.unwrap(), 42.0);
        assert_eq!(
            laser
                .set_control_mode(ControlMode::ModulationAnalog)
                .await
                .unwrap(),
            ControlMode::Current
        );
        assert!(opener.with_model(|m| m.log.contains(&"ci".to_string())));
    }

    #[tokio::test]
    async fn temperatures_by_name() {
        let (laser, _) = laser(CoboltModel::default()).await;
        let temps = laser.get_temperatures().await.unwrap();
        assert_eq!(temps["head"], 25.1);
        assert_eq!(temps["psu"], 28.4);
    }
}
