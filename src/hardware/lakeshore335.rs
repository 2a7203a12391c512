//! Lake Shore Model 335 temperature controller
//!
//! Protocol Overview:
//! - USB virtual serial, 57600 baud, 7 data bits, odd parity, 1 stop bit
//! - Terminator: CRLF
//! - Commands carry their arguments without a space: `SETP1,4.2`, `KRDG?A`
//!
//! One closed PID loop is configured: one sensor input and one heater
//! output. When regulation is disabled the heater follows the manual output.

use crate::error::DaqError;
use crate::hardware::capabilities::PidController;
use crate::hardware::retry::retry_once;
use crate::hardware::transport::{Framing, InstrumentPort, PortOpener, PortSettings, Resource};
use crate::module::{Module, ModuleState, StateCell};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Heater range used when regulation is enabled (3 = high).
const ENABLED_RANGE: u8 = 3;

/// Loop configuration for [`Lakeshore335`].
///
/// Numeric codes follow the controller's command reference.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Lakeshore335Config {
    /// Serial port
    pub serial_port: String,
    /// Heater output, 1 or 2
    pub output: u8,
    /// 0 off, 1 closed loop PID, 2 zone, 3 open loop, 4 monitor out, 5 warmup
    pub mode: u8,
    /// Keep output on after power-up
    pub powerup: u8,
    /// 0 current, 1 voltage (output 2 only)
    pub heater_type: u8,
    /// 1 = 25 Ohm, 2 = 50 Ohm heater
    pub resistance: u8,
    /// 0 user specified, 1 = 0.707 A, 2 = 1 A, 3 = 1.141 A, 4 = 1.732 A
    pub max_current: u8,
    /// Maximum current when `max_current` is 0
    pub max_current_user: f64,
    /// Sensor input, `A` or `B`
    pub input: String,
    /// 0 disabled, 1 diode, 2 platinum RTD, 3 NTC RTD, 4 thermocouple
    pub sensor_type: u8,
    /// Input autorange
    pub autorange: u8,
    /// Input range when autorange is off
    pub range: u8,
    /// Thermal compensation
    pub compensation: u8,
    /// 1 Kelvin, 2 Celsius, 3 sensor units
    pub units: u8,
    /// Calibration curve number
    pub curve_number: u8,
    /// Reply timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for Lakeshore335Config {
    fn default() -> Self {
        Self {
            serial_port: "COM1".to_string(),
            output: 1,
            mode: 1,
            powerup: 0,
            heater_type: 0,
            resistance: 2,
            max_current: 1,
            max_current_user: 0.0,
            input: "A".to_string(),
            sensor_type: 0,
            autorange: 1,
            range: 0,
            compensation: 1,
            units: 1,
            curve_number: 0,
            timeout_ms: 1000,
        }
    }
}

impl Lakeshore335Config {
    /// Numeric input index used by `OUTMODE`.
    fn input_index(&self) -> u8 {
        match self.input.as_str() {
            "A" => 1,
            "B" => 2,
            _ => 0,
        }
    }
}

fn parse_pid(reply: &str) -> Result<(f64, f64, f64)> {
    let values = reply
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("cannot parse PID reply '{}'", reply))?;
    match values.as_slice() {
        [kp, ki, kd] => Ok((*kp, *ki, *kd)),
        _ => Err(DaqError::Instrument(format!("PID reply '{}' has {} fields", reply, values.len())).into()),
    }
}

/// Driver for the Model 335.
pub struct Lakeshore335 {
    name: String,
    config: Lakeshore335Config,
    port: InstrumentPort,
    state: StateCell,
}

impl Lakeshore335 {
    /// Driver talking through `opener`.
    pub fn new(name: &str, config: Lakeshore335Config, opener: Arc<dyn PortOpener>) -> Self {
        let port = InstrumentPort::new(name, opener)
            .with_write_terminator("\r\n")
            .with_timeout(Duration::from_millis(config.timeout_ms));
        Self {
            name: name.to_string(),
            config,
            port,
            state: StateCell::new(),
        }
    }

    /// Driver for the configured serial port.
    pub fn from_config(name: &str, config: Lakeshore335Config) -> Result<Self> {
        let resource: Resource = config.serial_port.parse()?;
        let settings = PortSettings::new(resource, 57600).with_framing(Framing::SevenOddOne);
        Ok(Self::new(name, config, Arc::new(settings)))
    }

    async fn query(&self, question: &str) -> Result<String> {
        retry_once(&self.port, question, || self.port.query(question)).await
    }

    async fn query_f64(&self, question: &str) -> Result<f64> {
        let reply = self.query(question).await?;
        reply
            .trim()
            .parse()
            .with_context(|| format!("{}: cannot parse '{}'", question, reply))
    }

    async fn command(&self, command: &str) -> Result<()> {
        retry_once(&self.port, command, || self.port.write(command)).await
    }

    async fn pid(&self) -> Result<(f64, f64, f64)> {
        parse_pid(&self.query(&format!("PID?{}", self.config.output)).await?)
    }

    async fn set_pid(&self, kp: f64, ki: f64, kd: f64) -> Result<()> {
        self.command(&format!("PID{},{},{},{}", self.config.output, kp, ki, kd))
            .await
    }

    /// Configure the sensor input from the loop configuration.
    pub async fn setup_input(&self) -> Result<()> {
        let c = &self.config;
        self.command(&format!(
            "INTYPE{},{},{},{},{},{}",
            c.input, c.sensor_type, c.autorange, c.range, c.compensation, c.units
        ))
        .await?;
        self.command(&format!("INCRV{},{}", c.input, c.curve_number))
            .await
    }

    /// Configure the heater output from the loop configuration.
    pub async fn setup_output(&self) -> Result<()> {
        let c = &self.config;
        self.command(&format!(
            "OUTMODE{},{},{},{}",
            c.output,
            c.mode,
            c.input_index(),
            c.powerup
        ))
        .await?;
        self.command(&format!(
            "HTRSET{},{},{},{},{},2",
            c.output, c.heater_type, c.resistance, c.max_current, c.max_current_user
        ))
        .await
    }
}

#[async_trait]
impl Module for Lakeshore335 {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_activate(&self) -> Result<()> {
        self.port.connect().await?;
        // The first exchange after power-up frequently fails.
        if let Err(e) = self.port.query("*IDN?").await {
            warn!(
                device = %self.name,
                error = %e,
                "Something might have gone wrong with the connection to the temperature controller"
            );
        }
        self.setup_input().await?;
        self.setup_output().await?;
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
impl PidController for Lakeshore335 {
    async fn get_kp(&self) -> Result<f64> {
        Ok(self.pid().await?.0)
    }

    async fn set_kp(&self, kp: f64) -> Result<()> {
        let (_, ki, kd) = self.pid().await?;
        self.set_pid(kp, ki, kd).await
    }

    async fn get_ki(&self) -> Result<f64> {
        Ok(self.pid().await?.1)
    }

    async fn set_ki(&self, ki: f64) -> Result<()> {
        let (kp, _, kd) = self.pid().await?;
        self.set_pid(kp, ki, kd).await
    }

    async fn get_kd(&self) -> Result<f64> {
        Ok(self.pid().await?.2)
    }

    async fn set_kd(&self, kd: f64) -> Result<()> {
        let (kp, ki, _) = self.pid().await?;
        self.set_pid(kp, ki, kd).await
    }

    async fn get_setpoint(&self) -> Result<f64> {
        self.query_f64(&format!("SETP?{}", self.config.output)).await
    }

    async fn set_setpoint(&self, setpoint: f64) -> Result<()> {
        self.command(&format!("SETP{},{}", self.config.output, setpoint))
            .await
    }

    async fn get_manual_value(&self) -> Result<f64> {
        self.query_f64(&format!("MOUT?{}", self.config.output)).await
    }

    async fn set_manual_value(&self, value: f64) -> Result<()> {
        self.command(&format!("MOUT{},{}", self.config.output, value))
            .await
    }

    async fn get_enabled(&self) -> Result<bool> {
        let reply = self.query(&format!("RANGE?{}", self.config.output)).await?;
        let range: i64 = reply
            .split(',')
            .next()
            .unwrap_or_default()
            .trim()
            .parse()
            .with_context(|| format!("cannot parse RANGE reply '{}'", reply))?;
        Ok(range != 0)
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        let range = if enabled { ENABLED_RANGE } else { 0 };
        self.command(&format!("RANGE{},{}", self.config.output, range))
            .await
    }

    async fn get_control_limit(&self) -> Result<Option<(f64, f64)>> {
        Ok(None)
    }

    async fn set_control_limit(&self, _limit: (f64, f64)) -> Result<()> {
        Ok(())
    }

    async fn get_process_value(&self) -> Result<f64> {
        self.query_f64(&format!("KRDG?{}", self.config.input)).await
    }

    fn get_process_unit(&self) -> (String, String) {
        ("K".to_string(), "Kelvin".to_string())
    }

    async fn get_control_value(&self) -> Result<f64> {
        self.query_f64(&format!("HTR?{}", self.config.output)).await
    }

    fn get_control_unit(&self) -> (String, String) {
        ("%".to_string(), "percent".to_string())
    }

    async fn get_extra(&self) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}
