//! American Magnetics APS100 three-axis vector magnet
//!
//! Three supplies drive the x, y and z coils:
//! - x and z share a dual-channel supply on one serial line (9600 8N1);
//!   `CHAN 2` selects x, `CHAN 1` selects z; every line is echoed
//! - y is a single supply behind a raw TCP socket; its first reply to a
//!   query can be stale, so queries are sent twice and the second reply kept
//!
//! Supplies run in gauss mode. Targets are given in tesla and sent as
//! kilogauss limits (`ULIM`/`LLIM`), then reached with `SWEEP UP|DOWN`.

use crate::error::DaqError;
use crate::hardware::capabilities::{RampDirection, VectorMagnet};
use crate::hardware::transport::{InstrumentPort, PortOpener, PortSettings};
use crate::module::{Module, ModuleState, StateCell};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Mutex as StdMutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Field readback tolerance in kG.
const STATUS_TOLERANCE_KG: f64 = 1e-4;
const KG_PER_TESLA: f64 = 10.0;

/// Settings for [`Aps100`].
#[derive(Debug, Clone, Deserialize)]
pub struct Aps100Config {
    /// Serial port of the shared x/z supply
    pub address_zx: String,
    /// Host of the y supply
    pub address_y: String,
    /// TCP port of the y supply
    pub port: u16,
    /// Pause after each command, seconds
    #[serde(default = "default_waiting")]
    pub waitingtime: f64,
    /// Limit on |Bx|, tesla
    #[serde(default = "default_constraint")]
    pub x_constr: f64,
    /// Limit on |By|, tesla
    #[serde(default = "default_constraint")]
    pub y_constr: f64,
    /// Limit on |Bz|, tesla
    #[serde(default = "default_constraint")]
    pub z_constr: f64,
    /// Limit on |B|, tesla
    #[serde(default = "default_constraint")]
    pub rho_constr: f64,
    /// Reply timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_waiting() -> f64 {
    0.01
}

fn default_constraint() -> f64 {
    1e-3
}

fn default_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    fn label(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// First decimal number in a reply.
static FIELD_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-+]?[0-9]\.[0-9]+").expect("Invalid field value regex"));

/// Parse a field reply such as `0.1234kG`, tolerating glued replies.
fn parse_kilogauss(reply: &str) -> Result<f64> {
    let trimmed = reply.trim().trim_end_matches(|c: char| c.is_ascii_alphabetic());
    if let Ok(value) = trimmed.trim().parse() {
        return Ok(value);
    }
    FIELD_VALUE
        .find(reply)
        .map(|m| m.as_str().parse())
        .transpose()?
        .with_context(|| format!("no field value in '{}'", reply))
}

/// Driver for the APS100 supply set.
pub struct Aps100 {
    name: String,
    zx: InstrumentPort,
    y: InstrumentPort,
    waiting: Duration,
    limits: [f64; 3],
    rho_limit: f64,
    target: StdMutex<(f64, f64, f64)>,
    directions: StdMutex<[RampDirection; 3]>,
    state: StateCell,
}

impl Aps100 {
    /// Driver talking through the given openers.
    pub fn new(
        name: &str,
        config: &Aps100Config,
        zx_opener: Arc<dyn PortOpener>,
        y_opener: Arc<dyn PortOpener>,
    ) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms);
        Self {
            name: name.to_string(),
            zx: InstrumentPort::new(format!("{}-zx", name), zx_opener).with_timeout(timeout),
            y: InstrumentPort::new(format!("{}-y", name), y_opener).with_timeout(timeout),
            waiting: Duration::from_secs_f64(config.waitingtime.max(0.0)),
            limits: [config.x_constr, config.y_constr, config.z_constr],
            rho_limit: config.rho_constr,
            target: StdMutex::new((0.0, 0.0, 0.0)),
            directions: StdMutex::new([RampDirection::Zero; 3]),
            state: StateCell::new(),
        }
    }

    /// Driver for the configured serial port and TCP address.
    pub fn from_config(name: &str, config: Aps100Config) -> Result<Self> {
        let zx = PortSettings::opener(&config.address_zx, 9600)?;
        let y = PortSettings::opener(&format!("tcp://{}:{}", config.address_y, config.port), 9600)?;
        Ok(Self::new(name, &config, zx, y))
    }

    fn channel(axis: Axis) -> Option<u8> {
        match axis {
            Axis::X => Some(2),
            Axis::Z => Some(1),
            Axis::Y => None,
        }
    }

    async fn tell(&self, axis: Axis, command: &str) -> Result<()> {
        debug!(device = %self.name, axis = axis.label(), command, "Tell");
        match Self::channel(axis) {
            Some(channel) => {
                let mut session = self.zx.lock().await?;
                session.write_line(&format!("CHAN {}", channel)).await?;
                session.read_line().await?;
                session.write_line(command).await?;
                session.read_line().await?;
            }
            None => self.y.write(command).await?,
        }
        tokio::time::sleep(self.waiting).await;
        Ok(())
    }

    async fn ask(&self, axis: Axis, query: &str) -> Result<String> {
        match Self::channel(axis) {
            Some(channel) => {
                let mut session = self.zx.lock().await?;
                session.write_line(&format!("CHAN {}", channel)).await?;
                session.read_line().await?;
                session.write_line(query).await?;
                session.read_line().await?;
                session.read_line().await
            }
            None => {
                self.y.query(query).await?;
                self.y.query(query).await
            }
        }
    }

    /// Output field per axis in tesla (from `IOUT?`).
    pub async fn get_current_field(&self) -> Result<[f64; 3]> {
        let mut field = [0.0; 3];
        for axis in Axis::ALL {
            let reply = self.ask(axis, "IOUT?").await?;
            field[axis.index()] = parse_kilogauss(&reply)? / KG_PER_TESLA;
        }
        Ok(field)
    }

    /// Ramp one coil to zero.
    pub async fn ramp_axis_to_zero(&self, axis: &str) -> Result<()> {
        let axis = Axis::ALL
            .into_iter()
            .find(|a| a.label() == axis)
            .ok_or_else(|| DaqError::InvalidArgument(format!("unknown axis '{}'", axis)))?;
        self.tell(axis, "SWEEP ZERO").await?;
        self.directions.lock().unwrap_or_else(|e| e.into_inner())[axis.index()] = RampDirection::Zero;
        Ok(())
    }

    fn check_constraints(&self, field: [f64; 3]) -> Result<()> {
        for axis in Axis::ALL {
            let limit = self.limits[axis.index()];
            let value = field[axis.index()];
            if value.abs() > limit {
                return Err(DaqError::out_of_range(axis.label(), value, -limit, limit).into());
            }
        }
        let magnitude = field.iter().map(|b| b * b).sum::<f64>().sqrt();
        if magnitude > self.rho_limit {
            warn!(device = %self.name, magnitude, "Resulting field would be too high");
            return Err(DaqError::out_of_range("rho", magnitude, 0.0, self.rho_limit).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Module for Aps100 {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_activate(&self) -> Result<()> {
        self.zx.connect().await?;
        self.y.connect().await?;
        for axis in Axis::ALL {
            self.tell(axis, "REMOTE").await?;
        }
        let idn_x = self.ask(Axis::X, "*IDN?").await?;
        let idn_y = self.ask(Axis::Y, "*IDN?").await?;
        info!(device = %self.name, x = %idn_x, y = %idn_y, "Magnet supplies connected");
        *self.directions.lock().unwrap_or_else(|e| e.into_inner()) = [RampDirection::Zero; 3];
        self.state.set(ModuleState::Idle);
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        self.zx.disconnect().await;
        self.y.disconnect().await;
        self.state.set(ModuleState::Deactivated);
        Ok(())
    }

    fn state(&self) -> ModuleState {
        self.state.get()
    }
}

#[async_trait]
impl VectorMagnet for Aps100 {
    fn get_constraints(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("x".to_string(), self.limits[0]),
            ("y".to_string(), self.limits[1]),
            ("z".to_string(), self.limits[2]),
            ("rho".to_string(), self.rho_limit),
        ])
    }

    async fn target_field(&self, x: f64, y: f64, z: f64) -> Result<()> {
        let field = [x, y, z];
        for axis in Axis::ALL {
            let unit = self.ask(axis, "UNIT?").await?;
            if !unit.contains('G') {
                warn!(device = %self.name, axis = axis.label(), unit = %unit, "Check units of axis");
                return Err(DaqError::Instrument(format!(
                    "{} axis reports unit '{}', expected G",
                    axis.label(),
                    unit
                ))
                .into());
            }
        }
        self.check_constraints(field)?;

        let current = self.get_current_field().await?;
        info!(device = %self.name, x, y, z, "Setting target field");
        let mut directions = [RampDirection::Zero; 3];
        for axis in Axis::ALL {
            let i = axis.index();
            let (limit, direction) = if current[i] < field[i] {
                ("ULIM", RampDirection::Up)
            } else {
                ("LLIM", RampDirection::Down)
            };
            self.tell(axis, &format!("{} {}", limit, field[i] * KG_PER_TESLA)).await?;
            directions[i] = direction;
        }
        *self.directions.lock().unwrap_or_else(|e| e.into_inner()) = directions;
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = (x, y, z);
        Ok(())
    }

    fn get_field_target(&self) -> (f64, f64, f64) {
        *self.target.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn ramp(&self) -> Result<()> {
        let directions = *self.directions.lock().unwrap_or_else(|e| e.into_inner());
        info!(device = %self.name, ?directions, "Ramping");
        for axis in Axis::ALL {
            let word = directions[axis.index()].command_word();
            self.tell(axis, &format!("SWEEP {}", word)).await?;
        }
        Ok(())
    }

    async fn ramp_to_zero(&self) -> Result<()> {
        for axis in Axis::ALL {
            self.tell(axis, "SWEEP ZERO").await?;
        }
        *self.directions.lock().unwrap_or_else(|e| e.into_inner()) = [RampDirection::Zero; 3];
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = (0.0, 0.0, 0.0);
        Ok(())
    }

    async fn get_status(&self) -> Result<BTreeMap<String, i32>> {
        let (tx, ty, tz) = self.get_field_target();
        let target = [tx, ty, tz];
        let mut status = BTreeMap::new();
        for axis in Axis::ALL {
            let reply = self.ask(axis, "IMAG?").await?;
            let field = parse_kilogauss(&reply)?;
            let reached = (field - target[axis.index()] * KG_PER_TESLA).abs() <= STATUS_TOLERANCE_KG;
            status.insert(axis.label().to_string(), i32::from(reached));
        }
        Ok(status)
    }
}
