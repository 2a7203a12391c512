//! DS Instruments SG6000PRO microwave source
//!
//! Protocol Overview:
//! - SCPI-like ASCII over USB serial, 115200 baud 8N1, LF terminated
//! - The first reply to a query can be stale, so every query is sent twice
//!   and the second answer is used
//! - After every setter `SYST:ERR?` is checked; anything but `0,No error`
//!   is logged
//!
//! The device cannot report its sweep mode, so the driver tracks mode, list
//! and sweep parameters itself. Sweep output is available through
//! [`Microwave::set_sweep`] but not advertised in the limits.

use crate::error::DaqError;
use crate::hardware::capabilities::{
    FrequencyReadback, Microwave, MicrowaveLimits, MicrowaveMode, TriggerEdge,
};
use crate::hardware::retry::retry_once;
use crate::hardware::transport::{InstrumentPort, PortOpener, PortSettings};
use crate::module::{Module, ModuleState, StateCell};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const LIST_DWELL: Duration = Duration::from_millis(10);
const SWEEP_DWELL: Duration = Duration::from_millis(10);
const FREQ_SWITCH_SPEED: Duration = Duration::from_millis(1);
const ON_POLL_INTERVAL: Duration = Duration::from_millis(200);
const ON_POLL_TRIES: usize = 10;

/// Connection settings for [`Sg6000Pro`].
#[derive(Debug, Clone, Deserialize)]
pub struct Sg6000ProConfig {
    /// Serial resource, e.g. `ASRL4::INSTR`
    pub resource: String,
    /// Reply timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_s: f64,
}

fn default_timeout() -> f64 {
    10.0
}

/// Identity reported by `*IDN?`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    /// Manufacturer
    pub brand: String,
    /// Model name
    pub model: String,
    /// Serial number
    pub serial_number: String,
    /// Firmware version
    pub firmware: String,
}

impl Identity {
    fn parse(reply: &str) -> Result<Self> {
        let fields: Vec<&str> = reply.trim().split(',').map(str::trim).collect();
        match fields.as_slice() {
            [brand, model, serial, firmware, ..] => Ok(Self {
                brand: brand.to_string(),
                model: model.to_string(),
                serial_number: serial.to_string(),
                firmware: firmware.to_string(),
            }),
            _ => Err(DaqError::Instrument(format!("malformed *IDN? reply '{}'", reply)).into()),
        }
    }
}

#[derive(Debug)]
struct Tracked {
    mode: MicrowaveMode,
    list: Vec<f64>,
    sweep: Option<(f64, f64, f64)>,
}

/// Driver for the SG6000PRO.
pub struct Sg6000Pro {
    name: String,
    port: InstrumentPort,
    tracked: Mutex<Tracked>,
    identity: Mutex<Identity>,
    state: StateCell,
}

impl Sg6000Pro {
    /// Driver talking through `opener`.
    pub fn new(name: &str, config: &Sg6000ProConfig, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            name: name.to_string(),
            port: InstrumentPort::new(name, opener)
                .with_timeout(Duration::from_secs_f64(config.timeout_s)),
            tracked: Mutex::new(Tracked {
                mode: MicrowaveMode::Cw,
                list: Vec::new(),
                sweep: None,
            }),
            identity: Mutex::new(Identity::default()),
            state: StateCell::new(),
        }
    }

    /// Driver for the configured serial resource at 115200 baud.
    pub fn from_config(name: &str, config: Sg6000ProConfig) -> Result<Self> {
        let opener = PortSettings::opener(&config.resource, 115200)?;
        Ok(Self::new(name, &config, opener))
    }

    /// Identity read during activation.
    pub async fn identity(&self) -> Identity {
        self.identity.lock().await.clone()
    }

    async fn ask(&self, question: &str) -> Result<String> {
        retry_once(&self.port, question, || async move {
            self.port.query(question).await?;
            self.port.query(question).await
        })
        .await
    }

    async fn ask_f64(&self, question: &str, unit: &str) -> Result<f64> {
        let reply = self.ask(question).await?;
        let trimmed = reply.trim();
        trimmed
            .strip_suffix(unit)
            .unwrap_or(trimmed)
            .trim()
            .parse()
            .with_context(|| format!("{}: cannot parse '{}'", question, reply))
    }

    async fn write(&self, command: &str) -> Result<()> {
        retry_once(&self.port, command, || self.port.write(command)).await?;
        let message = self.ask("SYST:ERR?").await?;
        if message != "0,No error" {
            error!(
                device = %self.name,
                command,
                reply = %message,
                "The current command is invalid"
            );
        }
        Ok(())
    }

    /// Write without the error check.
    async fn write_unchecked(&self, command: &str) -> Result<()> {
        retry_once(&self.port, command, || self.port.write(command)).await
    }

    async fn output_on(&self) -> Result<()> {
        if self.get_status().await?.1 {
            return Ok(());
        }
        self.write("OUTP:STAT ON").await?;
        for _ in 0..ON_POLL_TRIES {
            tokio::time::sleep(ON_POLL_INTERVAL).await;
            if self.get_status().await?.1 {
                return Ok(());
            }
        }
        error!(device = %self.name, "Could not switch on the device, giving up");
        Err(DaqError::Timeout(format!("{}: output did not switch on", self.name)).into())
    }

    /// Stop the output if it runs, then switch the tracked mode.
    async fn enter_mode(&self, mode: MicrowaveMode) -> Result<()> {
        let (_, running) = self.get_status().await?;
        if running {
            self.off().await?;
        }
        self.tracked.lock().await.mode = mode;
        Ok(())
    }

    async fn set_power_level(&self, power: f64) -> Result<()> {
        self.write(&format!("POWER {:.3}", power)).await
    }

    /// `*RST` and output off.
    pub async fn reset_device(&self) -> Result<()> {
        self.write("*RST").await?;
        self.write("OUTP:STAT OFF").await
    }
}

#[async_trait]
impl Module for Sg6000Pro {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_activate(&self) -> Result<()> {
        self.port.connect().await?;
        *self.tracked.lock().await = Tracked {
            mode: MicrowaveMode::Cw,
            list: Vec::new(),
            sweep: None,
        };
        self.off().await?;

        let identity = Identity::parse(&self.ask("*IDN?").await?)?;
        info!(
            device = %self.name,
            brand = %identity.brand,
            model = %identity.model,
            serial = %identity.serial_number,
            firmware = %identity.firmware,
            "Microwave source connected"
        );
        *self.identity.lock().await = identity;
        self.state.set(ModuleState::Idle);
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        let result = self.off().await;
        self.port.disconnect().await;
        self.state.set(ModuleState::Deactivated);
        result
    }

    fn state(&self) -> ModuleState {
        self.state.get()
    }
}

#[async_trait]
impl Microwave for Sg6000Pro {
    fn limits(&self) -> MicrowaveLimits {
        MicrowaveLimits {
            supported_modes: vec![MicrowaveMode::Cw, MicrowaveMode::List],
            min_frequency: 60e6,
            max_frequency: 6.8e9,
            min_power: -50.0,
            max_power: 10.0,
            list_minstep: 1e3,
            list_maxstep: 3e9,
            list_maxentries: 2000,
            sweep_minstep: 1e3,
            sweep_maxstep: 3e9,
            sweep_maxentries: 10000,
        }
    }

    async fn off(&self) -> Result<()> {
        if self.get_status().await?.1 {
            self.write("OUTP:STAT OFF").await?;
        }
        Ok(())
    }

    async fn get_status(&self) -> Result<(MicrowaveMode, bool)> {
        let running = self.ask("OUTP:STAT?").await? == "ON";
        Ok((self.tracked.lock().await.mode, running))
    }

    async fn get_power(&self) -> Result<f64> {
        self.ask_f64("POWER?", "dBm").await
    }

    async fn get_frequency(&self) -> Result<FrequencyReadback> {
        let tracked_mode = self.tracked.lock().await.mode;
        match tracked_mode {
            MicrowaveMode::Cw => Ok(FrequencyReadback::Cw(self.ask_f64("FREQ:CW?", "HZ").await?)),
            MicrowaveMode::List => Ok(FrequencyReadback::List(self.tracked.lock().await.list.clone())),
            MicrowaveMode::Sweep => {
                let (start, stop, step) = self
                    .tracked
                    .lock()
                    .await
                    .sweep
                    .ok_or_else(|| DaqError::Instrument("no sweep configured".into()))?;
                Ok(FrequencyReadback::Sweep {
                    start: start + step,
                    stop,
                    step,
                })
            }
        }
    }

    async fn cw_on(&self) -> Result<()> {
        let (mode, running) = self.get_status().await?;
        if running && mode == MicrowaveMode::Cw {
            return Ok(());
        }
        self.enter_mode(MicrowaveMode::Cw).await?;
        self.write("SWE:MODE LIST").await?;
        self.output_on().await
    }

    async fn set_cw(&self, frequency: f64, power: f64) -> Result<(f64, f64, MicrowaveMode)> {
        self.enter_mode(MicrowaveMode::Cw).await?;
        self.write(&format!("FREQ:CW {}", frequency as i64)).await?;
        self.set_power_level(power).await?;

        let (mode, _) = self.get_status().await?;
        let actual = match self.get_frequency().await? {
            FrequencyReadback::Cw(f) => f,
            other => {
                return Err(DaqError::Instrument(format!("unexpected readback {:?}", other)).into())
            }
        };
        Ok((actual, self.get_power().await?, mode))
    }

    async fn list_on(&self) -> Result<()> {
        let (mode, running) = self.get_status().await?;
        if running && mode == MicrowaveMode::List {
            return Ok(());
        }
        self.enter_mode(MicrowaveMode::List).await?;
        self.write("SWE:MODE LIST").await?;
        self.output_on().await
    }

    async fn set_list(&self, frequencies: &[f64], power: f64) -> Result<(Vec<f64>, f64, MicrowaveMode)> {
        let max_entries = self.limits().list_maxentries;
        if frequencies.len() > max_entries {
            error!(
                device = %self.name,
                entries = frequencies.len(),
                max_entries,
                "The frequency list exceeds the hardware limitation. Aborting creation of a list."
            );
            return Err(DaqError::InvalidArgument(format!(
                "{} list entries, at most {} allowed",
                frequencies.len(),
                max_entries
            ))
            .into());
        }

        self.enter_mode(MicrowaveMode::List).await?;
        self.write("SWE:MODE LIST").await?;
        self.write(&format!("SWE:DWELL {}", LIST_DWELL.as_millis())).await?;
        self.write("LIST:CLEAR").await?;
        for f in frequencies {
            self.write(&format!("LIST:ADD {}", *f as i64)).await?;
        }
        self.tracked.lock().await.list = frequencies.to_vec();
        self.set_power_level(power).await?;

        self.write("TRIG:STEP").await?;
        self.reset_listpos().await?;
        let actual_power = self.get_power().await?;
        let (mode, _) = self.get_status().await?;
        Ok((frequencies.to_vec(), actual_power, mode))
    }

    async fn reset_listpos(&self) -> Result<()> {
        self.write_unchecked("ABORT").await
    }

    async fn sweep_on(&self) -> Result<()> {
        let (mode, running) = self.get_status().await?;
        if running && mode == MicrowaveMode::Sweep {
            return Ok(());
        }
        self.enter_mode(MicrowaveMode::Sweep).await?;
        self.write("SWE:MODE SCAN").await?;
        self.output_on().await
    }

    async fn set_sweep(
        &self,
        start: f64,
        stop: f64,
        step: f64,
        power: f64,
    ) -> Result<(f64, f64, f64, f64, MicrowaveMode)> {
        if step <= 0.0 || stop < start {
            return Err(DaqError::InvalidArgument(format!(
                "sweep {}..{} with step {}",
                start, stop, step
            ))
            .into());
        }
        self.enter_mode(MicrowaveMode::Sweep).await?;
        self.write("SWE:MODE SCAN").await?;
        self.write(&format!("SWE:DWELL {}", SWEEP_DWELL.as_millis())).await?;
        self.write(&format!("FREQ:START {}HZ", start as i64)).await?;
        self.write(&format!("FREQ:STOP {}HZ", stop as i64)).await?;
        let points = ((stop - start) / step) as i64 + 1;
        self.write(&format!("SWE:POINTS {}", points)).await?;
        info!(device = %self.name, points, "Sweep configured");
        self.tracked.lock().await.sweep = Some((start, stop, step));
        self.set_power_level(power).await?;

        self.write("TRIG:STEP").await?;
        self.reset_sweeppos().await?;
        let actual_power = self.get_power().await?;
        let (mode, _) = self.get_status().await?;
        match self.get_frequency().await? {
            FrequencyReadback::Sweep { start, stop, step } => Ok((start, stop, step, actual_power, mode)),
            other => Err(DaqError::Instrument(format!("unexpected readback {:?}", other)).into()),
        }
    }

    async fn reset_sweeppos(&self) -> Result<()> {
        self.write_unchecked("ABORT").await
    }

    async fn set_ext_trigger(&self, edge: TriggerEdge, timing: f64) -> Result<(TriggerEdge, f64)> {
        let slope = match edge {
            TriggerEdge::Rising => Some("POS"),
            TriggerEdge::Falling => Some("NEG"),
            TriggerEdge::None => {
                warn!(device = %self.name, "No valid trigger polarity passed");
                None
            }
        };
        self.write(":TRIG1:LIST:SOUR EXT").await?;
        self.write(":TRIG1:SLOP NEG").await?;
        if let Some(slope) = slope {
            self.write(&format!(":TRIG1:SLOP {}", slope)).await?;
        }
        let polarity = self.ask(":TRIG1:SLOP?").await?;
        if polarity.contains("NEG") {
            Ok((TriggerEdge::Falling, timing))
        } else {
            Ok((TriggerEdge::Rising, timing))
        }
    }

    async fn trigger(&self) -> Result<()> {
        self.write_unchecked("INIT:IMM").await?;
        tokio::time::sleep(FREQ_SWITCH_SPEED).await;
        Ok(())
    }
}
