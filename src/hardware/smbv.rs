//! Rohde & Schwarz SMBV100A vector signal generator, used as a microwave source
//!
//! Protocol Overview:
//! - SCPI over the raw socket (port 5025) or serial, LF terminated
//! - Setters are followed by `*WAI`, then `*OPC?` is polled until it reads 1
//! - Mode is read from the device (`:FREQ:MODE?` gives CW, LIST or SWE)
//!
//! Sweep configuration programs the start one step early, so the first
//! trigger lands on the requested start frequency.

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
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

const OPC_POLL: Duration = Duration::from_millis(20);
const STATE_POLL: Duration = Duration::from_millis(200);
const FREQ_SWITCH_SPEED: Duration = Duration::from_millis(3);

/// Connection settings for [`Smbv`].
#[derive(Debug, Clone, Deserialize)]
pub struct SmbvConfig {
    /// VISA-style or `tcp://` resource
    pub resource: String,
    /// Reply timeout in seconds; also bounds every completion poll
    #[serde(default = "default_timeout")]
    pub timeout_s: f64,
    /// Lower the advertised maximum power (dBm)
    #[serde(default)]
    pub max_power: Option<f64>,
    /// Baud rate when the resource is serial
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_timeout() -> f64 {
    10.0
}

fn default_baud_rate() -> u32 {
    115200
}

fn parse_mode(reply: &str) -> Result<MicrowaveMode> {
    match reply.trim().to_lowercase().as_str() {
        "cw" | "fix" => Ok(MicrowaveMode::Cw),
        "list" => Ok(MicrowaveMode::List),
        "swe" | "sweep" => Ok(MicrowaveMode::Sweep),
        other => Err(DaqError::Instrument(format!("unknown frequency mode '{}'", other)).into()),
    }
}

fn parse_flag(reply: &str) -> Result<bool> {
    let value: f64 = reply
        .trim()
        .parse()
        .with_context(|| format!("cannot parse '{}' as state", reply))?;
    Ok(value as i64 != 0)
}

fn format_list(frequencies: &[f64]) -> String {
    frequencies
        .iter()
        .map(|f| format!("{:.6}", f))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Driver for the SMBV100A.
pub struct Smbv {
    name: String,
    port: InstrumentPort,
    deadline: Duration,
    max_power: Option<f64>,
    model: RwLock<String>,
    state: StateCell,
}

impl Smbv {
    /// Driver talking through `opener`.
    pub fn new(name: &str, config: &SmbvConfig, opener: Arc<dyn PortOpener>) -> Self {
        let timeout = Duration::from_secs_f64(config.timeout_s);
        Self {
            name: name.to_string(),
            port: InstrumentPort::new(name, opener).with_timeout(timeout),
            deadline: timeout,
            max_power: config.max_power,
            model: RwLock::new(String::new()),
            state: StateCell::new(),
        }
    }

    /// Driver for the configured resource.
    pub fn from_config(name: &str, config: SmbvConfig) -> Result<Self> {
        let opener = PortSettings::opener(&config.resource, config.baud_rate)?;
        Ok(Self::new(name, &config, opener))
    }

    /// Model name from `*IDN?`.
    pub async fn model(&self) -> String {
        self.model.read().await.clone()
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

    /// Write `command` followed by `*WAI`.
    async fn write_wai(&self, command: &str) -> Result<()> {
        retry_once(&self.port, command, || async move {
            self.port.write(command).await?;
            self.port.write("*WAI").await
        })
        .await
    }

    /// Write `command`, `*WAI`, then poll `*OPC?` until the device is done.
    async fn command_wait(&self, command: &str) -> Result<()> {
        self.write_wai(command).await?;
        let start = Instant::now();
        loop {
            if parse_flag(&self.query("*OPC?").await?)? {
                return Ok(());
            }
            if start.elapsed() > self.deadline {
                return Err(DaqError::Timeout(format!("'{}' did not complete", command)).into());
            }
            tokio::time::sleep(OPC_POLL).await;
        }
    }

    async fn wait_output(&self, running: bool, interval: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.get_status().await?.1 == running {
                return Ok(());
            }
            if start.elapsed() > self.deadline {
                return Err(DaqError::Timeout(format!(
                    "{}: output did not switch {}",
                    self.name,
                    if running { "on" } else { "off" }
                ))
                .into());
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn stop_if_running(&self) -> Result<MicrowaveMode> {
        let (mode, running) = self.get_status().await?;
        if running {
            self.off().await?;
        }
        Ok(mode)
    }

    /// Change the CW frequency without touching mode or output.
    ///
    /// Call [`Microwave::set_cw`] once before tracking.
    pub async fn set_cw_tracking(&self, frequency: f64) -> Result<()> {
        self.command_wait(&format!(":FREQ {:.6}", frequency)).await
    }
}

#[async_trait]
impl Module for Smbv {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_activate(&self) -> Result<()> {
        self.port.connect().await?;
        let idn = self.query("*IDN?").await?;
        let model = idn
            .split(',')
            .nth(1)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| DaqError::Instrument(format!("malformed *IDN? reply '{}'", idn)))?;
        info!(device = %self.name, model = %model, "MW source initialised and connected");
        *self.model.write().await = model;

        self.command_wait("*CLS").await?;
        self.command_wait("*RST").await?;
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
impl Microwave for Smbv {
    fn limits(&self) -> MicrowaveLimits {
        let (min_frequency, max_frequency) = (100e3, 12.75e9);
        let mut max_power = 0.0;
        if let Some(cap) = self.max_power {
            if cap < max_power {
                max_power = cap;
            }
        }
        MicrowaveLimits {
            supported_modes: vec![MicrowaveMode::Cw, MicrowaveMode::List, MicrowaveMode::Sweep],
            min_frequency,
            max_frequency,
            min_power: -20.0,
            max_power,
            list_minstep: 0.1,
            list_maxstep: max_frequency - min_frequency,
            list_maxentries: 1_000_000,
            sweep_minstep: 0.1,
            sweep_maxstep: max_frequency - min_frequency,
            sweep_maxentries: 10001,
        }
    }

    async fn off(&self) -> Result<()> {
        if !self.get_status().await?.1 {
            return Ok(());
        }
        self.write_wai("OUTP:STAT OFF").await?;
        self.wait_output(false, STATE_POLL).await
    }

    async fn get_status(&self) -> Result<(MicrowaveMode, bool)> {
        let running = parse_flag(&self.query("OUTP:STAT?").await?)?;
        let mode = parse_mode(&self.query(":FREQ:MODE?").await?)?;
        Ok((mode, running))
    }

    async fn get_power(&self) -> Result<f64> {
        self.query_f64(":POW?").await
    }

    async fn get_frequency(&self) -> Result<FrequencyReadback> {
        let (mode, _) = self.get_status().await?;
        match mode {
            MicrowaveMode::Cw => Ok(FrequencyReadback::Cw(self.query_f64(":FREQ?").await?)),
            MicrowaveMode::Sweep => Ok(FrequencyReadback::Sweep {
                start: self.query_f64(":FREQ:STAR?").await?,
                stop: self.query_f64(":FREQ:STOP?").await?,
                step: self.query_f64(":SWE:STEP?").await?,
            }),
            MicrowaveMode::List => {
                let reply = self.query(":LIST:FREQ?").await?;
                let list = reply
                    .split(',')
                    .map(|f| f.trim().parse::<f64>())
                    .collect::<Result<Vec<_>, _>>()
                    .with_context(|| format!("cannot parse list '{}'", reply))?;
                Ok(FrequencyReadback::List(list))
            }
        }
    }

    async fn cw_on(&self) -> Result<()> {
        let (mode, running) = self.get_status().await?;
        if running {
            if mode == MicrowaveMode::Cw {
                return Ok(());
            }
            self.off().await?;
        }
        if mode != MicrowaveMode::Cw {
            self.command_wait(":FREQ:MODE CW").await?;
        }
        self.write_wai(":OUTP:STAT ON").await?;
        self.wait_output(true, OPC_POLL).await
    }

    async fn set_cw(&self, frequency: f64, power: f64) -> Result<(f64, f64, MicrowaveMode)> {
        let mode = self.stop_if_running().await?;
        if mode != MicrowaveMode::Cw {
            self.command_wait(":FREQ:MODE CW").await?;
        }
        self.command_wait(&format!(":FREQ {:.6}", frequency)).await?;
        self.command_wait(&format!(":POW {:.6}", power)).await?;

        let (mode, _) = self.get_status().await?;
        let actual = self.query_f64(":FREQ?").await?;
        Ok((actual, self.get_power().await?, mode))
    }

    async fn list_on(&self) -> Result<()> {
        let (mode, running) = self.get_status().await?;
        if running {
            if mode == MicrowaveMode::List {
                return Ok(());
            }
            self.off().await?;
        }
        self.cw_on().await?;
        self.command_wait(":LIST:LEARN").await?;
        self.command_wait(":FREQ:MODE LIST").await?;
        self.wait_output(true, STATE_POLL).await
    }

    async fn set_list(&self, frequencies: &[f64], power: f64) -> Result<(Vec<f64>, f64, MicrowaveMode)> {
        let limits = self.limits();
        if !limits.list_len_in_range(frequencies.len()) {
            return Err(DaqError::InvalidArgument(format!(
                "{} list entries, 1 to {} allowed",
                frequencies.len(),
                limits.list_maxentries
            ))
            .into());
        }
        let mode = self.stop_if_running().await?;
        if mode != MicrowaveMode::Cw {
            self.command_wait(":FREQ:MODE CW").await?;
        }

        self.write_wai(":LIST:SEL 'QUDI'").await?;
        self.write_wai(&format!(":LIST:FREQ {}", format_list(frequencies))).await?;
        self.write_wai(":LIST:MODE STEP").await?;
        self.write_wai(&format!(":LIST:POW {:.6}", power)).await?;
        self.command_wait(":TRIG1:LIST:SOUR EXT").await?;
        self.command_wait(":LIST:LEARN").await?;
        self.command_wait(":FREQ:MODE LIST").await?;

        let actual = match self.get_frequency().await? {
            FrequencyReadback::List(list) => list,
            other => {
                return Err(DaqError::Instrument(format!("unexpected readback {:?}", other)).into())
            }
        };
        Ok((actual, self.get_power().await?, MicrowaveMode::List))
    }

    async fn reset_listpos(&self) -> Result<()> {
        self.command_wait(":ABOR:LIST").await
    }

    async fn sweep_on(&self) -> Result<()> {
        let (mode, running) = self.get_status().await?;
        if running {
            if mode == MicrowaveMode::Sweep {
                return Ok(());
            }
            self.off().await?;
        }
        if mode != MicrowaveMode::Sweep {
            self.command_wait(":FREQ:MODE SWEEP").await?;
        }
        self.write_wai(":OUTP:STAT ON").await?;
        self.wait_output(true, STATE_POLL).await
    }

    async fn set_sweep(
        &self,
        start: f64,
        stop: f64,
        step: f64,
        power: f64,
    ) -> Result<(f64, f64, f64, f64, MicrowaveMode)> {
        let mode = self.stop_if_running().await?;
        if mode != MicrowaveMode::Sweep {
            self.command_wait(":FREQ:MODE SWEEP").await?;
        }
        self.port.write(":SWE:MODE STEP").await?;
        self.write_wai(":SWE:SPAC LIN").await?;
        self.port.write(&format!(":FREQ:START {:.6}", start - step)).await?;
        self.port.write(&format!(":FREQ:STOP {:.6}", stop)).await?;
        self.write_wai(&format!(":SWE:STEP:LIN {:.6}", step)).await?;
        self.write_wai(&format!(":POW {:.6}", power)).await?;
        self.command_wait("TRIG:FSW:SOUR EXT").await?;

        let actual_power = self.get_power().await?;
        let (mode, _) = self.get_status().await?;
        match self.get_frequency().await? {
            FrequencyReadback::Sweep { start, stop, step } => Ok((start, stop, step, actual_power, mode)),
            other => Err(DaqError::Instrument(format!("unexpected readback {:?}", other)).into()),
        }
    }

    async fn reset_sweeppos(&self) -> Result<()> {
        self.command_wait(":ABOR:SWE").await
    }

    async fn set_ext_trigger(&self, edge: TriggerEdge, timing: f64) -> Result<(TriggerEdge, f64)> {
        self.stop_if_running().await?;
        match edge {
            TriggerEdge::Rising => self.command_wait(":TRIG1:SLOP POS").await?,
            TriggerEdge::Falling => self.command_wait(":TRIG1:SLOP NEG").await?,
            TriggerEdge::None => {
                warn!(device = %self.name, "No valid trigger polarity passed");
            }
        }
        let polarity = self.query(":TRIG1:SLOP?").await?;
        if polarity.contains("NEG") {
            Ok((TriggerEdge::Falling, timing))
        } else {
            Ok((TriggerEdge::Rising, timing))
        }
    }

    async fn trigger(&self) -> Result<()> {
        retry_once(&self.port, "*TRG", || self.port.write("*TRG")).await?;
        tokio::time::sleep(FREQ_SWITCH_SPEED).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{LineDevice, SimulatedOpener};

    struct SmbvModel {
        output: bool,
        mode: &'static str,
        frequency: f64,
        power: f64,
        start: f64,
        stop: f64,
        step: f64,
        list: Vec<f64>,
        slope: &'static str,
        log: Vec<String>,
    }

    impl Default for SmbvModel {
        fn default() -> Self {
            Self {
                output: false,
                mode: "CW",
                frequency: 1e9,
                power: -30.0,
                start: 0.0,
                stop: 0.0,
                step: 0.0,
                list: Vec::new(),
                slope: "POS",
                log: Vec::new(),
            }
        }
    }

    impl LineDevice for SmbvModel {
        fn handle(&mut self, command: &str) -> Vec<u8> {
            self.log.push(command.to_string());
            let reply = match command {
                "*IDN?" => "Rohde&Schwarz,SMBV100A,1407.6004k02/123456,3.1.19.15-3.20.390.24".into(),
                "*OPC?" => "1".into(),
                "OUTP:STAT?" => u8::from(self.output).to_string(),
                ":FREQ:MODE?" => self.mode.into(),
                ":FREQ?" => self.frequency.to_string(),
                ":POW?" => self.power.to_string(),
                ":FREQ:STAR?" => self.start.to_string(),
                ":FREQ:STOP?" => self.stop.to_string(),
                ":SWE:STEP?" => self.step.to_string(),
                ":TRIG1:SLOP?" => self.slope.into(),
                ":LIST:FREQ?" => self
                    .list
                    .iter()
                    .map(|f| f.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                _ => {
                    let (head, arg) = command.split_once(' ').unwrap_or((command, ""));
                    let num = arg.parse::<f64>().unwrap_or(0.0);
                    match head {
                        "OUTP:STAT" | ":OUTP:STAT" => self.output = arg == "ON",
                        ":FREQ:MODE" => {
                            self.mode = match arg {
                                "LIST" => "LIST",
                                "SWEEP" => "SWE",
                                _ => "CW",
                            }
                        }
                        ":FREQ" => self.frequency = num,
                        ":POW" | ":LIST:POW" => self.power = num,
                        ":FREQ:START" => self.start = num,
                        ":FREQ:STOP" => self.stop = num,
                        ":SWE:STEP:LIN" => self.step = num,
                        ":TRIG1:SLOP" => self.slope = if arg == "NEG" { "NEG" } else { "POS" },
                        ":LIST:FREQ" => {
                            self.list = arg
                                .split(',')
                                .filter_map(|f| f.trim().parse().ok())
                                .collect()
                        }
                        _ => {}
                    }
                    return Vec::new();
                }
            };
            format!("{}\n", reply).into_bytes()
        }
    }

    async fn source(max_power: Option<f64>) -> (Smbv, SimulatedOpener<SmbvModel>) {
        let opener = SimulatedOpener::new(SmbvModel::default(), b'\n');
        let config = SmbvConfig {
            resource: "TCPIP0::10.0.0.3::INSTR".into(),
            timeout_s: 1.0,
            max_power,
            baud_rate: 115200,
        };
        let mw = Smbv::new("smbv", &config, Arc::new(opener.clone()));
        mw.on_activate().await.unwrap();
        (mw, opener)
    }

    #[test]
    fn mode_words() {
        assert_eq!(parse_mode("SWE\n").unwrap(), MicrowaveMode::Sweep);
        assert_eq!(parse_mode("LIST").unwrap(), MicrowaveMode::List);
        assert!(parse_mode("ARB").is_err());
        assert!(parse_flag("1.0").unwrap());
    }

    #[tokio::test]
    async fn activation_resets_device() {
        let (mw, opener) = source(None).await;
        assert_eq!(mw.model().await, "SMBV100A");
        let log = opener.with_model(|m| m.log.clone());
        assert!(log.contains(&"*CLS".to_string()));
        assert!(log.contains(&"*RST".to_string()));
    }

    #[tokio::test]
    async fn max_power_caps_limits() {
        let (mw, _) = source(Some(-5.0)).await;
        assert_eq!(mw.limits().max_power, -5.0);
        let (mw, _) = source(Some(3.0)).await;
        assert_eq!(mw.limits().max_power, 0.0);
    }

    #[tokio::test]
    async fn cw_round_trip() {
        let (mw, _) = source(None).await;
        let (f, p, mode) = mw.set_cw(2.87e9, -10.0).await.unwrap();
        assert_eq!((f, p, mode), (2.87e9, -10.0, MicrowaveMode::Cw));
        mw.cw_on().await.unwrap();
        assert!(mw.get_status().await.unwrap().1);
        mw.off().await.unwrap();
        assert!(!mw.get_status().await.unwrap().1);
    }

    #[tokio::test]
    async fn list_is_read_back_from_device() {
        let (mw, _) = source(None).await;
        let (list, power, mode) = mw.set_list(&[2.8e9, 2.9e9], -12.0).await.unwrap();
        assert_eq!(list, vec![2.8e9, 2.9e9]);
        assert_eq!(power, -12.0);
        assert_eq!(mode, MicrowaveMode::List);
    }

    #[tokio::test]
    async fn sweep_starts_one_step_early() {
        let (mw, _) = source(None).await;
        let (start, stop, step, _, mode) = mw.set_sweep(2.8e9, 2.9e9, 1e6, -10.0).await.unwrap();
        assert_eq!(mode, MicrowaveMode::Sweep);
        assert_eq!(start, 2.8e9 - 1e6);
        assert_eq!(stop, 2.9e9);
        assert_eq!(step, 1e6);
    }

    #[tokio::test]
    async fn trigger_slope() {
        let (mw, _) = source(None).await;
        let (edge, _) = mw.set_ext_trigger(TriggerEdge::Falling, 1e-3).await.unwrap();
        assert_eq!(edge, TriggerEdge::Falling);
    }
}
