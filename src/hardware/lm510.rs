//! Cryomagnetics LM-510 liquid cryogen level monitor
//!
//! Protocol Overview:
//! - RS-232, 9600 baud 8N1, LF terminated
//! - The instrument echoes every command line before its reply
//! - Levels carry a unit suffix (`35.2 cm`, `80.1 %`)
//! - Threshold commands (`HIGH`, `LOW`, `MODE`) act on the selected channel
//!
//! Every operation reconnects and retries once. A second failure is logged
//! and the operation returns a neutral value (0 for levels and channels, -1
//! for thresholds, `Off` for fill status) so polling loops keep running.

use crate::error::DaqError;
use crate::hardware::capabilities::{FillStatus, LevelSensor};
use crate::hardware::retry::{retry_once, retry_or};
use crate::hardware::transport::{InstrumentPort, PortOpener, PortSettings};
use crate::module::{Module, ModuleState, StateCell};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Connection settings for [`Lm510`].
#[derive(Debug, Clone, Deserialize)]
pub struct Lm510Config {
    /// Serial port
    #[serde(default = "default_port")]
    pub serial_port: String,
    /// Reply timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_port() -> String {
    "COM1".to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

impl Default for Lm510Config {
    fn default() -> Self {
        Self {
            serial_port: default_port(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Leading number of a reply such as `35.2 cm`.
fn parse_value(reply: &str) -> Result<f64> {
    reply
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .parse()
        .with_context(|| format!("cannot parse '{}' as a value", reply))
}

fn parse_fill_status(reply: &str) -> Result<FillStatus> {
    match reply.trim().to_lowercase().as_str() {
        "off" => Ok(FillStatus::Off),
        "timeout" => Ok(FillStatus::Timeout),
        _ => Ok(FillStatus::Filling(parse_value(reply)?)),
    }
}

fn check_channel(channel: u8) -> Result<()> {
    if channel == 1 || channel == 2 {
        Ok(())
    } else {
        Err(DaqError::InvalidArgument(format!("channel {} does not exist", channel)).into())
    }
}

/// Driver for the LM-510.
pub struct Lm510 {
    name: String,
    port: InstrumentPort,
    state: StateCell,
}

impl Lm510 {
    /// Driver talking through `opener`.
    pub fn new(name: &str, config: &Lm510Config, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            name: name.to_string(),
            port: InstrumentPort::new(name, opener)
                .with_timeout(Duration::from_millis(config.timeout_ms)),
            state: StateCell::new(),
        }
    }

    /// Driver for the configured serial port at 9600 baud.
    pub fn from_config(name: &str, config: Lm510Config) -> Result<Self> {
        let opener = PortSettings::opener(&config.serial_port, 9600)?;
        Ok(Self::new(name, &config, opener))
    }

    /// Write a command and consume its echo.
    async fn send(&self, command: &str) -> Result<()> {
        let mut session = self.port.lock().await?;
        session.write_line(command).await?;
        let echo = session.read_line().await?;
        if echo != command {
            return Err(DaqError::Instrument(format!("expected echo '{}', got '{}'", command, echo)).into());
        }
        Ok(())
    }

    /// Write a query, consume its echo and return the reply.
    async fn ask(&self, query: &str) -> Result<String> {
        let mut session = self.port.lock().await?;
        session.write_line(query).await?;
        let echo = session.read_line().await?;
        if echo != query {
            return Err(DaqError::Instrument(format!("expected echo '{}', got '{}'", query, echo)).into());
        }
        session.read_line().await
    }

    async fn select(&self, channel: u8) -> Result<()> {
        self.send(&format!("CHAN {}", channel)).await
    }

    async fn threshold(&self, name: &str, channel: u8) -> f64 {
        if let Err(e) = check_channel(channel) {
            warn!(device = %self.name, error = %e, "Invalid channel");
            return -1.0;
        }
        let query = format!("{}?", name);
        let query = query.as_str();
        let operation = format!("reading the {} level", name.to_lowercase());
        retry_or(&self.port, &operation, -1.0, || async move {
            self.select(channel).await?;
            parse_value(&self.ask(&query).await?)
        })
        .await
    }

    async fn set_threshold(&self, name: &str, level: f64, channel: u8) {
        if let Err(e) = check_channel(channel) {
            warn!(device = %self.name, error = %e, "Invalid channel");
            return;
        }
        let command = format!("{} {}", name, level);
        let command = command.as_str();
        let operation = format!("setting the {} level", name.to_lowercase());
        let _ = retry_once(&self.port, &operation, || async move {
            self.select(channel).await?;
            self.send(&command).await
        })
        .await;
    }
}

#[async_trait]
impl Module for Lm510 {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_activate(&self) -> Result<()> {
        if let Err(e) = self.port.connect().await {
            error!(device = %self.name, error = %e, "Connection to the LM510 level sensor failed");
            return Err(e);
        }
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
impl LevelSensor for Lm510 {
    async fn measure_level(&self) -> f64 {
        retry_or(&self.port, "reading the level", 0.0, || async move {
            let channel = self.get_channel_raw().await?;
            parse_value(&self.ask(&format!("MEAS? {}", channel)).await?)
        })
        .await
    }

    async fn get_channel(&self) -> u8 {
        retry_or(&self.port, "reading the channel", 0, || self.get_channel_raw()).await
    }

    async fn select_channel(&self, channel: u8) -> Result<()> {
        if let Err(e) = check_channel(channel) {
            warn!(
                device = %self.name,
                channel,
                "Selected channel does not exist. Choose channel 1 or 2."
            );
            return Err(e);
        }
        retry_once(&self.port, "selecting the channel", || self.select(channel)).await
    }

    async fn get_level(&self, channel: u8) -> f64 {
        // A failed selection is already logged; measure whatever is selected.
        let _ = self.select_channel(channel).await;
        self.measure_level().await
    }

    async fn get_full_status(&self) -> BTreeMap<String, String> {
        retry_or(&self.port, "reading the full status", BTreeMap::new(), || async move {
            let channel = self.get_channel_raw().await?;
            let mut status = BTreeMap::new();
            status.insert("channel".to_string(), channel.to_string());
            status.insert("status".to_string(), self.ask("STAT?").await?);
            status.insert("units".to_string(), self.ask("UNITS?").await?);
            status.insert("type".to_string(), self.ask(&format!("TYPE? {}", channel)).await?);
            status.insert("level".to_string(), self.ask(&format!("MEAS? {}", channel)).await?);
            status.insert("high".to_string(), self.ask("HIGH?").await?);
            status.insert("low".to_string(), self.ask("LOW?").await?);
            status.insert("fill".to_string(), self.ask(&format!("FILL? {}", channel)).await?);
            Ok(status)
        })
        .await
    }

    async fn get_fill_status(&self, channel: u8) -> FillStatus {
        retry_or(&self.port, "reading the fill status", FillStatus::Unknown, || async move {
            parse_fill_status(&self.ask(&format!("FILL? {}", channel)).await?)
        })
        .await
    }

    async fn get_high_level(&self, channel: u8) -> f64 {
        self.threshold("HIGH", channel).await
    }

    async fn get_low_level(&self, channel: u8) -> f64 {
        self.threshold("LOW", channel).await
    }

    async fn set_high_level(&self, level: f64, channel: u8) {
        self.set_threshold("HIGH", level, channel).await
    }

    async fn set_low_level(&self, level: f64, channel: u8) {
        self.set_threshold("LOW", level, channel).await
    }

    async fn get_type(&self, channel: u8) -> Option<String> {
        let kind = retry_or(&self.port, "reading the type", None, || async move {
            let reply = self.ask(&format!("TYPE? {}", channel)).await?;
            Ok(Some(reply))
        })
        .await?;
        match kind.trim() {
            "0" => Some("lhe".to_string()),
            "1" => Some("ln".to_string()),
            other => {
                error!(device = %self.name, reply = other, "Unknown sensor type");
                None
            }
        }
    }

    async fn set_control_mode(&self, mode: &str, channel: u8) {
        let word = match mode {
            "off" => "OFF",
            "auto" => "AUTO",
            _ => {
                warn!(
                    device = %self.name,
                    mode,
                    "Wrong mode used. Allowed modes for automated refilling are off and auto."
                );
                return;
            }
        };
        let command = format!("MODE {}", word);
        let command = command.as_str();
        let _ = retry_once(&self.port, "setting the control mode", || async move {
            self.select(channel).await?;
            self.send(&command).await
        })
        .await;
    }

    async fn start_fill(&self, channel: u8) {
        let command = format!("FILL {}", channel);
        let command = command.as_str();
        let _ = retry_once(&self.port, "starting the manual filling", || self.send(command)).await;
    }

    async fn reset(&self) {
        let _ = retry_once(&self.port, "resetting the device", || self.send("*RST")).await;
    }
}

impl Lm510 {
    async fn get_channel_raw(&self) -> Result<u8> {
        let reply = self.ask("CHAN?").await?;
        reply
            .trim()
            .parse()
            .with_context(|| format!("cannot parse channel '{}'", reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{LineDevice, SimulatedOpener};
    use tracing_test::traced_test;

    struct Lm510Model {
        channel: u8,
        levels: [f64; 2],
        high: [f64; 2],
        low: [f64; 2],
        auto: [bool; 2],
        filling: Option<u8>,
        silent: bool,
    }

    impl Default for Lm510Model {
        fn default() -> Self {
            Self {
                channel: 1,
                levels: [62.5, 80.0],
                high: [90.0, 90.0],
                low: [30.0, 30.0],
                auto: [false, false],
                filling: None,
                silent: false,
            }
        }
    }

    impl LineDevice for Lm510Model {
        fn handle(&mut self, command: &str) -> Vec<u8> {
            if self.silent {
                return Vec::new();
            }
            let idx = usize::from(self.channel - 1);
            let reply = match command.split_once(' ') {
                None => match command {
                    "CHAN?" => Some(self.channel.to_string()),
                    "HIGH?" => Some(format!("{:.1} %", self.high[idx])),
                    "LOW?" => Some(format!("{:.1} %", self.low[idx])),
                    "STAT?" => Some("0".into()),
                    "UNITS?" => Some("%".into()),
                    "*RST" => {
                        self.filling = None;
                        None
                    }
                    _ => None,
                },
                Some((head, arg)) => {
                    let n: usize = arg.parse().unwrap_or(1);
                    match head {
                        "MEAS?" => Some(format!("{:.1} %", self.levels[n - 1])),
                        "FILL?" => Some(match self.filling {
                            Some(c) if usize::from(c) == n => "12.5 Min".to_string(),
                            _ if self.auto[n - 1] => "0.0 Min".to_string(),
                            _ => "Off".to_string(),
                        }),
                        "TYPE?" => Some(if n == 1 { "0" } else { "1" }.into()),
                        "CHAN" => {
                            self.channel = arg.parse().unwrap_or(1);
                            None
                        }
                        "HIGH" => {
                            self.high[idx] = arg.parse().unwrap_or(0.0);
                            None
                        }
                        "LOW" => {
                            self.low[idx] = arg.parse().unwrap_or(0.0);
                            None
                        }
                        "MODE" => {
                            self.auto[idx] = arg == "AUTO";
                            None
                        }
                        "FILL" => {
                            self.filling = arg.parse().ok();
                            None
                        }
                        _ => None,
                    }
                }
            };
            let mut out = format!("{}\n", command);
            if let Some(reply) = reply {
                out.push_str(&format!("{}\n", reply));
            }
            out.into_bytes()
        }
    }

    async fn sensor() -> (Lm510, SimulatedOpener<Lm510Model>) {
        let opener = SimulatedOpener::new(Lm510Model::default(), b'\n');
        let config = Lm510Config {
            timeout_ms: 50,
            ..Default::default()
        };
        let lm = Lm510::new("lm510", &config, Arc::new(opener.clone()));
        lm.on_activate().await.unwrap();
        (lm, opener)
    }

    #[test]
    fn reply_parsing() {
        assert_eq!(parse_value("35.2 cm").unwrap(), 35.2);
        assert_eq!(parse_fill_status("Off").unwrap(), FillStatus::Off);
        assert_eq!(parse_fill_status("TIMEOUT").unwrap(), FillStatus::Timeout);
        assert_eq!(parse_fill_status("3.5 Min").unwrap(), FillStatus::Filling(3.5));
    }

    #[tokio::test]
    async fn level_per_channel() {
        let (lm, _) = sensor().await;
        assert_eq!(lm.get_channel().await, 1);
        assert_eq!(lm.measure_level().await, 62.5);
        assert_eq!(lm.get_level(2).await, 80.0);
        assert_eq!(lm.get_channel().await, 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn invalid_channel_is_refused() {
        let (lm, _) = sensor().await;
        let err = lm.select_channel(3).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DaqError>(),
            Some(DaqError::InvalidArgument(_))
        ));
        assert!(logs_contain("Selected channel does not exist"));
        assert_eq!(lm.get_high_level(0).await, -1.0);
    }

    #[tokio::test]
    async fn thresholds_act_on_selected_channel() {
        let (lm, opener) = sensor().await;
        lm.set_high_level(85.0, 2).await;
        lm.set_low_level(40.0, 2).await;
        assert_eq!(lm.get_high_level(2).await, 85.0);
        assert_eq!(lm.get_low_level(2).await, 40.0);
        assert_eq!(lm.get_high_level(1).await, 90.0);
        assert_eq!(opener.with_model(|m| m.high), [90.0, 85.0]);
    }

    #[tokio::test]
    async fn fill_control() {
        let (lm, _) = sensor().await;
        assert_eq!(lm.get_fill_status(1).await, FillStatus::Off);
        lm.set_control_mode("auto", 1).await;
        assert_eq!(lm.get_fill_status(1).await, FillStatus::Filling(0.0));
        lm.start_fill(2).await;
        assert_eq!(lm.get_fill_status(2).await, FillStatus::Filling(12.5));
        lm.reset().await;
        assert_eq!(lm.get_fill_status(2).await, FillStatus::Off);
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_mode_is_ignored() {
        let (lm, opener) = sensor().await;
        lm.set_control_mode("manual", 1).await;
        assert!(logs_contain("Wrong mode used"));
        assert_eq!(opener.with_model(|m| m.auto), [false, false]);
    }

    #[tokio::test]
    async fn sensor_types() {
        let (lm, _) = sensor().await;
        assert_eq!(lm.get_type(1).await.as_deref(), Some("lhe"));
        assert_eq!(lm.get_type(2).await.as_deref(), Some("ln"));
    }

    #[tokio::test]
    #[traced_test]
    async fn silent_device_yields_defaults() {
        let (lm, opener) = sensor().await;
        opener.with_model(|m| m.silent = true);
        assert_eq!(lm.measure_level().await, 0.0);
        assert_eq!(lm.get_channel().await, 0);
        assert_eq!(lm.get_low_level(1).await, -1.0);
        assert_eq!(lm.get_fill_status(1).await, FillStatus::Unknown);
        assert!(lm.get_full_status().await.is_empty());
        assert!(logs_contain("failed again after reconnect"));
    }

    #[tokio::test]
    async fn full_status_collects_fields() {
        let (lm, _) = sensor().await;
        let status = lm.get_full_status().await;
        assert_eq!(status["channel"], "1");
        assert_eq!(status["type"], "0");
        assert_eq!(status["fill"], "Off");
    }
}
