//! Simulated scanning probe controller.
//!
//! Stands in for the vendor SPM library behind [`LineScanner`]. A line runs
//! as a tokio task: after `time_forward` seconds it emits one
//! [`LineEvent::Data`] with `line_points` samples of a synthetic topography,
//! followed by [`LineEvent::LineEnd`].

use crate::error::DaqError;
use crate::hardware::capabilities::{LineEvent, LineScanner};
use crate::module::{Module, ModuleState, StateCell};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Signals the controller can record.
pub const MEAS_PARAMS: [&str; 15] = [
    "Height(Dac)",
    "Height(Sen)",
    "Iprobe",
    "Mag",
    "Phase",
    "Freq",
    "Nf",
    "Lf",
    "Ex1",
    "SenX",
    "SenY",
    "SenZ",
    "SenX2",
    "SenY2",
    "SenZ2",
];

/// Scan planes: sample scanner, then objective scanner.
pub const PLANES: [&str; 6] = ["XY", "XZ", "YZ", "X2Y2", "X2Z2", "Y2Z2"];

#[derive(Debug, Clone, Copy)]
struct LineSetup {
    x: (f64, f64),
    y: (f64, f64),
    time_forward: f64,
}

#[derive(Default)]
struct ScanState {
    line_points: usize,
    params: Vec<String>,
    line: Option<LineSetup>,
    running: Option<JoinHandle<()>>,
}

/// In-process line scanner.
pub struct SimulatedLineScanner {
    name: String,
    events: UnboundedSender<LineEvent>,
    receiver: Mutex<Option<UnboundedReceiver<LineEvent>>>,
    scan: Mutex<ScanState>,
    state: StateCell,
}

impl SimulatedLineScanner {
    /// Scanner with an open event channel.
    pub fn new(name: &str) -> Self {
        let (events, receiver) = unbounded_channel();
        Self {
            name: name.to_string(),
            events,
            receiver: Mutex::new(Some(receiver)),
            scan: Mutex::new(ScanState::default()),
            state: StateCell::new(),
        }
    }

    /// Synthetic surface in arbitrary units; coordinates in um.
    fn topography(x: f64, y: f64) -> f32 {
        ((x * 0.8).sin() * (y * 0.6).cos() * 10.0 + 0.05 * x) as f32
    }

    /// Parameters selected by the last `setup_scan_common`.
    pub async fn active_params(&self) -> Vec<String> {
        self.scan.lock().await.params.clone()
    }
}

#[async_trait]
impl Module for SimulatedLineScanner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_activate(&self) -> Result<()> {
        self.state.set(ModuleState::Idle);
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        self.finish_scan().await?;
        self.state.set(ModuleState::Deactivated);
        Ok(())
    }

    fn state(&self) -> ModuleState {
        self.state.get()
    }
}

#[async_trait]
impl LineScanner for SimulatedLineScanner {
    fn available_params(&self) -> Vec<String> {
        MEAS_PARAMS.iter().map(|p| p.to_string()).collect()
    }

    async fn setup_scan_common(&self, plane: &str, line_points: usize, params: &[String]) -> Result<()> {
        if !PLANES.contains(&plane) {
            return Err(DaqError::InvalidArgument(format!(
                "plane '{}' is not one of {:?}",
                plane, PLANES
            ))
            .into());
        }
        if line_points == 0 {
            return Err(DaqError::InvalidArgument("line_points must be positive".into()).into());
        }
        let mut accepted = Vec::new();
        for param in params {
            if MEAS_PARAMS.contains(&param.as_str()) {
                accepted.push(param.clone());
            } else {
                debug!(scanner = %self.name, param = %param, "Skipping unknown measurement parameter");
            }
        }
        if accepted.is_empty() {
            return Err(DaqError::InvalidArgument(format!(
                "none of {:?} is a measurement parameter",
                params
            ))
            .into());
        }
        let mut scan = self.scan.lock().await;
        scan.line_points = line_points;
        scan.params = accepted;
        scan.line = None;
        Ok(())
    }

    async fn setup_scan_line(
        &self,
        x_start: f64,
        x_stop: f64,
        y_start: f64,
        y_stop: f64,
        time_forward: f64,
        _time_back: f64,
    ) -> Result<()> {
        let mut scan = self.scan.lock().await;
        if scan.line_points == 0 {
            return Err(DaqError::ModuleNotActive("scan not set up".into()).into());
        }
        scan.line = Some(LineSetup {
            x: (x_start, x_stop),
            y: (y_start, y_stop),
            time_forward: time_forward.max(0.0),
        });
        Ok(())
    }

    async fn scan_line(&self) -> Result<()> {
        let mut scan = self.scan.lock().await;
        let line = scan
            .line
            .ok_or_else(|| DaqError::ModuleNotActive("no scan line configured".into()))?;
        if scan.running.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(DaqError::ModuleBusy.into());
        }
        self.state.set(ModuleState::Locked);

        let points = scan.line_points;
        let events = self.events.clone();
        scan.running = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(line.time_forward)).await;
            let step = |range: (f64, f64), i: usize| {
                if points > 1 {
                    range.0 + (range.1 - range.0) * i as f64 / (points - 1) as f64
                } else {
                    range.0
                }
            };
            let values = (0..points)
                .map(|i| Self::topography(step(line.x, i), step(line.y, i)))
                .collect();
            let _ = events.send(LineEvent::Data(values));
            let _ = events.send(LineEvent::LineEnd);
        }));
        Ok(())
    }

    async fn take_line_receiver(&self) -> Option<UnboundedReceiver<LineEvent>> {
        self.receiver.lock().await.take()
    }

    async fn finish_scan(&self) -> Result<()> {
        let mut scan = self.scan.lock().await;
        if let Some(handle) = scan.running.take() {
            handle.abort();
        }
        scan.line = None;
        if self.state.get() == ModuleState::Locked {
            self.state.set(ModuleState::Idle);
        }
        Ok(())
    }

    async fn send_log_message(&self, message: &str) -> Result<String> {
        info!(scanner = %self.name, message, "SPM log");
        Ok(format!("Message received: {}", message))
    }
}
