//! Area scans over a line-based scanning probe controller.
//!
//! The fast axis is x. A scan path is a list of [`ScanLine`]s; each line is
//! configured on the controller, started, and its samples are collected from
//! the controller's event channel until [`LineEvent::LineEnd`]. Lines that
//! run right to left are flipped so every row of the result reads left to
//! right.
//!
//! A point-by-point raster over two [`Movable`] stages and a [`SlowCounter`]
//! shares the stop flag and the module lock.

use crate::error::DaqError;
use crate::hardware::capabilities::{LineEvent, LineScanner, Movable, SlowCounter};
use crate::logic::linspace;
use crate::module::{Module, ModuleState, StateCell};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Receiver poll period while a line runs.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period beyond the line duration before a line counts as lost.
const LINE_TIMEOUT_MARGIN: f64 = 5.0;

/// Order in which lines of an area are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPath {
    /// Alternate direction on every row
    Snake,
    /// Every row left to right
    LeftRight,
    /// Every row left to right, then right to left
    LeftRight2,
}

/// Endpoints of one scan line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanLine {
    /// Fast axis start
    pub x_start: f64,
    /// Fast axis stop
    pub x_stop: f64,
    /// Slow axis start
    pub y_start: f64,
    /// Slow axis stop
    pub y_stop: f64,
}

impl ScanLine {
    /// Line runs right to left
    pub fn is_reversed(&self) -> bool {
        self.x_start > self.x_stop
    }
}

/// Lines for `rows` rows between `y_start` and `y_stop`.
pub fn create_scan_path(
    path: ScanPath,
    x_start: f64,
    x_stop: f64,
    y_start: f64,
    y_stop: f64,
    rows: usize,
) -> Vec<ScanLine> {
    let forward = |y| ScanLine {
        x_start,
        x_stop,
        y_start: y,
        y_stop: y,
    };
    let backward = |y| ScanLine {
        x_start: x_stop,
        x_stop: x_start,
        y_start: y,
        y_stop: y,
    };
    let ys = linspace(y_start, y_stop, rows);
    match path {
        ScanPath::LeftRight => ys.into_iter().map(forward).collect(),
        ScanPath::LeftRight2 => ys.into_iter().flat_map(|y| [forward(y), backward(y)]).collect(),
        ScanPath::Snake => ys
            .into_iter()
            .enumerate()
            .map(|(i, y)| if i % 2 == 0 { forward(y) } else { backward(y) })
            .collect(),
    }
}

/// Parameters of an area scan. Coordinates in um, times in s.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AreaScan {
    /// Fast axis start
    pub x_start: f64,
    /// Fast axis stop
    pub x_stop: f64,
    /// Samples per line
    pub x_num: usize,
    /// Slow axis start
    pub y_start: f64,
    /// Slow axis stop
    pub y_stop: f64,
    /// Number of rows
    pub y_num: usize,
    /// Duration of a line
    pub time_forward: f64,
    /// Duration of the return move
    pub time_back: f64,
    /// Scan plane, e.g. `XY`
    pub plane: String,
    /// Signals to record
    pub params: Vec<String>,
    /// Line order
    pub path: ScanPath,
}

impl Default for AreaScan {
    fn default() -> Self {
        Self {
            x_start: 48.0,
            x_stop: 53.0,
            x_num: 40,
            y_start: 47.0,
            y_stop: 52.0,
            y_num: 40,
            time_forward: 1.5,
            time_back: 1.5,
            plane: "XY".to_string(),
            params: vec!["Phase".into(), "Height(Dac)".into(), "Height(Sen)".into()],
            path: ScanPath::LeftRight2,
        }
    }
}

struct PointStages {
    x: Arc<dyn Movable>,
    y: Arc<dyn Movable>,
    counter: Arc<dyn SlowCounter>,
}

struct Inner {
    name: String,
    spm: Arc<dyn LineScanner>,
    receiver: Mutex<Option<UnboundedReceiver<LineEvent>>>,
    stop: AtomicBool,
    state: StateCell,
    rows: StdMutex<Vec<Vec<f32>>>,
}

impl Inner {
    fn create_meas_params(&self, requested: &[String]) -> Vec<String> {
        let available = self.spm.available_params();
        let params: Vec<String> = requested
            .iter()
            .filter(|p| available.contains(p))
            .cloned()
            .collect();
        if params.is_empty() {
            error!(
                module = %self.name,
                requested = ?requested,
                "No valid measurement parameter, choose from {:?}",
                available
            );
        }
        params
    }

    async fn run_locked(&self, scan: &AreaScan) -> Result<Vec<Vec<f32>>> {
        let result = self.scan_area(scan).await;
        if let Err(e) = &result {
            error!(module = %self.name, error = %e, "Area scan failed");
            let _ = self.spm.finish_scan().await;
        }
        self.state.unlock();
        result
    }

    async fn scan_area(&self, scan: &AreaScan) -> Result<Vec<Vec<f32>>> {
        let params = self.create_meas_params(&scan.params);
        if params.is_empty() {
            return Err(DaqError::InvalidArgument("no valid measurement parameter".into()).into());
        }
        self.spm
            .setup_scan_common(&scan.plane, scan.x_num, &params)
            .await?;
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clear();

        let mut receiver = self.receiver.lock().await;
        let receiver = receiver
            .as_mut()
            .ok_or_else(|| DaqError::ModuleNotActive(self.name.clone()))?;
        while receiver.try_recv().is_ok() {}

        let lines = create_scan_path(
            scan.path,
            scan.x_start,
            scan.x_stop,
            scan.y_start,
            scan.y_stop,
            scan.y_num,
        );
        let line_timeout = scan.time_forward + scan.time_back + LINE_TIMEOUT_MARGIN;
        let mut image = Vec::with_capacity(lines.len());

        for (index, line) in lines.iter().enumerate() {
            // The back line of a forward/back pair always completes.
            let pair_open = scan.path == ScanPath::LeftRight2 && line.is_reversed();
            if self.stop.load(Ordering::SeqCst) && !pair_open {
                info!(module = %self.name, line = index, "Area scan stopped");
                break;
            }
            self.spm
                .setup_scan_line(
                    line.x_start,
                    line.x_stop,
                    line.y_start,
                    line.y_stop,
                    scan.time_forward,
                    scan.time_back,
                )
                .await?;
            self.spm.scan_line().await?;

            let Some(mut samples) = self.collect_line(receiver, line_timeout, !pair_open).await? else {
                info!(module = %self.name, line = index, "Area scan stopped during line");
                break;
            };
            if line.is_reversed() {
                let chunk = scan.x_num.max(1);
                samples.chunks_mut(chunk).for_each(|c| c.reverse());
            }
            debug!(module = %self.name, line = index, samples = samples.len(), "Line complete");
            self.rows
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(samples.clone());
            image.push(samples);
        }

        self.spm.finish_scan().await?;
        Ok(image)
    }

    /// Samples of one line, or `None` when a stop request interrupted it.
    /// With `interruptible` false the line runs to its end regardless.
    async fn collect_line(
        &self,
        receiver: &mut UnboundedReceiver<LineEvent>,
        timeout_secs: f64,
        interruptible: bool,
    ) -> Result<Option<Vec<f32>>> {
        let deadline = Instant::now() + Duration::from_secs_f64(timeout_secs.max(0.0));
        let mut samples = Vec::new();
        loop {
            match tokio::time::timeout(POLL_INTERVAL, receiver.recv()).await {
                Ok(Some(LineEvent::Data(values))) => samples.extend(values),
                Ok(Some(LineEvent::LineEnd)) => return Ok(Some(samples)),
                Ok(None) => {
                    return Err(DaqError::Instrument("line event channel closed".into()).into());
                }
                Err(_) => {
                    if interruptible && self.stop.load(Ordering::SeqCst) {
                        return Ok(None);
                    }
                    if Instant::now() >= deadline {
                        return Err(DaqError::Timeout(format!(
                            "no line end after {:.1} s",
                            timeout_secs
                        ))
                        .into());
                    }
                }
            }
        }
    }
}

/// Logic module driving area scans.
pub struct ScannerLogic {
    inner: Arc<Inner>,
    points: Option<PointStages>,
    task: StdMutex<Option<JoinHandle<Result<Vec<Vec<f32>>>>>>,
}

impl ScannerLogic {
    /// Logic over the line scanner `spm`.
    pub fn new(name: &str, spm: Arc<dyn LineScanner>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                spm,
                receiver: Mutex::new(None),
                stop: AtomicBool::new(false),
                state: StateCell::new(),
                rows: StdMutex::new(Vec::new()),
            }),
            points: None,
            task: StdMutex::new(None),
        }
    }

    /// Enable [`scan_points`](Self::scan_points) over two stages and a counter.
    pub fn with_point_scanner(
        mut self,
        x: Arc<dyn Movable>,
        y: Arc<dyn Movable>,
        counter: Arc<dyn SlowCounter>,
    ) -> Self {
        self.points = Some(PointStages { x, y, counter });
        self
    }

    /// Requested parameters the controller can record. Logs an error when
    /// none remain.
    pub fn create_meas_params(&self, requested: &[String]) -> Vec<String> {
        self.inner.create_meas_params(requested)
    }

    fn lock(&self) -> Result<()> {
        match self.inner.state.get() {
            ModuleState::Deactivated => Err(DaqError::ModuleNotActive(self.inner.name.clone()).into()),
            ModuleState::Locked => {
                warn!(module = %self.inner.name, "Scan already running");
                Err(DaqError::ModuleBusy.into())
            }
            ModuleState::Idle if self.inner.state.try_lock() => {
                self.inner.stop.store(false, Ordering::SeqCst);
                Ok(())
            }
            ModuleState::Idle => Err(DaqError::ModuleBusy.into()),
        }
    }

    /// Run an area scan and return one row per line, left to right.
    pub async fn scan_area(&self, scan: &AreaScan) -> Result<Vec<Vec<f32>>> {
        self.lock()?;
        self.inner.run_locked(scan).await
    }

    /// Run an area scan in the background.
    pub fn start_measure(&self, scan: AreaScan) -> Result<()> {
        self.lock()?;
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run_locked(&scan).await });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Request a stop and end the controller's scan.
    ///
    /// A running background scan finishes the controller scan itself once the
    /// current line is done.
    pub async fn stop_measure(&self) -> Result<()> {
        self.inner.stop.store(true, Ordering::SeqCst);
        let running = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished());
        if running {
            return Ok(());
        }
        self.inner.spm.finish_scan().await
    }

    /// Wait for the background scan and return its rows.
    pub async fn wait_for_measure(&self) -> Result<Vec<Vec<f32>>> {
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        match handle {
            Some(handle) => handle.await.context("scan task panicked")?,
            None => Ok(self.last_scan()),
        }
    }

    /// Rows collected by the current or last scan
    pub fn last_scan(&self) -> Vec<Vec<f32>> {
        self.inner
            .rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Forward a message to the controller log.
    pub async fn send_log_message(&self, message: &str) -> Result<String> {
        self.inner.spm.send_log_message(message).await
    }

    /// Raster the stages over the area and read the counter at every point.
    ///
    /// Returns mean count rates, one row per y value. A stop request ends the
    /// scan after the current point; the rows so far are returned.
    pub async fn scan_points(&self, scan: &AreaScan, samples_per_point: usize) -> Result<Vec<Vec<f64>>> {
        let stages = self.points.as_ref().ok_or_else(|| {
            DaqError::Configuration(format!(
                "module '{}': point scans need stage_x, stage_y and counter",
                self.inner.name
            ))
        })?;
        self.lock()?;
        let result = self.raster(stages, scan, samples_per_point).await;
        self.inner.state.unlock();
        result
    }

    async fn raster(
        &self,
        stages: &PointStages,
        scan: &AreaScan,
        samples_per_point: usize,
    ) -> Result<Vec<Vec<f64>>> {
        let xs = linspace(scan.x_start, scan.x_stop, scan.x_num);
        let mut image = Vec::with_capacity(scan.y_num);
        'rows: for y in linspace(scan.y_start, scan.y_stop, scan.y_num) {
            stages.y.move_abs(y).await?;
            stages.y.wait_settled().await?;
            let mut row = Vec::with_capacity(xs.len());
            for &x in &xs {
                if self.inner.stop.load(Ordering::SeqCst) {
                    info!(module = %self.inner.name, "Point scan stopped");
                    if !row.is_empty() {
                        image.push(row);
                    }
                    break 'rows;
                }
                stages.x.move_abs(x).await?;
                stages.x.wait_settled().await?;
                let (mean, _) = stages.counter.count_mean_std(samples_per_point).await?;
                row.push(mean);
            }
            image.push(row);
        }
        Ok(image)
    }

    /// Request a point scan to stop.
    pub fn stop_points(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Module for ScannerLogic {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn on_activate(&self) -> Result<()> {
        let mut receiver = self.inner.receiver.lock().await;
        if receiver.is_none() {
            *receiver = self.inner.spm.take_line_receiver().await;
        }
        if receiver.is_none() {
            return Err(DaqError::Instrument(format!(
                "module '{}': line events already claimed by another module",
                self.inner.name
            ))
            .into());
        }
        self.inner.state.set(ModuleState::Idle);
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        self.inner.stop.store(true, Ordering::SeqCst);
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.inner.spm.finish_scan().await?;
        self.inner.state.set(ModuleState::Deactivated);
        Ok(())
    }

    fn state(&self) -> ModuleState {
        self.inner.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCounter, MockStage};
    use crate::hardware::spm_sim::SimulatedLineScanner;
    use tracing_test::traced_test;

    fn small_scan(path: ScanPath) -> AreaScan {
        AreaScan {
            x_num: 8,
            y_num: 3,
            time_forward: 0.2,
            time_back: 0.2,
            path,
            ..Default::default()
        }
    }

    async fn active(spm: Arc<SimulatedLineScanner>) -> ScannerLogic {
        spm.on_activate().await.unwrap();
        let logic = ScannerLogic::new("afm", spm);
        logic.on_activate().await.unwrap();
        logic
    }

    #[test]
    fn paths_visit_rows_in_order() {
        let lr = create_scan_path(ScanPath::LeftRight, 0.0, 1.0, 0.0, 2.0, 3);
        assert_eq!(lr.len(), 3);
        assert!(lr.iter().all(|l| !l.is_reversed()));
        assert_eq!(lr[2].y_start, 2.0);

        let lr2 = create_scan_path(ScanPath::LeftRight2, 0.0, 1.0, 0.0, 2.0, 3);
        assert_eq!(lr2.len(), 6);
        assert!(lr2[1].is_reversed());
        assert_eq!(lr2[0].y_start, lr2[1].y_start);

        let snake = create_scan_path(ScanPath::Snake, 0.0, 1.0, 0.0, 2.0, 3);
        let reversed: Vec<bool> = snake.iter().map(ScanLine::is_reversed).collect();
        assert_eq!(reversed, vec![false, true, false]);
    }

    #[test]
    fn path_names_deserialize() {
        let scan: AreaScan = toml::from_str("path = \"snake\"\nx_num = 10").unwrap();
        assert_eq!(scan.path, ScanPath::Snake);
        assert_eq!(scan.x_num, 10);
        assert_eq!(scan.x_start, 48.0);
    }

    #[traced_test]
    #[tokio::test]
    async fn unknown_params_are_dropped() {
        let logic = ScannerLogic::new("afm", Arc::new(SimulatedLineScanner::new("spm")));
        let params = logic.create_meas_params(&["Phase".into(), "Bogus".into()]);
        assert_eq!(params, vec!["Phase".to_string()]);
        assert!(logic.create_meas_params(&["Bogus".into()]).is_empty());
        assert!(logs_contain("No valid measurement parameter"));
    }

    #[tokio::test(start_paused = true)]
    async fn back_lines_are_flipped() {
        let logic = active(Arc::new(SimulatedLineScanner::new("spm"))).await;
        let image = logic.scan_area(&small_scan(ScanPath::LeftRight2)).await.unwrap();
        assert_eq!(image.len(), 6);
        assert!(image.iter().all(|row| row.len() == 8));
        for pair in image.chunks(2) {
            for (fw, bw) in pair[0].iter().zip(&pair[1]) {
                assert!((fw - bw).abs() < 1e-4);
            }
        }
        assert_eq!(logic.state(), ModuleState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn second_scan_is_refused_while_running() {
        let logic = active(Arc::new(SimulatedLineScanner::new("spm"))).await;
        logic.start_measure(small_scan(ScanPath::Snake)).unwrap();
        let err = logic.start_measure(small_scan(ScanPath::Snake)).unwrap_err();
        assert!(matches!(err.downcast_ref::<DaqError>(), Some(DaqError::ModuleBusy)));
        let image = logic.wait_for_measure().await.unwrap();
        assert_eq!(image.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_scan_early() {
        let logic = active(Arc::new(SimulatedLineScanner::new("spm"))).await;
        logic.start_measure(small_scan(ScanPath::LeftRight)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        logic.stop_measure().await.unwrap();
        let image = logic.wait_for_measure().await.unwrap();
        assert!(image.len() < 3);
        assert_eq!(logic.state(), ModuleState::Idle);
    }

    /// Line scanner that counts `finish_scan` calls.
    struct CountingScanner {
        inner: SimulatedLineScanner,
        finishes: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl LineScanner for CountingScanner {
        fn available_params(&self) -> Vec<String> {
            self.inner.available_params()
        }
        async fn setup_scan_common(&self, plane: &str, line_points: usize, params: &[String]) -> Result<()> {
            self.inner.setup_scan_common(plane, line_points, params).await
        }
        async fn setup_scan_line(&self, x0: f64, x1: f64, y0: f64, y1: f64, fwd: f64, back: f64) -> Result<()> {
            self.inner.setup_scan_line(x0, x1, y0, y1, fwd, back).await
        }
        async fn scan_line(&self) -> Result<()> {
            self.inner.scan_line().await
        }
        async fn take_line_receiver(&self) -> Option<UnboundedReceiver<LineEvent>> {
            self.inner.take_line_receiver().await
        }
        async fn finish_scan(&self) -> Result<()> {
            self.finishes.fetch_add(1, Ordering::SeqCst);
            self.inner.finish_scan().await
        }
        async fn send_log_message(&self, message: &str) -> Result<String> {
            self.inner.send_log_message(message).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_back_line_keeps_pairs_whole() {
        let spm = Arc::new(CountingScanner {
            inner: SimulatedLineScanner::new("spm"),
            finishes: Default::default(),
        });
        let logic = ScannerLogic::new("afm", spm.clone());
        logic.on_activate().await.unwrap();

        logic.start_measure(small_scan(ScanPath::LeftRight2)).unwrap();
        // Forward line of the first row is done after 0.2 s, the back line runs.
        tokio::time::sleep(Duration::from_millis(350)).await;
        logic.stop_measure().await.unwrap();
        let image = logic.wait_for_measure().await.unwrap();

        assert_eq!(image.len(), 2);
        assert!(image.iter().all(|row| row.len() == 8));
        assert_eq!(spm.finishes.load(Ordering::SeqCst), 1);
        assert_eq!(logic.state(), ModuleState::Idle);
    }

    #[tokio::test]
    async fn stop_without_scan_finishes_controller() {
        let spm = Arc::new(CountingScanner {
            inner: SimulatedLineScanner::new("spm"),
            finishes: Default::default(),
        });
        let logic = ScannerLogic::new("afm", spm.clone());
        logic.on_activate().await.unwrap();
        logic.stop_measure().await.unwrap();
        assert_eq!(spm.finishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn receiver_can_only_be_claimed_once() {
        let spm = Arc::new(SimulatedLineScanner::new("spm"));
        let first = ScannerLogic::new("a", spm.clone());
        first.on_activate().await.unwrap();
        let second = ScannerLogic::new("b", spm);
        assert!(second.on_activate().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn point_scan_reads_counter_at_every_point() {
        let spm = Arc::new(SimulatedLineScanner::new("spm"));
        spm.on_activate().await.unwrap();
        let x = Arc::new(MockStage::with_position(48.0));
        let logic = ScannerLogic::new("confocal", spm).with_point_scanner(
            x.clone(),
            Arc::new(MockStage::with_position(47.0)),
            Arc::new(MockCounter::new()),
        );
        logic.on_activate().await.unwrap();

        let scan = AreaScan {
            x_num: 4,
            y_num: 2,
            ..Default::default()
        };
        let image = logic.scan_points(&scan, 10).await.unwrap();
        assert_eq!(image.len(), 2);
        assert_eq!(image[1].len(), 4);
        assert!(image.iter().flatten().all(|&rate| rate > 4e3));
        assert_eq!(x.position().await.unwrap(), 53.0);
    }

    #[tokio::test]
    async fn point_scan_needs_stages() {
        let logic = active(Arc::new(SimulatedLineScanner::new("spm"))).await;
        assert!(logic.scan_points(&AreaScan::default(), 1).await.is_err());
    }
}
