//! Periodic polling task with an enable flag.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Runs a step every `period` while enabled.
///
/// Disabling lets the current step finish; the task exits at its next wake-up.
pub struct PollLoop {
    name: String,
    enabled: Arc<AtomicBool>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl PollLoop {
    /// Stopped loop; `name` only labels log lines.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: Arc::new(AtomicBool::new(false)),
            task: StdMutex::new(None),
        }
    }

    /// Whether the loop is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Start polling. Does nothing if already enabled.
    pub fn start<F, Fut>(&self, period: Duration, mut step: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        let enabled = Arc::clone(&self.enabled);
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            debug!(module = %name, period_ms = period.as_millis() as u64, "Polling started");
            loop {
                tokio::time::sleep(period).await;
                if !enabled.load(Ordering::SeqCst) {
                    break;
                }
                step().await;
            }
            debug!(module = %name, "Polling stopped");
        });
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        // A loop disabled and re-enabled within one period would otherwise run twice.
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    /// Clear the enable flag.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Clear the flag and cancel the task immediately.
    pub fn shutdown(&self) {
        self.stop();
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
