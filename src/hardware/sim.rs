//! In-memory device simulation.
//!
//! A [`LineDevice`] is a model of an instrument's command set: it receives one
//! command line at a time and returns the bytes the instrument would send
//! back. [`SimulatedOpener`] runs a model behind a `tokio::io::duplex` pipe so
//! drivers exercise exactly the same [`InstrumentPort`] code path they use with
//! real hardware.
//!
//! The model is shared between connections, so state survives a reconnect and
//! tests can inspect it afterwards.
//!
//! # Example
//!
//! ```
//! use daq_modules::hardware::sim::{ScriptedDevice, SimulatedOpener};
//! use daq_modules::hardware::transport::InstrumentPort;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let device = ScriptedDevice::new().reply("*IDN?", "SIM,1\n");
//! let opener = SimulatedOpener::new(device, b'\n');
//! let port = InstrumentPort::new("sim", Arc::new(opener.clone()));
//! port.connect().await.unwrap();
//! assert_eq!(port.query("*IDN?").await.unwrap(), "SIM,1");
//! assert_eq!(opener.with_model(|d| d.commands().to_vec()), vec!["*IDN?"]);
//! # })
//! ```
//!
//! [`InstrumentPort`]: crate::hardware::transport::InstrumentPort

use crate::hardware::transport::{DynSerial, PortOpener};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Behavioural model of an ASCII instrument.
pub trait LineDevice: Send + 'static {
    /// Handle one command (terminator and surrounding whitespace removed).
    /// An empty return value means the device stays silent.
    fn handle(&mut self, command: &str) -> Vec<u8>;
}

/// Opener that connects a driver to a shared [`LineDevice`] model.
pub struct SimulatedOpener<D: LineDevice> {
    model: Arc<Mutex<D>>,
    terminator: u8,
    opens: Arc<AtomicUsize>,
    failing_opens: Arc<AtomicUsize>,
}

impl<D: LineDevice> Clone for SimulatedOpener<D> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
            terminator: self.terminator,
            opens: Arc::clone(&self.opens),
            failing_opens: Arc::clone(&self.failing_opens),
        }
    }
}

impl<D: LineDevice> SimulatedOpener<D> {
    /// Wrap `model`; incoming commands are split on `terminator`.
    pub fn new(model: D, terminator: u8) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            terminator,
            opens: Arc::new(AtomicUsize::new(0)),
            failing_opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `count` open attempts fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Run `f` against the model.
    pub fn with_model<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        let mut model = self.model.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut model)
    }
}

#[async_trait]
impl<D: LineDevice> PortOpener for SimulatedOpener<D> {
    async fn open(&self) -> Result<DynSerial> {
        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(anyhow!("simulated open failure"));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(spawn_device(Arc::clone(&self.model), self.terminator))
    }

    fn describe(&self) -> String {
        "simulated device".to_string()
    }
}

/// Serve `model` over one end of an in-memory pipe and return the other end.
pub fn spawn_device<D: LineDevice>(model: Arc<Mutex<D>>, terminator: u8) -> DynSerial {
    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(server);
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(terminator, &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let command = String::from_utf8_lossy(&buf).trim().to_string();
            if command.is_empty() {
                continue;
            }
            let reply = match model.lock() {
                Ok(mut device) => device.handle(&command),
                Err(_) => break,
            };
            if !reply.is_empty() && writer.write_all(&reply).await.is_err() {
                break;
            }
        }
    });
    Box::new(client)
}

type Fallback = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// Table-driven model: fixed replies per command, an optional fallback
/// closure, and a log of everything received.
pub struct ScriptedDevice {
    replies: HashMap<String, String>,
    fallback: Option<Fallback>,
    silent_for: usize,
    commands: Vec<String>,
}

impl ScriptedDevice {
    /// Device that answers nothing.
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            fallback: None,
            silent_for: 0,
            commands: Vec::new(),
        }
    }

    /// Fixed reply for an exact command.
    pub fn reply(mut self, command: &str, response: &str) -> Self {
        self.replies.insert(command.to_string(), response.to_string());
        self
    }

    /// Closure consulted for commands without a fixed reply.
    pub fn fallback(mut self, f: impl FnMut(&str) -> Option<String> + Send + 'static) -> Self {
        self.fallback = Some(Box::new(f));
        self
    }

    /// Ignore the next `count` commands (they are still logged).
    pub fn go_silent(&mut self, count: usize) {
        self.silent_for = count;
    }

    /// Every command received so far.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }
}

impl Default for ScriptedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDevice for ScriptedDevice {
    fn handle(&mut self, command: &str) -> Vec<u8> {
        self.commands.push(command.to_string());
        if self.silent_for > 0 {
            self.silent_for -= 1;
            return Vec::new();
        }
        if let Some(reply) = self.replies.get(command) {
            return reply.clone().into_bytes();
        }
        self.fallback
            .as_mut()
            .and_then(|f| f(command))
            .map(String::into_bytes)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::transport::InstrumentPort;
    use std::time::Duration;

    #[tokio::test]
    async fn fallback_and_log() {
        let device = ScriptedDevice::new()
            .reply("A?", "1\n")
            .fallback(|cmd| cmd.strip_prefix("ECHO ").map(|s| format!("{}\n", s)));
        let opener = SimulatedOpener::new(device, b'\n');
        let port = InstrumentPort::new("sim", Arc::new(opener.clone()));
        port.connect().await.unwrap();

        assert_eq!(port.query("A?").await.unwrap(), "1");
        assert_eq!(port.query("ECHO hi").await.unwrap(), "hi");
        port.write("NOREPLY").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let log = opener.with_model(|d| d.commands().to_vec());
        assert_eq!(log, vec!["A?", "ECHO hi", "NOREPLY"]);
    }

    #[tokio::test]
    async fn injected_open_failure_is_one_shot() {
        let opener = SimulatedOpener::new(ScriptedDevice::new(), b'\n');
        opener.fail_next_opens(1);
        let port = InstrumentPort::new("sim", Arc::new(opener.clone()));

        assert!(port.connect().await.is_err());
        assert!(port.connect().await.is_ok());
        assert_eq!(opener.open_count(), 1);
    }

    #[tokio::test]
    async fn model_state_survives_reconnect() {
        let opener = SimulatedOpener::new(ScriptedDevice::new().reply("X?", "7\n"), b'\n');
        let port = InstrumentPort::new("sim", Arc::new(opener.clone()));
        port.connect().await.unwrap();
        port.query("X?").await.unwrap();
        port.reconnect().await.unwrap();
        port.query("X?").await.unwrap();

        assert_eq!(opener.with_model(|d| d.commands().len()), 2);
    }
}
