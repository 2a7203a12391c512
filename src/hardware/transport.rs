//! Byte-stream transports for ASCII instruments.
//!
//! Every driver talks to its device through an [`InstrumentPort`]: a line
//! oriented command/response channel over any `AsyncRead + AsyncWrite` stream.
//! The stream is produced by a [`PortOpener`], which lets the port close and
//! reopen itself when a driver retries after an error.
//!
//! Openers:
//! - [`PortSettings`]: serial ports (tokio-serial) and raw TCP sockets, chosen
//!   from a resource string
//! - [`SimulatedOpener`](crate::hardware::sim::SimulatedOpener): in-memory
//!   device models for tests and `--simulate` runs
//!
//! # Resource strings
//!
//! | Form                              | Transport                   |
//! |-----------------------------------|-----------------------------|
//! | `/dev/ttyUSB0`, `COM3`            | serial                      |
//! | `ASRL3::INSTR`                    | serial (`COM3` / `/dev/ttyS2`) |
//! | `TCPIP0::10.0.0.5::5025::SOCKET`  | TCP                         |
//! | `TCPIP0::10.0.0.5::inst0::INSTR`  | TCP, raw SCPI port 5025     |
//! | `tcp://10.0.0.5:7180`             | TCP                         |
//! | `GPIB0::12::INSTR`                | unsupported                 |
//!
//! # Example
//!
//! ```no_run
//! use daq_modules::hardware::transport::{InstrumentPort, PortSettings};
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let settings = PortSettings::new("ASRL3::INSTR".parse()?, 115200);
//! let port = InstrumentPort::new("cobolt", Arc::new(settings)).with_write_terminator("\r");
//! port.connect().await?;
//! let state = port.query("l?").await?;
//! # Ok(())
//! # }
//! ```

use crate::error::DaqError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

/// Raw SCPI socket port used for `TCPIP::host::INSTR` resources.
pub const SCPI_RAW_PORT: u16 = 5025;

// =============================================================================
// Stream types
// =============================================================================

/// Trait alias for async byte streams usable as an instrument link.
///
/// Covers `tokio_serial::SerialStream`, `tokio::net::TcpStream` and
/// `tokio::io::DuplexStream`.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed stream.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Resources
// =============================================================================

/// Where an instrument lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Serial device path or COM name
    Serial(String),
    /// Raw TCP socket
    Tcp {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// GPIB address (no transport available)
    Gpib {
        /// Board index
        board: u32,
        /// Primary address
        address: u32,
    },
}

impl Resource {
    /// Map a VISA `ASRL<n>` board number onto the platform serial device.
    fn asrl_path(number: u32) -> String {
        if cfg!(windows) {
            format!("COM{}", number)
        } else {
            format!("/dev/ttyS{}", number.saturating_sub(1))
        }
    }
}

impl FromStr for Resource {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || DaqError::InvalidArgument(format!("unrecognised resource '{}'", s));

        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
            let port = port.parse().map_err(|_| invalid())?;
            return Ok(Resource::Tcp {
                host: host.to_string(),
                port,
            });
        }

        let upper = s.to_uppercase();
        let fields: Vec<&str> = s.split("::").collect();

        if upper.starts_with("ASRL") {
            let number = fields[0][4..].parse().map_err(|_| invalid())?;
            return Ok(Resource::Serial(Self::asrl_path(number)));
        }

        if upper.starts_with("TCPIP") {
            return match fields.as_slice() {
                [_, host, port, socket] if socket.eq_ignore_ascii_case("SOCKET") => {
                    Ok(Resource::Tcp {
                        host: host.to_string(),
                        port: port.parse().map_err(|_| invalid())?,
                    })
                }
                [_, host, .., instr] if instr.eq_ignore_ascii_case("INSTR") => Ok(Resource::Tcp {
                    host: host.to_string(),
                    port: SCPI_RAW_PORT,
                }),
                _ => Err(invalid()),
            };
        }

        if upper.starts_with("GPIB") {
            let board = fields[0][4..].parse().unwrap_or(0);
            let address = fields
                .get(1)
                .and_then(|a| a.parse().ok())
                .ok_or_else(invalid)?;
            return Ok(Resource::Gpib { board, address });
        }

        if s.is_empty() || s.contains("::") {
            return Err(invalid());
        }
        Ok(Resource::Serial(s.to_string()))
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Serial(path) => write!(f, "{}", path),
            Resource::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Resource::Gpib { board, address } => write!(f, "GPIB{}::{}::INSTR", board, address),
        }
    }
}

// =============================================================================
// Openers
// =============================================================================

/// Produces a fresh stream to the instrument.
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open the link. Called on connect and on every reconnect.
    async fn open(&self) -> Result<DynSerial>;

    /// Human readable description for logs.
    fn describe(&self) -> String;
}

/// Character framing of a serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// 8 data bits, no parity, 1 stop bit
    #[default]
    EightNoneOne,
    /// 7 data bits, odd parity, 1 stop bit
    SevenOddOne,
}

/// Settings for real hardware links.
#[derive(Debug, Clone)]
pub struct PortSettings {
    /// Target resource
    pub resource: Resource,
    /// Baud rate for serial resources (ignored for TCP)
    pub baud_rate: u32,
    /// Serial framing (ignored for TCP)
    pub framing: Framing,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl PortSettings {
    /// Settings with a 5 s connect timeout.
    pub fn new(resource: Resource, baud_rate: u32) -> Self {
        Self {
            resource,
            baud_rate,
            framing: Framing::EightNoneOne,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Override the serial framing.
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Parse `resource` and wrap it as a shared opener.
    pub fn opener(resource: &str, baud_rate: u32) -> Result<Arc<dyn PortOpener>> {
        let resource: Resource = resource.parse()?;
        Ok(Arc::new(Self::new(resource, baud_rate)))
    }
}

#[async_trait]
impl PortOpener for PortSettings {
    async fn open(&self) -> Result<DynSerial> {
        match &self.resource {
            Resource::Serial(path) => open_serial(path, self.baud_rate, self.framing).await,
            Resource::Tcp { host, port } => {
                let addr = format!("{}:{}", host, port);
                let stream = tokio::time::timeout(
                    self.connect_timeout,
                    tokio::net::TcpStream::connect(&addr),
                )
                .await
                .map_err(|_| DaqError::Timeout(format!("connect to {}", addr)))?
                .with_context(|| format!("Failed to connect to {}", addr))?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Resource::Gpib { .. } => Err(DaqError::FeatureNotEnabled("gpib".into()).into()),
        }
    }

    fn describe(&self) -> String {
        match &self.resource {
            Resource::Serial(path) => format!("{} @ {} baud", path, self.baud_rate),
            other => other.to_string(),
        }
    }
}

/// Open a serial port without flow control on a blocking thread.
#[cfg(feature = "tokio_serial")]
pub async fn open_serial(path: &str, baud_rate: u32, framing: Framing) -> Result<DynSerial> {
    use tokio_serial::SerialPortBuilderExt;

    let (data_bits, parity) = match framing {
        Framing::EightNoneOne => (tokio_serial::DataBits::Eight, tokio_serial::Parity::None),
        Framing::SevenOddOne => (tokio_serial::DataBits::Seven, tokio_serial::Parity::Odd),
    };
    let path = path.to_string();
    let port = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open serial port {} at {} baud", path, baud_rate))
    })
    .await
    .context("spawn_blocking for serial port opening failed")??;
    Ok(Box::new(port))
}

/// Serial support is compiled out.
#[cfg(not(feature = "tokio_serial"))]
pub async fn open_serial(_path: &str, _baud_rate: u32, _framing: Framing) -> Result<DynSerial> {
    Err(DaqError::SerialFeatureDisabled.into())
}

// =============================================================================
// InstrumentPort
// =============================================================================

/// Line-oriented command/response channel with reconnect support.
pub struct InstrumentPort {
    name: String,
    opener: Arc<dyn PortOpener>,
    stream: Mutex<Option<BufReader<DynSerial>>>,
    write_terminator: String,
    read_terminator: u8,
    timeout: Duration,
}

impl InstrumentPort {
    /// New disconnected port. Defaults: `\n` both ways, 1 s timeout.
    pub fn new(name: impl Into<String>, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            name: name.into(),
            opener,
            stream: Mutex::new(None),
            write_terminator: "\n".to_string(),
            read_terminator: b'\n',
            timeout: Duration::from_secs(1),
        }
    }

    /// Terminator appended to every written command.
    pub fn with_write_terminator(mut self, terminator: &str) -> Self {
        self.write_terminator = terminator.to_string();
        self
    }

    /// Byte that ends a response line.
    pub fn with_read_terminator(mut self, terminator: u8) -> Self {
        self.read_terminator = terminator;
        self
    }

    /// Read timeout per response.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Port name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured read timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open the link. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = self
                .opener
                .open()
                .await
                .with_context(|| format!("{}: failed to open {}", self.name, self.opener.describe()))?;
            *guard = Some(BufReader::new(stream));
            debug!(port = %self.name, link = %self.opener.describe(), "Port opened");
        }
        Ok(())
    }

    /// Drop the link.
    pub async fn disconnect(&self) {
        if self.stream.lock().await.take().is_some() {
            debug!(port = %self.name, "Port closed");
        }
    }

    /// Close and reopen the link.
    pub async fn reconnect(&self) -> Result<()> {
        self.disconnect().await;
        self.connect().await
    }

    /// Whether a link is open.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Exclusive access for multi-step exchanges.
    pub async fn lock(&self) -> Result<PortSession<'_>> {
        let guard = self.stream.lock().await;
        if guard.is_none() {
            return Err(DaqError::SerialPortNotConnected.into());
        }
        Ok(PortSession { port: self, guard })
    }

    /// Write one command.
    pub async fn write(&self, command: &str) -> Result<()> {
        self.lock().await?.write_line(command).await
    }

    /// Write one command and read one response line.
    pub async fn query(&self, command: &str) -> Result<String> {
        let mut session = self.lock().await?;
        session.write_line(command).await?;
        session.read_line().await
    }

    /// Read one response line.
    pub async fn read_line(&self) -> Result<String> {
        self.lock().await?.read_line().await
    }
}

/// Locked view of an [`InstrumentPort`].
pub struct PortSession<'a> {
    port: &'a InstrumentPort,
    guard: MutexGuard<'a, Option<BufReader<DynSerial>>>,
}

impl PortSession<'_> {
    fn stream(&mut self) -> Result<&mut BufReader<DynSerial>> {
        self.guard
            .as_mut()
            .ok_or_else(|| DaqError::SerialPortNotConnected.into())
    }

    /// Write `command` followed by the write terminator.
    pub async fn write_line(&mut self, command: &str) -> Result<()> {
        let name = self.port.name.clone();
        let data = format!("{}{}", command, self.port.write_terminator);
        self.write_raw(data.as_bytes()).await?;
        trace!(port = %name, command, "Sent");
        Ok(())
    }

    /// Write bytes as they are.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream()?.get_mut();
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read up to the read terminator, trimmed of whitespace.
    pub async fn read_line(&mut self) -> Result<String> {
        let terminator = self.port.read_terminator;
        let timeout = self.port.timeout;
        let name = self.port.name.clone();
        let stream = self.stream()?;

        let mut buf = Vec::new();
        let n = tokio::time::timeout(timeout, stream.read_until(terminator, &mut buf))
            .await
            .map_err(|_| DaqError::Timeout(format!("{}: no response within {:?}", name, timeout)))??;
        if n == 0 {
            return Err(DaqError::SerialUnexpectedEof.into());
        }

        let line = String::from_utf8_lossy(&buf).trim().to_string();
        trace!(port = %name, response = %line, "Received");
        Ok(line)
    }

    /// Read a single byte.
    pub async fn read_byte(&mut self) -> Result<u8> {
        let timeout = self.port.timeout;
        let name = self.port.name.clone();
        let stream = self.stream()?;
        let byte = tokio::time::timeout(timeout, stream.read_u8())
            .await
            .map_err(|_| DaqError::Timeout(format!("{}: no byte within {:?}", name, timeout)))?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => DaqError::SerialUnexpectedEof,
                _ => DaqError::Io(e),
            })?;
        Ok(byte)
    }

    /// Wait `settle`, then return everything that arrives until the line goes
    /// quiet for 50 ms. Nothing is trimmed.
    pub async fn read_available(&mut self, settle: Duration) -> Result<String> {
        tokio::time::sleep(settle).await;
        let stream = self.stream()?;

        let mut collected = BytesMut::with_capacity(256);
        loop {
            collected.reserve(256);
            match tokio::time::timeout(Duration::from_millis(50), stream.read_buf(&mut collected)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        Ok(String::from_utf8_lossy(&collected).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{ScriptedDevice, SimulatedOpener};

    #[test]
    fn parses_resource_strings() {
        assert_eq!(
            "/dev/ttyUSB0".parse::<Resource>().unwrap(),
            Resource::Serial("/dev/ttyUSB0".into())
        );
        assert_eq!(
            "TCPIP0::192.168.1.20::5025::SOCKET".parse::<Resource>().unwrap(),
            Resource::Tcp {
                host: "192.168.1.20".into(),
                port: 5025
            }
        );
        assert_eq!(
            "TCPIP::10.0.0.2::inst0::INSTR".parse::<Resource>().unwrap(),
            Resource::Tcp {
                host: "10.0.0.2".into(),
                port: SCPI_RAW_PORT
            }
        );
        assert_eq!(
            "tcp://magnet-y:7180".parse::<Resource>().unwrap(),
            Resource::Tcp {
                host: "magnet-y".into(),
                port: 7180
            }
        );
        assert_eq!(
            "GPIB0::12::INSTR".parse::<Resource>().unwrap(),
            Resource::Gpib {
                board: 0,
                address: 12
            }
        );
        assert!("TCPIP0::host".parse::<Resource>().is_err());
        assert!("ASRLx::INSTR".parse::<Resource>().is_err());
    }

    #[test]
    fn asrl_maps_to_platform_port() {
        let resource: Resource = "ASRL3::INSTR".parse().unwrap();
        if cfg!(windows) {
            assert_eq!(resource, Resource::Serial("COM3".into()));
        } else {
            assert_eq!(resource, Resource::Serial("/dev/ttyS2".into()));
        }
    }

    #[tokio::test]
    async fn gpib_is_not_supported() {
        let settings = PortSettings::new("GPIB0::3::INSTR".parse().unwrap(), 9600);
        let err = settings.open().await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<DaqError>(),
            Some(DaqError::FeatureNotEnabled(_))
        ));
    }

    #[tokio::test]
    async fn query_round_trip_and_disconnect() {
        let device = ScriptedDevice::new().reply("*IDN?", "ACME,Box,1,1.0\n");
        let opener = SimulatedOpener::new(device, b'\n');
        let port = InstrumentPort::new("test", Arc::new(opener.clone()));

        assert!(port.query("*IDN?").await.is_err());
        port.connect().await.unwrap();
        assert_eq!(port.query("*IDN?").await.unwrap(), "ACME,Box,1,1.0");

        port.disconnect().await;
        assert!(!port.is_connected().await);
        port.reconnect().await.unwrap();
        assert_eq!(opener.open_count(), 2);
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let opener = SimulatedOpener::new(ScriptedDevice::new(), b'\n');
        let port = InstrumentPort::new("quiet", Arc::new(opener))
            .with_timeout(Duration::from_millis(30));
        port.connect().await.unwrap();

        let err = port.query("PING").await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<DaqError>(),
            Some(DaqError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn read_available_collects_raw_reply() {
        let device = ScriptedDevice::new().reply("POWER?", "100.000mW\r\n");
        let port = InstrumentPort::new("opus", Arc::new(SimulatedOpener::new(device, b'\r')))
            .with_write_terminator("\r");
        port.connect().await.unwrap();

        let mut session = port.lock().await.unwrap();
        session.write_line("POWER?").await.unwrap();
        let raw = session
            .read_available(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(raw, "100.000mW\r\n");
    }
}
