//! Single-owner serial link to the motor controller.
//!
//! The link owns the byte channel and serialises every transaction: a request
//! is write → settle delay → read, all under one mutex acquisition so that a
//! reply can never be attributed to the wrong command. Batch transactions
//! hold the same mutex across a whole list of requests.
//!
//! The controller speaks 9600 baud, even parity, seven data bits. Reads have
//! a ~3 s deadline on the real port; an expired deadline yields an empty
//! string, which callers classify as "no reply" rather than an error of the
//! link itself.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use serialport::{DataBits, Parity, SerialPort, StopBits};
use tokio::sync::Mutex;

use crate::error::{DriveError, DriveResult};
use crate::protocol;

/// The motor controller's serial line.
pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyS0";

/// Port name that selects the in-process controller simulator.
pub const SIMULATOR_PORT: &str = "sim";

/// Wait between writing a command and reading its reply.
pub const SETTLE_TIME: Duration = Duration::from_millis(100);

const BAUD_RATE: u32 = 9600;
const READ_DEADLINE: Duration = Duration::from_secs(3);

/// A byte channel that behaves like the motor controller's serial line.
///
/// The real port and the simulator both implement this, so everything above
/// the link is unaware of which it is talking to.
#[async_trait]
pub trait Transport: Send {
    /// Open the channel, applying the port defaults.
    async fn open(&mut self) -> DriveResult<()>;

    /// Close the channel. Idempotent.
    async fn close(&mut self) -> DriveResult<()>;

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;

    /// The configured port name.
    fn port_name(&self) -> &str;

    /// Write raw bytes.
    async fn write(&mut self, bytes: &[u8]) -> DriveResult<()>;

    /// Read one line terminated by `\n`. An expired read deadline returns
    /// whatever was collected so far, possibly the empty string.
    async fn read_line(&mut self) -> DriveResult<String>;
}

/// One raw transaction result: the first reply line plus any banner
/// continuation lines.
#[derive(Debug, Clone)]
pub struct RawReply {
    /// The first line read back; empty when the deadline expired.
    pub first: String,
    /// Banner continuation lines, up to the empty-line sentinel.
    pub rest: Vec<String>,
}

/// The serial link. Cheap to clone; all clones share the underlying channel
/// and its mutex.
#[derive(Clone)]
pub struct SerialLink {
    transport: Arc<Mutex<Box<dyn Transport>>>,
    port_name: String,
    settle: Duration,
}

impl SerialLink {
    /// Wrap a transport (real port or simulator) in the link discipline.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let port_name = transport.port_name().to_string();
        Self {
            transport: Arc::new(Mutex::new(transport)),
            port_name,
            settle: SETTLE_TIME,
        }
    }

    /// The configured port name.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// True when the link is talking to the in-process simulator.
    pub fn is_simulated(&self) -> bool {
        self.port_name != DEFAULT_SERIAL_PORT
    }

    /// Open the underlying channel with its defaults.
    pub async fn open(&self) -> DriveResult<()> {
        let mut transport = self.transport.lock().await;
        transport.open().await?;
        info!("Connected to {}", self.port_name);
        Ok(())
    }

    /// Close the underlying channel.
    pub async fn close(&self) -> DriveResult<()> {
        let mut transport = self.transport.lock().await;
        transport.close().await?;
        info!("Disconnected from {}", self.port_name);
        Ok(())
    }

    /// Whether the channel is open, checked under the link mutex so nothing
    /// can close it mid-answer.
    pub async fn is_open(&self) -> bool {
        self.transport.lock().await.is_open()
    }

    /// One write–settle–read cycle under a single mutex acquisition. If the
    /// first line opens a `Mclennan` banner, continuation lines are read
    /// until the empty-line sentinel, still under the same acquisition.
    pub async fn request(&self, wire: &str) -> DriveResult<RawReply> {
        let mut transport = self.transport.lock().await;
        Self::cycle(&mut transport, wire, self.settle).await
    }

    /// A list of write–settle–read cycles under one continuous mutex
    /// acquisition, so no other caller can interleave bytes between them.
    pub async fn request_batch(&self, wires: &[String]) -> DriveResult<Vec<RawReply>> {
        let mut transport = self.transport.lock().await;
        let mut replies = Vec::with_capacity(wires.len());
        for wire in wires {
            replies.push(Self::cycle(&mut transport, wire, self.settle).await?);
        }
        Ok(replies)
    }

    /// Read lines until the empty-line sentinel, logging each. Used to drain
    /// sequence listings that follow some replies.
    pub async fn drain_lines(&self) -> DriveResult<Vec<String>> {
        let mut transport = self.transport.lock().await;
        Self::read_to_blank(&mut transport).await
    }

    async fn cycle(
        transport: &mut Box<dyn Transport>,
        wire: &str,
        settle: Duration,
    ) -> DriveResult<RawReply> {
        if !transport.is_open() {
            return Err(DriveError::LinkUnavailable(format!(
                "port {} is not open",
                transport.port_name()
            )));
        }
        debug!("WRITE: {wire:?}");
        transport.write(wire.as_bytes()).await?;
        tokio::time::sleep(settle).await;
        let first = transport.read_line().await?;
        debug!("READ: {first:?}");
        let rest = if protocol::is_banner(&first) {
            Self::read_to_blank(transport).await?
        } else {
            Vec::new()
        };
        Ok(RawReply { first, rest })
    }

    async fn read_to_blank(transport: &mut Box<dyn Transport>) -> DriveResult<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let line = transport.read_line().await?;
            if line.trim_end_matches(['\r', '\n']).is_empty() {
                break;
            }
            debug!("READ: {line:?}");
            lines.push(line);
        }
        Ok(lines)
    }
}

/// The real serial port, opened with the controller's settings.
///
/// serialport I/O is blocking, so reads and writes run on the blocking
/// thread pool; the port handle itself sits behind a plain mutex shared with
/// those worker closures.
pub struct SerialTransport {
    path: String,
    read_deadline: Duration,
    port: Option<Arc<std::sync::Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// A transport for the given device path; nothing is opened yet.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            read_deadline: READ_DEADLINE,
            port: None,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> DriveResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.path, BAUD_RATE)
            .data_bits(DataBits::Seven)
            .parity(Parity::Even)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| {
                DriveError::LinkUnavailable(format!(
                    "failed to open serial port {} at {BAUD_RATE} baud: {e}",
                    self.path
                ))
            })?;
        self.port = Some(Arc::new(std::sync::Mutex::new(port)));
        debug!("Serial port {} opened at {BAUD_RATE} baud", self.path);
        Ok(())
    }

    async fn close(&mut self) -> DriveResult<()> {
        if self.port.take().is_some() {
            debug!("Serial port {} closed", self.path);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn port_name(&self) -> &str {
        &self.path
    }

    async fn write(&mut self, bytes: &[u8]) -> DriveResult<()> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| DriveError::LinkUnavailable("serial port not connected".into()))?
            .clone();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || -> DriveResult<()> {
            let mut guard = port.lock().unwrap_or_else(|e| e.into_inner());
            guard.write_all(&bytes)?;
            guard.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| DriveError::LinkUnavailable(format!("serial I/O task failed: {e}")))?
    }

    async fn read_line(&mut self) -> DriveResult<String> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| DriveError::LinkUnavailable("serial port not connected".into()))?
            .clone();
        let deadline = self.read_deadline;
        tokio::task::spawn_blocking(move || -> DriveResult<String> {
            let mut guard = port.lock().unwrap_or_else(|e| e.into_inner());
            let mut collected = Vec::new();
            let mut buffer = [0u8; 1];
            let start = Instant::now();
            loop {
                if start.elapsed() > deadline {
                    // Deadline expired; hand back whatever arrived.
                    break;
                }
                match guard.read(&mut buffer) {
                    Ok(1) => {
                        collected.push(buffer[0]);
                        if buffer[0] == b'\n' {
                            break;
                        }
                    }
                    Ok(_) => {
                        warn!("unexpected EOF from serial port");
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(DriveError::Io(e)),
                }
            }
            Ok(String::from_utf8_lossy(&collected).into_owned())
        })
        .await
        .map_err(|e| DriveError::LinkUnavailable(format!("serial I/O task failed: {e}")))?
    }
}
