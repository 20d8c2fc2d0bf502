pub mod buffer;
pub mod interface;
pub mod mock;

pub use buffer::ReceiveBuffer;
pub use interface::{NativePort, SerialInterface, SerialPortIO};
pub use mock::MockPort;

use std::time::Duration;
use serde::{Deserialize, Serialize};

pub const BAUD_RATE: u32 = 115200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Line terminator appended to every command written to the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LineTerminator {
    #[default]
    Cr,
    Lf,
    CrLf,
}

impl LineTerminator {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineTerminator::Cr => "\r",
            LineTerminator::Lf => "\n",
            LineTerminator::CrLf => "\r\n",
        }
    }
}

/// Serial link settings for the bridge adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    /// Adapter reset time after the port is opened. Nothing received before it elapses is kept.
    pub settle_delay_ms: u64,
    /// Reader sleep between checks when no input is pending
    pub reader_poll_ms: u64,
    /// Upper bound on waiting for the reader task to stop on close
    pub close_timeout_ms: u64,
    pub terminator: LineTerminator,
}

impl ConnectionConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self { port: port.into(), ..Self::default() }
    }

    pub fn read_timeout(&self) -> Duration { Duration::from_millis(self.read_timeout_ms) }
    pub fn settle_delay(&self) -> Duration { Duration::from_millis(self.settle_delay_ms) }
    pub fn reader_poll(&self) -> Duration { Duration::from_millis(self.reader_poll_ms.max(1)) }
    pub fn close_timeout(&self) -> Duration { Duration::from_millis(self.close_timeout_ms) }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: BAUD_RATE,
            read_timeout_ms: 100,
            settle_delay_ms: 2000,
            reader_poll_ms: 10,
            close_timeout_ms: 200,
            terminator: LineTerminator::Cr,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
