use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use serialport::{DataBits, Parity, SerialPort, SerialPortType, StopBits};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use super::{ConnectionConfig, LineTerminator, ReceiveBuffer, Result, SerialDeviceInfo, SerialError};

/// Byte-level access to the device behind the bridge
#[async_trait::async_trait]
pub trait SerialPortIO: Send {
    async fn send_data(&mut self, data: &[u8]) -> Result<()>;

    /// Number of bytes that can be read without blocking
    async fn bytes_available(&mut self) -> Result<usize>;

    async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn flush(&mut self) -> Result<()>;
}

/// `SerialPortIO` over a real serial device
pub struct NativePort {
    port: Box<dyn SerialPort>,
}

impl NativePort {
    pub fn open(config: &ConnectionConfig) -> Result<Self> {
        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(config.read_timeout())
            .open()
            .map_err(|e| match e.kind {
                serialport::ErrorKind::NoDevice => SerialError::PortNotFound(config.port.clone()),
                _ => SerialError::ConnectionFailed(format!("{}: {}", config.port, e)),
            })?;
        Ok(Self { port })
    }
}

#[async_trait::async_trait]
impl SerialPortIO for NativePort {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    async fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(SerialError::IoError(e)),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }
}

type SharedPort = Arc<Mutex<Box<dyn SerialPortIO>>>;

/// Serial connection to the bridge adapter.
///
/// A background reader task drains incoming bytes into a [`ReceiveBuffer`]. Writes clear that
/// buffer first, so whatever is buffered after a write was received after it.
pub struct SerialInterface {
    port_name: String,
    port: Option<SharedPort>,
    buffer: ReceiveBuffer,
    terminator: LineTerminator,
    stop_tx: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
    close_timeout: Duration,
}

impl SerialInterface {
    /// List the USB serial ports a bridge adapter could be attached to
    pub fn available_ports() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let mut devices = Vec::new();

        for port in ports {
            if let SerialPortType::UsbPort(usb_info) = port.port_type {
                devices.push(SerialDeviceInfo {
                    port_name: port.port_name.clone(),
                    vid: usb_info.vid,
                    pid: usb_info.pid,
                    serial_number: usb_info.serial_number.clone(),
                    manufacturer: usb_info.manufacturer.clone(),
                    product: usb_info.product.clone(),
                });
            }
        }

        Ok(devices)
    }

    /// Open the configured serial device and wait out the adapter reset
    pub async fn open(config: &ConnectionConfig) -> Result<Self> {
        let port = NativePort::open(config)?;
        Self::open_with(Box::new(port), config).await
    }

    /// Start the transport over an already opened port
    pub async fn open_with(port: Box<dyn SerialPortIO>, config: &ConnectionConfig) -> Result<Self> {
        let port: SharedPort = Arc::new(Mutex::new(port));
        let buffer = ReceiveBuffer::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        let reader = tokio::spawn(reader_task(
            port.clone(),
            buffer.clone(),
            stop_rx,
            config.reader_poll(),
        ));

        sleep(config.settle_delay()).await;
        // the adapter may print a banner while it resets
        buffer.clear().await;

        log::info!("Connected to {} at {} baud", config.port, config.baud_rate);

        Ok(Self {
            port_name: config.port.clone(),
            port: Some(port),
            buffer,
            terminator: config.terminator,
            stop_tx,
            reader: Some(reader),
            close_timeout: config.close_timeout(),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    pub fn terminator(&self) -> LineTerminator {
        self.terminator
    }

    /// Clear the receive buffer, then send `command` followed by the line terminator
    pub async fn write(&self, command: &str) -> Result<()> {
        let port = self.port.as_ref().ok_or(SerialError::Closed)?;

        let line = format!("{}{}", command, self.terminator.as_str());

        // the reader appends while holding the port, so nothing read before this write survives the clear
        let mut guard = port.lock().await;
        self.buffer.clear().await;
        guard.send_data(line.as_bytes()).await
    }

    /// Return and remove everything currently buffered, without waiting
    pub async fn drain(&self) -> String {
        self.buffer.drain().await
    }

    /// Copy of the buffered text, leaving it in place
    pub async fn snapshot(&self) -> String {
        self.buffer.snapshot().await
    }

    pub async fn clear(&self) {
        self.buffer.clear().await;
    }

    pub fn buffer(&self) -> &ReceiveBuffer {
        &self.buffer
    }

    /// Stop the reader task and release the device. Calling it again is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        let Some(port) = self.port.take() else {
            return Ok(());
        };

        let _ = self.stop_tx.send(true);

        if let Some(handle) = self.reader.take() {
            let abort = handle.abort_handle();
            if timeout(self.close_timeout, handle).await.is_err() {
                log::warn!("Reader for {} did not stop within {:?}, aborting", self.port_name, self.close_timeout);
                abort.abort();
            }
        }

        let flushed = port.lock().await.flush().await;
        drop(port);

        log::info!("Serial port {} closed", self.port_name);
        flushed
    }
}

impl Drop for SerialInterface {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

async fn reader_task(
    port: SharedPort,
    buffer: ReceiveBuffer,
    stop_rx: watch::Receiver<bool>,
    poll: Duration,
) {
    let mut chunk = [0u8; 512];
    let mut last_error: Option<String> = None;

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let read = {
            let mut guard = port.lock().await;
            let read = match guard.bytes_available().await {
                Ok(0) => Ok(0),
                Ok(available) => {
                    let want = available.min(chunk.len());
                    guard.read_data(&mut chunk[..want]).await
                }
                Err(e) => Err(e),
            };
            if let Ok(n) = read {
                buffer.append(&chunk[..n]).await;
            }
            read
        };

        match read {
            Ok(n) if n > 0 => {
                last_error = None;
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                let msg = e.to_string();
                // only log the first error of a streak, an unplugged adapter fails every poll
                if last_error.as_deref() != Some(msg.as_str()) {
                    log::error!("Serial read error: {}", msg);
                    last_error = Some(msg);
                }
            }
        }

        sleep(poll).await;
    }

    log::debug!("Serial reader stopped");
}
