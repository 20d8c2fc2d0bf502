use std::sync::Arc;
use tokio::time::sleep;

use crate::events::{EventKind, EventSink, NullSink, ProtocolEvent};
use crate::serial::{Result, SerialError, SerialInterface};
use super::RetryPolicy;

/// Highest primary address on a GPIB bus
pub const MAX_BUS_ADDRESS: u8 = 30;

/// Characters the adapter appends to data it forwards to the bus (`++eos`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EosMode {
    CrLf = 0,
    Cr = 1,
    Lf = 2,
    None = 3,
}

/// USB-to-GPIB bridge adapter in controller mode.
///
/// Adapter verbs are `++` commands. Anything else is forwarded to the device at the current
/// address. Every exchange is strictly write-then-read; the transport clears the receive buffer on
/// each write, so a response must be read before the next command is sent.
pub struct GpibBridge {
    transport: SerialInterface,
    policy: RetryPolicy,
    sink: Arc<dyn EventSink>,
    address: Option<u8>,
    last_command: String,
}

impl GpibBridge {
    pub fn new(transport: SerialInterface, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            sink: Arc::new(NullSink),
            address: None,
            last_command: String::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn transport(&self) -> &SerialInterface {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut SerialInterface {
        &mut self.transport
    }

    /// Address selected by the last `set_address`
    pub fn address(&self) -> Option<u8> {
        self.address
    }

    pub fn emit(&self, kind: EventKind) {
        self.sink.record(&ProtocolEvent::now(kind));
    }

    /// Write one command line
    pub async fn send(&mut self, command: &str) -> Result<()> {
        self.transport.write(command).await?;
        log::debug!("-> {}", command);
        self.last_command = command.to_string();
        self.emit(EventKind::CommandSent { command: command.to_string() });
        Ok(())
    }

    /// Wait for the response to the last command using the bridge's retry policy
    pub async fn read_response(&mut self) -> Result<Option<String>> {
        let policy = self.policy.clone();
        self.read_response_with(&policy).await
    }

    /// Sleep for the settle interval, then look at the buffer up to `max_attempts` more times with
    /// growing waits. Returns the trimmed text, or `None` if nothing arrived.
    pub async fn read_response_with(&mut self, policy: &RetryPolicy) -> Result<Option<String>> {
        if !self.transport.is_open() {
            return Err(SerialError::Closed);
        }

        sleep(policy.settle()).await;

        let mut attempt = 0;
        loop {
            let received = self.transport.drain().await;
            let trimmed = received.trim();
            if !trimmed.is_empty() {
                log::debug!("<- {}", trimmed);
                self.emit(EventKind::ResponseReceived {
                    command: self.last_command.clone(),
                    response: trimmed.to_string(),
                });
                return Ok(Some(trimmed.to_string()));
            }

            if attempt >= policy.max_attempts {
                break;
            }
            attempt += 1;
            sleep(policy.delay_for(attempt)).await;
        }

        log::debug!("<- (no response to '{}' after {} retries)", self.last_command, policy.max_attempts);
        self.emit(EventKind::ResponseMissing { command: self.last_command.clone() });
        Ok(None)
    }

    /// Send a command and read its response
    pub async fn query(&mut self, command: &str) -> Result<Option<String>> {
        self.send(command).await?;
        self.read_response().await
    }

    pub async fn set_address(&mut self, address: u8) -> Result<()> {
        if address > MAX_BUS_ADDRESS {
            return Err(SerialError::ProtocolError(format!(
                "GPIB address {} out of range 0-{}",
                address, MAX_BUS_ADDRESS
            )));
        }
        self.send(&format!("++addr {}", address)).await?;
        self.address = Some(address);
        Ok(())
    }

    /// Selected Device Clear on the current address
    pub async fn clear(&mut self) -> Result<()> {
        self.send("++clr").await
    }

    /// Addresses of every listener on the bus; empty when the bus has no devices
    pub async fn find_listeners(&mut self) -> Result<Vec<u8>> {
        let response = self.query("++fndl").await?;
        Ok(response.as_deref().map(parse_listeners).unwrap_or_default())
    }

    /// Raw text of a serial poll of the current address
    pub async fn service_poll(&mut self) -> Result<Option<String>> {
        self.query("++spoll").await
    }

    /// Address the current device to talk and read what it says
    pub async fn request_read(&mut self) -> Result<()> {
        self.send("++read").await
    }

    pub async fn set_auto_read_mode(&mut self, enabled: bool) -> Result<()> {
        self.send(&format!("++auto {}", enabled as u8)).await
    }

    pub async fn set_eoi_mode(&mut self, enabled: bool) -> Result<()> {
        self.send(&format!("++eoi {}", enabled as u8)).await
    }

    /// `true` puts the adapter in controller mode, `false` in device mode
    pub async fn set_controller_mode(&mut self, controller: bool) -> Result<()> {
        self.send(&format!("++mode {}", controller as u8)).await
    }

    pub async fn set_termination_mode(&mut self, mode: EosMode) -> Result<()> {
        self.send(&format!("++eos {}", mode as u8)).await
    }

    /// Controller mode with EOI asserted on the last byte, as needed before bus enumeration
    pub async fn prepare_controller(&mut self) -> Result<()> {
        self.set_eoi_mode(true).await?;
        self.set_controller_mode(true).await
    }

    /// `*IDN?` on `address`, read back with `++read` once the identify settle has passed
    pub async fn identify(&mut self, address: u8) -> Result<Option<String>> {
        self.set_address(address).await?;
        self.send("*IDN?").await?;
        sleep(self.policy.identify_settle()).await;
        self.request_read().await?;
        self.read_response().await
    }

    /// Close the underlying transport
    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }
}

/// Decimal addresses in a `++fndl` reply; other tokens are skipped
pub fn parse_listeners(response: &str) -> Vec<u8> {
    response
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter_map(|token| token.parse::<u8>().ok())
        .filter(|addr| *addr <= MAX_BUS_ADDRESS)
        .collect()
}
