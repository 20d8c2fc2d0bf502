use std::fmt;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::bridge::GpibBridge;
use crate::events::EventKind;
use super::{HandlerError, Result};

/// Bit set in the status byte while the device asserts SRQ
pub const SRQ_MASK: u8 = 0x40;
/// Part in the socket, ready to be sorted
pub const PART_READY: u8 = 0x41;
/// Handler wants the empty-socket check acknowledged
pub const EMPTY_CHECK: u8 = 0x44;

/// What a status byte means to the sort protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrqEvent {
    NoEvent,
    PartReady,
    EmptyCheck,
    Unrecognized(u8),
}

impl SrqEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SrqEvent::NoEvent => "no-event",
            SrqEvent::PartReady => "part-ready",
            SrqEvent::EmptyCheck => "empty-check",
            SrqEvent::Unrecognized(_) => "unrecognized-srq",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusByte(pub u8);

impl StatusByte {
    /// Parse a `++spoll` reply. The adapter prints the byte in decimal.
    pub fn parse(response: &str) -> Option<Self> {
        response
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()?
            .parse::<u8>()
            .ok()
            .map(StatusByte)
    }

    pub fn srq_asserted(&self) -> bool {
        self.0 & SRQ_MASK != 0
    }

    pub fn classify(&self) -> SrqEvent {
        match self.0 {
            b if b & SRQ_MASK == 0 => SrqEvent::NoEvent,
            PART_READY => SrqEvent::PartReady,
            EMPTY_CHECK => SrqEvent::EmptyCheck,
            other => SrqEvent::Unrecognized(other),
        }
    }
}

impl fmt::Display for StatusByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollState {
    Idle,
    Polling,
    EmptyCheck,
    PartReady,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    /// Polls without an accepted SRQ before giving up
    pub max_polls: u32,
    /// Consecutive unreadable status bytes before giving up
    pub max_unreadable: u32,
    /// Send `++clr` before every poll
    pub clear_before_poll: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            max_polls: 7200,
            max_unreadable: 10,
            clear_before_poll: false,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Serial-polls the addressed handler until it raises an SRQ the caller is waiting for
pub struct StatusPoller {
    config: PollConfig,
    state: PollState,
}

impl StatusPoller {
    pub fn new(config: PollConfig) -> Self {
        Self { config, state: PollState::Idle }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// One serial poll. `Ok(None)` when the reply was empty or not a number.
    pub async fn poll_once(&mut self, bridge: &mut GpibBridge) -> Result<(Option<StatusByte>, Option<String>)> {
        if self.config.clear_before_poll {
            bridge.clear().await?;
        }
        let raw = bridge.service_poll().await?;
        let status = raw.as_deref().and_then(StatusByte::parse);
        Ok((status, raw))
    }

    /// Poll until a status byte classifies to an event `accept` takes.
    ///
    /// Unrecognized SRQs and SRQs the caller is not waiting for are logged and polling continues.
    pub async fn wait_for<F>(&mut self, bridge: &mut GpibBridge, accept: F) -> Result<SrqEvent>
    where
        F: Fn(SrqEvent) -> bool,
    {
        self.state = PollState::Polling;
        let mut unreadable = 0u32;

        for poll in 1..=self.config.max_polls {
            let (status, raw) = match self.poll_once(bridge).await {
                Ok(result) => result,
                Err(e) => {
                    self.state = PollState::Idle;
                    return Err(e);
                }
            };

            match status {
                None => {
                    unreadable += 1;
                    log::debug!("No status reading yet ({:?}), attempt {}", raw, unreadable);
                    if unreadable >= self.config.max_unreadable {
                        self.state = PollState::Idle;
                        return Err(HandlerError::StatusRead { attempts: unreadable, last_response: raw });
                    }
                }
                Some(status) => {
                    unreadable = 0;
                    let event = status.classify();
                    if event != SrqEvent::NoEvent {
                        bridge.emit(EventKind::SrqClassified { status: status.0, event: event.as_str().to_string() });
                    }

                    match event {
                        SrqEvent::NoEvent => {}
                        SrqEvent::Unrecognized(_) => {
                            self.state = PollState::Unrecognized;
                            log::warn!("SRQ asserted with unrecognized status byte {}, still waiting", status);
                        }
                        event if accept(event) => {
                            self.state = match event {
                                SrqEvent::PartReady => PollState::PartReady,
                                _ => PollState::EmptyCheck,
                            };
                            log::info!("SRQ {} received ({})", status, event.as_str());
                            return Ok(event);
                        }
                        event => {
                            log::info!("SRQ {} ({}) asserted while waiting for another event", status, event.as_str());
                        }
                    }
                }
            }

            if poll < self.config.max_polls {
                sleep(self.config.interval()).await;
            }
        }

        self.state = PollState::Idle;
        Err(HandlerError::Timeout {
            operation: "waiting for SRQ".to_string(),
            waited: self.config.interval() * self.config.max_polls,
        })
    }
}
