//! Test-handler protocol: configuration handshake, SRQ polling and the per-part sort cycle
pub mod handshake;
pub mod job;
pub mod sort;
pub mod status;

pub use handshake::{acknowledge_empty_check, configure, lot_finished, HandshakeOptions, CONFIGURATION_STEPS};
pub use job::{run_job, run_job_with, JobError, JobOptions, JobPhase, JobReport, JobSpec};
pub use sort::{
    binon_command, decide, parse_identifier, AcceptedSetDecider, BinAssignment, BinConfig, BinDecider, DecisionError,
    SortSession, SortState, MAX_BIN,
};
pub use status::{PollConfig, PollState, SrqEvent, StatusByte, StatusPoller};

use std::time::Duration;
use crate::serial::SerialError;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("'{command}': expected '{expected}' but received '{actual}'")]
    ProtocolMismatch {
        command: String,
        expected: String,
        actual: String,
    },

    #[error("status byte unreadable after {attempts} polls (last response: {last_response:?})")]
    StatusRead {
        attempts: u32,
        last_response: Option<String>,
    },

    #[error("timed out after {waited:?} {operation}")]
    Timeout {
        operation: String,
        waited: Duration,
    },

    #[error("invalid bin configuration: {0}")]
    InvalidBins(String),

    #[error("Serial communication error: {0}")]
    Serial(#[from] SerialError),
}

impl HandlerError {
    pub(crate) fn mismatch(command: &str, expected: &str, actual: Option<&str>) -> Self {
        HandlerError::ProtocolMismatch {
            command: command.to_string(),
            expected: expected.to_string(),
            actual: actual.unwrap_or("").to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HandlerError>;
