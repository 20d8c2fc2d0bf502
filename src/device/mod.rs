pub mod bring_up;
pub mod discovery;
pub mod manager;
pub mod models;

pub use bring_up::{BusBringUp, NoopBringUp, UdevBringUp};
pub use discovery::{bus_identifier, discover, discover_devices, NO_RESPONSE};
pub use manager::SortManager;
pub use models::*;

use crate::handler::{HandlerError, JobError};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("GPIB bus not ready: {0}")]
    BusNotReady(String),

    #[error("Bridge already connected")]
    AlreadyConnected,

    #[error("Bridge not connected")]
    NotConnected,

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),

    #[error("Handler error: {0}")]
    HandlerError(#[from] HandlerError),

    #[error(transparent)]
    JobError(#[from] JobError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
