//! Sort controller for a GPIB test handler behind a USB-to-GPIB bridge adapter.
//!
//! Layers, bottom up: [`serial`] owns the port and its background reader, [`bridge`] speaks the
//! adapter's `++` verbs, [`handler`] drives the handler's configuration handshake, SRQ polling and
//! per-part sort cycle, and [`device`] ties them to a connection with discovery and job entry points.
pub mod serial;
pub mod bridge;
pub mod handler;
pub mod device;
pub mod events;
pub mod ids;
pub mod config;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::SorterConfig;
pub use device::{DeviceError, SortManager};
pub use handler::{BinAssignment, JobReport, JobSpec};
pub use ids::AcceptedIdSet;
