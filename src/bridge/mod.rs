pub mod controller;
pub mod retry;

pub use controller::{parse_listeners, EosMode, GpibBridge, MAX_BUS_ADDRESS};
pub use retry::{Backoff, RetryPolicy};
