//! Gridflow push-event infrastructure.
//!
//! - [`ProgressRelay`] -- per-job broadcast channels over per-connection
//!   outbound queues. Plugged into each `JobLedger` as its event sink.

pub mod relay;

pub use relay::{ObserverReceiver, ProgressRelay, RelayMessage};
