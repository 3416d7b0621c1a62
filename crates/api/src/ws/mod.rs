//! WebSocket push channel.
//!
//! Observers connect once, then `join` / `leave` job channels with JSON
//! messages. Outbound traffic comes from the
//! [`ProgressRelay`](gridflow_events::ProgressRelay).

mod handler;
mod heartbeat;
pub mod protocol;

pub use handler::ws_handler;
pub use heartbeat::start_heartbeat;
