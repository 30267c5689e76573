//! Delivery sessions.
//!
//! - `model` — session, pending result and conversation history types
//! - `sink` — the `ResultSink` seam and the wire message
//! - `registry` — per-identity delivery with offline queueing
//! - `ws` — WebSocket transport

pub mod model;
pub mod registry;
pub mod sink;
pub mod ws;

pub use model::{HistoryEntry, PendingResult, Session, SessionInfo};
pub use registry::{SessionRegistry, spawn_idle_reaper};
pub use sink::{ChannelSink, DeliveryMessage, OutboundDelivery, ResultSink};
pub use ws::ws_routes;
