//! MPV IPC module - controls an external MPV player via JSON IPC.
//!
//! Architecture:
//! - `process.rs` - MPV binary detection and process spawning
//! - `ipc.rs` - Async IPC connection (Named Pipes on Windows, Unix Sockets on Linux/macOS)
//! - `protocol.rs` - JSON command/response/event types and serialization
//! - `router.rs` - Line classification and event dispatch
//! - `pending.rs` - Request id allocation and response correlation
//! - `registry.rs` - Event subscriptions and property observation counts
//! - `debounce.rs` - Rate limiting for event handlers
//! - `client.rs` - High-level MPV client tying the above together

mod client;
mod debounce;
mod ipc;
mod pending;
mod process;
mod protocol;
mod registry;
mod router;
#[cfg(all(test, unix))]
mod testing;

pub use client::{MpvClient, MpvError, WeakMpvClient};
pub use debounce::{debounce, Debouncer};
pub use ipc::IpcError;
pub use process::{find_mpv, ProcessError};
pub use protocol::{
  default_group_id, MpvCommand, MpvEvent, MpvRequest, MpvResponse, PlaybackTimes, PropertyChange,
  PropertyValue, ProtocolError, PROPERTY_CHANGE,
};
pub use registry::{handler, EventHandler, Subscription, SubscriptionId};
