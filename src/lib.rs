//! Client for mpv's JSON IPC protocol.
//!
//! One [`MpvClient`] owns one control connection: it correlates command
//! responses by request id and fans events out to subscribers, including
//! reference-counted property observations.

mod config;
mod mpv;

pub use config::{default_socket_path, ConfigError, IpcConfig};
pub use mpv::*;
