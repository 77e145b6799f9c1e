//! huddle - conferencing network core
//!
//! A relay-based multi-party meeting system: a TCP control plane with
//! length-prefixed JSON messages, a UDP media relay, client-side media
//! pipelines with adaptive quality, and a congestion-controlled bulk
//! file transport overlaid on the control channel.

pub mod client;
pub mod config;
pub mod protocol;
pub mod server;

// Re-exports
pub use config::{ClientConfig, Config, ServerConfig};
pub use protocol::{ControlMessage, QualityTier};
pub use server::Server;
