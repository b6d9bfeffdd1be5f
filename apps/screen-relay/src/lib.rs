//! Session pairing and relay for remote screen viewing.
//!
//! A host (the machine being viewed) and a viewer claim the two slots of a
//! session by id. Once both are present, traffic flows between them under a
//! per-kind direction table. Two independent channels run side by side: the
//! main channel carries screen frames and control traffic, the pointer
//! channel carries high-rate mouse input with tighter liveness.

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod liveness;
pub mod pairing;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod stats;
pub mod telemetry;
pub mod websocket;

pub use channel::RelayChannel;
pub use config::{ChannelKind, ChannelProfile, Cli, ServerConfig};
pub use connection::{Connection, ConnectionId};
pub use protocol::{ClientEvent, MessageKind, Role, ServerEvent};
pub use server::{router, AppState};
