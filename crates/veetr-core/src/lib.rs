//! Core abstractions for the Veetr controller link.
//!
//! This crate provides the fundamental building blocks:
//! - `wire` - JSON envelope codec (base64 chunk payloads)
//! - `Transport` / `LinkWriter` - attach to a remote unit
//! - `CommandChannel` - the message pipe the firmware engine talks through
//! - `TelemetryStore` - broadcast + history for telemetry frames
//! - `Config` - link and transfer tuning

pub mod config;
pub mod telemetry;
pub mod traits;
pub mod wire;

pub use config::{Config, ConfigError, LinkConfig, TransferConfig};
pub use telemetry::{TelemetryFrame, TelemetryStore};
pub use traits::{
    ChannelError, CommandChannel, ErrorKind, Inbound, Link, LinkError, LinkWriter, SessionStatus,
    SignalQuality, Transport,
};
pub use wire::{Command, DeviceAction, Envelope, EnvelopeKind, Notice, Telemetry};
