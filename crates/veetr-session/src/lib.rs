//! Connection session to a remote unit.
//!
//! Provides:
//! - `Session` - attach/teardown lifecycle, inbound routing, status
//! - `LinkChannel` - the command channel handed to firmware transfers

pub mod channel;
pub mod session;

pub use channel::LinkChannel;
pub use session::{
    DisconnectReason, Session, SessionError, SessionEvent, SessionSnapshot, TransferLease,
    validate_device_name,
};
