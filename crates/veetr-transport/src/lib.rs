//! Transports for reaching a remote unit.
//!
//! Provides:
//! - In-process simulated unit (feature: sim)
//! - BLE GATT transport (feature: ble)

#[cfg(feature = "ble")]
pub mod ble;

#[cfg(feature = "sim")]
pub mod sim;

#[cfg(feature = "ble")]
pub use ble::BleTransport;

#[cfg(feature = "sim")]
pub use sim::{SimEvent, SimulatedUnit};
