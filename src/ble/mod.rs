//! BLE transport boundary for the GATT session engine
//!
//! Provides the transport capability trait the engine drives, the GATT
//! protocol constants it needs, and an in-process simulated peripheral
//! for testing without radio hardware.

pub mod gatt;
pub mod simulated;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Transport worker is no longer running")]
    TransportClosed,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}
