use thiserror::Error;

use crate::ble::BleError;
use crate::config::ConfigError;
use crate::result::GattOperationError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Characteristic {0} is not registered for this connection")]
    UnresolvedTarget(String),

    #[error("Connection already requested for {0}")]
    DuplicateConnection(String),

    #[error("No connection has been requested")]
    NotConnected,

    #[error("Session work was cancelled")]
    Cancelled,

    #[error("No tokio runtime available: {0}")]
    Runtime(String),

    #[error(transparent)]
    Operation(#[from] GattOperationError),

    #[error("Transport error: {0}")]
    Transport(#[from] BleError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
