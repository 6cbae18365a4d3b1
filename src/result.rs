//! Typed outcomes of GATT operations
//!
//! Every operation resolves to a [`GattResult`]: either a success carrying
//! the payload, or one of a fixed set of failure kinds. Failures can be
//! turned into a [`GattOperationError`] for callers that prefer `?`.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::ble::gatt::GattStatus;
use crate::ble::BleError;

/// The operation a result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
    Subscribe,
    Rssi,
    Mtu,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Read => "ReadResult",
            OperationKind::Write => "WriteResult",
            OperationKind::Subscribe => "SubscriptionResult",
            OperationKind::Rssi => "RssiResult",
            OperationKind::Mtu => "MtuResult",
        };
        f.write_str(name)
    }
}

/// Payload of a successful operation.
pub trait OperationPayload {
    const KIND: OperationKind;

    fn describe(&self) -> String;
}

/// Acknowledged characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Written;

/// Notifications enabled and the CCCD write acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscribed;

impl OperationPayload for Vec<u8> {
    const KIND: OperationKind = OperationKind::Read;

    fn describe(&self) -> String {
        format!("0x{}", hex::encode(self))
    }
}

impl OperationPayload for Written {
    const KIND: OperationKind = OperationKind::Write;

    fn describe(&self) -> String {
        "written".to_string()
    }
}

impl OperationPayload for Subscribed {
    const KIND: OperationKind = OperationKind::Subscribe;

    fn describe(&self) -> String {
        "subscribed".to_string()
    }
}

impl OperationPayload for i16 {
    const KIND: OperationKind = OperationKind::Rssi;

    fn describe(&self) -> String {
        format!("{} dBm", self)
    }
}

impl OperationPayload for u16 {
    const KIND: OperationKind = OperationKind::Mtu;

    fn describe(&self) -> String {
        format!("{} bytes", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattResult<T> {
    Success(T),
    /// Another operation of the same kind was already in flight.
    DeviceIsBusy,
    /// The request could not be issued to the transport at all.
    IssuanceFailed(BleError),
    OperationTimeout(Duration),
    /// The peer completed the operation with a non-success status.
    GattError(GattStatus),
    /// The completion named a different characteristic than requested.
    WrongCharacteristicCallback,
    /// Unexpected failure while waiting, e.g. the session ended.
    OperationException(String),
}

pub type ReadResult = GattResult<Vec<u8>>;
pub type WriteResult = GattResult<Written>;
pub type SubscriptionResult = GattResult<Subscribed>;
pub type RssiResult = GattResult<i16>;
pub type MtuResult = GattResult<u16>;

impl<T: OperationPayload> GattResult<T> {
    pub fn kind(&self) -> OperationKind {
        T::KIND
    }

    pub fn is_success(&self) -> bool {
        matches!(self, GattResult::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            GattResult::Success(value) => Some(value),
            _ => None,
        }
    }

    /// The error describing a failed outcome, `None` on success.
    pub fn to_error(&self) -> Option<GattOperationError> {
        let kind = T::KIND;
        let error = match self {
            GattResult::Success(_) => return None,
            GattResult::DeviceIsBusy => GattOperationError::Busy { kind },
            GattResult::IssuanceFailed(error) => GattOperationError::IssuanceFailed {
                kind,
                error: error.clone(),
            },
            GattResult::OperationTimeout(timeout) => GattOperationError::Timeout {
                kind,
                timeout: *timeout,
            },
            GattResult::GattError(status) => GattOperationError::Gatt {
                kind,
                status: *status,
            },
            GattResult::WrongCharacteristicCallback => {
                GattOperationError::WrongCharacteristic { kind }
            }
            GattResult::OperationException(message) => GattOperationError::Exception {
                kind,
                message: message.clone(),
            },
        };
        Some(error)
    }

    pub fn into_result(self) -> Result<T, GattOperationError> {
        match self.to_error() {
            Some(error) => Err(error),
            None => self
                .success()
                .ok_or(GattOperationError::Exception {
                    kind: T::KIND,
                    message: "missing payload".to_string(),
                }),
        }
    }
}

impl<T: OperationPayload> fmt::Display for GattResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattResult::Success(value) => write!(f, "{}: Success: {}", T::KIND, value.describe()),
            _ => match self.to_error() {
                Some(error) => write!(f, "{}", error),
                None => Ok(()),
            },
        }
    }
}

/// A failed GATT operation, for callers that want errors rather than
/// outcome values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattOperationError {
    #[error("{kind}: Device is busy: other gatt operation in progress!")]
    Busy { kind: OperationKind },

    #[error("{kind}: Issuance failed: {error}")]
    IssuanceFailed { kind: OperationKind, error: BleError },

    #[error("{kind}: Operation timeout: no result after {timeout:?}")]
    Timeout { kind: OperationKind, timeout: Duration },

    #[error("{kind}: Gatt error: {status}")]
    Gatt { kind: OperationKind, status: GattStatus },

    #[error("{kind}: Wrong characteristic in callback!")]
    WrongCharacteristic { kind: OperationKind },

    #[error("{kind}: Exception: {message}")]
    Exception { kind: OperationKind, message: String },
}

impl GattOperationError {
    pub fn kind(&self) -> OperationKind {
        match self {
            GattOperationError::Busy { kind }
            | GattOperationError::IssuanceFailed { kind, .. }
            | GattOperationError::Timeout { kind, .. }
            | GattOperationError::Gatt { kind, .. }
            | GattOperationError::WrongCharacteristic { kind }
            | GattOperationError::Exception { kind, .. } => *kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_has_no_error() {
        let result: ReadResult = GattResult::Success(vec![0x57]);
        assert!(result.is_success());
        assert!(result.to_error().is_none());
        assert_eq!(result.to_string(), "ReadResult: Success: 0x57");
        assert_eq!(result.into_result(), Ok(vec![0x57]));
    }

    #[test]
    fn test_failure_kinds_map_to_errors() {
        let busy: WriteResult = GattResult::DeviceIsBusy;
        assert_eq!(
            busy.to_error(),
            Some(GattOperationError::Busy {
                kind: OperationKind::Write
            })
        );
        assert_eq!(
            busy.to_string(),
            "WriteResult: Device is busy: other gatt operation in progress!"
        );

        let gatt: RssiResult = GattResult::GattError(GattStatus::INSUFFICIENT_ENCRYPTION);
        assert_eq!(
            gatt.into_result(),
            Err(GattOperationError::Gatt {
                kind: OperationKind::Rssi,
                status: GattStatus::INSUFFICIENT_ENCRYPTION,
            })
        );

        let timeout: MtuResult = GattResult::OperationTimeout(Duration::from_millis(1000));
        assert_eq!(timeout.to_error().unwrap().kind(), OperationKind::Mtu);
    }

    #[test]
    fn test_issuance_failure_message() {
        let result: SubscriptionResult = GattResult::IssuanceFailed(BleError::TransportClosed);
        assert_eq!(
            result.to_string(),
            "SubscriptionResult: Issuance failed: Transport worker is no longer running"
        );
    }
}
