//! GATT transport capability and raw callback types
//!
//! Defines the platform-facing interface the session engine drives. A
//! transport issues requests synchronously (the call only reports whether
//! the stack accepted it) and reports completions asynchronously as
//! [`GattEvent`] values on a channel handed to the engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::gatt::{CharacteristicProperties, GattStatus, WriteType};
use super::BleError;

/// Raw link phase codes reported by connection-state callbacks.
pub mod phase {
    pub const DISCONNECTED: i32 = 0;
    pub const CONNECTING: i32 = 1;
    pub const CONNECTED: i32 = 2;
    pub const DISCONNECTING: i32 = 3;
}

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleAddress::Real(mac) => {
                let parts: Vec<String> = mac.iter().map(|b| format!("{:02X}", b)).collect();
                write!(f, "{}", parts.join(":"))
            }
            BleAddress::Simulated(id) => write!(f, "sim:{}", id),
        }
    }
}

/// Transport-level handle of a discovered characteristic.
///
/// Stable for the lifetime of one connection; used as the key for
/// per-characteristic pending operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacteristicHandle(pub u16);

impl fmt::Display for CharacteristicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// A characteristic as enumerated during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub handle: CharacteristicHandle,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<Uuid>,
}

/// A primary service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// Physical transport preference passed through to `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportHint {
    Auto,
    BrEdr,
    #[default]
    Le,
}

/// Options for establishing the physical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectOptions {
    pub auto_reconnect: bool,
    pub transport: TransportHint,
}

/// Immediate outcome of a request issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issue {
    /// The stack queued the request; a completion event will follow.
    Accepted,
    /// The stack refused the request for now (typically busy); may be retried.
    Rejected,
}

/// Asynchronous completion and notification callbacks from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionStateChanged {
        status: GattStatus,
        phase: i32,
    },
    ServicesDiscovered {
        status: GattStatus,
    },
    CharacteristicRead {
        handle: CharacteristicHandle,
        uuid: Uuid,
        status: GattStatus,
        value: Vec<u8>,
    },
    CharacteristicWrite {
        handle: CharacteristicHandle,
        uuid: Uuid,
        status: GattStatus,
    },
    DescriptorWrite {
        handle: CharacteristicHandle,
        descriptor: Uuid,
        status: GattStatus,
    },
    CharacteristicChanged {
        handle: CharacteristicHandle,
        value: Vec<u8>,
    },
    RemoteRssi {
        rssi: i16,
        status: GattStatus,
    },
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
}

pub type GattEventSender = mpsc::UnboundedSender<GattEvent>;
pub type GattEventReceiver = mpsc::UnboundedReceiver<GattEvent>;

/// The platform GATT client for one physical link.
///
/// Every state-mutating call must be issued from a single confinement
/// context; the session engine guarantees this by routing all calls
/// through its transport worker. Issuance methods return `Ok(Issue)` when
/// the stack could be asked at all and `Err` when no call could be
/// attempted (link gone, stack unavailable).
pub trait GattTransport: Send + Sync {
    /// Address of the remote device this transport is bound to.
    fn address(&self) -> &BleAddress;

    /// Advertised device name, if known.
    fn name(&self) -> Option<String>;

    fn connect(&self, options: ConnectOptions) -> Result<(), BleError>;

    fn disconnect(&self) -> Result<(), BleError>;

    /// Release the link. No further events are delivered afterwards.
    fn close(&self);

    fn discover_services(&self) -> Result<Issue, BleError>;

    /// The service tree gathered by the last successful discovery.
    fn services(&self) -> Vec<DiscoveredService>;

    fn read_characteristic(&self, handle: CharacteristicHandle) -> Result<Issue, BleError>;

    fn write_characteristic(
        &self,
        handle: CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<Issue, BleError>;

    /// Enable or disable local delivery of notifications for a characteristic.
    fn set_characteristic_notification(
        &self,
        handle: CharacteristicHandle,
        enable: bool,
    ) -> Result<Issue, BleError>;

    fn write_descriptor(
        &self,
        handle: CharacteristicHandle,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<Issue, BleError>;

    fn request_mtu(&self, mtu: u16) -> Result<Issue, BleError>;

    fn read_remote_rssi(&self) -> Result<Issue, BleError>;

    /// Whether this platform can renegotiate the ATT MTU at all.
    fn supports_mtu_exchange(&self) -> bool {
        true
    }

    /// Devices the platform currently considers connected over GATT.
    fn connected_devices(&self) -> Vec<BleAddress>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ble_address_equality() {
        let addr1 = BleAddress::Real([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let addr2 = BleAddress::Real([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let addr3 = BleAddress::Real([0xFF, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(addr1, addr2);
        assert_ne!(addr1, addr3);

        let sim1 = BleAddress::Simulated(Uuid::nil());
        let sim2 = BleAddress::Simulated(Uuid::nil());
        assert_eq!(sim1, sim2);

        // Real and Simulated are never equal
        assert_ne!(addr1, sim1);
    }

    #[test]
    fn test_ble_address_display() {
        let addr = BleAddress::Real([0xAA, 0xBB, 0x0C, 0x01, 0x02, 0xFF]);
        assert_eq!(addr.to_string(), "AA:BB:0C:01:02:FF");

        let sim = BleAddress::Simulated(Uuid::nil());
        assert_eq!(
            sim.to_string(),
            "sim:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(CharacteristicHandle(0x2a).to_string(), "0x002a");
    }
}
