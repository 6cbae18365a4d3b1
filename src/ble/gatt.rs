//! GATT protocol constants, status codes and characteristic properties
//!
//! Only the primitives the session engine drives: status codes reported by
//! completion callbacks, the legal MTU range, the client characteristic
//! configuration descriptor and the characteristic property bits used to
//! validate declared capabilities.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Smallest ATT MTU every peripheral must accept.
pub const MTU_MIN: u16 = 23;

/// Largest ATT MTU a peripheral may negotiate.
pub const MTU_MAX: u16 = 517;

/// MTU in effect before any exchange has taken place.
pub const MTU_DEFAULT: u16 = MTU_MIN;

/// Sentinel published on the RSSI cell while no reading is available.
pub const RSSI_UNKNOWN: i16 = -0xFFF;

/// Value written to the CCCD to enable notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Bluetooth SIG base UUID, `0000xxxx-0000-1000-8000-00805f9b34fb`.
const SIG_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit SIG-assigned number into its full 128-bit UUID.
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(SIG_BASE_UUID | ((short as u128) << 96))
}

/// Client characteristic configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid = sig_uuid(0x2902);

/// Battery service.
pub const BATTERY_SERVICE_UUID: Uuid = sig_uuid(0x180F);

/// Battery level characteristic.
pub const BATTERY_LEVEL_UUID: Uuid = sig_uuid(0x2A19);

/// Application id conventionally used for the battery level characteristic.
pub const BATTERY_ID: u64 = 0x1001;

/// A raw status code reported by the transport.
///
/// ATT error codes and HCI disconnect reasons share this space on most
/// stacks, so some values carry two meanings (0x08 is both "insufficient
/// authorization" and "connection timeout").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0x00);
    pub const INVALID_HANDLE: GattStatus = GattStatus(0x01);
    pub const READ_NOT_PERMITTED: GattStatus = GattStatus(0x02);
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(0x03);
    pub const INVALID_PDU: GattStatus = GattStatus(0x04);
    pub const INSUFFICIENT_AUTHENTICATION: GattStatus = GattStatus(0x05);
    pub const REQUEST_NOT_SUPPORTED: GattStatus = GattStatus(0x06);
    pub const INVALID_OFFSET: GattStatus = GattStatus(0x07);
    pub const INSUFFICIENT_AUTHORIZATION: GattStatus = GattStatus(0x08);
    pub const CONNECTION_TIMEOUT: GattStatus = GattStatus(0x08);
    pub const INVALID_ATTRIBUTE_LENGTH: GattStatus = GattStatus(0x0D);
    pub const INSUFFICIENT_ENCRYPTION: GattStatus = GattStatus(0x0F);
    pub const TERMINATED_BY_PEER: GattStatus = GattStatus(0x13);
    pub const TERMINATED_BY_LOCAL_HOST: GattStatus = GattStatus(0x16);
    pub const CONNECTION_FAILED_TO_ESTABLISH: GattStatus = GattStatus(0x3E);
    pub const NO_RESOURCES: GattStatus = GattStatus(0x80);
    pub const INTERNAL_ERROR: GattStatus = GattStatus(0x81);
    pub const WRONG_STATE: GattStatus = GattStatus(0x82);
    pub const BUSY: GattStatus = GattStatus(0x84);
    pub const ERROR: GattStatus = GattStatus(0x85);
    pub const CONNECTION_CONGESTED: GattStatus = GattStatus(0x8F);
    pub const FAILURE: GattStatus = GattStatus(0x101);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Human-readable name for the statuses callers commonly see.
    pub fn name(self) -> &'static str {
        match self {
            Self::SUCCESS => "GATT SUCCESS",
            Self::INVALID_HANDLE => "GATT INVALID HANDLE",
            Self::READ_NOT_PERMITTED => "GATT READ NOT PERMITTED",
            Self::WRITE_NOT_PERMITTED => "GATT WRITE NOT PERMITTED",
            Self::INVALID_PDU => "GATT INVALID PDU",
            Self::INSUFFICIENT_AUTHENTICATION => "GATT INSUFFICIENT AUTHENTICATION",
            Self::REQUEST_NOT_SUPPORTED => "GATT REQUEST NOT SUPPORTED",
            Self::INVALID_OFFSET => "GATT INVALID OFFSET",
            Self::INSUFFICIENT_AUTHORIZATION => "GATT INSUFFICIENT AUTHORIZATION OR CONNECTION TIMEOUT",
            Self::INVALID_ATTRIBUTE_LENGTH => "GATT INVALID ATTRIBUTE LENGTH",
            Self::INSUFFICIENT_ENCRYPTION => "GATT INSUFFICIENT ENCRYPTION",
            Self::TERMINATED_BY_PEER => "CONNECTION TERMINATED BY PEER",
            Self::TERMINATED_BY_LOCAL_HOST => "CONNECTION TERMINATED BY LOCAL HOST",
            Self::CONNECTION_FAILED_TO_ESTABLISH => "CONNECTION FAILED TO ESTABLISH",
            Self::NO_RESOURCES => "GATT NO RESOURCES",
            Self::INTERNAL_ERROR => "GATT INTERNAL ERROR",
            Self::WRONG_STATE => "GATT WRONG STATE",
            Self::BUSY => "GATT BUSY",
            Self::ERROR => "GATT ERROR",
            Self::CONNECTION_CONGESTED => "GATT CONNECTION CONGESTED",
            Self::FAILURE => "GATT FAILURE",
            _ => "GATT UNKNOWN STATUS",
        }
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} DEC 0x{:x} HEX]", self.name(), self.0, self.0)
    }
}

/// Property bits advertised by a characteristic declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties(pub u8);

impl CharacteristicProperties {
    pub const BROADCAST: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_NO_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;

    pub fn contains(self, bits: u8) -> bool {
        self.0 & bits != 0
    }

    /// Capabilities from [`Capability::ALL`] these properties support.
    pub fn capabilities(self) -> Vec<Capability> {
        Capability::ALL
            .into_iter()
            .filter(|c| c.supported_by(self))
            .collect()
    }
}

/// A capability an application requires from a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Read,
    Write,
    WriteNoResponse,
    Notify,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Read,
        Capability::Write,
        Capability::WriteNoResponse,
        Capability::Notify,
    ];

    fn property_bit(self) -> u8 {
        match self {
            Capability::Read => CharacteristicProperties::READ,
            Capability::Write => CharacteristicProperties::WRITE,
            Capability::WriteNoResponse => CharacteristicProperties::WRITE_NO_RESPONSE,
            Capability::Notify => CharacteristicProperties::NOTIFY,
        }
    }

    pub fn supported_by(self, properties: CharacteristicProperties) -> bool {
        properties.contains(self.property_bit())
    }
}

/// How a characteristic write is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Clamp a requested MTU into `MTU_MIN..=MTU_MAX`.
pub fn clamp_mtu(desired: u16) -> u16 {
    desired.clamp(MTU_MIN, MTU_MAX)
}
