// Gattlink - Client-side BLE GATT session engine

pub mod ble;
pub mod config;
pub mod device;
pub mod model;
pub mod result;
pub mod session;

pub use ble::gatt::{Capability, GattStatus, WriteType};
pub use ble::transport::{BleAddress, GattEvent, GattTransport};
pub use ble::BleError;
pub use config::{ConfigError, GattConfig};
pub use device::{BleDevice, DeviceHooks, NoHooks};
pub use model::{
    ApplicationCharacteristic, CharacteristicRegistry, ConnectionState, Target,
    TargetCharacteristic,
};
pub use result::{
    GattOperationError, GattResult, MtuResult, OperationKind, ReadResult, RssiResult,
    SubscriptionResult, WriteResult,
};
pub use session::{GattSession, Notification, SessionError};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
