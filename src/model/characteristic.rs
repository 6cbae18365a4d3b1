//! Characteristics an application declares it needs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::target::TargetCharacteristic;
use crate::ble::gatt::{
    Capability, WriteType, BATTERY_ID, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID,
};

/// A characteristic the application requires, with the capabilities it
/// expects the peripheral to advertise and the id callers address it by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationCharacteristic {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub capabilities: Vec<Capability>,
    pub id: u64,
}

impl ApplicationCharacteristic {
    pub fn new(service: Uuid, characteristic: Uuid, capabilities: Vec<Capability>, id: u64) -> Self {
        Self {
            service,
            characteristic,
            capabilities,
            id,
        }
    }

    /// Battery level, readable and notifying.
    pub fn battery() -> Self {
        Self::new(
            BATTERY_SERVICE_UUID,
            BATTERY_LEVEL_UUID,
            vec![Capability::Read, Capability::Notify],
            BATTERY_ID,
        )
    }

    pub fn target(&self) -> TargetCharacteristic {
        TargetCharacteristic::new(self.service, self.characteristic)
    }

    pub fn requires(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Writes go without response only when that is the sole write
    /// capability declared.
    pub fn write_type(&self) -> WriteType {
        if self.requires(Capability::WriteNoResponse) && !self.requires(Capability::Write) {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_preset() {
        let battery = ApplicationCharacteristic::battery();
        assert_eq!(battery.id, BATTERY_ID);
        assert!(battery.requires(Capability::Notify));
        assert!(!battery.requires(Capability::Write));
        assert_eq!(battery.target().service, BATTERY_SERVICE_UUID);
    }

    #[test]
    fn test_write_type_selection() {
        let service = Uuid::new_v4();
        let no_response = ApplicationCharacteristic::new(
            service,
            Uuid::new_v4(),
            vec![Capability::WriteNoResponse],
            1,
        );
        assert_eq!(no_response.write_type(), WriteType::WithoutResponse);

        let both = ApplicationCharacteristic::new(
            service,
            Uuid::new_v4(),
            vec![Capability::Write, Capability::WriteNoResponse],
            2,
        );
        assert_eq!(both.write_type(), WriteType::WithResponse);
    }

    #[test]
    fn test_deserializes_from_json() {
        let json = r#"{
            "service": "0000180f-0000-1000-8000-00805f9b34fb",
            "characteristic": "00002a19-0000-1000-8000-00805f9b34fb",
            "capabilities": ["Read", "Notify"],
            "id": 4097
        }"#;
        let parsed: ApplicationCharacteristic = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, ApplicationCharacteristic::battery());
    }
}
