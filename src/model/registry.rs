//! Characteristic registry built once per connection from discovery results

use std::collections::HashMap;

use log::{debug, info, warn};
use uuid::Uuid;

use super::characteristic::ApplicationCharacteristic;
use super::target::{Target, TargetCharacteristic};
use crate::ble::gatt::{CharacteristicProperties, WriteType};
use crate::ble::transport::{CharacteristicHandle, DiscoveredService};

/// A declared (or, in fallback mode, discovered) characteristic bound to
/// its transport handle for the current connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCharacteristic {
    pub id: u64,
    pub target: TargetCharacteristic,
    pub handle: CharacteristicHandle,
    pub properties: CharacteristicProperties,
    pub write_type: WriteType,
}

impl ResolvedCharacteristic {
    pub fn uuid(&self) -> Uuid {
        self.target.characteristic
    }
}

/// Result of matching declared characteristics against a service tree.
#[derive(Debug)]
pub struct Registration {
    pub registry: CharacteristicRegistry,
    pub required_features: usize,
    pub matched_features: usize,
}

impl Registration {
    /// Every declared capability was found on the peripheral.
    pub fn is_satisfied(&self) -> bool {
        self.matched_features == self.required_features
    }
}

/// Lookup of resolved characteristics by id, target pair or handle.
#[derive(Debug, Default)]
pub struct CharacteristicRegistry {
    entries: Vec<ResolvedCharacteristic>,
    by_id: HashMap<u64, usize>,
    by_target: HashMap<TargetCharacteristic, usize>,
    by_handle: HashMap<CharacteristicHandle, usize>,
}

impl CharacteristicRegistry {
    /// Match `declared` against the discovered `services`.
    ///
    /// With no declared characteristics the registry enters exploratory
    /// mode: every discovered characteristic is registered under a
    /// sequential id starting at 1 and its capabilities are logged.
    pub fn register(
        tag: &str,
        declared: &[ApplicationCharacteristic],
        services: &[DiscoveredService],
    ) -> Registration {
        if declared.is_empty() {
            return Self::explore(tag, services);
        }

        let mut registry = CharacteristicRegistry::default();
        let required_features = declared.iter().map(|c| c.capabilities.len()).sum();
        let mut matched_features = 0;

        for wanted in declared {
            let found = services
                .iter()
                .filter(|s| s.uuid == wanted.service)
                .flat_map(|s| s.characteristics.iter())
                .find(|c| c.uuid == wanted.characteristic);

            let Some(found) = found else {
                warn!("{} characteristic {} [{}] not found", tag, wanted.target(), wanted.id);
                continue;
            };

            for capability in &wanted.capabilities {
                if capability.supported_by(found.properties) {
                    matched_features += 1;
                } else {
                    warn!(
                        "{} characteristic {} [{}] lacks {:?}",
                        tag,
                        wanted.target(),
                        wanted.id,
                        capability
                    );
                }
            }

            registry.insert(ResolvedCharacteristic {
                id: wanted.id,
                target: wanted.target(),
                handle: found.handle,
                properties: found.properties,
                write_type: wanted.write_type(),
            });
        }

        info!(
            "{} registered {} of {} characteristics, {}/{} features",
            tag,
            registry.len(),
            declared.len(),
            matched_features,
            required_features
        );

        Registration {
            registry,
            required_features,
            matched_features,
        }
    }

    fn explore(tag: &str, services: &[DiscoveredService]) -> Registration {
        let mut registry = CharacteristicRegistry::default();
        let mut next_id = 1;

        for service in services {
            info!("{} service {}", tag, service.uuid);
            for found in &service.characteristics {
                let capabilities = found.properties.capabilities();
                info!(
                    "{}   [{}] characteristic {} at {} {:?}",
                    tag, next_id, found.uuid, found.handle, capabilities
                );
                for descriptor in &found.descriptors {
                    debug!("{}     descriptor {}", tag, descriptor);
                }
                let write_type = if !found.properties.contains(CharacteristicProperties::WRITE)
                    && found
                        .properties
                        .contains(CharacteristicProperties::WRITE_NO_RESPONSE)
                {
                    WriteType::WithoutResponse
                } else {
                    WriteType::WithResponse
                };
                registry.insert(ResolvedCharacteristic {
                    id: next_id,
                    target: TargetCharacteristic::new(service.uuid, found.uuid),
                    handle: found.handle,
                    properties: found.properties,
                    write_type,
                });
                next_id += 1;
            }
        }

        Registration {
            registry,
            required_features: 0,
            matched_features: 0,
        }
    }

    fn insert(&mut self, entry: ResolvedCharacteristic) {
        let index = self.entries.len();
        self.by_id.insert(entry.id, index);
        self.by_target.insert(entry.target, index);
        self.by_handle.insert(entry.handle, index);
        self.entries.push(entry);
    }

    pub fn get(&self, target: &Target) -> Option<&ResolvedCharacteristic> {
        match target {
            Target::Id(id) => self.by_id(*id),
            Target::Characteristic(target) => self.by_target(target),
        }
    }

    pub fn by_id(&self, id: u64) -> Option<&ResolvedCharacteristic> {
        self.by_id.get(&id).map(|&i| &self.entries[i])
    }

    pub fn by_target(&self, target: &TargetCharacteristic) -> Option<&ResolvedCharacteristic> {
        self.by_target.get(target).map(|&i| &self.entries[i])
    }

    /// Lookup by canonical `"service@characteristic"` string.
    pub fn by_target_str(&self, target: &str) -> Option<&ResolvedCharacteristic> {
        target
            .parse::<TargetCharacteristic>()
            .ok()
            .and_then(|t| self.by_target(&t))
    }

    pub fn by_handle(&self, handle: CharacteristicHandle) -> Option<&ResolvedCharacteristic> {
        self.by_handle.get(&handle).map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedCharacteristic> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{Capability, BATTERY_ID, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID};
    use crate::ble::simulated::GattTableBuilder;

    fn battery_table(properties: u8) -> Vec<DiscoveredService> {
        GattTableBuilder::new()
            .service(BATTERY_SERVICE_UUID)
            .characteristic(BATTERY_LEVEL_UUID, properties)
            .build()
    }

    #[test]
    fn test_all_features_matched() {
        let services = battery_table(
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
        );
        let registration = CharacteristicRegistry::register(
            "[test]",
            &[ApplicationCharacteristic::battery()],
            &services,
        );

        assert!(registration.is_satisfied());
        assert_eq!(registration.required_features, 2);

        let registry = registration.registry;
        let by_id = registry.by_id(BATTERY_ID).unwrap();
        let target = TargetCharacteristic::new(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID);
        assert_eq!(registry.by_target(&target), Some(by_id));
        assert_eq!(registry.by_target_str(&target.to_string()), Some(by_id));
        assert_eq!(registry.by_handle(by_id.handle), Some(by_id));
        assert_eq!(registry.get(&Target::Id(BATTERY_ID)), Some(by_id));
    }

    #[test]
    fn test_missing_capability_fails_registration() {
        let services = battery_table(CharacteristicProperties::READ);
        let registration = CharacteristicRegistry::register(
            "[test]",
            &[ApplicationCharacteristic::battery()],
            &services,
        );

        assert!(!registration.is_satisfied());
        assert_eq!(registration.matched_features, 1);
        assert_eq!(registration.required_features, 2);
    }

    #[test]
    fn test_missing_characteristic_fails_registration() {
        let services = GattTableBuilder::new()
            .service(BATTERY_SERVICE_UUID)
            .build();
        let registration = CharacteristicRegistry::register(
            "[test]",
            &[ApplicationCharacteristic::battery()],
            &services,
        );

        assert!(!registration.is_satisfied());
        assert!(registration.registry.is_empty());
    }

    #[test]
    fn test_characteristic_under_wrong_service_is_not_matched() {
        let services = GattTableBuilder::new()
            .service(Uuid::new_v4())
            .characteristic(BATTERY_LEVEL_UUID, CharacteristicProperties::READ)
            .build();
        let wanted = ApplicationCharacteristic::new(
            BATTERY_SERVICE_UUID,
            BATTERY_LEVEL_UUID,
            vec![Capability::Read],
            7,
        );
        let registration = CharacteristicRegistry::register("[test]", &[wanted], &services);

        assert!(!registration.is_satisfied());
        assert!(registration.registry.by_id(7).is_none());
    }

    #[test]
    fn test_exploratory_mode_assigns_sequential_ids() {
        let services = GattTableBuilder::new()
            .service(BATTERY_SERVICE_UUID)
            .characteristic(BATTERY_LEVEL_UUID, CharacteristicProperties::READ)
            .service(Uuid::new_v4())
            .characteristic(Uuid::new_v4(), CharacteristicProperties::WRITE_NO_RESPONSE)
            .build();
        let registration = CharacteristicRegistry::register("[test]", &[], &services);

        assert!(registration.is_satisfied());
        let registry = registration.registry;
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.by_id(1).unwrap().uuid(), BATTERY_LEVEL_UUID);
        assert_eq!(
            registry.by_id(2).unwrap().write_type,
            WriteType::WithoutResponse
        );
        assert!(registry.by_id(3).is_none());
    }
}
