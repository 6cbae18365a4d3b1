//! Addressing of characteristics by service/characteristic pair or by id

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetParseError {
    #[error("Expected \"service@characteristic\", found {0} segment(s)")]
    WrongSegmentCount(usize),

    #[error("Invalid UUID {0:?}")]
    InvalidUuid(String),
}

/// A characteristic identified by its service and characteristic UUIDs.
///
/// The canonical string form is `"<service-uuid>@<characteristic-uuid>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetCharacteristic {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl TargetCharacteristic {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for TargetCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.characteristic)
    }
}

impl FromStr for TargetCharacteristic {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.split('@').collect();
        let [service, characteristic] = segments[..] else {
            return Err(TargetParseError::WrongSegmentCount(segments.len()));
        };
        let parse = |raw: &str| {
            Uuid::parse_str(raw.trim()).map_err(|_| TargetParseError::InvalidUuid(raw.to_string()))
        };
        Ok(Self {
            service: parse(service)?,
            characteristic: parse(characteristic)?,
        })
    }
}

impl TryFrom<String> for TargetCharacteristic {
    type Error = TargetParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetCharacteristic> for String {
    fn from(target: TargetCharacteristic) -> Self {
        target.to_string()
    }
}

/// How a caller names the characteristic an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Id(u64),
    Characteristic(TargetCharacteristic),
}

impl From<u64> for Target {
    fn from(id: u64) -> Self {
        Target::Id(id)
    }
}

impl From<TargetCharacteristic> for Target {
    fn from(target: TargetCharacteristic) -> Self {
        Target::Characteristic(target)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Id(id) => write!(f, "#{}", id),
            Target::Characteristic(target) => write!(f, "{}", target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID};

    #[test]
    fn test_canonical_string_round_trip() {
        let target = TargetCharacteristic::new(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID);
        let text = target.to_string();
        assert_eq!(
            text,
            "0000180f-0000-1000-8000-00805f9b34fb@00002a19-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(text.parse::<TargetCharacteristic>().unwrap(), target);
    }

    #[test]
    fn test_wrong_segment_count() {
        assert_eq!(
            "0000180f-0000-1000-8000-00805f9b34fb".parse::<TargetCharacteristic>(),
            Err(TargetParseError::WrongSegmentCount(1))
        );
        assert_eq!(
            "a@b@c".parse::<TargetCharacteristic>(),
            Err(TargetParseError::WrongSegmentCount(3))
        );
    }

    #[test]
    fn test_invalid_uuid() {
        let err = "not-a-uuid@00002a19-0000-1000-8000-00805f9b34fb"
            .parse::<TargetCharacteristic>()
            .unwrap_err();
        assert_eq!(err, TargetParseError::InvalidUuid("not-a-uuid".to_string()));
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let target = TargetCharacteristic::new(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID);
        let json = serde_json::to_string(&target).unwrap();
        assert_eq!(json, format!("\"{}\"", target));
        let back: TargetCharacteristic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, target);
    }
}
