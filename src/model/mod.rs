//! Connection states, characteristic addressing and the per-connection
//! characteristic registry.

pub mod characteristic;
pub mod registry;
pub mod state;
pub mod target;

pub use characteristic::ApplicationCharacteristic;
pub use registry::{CharacteristicRegistry, Registration, ResolvedCharacteristic};
pub use state::{ConnectionStage, ConnectionState, LinkAction, Transition, WatchdogPhase};
pub use target::{Target, TargetCharacteristic, TargetParseError};
