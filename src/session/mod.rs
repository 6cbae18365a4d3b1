//! The GATT session engine
//!
//! A [`GattSession`] owns one transport link. It folds raw callbacks into
//! connection states, guards each waiting phase with a watchdog, serialises
//! every state-mutating transport call through a single worker task, and
//! turns request/completion pairs into awaitable operations with typed
//! outcomes.

mod engine;
pub mod error;
mod latch;
mod slot;
mod watchdog;
mod worker;

pub use engine::{GattSession, Notification};
pub use error::SessionError;

pub(crate) use latch::OnceLatch;
