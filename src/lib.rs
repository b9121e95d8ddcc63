//! # HRV Logger
//!
//! Multi-device BLE heart-rate session manager. Connects to any number of
//! heart-rate straps, decodes their notifications, publishes them as events and
//! records per-device heart rate and RR interval logs stamped with an
//! NTP-corrected wall clock.
//!
//! ## Modules
//! - `session`: connection registry and callback routing
//! - `gatt`: stack abstraction and the serialized request executor
//! - `platform`: btleplug backend for `gatt`
//! - `sensor`: GATT decoders keyed by service UUID
//! - `storage`: per-device CSV logs on a background thread
//! - `clock`: monotonic clock plus a one-shot NTP offset
//! - `events`: broadcast of session events to subscribers

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod gatt;
pub mod platform;
pub mod sensor;
pub mod session;
pub mod storage;

#[cfg(test)]
mod mock;

pub use config::Config;
pub use error::SessionError;
pub use events::{Event, EventBus};
pub use session::{ConnectionState, SessionManager};
