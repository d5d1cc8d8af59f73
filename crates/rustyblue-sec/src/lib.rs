//! RustyBlue Security - Bluetooth BR/EDR security management
//!
//! This library implements the security manager of a Bluetooth host stack for
//! classic (BR/EDR) links. It gates service access on authentication,
//! encryption and MITM requirements, runs legacy PIN and Secure Simple Pairing
//! exchanges, and tracks link keys and per-peer security state.
//!
//! The crate does no I/O. Commands go out through [`security::HciSink`], events
//! come in through [`SecurityManager::handle_hci_event`], and timers and links
//! are owned by the host.

pub mod error;
pub mod gap;
pub mod hci;
pub mod l2cap;
pub mod security;

// Re-export common types for convenience
pub use error::{HciError, SecError, SecResult};
pub use gap::{AddressType, BdAddr, DeviceClass, DeviceType, Role, Transport};
pub use hci::{HciCommand, HciEvent, SecurityEvent};
pub use security::{
    Platform, SecStatus, SecurityCallbacks, SecurityConfig, SecurityManager, SecurityMode,
};
