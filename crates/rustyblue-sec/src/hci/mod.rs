//! Bluetooth HCI (Host Controller Interface) implementation
//!
//! This module provides the HCI commands and events the security manager
//! exchanges with the controller. The transport itself belongs to the host.

pub mod constants;
pub mod event;
pub mod packet;

#[cfg(test)]
mod tests;

pub use event::SecurityEvent;
pub use packet::{HciCommand, HciEvent, LINK_KEY_LEN, PIN_CODE_LEN};
