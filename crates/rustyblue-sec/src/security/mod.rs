//! BR/EDR Security Manager
//!
//! Decides whether a service may use a link, drives authentication,
//! encryption and pairing with the controller, and keeps per-peer security
//! state. The host stack plugs in through the traits of [`platform`].

mod access;
pub mod config;
pub mod constants;
pub mod device;
mod events;
mod manager;
mod pairing;
pub mod platform;
pub mod queue;
pub mod service;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::SecurityConfig;
pub use device::{DeviceSecurityRecord, DeviceStore};
pub use manager::SecurityManager;
pub use platform::{
    AclLinks, Controller, DevicePropertyStore, HciSink, MemoryPropertyStore, Platform, SecTimers,
    SecurityCallbacks, TimerId,
};
pub use queue::{PendingQueue, PendingRequest};
pub use service::{ServiceRegistration, ServiceRegistry, ServiceSecurityRecord};
pub use types::*;
