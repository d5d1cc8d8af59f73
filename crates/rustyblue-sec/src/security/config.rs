//! Security manager configuration

use super::constants::*;
use super::types::{IoCapability, PinType, SecurityMode};
use crate::hci::PIN_CODE_LEN;
use std::time::Duration;

/// Settings fixed when the manager is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityConfig {
    /// Local security mode
    pub security_mode: SecurityMode,

    /// PIN type written to the controller
    pub pin_type: PinType,

    /// PIN used for automatic replies when the pin type is fixed
    pub fixed_pin: Vec<u8>,

    /// Local IO capability advertised during simple pairing
    pub local_io_caps: IoCapability,

    /// Reject all incoming pairing attempts
    pub pairing_disabled: bool,

    /// Allow authentication started by the peer while we wait on the link
    pub concurrent_peer_auth: bool,

    /// Process encryption change events on links already encrypted
    pub handle_unexpected_encryption_change: bool,

    /// Delay before issuing Authentication Requested
    pub auth_delay: Duration,

    /// Pairing watchdog
    pub pairing_timeout: Duration,

    /// Delay between LMP collision retries
    pub collision_retry_delay: Duration,

    /// Retries stop once this much time has passed since the first collision
    pub collision_window: Duration,

    pub max_device_records: usize,
    pub max_service_records: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            security_mode: SecurityMode::Sp,
            pin_type: PinType::Variable,
            fixed_pin: Vec::new(),
            local_io_caps: IoCapability::DisplayYesNo,
            pairing_disabled: false,
            concurrent_peer_auth: true,
            handle_unexpected_encryption_change: false,
            auth_delay: Duration::from_millis(SEC_DEFAULT_AUTH_DELAY_MS),
            pairing_timeout: Duration::from_millis(SEC_PAIRING_TIMEOUT_MS),
            collision_retry_delay: Duration::from_millis(SEC_COLLISION_RETRY_MS),
            collision_window: Duration::from_millis(SEC_COLLISION_WINDOW_MS),
            max_device_records: DEFAULT_MAX_DEVICE_RECORDS,
            max_service_records: DEFAULT_MAX_SERVICE_RECORDS,
        }
    }
}

impl SecurityConfig {
    /// Fixed PIN truncated to the maximum PIN length
    pub fn fixed_pin(&self) -> &[u8] {
        &self.fixed_pin[..self.fixed_pin.len().min(PIN_CODE_LEN)]
    }
}
