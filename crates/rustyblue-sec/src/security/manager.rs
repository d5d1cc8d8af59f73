//! Security manager context
//!
//! [`SecurityManager`] owns the device records, the service registry, the queue
//! of deferred requests and the single pairing context. Every entry point takes
//! `&mut self`; the host serializes calls onto one event loop.

use super::config::SecurityConfig;
use super::constants::*;
use super::device::{DeviceSecurityRecord, DeviceStore};
use super::platform::{Platform, SecurityCallbacks, TimerId};
use super::queue::{PendingQueue, PendingRequest};
use super::service::{ServiceRegistration, ServiceRegistry};
use super::types::*;
use crate::error::SecResult;
use crate::gap::{BdAddr, DeviceClass, DeviceType, Transport};
use crate::hci::{HciCommand, LINK_KEY_LEN};
use log::{debug, info, warn};
use std::time::Duration;

/// The one pairing exchange allowed at a time
pub(crate) struct PairingContext {
    pub state: PairingState,
    pub bd_addr: BdAddr,
    pub flags: PairingFlags,
    /// PIN supplied with a bonding request
    pub pin_code: Vec<u8>,
}

impl Default for PairingContext {
    fn default() -> Self {
        Self {
            state: PairingState::Idle,
            bd_addr: BdAddr::ANY,
            flags: PairingFlags::empty(),
            pin_code: Vec::new(),
        }
    }
}

/// BR/EDR security manager
pub struct SecurityManager {
    pub(crate) config: SecurityConfig,
    pub(crate) platform: Platform,
    pub(crate) callbacks: Option<Box<dyn SecurityCallbacks>>,
    pub(crate) devices: DeviceStore,
    pub(crate) services: ServiceRegistry,
    pub(crate) pending: PendingQueue,
    rmt_name_callbacks: Vec<Option<RmtNameCallback>>,
    pub(crate) pairing: PairingContext,

    /// An L2CAP request was parked while pairing ran
    pub(crate) sec_req_pending: bool,

    /// Time of the first LMP collision in the current retry window, 0 if none
    pub(crate) collision_start_time: u64,
    pub(crate) collided_dev: Option<BdAddr>,

    /// Authentication enable was turned on for a legacy bonding
    pub(crate) security_mode_changed: bool,
    /// Pin type was forced to fixed for a keyboard
    pub(crate) pin_type_changed: bool,

    /// Local auth requirement sent in the last IO capability reply
    pub(crate) loc_auth_req: u8,

    /// Peer of the last incoming connection request
    pub(crate) connecting_bda: BdAddr,
    pub(crate) connecting_dc: DeviceClass,
}

impl SecurityManager {
    /// Create a new security manager
    pub fn new(config: SecurityConfig, platform: Platform) -> Self {
        let devices = DeviceStore::new(config.max_device_records);
        let services = ServiceRegistry::new(config.max_service_records);

        Self {
            config,
            platform,
            callbacks: None,
            devices,
            services,
            pending: PendingQueue::new(),
            rmt_name_callbacks: (0..SEC_MAX_RMT_NAME_CALLBACKS).map(|_| None).collect(),
            pairing: PairingContext::default(),
            sec_req_pending: false,
            collision_start_time: 0,
            collided_dev: None,
            security_mode_changed: false,
            pin_type_changed: false,
            loc_auth_req: AUTH_SP_NO,
            connecting_bda: BdAddr::ANY,
            connecting_dc: DeviceClass::EMPTY,
        }
    }

    /// Register the application callbacks, replacing any earlier registration
    pub fn register_callbacks(&mut self, callbacks: Box<dyn SecurityCallbacks>) {
        info!("Security application registered");
        self.callbacks = Some(callbacks);
    }

    /// Add a remote name observer.
    ///
    /// Returns `None` when all observer slots are taken.
    pub fn add_remote_name_callback(&mut self, callback: RmtNameCallback) -> Option<RmtNameCallbackId> {
        let slot = self.rmt_name_callbacks.iter().position(|cb| cb.is_none())?;
        self.rmt_name_callbacks[slot] = Some(callback);
        Some(RmtNameCallbackId(slot))
    }

    pub fn delete_remote_name_callback(&mut self, id: RmtNameCallbackId) -> bool {
        match self.rmt_name_callbacks.get_mut(id.0) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn notify_rmt_name_observers(&mut self, bd_addr: &BdAddr, dev_class: DeviceClass, name: &str) {
        for callback in self.rmt_name_callbacks.iter_mut().flatten() {
            callback(bd_addr, dev_class, name);
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn security_mode(&self) -> SecurityMode {
        self.config.security_mode
    }

    pub fn set_security_mode(&mut self, mode: SecurityMode) {
        self.config.security_mode = mode;
    }

    pub fn set_local_io_caps(&mut self, io_caps: IoCapability) {
        self.config.local_io_caps = io_caps;
    }

    pub fn set_pairing_disabled(&mut self, disabled: bool) {
        self.config.pairing_disabled = disabled;
    }

    /// Change the PIN type and the fixed PIN.
    ///
    /// The controller is only updated when it is up; otherwise the value is
    /// applied at the next reset.
    pub fn set_pin_type(&mut self, pin_type: PinType, pin: &[u8]) {
        debug!("Set pin type {:?}, pin length {}", pin_type, pin.len());

        if self.config.pin_type != pin_type && self.platform.controller.is_ready() {
            self.send(HciCommand::WritePinType {
                pin_type: pin_type.to_u8(),
            });
        }

        self.config.pin_type = pin_type;
        self.config.fixed_pin = pin.to_vec();
    }

    pub fn pairing_state(&self) -> PairingState {
        self.pairing.state
    }

    /// Peer of the running pairing, `BdAddr::ANY` when idle
    pub fn pairing_bd_addr(&self) -> BdAddr {
        self.pairing.bd_addr
    }

    pub fn device(&self, bd_addr: &BdAddr) -> Option<&DeviceSecurityRecord> {
        self.devices.find(bd_addr)
    }

    /// Number of requests waiting for the current procedure to finish
    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }

    /// Add or update a known device, with its stored link key if bonded
    pub fn add_device(
        &mut self,
        bd_addr: &BdAddr,
        dev_class: DeviceClass,
        name: Option<&str>,
        link_key: Option<([u8; LINK_KEY_LEN], LinkKeyType)>,
        pin_length: u8,
    ) {
        let rec = self.devices.find_or_alloc(bd_addr);
        rec.dev_class = dev_class;

        if let Some(name) = name {
            rec.name = name.chars().take(MAX_REM_BD_NAME_LEN).collect();
            rec.sec_flags |= SecFlags::NAME_KNOWN;
        }

        if let Some((key, key_type)) = link_key {
            rec.sec_flags |= SecFlags::LINK_KEY_KNOWN;
            rec.link_key = key;
            rec.link_key_type = key_type;
            rec.pin_code_length = pin_length;
            rec.bond_type = BondType::Persistent;

            if pin_length >= 16 || key_type.is_authenticated() {
                rec.sec_flags |= SecFlags::PIN_16_DIGIT_AUTHED;
            }
        }
        debug!("Device {} added, flags {:?}", bd_addr, rec.sec_flags);
    }

    /// Forget a device. Connected devices are kept.
    pub fn delete_device(&mut self, bd_addr: &BdAddr) -> bool {
        match self.devices.find(bd_addr) {
            Some(rec) if rec.is_connected() => {
                warn!("Cannot delete {} while connected", bd_addr);
                false
            }
            Some(_) => {
                self.devices.remove(bd_addr);
                true
            }
            None => false,
        }
    }

    /// Mark a device's bond as temporary or persistent
    pub fn set_bond_type(&mut self, bd_addr: &BdAddr, bond_type: BondType) -> bool {
        match self.devices.find_mut(bd_addr) {
            Some(rec) => {
                rec.bond_type = bond_type;
                true
            }
            None => false,
        }
    }

    /// Security flags of a transport, `None` for an unknown device
    pub fn security_flags(&self, bd_addr: &BdAddr, transport: Transport) -> Option<SecFlags> {
        self.devices.find(bd_addr).map(|rec| rec.flags(transport))
    }

    fn has_flag(&self, bd_addr: &BdAddr, transport: Transport, flag: SecFlags) -> bool {
        self.security_flags(bd_addr, transport)
            .map(|flags| flags.contains(flag))
            .unwrap_or(false)
    }

    pub fn is_encrypted(&self, bd_addr: &BdAddr, transport: Transport) -> bool {
        self.has_flag(bd_addr, transport, SecFlags::ENCRYPTED)
    }

    pub fn is_authenticated(&self, bd_addr: &BdAddr, transport: Transport) -> bool {
        self.has_flag(bd_addr, transport, SecFlags::AUTHENTICATED)
    }

    pub fn is_link_key_known(&self, bd_addr: &BdAddr, transport: Transport) -> bool {
        self.has_flag(bd_addr, transport, SecFlags::LINK_KEY_KNOWN)
    }

    pub fn is_link_key_authed(&self, bd_addr: &BdAddr, transport: Transport) -> bool {
        self.has_flag(bd_addr, transport, SecFlags::LINK_KEY_AUTHED)
    }

    /// Link key type, `Ignore` unless a key is known
    pub fn link_key_type(&self, bd_addr: &BdAddr) -> LinkKeyType {
        match self.devices.find(bd_addr) {
            Some(rec) if rec.is_link_key_known() => rec.link_key_type,
            _ => LinkKeyType::Ignore,
        }
    }

    /// Authentication or encryption running for the device
    pub fn is_security_pending(&self, bd_addr: &BdAddr) -> bool {
        self.devices
            .find(bd_addr)
            .map(|rec| {
                matches!(
                    rec.sec_state,
                    SecState::Encrypting | SecState::LeEncrypting | SecState::Authenticating
                )
            })
            .unwrap_or(false)
    }

    pub fn peer_supports_secure_connections(&self, bd_addr: &BdAddr) -> bool {
        match self.devices.find(bd_addr) {
            Some(rec) => rec.remote_supports_secure_connections,
            None => {
                warn!("Unknown device {}", bd_addr);
                false
            }
        }
    }

    pub fn both_ends_support_secure_connections(&self, bd_addr: &BdAddr) -> bool {
        self.platform.controller.supports_secure_connections()
            && self.peer_supports_secure_connections(bd_addr)
    }

    /// Device type derived from the peer's supported features
    pub fn peer_device_type_from_features(&self, bd_addr: &BdAddr) -> DeviceType {
        match self.devices.find(bd_addr) {
            Some(rec) if rec.remote_supports_ble && rec.remote_supports_bredr => DeviceType::DUMO,
            Some(rec) if rec.remote_supports_bredr => DeviceType::BREDR,
            Some(rec) if rec.remote_supports_ble => DeviceType::BLE,
            Some(_) => {
                warn!("Device {} supports neither BR/EDR nor LE", bd_addr);
                DeviceType::BREDR
            }
            None => {
                warn!("Unknown device {}", bd_addr);
                DeviceType::BREDR
            }
        }
    }

    /// Bonded on BR/EDR or LE
    pub fn is_a_bonded_dev(&self, bd_addr: &BdAddr) -> bool {
        let bonded = self.devices.find(bd_addr).map(|rec| rec.is_bonded()).unwrap_or(false);
        debug!("Bonded check {}: {}", bd_addr, bonded);
        bonded
    }

    /// Register or update the security requirements of a service
    pub fn set_security_level(&mut self, registration: &ServiceRegistration<'_>) -> SecResult<()> {
        let ssp_mode = self.config.security_mode.is_ssp();
        self.services.set_security_level(registration, ssp_mode)
    }

    /// Free the services with an id (0 for all but SDP), returning the count
    pub fn clear_service(&mut self, service_id: u8) -> u8 {
        self.services.clear_service(service_id)
    }

    pub fn clear_service_by_psm(&mut self, psm: u16) -> u8 {
        self.services.clear_service_by_psm(psm)
    }

    /// Deliver an expired timer
    pub fn on_timer_expired(&mut self, id: TimerId) {
        debug!("Timer {:?} expired", id);
        match id {
            TimerId::Pairing => self.pairing_timeout(),
            TimerId::Collision => self.collision_timeout(),
            TimerId::ConnectAfterReject => self.connect_after_reject_timeout(),
            TimerId::AuthDelay(bd_addr) => self.auth_timer_timeout(&bd_addr),
        }
    }

    pub(crate) fn send(&mut self, command: HciCommand) {
        debug!("HCI command {:?}", command);
        self.platform.hci.send(command);
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.platform.timers.now_ms()
    }

    pub(crate) fn schedule(&mut self, id: TimerId, delay: Duration) {
        self.platform.timers.schedule(id, delay);
    }

    pub(crate) fn cancel_timer(&mut self, id: TimerId) {
        self.platform.timers.cancel(id);
    }

    pub(crate) fn is_pairing_with(&self, bd_addr: &BdAddr) -> bool {
        self.pairing.state != PairingState::Idle && self.pairing.bd_addr == *bd_addr
    }

    /// Move the pairing state machine.
    ///
    /// Leaving IDLE marks the link as bonding and arms the watchdog. Returning
    /// to IDLE clears the pairing context and resubmits parked requests.
    pub(crate) fn change_pairing_state(&mut self, new_state: PairingState) {
        let old_state = self.pairing.state;
        debug!(
            "Pairing state changed {} => {} pairing_flags:{:?}",
            old_state, new_state, self.pairing.flags
        );

        self.pairing.state = new_state;

        if new_state == PairingState::Idle {
            self.cancel_timer(TimerId::Pairing);

            self.pairing.flags = PairingFlags::empty();
            self.pairing.pin_code.clear();

            let bd_addr = self.pairing.bd_addr;
            self.platform.acl.set_bonding(&bd_addr, false);

            self.restore_mode();
            self.pairing.bd_addr = BdAddr::ANY;

            // Drained callbacks may start the next pairing
            self.check_pending_reqs();
        } else {
            if old_state == PairingState::Idle {
                let bd_addr = self.pairing.bd_addr;
                self.platform.acl.set_bonding(&bd_addr, true);
            }
            let timeout = self.config.pairing_timeout;
            self.schedule(TimerId::Pairing, timeout);
        }
    }

    /// Undo controller settings changed for a bonding
    pub(crate) fn restore_mode(&mut self) {
        if self.security_mode_changed {
            self.security_mode_changed = false;
            self.send(HciCommand::WriteAuthenticationEnable { enable: false });
        }

        if self.pin_type_changed {
            self.pin_type_changed = false;
            let pin_type = self.config.pin_type.to_u8();
            self.send(HciCommand::WritePinType { pin_type });
        }
    }

    /// Resubmit parked requests once no pairing runs
    pub(crate) fn check_pending_reqs(&mut self) {
        if self.pairing.state != PairingState::Idle {
            return;
        }

        if self.sec_req_pending {
            self.sec_req_pending = false;
            self.platform.acl.resubmit_pending_sec_requests(None);
        }

        for request in self.pending.take_all() {
            let bd_addr = *request.bd_addr();
            if !self.platform.acl.is_link_up(&bd_addr, request.transport()) {
                debug!("Dropping queued request for {}, link is down", bd_addr);
                continue;
            }

            match request {
                PendingRequest::Multiplexor {
                    bd_addr,
                    psm,
                    is_originator,
                    security_required,
                    callback,
                } => {
                    debug!("Resubmitting multiplexor request psm 0x{:04x} for {}", psm, bd_addr);
                    self.mx_access_request(&bd_addr, is_originator, security_required, callback);
                }
                PendingRequest::Encryption {
                    bd_addr,
                    transport,
                    sec_act,
                    callback,
                } => {
                    debug!("Resubmitting encryption request for {}", bd_addr);
                    self.set_encryption(&bd_addr, transport, callback, sec_act);
                }
            }
        }
    }

    /// Deliver the stored callback of a device, then resubmit parked work
    pub(crate) fn dev_rec_cback_event(&mut self, bd_addr: &BdAddr, status: SecStatus, transport: Transport) {
        debug!("Security callback for {} on {}: {}", bd_addr, transport, status);

        let callback = self.devices.find_mut(bd_addr).and_then(|rec| rec.callback.take());
        if let Some(mut callback) = callback {
            callback(self, *bd_addr, transport, status);
        }

        self.check_pending_reqs();
    }

    fn identity_of(&self, bd_addr: &BdAddr) -> (BdAddr, DeviceClass, String) {
        match self.devices.find(bd_addr) {
            Some(rec) => rec.identity(),
            None => (*bd_addr, DeviceClass::EMPTY, String::new()),
        }
    }

    /// Report a pairing result to the application
    pub(crate) fn notify_bonding_change(&mut self, bd_addr: &BdAddr, status: u8) {
        let (bd_addr, dev_class, name) = self.identity_of(bd_addr);
        if let Some(callbacks) = self.callbacks.as_mut() {
            callbacks.auth_complete(&bd_addr, dev_class, &name, status);
        }
    }

    pub(crate) fn notify_bond_cancel_complete(&mut self, status: SecStatus) {
        if let Some(callbacks) = self.callbacks.as_mut() {
            callbacks.bond_cancel_complete(status);
        }
    }

    /// Ask the application for a PIN.
    ///
    /// Returns false when no application is registered.
    pub(crate) fn request_pin(&mut self, bd_addr: &BdAddr, min_16_digit: bool) -> bool {
        let (bd_addr, dev_class, name) = self.identity_of(bd_addr);
        match self.callbacks.as_mut() {
            Some(callbacks) => {
                callbacks.pin_request(&bd_addr, dev_class, &name, min_16_digit);
                true
            }
            None => false,
        }
    }

    /// Hand the device's link key to the application for storage
    pub(crate) fn send_link_key_notif(&mut self, bd_addr: &BdAddr) {
        let Some(rec) = self.devices.find(bd_addr) else {
            return;
        };
        let (bd_addr, dev_class, name) = rec.identity();
        let (link_key, key_type) = (rec.link_key, rec.link_key_type);

        if let Some(callbacks) = self.callbacks.as_mut() {
            callbacks.link_key(&bd_addr, dev_class, &name, &link_key, key_type, false);
        }
    }

    /// Pass a simple pairing event to the application.
    ///
    /// Returns `None` when no application is registered.
    pub(crate) fn sp_callback(&mut self, event: &mut SpEvent) -> Option<SecStatus> {
        self.callbacks.as_mut().map(|callbacks| callbacks.simple_pairing(event))
    }
}
