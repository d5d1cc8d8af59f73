//! HCI event intake
//!
//! Raw events are decoded into [`SecurityEvent`]s and routed to the handler
//! for each one. The handlers are public so a host that already decodes
//! events can call them directly.

use super::constants::*;
use super::manager::SecurityManager;
use super::platform::TimerId;
use super::service::ServiceRegistration;
use super::types::*;
use crate::error::SecResult;
use crate::gap::{BdAddr, DeviceClass, DeviceType, Role, Transport};
use crate::hci::constants::*;
use crate::hci::{HciCommand, HciEvent, SecurityEvent, LINK_KEY_LEN};
use crate::l2cap::PSM_RFCOMM;
use log::{debug, error, info, trace, warn};
use std::time::Duration;

/// Statuses that mean the peer could not be reached in time
fn is_timeout_status(status: u8) -> bool {
    matches!(
        status,
        HCI_ERR_CONNECTION_TOUT | HCI_ERR_LMP_RESPONSE_TIMEOUT | HCI_ERR_UNSPECIFIED | HCI_ERR_PAGE_TIMEOUT
    )
}

/// Failures caused by the stored key, the peer may have lost it
fn is_key_failure_status(status: u8) -> bool {
    matches!(
        status,
        HCI_ERR_AUTH_FAILURE
            | HCI_ERR_KEY_MISSING
            | HCI_ERR_HOST_REJECT_SECURITY
            | HCI_ERR_PAIRING_NOT_ALLOWED
            | HCI_ERR_UNIT_KEY_USED
            | HCI_ERR_PAIRING_WITH_UNIT_KEY_NOT_SUPPORTED
            | HCI_ERR_ENCRY_MODE_NOT_ACCEPTABLE
            | HCI_ERR_REPEATED_ATTEMPTS
    )
}

fn is_collision_status(status: u8) -> bool {
    status == HCI_ERR_LMP_ERR_TRANS_COLLISION || status == HCI_ERR_DIFF_TRANSACTION_COLLISION
}

impl SecurityManager {
    /// Process an HCI event from the controller.
    ///
    /// Events the security manager has no interest in are rejected with
    /// `HciError::UnexpectedEvent`.
    pub fn handle_hci_event(&mut self, event: &HciEvent) -> SecResult<()> {
        let event = SecurityEvent::decode(event)?;
        trace!("Security event {:?}", event);
        self.dispatch_event(event);
        Ok(())
    }

    /// Route a decoded event to its handler
    pub fn dispatch_event(&mut self, event: SecurityEvent) {
        match event {
            SecurityEvent::ConnectionComplete {
                status,
                handle,
                bd_addr,
                link_type,
                encryption_enabled,
            } => {
                if link_type == HCI_LINK_TYPE_ACL {
                    self.on_connection_complete(&bd_addr, handle, status, encryption_enabled != 0);
                }
            }
            SecurityEvent::ConnectionRequest {
                bd_addr,
                dev_class,
                link_type,
            } => {
                if link_type == HCI_LINK_TYPE_ACL {
                    self.on_connection_request(&bd_addr, dev_class);
                }
            }
            SecurityEvent::DisconnectionComplete { status, handle, reason } => {
                if status == HCI_SUCCESS {
                    self.on_disconnection_complete(handle, reason);
                }
            }
            SecurityEvent::AuthenticationComplete { status, handle } => {
                self.on_authentication_complete(handle, status);
            }
            SecurityEvent::RemoteNameRequestComplete { status, bd_addr, name } => {
                self.on_remote_name_complete(Some(&bd_addr), &name, status);
            }
            SecurityEvent::EncryptionChange { status, handle, enabled } => {
                self.on_encryption_change(handle, status, enabled != 0);
            }
            SecurityEvent::RoleChange { status, bd_addr, role } => {
                self.on_role_changed(status, &bd_addr, role);
            }
            SecurityEvent::PinCodeRequest { bd_addr } => self.on_pin_code_request(&bd_addr),
            SecurityEvent::LinkKeyRequest { bd_addr } => self.on_link_key_request(&bd_addr),
            SecurityEvent::LinkKeyNotification {
                bd_addr,
                link_key,
                key_type,
            } => self.on_link_key_notification(&bd_addr, &link_key, key_type),
            SecurityEvent::IoCapabilityRequest { bd_addr } => self.on_io_capability_request(&bd_addr),
            SecurityEvent::IoCapabilityResponse {
                bd_addr,
                io_cap,
                oob_data,
                auth_req,
            } => self.on_io_capability_response(&bd_addr, io_cap, oob_data, auth_req),
            SecurityEvent::UserConfirmationRequest { bd_addr, numeric_value } => {
                self.on_user_confirmation_request(&bd_addr, numeric_value)
            }
            SecurityEvent::UserPasskeyRequest { bd_addr } => self.on_user_passkey_request(&bd_addr),
            SecurityEvent::UserPasskeyNotification { bd_addr, passkey } => {
                self.on_user_passkey_notification(&bd_addr, passkey)
            }
            SecurityEvent::RemoteOobDataRequest { bd_addr } => self.on_remote_oob_request(&bd_addr),
            SecurityEvent::SimplePairingComplete { status, bd_addr } => {
                self.on_simple_pairing_complete(status, &bd_addr)
            }
            SecurityEvent::RemoteHostSupportedFeatures { bd_addr, features } => {
                self.on_remote_host_supported_features(&bd_addr, &features)
            }
            SecurityEvent::LocalOobDataComplete { status, c, r } => {
                self.on_read_local_oob_complete(status, c, r)
            }
            SecurityEvent::CreateConnectionCancelComplete { status, bd_addr } => {
                self.on_create_connection_cancel_complete(status, &bd_addr)
            }
        }
    }

    /// Prepare for a controller reset
    pub fn dev_reset(&mut self) {
        if self.platform.controller.supports_simple_pairing() {
            // RFCOMM itself needs no security, its channels are checked one by one
            for is_originator in [true, false] {
                let registration = ServiceRegistration {
                    is_originator,
                    name: "RFC_MUX",
                    service_id: SEC_SERVICE_RFC_MUX,
                    sec_level: SEC_NONE,
                    psm: PSM_RFCOMM,
                    mx_proto_id: PROTO_RFCOMM,
                    mx_chan_id: 0,
                };
                if let Err(err) = self.set_security_level(&registration) {
                    warn!("Cannot register RFCOMM multiplexor: {}", err);
                }
            }
        } else {
            self.config.security_mode = SecurityMode::Service;
        }

        debug!("Security mode {:?}", self.config.security_mode);
    }

    /// Incoming ACL connection request
    pub fn on_connection_request(&mut self, bd_addr: &BdAddr, dev_class: DeviceClass) -> ConnRequestDecision {
        if !self.platform.controller.is_ready() {
            error!("Controller is not ready, rejecting {}", bd_addr);
            self.send(HciCommand::RejectConnectionRequest {
                bd_addr: *bd_addr,
                reason: HCI_ERR_HOST_REJECT_DEVICE,
            });
            return ConnRequestDecision::Reject(HCI_ERR_HOST_REJECT_DEVICE);
        }

        if self.is_pairing_with(bd_addr) && self.pairing.flags.contains(PairingFlags::WE_STARTED_DD) {
            // We are paging the same peer for bonding, let our link win
            info!("Rejecting connection from {} while bonding with it", bd_addr);
            self.pairing.flags |= PairingFlags::REJECTED_CONNECT;
            self.send(HciCommand::RejectConnectionRequest {
                bd_addr: *bd_addr,
                reason: HCI_ERR_HOST_REJECT_DEVICE,
            });
            return ConnRequestDecision::Reject(HCI_ERR_HOST_REJECT_DEVICE);
        }

        self.connecting_bda = *bd_addr;
        self.connecting_dc = dev_class;

        let rec = self.devices.find_or_alloc(bd_addr);
        rec.sm4 |= Sm4::CONN_PEND;
        ConnRequestDecision::Accept
    }

    /// ACL Connection Complete
    pub fn on_connection_complete(&mut self, bd_addr: &BdAddr, handle: u16, status: u8, encryption_enabled: bool) {
        debug!(
            "Connection complete {} handle 0x{:04x} status 0x{:02x} ({})",
            bd_addr,
            handle,
            status,
            hci_status_text(status)
        );

        if self.devices.find(bd_addr).is_none() {
            if status == HCI_SUCCESS {
                self.devices.find_or_alloc(bd_addr);
            } else {
                if self.is_pairing_with(bd_addr) {
                    self.change_pairing_state(PairingState::Idle);
                }
                return;
            }
        } else {
            self.devices.touch(bd_addr);
            let dedicated_bonding =
                self.is_pairing_with(bd_addr) && self.pairing.flags.contains(PairingFlags::WE_STARTED_DD);
            let conn_pend = self
                .devices
                .find(bd_addr)
                .map(|rec| rec.sm4.contains(Sm4::CONN_PEND))
                .unwrap_or(false);

            if conn_pend && dedicated_bonding {
                let name_known = self.devices.find_mut(bd_addr).map(|rec| {
                    rec.sm4.remove(Sm4::CONN_PEND);
                    rec.is_name_known()
                });

                if status != HCI_SUCCESS && self.pairing.state == PairingState::WaitPinReq {
                    // The peer's link went away, page it ourselves
                    if name_known == Some(true) {
                        self.collided_dev = Some(*bd_addr);
                        self.schedule(
                            TimerId::ConnectAfterReject,
                            Duration::from_millis(SEC_CONNECT_AFTER_REJECT_MS),
                        );
                    } else {
                        self.change_pairing_state(PairingState::GetRemName);
                        if !self.platform.controller.is_ready() {
                            self.change_pairing_state(PairingState::Idle);
                        } else {
                            self.send(HciCommand::RemoteNameRequest { bd_addr: *bd_addr });
                        }
                    }
                    return;
                }

                self.platform.acl.set_bonding(bd_addr, true);
            }
        }

        if let Some(rec) = self.devices.find_mut(bd_addr) {
            rec.device_type |= DeviceType::BREDR;
        }

        let mut is_pairing_device = false;
        if self.is_pairing_with(bd_addr) {
            if status == HCI_ERR_HOST_REJECT_DEVICE
                && self.pairing.flags.contains(PairingFlags::REJECTED_CONNECT)
            {
                // Our rejection of the peer's link; retry ours
                self.pairing.flags.remove(PairingFlags::REJECTED_CONNECT);
                let sm4_unknown = self
                    .devices
                    .find(bd_addr)
                    .map(|rec| rec.sm4.is_unknown())
                    .unwrap_or(true);

                if sm4_unknown {
                    self.change_pairing_state(PairingState::GetRemName);
                    self.send(HciCommand::RemoteNameRequest { bd_addr: *bd_addr });
                    return;
                }

                if self.pairing.state != PairingState::WaitLocalPin {
                    self.collided_dev = Some(*bd_addr);
                    self.schedule(
                        TimerId::ConnectAfterReject,
                        Duration::from_millis(SEC_CONNECT_AFTER_REJECT_MS),
                    );
                }
                return;
            } else if status == HCI_ERR_CONNECTION_EXISTS {
                return;
            }
            is_pairing_device = true;
        }

        self.restore_mode();

        if status != HCI_SUCCESS {
            if is_pairing_device {
                if let Some(rec) = self.devices.find_mut(bd_addr) {
                    rec.security_required &= !SEC_OUT_AUTHENTICATE;
                    rec.sec_flags
                        .remove(SecFlags::LINK_KEY_KNOWN | SecFlags::LINK_KEY_AUTHED);
                }
                self.change_pairing_state(PairingState::Idle);
                self.notify_bonding_change(bd_addr, status);
            } else {
                let legacy_key_failure = self
                    .devices
                    .find(bd_addr)
                    .map(|rec| rec.link_key_type.is_legacy() && is_key_failure_status(status))
                    .unwrap_or(false);
                if legacy_key_failure {
                    // The stored legacy key is no longer accepted
                    if let Some(rec) = self.devices.find_mut(bd_addr) {
                        rec.security_required &= !SEC_OUT_AUTHENTICATE;
                        rec.sec_flags.remove(SecFlags::LINK_KEY_KNOWN);
                    }
                    self.notify_bonding_change(bd_addr, status);
                }
            }

            if self.devices.find(bd_addr).is_none() {
                return;
            }
            let result = if is_timeout_status(status) {
                SecStatus::DeviceTimeout
            } else {
                SecStatus::ErrProcessing
            };
            self.dev_rec_cback_event(bd_addr, result, Transport::BrEdr);
            return;
        }

        let link_key_known = self
            .devices
            .find(bd_addr)
            .map(|rec| rec.is_link_key_known())
            .unwrap_or(false);
        if is_pairing_device && link_key_known {
            let send_key = self.devices.find_mut(bd_addr).map(|rec| {
                rec.security_required &= !SEC_OUT_AUTHENTICATE;
                std::mem::take(&mut rec.link_key_not_sent)
            });
            if send_key == Some(true) {
                self.send_link_key_notif(bd_addr);
            }

            let we_started_dd = self.pairing.flags.contains(PairingFlags::WE_STARTED_DD);
            self.change_pairing_state(PairingState::Idle);
            if we_started_dd {
                self.platform.acl.set_bonding(bd_addr, true);
            }
        }

        let Some(rec) = self.devices.find_mut(bd_addr) else {
            return;
        };
        rec.hci_handle = handle;
        rec.sec_flags
            .remove(SecFlags::AUTHENTICATED | SecFlags::ENCRYPTED | SecFlags::ROLE_SWITCHED);
        if encryption_enabled {
            rec.sec_flags |= SecFlags::AUTHENTICATED | SecFlags::ENCRYPTED;
        }
        if rec.pin_code_length >= 16 || rec.link_key_type.is_authenticated() {
            rec.sec_flags |= SecFlags::PIN_16_DIGIT_AUTHED;
        }

        // Peer initiated links wait for the first access request
        if !rec.is_name_known() || rec.is_originator {
            let rc = self.execute_procedure(bd_addr);
            if rc != SecStatus::CmdStarted {
                self.dev_rec_cback_event(bd_addr, rc, Transport::BrEdr);
            }
        }
    }

    /// Disconnect a link, deferring while dedicated bonding runs on it
    pub fn disconnect(&mut self, handle: u16, reason: u8) -> SecStatus {
        let Some(bd_addr) = self.devices.find_by_handle(handle).map(|rec| rec.bd_addr) else {
            self.platform.acl.disconnect(handle, reason);
            return SecStatus::Success;
        };

        if self.is_pairing_with(&bd_addr) && self.pairing.flags.contains(PairingFlags::WE_STARTED_DD) {
            // Dropped once the bonding finishes
            self.pairing.flags |= PairingFlags::DISC_WHEN_DONE;
            return SecStatus::Busy;
        }

        self.send_hci_disconnect(&bd_addr, reason, handle)
    }

    /// Move the record to a disconnecting state and drop the link
    pub(crate) fn send_hci_disconnect(&mut self, bd_addr: &BdAddr, reason: u8, handle: u16) -> SecStatus {
        if let Some(rec) = self.devices.find_mut(bd_addr) {
            let bredr = handle == rec.hci_handle;
            match rec.sec_state {
                SecState::Disconnecting if bredr => return SecStatus::CmdStarted,
                SecState::Disconnecting => rec.sec_state = SecState::DisconnectingBoth,
                SecState::DisconnectingLe if handle == rec.ble_hci_handle => {
                    return SecStatus::CmdStarted
                }
                SecState::DisconnectingLe => rec.sec_state = SecState::DisconnectingBoth,
                SecState::DisconnectingBoth => return SecStatus::CmdStarted,
                _ if bredr => rec.sec_state = SecState::Disconnecting,
                _ => rec.sec_state = SecState::DisconnectingLe,
            }
        }

        debug!("Disconnecting handle 0x{:04x} reason 0x{:02x}", handle, reason);
        self.platform.acl.disconnect(handle, reason);
        SecStatus::CmdStarted
    }

    /// ACL Disconnection Complete
    pub fn on_disconnection_complete(&mut self, handle: u16, reason: u8) {
        if !matches!(
            reason,
            HCI_ERR_CONN_CAUSE_LOCAL_HOST
                | HCI_ERR_PEER_USER
                | HCI_ERR_REMOTE_POWER_OFF
                | HCI_ERR_CONNECTION_TOUT
                | HCI_ERR_LMP_RESPONSE_TIMEOUT
        ) {
            warn!(
                "Uncommon disconnection reason 0x{:02x} ({}) for handle 0x{:04x}",
                reason,
                hci_status_text(reason),
                handle
            );
        }

        let Some(rec) = self.devices.find_by_handle_mut(handle) else {
            return;
        };
        let bd_addr = rec.bd_addr;
        let transport = if rec.hci_handle == handle {
            Transport::BrEdr
        } else {
            Transport::Le
        };

        // Only the simple pairing support bits survive the link
        rec.sm4 &= Sm4::TRUE;

        if self.is_pairing_with(&bd_addr) {
            let old_flags = self.pairing.flags;
            self.change_pairing_state(PairingState::Idle);

            if let Some(rec) = self.devices.find_mut(&bd_addr) {
                rec.sec_flags.remove(SecFlags::LINK_KEY_KNOWN);
            }

            let status = if reason == HCI_ERR_REPEATED_ATTEMPTS {
                HCI_ERR_REPEATED_ATTEMPTS
            } else if old_flags.contains(PairingFlags::WE_STARTED_DD) {
                HCI_ERR_HOST_REJECT_SECURITY
            } else {
                HCI_ERR_AUTH_FAILURE
            };
            self.notify_bonding_change(&bd_addr, status);
        }

        let Some(rec) = self.devices.find_mut(&bd_addr) else {
            return;
        };

        match transport {
            Transport::Le => {
                rec.ble_hci_handle = HCI_INVALID_HANDLE;
                rec.ble_sec_flags
                    .remove(SecFlags::AUTHENTICATED | SecFlags::ENCRYPTED | SecFlags::ROLE_SWITCHED);
                rec.enc_key_size = 0;
                if !rec.ble_sec_flags.contains(SecFlags::LINK_KEY_KNOWN) {
                    rec.ble_sec_flags
                        .remove(SecFlags::LINK_KEY_AUTHED | SecFlags::AUTHENTICATED);
                }
            }
            Transport::BrEdr => {
                rec.hci_handle = HCI_INVALID_HANDLE;
                rec.sec_flags.remove(
                    SecFlags::AUTHENTICATED
                        | SecFlags::ENCRYPTED
                        | SecFlags::ROLE_SWITCHED
                        | SecFlags::PIN_16_DIGIT_AUTHED,
                );
                if rec.is_bond_type_temporary() {
                    debug!("Removing temporary link key of {}", bd_addr);
                    rec.sec_flags.remove(SecFlags::LINK_KEY_KNOWN);
                }
            }
        }

        if rec.sec_state == SecState::DisconnectingBoth {
            // The other transport is still on its way down
            rec.sec_state = match transport {
                Transport::Le => SecState::Disconnecting,
                Transport::BrEdr => SecState::DisconnectingLe,
            };
            return;
        }

        rec.sec_state = SecState::Idle;
        rec.security_required = SEC_NONE;

        let callback = rec.callback.take();
        if let Some(mut callback) = callback {
            debug!("Failing pending request of {} on disconnect", bd_addr);
            callback(self, bd_addr, transport, SecStatus::ErrProcessing);
        }
    }

    /// Command Complete for Create Connection Cancel
    pub fn on_create_connection_cancel_complete(&mut self, status: u8, bd_addr: &BdAddr) {
        debug!("Create connection cancel complete {} status 0x{:02x}", bd_addr, status);
        if status == HCI_SUCCESS {
            self.bond_cancel_complete();
        } else {
            self.notify_bond_cancel_complete(SecStatus::ErrProcessing);
        }
    }

    /// Retry once when an SSP peer lost the key we still hold
    fn auth_retry(&mut self, handle: u16, status: u8) -> bool {
        let pairing_idle = self.pairing.state == PairingState::Idle;
        let Some(rec) = self.devices.find_by_handle_mut(handle) else {
            return false;
        };

        let old_sm4 = rec.sm4;
        rec.sm4.remove(Sm4::RETRY);

        if !pairing_idle || old_sm4.contains(Sm4::RETRY) || status != HCI_ERR_KEY_MISSING || !rec.sm4.is_ssp() {
            return false;
        }

        rec.sm4 |= Sm4::RETRY;
        rec.sec_flags.remove(SecFlags::LINK_KEY_KNOWN);
        rec.sec_state = SecState::Idle;
        let bd_addr = rec.bd_addr;
        debug!("Retrying authentication of {} after missing key, sm4 {:?}", bd_addr, rec.sm4);

        self.collision_start_time = 0;
        self.restore_mode();
        self.execute_procedure(&bd_addr);
        true
    }

    /// Authentication Complete
    pub fn on_authentication_complete(&mut self, handle: u16, status: u8) {
        let old_state = self.pairing.state;
        debug!(
            "Authentication complete handle 0x{:04x} status 0x{:02x} ({}) pairing state {}",
            handle,
            status,
            hci_status_text(status),
            old_state
        );

        if is_collision_status(status) {
            self.auth_collision(handle);
            return;
        }
        if self.auth_retry(handle, status) {
            return;
        }

        self.collision_start_time = 0;
        self.restore_mode();

        let Some(bd_addr) = self.devices.find_by_handle(handle).map(|rec| rec.bd_addr) else {
            return;
        };

        let flags = self.pairing.flags;
        if flags.contains(PairingFlags::WE_STARTED_DD) && !flags.contains(PairingFlags::DISC_WHEN_DONE) {
            // Authentication of a link that was already up ends the bonding
            if let Some(rec) = self.devices.find_mut(&bd_addr) {
                rec.security_required &= !SEC_OUT_AUTHENTICATE;
            }
            self.platform.acl.start_post_bond_timer(handle);
        }

        let mut status = status;
        let mut was_authenticating = false;
        if let Some(rec) = self.devices.find_mut(&bd_addr) {
            if rec.sec_state == SecState::Authenticating {
                rec.sec_state = SecState::Idle;
                was_authenticating = true;

                // The peer encrypted first, authentication is then disallowed
                if status == HCI_ERR_COMMAND_DISALLOWED && rec.is_authenticated() && rec.is_encrypted() {
                    status = HCI_SUCCESS;
                }
                if status == HCI_SUCCESS {
                    rec.sec_flags |= SecFlags::AUTHENTICATED;
                }
            }
        }

        let mut are_bonding = false;
        if self.is_pairing_with(&bd_addr) {
            are_bonding = flags.contains(PairingFlags::WE_STARTED_DD);
            self.change_pairing_state(PairingState::Idle);
        }

        if !was_authenticating {
            if status != HCI_SUCCESS && old_state != PairingState::Idle {
                self.notify_bonding_change(&bd_addr, status);
            }
            return;
        }

        if old_state != PairingState::Idle || status != HCI_SUCCESS {
            self.notify_bonding_change(&bd_addr, status);
        }

        if are_bonding {
            if let Some(rec) = self.devices.find_mut(&bd_addr) {
                rec.security_required &= !SEC_OUT_AUTHENTICATE;
            }

            if status != HCI_SUCCESS {
                if status != HCI_ERR_PEER_USER && status != HCI_ERR_CONN_CAUSE_LOCAL_HOST {
                    self.send_hci_disconnect(&bd_addr, HCI_ERR_PEER_USER, handle);
                }
                return;
            }

            info!("Bonding with {} completed", bd_addr);
            let locally_initiated = self
                .devices
                .find(&bd_addr)
                .map(|rec| rec.is_originator)
                .unwrap_or(false);
            match self.platform.acl.role(&bd_addr) {
                Some(Role::Central) => {
                    self.set_encryption(&bd_addr, Transport::BrEdr, None, LeSecAction::None);
                }
                _ if locally_initiated => {
                    // Encryption follows the role change
                    info!("Authenticated as peripheral, switching role to encrypt");
                    self.send(HciCommand::SwitchRole {
                        bd_addr,
                        role: HCI_ROLE_CENTRAL,
                    });
                }
                _ => {}
            }
            self.platform.acl.start_post_bond_timer(handle);
            return;
        }

        if status != HCI_SUCCESS {
            self.dev_rec_cback_event(&bd_addr, SecStatus::ErrProcessing, Transport::BrEdr);
            if self.pairing.flags.contains(PairingFlags::DISC_WHEN_DONE) {
                self.send_hci_disconnect(&bd_addr, HCI_ERR_AUTH_FAILURE, handle);
            }
            return;
        }

        if let Some(rec) = self.devices.find_mut(&bd_addr) {
            if rec.pin_code_length >= 16 || rec.link_key_type.is_authenticated() {
                rec.sec_flags |= SecFlags::PIN_16_DIGIT_AUTHED;
            }
        }

        let rc = self.execute_procedure(&bd_addr);
        if rc != SecStatus::CmdStarted {
            self.dev_rec_cback_event(&bd_addr, rc, Transport::BrEdr);
        }
    }

    /// Encryption Change
    pub fn on_encryption_change(&mut self, handle: u16, status: u8, enabled: bool) {
        if is_collision_status(status) {
            debug!("Encryption collision on handle 0x{:04x}", handle);
            self.auth_collision(handle);
            return;
        }
        self.collision_start_time = 0;

        let Some(rec) = self.devices.find_by_handle_mut(handle) else {
            warn!("Encryption change for unknown handle 0x{:04x}", handle);
            return;
        };
        let bd_addr = rec.bd_addr;
        let transport = if rec.ble_hci_handle == handle {
            Transport::Le
        } else {
            Transport::BrEdr
        };

        debug!(
            "Encryption change {} status 0x{:02x} ({}) enabled {} state {} sec_flags {:?}",
            bd_addr,
            status,
            hci_status_text(status),
            enabled,
            rec.sec_state,
            rec.sec_flags
        );

        if status == HCI_SUCCESS {
            match (transport, enabled) {
                (Transport::BrEdr, true) => {
                    if rec.is_authenticated() && rec.is_encrypted() {
                        debug!("Link is authenticated and encrypted, ignoring");
                        return;
                    }
                    rec.sec_flags |= SecFlags::AUTHENTICATED | SecFlags::ENCRYPTED;
                    if rec.pin_code_length >= 16 || rec.link_key_type.is_authenticated() {
                        rec.sec_flags |= SecFlags::PIN_16_DIGIT_AUTHED;
                    }
                }
                (Transport::Le, true) => rec.ble_sec_flags |= SecFlags::ENCRYPTED,
                // Possibly decrypted for a role switch, security runs again next time
                (transport, false) => rec.flags_mut(transport).remove(SecFlags::ENCRYPTED),
            }
        }

        self.check_pending_enc_req(&bd_addr, transport, enabled);

        let Some(rec) = self.devices.find_mut(&bd_addr) else {
            return;
        };

        if transport == Transport::Le {
            if matches!(
                status,
                HCI_ERR_KEY_MISSING | HCI_ERR_AUTH_FAILURE | HCI_ERR_ENCRY_MODE_NOT_ACCEPTABLE
            ) {
                rec.ble_sec_flags.remove(SecFlags::LINK_KEY_KNOWN);
            }
            return;
        }

        rec.enc_key_size = MAX_ENC_KEY_SIZE;

        if status == HCI_SUCCESS && enabled && rec.new_encryption_key_is_p256 {
            // A temporary key is not worth deriving an LE key from
            let derive_ltk = !(rec.rmt_auth_req == AUTH_SP_NO && self.loc_auth_req == AUTH_SP_NO);
            let le_key_weaker = !rec.ble_sec_flags.contains(SecFlags::LINK_KEY_KNOWN)
                || (!rec.ble_sec_flags.contains(SecFlags::LINK_KEY_AUTHED) && rec.is_link_key_authed());

            if derive_ltk
                && le_key_weaker
                && self.platform.acl.peer_supports_smp_over_br(&bd_addr)
                && self.platform.acl.role(&bd_addr) == Some(Role::Central)
            {
                debug!("Deriving LE keys from the link key of {}", bd_addr);
                if let Some(rec) = self.devices.find_mut(&bd_addr) {
                    rec.new_encryption_key_is_p256 = false;
                }
                self.platform.acl.start_smp_over_br(&bd_addr);
            }
        }

        let Some(rec) = self.devices.find_mut(&bd_addr) else {
            return;
        };

        // Encryption started by the peer
        if rec.sec_state != SecState::Encrypting {
            if rec.sec_state == SecState::DelayForEnc {
                debug!("Peer secured {}, resubmitting parked requests", bd_addr);
                rec.sec_state = SecState::Idle;
                rec.callback = None;
                self.platform.acl.resubmit_pending_sec_requests(Some(&bd_addr));
                return;
            }
            if !self.config.concurrent_peer_auth && rec.sec_state == SecState::Authenticating {
                rec.sec_state = SecState::Idle;
                return;
            }
            if !self.config.handle_unexpected_encryption_change {
                return;
            }
        }

        rec.sec_state = SecState::Idle;

        if status != HCI_SUCCESS {
            self.dev_rec_cback_event(&bd_addr, SecStatus::ErrProcessing, Transport::BrEdr);
            return;
        }

        let rc = self.execute_procedure(&bd_addr);
        if rc != SecStatus::CmdStarted {
            self.dev_rec_cback_event(&bd_addr, rc, Transport::BrEdr);
        }
    }

    /// Role Change
    pub fn on_role_changed(&mut self, status: u8, bd_addr: &BdAddr, role: u8) {
        if status != HCI_SUCCESS || role != HCI_ROLE_CENTRAL {
            return;
        }

        let needs_encryption = self
            .devices
            .find(bd_addr)
            .map(|rec| rec.is_authenticated() && !rec.is_encrypted())
            .unwrap_or(false);
        if needs_encryption {
            debug!("Central on {} now, starting encryption", bd_addr);
            self.set_encryption(bd_addr, Transport::BrEdr, None, LeSecAction::None);
        }
    }

    /// Link Key Notification
    pub fn on_link_key_notification(&mut self, bd_addr: &BdAddr, link_key: &[u8; LINK_KEY_LEN], key_type: u8) {
        let (ltk_derived, key_type) = if (LTK_DERIVED_LKEY_OFFSET
            ..=LTK_DERIVED_LKEY_OFFSET + LKEY_TYPE_AUTH_COMB_P_256)
            .contains(&key_type)
        {
            (true, key_type - LTK_DERIVED_LKEY_OFFSET)
        } else {
            (false, key_type)
        };
        let Some(key_type) = LinkKeyType::from_u8(key_type) else {
            warn!("Unknown link key type 0x{:02x} from {}", key_type, bd_addr);
            return;
        };
        debug!("Link key notification {} type {:?} derived {}", bd_addr, key_type, ltk_derived);

        self.devices.find_or_alloc(bd_addr);
        self.restore_mode();

        let Some(rec) = self.devices.find_mut(bd_addr) else {
            return;
        };

        if key_type != LinkKeyType::ChangedCombination {
            rec.link_key_type = key_type;
        }
        rec.sec_flags |= SecFlags::LINK_KEY_KNOWN;
        if rec.pin_code_length >= 16 || key_type.is_authenticated() {
            rec.sec_flags |= SecFlags::LINK_KEY_AUTHED | SecFlags::PIN_16_DIGIT_AUTHED;
        }
        rec.enc_key_size = MAX_ENC_KEY_SIZE;
        rec.link_key = *link_key;

        if ltk_derived {
            let (bd_addr, dev_class, name) = rec.identity();
            if let Some(callbacks) = self.callbacks.as_mut() {
                callbacks.link_key(&bd_addr, dev_class, &name, link_key, key_type, true);
            }
        } else if key_type.is_p256() {
            rec.new_encryption_key_is_p256 = true;
        }

        let Some(rec) = self.devices.find(bd_addr) else {
            return;
        };
        if rec.bond_type == BondType::Persistent && rec.device_type.contains(DeviceType::BREDR) {
            let supports_sc = rec.remote_supports_secure_connections;
            self.platform
                .properties
                .set_remote_supports_secure_connections(bd_addr, supports_sc);
        }

        let mut we_are_bonding = false;
        if self.is_pairing_with(bd_addr) {
            if self.pairing.flags.contains(PairingFlags::WE_STARTED_DD) {
                we_are_bonding = true;
            } else {
                self.change_pairing_state(PairingState::Idle);
            }
        }

        let Some(rec) = self.devices.find_mut(bd_addr) else {
            return;
        };

        if ltk_derived {
            return;
        }

        // Store the key once the name is known, unless the peer is a HID device
        if !rec.is_name_known() && !rec.dev_class.is_peripheral() {
            debug!("Holding link key of {} until its name is known", bd_addr);
            rec.link_key_not_sent = true;
            if we_are_bonding {
                self.send(HciCommand::RemoteNameRequest { bd_addr: *bd_addr });
            }
            return;
        }

        self.send_link_key_notif(bd_addr);
    }

    /// Link Key Request
    pub fn on_link_key_request(&mut self, bd_addr: &BdAddr) {
        debug!("Link key request {} pairing state {}", bd_addr, self.pairing.state);

        let concurrent_peer_auth = self.config.concurrent_peer_auth;
        let rec = self.devices.find_or_alloc(bd_addr);
        if !concurrent_peer_auth {
            rec.sec_state = SecState::Authenticating;
        }

        if self.pairing.state == PairingState::WaitPinReq
            && self.collision_start_time != 0
            && self.collided_dev == Some(*bd_addr)
        {
            debug!("Collision with {}, forcing a new key", bd_addr);
            self.send(HciCommand::LinkKeyRequestNegReply { bd_addr: *bd_addr });
            return;
        }

        if rec.is_link_key_known() {
            let link_key = rec.link_key;
            self.send(HciCommand::LinkKeyRequestReply {
                bd_addr: *bd_addr,
                link_key,
            });
            return;
        }

        // No key, the PIN exchange will take a while
        self.platform.acl.pin_code_request(bd_addr);
        self.send(HciCommand::LinkKeyRequestNegReply { bd_addr: *bd_addr });
    }

    /// PIN Code Request
    pub fn on_pin_code_request(&mut self, bd_addr: &BdAddr) {
        debug!(
            "PIN code request {} state {} flags {:?}",
            bd_addr, self.pairing.state, self.pairing.flags
        );

        self.platform.acl.pin_code_request(bd_addr);

        if self.pairing.state != PairingState::Idle {
            let same_peer = *bd_addr == self.pairing.bd_addr;
            if (same_peer && self.pairing.state == PairingState::WaitAuthComplete)
                || self.pairing.state != PairingState::WaitPinReq
                || !same_peer
            {
                warn!("PIN request from {} in state {}, rejecting", bd_addr, self.pairing.state);
                self.send(HciCommand::PinCodeRequestNegReply { bd_addr: *bd_addr });
                return;
            }
        }

        let rec = self.devices.find_or_alloc(bd_addr);
        rec.sm4 = Sm4::KNOWN;
        let is_originator = rec.is_originator;

        if self.pairing.state == PairingState::Idle {
            self.pairing.bd_addr = *bd_addr;
            self.pairing.flags = PairingFlags::PEER_STARTED_DD;
        }

        if !self.config.pairing_disabled && self.config.pin_type == PinType::Fixed {
            debug!("Replying with the fixed PIN");
            let pin = self.config.fixed_pin().to_vec();
            self.change_pairing_state(PairingState::WaitAuthComplete);
            self.send(HciCommand::PinCodeRequestReply { bd_addr: *bd_addr, pin });
            return;
        }

        let connecting_dc = self.connecting_dc;
        let dev_class = match self.devices.find_mut(bd_addr) {
            Some(rec) => {
                if *bd_addr == self.connecting_bda && !connecting_dc.is_empty() {
                    rec.dev_class = connecting_dc;
                }
                rec.dev_class
            }
            None => return,
        };

        if !self.pairing.pin_code.is_empty() {
            // PIN supplied with the bonding request
            let pin = std::mem::take(&mut self.pairing.pin_code);
            self.change_pairing_state(PairingState::WaitAuthComplete);
            self.send(HciCommand::PinCodeRequestReply { bd_addr: *bd_addr, pin });
            return;
        }

        if self.config.pairing_disabled
            || self.callbacks.is_none()
            || (!is_originator && dev_class.is_keyboard())
        {
            warn!("Pairing with {} not possible, rejecting PIN request", bd_addr);
            self.send(HciCommand::PinCodeRequestNegReply { bd_addr: *bd_addr });
            return;
        }

        self.change_pairing_state(PairingState::WaitLocalPin);
        self.connecting_bda = *bd_addr;
        self.connecting_dc = dev_class;

        let (name_known, min_16_digit) = self
            .devices
            .find(bd_addr)
            .map(|rec| {
                (
                    rec.is_name_known(),
                    rec.required_security_flags_for_pairing & SEC_IN_MIN_16_DIGIT_PIN != 0,
                )
            })
            .unwrap_or((false, false));

        if name_known {
            self.pairing.flags |= PairingFlags::PIN_REQD;
            self.request_pin(bd_addr, min_16_digit);
        } else {
            // The PIN is requested once the name arrives
            debug!("Reading the name of {} before asking for a PIN", bd_addr);
            self.send(HciCommand::RemoteNameRequest { bd_addr: *bd_addr });
        }
    }

    /// Remote Name Request Complete.
    ///
    /// `bd_addr` is `None` when the controller did not report the peer, the
    /// record waiting for a name is used then.
    pub fn on_remote_name_complete(&mut self, bd_addr: Option<&BdAddr>, name: &str, status: u8) {
        let found = match bd_addr {
            Some(bd_addr) => self.devices.find(bd_addr).map(|rec| rec.bd_addr),
            None => self.devices.find_first_in_state(SecState::GettingName),
        };
        debug!(
            "Remote name complete {:?} status 0x{:02x} pairing state {}",
            found, status, self.pairing.state
        );

        let old_sec_state = match found.and_then(|addr| self.devices.find_mut(&addr)) {
            Some(rec) => {
                let old_sec_state = rec.sec_state;
                if status == HCI_SUCCESS {
                    rec.name = name.chars().take(MAX_REM_BD_NAME_LEN).collect();
                    rec.sec_flags |= SecFlags::NAME_KNOWN;
                } else {
                    rec.name.clear();
                }
                if rec.sec_state == SecState::GettingName {
                    rec.sec_state = SecState::Idle;
                }
                Some(old_sec_state)
            }
            None => None,
        };

        let Some((rec_addr, old_sec_state)) = found.zip(old_sec_state) else {
            let peer = bd_addr.copied().unwrap_or(BdAddr::ANY);
            self.notify_rmt_name_observers(&peer, DeviceClass::EMPTY, "");
            return;
        };

        let (_, dev_class, rec_name) = match self.devices.find(&rec_addr) {
            Some(rec) => rec.identity(),
            None => return,
        };
        self.notify_rmt_name_observers(&rec_addr, dev_class, &rec_name);

        let bd_addr = bd_addr.copied().unwrap_or(rec_addr);

        if self.pairing.state == PairingState::WaitLocalPin && bd_addr == self.pairing.bd_addr {
            if !self.pairing.flags.contains(PairingFlags::PIN_REQD) && self.callbacks.is_some() {
                let min_16_digit = self
                    .devices
                    .find(&rec_addr)
                    .map(|rec| rec.required_security_flags_for_pairing & SEC_IN_MIN_16_DIGIT_PIN != 0)
                    .unwrap_or(false);
                self.pairing.flags |= PairingFlags::PIN_REQD;
                self.request_pin(&rec_addr, min_16_digit);
            }
            // Restart the watchdog for the user
            self.change_pairing_state(PairingState::WaitLocalPin);
            return;
        }

        if self.pairing.state == PairingState::GetRemName {
            self.continue_bonding_after_name(&bd_addr, &rec_addr, status);
            return;
        }

        let Some(rec) = self.devices.find_mut(&rec_addr) else {
            return;
        };

        if rec.link_key_not_sent {
            if !rec.has_handle() {
                return;
            }
            rec.link_key_not_sent = false;
            self.send_link_key_notif(&rec_addr);
        }

        let Some(rec) = self.devices.find_mut(&rec_addr) else {
            return;
        };

        if self.pairing.flags.contains(PairingFlags::WE_STARTED_DD) && rec.is_authenticated() {
            // Name read after the bonding, drop the link soon
            rec.security_required &= !SEC_OUT_AUTHENTICATE;
            let handle = rec.hci_handle;
            self.platform.acl.start_post_bond_timer(handle);
            return;
        }

        if old_sec_state != SecState::GettingName {
            return;
        }

        if status != HCI_SUCCESS {
            self.dev_rec_cback_event(&rec_addr, SecStatus::ErrProcessing, Transport::BrEdr);
            return;
        }

        if rec.sm4.contains(Sm4::REQ_PEND) {
            debug!("Waiting for remote features of {}", rec_addr);
            return;
        }

        let rc = self.execute_procedure(&rec_addr);
        if rc != SecStatus::CmdStarted {
            self.dev_rec_cback_event(&rec_addr, rc, Transport::BrEdr);
        }
    }

    /// Name request of a dedicated bonding finished
    fn continue_bonding_after_name(&mut self, bd_addr: &BdAddr, rec_addr: &BdAddr, status: u8) {
        let pairing_addr = self.pairing.bd_addr;

        if *bd_addr != pairing_addr {
            // Someone else's name, ask again for the bonding peer
            debug!("Name of {} while bonding with {}, retrying", bd_addr, pairing_addr);
            if !self.platform.controller.is_ready() {
                self.notify_bonding_change(&pairing_addr, HCI_ERR_MEMORY_FULL);
                self.change_pairing_state(PairingState::Idle);
            } else {
                self.send(HciCommand::RemoteNameRequest { bd_addr: pairing_addr });
            }
            return;
        }

        if self.pairing.flags.contains(PairingFlags::WE_CANCEL_DD) {
            self.bond_cancel_complete();
            return;
        }

        if status != HCI_SUCCESS {
            self.change_pairing_state(PairingState::Idle);
            self.notify_bonding_change(rec_addr, status);
            return;
        }

        let rejected_connect = self.pairing.flags.contains(PairingFlags::REJECTED_CONNECT);
        let Some(rec) = self.devices.find_mut(rec_addr) else {
            return;
        };
        // The name request answered without a features page: legacy peer
        if rec.sm4.is_unknown() && !rejected_connect {
            rec.sm4 |= Sm4::KNOWN;
        }
        let sm4 = rec.sm4;

        if !sm4.is_exactly_known() || !self.check_prefetch_pin(rec_addr) {
            if rejected_connect {
                debug!("Waiting for {} to disconnect before paging", rec_addr);
            } else if self.dd_create_conn(rec_addr) != SecStatus::CmdStarted {
                self.change_pairing_state(PairingState::Idle);
                self.notify_bonding_change(rec_addr, HCI_ERR_MEMORY_FULL);
            }
        }
    }

    /// Remote Host Supported Features Notification
    pub fn on_remote_host_supported_features(&mut self, bd_addr: &BdAddr, features: &[u8; 8]) {
        let rec = self.devices.find_or_alloc(bd_addr);
        debug!("Remote host features {} sm4 {:?} features[0] 0x{:02x}", bd_addr, rec.sm4, features[0]);

        if rec.sm4.is_unknown() {
            rec.sm4 = if features[0] & HCI_FEATURE_SSP_HOST_SUPPORTED != 0 {
                Sm4::TRUE
            } else {
                Sm4::KNOWN
            };
        }
    }

    /// Apply the peer's features once they are read after connection
    pub fn set_peer_sec_caps(
        &mut self,
        handle: u16,
        ssp_supported: bool,
        sc_supported: bool,
        role_switch_supported: bool,
        br_edr_supported: bool,
        le_supported: bool,
    ) {
        let Some(bd_addr) = self.devices.find_by_handle(handle).map(|rec| rec.bd_addr) else {
            return;
        };

        if self.is_sc_downgrade(&bd_addr, sc_supported) {
            error!("{} attempted to downgrade from Secure Connections, disconnecting", bd_addr);
            self.send_hci_disconnect(&bd_addr, HCI_ERR_AUTH_FAILURE, handle);
            return;
        }

        let Some(rec) = self.devices.find_mut(&bd_addr) else {
            return;
        };
        rec.remote_feature_received = true;
        rec.remote_supports_role_switch = role_switch_supported;
        let req_pend = rec.sm4.contains(Sm4::REQ_PEND);

        if !rec.is_name_known() || rec.is_originator {
            let rc = self.execute_procedure(&bd_addr);
            if rc != SecStatus::CmdStarted {
                warn!("Security procedure for {} not started: {}", bd_addr, rc);
                self.dev_rec_cback_event(&bd_addr, rc, Transport::BrEdr);
            }
        }

        let ssp_mode = self.config.security_mode.is_ssp();
        let Some(rec) = self.devices.find_mut(&bd_addr) else {
            return;
        };
        if ssp_mode && ssp_supported {
            rec.sm4 = Sm4::TRUE;
            rec.remote_supports_secure_connections = sc_supported;
        } else {
            rec.sm4 = Sm4::KNOWN;
            rec.remote_supports_secure_connections = false;
        }

        let features_needed = std::mem::take(&mut rec.remote_features_needed);
        rec.remote_supports_bredr = br_edr_supported;
        rec.remote_supports_ble = le_supported;

        if features_needed {
            debug!("Answering deferred IO capability request of {}", bd_addr);
            self.on_io_capability_request(&bd_addr);
        }

        if req_pend {
            self.platform.acl.resubmit_pending_sec_requests(Some(&bd_addr));
        }
    }

    /// The peer was known to support Secure Connections and now claims not to
    fn is_sc_downgrade(&self, bd_addr: &BdAddr, sc_supported: bool) -> bool {
        !sc_supported && self.platform.properties.remote_supports_secure_connections(bd_addr) == Some(true)
    }

    /// Whether `key_size` is below the largest session key seen for the peer
    pub fn is_session_key_size_downgrade(&self, handle: u16, key_size: u8) -> bool {
        let Some(rec) = self.devices.find_by_handle(handle) else {
            return false;
        };
        self.platform
            .properties
            .remote_max_session_key_size(&rec.bd_addr)
            .map(|max| max > key_size)
            .unwrap_or(false)
    }

    /// Remember the session key size negotiated with the peer
    pub fn update_session_key_size(&mut self, handle: u16, key_size: u8) {
        let Some(bd_addr) = self.devices.find_by_handle(handle).map(|rec| rec.bd_addr) else {
            return;
        };
        self.platform
            .properties
            .set_remote_max_session_key_size(&bd_addr, key_size);
    }
}
