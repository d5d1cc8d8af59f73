//! Pairing state machine
//!
//! Dedicated bonding, the user replies that answer PIN, passkey, confirmation
//! and OOB requests, the simple pairing exchange and the pairing timers. Only
//! one pairing runs at a time and its context lives in the manager.

use super::constants::*;
use super::manager::SecurityManager;
use super::platform::TimerId;
use super::types::*;
use crate::gap::{AddressType, BdAddr, DeviceType, Transport};
use crate::hci::constants::*;
use crate::hci::{HciCommand, LINK_KEY_LEN, PIN_CODE_LEN};
use log::{debug, error, info, warn};
use std::time::Duration;

fn is_valid_pin(pin: &[u8]) -> bool {
    !pin.is_empty() && pin.len() <= PIN_CODE_LEN
}

impl SecurityManager {
    /// Start dedicated bonding with a peer.
    ///
    /// `pin` is kept for legacy pairing when it holds 1 to 16 digits. The
    /// device type of a known record wins over `device_type`.
    pub fn bond(
        &mut self,
        bd_addr: &BdAddr,
        addr_type: AddressType,
        transport: Transport,
        device_type: DeviceType,
        pin: &[u8],
    ) -> SecStatus {
        let dev_type = self
            .devices
            .find(bd_addr)
            .map(|rec| rec.device_type)
            .unwrap_or(device_type);

        if (transport == Transport::Le && !dev_type.contains(DeviceType::BLE))
            || (transport == Transport::BrEdr && !dev_type.contains(DeviceType::BREDR))
        {
            warn!("Cannot bond {} over {}, device type {:?}", bd_addr, transport, dev_type);
            return SecStatus::IllegalAction;
        }

        self.bond_by_transport(bd_addr, addr_type, transport, pin)
    }

    fn bond_by_transport(
        &mut self,
        bd_addr: &BdAddr,
        addr_type: AddressType,
        transport: Transport,
        pin: &[u8],
    ) -> SecStatus {
        debug!("Bond {} over {}, address type {:?}", bd_addr, transport, addr_type);

        if self.pairing.state != PairingState::Idle {
            error!("Bonding refused, already busy in state {}", self.pairing.state);
            return SecStatus::WrongMode;
        }

        if transport == Transport::Le {
            warn!("LE bonding with {} is handled by SMP", bd_addr);
            return SecStatus::IllegalAction;
        }

        self.devices.find_or_alloc(bd_addr);
        if !self.platform.controller.is_ready() {
            error!("Controller is not ready");
            return SecStatus::NoResources;
        }

        let link_up = self.platform.acl.is_link_up(bd_addr, transport);
        let controller_ssp = self.platform.controller.supports_simple_pairing();
        let fixed_pin_type = self.config.pin_type == PinType::Fixed;

        let Some(rec) = self.devices.find_mut(bd_addr) else {
            return SecStatus::NoResources;
        };

        if rec.has_handle() && rec.is_authenticated() {
            warn!("{} is already paired", bd_addr);
            return SecStatus::Success;
        }

        if is_valid_pin(pin) {
            rec.pin_code_length = pin.len() as u8;
        }
        rec.security_required = SEC_OUT_AUTHENTICATE;
        rec.is_originator = true;
        rec.sec_flags.remove(
            SecFlags::LINK_KEY_KNOWN
                | SecFlags::AUTHENTICATED
                | SecFlags::ENCRYPTED
                | SecFlags::ROLE_SWITCHED
                | SecFlags::LINK_KEY_AUTHED,
        );

        let keyboard = rec.dev_class.is_keyboard();
        let sm4 = rec.sm4;
        let has_handle = rec.has_handle();

        // Drop any key the controller keeps for the peer
        self.send(HciCommand::DeleteStoredLinkKey {
            bd_addr: *bd_addr,
            delete_all: false,
        });

        if is_valid_pin(pin) {
            self.pairing.pin_code = pin.to_vec();
        }
        self.pairing.bd_addr = *bd_addr;
        self.pairing.flags = PairingFlags::WE_STARTED_DD;

        if !controller_ssp && keyboard && !fixed_pin_type {
            debug!("Forcing fixed PIN for keyboard {}", bd_addr);
            self.pin_type_changed = true;
            self.send(HciCommand::WritePinType {
                pin_type: HCI_PIN_TYPE_FIXED,
            });
        }

        debug!("Bond {} sm4 {:?} link up {}", bd_addr, sm4, link_up);

        if link_up && has_handle {
            self.wait_and_start_authentication(bd_addr);
            self.change_pairing_state(PairingState::WaitPinReq);
            self.platform.acl.set_bonding(bd_addr, true);
            return SecStatus::CmdStarted;
        }

        if (!controller_ssp || sm4.is_exactly_known()) && self.check_prefetch_pin(bd_addr) {
            return SecStatus::CmdStarted;
        }

        let status = if self.config.security_mode.is_ssp() && sm4.is_unknown() {
            if !sm4.contains(Sm4::CONN_PEND) {
                // The name request teaches us whether the peer does simple pairing
                self.change_pairing_state(PairingState::GetRemName);
                self.send(HciCommand::RemoteNameRequest { bd_addr: *bd_addr });
            } else {
                self.change_pairing_state(PairingState::WaitPinReq);
            }
            SecStatus::CmdStarted
        } else {
            self.dd_create_conn(bd_addr)
        };

        if status != SecStatus::CmdStarted {
            error!("Bonding with {} could not start: {}", bd_addr, status);
            self.change_pairing_state(PairingState::Idle);
        }
        status
    }

    /// Cancel a bonding started with [`bond`](Self::bond).
    ///
    /// The result arrives through `bond_cancel_complete` unless the return
    /// value already settles it.
    pub fn bond_cancel(&mut self, bd_addr: &BdAddr) -> SecStatus {
        debug!(
            "Bond cancel {} state {} flags {:?}",
            bd_addr, self.pairing.state, self.pairing.flags
        );

        let Some((handle, has_handle, sec_state)) = self
            .devices
            .find(bd_addr)
            .map(|rec| (rec.hci_handle, rec.has_handle(), rec.sec_state))
        else {
            return SecStatus::UnknownAddr;
        };
        if self.pairing.bd_addr != *bd_addr {
            return SecStatus::UnknownAddr;
        }

        let flags = self.pairing.flags;
        if flags.contains(PairingFlags::LE_ACTIVE) {
            return SecStatus::WrongMode;
        }

        if self.pairing.state == PairingState::WaitLocalPin && flags.contains(PairingFlags::WE_STARTED_DD) {
            debug!("Cancelling before the PIN was sent");
            self.bond_cancel_complete();
            return SecStatus::Success;
        }

        if self.pairing.state == PairingState::Idle || !flags.contains(PairingFlags::WE_STARTED_DD) {
            return SecStatus::WrongMode;
        }

        if has_handle {
            if matches!(sec_state, SecState::Disconnecting | SecState::DisconnectingBoth) {
                return SecStatus::CmdStarted;
            }
            if flags.contains(PairingFlags::DISC_WHEN_DONE) {
                return self.send_hci_disconnect(bd_addr, HCI_ERR_PEER_USER, handle);
            }
            // The link stays, it was not created for the bonding
            self.platform.acl.set_bonding(bd_addr, false);
            return SecStatus::NotAuthorized;
        }

        if flags.contains(PairingFlags::DISC_WHEN_DONE) {
            self.send(HciCommand::CreateConnectionCancel { bd_addr: *bd_addr });
            return SecStatus::CmdStarted;
        }

        if self.pairing.state == PairingState::GetRemName {
            self.send(HciCommand::RemoteNameRequestCancel { bd_addr: *bd_addr });
            self.pairing.flags |= PairingFlags::WE_CANCEL_DD;
            return SecStatus::CmdStarted;
        }

        SecStatus::NotAuthorized
    }

    /// Finish a bonding cancel and report it to the application
    pub(crate) fn bond_cancel_complete(&mut self) {
        let flags = self.pairing.flags;
        let state = self.pairing.state;

        let cancelled = flags.contains(PairingFlags::DISC_WHEN_DONE)
            || (state == PairingState::WaitLocalPin && flags.contains(PairingFlags::WE_STARTED_DD))
            || (state == PairingState::GetRemName && flags.contains(PairingFlags::WE_CANCEL_DD));
        if !cancelled {
            return;
        }

        let bd_addr = self.pairing.bd_addr;
        if let Some(rec) = self.devices.find_mut(&bd_addr) {
            rec.security_required = SEC_NONE;
        }
        self.change_pairing_state(PairingState::Idle);
        self.notify_bond_cancel_complete(SecStatus::Success);
    }

    /// Open an ACL link for dedicated bonding
    pub(crate) fn dd_create_conn(&mut self, bd_addr: &BdAddr) -> SecStatus {
        match self.platform.acl.connect_for_security(bd_addr) {
            SecStatus::CmdStarted => {
                self.change_pairing_state(PairingState::WaitPinReq);
                SecStatus::CmdStarted
            }
            SecStatus::NoResources => SecStatus::NoResources,
            _ => {
                // The link exists only for the bonding
                self.pairing.flags |= PairingFlags::DISC_WHEN_DONE;
                debug!("Paging {} for dedicated bonding", bd_addr);
                self.change_pairing_state(PairingState::WaitPinReq);
                SecStatus::CmdStarted
            }
        }
    }

    /// Collect the PIN before paging a legacy peer.
    ///
    /// Returns true when the PIN was requested or supplied.
    pub(crate) fn check_prefetch_pin(&mut self, bd_addr: &BdAddr) -> bool {
        let Some(rec) = self.devices.find(bd_addr) else {
            return false;
        };
        let dev_class = rec.dev_class;
        let min_16_digit = rec.required_security_flags_for_pairing & SEC_IN_MIN_16_DIGIT_PIN != 0;

        if dev_class.is_handsfree_or_car_audio() {
            // Let the controller authenticate once the link is up
            if !self.security_mode_changed {
                self.security_mode_changed = true;
                self.send(HciCommand::WriteAuthenticationEnable { enable: true });
            }
            return false;
        }

        self.change_pairing_state(PairingState::WaitLocalPin);

        if !self.pairing.pin_code.is_empty() {
            let pin = self.pairing.pin_code.clone();
            self.pin_code_reply(bd_addr, SecStatus::Success, &pin);
        } else if self.callbacks.is_some() && !self.pairing.flags.contains(PairingFlags::PIN_REQD) {
            debug!("Prefetching PIN for {}", bd_addr);
            if self.platform.acl.is_link_up(bd_addr, Transport::BrEdr) {
                self.pairing.flags |= PairingFlags::PIN_REQD;
            }
            self.request_pin(bd_addr, min_16_digit);
        }

        true
    }

    /// Answer a PIN request of the application.
    ///
    /// Anything but `Success` rejects the pairing.
    pub fn pin_code_reply(&mut self, bd_addr: &BdAddr, res: SecStatus, pin: &[u8]) {
        debug!(
            "PIN reply {} state {} flags {:?} res {}",
            bd_addr, self.pairing.state, self.pairing.flags, res
        );

        if self.pairing.state != PairingState::WaitLocalPin {
            warn!("PIN reply in wrong state {}", self.pairing.state);
            return;
        }
        if *bd_addr != self.pairing.bd_addr {
            error!("PIN reply for {}, pairing with {}", bd_addr, self.pairing.bd_addr);
            return;
        }
        let Some(rec) = self.devices.find_mut(bd_addr) else {
            error!("PIN reply for unknown device {}", bd_addr);
            return;
        };

        let res = if is_valid_pin(pin) { res } else { SecStatus::IllegalValue };
        let flags = self.pairing.flags;

        if res != SecStatus::Success {
            if flags.contains(PairingFlags::PEER_STARTED_DD)
                || flags.contains(PairingFlags::WE_STARTED_DD | PairingFlags::DISC_WHEN_DONE)
            {
                // The controller is waiting for an answer
                self.change_pairing_state(PairingState::WaitAuthComplete);
                self.send(HciCommand::PinCodeRequestNegReply { bd_addr: *bd_addr });
            } else {
                rec.security_required = SEC_NONE;
                self.change_pairing_state(PairingState::Idle);
            }
            return;
        }

        rec.sec_flags |= SecFlags::LINK_KEY_AUTHED;
        rec.pin_code_length = pin.len() as u8;
        if pin.len() >= 16 {
            rec.sec_flags |= SecFlags::PIN_16_DIGIT_AUTHED;
        }

        if flags.contains(PairingFlags::WE_STARTED_DD) && !rec.has_handle() && !self.security_mode_changed {
            // PIN collected before paging, send it when the controller asks
            let conn_pend = rec.sm4.contains(Sm4::CONN_PEND);
            self.pairing.pin_code = pin.to_vec();
            self.security_mode_changed = true;
            self.send(HciCommand::WriteAuthenticationEnable { enable: true });

            if flags.contains(PairingFlags::REJECTED_CONNECT) || conn_pend {
                debug!("Waiting for {} to connect", bd_addr);
                self.change_pairing_state(PairingState::WaitPinReq);
            } else if self.dd_create_conn(bd_addr) != SecStatus::CmdStarted {
                self.change_pairing_state(PairingState::Idle);
                if let Some(rec) = self.devices.find_mut(bd_addr) {
                    rec.sec_flags.remove(SecFlags::LINK_KEY_AUTHED);
                }
                self.notify_bonding_change(bd_addr, HCI_ERR_AUTH_FAILURE);
            }
            return;
        }

        self.change_pairing_state(PairingState::WaitAuthComplete);
        self.send(HciCommand::PinCodeRequestReply {
            bd_addr: *bd_addr,
            pin: pin.to_vec(),
        });
    }

    /// Accept or reject a numeric comparison
    pub fn confirm_reply(&mut self, res: SecStatus, bd_addr: &BdAddr) {
        debug!("Confirm reply {} res {} state {}", bd_addr, res, self.pairing.state);

        if self.pairing.state != PairingState::WaitNumericConfirm || *bd_addr != self.pairing.bd_addr {
            warn!("Stale confirm reply for {}", bd_addr);
            return;
        }

        self.change_pairing_state(PairingState::WaitAuthComplete);

        let command = if res.is_success() {
            HciCommand::UserConfirmationRequestReply { bd_addr: *bd_addr }
        } else {
            HciCommand::UserConfirmationRequestNegReply { bd_addr: *bd_addr }
        };
        self.send(command);
    }

    /// Answer a passkey request, or abort a running passkey pairing
    pub fn passkey_reply(&mut self, res: SecStatus, bd_addr: &BdAddr, passkey: u32) {
        debug!("Passkey reply {} res {} state {}", bd_addr, res, self.pairing.state);

        if self.pairing.state == PairingState::Idle || *bd_addr != self.pairing.bd_addr {
            return;
        }

        if self.pairing.state == PairingState::WaitAuthComplete && res != SecStatus::Success {
            let Some((handle, has_handle)) = self
                .devices
                .find(bd_addr)
                .map(|rec| (rec.hci_handle, rec.has_handle()))
            else {
                return;
            };

            if has_handle {
                self.send_hci_disconnect(bd_addr, HCI_ERR_AUTH_FAILURE, handle);
            } else {
                self.bond_cancel(bd_addr);
            }

            if let Some(rec) = self.devices.find_mut(bd_addr) {
                rec.sec_flags
                    .remove(SecFlags::LINK_KEY_AUTHED | SecFlags::LINK_KEY_KNOWN);
            }
            if self.pairing.state != PairingState::Idle {
                self.change_pairing_state(PairingState::Idle);
            }
            return;
        }

        if self.pairing.state != PairingState::KeyEntry {
            return;
        }

        let res = if passkey > MAX_PASSKEY_VAL {
            SecStatus::IllegalValue
        } else {
            res
        };

        self.change_pairing_state(PairingState::WaitAuthComplete);

        let command = if res != SecStatus::Success {
            HciCommand::UserPasskeyRequestNegReply { bd_addr: *bd_addr }
        } else {
            HciCommand::UserPasskeyRequestReply {
                bd_addr: *bd_addr,
                passkey,
            }
        };
        self.send(command);
    }

    /// Ask the controller for local OOB data
    pub fn read_local_oob_data(&mut self) {
        self.send(HciCommand::ReadLocalOobData);
    }

    /// Provide the peer's OOB data, or reject the OOB request
    pub fn remote_oob_data_reply(
        &mut self,
        res: SecStatus,
        bd_addr: &BdAddr,
        c: &[u8; LINK_KEY_LEN],
        r: &[u8; LINK_KEY_LEN],
    ) {
        debug!("Remote OOB reply {} res {} state {}", bd_addr, res, self.pairing.state);

        if self.pairing.state != PairingState::WaitLocalOobRsp {
            return;
        }

        self.change_pairing_state(PairingState::WaitAuthComplete);

        let command = if res != SecStatus::Success {
            HciCommand::RemoteOobDataRequestNegReply { bd_addr: *bd_addr }
        } else {
            HciCommand::RemoteOobDataRequestReply {
                bd_addr: *bd_addr,
                c: *c,
                r: *r,
            }
        };
        self.send(command);
    }

    /// IO Capability Request from the controller
    pub fn on_io_capability_request(&mut self, bd_addr: &BdAddr) {
        debug!("IO capability request {} state {}", bd_addr, self.pairing.state);

        if self.is_a_bonded_dev(bd_addr) {
            warn!("Bonded device {} started pairing again", bd_addr);
            if let Some(callbacks) = self.callbacks.as_mut() {
                callbacks.remove_bonded_device(bd_addr);
            }
        }

        let mode = self.config.security_mode;
        let local_io_caps = self.config.local_io_caps;
        let local_supports_sc = self.platform.controller.supports_secure_connections();

        let rec = self.devices.find_or_alloc(bd_addr);

        if mode == SecurityMode::Sc && !rec.remote_feature_received {
            debug!("Waiting for remote features of {} before answering", bd_addr);
            rec.remote_features_needed = true;
            return;
        }

        let mut request = IoRequest {
            bd_addr: *bd_addr,
            io_cap: local_io_caps,
            oob_data: OOB_NONE,
            auth_req: AUTH_SP_NO,
            is_orig: false,
        };
        rec.sm4 |= Sm4::TRUE;

        let mut err_code = HCI_SUCCESS;
        match self.pairing.state {
            PairingState::Idle => request.is_orig = rec.is_originator,
            PairingState::IncomingSsp => {
                request.is_orig = false;
                if self.pairing.flags.contains(PairingFlags::PEER_STARTED_DD) {
                    // Dedicated bonding started by the peer
                    request.auth_req = AUTH_AP_YES;
                }
            }
            PairingState::WaitPinReq => {
                if *bd_addr == self.pairing.bd_addr {
                    request.is_orig = true;
                    request.auth_req = AUTH_AP_YES;
                } else {
                    err_code = HCI_ERR_HOST_BUSY_PAIRING;
                }
            }
            _ => err_code = HCI_ERR_HOST_BUSY_PAIRING,
        }

        if self.config.pairing_disabled {
            err_code = HCI_ERR_PAIRING_NOT_ALLOWED;
        } else if mode == SecurityMode::Sc
            && !(local_supports_sc && rec.remote_supports_secure_connections)
        {
            warn!("Secure Connections only mode, {} cannot pair", bd_addr);
            err_code = HCI_ERR_PAIRING_NOT_ALLOWED;
        }

        if err_code != HCI_SUCCESS {
            warn!("Rejecting IO capability request from {}: 0x{:02x}", bd_addr, err_code);
            self.send(HciCommand::IoCapabilityRequestNegReply {
                bd_addr: *bd_addr,
                reason: err_code,
            });
            return;
        }

        if request.is_orig
            && !self.pairing.flags.contains(PairingFlags::WE_STARTED_DD)
            && rec.required_security_flags_for_pairing & SEC_OUT_AUTHENTICATE != 0
        {
            if mode == SecurityMode::Sc
                || rec.required_security_flags_for_pairing & SEC_OUT_MITM != 0
            {
                request.auth_req = AUTH_SP_YES;
            }
        }

        let upgrade = rec.sm4.contains(Sm4::UPGRADE);
        if upgrade {
            rec.sm4.remove(Sm4::UPGRADE);
        }

        self.platform.acl.pin_code_request(bd_addr);
        self.pairing.bd_addr = *bd_addr;
        if *bd_addr == self.connecting_bda {
            let dev_class = self.connecting_dc;
            if let Some(rec) = self.devices.find_mut(bd_addr) {
                rec.dev_class = dev_class;
            }
        }
        self.change_pairing_state(PairingState::WaitLocalIocaps);

        if upgrade {
            debug!("Link key upgrade with {}", bd_addr);
            request.auth_req = AUTH_SPGB_YES;
        } else {
            let mut event = SpEvent::IoRequest(request.clone());
            if self.sp_callback(&mut event).is_some() {
                if let SpEvent::IoRequest(updated) = event {
                    request = updated;
                }
            }
        }

        if self.pairing.flags.contains(PairingFlags::WE_STARTED_DD) {
            request.auth_req = AUTH_DD_BOND | (request.auth_req & AUTH_YN_BIT);
        }
        if mode == SecurityMode::Sc {
            request.auth_req |= AUTH_YN_BIT;
        }

        self.loc_auth_req = request.auth_req;
        self.config.local_io_caps = request.io_cap;

        debug!(
            "IO capability reply to {}: io_cap {} oob {} auth_req 0x{:02x}",
            bd_addr, request.io_cap, request.oob_data, request.auth_req
        );
        self.send(HciCommand::IoCapabilityRequestReply {
            bd_addr: *bd_addr,
            io_cap: request.io_cap.to_u8(),
            oob_data: request.oob_data,
            auth_req: request.auth_req,
        });
    }

    /// IO Capability Response from the peer
    pub fn on_io_capability_response(&mut self, bd_addr: &BdAddr, io_cap: u8, oob_data: u8, auth_req: u8) {
        debug!(
            "IO capability response {} io_cap {} auth_req 0x{:02x} state {}",
            bd_addr, io_cap, auth_req, self.pairing.state
        );

        self.devices.find_or_alloc(bd_addr);

        if self.pairing.state == PairingState::Idle {
            self.pairing.bd_addr = *bd_addr;
            self.change_pairing_state(PairingState::IncomingSsp);
        }

        self.platform.acl.pin_code_request(bd_addr);

        if *bd_addr == self.connecting_bda {
            let dev_class = self.connecting_dc;
            if let Some(rec) = self.devices.find_mut(bd_addr) {
                rec.dev_class = dev_class;
            }
        }

        if self.pairing.state == PairingState::IncomingSsp && auth_req & AUTH_DD_BOND != 0 {
            debug!("{} started dedicated bonding", bd_addr);
            self.pairing.flags |= PairingFlags::PEER_STARTED_DD;
        }

        if let Some(rec) = self.devices.find_mut(bd_addr) {
            rec.rmt_io_caps = io_cap;
            rec.rmt_auth_req = auth_req;
        }

        let mut event = SpEvent::IoResponse {
            bd_addr: *bd_addr,
            io_cap,
            oob_data,
            auth_req,
        };
        self.sp_callback(&mut event);
    }

    /// User Confirmation Request
    pub fn on_user_confirmation_request(&mut self, bd_addr: &BdAddr, numeric_value: u32) {
        let local_io_caps = self.config.local_io_caps;
        let loc_auth_req = self.loc_auth_req;

        let Some(rec) = self.sp_request_record(bd_addr) else {
            self.send(HciCommand::UserConfirmationRequestNegReply { bd_addr: *bd_addr });
            return;
        };

        let rmt_io_caps = IoCapability::from_u8(rec.rmt_io_caps);
        let rmt_auth_req = rec.rmt_auth_req;
        let mut request = ConfirmRequest {
            bd_addr: rec.bd_addr,
            dev_class: rec.dev_class,
            name: rec.name.clone(),
            num_val: numeric_value,
            just_works: true,
            loc_auth_req,
            rmt_auth_req,
            loc_io_caps: local_io_caps,
            rmt_io_caps,
        };

        self.change_pairing_state(PairingState::WaitNumericConfirm);

        if local_io_caps == IoCapability::DisplayYesNo {
            match rmt_io_caps {
                None => {
                    error!("Remote IO capabilities of {} unknown, rejecting", bd_addr);
                    self.confirm_reply(SecStatus::WrongMode, bd_addr);
                    return;
                }
                Some(IoCapability::DisplayYesNo) | Some(IoCapability::DisplayOnly)
                    if (rmt_auth_req | loc_auth_req) & AUTH_SP_YES != 0 =>
                {
                    request.just_works = false;
                }
                Some(_) => {}
            }
        }

        let just_works = request.just_works;

        let mut event = SpEvent::ConfirmRequest(request);
        let status = match self.sp_callback(&mut event) {
            Some(status) if status != SecStatus::NotAuthorized => return,
            Some(status) => status,
            None if just_works => {
                debug!("Auto accepting just works pairing with {}", bd_addr);
                SecStatus::Success
            }
            None => SecStatus::ErrProcessing,
        };
        self.confirm_reply(status, bd_addr);
    }

    /// User Passkey Notification: the peer types what we display
    pub fn on_user_passkey_notification(&mut self, bd_addr: &BdAddr, passkey: u32) {
        let Some(rec) = self.sp_request_record(bd_addr) else {
            if let Some(handle) = self.platform.acl.handle(bd_addr, Transport::BrEdr) {
                self.disconnect(handle, HCI_ERR_AUTH_FAILURE);
            }
            return;
        };

        let mut event = SpEvent::KeyNotification {
            bd_addr: rec.bd_addr,
            dev_class: rec.dev_class,
            name: rec.name.clone(),
            passkey,
        };
        self.change_pairing_state(PairingState::WaitAuthComplete);
        self.sp_callback(&mut event);
    }

    /// User Passkey Request: we type what the peer displays
    pub fn on_user_passkey_request(&mut self, bd_addr: &BdAddr) {
        let has_input = self.config.local_io_caps != IoCapability::NoInputNoOutput;

        let Some(rec) = self.sp_request_record(bd_addr) else {
            if has_input {
                self.send(HciCommand::UserPasskeyRequestNegReply { bd_addr: *bd_addr });
            }
            return;
        };

        let mut event = SpEvent::KeyRequest {
            bd_addr: rec.bd_addr,
            dev_class: rec.dev_class,
            name: rec.name.clone(),
        };
        if has_input {
            self.change_pairing_state(PairingState::KeyEntry);
        }

        let status = match self.sp_callback(&mut event) {
            Some(status) if status != SecStatus::NotAuthorized => return,
            Some(status) => status,
            None => SecStatus::ErrProcessing,
        };
        if has_input {
            self.passkey_reply(status, bd_addr, 0);
        }
    }

    /// Record of a simple pairing request that belongs to the running pairing
    fn sp_request_record(&self, bd_addr: &BdAddr) -> Option<&super::device::DeviceSecurityRecord> {
        if !self.is_pairing_with(bd_addr) {
            warn!(
                "Simple pairing request from {} while pairing with {} in state {}",
                bd_addr, self.pairing.bd_addr, self.pairing.state
            );
            return None;
        }
        self.devices.find(bd_addr)
    }

    /// Simple Pairing Complete
    pub fn on_simple_pairing_complete(&mut self, status: u8, bd_addr: &BdAddr) {
        debug!(
            "Simple pairing complete {} status 0x{:02x} state {}",
            bd_addr, status, self.pairing.state
        );

        let Some(rec) = self.devices.find_mut(bd_addr) else {
            error!("Simple pairing complete for unknown device {}", bd_addr);
            return;
        };

        if status == HCI_SUCCESS {
            // The watchdog stays armed until authentication completes
            rec.sec_flags |= SecFlags::AUTHENTICATED;
            return;
        }

        if status == HCI_ERR_PAIRING_NOT_ALLOWED {
            // Tear the link down a little later
            self.change_pairing_state(PairingState::WaitDisconnect);
            self.schedule(
                TimerId::Pairing,
                Duration::from_millis(SEC_WAIT_DISCONNECT_TIMEOUT_MS),
            );
            return;
        }

        let handle = rec.hci_handle;
        let authenticating = rec.sec_state == SecState::Authenticating;

        let disconnect = if *bd_addr == self.pairing.bd_addr {
            self.cancel_timer(TimerId::Pairing);
            !authenticating
        } else {
            true
        };

        if disconnect
            && status != HCI_ERR_PEER_USER
            && status != HCI_ERR_CONN_CAUSE_LOCAL_HOST
        {
            self.send_hci_disconnect(bd_addr, HCI_ERR_AUTH_FAILURE, handle);
        }
    }

    /// Remote OOB Data Request
    pub fn on_remote_oob_request(&mut self, bd_addr: &BdAddr) {
        debug!("Remote OOB request {}", bd_addr);

        let identity = self.devices.find(bd_addr).map(|rec| rec.identity());
        let (Some((bd_addr, dev_class, name)), true) = (identity, self.callbacks.is_some()) else {
            self.send(HciCommand::RemoteOobDataRequestNegReply { bd_addr: *bd_addr });
            return;
        };

        self.change_pairing_state(PairingState::WaitLocalOobRsp);
        let mut event = SpEvent::RemoteOobRequest {
            bd_addr,
            dev_class,
            name,
        };
        if self.sp_callback(&mut event) == Some(SecStatus::NotAuthorized) {
            let empty = [0u8; LINK_KEY_LEN];
            self.remote_oob_data_reply(SecStatus::ErrProcessing, &bd_addr, &empty, &empty);
        }
    }

    /// Command Complete for Read Local OOB Data
    pub fn on_read_local_oob_complete(&mut self, status: u8, c: [u8; LINK_KEY_LEN], r: [u8; LINK_KEY_LEN]) {
        let status = if status == HCI_SUCCESS {
            SecStatus::Success
        } else {
            SecStatus::ErrProcessing
        };
        let mut event = SpEvent::LocalOobData { status, c, r };
        self.sp_callback(&mut event);
    }

    /// Pairing watchdog expiry
    pub(crate) fn pairing_timeout(&mut self) {
        let bd_addr = self.pairing.bd_addr;
        let local_io_caps = self.config.local_io_caps;
        let auth_req = if local_io_caps == IoCapability::NoInputNoOutput {
            AUTH_AP_NO
        } else {
            AUTH_AP_YES
        };

        info!(
            "Pairing timeout with {} in state {} flags {:?}",
            bd_addr, self.pairing.state, self.pairing.flags
        );

        match self.pairing.state {
            PairingState::WaitPinReq => self.bond_cancel_complete(),
            PairingState::WaitLocalPin => {
                if !self.pairing.flags.contains(PairingFlags::PRE_FETCH_PIN) {
                    self.send(HciCommand::PinCodeRequestNegReply { bd_addr });
                }
                self.change_pairing_state(PairingState::Idle);
                // The UI no longer needs the PIN
                self.notify_bonding_change(&bd_addr, HCI_ERR_CONNECTION_TOUT);
            }
            PairingState::WaitNumericConfirm => {
                self.send(HciCommand::UserConfirmationRequestNegReply { bd_addr });
            }
            PairingState::KeyEntry => {
                if local_io_caps != IoCapability::NoInputNoOutput {
                    self.send(HciCommand::UserPasskeyRequestNegReply { bd_addr });
                } else {
                    self.change_pairing_state(PairingState::Idle);
                }
            }
            PairingState::WaitLocalIocaps => {
                self.send(HciCommand::IoCapabilityRequestReply {
                    bd_addr,
                    io_cap: local_io_caps.to_u8(),
                    oob_data: OOB_NONE,
                    auth_req,
                });
                self.change_pairing_state(PairingState::Idle);
            }
            PairingState::WaitLocalOobRsp => {
                self.send(HciCommand::RemoteOobDataRequestNegReply { bd_addr });
                self.change_pairing_state(PairingState::Idle);
            }
            PairingState::WaitDisconnect => {
                let Some(handle) = self.devices.find(&bd_addr).map(|rec| rec.hci_handle) else {
                    error!("Waiting to disconnect unknown device {}", bd_addr);
                    return;
                };
                self.send_hci_disconnect(&bd_addr, HCI_ERR_AUTH_FAILURE, handle);
                self.change_pairing_state(PairingState::Idle);
            }
            PairingState::WaitAuthComplete | PairingState::GetRemName => {
                self.change_pairing_state(PairingState::Idle);
                self.notify_bonding_change(&bd_addr, HCI_ERR_CONNECTION_TOUT);
            }
            state => {
                warn!("Pairing timeout not processed in state {}", state);
                self.change_pairing_state(PairingState::Idle);
            }
        }
    }

    /// An authentication or encryption attempt hit an LMP collision.
    ///
    /// The procedure is retried after a delay until the collision window
    /// closes. After that the record is left idle with its request still
    /// attached, waiting for the next access request to retry it.
    pub(crate) fn auth_collision(&mut self, handle: u16) {
        let now = self.now_ms();
        if self.collision_start_time == 0 {
            self.collision_start_time = now;
        }

        let bd_addr = if handle == HCI_INVALID_HANDLE {
            self.devices
                .find_first_in_state(SecState::Authenticating)
                .or_else(|| self.devices.find_first_in_state(SecState::Encrypting))
        } else {
            self.devices.find_by_handle(handle).map(|rec| rec.bd_addr)
        };
        let Some(bd_addr) = bd_addr else {
            return;
        };

        if let Some(rec) = self.devices.find_mut(&bd_addr) {
            if rec.sec_state == SecState::Authenticating || rec.sec_state == SecState::Encrypting {
                rec.sec_state = SecState::Idle;
            }
        }

        let window = self.config.collision_window.as_millis() as u64;
        if now.saturating_sub(self.collision_start_time) >= window {
            warn!("Collisions with {} for too long, giving up", bd_addr);
            self.collision_start_time = 0;
            return;
        }

        debug!("Collision with {}, retrying in a moment", bd_addr);
        self.collided_dev = Some(bd_addr);
        let delay = self.config.collision_retry_delay;
        self.schedule(TimerId::Collision, delay);
    }

    /// Retry the procedure that hit a collision
    pub(crate) fn collision_timeout(&mut self) {
        let Some(bd_addr) = self.collided_dev else {
            return;
        };

        let status = self.execute_procedure(&bd_addr);
        if status != SecStatus::CmdStarted {
            self.dev_rec_cback_event(&bd_addr, status, Transport::BrEdr);
        }
    }

    /// Page the bonding peer again after its own connection was rejected
    pub(crate) fn connect_after_reject_timeout(&mut self) {
        let Some(bd_addr) = self.collided_dev.take() else {
            return;
        };

        debug!("Connecting to {} after rejecting its connection", bd_addr);
        if self.dd_create_conn(&bd_addr) != SecStatus::CmdStarted {
            warn!("Security manager failed to page {}", bd_addr);
            self.change_pairing_state(PairingState::Idle);
            self.notify_bonding_change(&bd_addr, HCI_ERR_MEMORY_FULL);
        }
    }
}
