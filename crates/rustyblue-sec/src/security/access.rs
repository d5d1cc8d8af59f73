//! Service access requests and the per-device procedure engine
//!
//! An access request records what the service needs on the device record and
//! then calls [`SecurityManager::execute_procedure`], which walks the device
//! through name discovery, authentication and encryption one step per call.
//! Each completion event calls it again until the requirements are met.

use super::constants::*;
use super::device::DeviceSecurityRecord;
use super::manager::SecurityManager;
use super::platform::TimerId;
use super::queue::PendingRequest;
use super::types::*;
use crate::gap::{BdAddr, Transport};
use crate::hci::constants::HCI_INVALID_HANDLE;
use crate::hci::HciCommand;
use crate::l2cap::{psm_name, PSM_RFCOMM, PSM_SDP};
use log::{debug, error, info, warn};

/// Requirement bits for a Secure Connections only service
pub(crate) fn level4_flags(security: u16, is_originator: bool) -> u16 {
    let level4 = if is_originator {
        SEC_OUT_LEVEL4_FLAGS
    } else {
        SEC_IN_LEVEL4_FLAGS
    };
    security | level4
}

/// A peer on a temporary bond may not reach a service that authenticates
/// incoming connections
pub(crate) fn access_secure_service_from_temp_bond(
    rec: &DeviceSecurityRecord,
    locally_initiated: bool,
    security_required: u16,
) -> bool {
    !locally_initiated && security_required & SEC_IN_AUTHENTICATE != 0 && rec.is_bond_type_temporary()
}

/// Whether the existing link key could be replaced by an authenticated one
pub(crate) fn is_upgrade_possible(
    rec: &DeviceSecurityRecord,
    is_originator: bool,
    local_io_caps: IoCapability,
) -> bool {
    if !rec.is_link_key_known() {
        return true;
    }

    let mitm_check = if is_originator { SEC_OUT_MITM } else { SEC_IN_MITM };
    let possible = rec.security_required & mitm_check != 0
        && rec.link_key_type.is_unauthenticated()
        && IoCapability::from_u8(rec.rmt_io_caps)
            .map(|remote| IoCapability::can_authenticate(remote, local_io_caps))
            .unwrap_or(false);

    debug!("Upgrade possible: {} sec_flags: {:?}", possible, rec.sec_flags);
    possible
}

/// Force pairing again when the existing key is weaker than the service needs
pub(crate) fn check_upgrade(rec: &mut DeviceSecurityRecord, is_originator: bool, local_io_caps: IoCapability) {
    if !rec.is_link_key_known() {
        return;
    }

    if is_upgrade_possible(rec, is_originator, local_io_caps) {
        debug!("Link key upgrade needed for {}", rec.bd_addr);
        rec.sm4 |= Sm4::UPGRADE;
        rec.sec_flags
            .remove(SecFlags::LINK_KEY_KNOWN | SecFlags::LINK_KEY_AUTHED | SecFlags::AUTHENTICATED);
    }
}

/// Drop a key that cannot serve a level 4 service, or check for an upgrade
fn prepare_link_key(rec: &mut DeviceSecurityRecord, is_originator: bool, local_io_caps: IoCapability) {
    if rec.security_required & SEC_MODE4_LEVEL4 != 0
        && rec.link_key_type != LinkKeyType::AuthenticatedCombinationP256
    {
        if rec.is_link_key_known() {
            rec.sm4 |= Sm4::UPGRADE;
        }
        rec.sec_flags
            .remove(SecFlags::LINK_KEY_KNOWN | SecFlags::LINK_KEY_AUTHED | SecFlags::AUTHENTICATED);
        debug!("Dropping link key for level 4 service, sec_flags: {:?}", rec.sec_flags);
    } else {
        check_upgrade(rec, is_originator, local_io_caps);
    }
}

/// Whether the flags already on the link satisfy the request
fn requirements_met(rec: &DeviceSecurityRecord, security_required: u16, is_originator: bool) -> bool {
    if is_originator {
        let out = security_required & SEC_OUT_FLAGS;
        out == 0
            || (out == SEC_OUT_AUTHENTICATE && rec.is_authenticated())
            || (out == SEC_OUT_FLAGS && rec.is_encrypted())
    } else {
        let inb = security_required & SEC_IN_FLAGS;
        let level_met = inb == 0
            || (inb == SEC_IN_AUTHENTICATE && rec.is_authenticated())
            || (inb == SEC_IN_FLAGS && rec.is_encrypted());
        level_met
            && (security_required & SEC_IN_MIN_16_DIGIT_PIN == 0 || rec.is_16_digit_pin_authed())
    }
}

/// Decision for a request arriving while the device or the pairing is busy.
///
/// `Success` when the link already satisfies the request and no key upgrade
/// could change that, `CmdStarted` when the request has to wait.
fn check_while_busy(
    rec: &DeviceSecurityRecord,
    mode: SecurityMode,
    local_io_caps: IoCapability,
    security_required: u16,
    is_originator: bool,
) -> SecStatus {
    let legacy_check = mode == SecurityMode::Service
        || rec.sm4.is_exactly_known()
        || (rec.sm4.is_ssp() && !is_upgrade_possible(rec, is_originator, local_io_caps));
    if !legacy_check {
        return SecStatus::CmdStarted;
    }

    if !requirements_met(rec, security_required, is_originator) {
        return SecStatus::CmdStarted;
    }

    if security_required & SEC_MODE4_LEVEL4 != 0
        && rec.link_key_type != LinkKeyType::AuthenticatedCombinationP256
    {
        return SecStatus::CmdStarted;
    }

    SecStatus::Success
}

impl SecurityManager {
    /// Check the security of an L2CAP channel to `psm`.
    ///
    /// The requirement comes from the service registry. `callback` fires with
    /// the final result unless the request is parked for L2CAP to resubmit.
    pub fn l2cap_access_request(
        &mut self,
        bd_addr: &BdAddr,
        psm: u16,
        is_originator: bool,
        mut callback: SecCallback,
    ) -> SecStatus {
        let transport = Transport::BrEdr;
        debug!(
            "L2CAP access request {} psm 0x{:04x} ({}) originator {}",
            bd_addr,
            psm,
            psm_name(psm),
            is_originator
        );

        let security_flags = self
            .services
            .find_first(is_originator, psm)
            .map(|srec| srec.security_flags);
        let Some(security_flags) = security_flags else {
            warn!("PSM 0x{:04x} has no security record", psm);
            callback(self, *bd_addr, transport, SecStatus::ModeUnsupported);
            return SecStatus::ModeUnsupported;
        };

        if psm == PSM_SDP {
            debug!("SDP needs no security");
            callback(self, *bd_addr, transport, SecStatus::SuccessNoSecurity);
            return SecStatus::Success;
        }

        let security_required = if self.config.security_mode == SecurityMode::Sc {
            level4_flags(security_flags, is_originator)
        } else {
            security_flags
        };

        self.l2cap_access_req_by_requirement(bd_addr, security_required, is_originator, callback)
    }

    /// Check an L2CAP channel against an explicit requirement
    pub fn l2cap_access_req_by_requirement(
        &mut self,
        bd_addr: &BdAddr,
        security_required: u16,
        is_originator: bool,
        mut callback: SecCallback,
    ) -> SecStatus {
        let transport = Transport::BrEdr;
        let mut security_required = security_required;

        let handle = self
            .platform
            .acl
            .handle(bd_addr, transport)
            .unwrap_or(HCI_INVALID_HANDLE);
        let local_supports_sc = self.platform.controller.supports_secure_connections();
        let mode = self.config.security_mode;
        let local_io_caps = self.config.local_io_caps;
        let pairing_idle = self.pairing.state == PairingState::Idle;

        let rec = self.devices.find_or_alloc(bd_addr);
        rec.hci_handle = handle;

        if !is_originator
            && security_required & SEC_MODE4_LEVEL4 != 0
            && !(local_supports_sc && rec.remote_supports_secure_connections)
        {
            warn!(
                "Level 4 service from {}, local sc {}, remote sc {}",
                bd_addr, local_supports_sc, rec.remote_supports_secure_connections
            );
            callback(self, *bd_addr, transport, SecStatus::Mode4Level4NotSupported);
            return SecStatus::Mode4Level4NotSupported;
        }

        // One request at a time per device, the rest waits for L2CAP to resubmit
        if rec.callback.is_some() || !pairing_idle {
            debug!(
                "Busy, security 0x{:04x} sec_flags {:?}",
                security_required, rec.sec_flags
            );
            let rc = check_while_busy(rec, mode, local_io_caps, security_required, is_originator);
            if rc == SecStatus::Success {
                let rc = if access_secure_service_from_temp_bond(rec, is_originator, security_required) {
                    error!("Secure service access from temporary bond {}, rejecting", bd_addr);
                    SecStatus::FailedOnSecurity
                } else {
                    rc
                };
                callback(self, *bd_addr, transport, rc);
                return rc;
            }

            self.sec_req_pending = true;
            return SecStatus::CmdStarted;
        }

        rec.required_security_flags_for_pairing = security_required;

        let mut chk_acp_auth_done = false;
        if mode.is_ssp() {
            if rec.sm4.is_ssp() {
                if is_originator {
                    security_required |= SEC_OUT_ENCRYPT;
                } else {
                    chk_acp_auth_done = true;
                    security_required |= SEC_IN_ENCRYPT;
                }
            } else if !rec.sm4.contains(Sm4::KNOWN) {
                debug!("Remote features of {} not received yet", bd_addr);
                rec.sm4 |= Sm4::REQ_PEND;
                return SecStatus::CmdStarted;
            }
        }

        rec.security_required = security_required;
        rec.is_originator = is_originator;

        if chk_acp_auth_done && !(rec.is_authenticated() && rec.is_encrypted()) {
            info!("Peer {} should start security first, delaying", bd_addr);
            rec.sec_state = SecState::DelayForEnc;
            callback(self, *bd_addr, transport, SecStatus::DelayCheck);
            // The final result comes with the encryption change
            if let Some(rec) = self.devices.find_mut(bd_addr) {
                if rec.callback.is_none() {
                    rec.callback = Some(callback);
                }
            }
            return SecStatus::Success;
        }

        rec.callback = Some(callback);

        if rec.sm4.is_ssp() {
            prepare_link_key(rec, is_originator, local_io_caps);
        }

        let rc = self.execute_procedure(bd_addr);
        if rc != SecStatus::CmdStarted {
            debug!("Access request for {} completed: {}", bd_addr, rc);
            self.take_and_call(bd_addr, transport, rc);
        }
        rc
    }

    /// Check the security of a multiplexed (RFCOMM) channel
    pub fn mx_access_request(
        &mut self,
        bd_addr: &BdAddr,
        is_originator: bool,
        security_required: u16,
        mut callback: SecCallback,
    ) -> SecStatus {
        let transport = Transport::BrEdr;
        let mut security_required = security_required;
        debug!("Multiplexor access request {} originator {}", bd_addr, is_originator);

        let local_supports_sc = self.platform.controller.supports_secure_connections();
        let mode = self.config.security_mode;
        let local_io_caps = self.config.local_io_caps;
        let pairing_idle = self.pairing.state == PairingState::Idle;

        let rec = self.devices.find_or_alloc(bd_addr);

        if rec.callback.is_some() || !pairing_idle {
            let mut rc = check_while_busy(rec, mode, local_io_caps, security_required, is_originator);

            // A procedure running on the record wins over a satisfied check
            if rec.sec_state != SecState::Idle {
                rc = SecStatus::CmdStarted;
            }

            if rc == SecStatus::CmdStarted {
                debug!("Queueing multiplexor request for {}", bd_addr);
                self.pending.push(PendingRequest::Multiplexor {
                    bd_addr: *bd_addr,
                    psm: PSM_RFCOMM,
                    is_originator,
                    security_required,
                    callback,
                });
                return rc;
            }

            let rc = if access_secure_service_from_temp_bond(rec, is_originator, security_required) {
                error!("Secure service access from temporary bond {}, rejecting", bd_addr);
                SecStatus::FailedOnSecurity
            } else {
                rc
            };
            callback(self, *bd_addr, transport, rc);
            return rc;
        }

        if !is_originator
            && (security_required & SEC_MODE4_LEVEL4 != 0 || mode == SecurityMode::Sc)
            && !(local_supports_sc && rec.remote_supports_secure_connections)
        {
            warn!(
                "Level 4 multiplexor service from {}, local sc {}, remote sc {}",
                bd_addr, local_supports_sc, rec.remote_supports_secure_connections
            );
            callback(self, *bd_addr, transport, SecStatus::Mode4Level4NotSupported);
            return SecStatus::Mode4Level4NotSupported;
        }

        if security_required & SEC_OUT_AUTHENTICATE != 0 {
            security_required |= SEC_OUT_MITM;
        }
        if security_required & SEC_IN_AUTHENTICATE != 0 {
            security_required |= SEC_IN_MITM;
        }

        rec.required_security_flags_for_pairing = security_required;
        rec.security_required = security_required;

        if mode.is_ssp() && rec.sm4.is_ssp() {
            prepare_link_key(rec, is_originator, local_io_caps);
        }

        rec.is_originator = is_originator;
        rec.callback = Some(callback);

        let rc = self.execute_procedure(bd_addr);
        if rc != SecStatus::CmdStarted {
            debug!("Multiplexor request for {} completed: {}", bd_addr, rc);
            self.take_and_call(bd_addr, transport, rc);
        }
        rc
    }

    /// Encrypt the link to a peer.
    ///
    /// Returns `Success` at once when the link is already encrypted and
    /// `CmdStarted` when the request was queued or the procedure began.
    pub fn set_encryption(
        &mut self,
        bd_addr: &BdAddr,
        transport: Transport,
        callback: Option<SecCallback>,
        sec_act: LeSecAction,
    ) -> SecStatus {
        let Some(rec) = self.devices.find_mut(bd_addr) else {
            error!("Encryption requested for unknown device {}", bd_addr);
            return SecStatus::WrongMode;
        };

        if rec.handle(transport) == HCI_INVALID_HANDLE {
            warn!("Encryption requested for {} without a {} link", bd_addr, transport);
            if let Some(mut callback) = callback {
                callback(self, *bd_addr, transport, SecStatus::WrongMode);
            }
            return SecStatus::WrongMode;
        }

        if rec.flags(transport).contains(SecFlags::ENCRYPTED) {
            debug!("{} already encrypted on {}", bd_addr, transport);
            if let Some(mut callback) = callback {
                callback(self, *bd_addr, transport, SecStatus::Success);
            }
            return SecStatus::Success;
        }

        if rec.callback.is_some() || rec.sec_state != SecState::Idle {
            warn!("Security busy for {}, queueing encryption request", bd_addr);
            self.pending.push(PendingRequest::Encryption {
                bd_addr: *bd_addr,
                transport,
                sec_act,
                callback,
            });
            return SecStatus::CmdStarted;
        }

        rec.callback = callback;
        rec.security_required |= SEC_IN_AUTHENTICATE | SEC_IN_ENCRYPT;
        rec.is_originator = false;

        let rc = match transport {
            Transport::BrEdr => self.execute_procedure(bd_addr),
            Transport::Le => {
                warn!("LE encryption for {} is handled by SMP", bd_addr);
                SecStatus::WrongMode
            }
        };

        match rc {
            SecStatus::CmdStarted | SecStatus::Busy => {}
            _ => self.take_and_call(bd_addr, transport, rc),
        }
        rc
    }

    /// Take the stored callback out of the record and deliver `status`
    fn take_and_call(&mut self, bd_addr: &BdAddr, transport: Transport, status: SecStatus) {
        let callback = self.devices.find_mut(bd_addr).and_then(|rec| rec.callback.take());
        if let Some(mut callback) = callback {
            callback(self, *bd_addr, transport, status);
        }
    }

    /// Move the device one step toward its required security.
    ///
    /// Returns `CmdStarted` while a step runs, `Success` once everything the
    /// request needs is in place, or the failure.
    pub(crate) fn execute_procedure(&mut self, bd_addr: &BdAddr) -> SecStatus {
        let Some(rec) = self.devices.find_mut(bd_addr) else {
            warn!("No record to run security for {}", bd_addr);
            return SecStatus::WrongMode;
        };

        debug!(
            "Execute procedure {} security_required 0x{:04x} sec_flags {:?} state {}",
            bd_addr, rec.security_required, rec.sec_flags, rec.sec_state
        );

        if rec.sec_state != SecState::Idle && rec.sec_state != SecState::LeEncrypting {
            info!("No immediate action taken in busy state {}", rec.sec_state);
            return SecStatus::CmdStarted;
        }

        if !rec.is_name_known() && rec.has_handle() {
            debug!("Start get name");
            if !self.start_get_name(bd_addr) {
                warn!("Unable to start remote name request");
                return SecStatus::NoResources;
            }
            return SecStatus::CmdStarted;
        }

        let locally_initiated = rec.is_originator;
        let required = rec.security_required;

        if rec.has_handle() {
            let mut start_auth = false;

            if !rec.is_authenticated() {
                let mask = if locally_initiated {
                    SEC_OUT_AUTHENTICATE | SEC_OUT_ENCRYPT
                } else {
                    SEC_IN_AUTHENTICATE | SEC_IN_ENCRYPT
                };
                if required & mask != 0 {
                    debug!("Authentication required");
                    start_auth = true;
                }
            }

            let needs_16_digit = !rec.is_16_digit_pin_authed()
                && !locally_initiated
                && required & SEC_IN_MIN_16_DIGIT_PIN != 0;
            if needs_16_digit {
                debug!("16 digit PIN required");
                start_auth = true;
            }

            if start_auth {
                if rec.is_link_key_known() && needs_16_digit {
                    rec.sec_flags.remove(
                        SecFlags::LINK_KEY_KNOWN | SecFlags::LINK_KEY_AUTHED | SecFlags::AUTHENTICATED,
                    );
                }
                self.wait_and_start_authentication(bd_addr);
                return SecStatus::CmdStarted;
            }
        }

        let encryption_needed = if locally_initiated {
            required & SEC_OUT_ENCRYPT != 0
        } else {
            required & SEC_IN_ENCRYPT != 0
        };
        if !rec.is_encrypted() && encryption_needed && rec.has_handle() {
            debug!("Start encryption");
            let handle = rec.hci_handle;
            rec.sec_state = SecState::Encrypting;
            self.send(HciCommand::SetConnectionEncryption { handle, enable: true });
            return SecStatus::CmdStarted;
        }

        if required & SEC_MODE4_LEVEL4 != 0
            && rec.link_key_type != LinkKeyType::AuthenticatedCombinationP256
        {
            warn!(
                "Level 4 service but link key type is {:?}, security failure",
                rec.link_key_type
            );
            return SecStatus::FailedOnSecurity;
        }

        if access_secure_service_from_temp_bond(rec, locally_initiated, required) {
            error!("Secure service access from temporary bond {}, rejecting", bd_addr);
            return SecStatus::FailedOnSecurity;
        }

        rec.security_required &=
            !(SEC_OUT_AUTHENTICATE | SEC_IN_AUTHENTICATE | SEC_OUT_ENCRYPT | SEC_IN_ENCRYPT);

        debug!("Access granted to {}", bd_addr);
        SecStatus::Success
    }

    /// Ask the controller for the remote name, false when it is not up
    pub(crate) fn start_get_name(&mut self, bd_addr: &BdAddr) -> bool {
        if !self.platform.controller.is_ready() {
            return false;
        }

        if let Some(rec) = self.devices.find_mut(bd_addr) {
            rec.sec_state = SecState::GettingName;
        }
        self.send(HciCommand::RemoteNameRequest { bd_addr: *bd_addr });
        true
    }

    /// Issue Authentication Requested, after the configured delay if any
    pub(crate) fn wait_and_start_authentication(&mut self, bd_addr: &BdAddr) {
        let delay = self.config.auth_delay;
        if delay.is_zero() {
            self.auth_timer_timeout(bd_addr);
        } else {
            debug!("Delaying authentication of {} by {:?}", bd_addr, delay);
            self.schedule(TimerId::AuthDelay(*bd_addr), delay);
        }
    }

    pub(crate) fn auth_timer_timeout(&mut self, bd_addr: &BdAddr) {
        let Some(rec) = self.devices.find_mut(bd_addr) else {
            info!("Device {} not found for authentication", bd_addr);
            return;
        };

        if rec.is_authenticated() {
            info!("{} is already authenticated", bd_addr);
        } else if rec.sec_state == SecState::Authenticating {
            info!("{} is in the process of authenticating", bd_addr);
        } else {
            info!("Starting authentication of {}", bd_addr);
            rec.sec_state = SecState::Authenticating;
            let handle = rec.hci_handle;
            self.send(HciCommand::AuthenticationRequested { handle });
        }
    }

    /// Abandon the request being served for a device, without a callback
    pub fn abort_access_request(&mut self, bd_addr: &BdAddr) {
        let Some(rec) = self.devices.find_mut(bd_addr) else {
            return;
        };

        if rec.sec_state != SecState::Authorizing && rec.sec_state != SecState::Authenticating {
            return;
        }

        debug!("Aborting access request for {}", bd_addr);
        rec.sec_state = SecState::Idle;
        rec.callback = None;
    }

    /// Complete queued encryption requests satisfied by an encryption change
    pub(crate) fn check_pending_enc_req(&mut self, bd_addr: &BdAddr, transport: Transport, encr_enable: bool) {
        let status = if encr_enable {
            SecStatus::Success
        } else {
            SecStatus::ErrProcessing
        };
        let le_authenticated = self
            .devices
            .find(bd_addr)
            .map(|rec| rec.ble_sec_flags.contains(SecFlags::AUTHENTICATED))
            .unwrap_or(false);

        let satisfied = self.pending.take_matching(|request| match request {
            PendingRequest::Encryption {
                bd_addr: queued,
                transport: queued_transport,
                sec_act,
                ..
            } => {
                *queued == *bd_addr
                    && *queued_transport == transport
                    && (!encr_enable
                        || transport == Transport::BrEdr
                        || matches!(sec_act, LeSecAction::Encrypt | LeSecAction::EncryptNoMitm)
                        || (*sec_act == LeSecAction::EncryptMitm && le_authenticated))
            }
            PendingRequest::Multiplexor { .. } => false,
        });

        for request in satisfied {
            if let PendingRequest::Encryption {
                callback: Some(mut callback),
                ..
            } = request
            {
                callback(self, *bd_addr, transport, status);
            }
        }
    }
}
