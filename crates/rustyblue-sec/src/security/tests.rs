//! Security manager behaviour against a scripted host

use super::constants::*;
use super::*;
use crate::gap::{AddressType, BdAddr, DeviceClass, DeviceType, Role, Transport};
use crate::hci::constants::*;
use crate::hci::{HciCommand, HciEvent, PIN_CODE_LEN};
use crate::l2cap::{PSM_RFCOMM, PSM_SDP};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

const HANDLE: u16 = 0x0040;
const PSM_SERIAL: u16 = 0x1001;

fn peer() -> BdAddr {
    BdAddr::new([0x66, 0x55, 0x44, 0x33, 0x22, 0x11])
}

fn other_peer() -> BdAddr {
    BdAddr::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06])
}

struct MockState {
    commands: Vec<HciCommand>,
    disconnects: Vec<(u16, u8)>,
    links: HashMap<BdAddr, u16>,
    role: Role,
    connect_result: SecStatus,
    bonding: HashMap<BdAddr, bool>,
    post_bond_timers: Vec<u16>,
    resubmits: Vec<Option<BdAddr>>,
    controller_ready: bool,
    supports_ssp: bool,
    supports_sc: bool,
    now_ms: u64,
    timers: HashMap<TimerId, Duration>,
    pin_requests: Vec<(BdAddr, bool)>,
    link_keys: Vec<(BdAddr, LinkKeyType, bool)>,
    auth_completes: Vec<(BdAddr, u8)>,
    bond_cancels: Vec<SecStatus>,
    sp_events: Vec<SpEvent>,
    sp_reply: SecStatus,
    removed_bonds: Vec<BdAddr>,
    results: Vec<(BdAddr, SecStatus)>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            disconnects: Vec::new(),
            links: HashMap::new(),
            role: Role::Central,
            connect_result: SecStatus::Success,
            bonding: HashMap::new(),
            post_bond_timers: Vec::new(),
            resubmits: Vec::new(),
            controller_ready: true,
            supports_ssp: true,
            supports_sc: false,
            now_ms: 1000,
            timers: HashMap::new(),
            pin_requests: Vec::new(),
            link_keys: Vec::new(),
            auth_completes: Vec::new(),
            bond_cancels: Vec::new(),
            sp_events: Vec::new(),
            sp_reply: SecStatus::Success,
            removed_bonds: Vec::new(),
            results: Vec::new(),
        }
    }
}

type Shared = Rc<RefCell<MockState>>;

#[derive(Clone)]
struct Mock(Shared);

impl HciSink for Mock {
    fn send(&mut self, command: HciCommand) {
        self.0.borrow_mut().commands.push(command);
    }
}

impl AclLinks for Mock {
    fn is_link_up(&self, bd_addr: &BdAddr, transport: Transport) -> bool {
        transport == Transport::BrEdr && self.0.borrow().links.contains_key(bd_addr)
    }

    fn handle(&self, bd_addr: &BdAddr, transport: Transport) -> Option<u16> {
        match transport {
            Transport::BrEdr => self.0.borrow().links.get(bd_addr).copied(),
            Transport::Le => None,
        }
    }

    fn role(&self, bd_addr: &BdAddr) -> Option<Role> {
        let state = self.0.borrow();
        state.links.contains_key(bd_addr).then_some(state.role)
    }

    fn connect_for_security(&mut self, _bd_addr: &BdAddr) -> SecStatus {
        self.0.borrow().connect_result
    }

    fn disconnect(&mut self, handle: u16, reason: u8) {
        self.0.borrow_mut().disconnects.push((handle, reason));
    }

    fn set_bonding(&mut self, bd_addr: &BdAddr, bonding: bool) {
        self.0.borrow_mut().bonding.insert(*bd_addr, bonding);
    }

    fn start_post_bond_timer(&mut self, handle: u16) {
        self.0.borrow_mut().post_bond_timers.push(handle);
    }

    fn resubmit_pending_sec_requests(&mut self, bd_addr: Option<&BdAddr>) {
        self.0.borrow_mut().resubmits.push(bd_addr.copied());
    }

    fn pin_code_request(&mut self, _bd_addr: &BdAddr) {}

    fn peer_supports_smp_over_br(&self, _bd_addr: &BdAddr) -> bool {
        false
    }

    fn start_smp_over_br(&mut self, _bd_addr: &BdAddr) {}
}

impl Controller for Mock {
    fn is_ready(&self) -> bool {
        self.0.borrow().controller_ready
    }

    fn supports_simple_pairing(&self) -> bool {
        self.0.borrow().supports_ssp
    }

    fn supports_secure_connections(&self) -> bool {
        self.0.borrow().supports_sc
    }
}

impl SecTimers for Mock {
    fn now_ms(&self) -> u64 {
        self.0.borrow().now_ms
    }

    fn schedule(&mut self, id: TimerId, delay: Duration) {
        self.0.borrow_mut().timers.insert(id, delay);
    }

    fn cancel(&mut self, id: TimerId) {
        self.0.borrow_mut().timers.remove(&id);
    }
}

impl SecurityCallbacks for Mock {
    fn pin_request(&mut self, bd_addr: &BdAddr, _dev_class: DeviceClass, _name: &str, min_16_digit: bool) {
        self.0.borrow_mut().pin_requests.push((*bd_addr, min_16_digit));
    }

    fn link_key(
        &mut self,
        bd_addr: &BdAddr,
        _dev_class: DeviceClass,
        _name: &str,
        _link_key: &[u8; 16],
        key_type: LinkKeyType,
        is_ctkd: bool,
    ) {
        self.0.borrow_mut().link_keys.push((*bd_addr, key_type, is_ctkd));
    }

    fn auth_complete(&mut self, bd_addr: &BdAddr, _dev_class: DeviceClass, _name: &str, reason: u8) {
        self.0.borrow_mut().auth_completes.push((*bd_addr, reason));
    }

    fn bond_cancel_complete(&mut self, status: SecStatus) {
        self.0.borrow_mut().bond_cancels.push(status);
    }

    fn simple_pairing(&mut self, event: &mut SpEvent) -> SecStatus {
        let mut state = self.0.borrow_mut();
        state.sp_events.push(event.clone());
        state.sp_reply
    }

    fn remove_bonded_device(&mut self, bd_addr: &BdAddr) {
        self.0.borrow_mut().removed_bonds.push(*bd_addr);
    }
}

fn setup_with(config: SecurityConfig) -> (SecurityManager, Shared) {
    let _ = env_logger::builder().is_test(true).try_init();

    let state: Shared = Rc::new(RefCell::new(MockState::default()));
    let mock = Mock(state.clone());
    let platform = Platform {
        hci: Box::new(mock.clone()),
        acl: Box::new(mock.clone()),
        controller: Box::new(mock.clone()),
        properties: Box::new(MemoryPropertyStore::new()),
        timers: Box::new(mock.clone()),
    };

    let mut mgr = SecurityManager::new(config, platform);
    mgr.register_callbacks(Box::new(mock));
    (mgr, state)
}

fn setup() -> (SecurityManager, Shared) {
    setup_with(SecurityConfig::default())
}

fn record_result(state: &Shared) -> SecCallback {
    let state = state.clone();
    Box::new(move |_mgr, bd_addr, _transport, status| {
        state.borrow_mut().results.push((bd_addr, status));
    })
}

fn take_commands(state: &Shared) -> Vec<HciCommand> {
    std::mem::take(&mut state.borrow_mut().commands)
}

fn results(state: &Shared) -> Vec<(BdAddr, SecStatus)> {
    state.borrow().results.clone()
}

fn sec_state(mgr: &SecurityManager, bd_addr: &BdAddr) -> SecState {
    mgr.device(bd_addr).map(|rec| rec.sec_state).unwrap()
}

fn connect(mgr: &mut SecurityManager, state: &Shared, bd_addr: &BdAddr, encrypted: bool) {
    state.borrow_mut().links.insert(*bd_addr, HANDLE);
    mgr.on_connection_complete(bd_addr, HANDLE, HCI_SUCCESS, encrypted);
}

/// Connected simple pairing peer whose name is known
fn connect_ssp_peer(mgr: &mut SecurityManager, state: &Shared) {
    connect(mgr, state, &peer(), false);
    mgr.on_remote_name_complete(Some(&peer()), "Peer", HCI_SUCCESS);
    mgr.set_peer_sec_caps(HANDLE, true, false, true, true, false);
    take_commands(state);
}

/// Outgoing access needing authentication and encryption, left authenticating
fn start_authentication(mgr: &mut SecurityManager, state: &Shared) {
    connect_ssp_peer(mgr, state);
    let rc = mgr.l2cap_access_req_by_requirement(
        &peer(),
        SEC_OUT_AUTHENTICATE | SEC_OUT_ENCRYPT,
        true,
        record_result(state),
    );
    assert_eq!(rc, SecStatus::CmdStarted);
    assert_eq!(sec_state(mgr, &peer()), SecState::Authenticating);
    assert_eq!(
        take_commands(state),
        vec![HciCommand::AuthenticationRequested { handle: HANDLE }]
    );
}

/// Known legacy peer with a stored key, connected and encrypted
fn connect_encrypted_legacy_peer(mgr: &mut SecurityManager, state: &Shared) {
    mgr.add_device(
        &peer(),
        DeviceClass::EMPTY,
        Some("Speaker"),
        Some(([0x22; 16], LinkKeyType::Combination)),
        4,
    );
    mgr.on_remote_host_supported_features(&peer(), &[0; 8]);
    connect(mgr, state, &peer(), true);
    take_commands(state);
}

#[test]
fn test_access_runs_name_authentication_then_encryption() {
    let (mut mgr, state) = setup();
    let addr = peer();

    connect(&mut mgr, &state, &addr, false);
    mgr.set_peer_sec_caps(HANDLE, true, false, true, true, false);
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::RemoteNameRequest { bd_addr: addr }]
    );

    let rc = mgr.l2cap_access_req_by_requirement(
        &addr,
        SEC_OUT_AUTHENTICATE | SEC_OUT_ENCRYPT,
        true,
        record_result(&state),
    );
    assert_eq!(rc, SecStatus::CmdStarted);
    assert_eq!(sec_state(&mgr, &addr), SecState::GettingName);
    assert!(take_commands(&state).is_empty());

    // Authentication only after the name
    mgr.on_remote_name_complete(Some(&addr), "Peer", HCI_SUCCESS);
    assert_eq!(sec_state(&mgr, &addr), SecState::Authenticating);
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::AuthenticationRequested { handle: HANDLE }]
    );

    // Simple pairing with just works
    mgr.on_link_key_request(&addr);
    mgr.on_io_capability_request(&addr);
    mgr.on_io_capability_response(&addr, IO_CAP_IO, OOB_NONE, AUTH_SP_NO);
    mgr.on_user_confirmation_request(&addr, 123456);
    assert_eq!(mgr.pairing_state(), PairingState::WaitNumericConfirm);
    assert!(state.borrow().sp_events.iter().any(|event| matches!(
        event,
        SpEvent::ConfirmRequest(request) if request.just_works && request.num_val == 123456
    )));

    mgr.confirm_reply(SecStatus::Success, &addr);
    mgr.on_simple_pairing_complete(HCI_SUCCESS, &addr);
    mgr.on_link_key_notification(&addr, &[0x11; 16], LKEY_TYPE_UNAUTH_COMB_P_256);

    assert!(mgr.is_link_key_known(&addr, Transport::BrEdr));
    assert_eq!(mgr.pairing_state(), PairingState::Idle);
    assert_eq!(
        state.borrow().link_keys,
        vec![(addr, LinkKeyType::UnauthenticatedCombinationP256, false)]
    );

    let commands = take_commands(&state);
    assert!(commands.contains(&HciCommand::LinkKeyRequestNegReply { bd_addr: addr }));
    assert!(commands.contains(&HciCommand::UserConfirmationRequestReply { bd_addr: addr }));
    assert!(commands
        .iter()
        .all(|command| !matches!(command, HciCommand::SetConnectionEncryption { .. })));

    mgr.on_authentication_complete(HANDLE, HCI_SUCCESS);
    assert_eq!(sec_state(&mgr, &addr), SecState::Encrypting);
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::SetConnectionEncryption {
            handle: HANDLE,
            enable: true
        }]
    );
    assert!(results(&state).is_empty());

    mgr.on_encryption_change(HANDLE, HCI_SUCCESS, true);
    assert_eq!(results(&state), vec![(addr, SecStatus::Success)]);
    assert_eq!(sec_state(&mgr, &addr), SecState::Idle);
    assert!(mgr.is_authenticated(&addr, Transport::BrEdr));
    assert!(mgr.is_encrypted(&addr, Transport::BrEdr));
    assert!(!state.borrow().timers.contains_key(&TimerId::Pairing));
}

#[test]
fn test_second_bond_is_refused_while_first_runs() {
    let (mut mgr, state) = setup();
    mgr.on_remote_host_supported_features(&peer(), &[HCI_FEATURE_SSP_HOST_SUPPORTED, 0, 0, 0, 0, 0, 0, 0]);

    let rc = mgr.bond(&peer(), AddressType::Public, Transport::BrEdr, DeviceType::BREDR, &[]);
    assert_eq!(rc, SecStatus::CmdStarted);
    assert_eq!(mgr.pairing_state(), PairingState::WaitPinReq);
    assert_eq!(state.borrow().bonding.get(&peer()), Some(&true));
    take_commands(&state);

    let rc = mgr.bond(&other_peer(), AddressType::Public, Transport::BrEdr, DeviceType::BREDR, &[]);
    assert_eq!(rc, SecStatus::WrongMode);
    assert_eq!(mgr.pairing_state(), PairingState::WaitPinReq);
    assert_eq!(mgr.pairing_bd_addr(), peer());
    assert!(mgr.device(&other_peer()).is_none());
    assert!(take_commands(&state).is_empty());
}

#[test]
fn test_bond_cancel_while_paging() {
    let (mut mgr, state) = setup();
    mgr.on_remote_host_supported_features(&peer(), &[HCI_FEATURE_SSP_HOST_SUPPORTED, 0, 0, 0, 0, 0, 0, 0]);
    mgr.bond(&peer(), AddressType::Public, Transport::BrEdr, DeviceType::BREDR, &[]);
    take_commands(&state);

    assert_eq!(mgr.bond_cancel(&other_peer()), SecStatus::UnknownAddr);
    assert_eq!(mgr.bond_cancel(&peer()), SecStatus::CmdStarted);
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::CreateConnectionCancel { bd_addr: peer() }]
    );

    mgr.on_create_connection_cancel_complete(HCI_SUCCESS, &peer());
    assert_eq!(mgr.pairing_state(), PairingState::Idle);
    assert_eq!(state.borrow().bond_cancels, vec![SecStatus::Success]);
    assert_eq!(state.borrow().bonding.get(&peer()), Some(&false));
}

#[test]
fn test_le_bond_is_illegal() {
    let (mut mgr, _state) = setup();
    let rc = mgr.bond(&peer(), AddressType::Random, Transport::Le, DeviceType::BLE, &[]);
    assert_eq!(rc, SecStatus::IllegalAction);
    assert_eq!(mgr.pairing_state(), PairingState::Idle);
}

#[test]
fn test_dedicated_bonding_on_existing_link() {
    let (mut mgr, state) = setup();
    connect_ssp_peer(&mut mgr, &state);

    let rc = mgr.bond(&peer(), AddressType::Public, Transport::BrEdr, DeviceType::BREDR, &[]);
    assert_eq!(rc, SecStatus::CmdStarted);
    assert_eq!(mgr.pairing_state(), PairingState::WaitPinReq);
    assert_eq!(sec_state(&mgr, &peer()), SecState::Authenticating);

    mgr.on_authentication_complete(HANDLE, HCI_SUCCESS);
    assert_eq!(mgr.pairing_state(), PairingState::Idle);
    assert_eq!(state.borrow().auth_completes, vec![(peer(), HCI_SUCCESS)]);
    assert!(!state.borrow().post_bond_timers.is_empty());

    // Central after bonding: encrypt right away
    let commands = take_commands(&state);
    assert!(commands.contains(&HciCommand::SetConnectionEncryption {
        handle: HANDLE,
        enable: true
    }));
}

#[test]
fn test_collision_resets_record_and_retries() {
    let (mut mgr, state) = setup();
    start_authentication(&mut mgr, &state);

    mgr.on_encryption_change(HANDLE, HCI_ERR_LMP_ERR_TRANS_COLLISION, false);
    assert_eq!(sec_state(&mgr, &peer()), SecState::Idle);
    assert_eq!(
        state.borrow().timers.get(&TimerId::Collision),
        Some(&Duration::from_millis(SEC_COLLISION_RETRY_MS))
    );
    assert!(results(&state).is_empty());
    assert!(take_commands(&state).is_empty());

    mgr.on_timer_expired(TimerId::Collision);
    assert_eq!(sec_state(&mgr, &peer()), SecState::Authenticating);
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::AuthenticationRequested { handle: HANDLE }]
    );
    assert!(results(&state).is_empty());
}

#[test]
fn test_collisions_give_up_after_window() {
    let (mut mgr, state) = setup();
    start_authentication(&mut mgr, &state);

    mgr.on_authentication_complete(HANDLE, HCI_ERR_DIFF_TRANSACTION_COLLISION);
    mgr.on_timer_expired(TimerId::Collision);
    assert_eq!(sec_state(&mgr, &peer()), SecState::Authenticating);
    state.borrow_mut().timers.clear();

    state.borrow_mut().now_ms += SEC_COLLISION_WINDOW_MS + 1000;
    mgr.on_authentication_complete(HANDLE, HCI_ERR_LMP_ERR_TRANS_COLLISION);

    // Idle with the request still attached, nothing reported
    assert_eq!(sec_state(&mgr, &peer()), SecState::Idle);
    assert!(results(&state).is_empty());
    assert!(mgr.device(&peer()).unwrap().callback.is_some());
    assert!(!state.borrow().timers.contains_key(&TimerId::Collision));
    assert!(take_commands(&state).is_empty());
}

#[test]
fn test_level4_service_rejected_without_secure_connections() {
    let config = SecurityConfig {
        security_mode: SecurityMode::Sc,
        ..SecurityConfig::default()
    };
    let (mut mgr, state) = setup_with(config);
    state.borrow_mut().supports_sc = true;

    mgr.set_security_level(&ServiceRegistration {
        is_originator: false,
        name: "Serial",
        service_id: 10,
        sec_level: SEC_IN_AUTHENTICATE | SEC_IN_ENCRYPT,
        psm: PSM_SERIAL,
        ..Default::default()
    })
    .unwrap();

    let rc = mgr.l2cap_access_request(&peer(), PSM_SERIAL, false, record_result(&state));
    assert_eq!(rc, SecStatus::Mode4Level4NotSupported);
    assert_eq!(results(&state), vec![(peer(), SecStatus::Mode4Level4NotSupported)]);
    assert!(take_commands(&state).is_empty());
}

#[test]
fn test_temporary_bond_cannot_reach_authenticated_service() {
    let (mut mgr, state) = setup();
    connect_encrypted_legacy_peer(&mut mgr, &state);
    mgr.set_bond_type(&peer(), BondType::Temporary);
    let flags_before = mgr.security_flags(&peer(), Transport::BrEdr);

    // The stored callback is gone by the time it runs
    let seen = state.clone();
    let callback: SecCallback = Box::new(move |mgr, bd_addr, _transport, status| {
        let cleared = mgr.device(&bd_addr).map(|rec| rec.callback.is_none()).unwrap_or(false);
        assert!(cleared);
        seen.borrow_mut().results.push((bd_addr, status));
    });

    let rc = mgr.l2cap_access_req_by_requirement(&peer(), SEC_IN_AUTHENTICATE, false, callback);
    assert_eq!(rc, SecStatus::FailedOnSecurity);
    assert_eq!(results(&state), vec![(peer(), SecStatus::FailedOnSecurity)]);
    assert_eq!(sec_state(&mgr, &peer()), SecState::Idle);
    assert_eq!(mgr.security_flags(&peer(), Transport::BrEdr), flags_before);
    assert!(take_commands(&state).is_empty());
}

#[test]
fn test_set_encryption_on_encrypted_link() {
    let (mut mgr, state) = setup();
    connect_encrypted_legacy_peer(&mut mgr, &state);

    let rc = mgr.set_encryption(&peer(), Transport::BrEdr, Some(record_result(&state)), LeSecAction::None);
    assert_eq!(rc, SecStatus::Success);
    assert_eq!(results(&state), vec![(peer(), SecStatus::Success)]);
    assert!(take_commands(&state).is_empty());

    let rc = mgr.set_encryption(&other_peer(), Transport::BrEdr, None, LeSecAction::None);
    assert_eq!(rc, SecStatus::WrongMode);
}

#[test]
fn test_request_while_busy_is_queued_then_served() {
    let (mut mgr, state) = setup();
    start_authentication(&mut mgr, &state);

    let rc = mgr.mx_access_request(&peer(), true, SEC_OUT_ENCRYPT, record_result(&state));
    assert_eq!(rc, SecStatus::CmdStarted);
    assert_eq!(mgr.pending_request_count(), 1);
    assert!(take_commands(&state).is_empty());

    mgr.on_link_key_notification(&peer(), &[0x33; 16], LKEY_TYPE_UNAUTH_COMB);
    mgr.on_authentication_complete(HANDLE, HCI_SUCCESS);
    assert!(results(&state).is_empty());

    mgr.on_encryption_change(HANDLE, HCI_SUCCESS, true);
    assert_eq!(
        results(&state),
        vec![(peer(), SecStatus::Success), (peer(), SecStatus::Success)]
    );
    assert_eq!(mgr.pending_request_count(), 0);
}

#[test]
fn test_mx_request_waits_for_running_procedure() {
    let (mut mgr, state) = setup();
    connect_encrypted_legacy_peer(&mut mgr, &state);
    mgr.on_remote_host_supported_features(&other_peer(), &[HCI_FEATURE_SSP_HOST_SUPPORTED, 0, 0, 0, 0, 0, 0, 0]);
    mgr.bond(&other_peer(), AddressType::Public, Transport::BrEdr, DeviceType::BREDR, &[]);
    assert_ne!(mgr.pairing_state(), PairingState::Idle);

    // Pairing elsewhere, but the link already satisfies the request
    let rc = mgr.mx_access_request(&peer(), true, SEC_OUT_FLAGS, record_result(&state));
    assert_eq!(rc, SecStatus::Success);
    assert_eq!(results(&state), vec![(peer(), SecStatus::Success)]);

    if let Some(rec) = mgr.devices.find_mut(&peer()) {
        rec.sec_state = SecState::Authenticating;
    }
    let rc = mgr.mx_access_request(&peer(), true, SEC_OUT_FLAGS, record_result(&state));
    assert_eq!(rc, SecStatus::CmdStarted);
    assert_eq!(mgr.pending_request_count(), 1);
    assert_eq!(results(&state).len(), 1);
}

#[test]
fn test_mx_authentication_forces_mitm_upgrade() {
    let (mut mgr, state) = setup();
    connect_ssp_peer(&mut mgr, &state);
    mgr.on_link_key_notification(&peer(), &[0x44; 16], LKEY_TYPE_UNAUTH_COMB);
    if let Some(rec) = mgr.devices.find_mut(&peer()) {
        rec.rmt_io_caps = IO_CAP_IO;
    }

    let rc = mgr.mx_access_request(&peer(), true, SEC_OUT_AUTHENTICATE, record_result(&state));
    assert_eq!(rc, SecStatus::CmdStarted);

    let rec = mgr.device(&peer()).unwrap();
    assert_ne!(rec.security_required & SEC_OUT_MITM, 0);
    assert!(rec.sm4.contains(Sm4::UPGRADE));
    assert!(!rec.is_link_key_known());
    assert_eq!(rec.sec_state, SecState::Authenticating);
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::AuthenticationRequested { handle: HANDLE }]
    );
}

#[test]
fn test_incoming_mx_authentication_forces_mitm_both_ways() {
    let (mut mgr, state) = setup();
    connect_ssp_peer(&mut mgr, &state);
    mgr.on_link_key_notification(&peer(), &[0x44; 16], LKEY_TYPE_UNAUTH_COMB);
    if let Some(rec) = mgr.devices.find_mut(&peer()) {
        rec.rmt_io_caps = IO_CAP_IO;
    }

    let rc = mgr.mx_access_request(
        &peer(),
        false,
        SEC_OUT_AUTHENTICATE | SEC_IN_AUTHENTICATE,
        record_result(&state),
    );
    assert_eq!(rc, SecStatus::CmdStarted);

    let rec = mgr.device(&peer()).unwrap();
    assert_ne!(rec.security_required & SEC_OUT_MITM, 0);
    assert_ne!(rec.security_required & SEC_IN_MITM, 0);
    assert_ne!(rec.required_security_flags_for_pairing & SEC_OUT_MITM, 0);
    assert!(rec.sm4.contains(Sm4::UPGRADE));
    assert_eq!(rec.sec_state, SecState::Authenticating);
}

#[test]
fn test_missing_key_retries_authentication_once() {
    let (mut mgr, state) = setup();
    start_authentication(&mut mgr, &state);
    mgr.on_link_key_notification(&peer(), &[0x55; 16], LKEY_TYPE_UNAUTH_COMB);

    mgr.on_authentication_complete(HANDLE, HCI_ERR_KEY_MISSING);
    let rec = mgr.device(&peer()).unwrap();
    assert!(rec.sm4.contains(Sm4::RETRY));
    assert!(!rec.is_link_key_known());
    assert_eq!(rec.sec_state, SecState::Authenticating);
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::AuthenticationRequested { handle: HANDLE }]
    );
    assert!(results(&state).is_empty());

    mgr.on_authentication_complete(HANDLE, HCI_ERR_KEY_MISSING);
    assert_eq!(results(&state), vec![(peer(), SecStatus::ErrProcessing)]);
}

#[test]
fn test_simple_pairing_success_keeps_watchdog_armed() {
    let (mut mgr, state) = setup();
    mgr.on_io_capability_response(&peer(), IO_CAP_IO, OOB_NONE, AUTH_SP_YES);
    mgr.on_user_confirmation_request(&peer(), 123456);
    assert_eq!(mgr.pairing_state(), PairingState::WaitNumericConfirm);

    mgr.confirm_reply(SecStatus::Success, &peer());
    assert_eq!(mgr.pairing_state(), PairingState::WaitAuthComplete);
    take_commands(&state);

    mgr.on_simple_pairing_complete(HCI_SUCCESS, &peer());
    assert_eq!(mgr.pairing_state(), PairingState::WaitAuthComplete);
    assert!(state.borrow().timers.contains_key(&TimerId::Pairing));
    assert!(mgr.device(&peer()).unwrap().is_authenticated());
    assert!(take_commands(&state).is_empty());

    // Auth complete never shows up, the watchdog frees the pairing
    mgr.on_timer_expired(TimerId::Pairing);
    assert_eq!(mgr.pairing_state(), PairingState::Idle);
    let rc = mgr.bond(&other_peer(), AddressType::Public, Transport::BrEdr, DeviceType::BREDR, &[]);
    assert_eq!(rc, SecStatus::CmdStarted);
}

#[test]
fn test_simple_pairing_failure_stops_watchdog() {
    let (mut mgr, state) = setup();
    connect(&mut mgr, &state, &peer(), false);
    mgr.on_io_capability_response(&peer(), IO_CAP_IO, OOB_NONE, AUTH_SP_YES);
    take_commands(&state);

    mgr.on_simple_pairing_complete(HCI_ERR_AUTH_FAILURE, &peer());
    assert!(!state.borrow().timers.contains_key(&TimerId::Pairing));
    assert_eq!(state.borrow().disconnects, vec![(HANDLE, HCI_ERR_AUTH_FAILURE)]);
}

#[test]
fn test_drained_callback_can_start_next_bond() {
    let (mut mgr, state) = setup();
    let next = BdAddr::new([0x09; 6]);
    connect_encrypted_legacy_peer(&mut mgr, &state);
    mgr.on_remote_host_supported_features(&other_peer(), &[HCI_FEATURE_SSP_HOST_SUPPORTED, 0, 0, 0, 0, 0, 0, 0]);
    let rc = mgr.bond(&other_peer(), AddressType::Public, Transport::BrEdr, DeviceType::BREDR, &[]);
    assert_eq!(rc, SecStatus::CmdStarted);

    // Queue a request behind a running procedure on the peer
    if let Some(rec) = mgr.devices.find_mut(&peer()) {
        rec.sec_state = SecState::Authenticating;
    }
    let seen = state.clone();
    let callback: SecCallback = Box::new(move |mgr, bd_addr, _transport, status| {
        seen.borrow_mut().results.push((bd_addr, status));
        let rc = mgr.bond(&next, AddressType::Public, Transport::BrEdr, DeviceType::BREDR, &[]);
        assert_eq!(rc, SecStatus::CmdStarted);
    });
    let rc = mgr.mx_access_request(&peer(), true, SEC_OUT_FLAGS, callback);
    assert_eq!(rc, SecStatus::CmdStarted);
    assert_eq!(mgr.pending_request_count(), 1);
    if let Some(rec) = mgr.devices.find_mut(&peer()) {
        rec.sec_state = SecState::Idle;
    }

    mgr.on_timer_expired(TimerId::Pairing);

    assert_eq!(results(&state), vec![(peer(), SecStatus::Success)]);
    assert_eq!(mgr.pairing_state(), PairingState::GetRemName);
    assert_eq!(mgr.pairing_bd_addr(), next);
    assert!(state.borrow().timers.contains_key(&TimerId::Pairing));
    assert_eq!(mgr.bond_cancel(&other_peer()), SecStatus::UnknownAddr);
}

#[test]
fn test_disconnect_fails_pending_request() {
    let (mut mgr, state) = setup();
    start_authentication(&mut mgr, &state);

    mgr.on_disconnection_complete(HANDLE, HCI_ERR_PEER_USER);
    assert_eq!(results(&state), vec![(peer(), SecStatus::ErrProcessing)]);

    let rec = mgr.device(&peer()).unwrap();
    assert_eq!(rec.sec_state, SecState::Idle);
    assert!(!rec.has_handle());
    assert!(!rec.is_authenticated());
}

#[test]
fn test_disconnect_deferred_during_dedicated_bonding() {
    let (mut mgr, state) = setup();
    connect_ssp_peer(&mut mgr, &state);
    mgr.bond(&peer(), AddressType::Public, Transport::BrEdr, DeviceType::BREDR, &[]);

    assert_eq!(mgr.disconnect(HANDLE, HCI_ERR_PEER_USER), SecStatus::Busy);
    assert!(state.borrow().disconnects.is_empty());

    assert_eq!(mgr.disconnect(0x0099, HCI_ERR_PEER_USER), SecStatus::Success);
    assert_eq!(state.borrow().disconnects, vec![(0x0099, HCI_ERR_PEER_USER)]);
}

#[test]
fn test_passkey_reply_out_of_range() {
    let (mut mgr, state) = setup();
    mgr.on_io_capability_response(&peer(), IO_CAP_IN, OOB_NONE, AUTH_SP_YES);
    assert_eq!(mgr.pairing_state(), PairingState::IncomingSsp);

    mgr.on_user_passkey_request(&peer());
    assert_eq!(mgr.pairing_state(), PairingState::KeyEntry);
    take_commands(&state);

    mgr.passkey_reply(SecStatus::Success, &peer(), MAX_PASSKEY_VAL + 1);
    assert_eq!(mgr.pairing_state(), PairingState::WaitAuthComplete);
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::UserPasskeyRequestNegReply { bd_addr: peer() }]
    );
}

#[test]
fn test_passkey_reply_in_range() {
    let (mut mgr, state) = setup();
    mgr.on_io_capability_response(&peer(), IO_CAP_IN, OOB_NONE, AUTH_SP_YES);
    mgr.on_user_passkey_request(&peer());
    take_commands(&state);

    // Replies for another peer are ignored
    mgr.passkey_reply(SecStatus::Success, &other_peer(), 1234);
    assert_eq!(mgr.pairing_state(), PairingState::KeyEntry);

    mgr.passkey_reply(SecStatus::Success, &peer(), 123456);
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::UserPasskeyRequestReply {
            bd_addr: peer(),
            passkey: 123456
        }]
    );
}

fn start_peer_pin_request(mgr: &mut SecurityManager, state: &Shared) {
    mgr.add_device(&peer(), DeviceClass::EMPTY, Some("Headset"), None, 0);
    mgr.on_pin_code_request(&peer());
    assert_eq!(mgr.pairing_state(), PairingState::WaitLocalPin);
    assert_eq!(state.borrow().pin_requests, vec![(peer(), false)]);
    take_commands(state);
}

#[test]
fn test_pin_reply_rejects_bad_length() {
    for pin in [&b""[..], &[b'1'; PIN_CODE_LEN + 1][..]] {
        let (mut mgr, state) = setup();
        start_peer_pin_request(&mut mgr, &state);

        mgr.pin_code_reply(&peer(), SecStatus::Success, pin);
        assert_eq!(mgr.pairing_state(), PairingState::WaitAuthComplete);
        assert_eq!(
            take_commands(&state),
            vec![HciCommand::PinCodeRequestNegReply { bd_addr: peer() }]
        );
    }
}

#[test]
fn test_pin_reply_sent_to_controller() {
    let (mut mgr, state) = setup();
    start_peer_pin_request(&mut mgr, &state);

    mgr.pin_code_reply(&peer(), SecStatus::Success, b"0000");
    assert_eq!(mgr.pairing_state(), PairingState::WaitAuthComplete);
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::PinCodeRequestReply {
            bd_addr: peer(),
            pin: b"0000".to_vec()
        }]
    );
    assert_eq!(mgr.device(&peer()).unwrap().pin_code_length, 4);
}

#[test]
fn test_pin_request_times_out() {
    let (mut mgr, state) = setup();
    start_peer_pin_request(&mut mgr, &state);
    assert!(state.borrow().timers.contains_key(&TimerId::Pairing));

    mgr.on_timer_expired(TimerId::Pairing);
    assert_eq!(mgr.pairing_state(), PairingState::Idle);
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::PinCodeRequestNegReply { bd_addr: peer() }]
    );
    assert_eq!(
        state.borrow().auth_completes,
        vec![(peer(), HCI_ERR_CONNECTION_TOUT)]
    );
}

#[test]
fn test_fixed_pin_answers_without_application() {
    let config = SecurityConfig {
        pin_type: PinType::Fixed,
        fixed_pin: b"1234".to_vec(),
        ..SecurityConfig::default()
    };
    let (mut mgr, state) = setup_with(config);

    mgr.on_pin_code_request(&peer());
    assert_eq!(mgr.pairing_state(), PairingState::WaitAuthComplete);
    assert!(state.borrow().pin_requests.is_empty());
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::PinCodeRequestReply {
            bd_addr: peer(),
            pin: b"1234".to_vec()
        }]
    );
}

#[test]
fn test_link_key_request_with_stored_key() {
    let (mut mgr, state) = setup();
    mgr.add_device(
        &peer(),
        DeviceClass::EMPTY,
        None,
        Some(([0x77; 16], LinkKeyType::AuthenticatedCombination)),
        0,
    );

    let params = peer().as_slice().to_vec();
    mgr.handle_hci_event(&HciEvent::new(EVT_LINK_KEY_REQUEST, params))
        .unwrap();
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::LinkKeyRequestReply {
            bd_addr: peer(),
            link_key: [0x77; 16]
        }]
    );

    mgr.on_link_key_request(&other_peer());
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::LinkKeyRequestNegReply { bd_addr: other_peer() }]
    );
}

#[test]
fn test_unexpected_event_is_an_error() {
    let (mut mgr, _state) = setup();
    let result = mgr.handle_hci_event(&HciEvent::new(0x3E, vec![0x02]));
    assert!(matches!(
        result,
        Err(crate::error::SecError::Hci(crate::error::HciError::UnexpectedEvent(0x3E)))
    ));
}

#[test]
fn test_connection_request_decisions() {
    let (mut mgr, state) = setup();
    let dev_class = DeviceClass([0x04, 0x04, 0x20]);

    assert_eq!(mgr.on_connection_request(&peer(), dev_class), ConnRequestDecision::Accept);
    assert!(mgr.device(&peer()).unwrap().sm4.contains(Sm4::CONN_PEND));

    state.borrow_mut().controller_ready = false;
    assert_eq!(
        mgr.on_connection_request(&other_peer(), dev_class),
        ConnRequestDecision::Reject(HCI_ERR_HOST_REJECT_DEVICE)
    );
    assert_eq!(
        take_commands(&state),
        vec![HciCommand::RejectConnectionRequest {
            bd_addr: other_peer(),
            reason: HCI_ERR_HOST_REJECT_DEVICE
        }]
    );
}

#[test]
fn test_connection_from_bonding_peer_is_rejected() {
    let (mut mgr, state) = setup();
    mgr.on_remote_host_supported_features(&peer(), &[HCI_FEATURE_SSP_HOST_SUPPORTED, 0, 0, 0, 0, 0, 0, 0]);
    mgr.bond(&peer(), AddressType::Public, Transport::BrEdr, DeviceType::BREDR, &[]);
    take_commands(&state);

    assert_eq!(
        mgr.on_connection_request(&peer(), DeviceClass::EMPTY),
        ConnRequestDecision::Reject(HCI_ERR_HOST_REJECT_DEVICE)
    );
    assert_eq!(mgr.pairing_state(), PairingState::WaitPinReq);
}

#[test]
fn test_secure_connections_downgrade_disconnects() {
    let (mut mgr, state) = setup();
    connect(&mut mgr, &state, &peer(), false);
    mgr.platform
        .properties
        .set_remote_supports_secure_connections(&peer(), true);

    mgr.set_peer_sec_caps(HANDLE, true, false, true, true, false);
    assert_eq!(state.borrow().disconnects, vec![(HANDLE, HCI_ERR_AUTH_FAILURE)]);
    assert_eq!(sec_state(&mgr, &peer()), SecState::Disconnecting);
    assert!(!mgr.device(&peer()).unwrap().remote_feature_received);
}

#[test]
fn test_session_key_size_downgrade() {
    let (mut mgr, state) = setup();
    connect(&mut mgr, &state, &peer(), false);

    assert!(!mgr.is_session_key_size_downgrade(HANDLE, 7));
    mgr.update_session_key_size(HANDLE, 16);
    assert!(mgr.is_session_key_size_downgrade(HANDLE, 7));
    assert!(!mgr.is_session_key_size_downgrade(HANDLE, 16));
}

#[test]
fn test_reset_registers_rfcomm_multiplexor() {
    let (mut mgr, _state) = setup();
    mgr.dev_reset();

    let srec = mgr.services.find_first(true, PSM_RFCOMM).unwrap();
    assert_eq!(srec.service_id, SEC_SERVICE_RFC_MUX);
    assert_eq!(srec.security_flags, SEC_IN_USE);
    assert_eq!(mgr.security_mode(), SecurityMode::Sp);

    let (mut mgr, state) = setup();
    state.borrow_mut().supports_ssp = false;
    mgr.dev_reset();
    assert_eq!(mgr.security_mode(), SecurityMode::Service);
    assert!(mgr.services.find_first(true, PSM_RFCOMM).is_none());
}

#[test]
fn test_remote_name_observers() {
    let (mut mgr, _state) = setup();
    let names = Rc::new(RefCell::new(Vec::new()));

    let seen = names.clone();
    let id = mgr
        .add_remote_name_callback(Box::new(move |bd_addr, _dev_class, name| {
            seen.borrow_mut().push((*bd_addr, name.to_string()));
        }))
        .unwrap();
    assert!(mgr.add_remote_name_callback(Box::new(|_, _, _| {})).is_some());
    assert!(mgr.add_remote_name_callback(Box::new(|_, _, _| {})).is_none());

    mgr.add_device(&peer(), DeviceClass::EMPTY, None, None, 0);
    mgr.on_remote_name_complete(Some(&peer()), "Keyboard", HCI_SUCCESS);
    assert_eq!(*names.borrow(), vec![(peer(), "Keyboard".to_string())]);
    assert_eq!(mgr.device(&peer()).unwrap().name, "Keyboard");

    assert!(mgr.delete_remote_name_callback(id));
    assert!(!mgr.delete_remote_name_callback(id));
}

#[test]
fn test_service_registry_merges_directions() {
    let mut registry = ServiceRegistry::new(4);
    let mut registration = ServiceRegistration {
        is_originator: false,
        name: "Serial Port",
        service_id: 7,
        sec_level: SEC_IN_AUTHENTICATE | SEC_IN_ENCRYPT,
        psm: PSM_SERIAL,
        ..Default::default()
    };
    registry.set_security_level(&registration, true).unwrap();
    assert_eq!(
        registry.find_first(false, PSM_SERIAL).unwrap().security_flags,
        SEC_IN_AUTHENTICATE | SEC_IN_ENCRYPT | SEC_IN_MITM | SEC_IN_USE
    );

    registration.is_originator = true;
    registration.sec_level = SEC_OUT_ENCRYPT;
    registry.set_security_level(&registration, true).unwrap();
    assert_eq!(registry.iter().count(), 1);

    let srec = registry.find_first(true, PSM_SERIAL).unwrap();
    assert_eq!(
        srec.security_flags,
        SEC_IN_AUTHENTICATE | SEC_IN_ENCRYPT | SEC_IN_MITM | SEC_OUT_ENCRYPT | SEC_OUT_AUTHENTICATE | SEC_IN_USE
    );
    assert_eq!(srec.orig_service_name, "Serial Port");
    assert_eq!(srec.term_service_name, "Serial Port");
}

#[test]
fn test_service_registry_capacity_and_clear() {
    let mut registry = ServiceRegistry::new(2);
    let sdp = ServiceRegistration {
        name: "SDP",
        psm: PSM_SDP,
        ..Default::default()
    };
    let serial = ServiceRegistration {
        name: "Serial",
        service_id: 9,
        psm: PSM_SERIAL,
        sec_level: SEC_IN_AUTHENTICATE,
        ..Default::default()
    };
    let extra = ServiceRegistration {
        name: "Extra",
        service_id: 11,
        psm: 0x1003,
        ..Default::default()
    };

    registry.set_security_level(&sdp, false).unwrap();
    registry.set_security_level(&serial, false).unwrap();
    assert!(matches!(
        registry.set_security_level(&extra, false),
        Err(crate::error::SecError::NoServiceRecords)
    ));

    assert_eq!(registry.clear_service(0), 1);
    assert_eq!(registry.iter().count(), 1);
    assert!(registry.find_first(false, PSM_SDP).is_some());
    assert_eq!(registry.clear_service_by_psm(PSM_SDP), 1);
    assert_eq!(registry.iter().count(), 0);
}

#[test]
fn test_service_registry_keeps_invalid_psm() {
    let mut registry = ServiceRegistry::new(4);
    let reg = ServiceRegistration {
        name: "Raw",
        service_id: 12,
        psm: 0,
        sec_level: SEC_IN_ENCRYPT,
        ..Default::default()
    };
    assert!(!crate::l2cap::is_valid_psm(reg.psm));

    // Only logged, the caller owns the PSM space
    registry.set_security_level(&reg, false).unwrap();
    let srec = registry.find_first(false, 0).unwrap();
    assert_eq!(srec.security_flags, SEC_IN_ENCRYPT | SEC_IN_AUTHENTICATE | SEC_IN_USE);
}

#[test]
fn test_device_store_evicts_unbonded_first() {
    let mut store = DeviceStore::new(2);
    let bonded = BdAddr::new([1, 0, 0, 0, 0, 0]);
    let casual = BdAddr::new([2, 0, 0, 0, 0, 0]);
    let newcomer = BdAddr::new([3, 0, 0, 0, 0, 0]);

    store.find_or_alloc(&bonded).sec_flags |= SecFlags::LINK_KEY_KNOWN;
    store.find_or_alloc(&casual);
    store.find_or_alloc(&newcomer);

    assert_eq!(store.len(), 2);
    assert!(store.find(&bonded).is_some());
    assert!(store.find(&casual).is_none());
    assert!(store.find(&newcomer).is_some());
}

#[test]
fn test_device_store_keeps_connected_records() {
    let mut store = DeviceStore::new(2);
    let first = BdAddr::new([1, 0, 0, 0, 0, 0]);
    let second = BdAddr::new([2, 0, 0, 0, 0, 0]);
    let third = BdAddr::new([3, 0, 0, 0, 0, 0]);

    store.find_or_alloc(&first).hci_handle = HANDLE;
    store.find_or_alloc(&second).sec_flags |= SecFlags::LINK_KEY_KNOWN;
    store.find_or_alloc(&third);

    assert!(store.find(&first).is_some());
    assert!(store.find(&second).is_none());
    assert_eq!(store.find_by_handle(HANDLE).map(|rec| rec.bd_addr), Some(first));
}

#[test]
fn test_pending_queue_keeps_order() {
    let mut queue = PendingQueue::new();
    for bd_addr in [peer(), other_peer(), peer()] {
        queue.push(PendingRequest::Encryption {
            bd_addr,
            transport: Transport::BrEdr,
            sec_act: LeSecAction::None,
            callback: None,
        });
    }

    let taken = queue.take_matching(|request| *request.bd_addr() == peer());
    assert_eq!(taken.len(), 2);
    assert_eq!(queue.len(), 1);
    assert_eq!(*queue.take_all()[0].bd_addr(), other_peer());
    assert!(queue.is_empty());
}
