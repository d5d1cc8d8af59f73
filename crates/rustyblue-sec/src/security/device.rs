//! Device security records and their bounded store

use super::constants::*;
use super::types::*;
use crate::gap::{BdAddr, DeviceClass, DeviceType, Transport};
use crate::hci::constants::HCI_INVALID_HANDLE;
use crate::hci::LINK_KEY_LEN;
use log::debug;

/// Security state kept for one peer
pub struct DeviceSecurityRecord {
    /// Peer address, the record key
    pub bd_addr: BdAddr,

    pub dev_class: DeviceClass,

    /// Remote name, valid when `NAME_KNOWN` is set
    pub name: String,

    pub device_type: DeviceType,

    /// BR/EDR connection handle
    pub hci_handle: u16,

    /// LE connection handle
    pub ble_hci_handle: u16,

    /// BR/EDR security flags
    pub sec_flags: SecFlags,

    /// LE security flags
    pub ble_sec_flags: SecFlags,

    pub link_key: [u8; LINK_KEY_LEN],
    pub link_key_type: LinkKeyType,
    pub pin_code_length: u8,
    pub enc_key_size: u8,

    /// Simple pairing support of the peer
    pub sm4: Sm4,

    /// Running procedure
    pub sec_state: SecState,

    /// Requirements of the request being served
    pub security_required: u16,

    /// Requirements remembered for the pairing started on behalf of the request
    pub required_security_flags_for_pairing: u16,

    /// We initiated the request being served
    pub is_originator: bool,

    /// Completion callback of the request being served
    pub callback: Option<SecCallback>,

    pub bond_type: BondType,

    /// Remote IO capability, `IO_CAP_UNKNOWN` until the exchange
    pub rmt_io_caps: u8,
    pub rmt_auth_req: u8,

    pub remote_supports_secure_connections: bool,
    pub remote_supports_bredr: bool,
    pub remote_supports_ble: bool,
    pub remote_supports_role_switch: bool,
    pub remote_feature_received: bool,

    /// IO capability request deferred until remote features arrive
    pub remote_features_needed: bool,

    /// Link key notification held back until the name is known
    pub link_key_not_sent: bool,

    pub new_encryption_key_is_p256: bool,

    /// Allocation ordinal, refreshed on use
    pub timestamp: u64,
}

impl DeviceSecurityRecord {
    /// Create a blank record for a peer
    pub fn new(bd_addr: BdAddr) -> Self {
        Self {
            bd_addr,
            dev_class: DeviceClass::EMPTY,
            name: String::new(),
            device_type: DeviceType::BREDR,
            hci_handle: HCI_INVALID_HANDLE,
            ble_hci_handle: HCI_INVALID_HANDLE,
            sec_flags: SecFlags::empty(),
            ble_sec_flags: SecFlags::empty(),
            link_key: [0; LINK_KEY_LEN],
            link_key_type: LinkKeyType::Ignore,
            pin_code_length: 0,
            enc_key_size: 0,
            sm4: Sm4::empty(),
            sec_state: SecState::Idle,
            security_required: SEC_NONE,
            required_security_flags_for_pairing: SEC_NONE,
            is_originator: false,
            callback: None,
            bond_type: BondType::Unknown,
            rmt_io_caps: IO_CAP_UNKNOWN,
            rmt_auth_req: AUTH_SP_NO,
            remote_supports_secure_connections: false,
            remote_supports_bredr: false,
            remote_supports_ble: false,
            remote_supports_role_switch: false,
            remote_feature_received: false,
            remote_features_needed: false,
            link_key_not_sent: false,
            new_encryption_key_is_p256: false,
            timestamp: 0,
        }
    }

    /// Flags of one transport
    pub fn flags(&self, transport: Transport) -> SecFlags {
        match transport {
            Transport::BrEdr => self.sec_flags,
            Transport::Le => self.ble_sec_flags,
        }
    }

    pub fn flags_mut(&mut self, transport: Transport) -> &mut SecFlags {
        match transport {
            Transport::BrEdr => &mut self.sec_flags,
            Transport::Le => &mut self.ble_sec_flags,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.sec_flags.contains(SecFlags::AUTHENTICATED)
    }

    pub fn is_encrypted(&self) -> bool {
        self.sec_flags.contains(SecFlags::ENCRYPTED)
    }

    pub fn is_link_key_known(&self) -> bool {
        self.sec_flags.contains(SecFlags::LINK_KEY_KNOWN)
    }

    pub fn is_link_key_authed(&self) -> bool {
        self.sec_flags.contains(SecFlags::LINK_KEY_AUTHED)
    }

    pub fn is_name_known(&self) -> bool {
        self.sec_flags.contains(SecFlags::NAME_KNOWN)
    }

    pub fn is_16_digit_pin_authed(&self) -> bool {
        self.sec_flags.contains(SecFlags::PIN_16_DIGIT_AUTHED)
    }

    pub fn has_handle(&self) -> bool {
        self.hci_handle != HCI_INVALID_HANDLE
    }

    pub fn handle(&self, transport: Transport) -> u16 {
        match transport {
            Transport::BrEdr => self.hci_handle,
            Transport::Le => self.ble_hci_handle,
        }
    }

    /// Connected on either transport
    pub fn is_connected(&self) -> bool {
        self.hci_handle != HCI_INVALID_HANDLE || self.ble_hci_handle != HCI_INVALID_HANDLE
    }

    pub fn is_bond_type_temporary(&self) -> bool {
        self.bond_type == BondType::Temporary
    }

    /// Bonded on either transport
    pub fn is_bonded(&self) -> bool {
        self.ble_sec_flags.contains(SecFlags::LINK_KEY_KNOWN) || self.is_link_key_known()
    }

    /// Class, name and address snapshot used for application callbacks
    pub fn identity(&self) -> (BdAddr, DeviceClass, String) {
        (self.bd_addr, self.dev_class, self.name.clone())
    }
}

/// Bounded collection of device records.
///
/// When full, admitting a new peer evicts the oldest record that is not
/// connected, has no pending callback and holds no link key. Failing that the
/// oldest disconnected record goes, and as a last resort the oldest overall.
pub struct DeviceStore {
    records: Vec<DeviceSecurityRecord>,
    capacity: usize,
    next_ordinal: u64,
}

impl DeviceStore {
    /// Create an empty store holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            capacity: capacity.max(1),
            next_ordinal: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn position(&self, bd_addr: &BdAddr) -> Option<usize> {
        self.records.iter().position(|rec| rec.bd_addr == *bd_addr)
    }

    pub fn find(&self, bd_addr: &BdAddr) -> Option<&DeviceSecurityRecord> {
        self.records.iter().find(|rec| rec.bd_addr == *bd_addr)
    }

    pub fn find_mut(&mut self, bd_addr: &BdAddr) -> Option<&mut DeviceSecurityRecord> {
        self.records.iter_mut().find(|rec| rec.bd_addr == *bd_addr)
    }

    /// Lookup by BR/EDR or LE connection handle
    pub fn find_by_handle(&self, handle: u16) -> Option<&DeviceSecurityRecord> {
        if handle == HCI_INVALID_HANDLE {
            return None;
        }
        self.records
            .iter()
            .find(|rec| rec.hci_handle == handle || rec.ble_hci_handle == handle)
    }

    pub fn find_by_handle_mut(&mut self, handle: u16) -> Option<&mut DeviceSecurityRecord> {
        if handle == HCI_INVALID_HANDLE {
            return None;
        }
        self.records
            .iter_mut()
            .find(|rec| rec.hci_handle == handle || rec.ble_hci_handle == handle)
    }

    /// Address of the first record in the given procedure state
    pub fn find_first_in_state(&self, state: SecState) -> Option<BdAddr> {
        self.records
            .iter()
            .find(|rec| rec.sec_state == state)
            .map(|rec| rec.bd_addr)
    }

    /// Existing record, or a freshly allocated one
    pub fn find_or_alloc(&mut self, bd_addr: &BdAddr) -> &mut DeviceSecurityRecord {
        let index = match self.position(bd_addr) {
            Some(index) => index,
            None => self.alloc(bd_addr),
        };
        &mut self.records[index]
    }

    fn alloc(&mut self, bd_addr: &BdAddr) -> usize {
        if self.records.len() >= self.capacity {
            let victim = self.eviction_candidate();
            let evicted = self.records.swap_remove(victim);
            debug!("Device store full, evicting {}", evicted.bd_addr);
        }

        let mut rec = DeviceSecurityRecord::new(*bd_addr);
        rec.timestamp = self.next_ordinal();
        self.records.push(rec);
        self.records.len() - 1
    }

    fn eviction_candidate(&self) -> usize {
        self.oldest_matching(|rec| !rec.is_connected() && rec.callback.is_none() && !rec.is_bonded())
            .or_else(|| self.oldest_matching(|rec| !rec.is_connected()))
            .or_else(|| self.oldest_matching(|_| true))
            .unwrap_or(0)
    }

    fn oldest_matching<F>(&self, filter: F) -> Option<usize>
    where
        F: Fn(&DeviceSecurityRecord) -> bool,
    {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, rec)| filter(rec))
            .min_by_key(|(_, rec)| rec.timestamp)
            .map(|(index, _)| index)
    }

    fn next_ordinal(&mut self) -> u64 {
        self.next_ordinal += 1;
        self.next_ordinal
    }

    /// Mark a record as recently used
    pub fn touch(&mut self, bd_addr: &BdAddr) {
        let ordinal = self.next_ordinal();
        if let Some(rec) = self.find_mut(bd_addr) {
            rec.timestamp = ordinal;
        }
    }

    pub fn remove(&mut self, bd_addr: &BdAddr) -> Option<DeviceSecurityRecord> {
        let index = self.position(bd_addr)?;
        Some(self.records.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceSecurityRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceSecurityRecord> {
        self.records.iter_mut()
    }
}
