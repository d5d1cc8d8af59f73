//! Collaborators of the security manager
//!
//! The manager owns no transport, link layer, timer wheel or storage. The host
//! stack provides them through the traits below, bundled in a [`Platform`].

use super::types::{LinkKeyType, SecStatus, SpEvent};
use crate::gap::{BdAddr, DeviceClass, Role, Transport};
use crate::hci::{HciCommand, LINK_KEY_LEN};
use std::collections::HashMap;
use std::time::Duration;

/// Fire and forget channel towards the controller
pub trait HciSink {
    fn send(&mut self, command: HciCommand);
}

/// Link layer services used by the security manager
pub trait AclLinks {
    /// Whether an ACL link to the peer is up on the transport
    fn is_link_up(&self, bd_addr: &BdAddr, transport: Transport) -> bool;

    /// Connection handle of the link, if any
    fn handle(&self, bd_addr: &BdAddr, transport: Transport) -> Option<u16>;

    /// Our role on the BR/EDR link
    fn role(&self, bd_addr: &BdAddr) -> Option<Role>;

    /// Open an ACL link for dedicated bonding.
    ///
    /// Returns `Success` when a new link is being paged for the bonding,
    /// `CmdStarted` when a link to the peer is already being set up and
    /// `NoResources` when no link can be created.
    fn connect_for_security(&mut self, bd_addr: &BdAddr) -> SecStatus;

    /// Tear down the link with the given handle
    fn disconnect(&mut self, handle: u16, reason: u8);

    /// Mark the link as used for bonding so L2CAP keeps it idle
    fn set_bonding(&mut self, bd_addr: &BdAddr, bonding: bool);

    /// Start the idle timer that drops a bonding-only link
    fn start_post_bond_timer(&mut self, handle: u16);

    /// Resubmit L2CAP channel security checks parked for the peer (or all peers)
    fn resubmit_pending_sec_requests(&mut self, bd_addr: Option<&BdAddr>);

    /// Extend link timeouts while the user enters a PIN
    fn pin_code_request(&mut self, bd_addr: &BdAddr);

    /// Whether the peer exposes the SMP fixed channel on BR/EDR
    fn peer_supports_smp_over_br(&self, bd_addr: &BdAddr) -> bool;

    /// Start cross transport key derivation over BR/EDR
    fn start_smp_over_br(&mut self, bd_addr: &BdAddr);
}

/// Local controller capabilities
pub trait Controller {
    fn is_ready(&self) -> bool;
    fn supports_simple_pairing(&self) -> bool;
    fn supports_secure_connections(&self) -> bool;
}

/// Persistent per-device properties
pub trait DevicePropertyStore {
    fn remote_supports_secure_connections(&self, bd_addr: &BdAddr) -> Option<bool>;
    fn set_remote_supports_secure_connections(&mut self, bd_addr: &BdAddr, supported: bool);
    fn remote_max_session_key_size(&self, bd_addr: &BdAddr) -> Option<u8>;
    fn set_remote_max_session_key_size(&mut self, bd_addr: &BdAddr, size: u8);
}

/// In-memory implementation of DevicePropertyStore
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    secure_connections: HashMap<BdAddr, bool>,
    key_sizes: HashMap<BdAddr, u8>,
}

impl MemoryPropertyStore {
    /// Create a new empty property store
    pub fn new() -> Self {
        Self::default()
    }
}

impl DevicePropertyStore for MemoryPropertyStore {
    fn remote_supports_secure_connections(&self, bd_addr: &BdAddr) -> Option<bool> {
        self.secure_connections.get(bd_addr).copied()
    }

    fn set_remote_supports_secure_connections(&mut self, bd_addr: &BdAddr, supported: bool) {
        self.secure_connections.insert(*bd_addr, supported);
    }

    fn remote_max_session_key_size(&self, bd_addr: &BdAddr) -> Option<u8> {
        self.key_sizes.get(bd_addr).copied()
    }

    fn set_remote_max_session_key_size(&mut self, bd_addr: &BdAddr, size: u8) {
        self.key_sizes.insert(*bd_addr, size);
    }
}

/// Timers owned by the security manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Pairing watchdog
    Pairing,
    /// LMP collision retry
    Collision,
    /// Retry bonding once a rejected incoming link is gone
    ConnectAfterReject,
    /// Deferred Authentication Requested for a peer
    AuthDelay(BdAddr),
}

/// Monotonic clock and one shot timers.
///
/// Scheduling an already armed timer restarts it. Expiry is reported back
/// through [`SecurityManager::on_timer_expired`](super::SecurityManager::on_timer_expired).
pub trait SecTimers {
    fn now_ms(&self) -> u64;
    fn schedule(&mut self, id: TimerId, delay: Duration);
    fn cancel(&mut self, id: TimerId);
}

/// Application callbacks.
///
/// Every method has an empty default so integrators implement only what they use.
pub trait SecurityCallbacks {
    /// Ask the user for a PIN, answered with `pin_code_reply`
    fn pin_request(
        &mut self,
        _bd_addr: &BdAddr,
        _dev_class: DeviceClass,
        _name: &str,
        _min_16_digit: bool,
    ) {
    }

    /// A new link key must be stored
    fn link_key(
        &mut self,
        _bd_addr: &BdAddr,
        _dev_class: DeviceClass,
        _name: &str,
        _link_key: &[u8; LINK_KEY_LEN],
        _key_type: LinkKeyType,
        _is_ctkd: bool,
    ) {
    }

    /// Pairing finished with an HCI status
    fn auth_complete(&mut self, _bd_addr: &BdAddr, _dev_class: DeviceClass, _name: &str, _reason: u8) {}

    /// Result of `bond_cancel`
    fn bond_cancel_complete(&mut self, _status: SecStatus) {}

    /// Simple pairing event.
    ///
    /// Returning `NotAuthorized` rejects the request right away. Anything else
    /// means the application answers later through the reply methods. For an
    /// IO capability request the application may edit the event in place.
    fn simple_pairing(&mut self, _event: &mut SpEvent) -> SecStatus {
        SecStatus::Success
    }

    /// A bonded peer started pairing again, its old bond should be removed
    fn remove_bonded_device(&mut self, _bd_addr: &BdAddr) {}
}

/// Collaborators handed to the manager at construction
pub struct Platform {
    pub hci: Box<dyn HciSink>,
    pub acl: Box<dyn AclLinks>,
    pub controller: Box<dyn Controller>,
    pub properties: Box<dyn DevicePropertyStore>,
    pub timers: Box<dyn SecTimers>,
}
