//! Type definitions for the BR/EDR Security Manager

use super::constants::*;
use super::manager::SecurityManager;
use crate::gap::{BdAddr, DeviceClass, Transport};
use crate::hci::LINK_KEY_LEN;
use bitflags::bitflags;
use std::fmt;

/// Outcome of a security request or procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecStatus {
    /// Requirements satisfied
    Success,
    /// Service needs no security at all
    SuccessNoSecurity,
    /// Procedure running, the callback fires later
    CmdStarted,
    /// Request deferred behind another procedure
    Busy,
    /// Link not up, or a procedure is not applicable in the current state
    WrongMode,
    NoResources,
    IllegalAction,
    IllegalValue,
    /// Policy rejected the access
    FailedOnSecurity,
    /// Secure Connections Only is not available on one of the two sides
    Mode4Level4NotSupported,
    DeviceTimeout,
    /// Generic failure delivered to a waiting callback
    ErrProcessing,
    UnknownAddr,
    /// Returned by an application callback to reject a request right away
    NotAuthorized,
    /// No service registered for the requested PSM
    ModeUnsupported,
    /// Peer is expected to start security first
    DelayCheck,
}

impl SecStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SecStatus::Success | SecStatus::SuccessNoSecurity)
    }
}

impl fmt::Display for SecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecStatus::Success => write!(f, "Success"),
            SecStatus::SuccessNoSecurity => write!(f, "Success (no security)"),
            SecStatus::CmdStarted => write!(f, "Command started"),
            SecStatus::Busy => write!(f, "Busy"),
            SecStatus::WrongMode => write!(f, "Wrong mode"),
            SecStatus::NoResources => write!(f, "No resources"),
            SecStatus::IllegalAction => write!(f, "Illegal action"),
            SecStatus::IllegalValue => write!(f, "Illegal value"),
            SecStatus::FailedOnSecurity => write!(f, "Failed on security"),
            SecStatus::Mode4Level4NotSupported => write!(f, "Mode 4 level 4 not supported"),
            SecStatus::DeviceTimeout => write!(f, "Device timeout"),
            SecStatus::ErrProcessing => write!(f, "Error processing"),
            SecStatus::UnknownAddr => write!(f, "Unknown address"),
            SecStatus::NotAuthorized => write!(f, "Not authorized"),
            SecStatus::ModeUnsupported => write!(f, "Mode unsupported"),
            SecStatus::DelayCheck => write!(f, "Delay check"),
        }
    }
}

/// Local security mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Legacy service level enforced security
    Service,
    /// Secure simple pairing
    Sp,
    /// Secure Connections only
    Sc,
}

impl SecurityMode {
    /// Simple pairing is in use (SP or SC)
    pub fn is_ssp(&self) -> bool {
        matches!(self, SecurityMode::Sp | SecurityMode::Sc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinType {
    Variable,
    Fixed,
}

impl PinType {
    pub fn to_u8(&self) -> u8 {
        match self {
            PinType::Variable => crate::hci::constants::HCI_PIN_TYPE_VARIABLE,
            PinType::Fixed => crate::hci::constants::HCI_PIN_TYPE_FIXED,
        }
    }
}

/// IO capability of a device taking part in simple pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    NoInputNoOutput,
}

impl IoCapability {
    pub fn to_u8(&self) -> u8 {
        match self {
            IoCapability::DisplayOnly => IO_CAP_OUT,
            IoCapability::DisplayYesNo => IO_CAP_IO,
            IoCapability::KeyboardOnly => IO_CAP_IN,
            IoCapability::NoInputNoOutput => IO_CAP_NONE,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            IO_CAP_OUT => Some(IoCapability::DisplayOnly),
            IO_CAP_IO => Some(IoCapability::DisplayYesNo),
            IO_CAP_IN => Some(IoCapability::KeyboardOnly),
            IO_CAP_NONE => Some(IoCapability::NoInputNoOutput),
            _ => None,
        }
    }

    /// Whether pairing between `remote` and `local` can yield an authenticated key
    pub fn can_authenticate(remote: IoCapability, local: IoCapability) -> bool {
        IO_CAP_AUTH_MAP[remote.to_u8() as usize][local.to_u8() as usize]
    }
}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCapability::DisplayOnly => write!(f, "Display Only"),
            IoCapability::DisplayYesNo => write!(f, "Display Yes/No"),
            IoCapability::KeyboardOnly => write!(f, "Keyboard Only"),
            IoCapability::NoInputNoOutput => write!(f, "No Input No Output"),
        }
    }
}

/// BR/EDR link key type as reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKeyType {
    Combination,
    LocalUnit,
    RemoteUnit,
    DebugCombination,
    UnauthenticatedCombination,
    AuthenticatedCombination,
    ChangedCombination,
    UnauthenticatedCombinationP256,
    AuthenticatedCombinationP256,
    /// No usable key
    Ignore,
}

impl LinkKeyType {
    pub fn to_u8(&self) -> u8 {
        match self {
            LinkKeyType::Combination => LKEY_TYPE_COMBINATION,
            LinkKeyType::LocalUnit => LKEY_TYPE_LOCAL_UNIT,
            LinkKeyType::RemoteUnit => LKEY_TYPE_REMOTE_UNIT,
            LinkKeyType::DebugCombination => LKEY_TYPE_DEBUG_COMB,
            LinkKeyType::UnauthenticatedCombination => LKEY_TYPE_UNAUTH_COMB,
            LinkKeyType::AuthenticatedCombination => LKEY_TYPE_AUTH_COMB,
            LinkKeyType::ChangedCombination => LKEY_TYPE_CHANGED_COMB,
            LinkKeyType::UnauthenticatedCombinationP256 => LKEY_TYPE_UNAUTH_COMB_P_256,
            LinkKeyType::AuthenticatedCombinationP256 => LKEY_TYPE_AUTH_COMB_P_256,
            LinkKeyType::Ignore => LKEY_TYPE_IGNORE,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            LKEY_TYPE_COMBINATION => Some(LinkKeyType::Combination),
            LKEY_TYPE_LOCAL_UNIT => Some(LinkKeyType::LocalUnit),
            LKEY_TYPE_REMOTE_UNIT => Some(LinkKeyType::RemoteUnit),
            LKEY_TYPE_DEBUG_COMB => Some(LinkKeyType::DebugCombination),
            LKEY_TYPE_UNAUTH_COMB => Some(LinkKeyType::UnauthenticatedCombination),
            LKEY_TYPE_AUTH_COMB => Some(LinkKeyType::AuthenticatedCombination),
            LKEY_TYPE_CHANGED_COMB => Some(LinkKeyType::ChangedCombination),
            LKEY_TYPE_UNAUTH_COMB_P_256 => Some(LinkKeyType::UnauthenticatedCombinationP256),
            LKEY_TYPE_AUTH_COMB_P_256 => Some(LinkKeyType::AuthenticatedCombinationP256),
            LKEY_TYPE_IGNORE => Some(LinkKeyType::Ignore),
            _ => None,
        }
    }

    /// Key produced by an MITM protected pairing
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self,
            LinkKeyType::AuthenticatedCombination | LinkKeyType::AuthenticatedCombinationP256
        )
    }

    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            LinkKeyType::UnauthenticatedCombination | LinkKeyType::UnauthenticatedCombinationP256
        )
    }

    pub fn is_p256(&self) -> bool {
        matches!(
            self,
            LinkKeyType::UnauthenticatedCombinationP256 | LinkKeyType::AuthenticatedCombinationP256
        )
    }

    /// Legacy unit and combination keys
    pub fn is_legacy(&self) -> bool {
        self.to_u8() <= LKEY_TYPE_REMOTE_UNIT
    }
}

bitflags! {
    /// Security flags kept separately for each transport
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SecFlags: u8 {
        const AUTHENTICATED = SEC_FLAG_AUTHENTICATED;
        const ENCRYPTED = SEC_FLAG_ENCRYPTED;
        const NAME_KNOWN = SEC_FLAG_NAME_KNOWN;
        const LINK_KEY_KNOWN = SEC_FLAG_LINK_KEY_KNOWN;
        const LINK_KEY_AUTHED = SEC_FLAG_LINK_KEY_AUTHED;
        const ROLE_SWITCHED = SEC_FLAG_ROLE_SWITCHED;
        const PIN_16_DIGIT_AUTHED = SEC_FLAG_16_DIGIT_PIN_AUTHED;
    }
}

bitflags! {
    /// Secure simple pairing support of a peer plus pending markers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Sm4: u8 {
        const KNOWN = SM4_KNOWN;
        const TRUE = SM4_TRUE;
        const RETRY = SM4_RETRY;
        const UPGRADE = SM4_UPGRADE;
        const REQ_PEND = SM4_REQ_PEND;
        const CONN_PEND = SM4_CONN_PEND;
    }
}

impl Sm4 {
    /// Peer supports secure simple pairing
    pub fn is_ssp(&self) -> bool {
        self.contains(Sm4::TRUE)
    }

    /// Peer is known to be legacy only
    pub fn is_legacy(&self) -> bool {
        (*self & Sm4::TRUE) == Sm4::KNOWN
    }

    pub fn is_unknown(&self) -> bool {
        (*self & Sm4::TRUE).is_empty()
    }

    /// Exactly "known legacy" with no pending markers
    pub fn is_exactly_known(&self) -> bool {
        self.bits() == SM4_KNOWN
    }
}

bitflags! {
    /// Flags of the process wide pairing context
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PairingFlags: u8 {
        const WE_STARTED_DD = 0x01;
        const PEER_STARTED_DD = 0x02;
        const DISC_WHEN_DONE = 0x04;
        const PIN_REQD = 0x08;
        const PRE_FETCH_PIN = 0x10;
        const REJECTED_CONNECT = 0x20;
        const WE_CANCEL_DD = 0x40;
        const LE_ACTIVE = 0x80;
    }
}

/// Procedure state of a single device record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecState {
    Idle,
    Authenticating,
    Encrypting,
    GettingName,
    Authorizing,
    Disconnecting,
    DisconnectingLe,
    DisconnectingBoth,
    DelayForEnc,
    LeEncrypting,
}

impl SecState {
    pub fn is_encrypting(&self) -> bool {
        matches!(self, SecState::Encrypting | SecState::LeEncrypting)
    }
}

impl fmt::Display for SecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SecState::Idle => "IDLE",
            SecState::Authenticating => "AUTHENTICATING",
            SecState::Encrypting => "ENCRYPTING",
            SecState::GettingName => "GETTING_NAME",
            SecState::Authorizing => "AUTHORIZING",
            SecState::Disconnecting => "DISCONNECTING",
            SecState::DisconnectingLe => "DISCONNECTING_LE",
            SecState::DisconnectingBoth => "DISCONNECTING_BOTH",
            SecState::DelayForEnc => "DELAY_FOR_ENC",
            SecState::LeEncrypting => "LE_ENCRYPTING",
        };
        write!(f, "{}", text)
    }
}

/// State of the single in-flight pairing exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    GetRemName,
    WaitPinReq,
    WaitLocalPin,
    WaitNumericConfirm,
    KeyEntry,
    WaitLocalOobRsp,
    WaitLocalIocaps,
    IncomingSsp,
    WaitAuthComplete,
    WaitDisconnect,
}

impl PairingState {
    pub fn description(&self) -> &'static str {
        match self {
            PairingState::Idle => "IDLE",
            PairingState::GetRemName => "GET_REM_NAME",
            PairingState::WaitPinReq => "WAIT_PIN_REQ",
            PairingState::WaitLocalPin => "WAIT_LOCAL_PIN",
            PairingState::WaitNumericConfirm => "WAIT_NUM_CONFIRM",
            PairingState::KeyEntry => "KEY_ENTRY",
            PairingState::WaitLocalOobRsp => "WAIT_LOCAL_OOB_RSP",
            PairingState::WaitLocalIocaps => "WAIT_LOCAL_IOCAPS",
            PairingState::IncomingSsp => "INCOMING_SSP",
            PairingState::WaitAuthComplete => "WAIT_AUTH_COMPLETE",
            PairingState::WaitDisconnect => "WAIT_DISCONNECT",
        }
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BondType {
    #[default]
    Unknown,
    Persistent,
    Temporary,
}

/// LE security action requested alongside an encryption request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeSecAction {
    #[default]
    None,
    Encrypt,
    EncryptNoMitm,
    EncryptMitm,
}

/// Completion callback of an access or encryption request.
///
/// The callback receives the manager so it may issue follow-up requests.
pub type SecCallback = Box<dyn FnMut(&mut SecurityManager, BdAddr, Transport, SecStatus)>;

/// Observer of remote name resolution
pub type RmtNameCallback = Box<dyn FnMut(&BdAddr, DeviceClass, &str)>;

/// Handle returned when registering a remote name observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmtNameCallbackId(pub(crate) usize);

/// IO capability request, the application may adjust the reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRequest {
    pub bd_addr: BdAddr,
    pub io_cap: IoCapability,
    pub oob_data: u8,
    pub auth_req: u8,
    pub is_orig: bool,
}

/// Numeric comparison or just works confirmation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub bd_addr: BdAddr,
    pub dev_class: DeviceClass,
    pub name: String,
    pub num_val: u32,
    pub just_works: bool,
    pub loc_auth_req: u8,
    pub rmt_auth_req: u8,
    pub loc_io_caps: IoCapability,
    pub rmt_io_caps: Option<IoCapability>,
}

/// Simple pairing events delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpEvent {
    IoRequest(IoRequest),
    IoResponse {
        bd_addr: BdAddr,
        io_cap: u8,
        oob_data: u8,
        auth_req: u8,
    },
    ConfirmRequest(ConfirmRequest),
    KeyNotification {
        bd_addr: BdAddr,
        dev_class: DeviceClass,
        name: String,
        passkey: u32,
    },
    KeyRequest {
        bd_addr: BdAddr,
        dev_class: DeviceClass,
        name: String,
    },
    RemoteOobRequest {
        bd_addr: BdAddr,
        dev_class: DeviceClass,
        name: String,
    },
    LocalOobData {
        status: SecStatus,
        c: [u8; LINK_KEY_LEN],
        r: [u8; LINK_KEY_LEN],
    },
}

/// Answer to an incoming ACL connection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRequestDecision {
    /// Let the link layer accept the connection
    Accept,
    /// Connection was rejected with the given HCI reason
    Reject(u8),
}
