//! HCI packet structures and parsing
//!
//! This module contains the commands the security manager issues and the raw
//! event container it receives.

use crate::gap::BdAddr;
use crate::hci::constants::*;

/// Maximum legacy PIN length in bytes
pub const PIN_CODE_LEN: usize = 16;

/// Length of a link key, and of OOB hash/randomizer values
pub const LINK_KEY_LEN: usize = 16;

/// HCI commands issued by the security manager
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    Disconnect { handle: u16, reason: u8 },
    CreateConnectionCancel { bd_addr: BdAddr },
    RejectConnectionRequest { bd_addr: BdAddr, reason: u8 },
    LinkKeyRequestReply { bd_addr: BdAddr, link_key: [u8; LINK_KEY_LEN] },
    LinkKeyRequestNegReply { bd_addr: BdAddr },
    PinCodeRequestReply { bd_addr: BdAddr, pin: Vec<u8> },
    PinCodeRequestNegReply { bd_addr: BdAddr },
    AuthenticationRequested { handle: u16 },
    SetConnectionEncryption { handle: u16, enable: bool },
    RemoteNameRequest { bd_addr: BdAddr },
    RemoteNameRequestCancel { bd_addr: BdAddr },
    IoCapabilityRequestReply { bd_addr: BdAddr, io_cap: u8, oob_data: u8, auth_req: u8 },
    IoCapabilityRequestNegReply { bd_addr: BdAddr, reason: u8 },
    UserConfirmationRequestReply { bd_addr: BdAddr },
    UserConfirmationRequestNegReply { bd_addr: BdAddr },
    UserPasskeyRequestReply { bd_addr: BdAddr, passkey: u32 },
    UserPasskeyRequestNegReply { bd_addr: BdAddr },
    RemoteOobDataRequestReply { bd_addr: BdAddr, c: [u8; LINK_KEY_LEN], r: [u8; LINK_KEY_LEN] },
    RemoteOobDataRequestNegReply { bd_addr: BdAddr },

    // Link Policy Commands (OGF: 0x02)
    SwitchRole { bd_addr: BdAddr, role: u8 },

    // Host Controller Commands (OGF: 0x03)
    DeleteStoredLinkKey { bd_addr: BdAddr, delete_all: bool },
    WriteAuthenticationEnable { enable: bool },
    WritePinType { pin_type: u8 },
    ReadLocalOobData,
}

impl HciCommand {
    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            // Link Control Commands
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::CreateConnectionCancel { .. } => (OGF_LINK_CTL, OCF_CREATE_CONNECTION_CANCEL),
            Self::RejectConnectionRequest { .. } => (OGF_LINK_CTL, OCF_REJECT_CONNECTION_REQUEST),
            Self::LinkKeyRequestReply { .. } => (OGF_LINK_CTL, OCF_LINK_KEY_REQUEST_REPLY),
            Self::LinkKeyRequestNegReply { .. } => (OGF_LINK_CTL, OCF_LINK_KEY_REQUEST_NEG_REPLY),
            Self::PinCodeRequestReply { .. } => (OGF_LINK_CTL, OCF_PIN_CODE_REQUEST_REPLY),
            Self::PinCodeRequestNegReply { .. } => (OGF_LINK_CTL, OCF_PIN_CODE_REQUEST_NEG_REPLY),
            Self::AuthenticationRequested { .. } => (OGF_LINK_CTL, OCF_AUTHENTICATION_REQUESTED),
            Self::SetConnectionEncryption { .. } => (OGF_LINK_CTL, OCF_SET_CONNECTION_ENCRYPTION),
            Self::RemoteNameRequest { .. } => (OGF_LINK_CTL, OCF_REMOTE_NAME_REQUEST),
            Self::RemoteNameRequestCancel { .. } => (OGF_LINK_CTL, OCF_REMOTE_NAME_REQUEST_CANCEL),
            Self::IoCapabilityRequestReply { .. } => (OGF_LINK_CTL, OCF_IO_CAPABILITY_REQUEST_REPLY),
            Self::IoCapabilityRequestNegReply { .. } => {
                (OGF_LINK_CTL, OCF_IO_CAPABILITY_REQUEST_NEG_REPLY)
            }
            Self::UserConfirmationRequestReply { .. } => {
                (OGF_LINK_CTL, OCF_USER_CONFIRMATION_REQUEST_REPLY)
            }
            Self::UserConfirmationRequestNegReply { .. } => {
                (OGF_LINK_CTL, OCF_USER_CONFIRMATION_REQUEST_NEG_REPLY)
            }
            Self::UserPasskeyRequestReply { .. } => (OGF_LINK_CTL, OCF_USER_PASSKEY_REQUEST_REPLY),
            Self::UserPasskeyRequestNegReply { .. } => {
                (OGF_LINK_CTL, OCF_USER_PASSKEY_REQUEST_NEG_REPLY)
            }
            Self::RemoteOobDataRequestReply { .. } => (OGF_LINK_CTL, OCF_REMOTE_OOB_DATA_REQUEST_REPLY),
            Self::RemoteOobDataRequestNegReply { .. } => {
                (OGF_LINK_CTL, OCF_REMOTE_OOB_DATA_REQUEST_NEG_REPLY)
            }

            // Link Policy Commands
            Self::SwitchRole { .. } => (OGF_LINK_POLICY, OCF_SWITCH_ROLE),

            // Host Controller Commands
            Self::DeleteStoredLinkKey { .. } => (OGF_HOST_CTL, OCF_DELETE_STORED_LINK_KEY),
            Self::WriteAuthenticationEnable { .. } => (OGF_HOST_CTL, OCF_WRITE_AUTHENTICATION_ENABLE),
            Self::WritePinType { .. } => (OGF_HOST_CTL, OCF_WRITE_PIN_TYPE),
            Self::ReadLocalOobData => (OGF_HOST_CTL, OCF_READ_LOCAL_OOB_DATA),
        }
    }

    /// Full 16-bit opcode
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        ((ogf as u16) << 10) | (ocf & 0x3ff)
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        match self {
            Self::ReadLocalOobData => vec![],

            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*reason);
                params
            }

            Self::AuthenticationRequested { handle } => handle.to_le_bytes().to_vec(),

            Self::SetConnectionEncryption { handle, enable } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*enable as u8);
                params
            }

            Self::CreateConnectionCancel { bd_addr }
            | Self::LinkKeyRequestNegReply { bd_addr }
            | Self::PinCodeRequestNegReply { bd_addr }
            | Self::RemoteNameRequestCancel { bd_addr }
            | Self::UserConfirmationRequestReply { bd_addr }
            | Self::UserConfirmationRequestNegReply { bd_addr }
            | Self::UserPasskeyRequestNegReply { bd_addr }
            | Self::RemoteOobDataRequestNegReply { bd_addr } => bd_addr.as_slice().to_vec(),

            Self::RejectConnectionRequest { bd_addr, reason }
            | Self::IoCapabilityRequestNegReply { bd_addr, reason } => {
                let mut params = Vec::with_capacity(7);
                params.extend_from_slice(bd_addr.as_slice());
                params.push(*reason);
                params
            }

            Self::LinkKeyRequestReply { bd_addr, link_key } => {
                let mut params = Vec::with_capacity(22);
                params.extend_from_slice(bd_addr.as_slice());
                params.extend_from_slice(link_key);
                params
            }

            Self::PinCodeRequestReply { bd_addr, pin } => {
                let len = pin.len().min(PIN_CODE_LEN);
                let mut params = Vec::with_capacity(23);
                params.extend_from_slice(bd_addr.as_slice());
                params.push(len as u8);
                let mut padded = [0u8; PIN_CODE_LEN];
                padded[..len].copy_from_slice(&pin[..len]);
                params.extend_from_slice(&padded);
                params
            }

            Self::RemoteNameRequest { bd_addr } => {
                let mut params = Vec::with_capacity(10);
                params.extend_from_slice(bd_addr.as_slice());
                params.push(0x01); // page scan repetition mode R1
                params.push(0x00); // reserved
                params.extend_from_slice(&0u16.to_le_bytes()); // clock offset
                params
            }

            Self::IoCapabilityRequestReply { bd_addr, io_cap, oob_data, auth_req } => {
                let mut params = Vec::with_capacity(9);
                params.extend_from_slice(bd_addr.as_slice());
                params.push(*io_cap);
                params.push(*oob_data);
                params.push(*auth_req);
                params
            }

            Self::UserPasskeyRequestReply { bd_addr, passkey } => {
                let mut params = Vec::with_capacity(10);
                params.extend_from_slice(bd_addr.as_slice());
                params.extend_from_slice(&passkey.to_le_bytes());
                params
            }

            Self::RemoteOobDataRequestReply { bd_addr, c, r } => {
                let mut params = Vec::with_capacity(38);
                params.extend_from_slice(bd_addr.as_slice());
                params.extend_from_slice(c);
                params.extend_from_slice(r);
                params
            }

            Self::SwitchRole { bd_addr, role } => {
                let mut params = Vec::with_capacity(7);
                params.extend_from_slice(bd_addr.as_slice());
                params.push(*role);
                params
            }

            Self::DeleteStoredLinkKey { bd_addr, delete_all } => {
                let mut params = Vec::with_capacity(7);
                params.extend_from_slice(bd_addr.as_slice());
                params.push(*delete_all as u8);
                params
            }

            Self::WriteAuthenticationEnable { enable } => vec![*enable as u8],

            Self::WritePinType { pin_type } => vec![*pin_type],
        }
    }

    /// Convert the command to a raw HCI packet
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();

        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}

/// HCI Event packet
#[derive(Debug, Clone)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    /// Build an event from its code and parameters
    pub fn new(event_code: u8, parameters: Vec<u8>) -> Self {
        Self {
            event_code,
            parameter_total_length: parameters.len() as u8,
            parameters,
        }
    }

    /// Parse an HCI event from raw bytes (without the H4 packet indicator)
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }

        let event_code = data[0];
        let parameter_total_length = data[1];

        if data.len() < (parameter_total_length as usize + 2) {
            return None;
        }

        let parameters = data[2..(parameter_total_length as usize + 2)].to_vec();

        Some(HciEvent {
            event_code,
            parameter_total_length,
            parameters,
        })
    }
}
