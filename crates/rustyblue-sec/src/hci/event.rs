//! Typed decoding of the HCI events consumed by the security manager

use crate::error::{HciError, HciResult};
use crate::gap::{BdAddr, DeviceClass, BD_ADDR_LEN, DEV_CLASS_LEN};
use crate::hci::constants::*;
use crate::hci::packet::{HciEvent, LINK_KEY_LEN};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// Security related HCI events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityEvent {
    ConnectionComplete {
        status: u8,
        handle: u16,
        bd_addr: BdAddr,
        link_type: u8,
        encryption_enabled: u8,
    },
    ConnectionRequest {
        bd_addr: BdAddr,
        dev_class: DeviceClass,
        link_type: u8,
    },
    DisconnectionComplete {
        status: u8,
        handle: u16,
        reason: u8,
    },
    AuthenticationComplete {
        status: u8,
        handle: u16,
    },
    RemoteNameRequestComplete {
        status: u8,
        bd_addr: BdAddr,
        name: String,
    },
    EncryptionChange {
        status: u8,
        handle: u16,
        enabled: u8,
    },
    RoleChange {
        status: u8,
        bd_addr: BdAddr,
        role: u8,
    },
    PinCodeRequest {
        bd_addr: BdAddr,
    },
    LinkKeyRequest {
        bd_addr: BdAddr,
    },
    LinkKeyNotification {
        bd_addr: BdAddr,
        link_key: [u8; LINK_KEY_LEN],
        key_type: u8,
    },
    IoCapabilityRequest {
        bd_addr: BdAddr,
    },
    IoCapabilityResponse {
        bd_addr: BdAddr,
        io_cap: u8,
        oob_data: u8,
        auth_req: u8,
    },
    UserConfirmationRequest {
        bd_addr: BdAddr,
        numeric_value: u32,
    },
    UserPasskeyRequest {
        bd_addr: BdAddr,
    },
    UserPasskeyNotification {
        bd_addr: BdAddr,
        passkey: u32,
    },
    RemoteOobDataRequest {
        bd_addr: BdAddr,
    },
    SimplePairingComplete {
        status: u8,
        bd_addr: BdAddr,
    },
    RemoteHostSupportedFeatures {
        bd_addr: BdAddr,
        features: [u8; 8],
    },
    /// Command Complete for Read Local OOB Data
    LocalOobDataComplete {
        status: u8,
        c: [u8; LINK_KEY_LEN],
        r: [u8; LINK_KEY_LEN],
    },
    /// Command Complete for Create Connection Cancel
    CreateConnectionCancelComplete {
        status: u8,
        bd_addr: BdAddr,
    },
}

fn read_addr(cursor: &mut Cursor<&[u8]>) -> HciResult<BdAddr> {
    let mut bytes = [0u8; BD_ADDR_LEN];
    cursor
        .read_exact(&mut bytes)
        .map_err(|_| HciError::InvalidPacketFormat)?;
    Ok(BdAddr::new(bytes))
}

fn read_array<const N: usize>(cursor: &mut Cursor<&[u8]>) -> HciResult<[u8; N]> {
    let mut bytes = [0u8; N];
    cursor
        .read_exact(&mut bytes)
        .map_err(|_| HciError::InvalidPacketFormat)?;
    Ok(bytes)
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> HciResult<u8> {
    cursor.read_u8().map_err(|_| HciError::InvalidPacketFormat)
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> HciResult<u16> {
    cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| HciError::InvalidPacketFormat)
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> HciResult<u32> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| HciError::InvalidPacketFormat)
}

/// Names are null terminated UTF-8 inside a fixed 248 byte field
fn decode_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl SecurityEvent {
    /// Decode a raw HCI event into a security event
    pub fn decode(event: &HciEvent) -> HciResult<Self> {
        let mut cursor = Cursor::new(event.parameters.as_slice());
        let cursor = &mut cursor;

        let decoded = match event.event_code {
            EVT_CONN_COMPLETE => SecurityEvent::ConnectionComplete {
                status: read_u8(cursor)?,
                handle: read_u16(cursor)? & 0x0FFF,
                bd_addr: read_addr(cursor)?,
                link_type: read_u8(cursor)?,
                encryption_enabled: read_u8(cursor)?,
            },
            EVT_CONN_REQUEST => SecurityEvent::ConnectionRequest {
                bd_addr: read_addr(cursor)?,
                dev_class: DeviceClass(read_array::<DEV_CLASS_LEN>(cursor)?),
                link_type: read_u8(cursor)?,
            },
            EVT_DISCONN_COMPLETE => SecurityEvent::DisconnectionComplete {
                status: read_u8(cursor)?,
                handle: read_u16(cursor)? & 0x0FFF,
                reason: read_u8(cursor)?,
            },
            EVT_AUTH_COMPLETE => SecurityEvent::AuthenticationComplete {
                status: read_u8(cursor)?,
                handle: read_u16(cursor)? & 0x0FFF,
            },
            EVT_REMOTE_NAME_REQ_COMPLETE => {
                let status = read_u8(cursor)?;
                let bd_addr = read_addr(cursor)?;
                let position = cursor.position() as usize;
                let rest = &event.parameters[position..];
                let name = decode_name(&rest[..rest.len().min(HCI_MAX_NAME_LEN)]);
                SecurityEvent::RemoteNameRequestComplete { status, bd_addr, name }
            }
            EVT_ENCRYPTION_CHANGE => SecurityEvent::EncryptionChange {
                status: read_u8(cursor)?,
                handle: read_u16(cursor)? & 0x0FFF,
                enabled: read_u8(cursor)?,
            },
            EVT_ROLE_CHANGE => SecurityEvent::RoleChange {
                status: read_u8(cursor)?,
                bd_addr: read_addr(cursor)?,
                role: read_u8(cursor)?,
            },
            EVT_PIN_CODE_REQUEST => SecurityEvent::PinCodeRequest {
                bd_addr: read_addr(cursor)?,
            },
            EVT_LINK_KEY_REQUEST => SecurityEvent::LinkKeyRequest {
                bd_addr: read_addr(cursor)?,
            },
            EVT_LINK_KEY_NOTIFICATION => SecurityEvent::LinkKeyNotification {
                bd_addr: read_addr(cursor)?,
                link_key: read_array::<LINK_KEY_LEN>(cursor)?,
                key_type: read_u8(cursor)?,
            },
            EVT_IO_CAPABILITY_REQUEST => SecurityEvent::IoCapabilityRequest {
                bd_addr: read_addr(cursor)?,
            },
            EVT_IO_CAPABILITY_RESPONSE => SecurityEvent::IoCapabilityResponse {
                bd_addr: read_addr(cursor)?,
                io_cap: read_u8(cursor)?,
                oob_data: read_u8(cursor)?,
                auth_req: read_u8(cursor)?,
            },
            EVT_USER_CONFIRMATION_REQUEST => SecurityEvent::UserConfirmationRequest {
                bd_addr: read_addr(cursor)?,
                numeric_value: read_u32(cursor)?,
            },
            EVT_USER_PASSKEY_REQUEST => SecurityEvent::UserPasskeyRequest {
                bd_addr: read_addr(cursor)?,
            },
            EVT_USER_PASSKEY_NOTIFICATION => SecurityEvent::UserPasskeyNotification {
                bd_addr: read_addr(cursor)?,
                passkey: read_u32(cursor)?,
            },
            EVT_REMOTE_OOB_DATA_REQUEST => SecurityEvent::RemoteOobDataRequest {
                bd_addr: read_addr(cursor)?,
            },
            EVT_SIMPLE_PAIRING_COMPLETE => SecurityEvent::SimplePairingComplete {
                status: read_u8(cursor)?,
                bd_addr: read_addr(cursor)?,
            },
            EVT_REMOTE_HOST_SUPPORTED_FEATURES => SecurityEvent::RemoteHostSupportedFeatures {
                bd_addr: read_addr(cursor)?,
                features: read_array::<8>(cursor)?,
            },
            EVT_CMD_COMPLETE => {
                let _num_packets = read_u8(cursor)?;
                let opcode = read_u16(cursor)?;
                Self::decode_command_complete(opcode, cursor)?
            }
            other => return Err(HciError::UnexpectedEvent(other)),
        };

        Ok(decoded)
    }

    fn decode_command_complete(opcode: u16, cursor: &mut Cursor<&[u8]>) -> HciResult<Self> {
        let read_local_oob = ((OGF_HOST_CTL as u16) << 10) | OCF_READ_LOCAL_OOB_DATA;
        let create_conn_cancel = ((OGF_LINK_CTL as u16) << 10) | OCF_CREATE_CONNECTION_CANCEL;

        if opcode == read_local_oob {
            let status = read_u8(cursor)?;
            if status != HCI_SUCCESS {
                return Ok(SecurityEvent::LocalOobDataComplete {
                    status,
                    c: [0; LINK_KEY_LEN],
                    r: [0; LINK_KEY_LEN],
                });
            }
            Ok(SecurityEvent::LocalOobDataComplete {
                status,
                c: read_array::<LINK_KEY_LEN>(cursor)?,
                r: read_array::<LINK_KEY_LEN>(cursor)?,
            })
        } else if opcode == create_conn_cancel {
            Ok(SecurityEvent::CreateConnectionCancelComplete {
                status: read_u8(cursor)?,
                bd_addr: read_addr(cursor)?,
            })
        } else {
            Err(HciError::UnexpectedEvent(EVT_CMD_COMPLETE))
        }
    }
}
