//! HCI protocol constants
//!
//! This module contains the HCI opcodes, event codes and status codes used by
//! the security manager.

// HCI packet types
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_EVENT_PKT: u8 = 0x04;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;

pub const HCI_INVALID_HANDLE: u16 = 0xFFFF;

// Common OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_LINK_POLICY: u8 = 0x02;
pub const OGF_HOST_CTL: u8 = 0x03;

// Link Control Commands (OGF: 0x01)
pub const OCF_DISCONNECT: u16 = 0x0006;
pub const OCF_CREATE_CONNECTION_CANCEL: u16 = 0x0008;
pub const OCF_REJECT_CONNECTION_REQUEST: u16 = 0x000A;
pub const OCF_LINK_KEY_REQUEST_REPLY: u16 = 0x000B;
pub const OCF_LINK_KEY_REQUEST_NEG_REPLY: u16 = 0x000C;
pub const OCF_PIN_CODE_REQUEST_REPLY: u16 = 0x000D;
pub const OCF_PIN_CODE_REQUEST_NEG_REPLY: u16 = 0x000E;
pub const OCF_AUTHENTICATION_REQUESTED: u16 = 0x0011;
pub const OCF_SET_CONNECTION_ENCRYPTION: u16 = 0x0013;
pub const OCF_REMOTE_NAME_REQUEST: u16 = 0x0019;
pub const OCF_REMOTE_NAME_REQUEST_CANCEL: u16 = 0x001A;
pub const OCF_IO_CAPABILITY_REQUEST_REPLY: u16 = 0x002B;
pub const OCF_USER_CONFIRMATION_REQUEST_REPLY: u16 = 0x002C;
pub const OCF_USER_CONFIRMATION_REQUEST_NEG_REPLY: u16 = 0x002D;
pub const OCF_USER_PASSKEY_REQUEST_REPLY: u16 = 0x002E;
pub const OCF_USER_PASSKEY_REQUEST_NEG_REPLY: u16 = 0x002F;
pub const OCF_REMOTE_OOB_DATA_REQUEST_REPLY: u16 = 0x0030;
pub const OCF_REMOTE_OOB_DATA_REQUEST_NEG_REPLY: u16 = 0x0033;
pub const OCF_IO_CAPABILITY_REQUEST_NEG_REPLY: u16 = 0x0034;

// Link Policy Commands (OGF: 0x02)
pub const OCF_SWITCH_ROLE: u16 = 0x000B;

// Host Controller Commands (OGF: 0x03)
pub const OCF_DELETE_STORED_LINK_KEY: u16 = 0x0012;
pub const OCF_WRITE_AUTHENTICATION_ENABLE: u16 = 0x0020;
pub const OCF_WRITE_PIN_TYPE: u16 = 0x000A;
pub const OCF_READ_LOCAL_OOB_DATA: u16 = 0x0057;

// HCI Events
pub const EVT_CONN_COMPLETE: u8 = 0x03;
pub const EVT_CONN_REQUEST: u8 = 0x04;
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_AUTH_COMPLETE: u8 = 0x06;
pub const EVT_REMOTE_NAME_REQ_COMPLETE: u8 = 0x07;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_ROLE_CHANGE: u8 = 0x12;
pub const EVT_PIN_CODE_REQUEST: u8 = 0x16;
pub const EVT_LINK_KEY_REQUEST: u8 = 0x17;
pub const EVT_LINK_KEY_NOTIFICATION: u8 = 0x18;
pub const EVT_IO_CAPABILITY_REQUEST: u8 = 0x31;
pub const EVT_IO_CAPABILITY_RESPONSE: u8 = 0x32;
pub const EVT_USER_CONFIRMATION_REQUEST: u8 = 0x33;
pub const EVT_USER_PASSKEY_REQUEST: u8 = 0x34;
pub const EVT_REMOTE_OOB_DATA_REQUEST: u8 = 0x35;
pub const EVT_SIMPLE_PAIRING_COMPLETE: u8 = 0x36;
pub const EVT_USER_PASSKEY_NOTIFICATION: u8 = 0x3B;
pub const EVT_REMOTE_HOST_SUPPORTED_FEATURES: u8 = 0x3D;

// Length of a remote name in the remote name request complete event
pub const HCI_MAX_NAME_LEN: usize = 248;

// Byte 0 of the host supported features page
pub const HCI_FEATURE_SSP_HOST_SUPPORTED: u8 = 0x01;

// Pin types
pub const HCI_PIN_TYPE_VARIABLE: u8 = 0x00;
pub const HCI_PIN_TYPE_FIXED: u8 = 0x01;

// Link types in connection events
pub const HCI_LINK_TYPE_SCO: u8 = 0x00;
pub const HCI_LINK_TYPE_ACL: u8 = 0x01;

// Role values
pub const HCI_ROLE_CENTRAL: u8 = 0x00;
pub const HCI_ROLE_PERIPHERAL: u8 = 0x01;

// HCI status codes
pub const HCI_SUCCESS: u8 = 0x00;
pub const HCI_ERR_NO_CONNECTION: u8 = 0x02;
pub const HCI_ERR_PAGE_TIMEOUT: u8 = 0x04;
pub const HCI_ERR_AUTH_FAILURE: u8 = 0x05;
pub const HCI_ERR_KEY_MISSING: u8 = 0x06;
pub const HCI_ERR_MEMORY_FULL: u8 = 0x07;
pub const HCI_ERR_CONNECTION_TOUT: u8 = 0x08;
pub const HCI_ERR_CONNECTION_EXISTS: u8 = 0x0B;
pub const HCI_ERR_COMMAND_DISALLOWED: u8 = 0x0C;
pub const HCI_ERR_HOST_REJECT_SECURITY: u8 = 0x0E;
pub const HCI_ERR_HOST_REJECT_DEVICE: u8 = 0x0F;
pub const HCI_ERR_PEER_USER: u8 = 0x13;
pub const HCI_ERR_REMOTE_POWER_OFF: u8 = 0x15;
pub const HCI_ERR_CONN_CAUSE_LOCAL_HOST: u8 = 0x16;
pub const HCI_ERR_REPEATED_ATTEMPTS: u8 = 0x17;
pub const HCI_ERR_PAIRING_NOT_ALLOWED: u8 = 0x18;
pub const HCI_ERR_UNSPECIFIED: u8 = 0x1F;
pub const HCI_ERR_LMP_RESPONSE_TIMEOUT: u8 = 0x22;
pub const HCI_ERR_LMP_ERR_TRANS_COLLISION: u8 = 0x23;
pub const HCI_ERR_ENCRY_MODE_NOT_ACCEPTABLE: u8 = 0x25;
pub const HCI_ERR_UNIT_KEY_USED: u8 = 0x26;
pub const HCI_ERR_PAIRING_WITH_UNIT_KEY_NOT_SUPPORTED: u8 = 0x29;
pub const HCI_ERR_DIFF_TRANSACTION_COLLISION: u8 = 0x2A;
pub const HCI_ERR_HOST_BUSY_PAIRING: u8 = 0x38;

/// Human readable text for the status codes the security manager reacts to
pub fn hci_status_text(status: u8) -> &'static str {
    match status {
        HCI_SUCCESS => "success",
        HCI_ERR_NO_CONNECTION => "no connection",
        HCI_ERR_PAGE_TIMEOUT => "page timeout",
        HCI_ERR_AUTH_FAILURE => "authentication failure",
        HCI_ERR_KEY_MISSING => "key missing",
        HCI_ERR_MEMORY_FULL => "memory full",
        HCI_ERR_CONNECTION_TOUT => "connection timeout",
        HCI_ERR_CONNECTION_EXISTS => "connection exists",
        HCI_ERR_COMMAND_DISALLOWED => "command disallowed",
        HCI_ERR_HOST_REJECT_SECURITY => "host rejected (security)",
        HCI_ERR_HOST_REJECT_DEVICE => "host rejected (device)",
        HCI_ERR_PEER_USER => "remote user terminated",
        HCI_ERR_REMOTE_POWER_OFF => "remote power off",
        HCI_ERR_CONN_CAUSE_LOCAL_HOST => "terminated by local host",
        HCI_ERR_REPEATED_ATTEMPTS => "repeated attempts",
        HCI_ERR_PAIRING_NOT_ALLOWED => "pairing not allowed",
        HCI_ERR_UNSPECIFIED => "unspecified error",
        HCI_ERR_LMP_RESPONSE_TIMEOUT => "LMP response timeout",
        HCI_ERR_LMP_ERR_TRANS_COLLISION => "LMP transaction collision",
        HCI_ERR_ENCRY_MODE_NOT_ACCEPTABLE => "encryption mode not acceptable",
        HCI_ERR_UNIT_KEY_USED => "unit key used",
        HCI_ERR_PAIRING_WITH_UNIT_KEY_NOT_SUPPORTED => "pairing with unit key not supported",
        HCI_ERR_DIFF_TRANSACTION_COLLISION => "different transaction collision",
        HCI_ERR_HOST_BUSY_PAIRING => "host busy pairing",
        _ => "unknown status",
    }
}
