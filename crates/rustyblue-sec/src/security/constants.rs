//! Constants for the BR/EDR Security Manager

// Service security requirement bits
pub const SEC_NONE: u16 = 0x0000;
pub const SEC_IN_AUTHENTICATE: u16 = 0x0002;
pub const SEC_IN_ENCRYPT: u16 = 0x0004;
pub const SEC_OUT_AUTHENTICATE: u16 = 0x0010;
pub const SEC_OUT_ENCRYPT: u16 = 0x0020;
pub const SEC_MODE4_LEVEL4: u16 = 0x0040;
pub const SEC_IN_USE: u16 = 0x0080;
pub const SEC_IN_MITM: u16 = 0x1000;
pub const SEC_OUT_MITM: u16 = 0x2000;
pub const SEC_IN_MIN_16_DIGIT_PIN: u16 = 0x4000;

pub const SEC_OUT_FLAGS: u16 = SEC_OUT_AUTHENTICATE | SEC_OUT_ENCRYPT;
pub const SEC_IN_FLAGS: u16 = SEC_IN_AUTHENTICATE | SEC_IN_ENCRYPT;

pub const SEC_OUT_LEVEL4_FLAGS: u16 =
    SEC_OUT_AUTHENTICATE | SEC_OUT_ENCRYPT | SEC_OUT_MITM | SEC_MODE4_LEVEL4;
pub const SEC_IN_LEVEL4_FLAGS: u16 =
    SEC_IN_AUTHENTICATE | SEC_IN_ENCRYPT | SEC_IN_MITM | SEC_MODE4_LEVEL4;

// Per transport security flag bits
pub const SEC_FLAG_AUTHENTICATED: u8 = 0x02;
pub const SEC_FLAG_ENCRYPTED: u8 = 0x04;
pub const SEC_FLAG_NAME_KNOWN: u8 = 0x08;
pub const SEC_FLAG_LINK_KEY_KNOWN: u8 = 0x10;
pub const SEC_FLAG_LINK_KEY_AUTHED: u8 = 0x20;
pub const SEC_FLAG_ROLE_SWITCHED: u8 = 0x40;
pub const SEC_FLAG_16_DIGIT_PIN_AUTHED: u8 = 0x80;

// Secure simple pairing support state of a peer (sm4)
pub const SM4_UNKNOWN: u8 = 0x00;
pub const SM4_KNOWN: u8 = 0x01;
pub const SM4_TRUE: u8 = 0x11;
pub const SM4_REQ_PEND: u8 = 0x08;
pub const SM4_UPGRADE: u8 = 0x04;
pub const SM4_RETRY: u8 = 0x02;
pub const SM4_CONN_PEND: u8 = 0x40;

// Link key types
pub const LKEY_TYPE_COMBINATION: u8 = 0x00;
pub const LKEY_TYPE_LOCAL_UNIT: u8 = 0x01;
pub const LKEY_TYPE_REMOTE_UNIT: u8 = 0x02;
pub const LKEY_TYPE_DEBUG_COMB: u8 = 0x03;
pub const LKEY_TYPE_UNAUTH_COMB: u8 = 0x04;
pub const LKEY_TYPE_AUTH_COMB: u8 = 0x05;
pub const LKEY_TYPE_CHANGED_COMB: u8 = 0x06;
pub const LKEY_TYPE_UNAUTH_COMB_P_256: u8 = 0x07;
pub const LKEY_TYPE_AUTH_COMB_P_256: u8 = 0x08;
pub const LKEY_TYPE_IGNORE: u8 = 0xFF;

/// Offset added to link key types derived from an LE key
pub const LTK_DERIVED_LKEY_OFFSET: u8 = 0x20;

// IO capabilities
pub const IO_CAP_OUT: u8 = 0x00; // DisplayOnly
pub const IO_CAP_IO: u8 = 0x01; // DisplayYesNo
pub const IO_CAP_IN: u8 = 0x02; // KeyboardOnly
pub const IO_CAP_NONE: u8 = 0x03; // NoInputNoOutput
pub const IO_CAP_MAX: u8 = 0x04;
pub const IO_CAP_UNKNOWN: u8 = 0xFF;

// OOB data present values
pub const OOB_NONE: u8 = 0x00;
pub const OOB_PRESENT: u8 = 0x01;

// Authentication requirements
pub const AUTH_SP_NO: u8 = 0x00;
pub const AUTH_SP_YES: u8 = 0x01;
pub const AUTH_AP_NO: u8 = 0x02;
pub const AUTH_AP_YES: u8 = 0x03;
pub const AUTH_SPGB_NO: u8 = 0x04;
pub const AUTH_SPGB_YES: u8 = 0x05;
pub const AUTH_DD_BOND: u8 = 0x02;
pub const AUTH_YN_BIT: u8 = 0x01;

/// Largest passkey a user may enter
pub const MAX_PASSKEY_VAL: u32 = 999_999;

pub const MAX_REM_BD_NAME_LEN: usize = 248;
pub const MAX_SERVICE_NAME_LEN: usize = 21;

/// Service id of the RFCOMM multiplexor registration made at reset
pub const SEC_SERVICE_RFC_MUX: u8 = 3;
/// Multiplexor protocol id of RFCOMM
pub const PROTO_RFCOMM: u32 = 3;

/// Slots for remote name observers
pub const SEC_MAX_RMT_NAME_CALLBACKS: usize = 2;

pub const DEFAULT_MAX_DEVICE_RECORDS: usize = 64;
pub const DEFAULT_MAX_SERVICE_RECORDS: usize = 32;

/// Session key size after BR/EDR encryption
pub const MAX_ENC_KEY_SIZE: u8 = 16;

// Timer values (in milliseconds)
pub const SEC_PAIRING_TIMEOUT_MS: u64 = 30000; // pairing watchdog
pub const SEC_WAIT_DISCONNECT_TIMEOUT_MS: u64 = 1000; // after pairing not allowed
pub const SEC_COLLISION_RETRY_MS: u64 = 1000;
pub const SEC_COLLISION_WINDOW_MS: u64 = 5000;
pub const SEC_DEFAULT_AUTH_DELAY_MS: u64 = 0;
pub const SEC_CONNECT_AFTER_REJECT_MS: u64 = 0;

/// Whether an authenticated link key is reachable for `[remote][local]` IO capabilities
pub const IO_CAP_AUTH_MAP: [[bool; IO_CAP_MAX as usize]; IO_CAP_MAX as usize] = [
    // OUT, IO, IN, NONE (local)
    [false, false, true, false], // remote OUT
    [false, true, true, false],  // remote IO
    [true, true, true, false],   // remote IN
    [false, false, false, false], // remote NONE
];
