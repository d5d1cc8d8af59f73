//! Protocol/Service Multiplexer (PSM) values for L2CAP
//!
//! The security manager keys service requirements by PSM. Only the fixed
//! values it treats specially are named here.

/// Not a registrable PSM; marks a direct encryption request
pub const PSM_NONE: u16 = 0x0000;
/// Service Discovery Protocol, never needs security
pub const PSM_SDP: u16 = 0x0001;
/// RFCOMM multiplexor
pub const PSM_RFCOMM: u16 = 0x0003;
pub const PSM_BNEP: u16 = 0x000F;
pub const PSM_HID_CONTROL: u16 = 0x0011;
pub const PSM_HID_INTERRUPT: u16 = 0x0013;
pub const PSM_AVCTP: u16 = 0x0017;
pub const PSM_AVDTP: u16 = 0x0019;

/// Dynamic PSMs must be odd with the low bit of the upper byte clear
pub fn is_valid_psm(psm: u16) -> bool {
    (psm & 0x0001) == 0x0001 && (psm & 0x0100) == 0
}

/// Short protocol name for logging
pub fn psm_name(psm: u16) -> &'static str {
    match psm {
        PSM_NONE => "none",
        PSM_SDP => "SDP",
        PSM_RFCOMM => "RFCOMM",
        PSM_BNEP => "BNEP",
        PSM_HID_CONTROL => "HID_CONTROL",
        PSM_HID_INTERRUPT => "HID_INTERRUPT",
        PSM_AVCTP => "AVCTP",
        PSM_AVDTP => "AVDTP",
        _ => "dynamic",
    }
}
