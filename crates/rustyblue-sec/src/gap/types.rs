use crate::error::SecError;
use crate::gap::constants::*;
use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Central,
    Peripheral,
}

/// Physical transport a link or a security flag set belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    BrEdr,
    Le,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::BrEdr => write!(f, "BR/EDR"),
            Transport::Le => write!(f, "LE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Public,
    Random,
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            RANDOM_DEVICE_ADDRESS => AddressType::Random,
            _ => AddressType::Public,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random => RANDOM_DEVICE_ADDRESS,
        }
    }
}

bitflags! {
    /// Transports a peer is known to support
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceType: u8 {
        const BREDR = DEVICE_TYPE_BREDR;
        const BLE = DEVICE_TYPE_BLE;
        const DUMO = DEVICE_TYPE_DUMO;
    }
}

/// Bluetooth device address, stored little-endian as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; BD_ADDR_LEN],
}

impl BdAddr {
    /// The all-zero address, used as "no device"
    pub const ANY: BdAddr = BdAddr { bytes: [0; BD_ADDR_LEN] };

    pub fn new(bytes: [u8; BD_ADDR_LEN]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= BD_ADDR_LEN {
            let mut bytes = [0u8; BD_ADDR_LEN];
            bytes.copy_from_slice(&slice[0..BD_ADDR_LEN]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

impl FromStr for BdAddr {
    type Err = SecError;

    /// Parses the display form `AA:BB:CC:DD:EE:FF`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.split(':').collect();
        if s.split(':').count() != BD_ADDR_LEN {
            return Err(SecError::InvalidAddress(s.to_string()));
        }
        let mut bytes = hex::decode(&digits).map_err(|_| SecError::InvalidAddress(s.to_string()))?;
        if bytes.len() != BD_ADDR_LEN {
            return Err(SecError::InvalidAddress(s.to_string()));
        }
        bytes.reverse();
        BdAddr::from_slice(&bytes).ok_or_else(|| SecError::InvalidAddress(s.to_string()))
    }
}

/// Class of Device, three bytes in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceClass(pub [u8; DEV_CLASS_LEN]);

impl DeviceClass {
    pub const EMPTY: DeviceClass = DeviceClass([0; DEV_CLASS_LEN]);

    pub fn major(&self) -> u8 {
        self.0[1] & COD_MAJOR_CLASS_MASK
    }

    pub fn minor(&self) -> u8 {
        self.0[2] & COD_MINOR_CLASS_MASK
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0; DEV_CLASS_LEN]
    }

    pub fn is_peripheral(&self) -> bool {
        self.major() == COD_MAJOR_PERIPHERAL
    }

    /// Keyboards get fixed PIN handling during legacy pairing
    pub fn is_keyboard(&self) -> bool {
        self.is_peripheral() && (self.0[2] & COD_MINOR_KEYBOARD) != 0
    }

    pub fn is_handsfree_or_car_audio(&self) -> bool {
        self.major() == COD_MAJOR_AUDIO
            && (self.minor() == COD_MINOR_CONFM_HANDSFREE || self.minor() == COD_MINOR_CAR_AUDIO)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2])
    }
}
