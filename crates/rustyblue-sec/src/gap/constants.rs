// Address types
pub const PUBLIC_DEVICE_ADDRESS: u8 = 0x00;
pub const RANDOM_DEVICE_ADDRESS: u8 = 0x01;

pub const BD_ADDR_LEN: usize = 6;
pub const DEV_CLASS_LEN: usize = 3;

// Class of Device fields
pub const COD_MAJOR_CLASS_MASK: u8 = 0x1F; // byte 1
pub const COD_MINOR_CLASS_MASK: u8 = 0xFC; // byte 2

pub const COD_MAJOR_AUDIO: u8 = 0x04;
pub const COD_MAJOR_PERIPHERAL: u8 = 0x05;

// Minor classes (major class audio)
pub const COD_MINOR_CONFM_HANDSFREE: u8 = 0x08;
pub const COD_MINOR_CAR_AUDIO: u8 = 0x20;

// Minor classes (major class peripheral)
pub const COD_MINOR_KEYBOARD: u8 = 0x40;

// Device type bits
pub const DEVICE_TYPE_BREDR: u8 = 0x01;
pub const DEVICE_TYPE_BLE: u8 = 0x02;
pub const DEVICE_TYPE_DUMO: u8 = 0x03;
