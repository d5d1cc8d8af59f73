use super::constants::*;
use super::types::*;

#[test]
fn test_bdaddr_display_and_parse() {
    let addr = BdAddr::new([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
    assert_eq!(addr.to_string(), "11:22:33:44:55:66");

    let parsed: BdAddr = "11:22:33:44:55:66".parse().unwrap();
    assert_eq!(parsed, addr);
}

#[test]
fn test_bdaddr_parse_rejects_garbage() {
    assert!("11:22:33:44:55".parse::<BdAddr>().is_err());
    assert!("11:22:33:44:55:GG".parse::<BdAddr>().is_err());
    assert!("112233445566".parse::<BdAddr>().is_err());
}

#[test]
fn test_bdaddr_any() {
    assert!(BdAddr::ANY.is_any());
    assert!(!BdAddr::new([1, 0, 0, 0, 0, 0]).is_any());
    assert_eq!(BdAddr::from_slice(&[1, 2, 3]), None);
}

#[test]
fn test_device_class_keyboard() {
    let keyboard = DeviceClass([0x40, COD_MAJOR_PERIPHERAL, COD_MINOR_KEYBOARD]);
    assert!(keyboard.is_peripheral());
    assert!(keyboard.is_keyboard());
    assert!(!keyboard.is_handsfree_or_car_audio());
}

#[test]
fn test_device_class_carkit() {
    let carkit = DeviceClass([0x00, COD_MAJOR_AUDIO, COD_MINOR_CAR_AUDIO]);
    assert!(carkit.is_handsfree_or_car_audio());

    let handsfree = DeviceClass([0x00, COD_MAJOR_AUDIO | 0x20, COD_MINOR_CONFM_HANDSFREE]);
    assert_eq!(handsfree.major(), COD_MAJOR_AUDIO);
    assert!(handsfree.is_handsfree_or_car_audio());

    assert!(DeviceClass::EMPTY.is_empty());
}
