//! Unit tests for HCI packet parsing and serialization

use super::constants::*;
use super::event::*;
use super::packet::*;
use crate::error::HciError;
use crate::gap::{BdAddr, DeviceClass};

fn addr() -> BdAddr {
    BdAddr::new([0x66, 0x55, 0x44, 0x33, 0x22, 0x11])
}

#[test]
fn test_hci_command_serialization() {
    // Test Authentication Requested command
    let command = HciCommand::AuthenticationRequested { handle: 0x0040 };
    let packet = command.to_packet();

    assert_eq!(packet[0], HCI_COMMAND_PKT);

    // Opcode: Authentication Requested (0x0011)
    let opcode = u16::from_le_bytes([packet[1], packet[2]]);
    assert_eq!(opcode, 0x0411); // OGF_LINK_CTL << 10 | OCF_AUTHENTICATION_REQUESTED

    // Param length: 2
    assert_eq!(packet[3], 2);
    assert_eq!(u16::from_le_bytes([packet[4], packet[5]]), 0x0040);

    // Test Set Connection Encryption command
    let command = HciCommand::SetConnectionEncryption {
        handle: 0x0041,
        enable: true,
    };
    let packet = command.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x0413);
    assert_eq!(packet[3], 3);
    assert_eq!(packet[6], 0x01);

    // Test Disconnect command
    let command = HciCommand::Disconnect {
        handle: 0x0040,
        reason: HCI_ERR_PEER_USER,
    };

    let packet = command.to_packet();

    // Opcode: Disconnect (0x0006)
    let opcode = u16::from_le_bytes([packet[1], packet[2]]);
    assert_eq!(opcode, 0x0406); // OGF_LINK_CTL << 10 | OCF_DISCONNECT

    // Parameters
    assert_eq!(packet[3], 3);
    assert_eq!(u16::from_le_bytes([packet[4], packet[5]]), 0x0040); // handle
    assert_eq!(packet[6], 0x13); // reason
}

#[test]
fn test_pin_code_reply_is_padded() {
    let command = HciCommand::PinCodeRequestReply {
        bd_addr: addr(),
        pin: b"1234".to_vec(),
    };
    let packet = command.to_packet();

    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x040D);
    // address + length + 16 byte pin
    assert_eq!(packet[3], 23);
    assert_eq!(&packet[4..10], addr().as_slice());
    assert_eq!(packet[10], 4);
    assert_eq!(&packet[11..15], b"1234");
    assert!(packet[15..].iter().all(|&b| b == 0));
}

#[test]
fn test_host_controller_commands() {
    let packet = HciCommand::WritePinType { pin_type: HCI_PIN_TYPE_FIXED }.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x0C0A);
    assert_eq!(&packet[3..], &[1, HCI_PIN_TYPE_FIXED]);

    let packet = HciCommand::WriteAuthenticationEnable { enable: true }.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x0C20);
    assert_eq!(&packet[3..], &[1, 1]);

    let packet = HciCommand::ReadLocalOobData.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x0C57);
    assert_eq!(packet[3], 0);
}

#[test]
fn test_io_capability_reply_layout() {
    let command = HciCommand::IoCapabilityRequestReply {
        bd_addr: addr(),
        io_cap: 1,
        oob_data: 0,
        auth_req: 5,
    };
    let packet = command.to_packet();
    assert_eq!(command.opcode(), 0x042B);
    assert_eq!(packet[3], 9);
    assert_eq!(&packet[10..], &[1, 0, 5]);
}

#[test]
fn test_hci_event_parsing() {
    // Authentication complete: status, handle
    let data = vec![EVT_AUTH_COMPLETE, 0x03, 0x00, 0x40, 0x00];
    let event = HciEvent::parse(&data).unwrap();

    assert_eq!(event.event_code, EVT_AUTH_COMPLETE);
    assert_eq!(event.parameter_total_length, 3);

    let decoded = SecurityEvent::decode(&event).unwrap();
    assert_eq!(
        decoded,
        SecurityEvent::AuthenticationComplete {
            status: HCI_SUCCESS,
            handle: 0x0040
        }
    );

    // Truncated
    assert!(HciEvent::parse(&[EVT_AUTH_COMPLETE, 0x03, 0x00]).is_none());
}

#[test]
fn test_decode_link_key_notification() {
    let mut params = addr().as_slice().to_vec();
    params.extend_from_slice(&[0xAB; 16]);
    params.push(0x08);
    let event = HciEvent::new(EVT_LINK_KEY_NOTIFICATION, params);

    match SecurityEvent::decode(&event).unwrap() {
        SecurityEvent::LinkKeyNotification { bd_addr, link_key, key_type } => {
            assert_eq!(bd_addr, addr());
            assert_eq!(link_key, [0xAB; 16]);
            assert_eq!(key_type, 0x08);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_decode_connection_request_and_name() {
    let mut params = addr().as_slice().to_vec();
    params.extend_from_slice(&[0x04, 0x04, 0x20]);
    params.push(0x01);
    let event = HciEvent::new(EVT_CONN_REQUEST, params);
    assert_eq!(
        SecurityEvent::decode(&event).unwrap(),
        SecurityEvent::ConnectionRequest {
            bd_addr: addr(),
            dev_class: DeviceClass([0x04, 0x04, 0x20]),
            link_type: 0x01,
        }
    );

    let mut params = vec![HCI_SUCCESS];
    params.extend_from_slice(addr().as_slice());
    let mut name = [0u8; HCI_MAX_NAME_LEN];
    name[..7].copy_from_slice(b"Headset");
    params.extend_from_slice(&name);
    let event = HciEvent::new(EVT_REMOTE_NAME_REQ_COMPLETE, params);
    assert_eq!(
        SecurityEvent::decode(&event).unwrap(),
        SecurityEvent::RemoteNameRequestComplete {
            status: HCI_SUCCESS,
            bd_addr: addr(),
            name: "Headset".to_string(),
        }
    );
}

#[test]
fn test_decode_read_local_oob_complete() {
    let mut params = vec![0x01];
    params.extend_from_slice(&0x0C57u16.to_le_bytes());
    params.push(HCI_SUCCESS);
    params.extend_from_slice(&[0x11; 16]);
    params.extend_from_slice(&[0x22; 16]);
    let event = HciEvent::new(EVT_CMD_COMPLETE, params);

    assert_eq!(
        SecurityEvent::decode(&event).unwrap(),
        SecurityEvent::LocalOobDataComplete {
            status: HCI_SUCCESS,
            c: [0x11; 16],
            r: [0x22; 16],
        }
    );
}

#[test]
fn test_decode_errors() {
    let event = HciEvent::new(EVT_ENCRYPTION_CHANGE, vec![0x00, 0x40]);
    assert_eq!(SecurityEvent::decode(&event), Err(HciError::InvalidPacketFormat));

    let event = HciEvent::new(0x3E, vec![0x02]);
    assert_eq!(SecurityEvent::decode(&event), Err(HciError::UnexpectedEvent(0x3E)));
}

#[test]
fn test_status_text() {
    assert_eq!(hci_status_text(HCI_SUCCESS), "success");
    assert_eq!(hci_status_text(HCI_ERR_PAIRING_NOT_ALLOWED), "pairing not allowed");
    assert_eq!(hci_status_text(HCI_ERR_DIFF_TRANSACTION_COLLISION), "different transaction collision");
}
