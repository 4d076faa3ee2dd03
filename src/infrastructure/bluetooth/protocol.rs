//! GATT protocol constants
//!
//! Well-known UUIDs and ATT sizing rules used by the orchestrator and the demo.

use crate::domain::models::WriteType;
use uuid::Uuid;

/// Bluetooth Base UUID (`00000000-0000-1000-8000-00805f9b34fb`).
pub const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit SIG assigned number into a full UUID.
pub const fn uuid_from_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// 16-bit alias of `uuid`, if it lives in the Bluetooth Base UUID range.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask = !(0xFFFF_FFFFu128 << 96);
    if value & mask == BLUETOOTH_BASE_UUID && value >> 112 == 0 {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

pub const GENERIC_ACCESS_SERVICE: Uuid = uuid_from_short(0x1800);
pub const DEVICE_NAME_CHAR: Uuid = uuid_from_short(0x2A00);
pub const BATTERY_SERVICE: Uuid = uuid_from_short(0x180F);
pub const BATTERY_LEVEL_CHAR: Uuid = uuid_from_short(0x2A19);

/// Client Characteristic Configuration descriptor
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = uuid_from_short(0x2902);
/// Characteristic User Description descriptor
pub const CHARACTERISTIC_USER_DESCRIPTION: Uuid = uuid_from_short(0x2901);

/// Nordic LED Button Service
pub const LED_BUTTON_SERVICE: Uuid = Uuid::from_u128(0x00001523_1212_efde_1523_785feabcd123);
/// Button state characteristic (read, notify)
pub const BUTTON_CHAR: Uuid = Uuid::from_u128(0x00001524_1212_efde_1523_785feabcd123);
/// LED characteristic (read, write)
pub const LED_CHAR: Uuid = Uuid::from_u128(0x00001525_1212_efde_1523_785feabcd123);

/// ATT MTU every link starts with
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Largest ATT MTU a central may request
pub const MAX_ATT_MTU: u16 = 517;

/// Opcode + handle overhead of an ATT write
pub const ATT_WRITE_HEADER: u16 = 3;

/// Longest attribute value the ATT protocol allows
pub const MAX_ATTRIBUTE_LENGTH: usize = 512;

/// Maximum value length for a single write at the given MTU.
///
/// Writes without response must fit one packet; writes with response may use
/// the long-write procedure up to the attribute length limit.
pub fn max_write_length(mtu: u16, write_type: WriteType) -> usize {
    match write_type {
        WriteType::WithoutResponse => mtu.saturating_sub(ATT_WRITE_HEADER) as usize,
        WriteType::WithResponse => MAX_ATTRIBUTE_LENGTH,
    }
}

/// Render a value as `0x`-prefixed lower-case hex.
pub fn to_hex(value: &[u8]) -> String {
    let mut out = String::with_capacity(2 + value.len() * 2);
    out.push_str("0x");
    for byte in value {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            CLIENT_CHARACTERISTIC_CONFIGURATION.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(short_uuid(&BATTERY_LEVEL_CHAR), Some(0x2A19));
        assert_eq!(short_uuid(&LED_BUTTON_SERVICE), None);
    }

    #[test]
    fn test_max_write_length() {
        assert_eq!(max_write_length(DEFAULT_ATT_MTU, WriteType::WithoutResponse), 20);
        assert_eq!(max_write_length(MAX_ATT_MTU, WriteType::WithoutResponse), 514);
        assert_eq!(max_write_length(DEFAULT_ATT_MTU, WriteType::WithResponse), 512);
        assert_eq!(max_write_length(0, WriteType::WithoutResponse), 0);
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x01, 0xAB]), "0x01ab");
        assert_eq!(to_hex(&[]), "0x");
    }
}
