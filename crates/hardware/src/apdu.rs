//! PC/SC pseudo-APDUs for Type 2 (NTAG / Ultralight) tags.
//!
//! Contactless readers (ACR122U and friends) expose tag memory through the
//! `FF xx` class of pseudo-APDUs defined in PC/SC part 3:
//!
//! | Command       | Bytes                          |
//! |---------------|--------------------------------|
//! | GET DATA UID  | `FF CA 00 00 00`               |
//! | UPDATE BINARY | `FF D6 00 <page> 04 <4 bytes>` |
//!
//! Every response ends with the status word `SW1 SW2`; `90 00` is success.

use crate::HardwareError;

/// Bytes per tag page.
pub const PAGE_SIZE: usize = 4;

pub fn get_uid() -> [u8; 5] {
    [0xFF, 0xCA, 0x00, 0x00, 0x00]
}

pub fn update_binary(page: u8, data: [u8; PAGE_SIZE]) -> [u8; 9] {
    [0xFF, 0xD6, 0x00, page, PAGE_SIZE as u8, data[0], data[1], data[2], data[3]]
}

/// Split a raw response into its payload, failing on anything but `90 00`.
pub fn check_response(response: &[u8]) -> Result<&[u8], HardwareError> {
    match response {
        [payload @ .., 0x90, 0x00] => Ok(payload),
        [.., sw1, sw2] => Err(HardwareError::Status { sw1: *sw1, sw2: *sw2 }),
        _ => Err(HardwareError::Driver {
            message: format!("short APDU response ({} bytes)", response.len()),
            fatal: false,
        }),
    }
}
