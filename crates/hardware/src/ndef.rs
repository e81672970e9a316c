//! NDEF encoding of a single URI record, laid out for Type 2 tag memory.

use crate::apdu::PAGE_SIZE;

/// URI identifier codes from the NFC Forum URI record type definition.
/// Longer prefixes precede the shorter ones they start with.
const URI_PREFIXES: &[(u8, &str)] = &[
    (0x01, "http://www."),
    (0x02, "https://www."),
    (0x03, "http://"),
    (0x04, "https://"),
    (0x05, "tel:"),
    (0x06, "mailto:"),
];

const TNF_WELL_KNOWN: u8 = 0x01;
const FLAG_MB: u8 = 0x80;
const FLAG_ME: u8 = 0x40;
const FLAG_SR: u8 = 0x10;
const RTD_URI: u8 = b'U';

const TLV_NDEF: u8 = 0x03;
const TLV_TERMINATOR: u8 = 0xFE;

/// One-record NDEF message holding `url` as a well-known URI record.
///
/// Uses the short-record form when the payload fits in one length byte.
pub fn uri_message(url: &str) -> Vec<u8> {
    let (code, rest) = URI_PREFIXES
        .iter()
        .find_map(|(code, prefix)| url.strip_prefix(prefix).map(|rest| (*code, rest)))
        .unwrap_or((0x00, url));

    let mut payload = Vec::with_capacity(rest.len() + 1);
    payload.push(code);
    payload.extend_from_slice(rest.as_bytes());

    let mut record = Vec::with_capacity(payload.len() + 7);
    if payload.len() <= u8::MAX as usize {
        record.push(FLAG_MB | FLAG_ME | FLAG_SR | TNF_WELL_KNOWN);
        record.push(1);
        record.push(payload.len() as u8);
    } else {
        record.push(FLAG_MB | FLAG_ME | TNF_WELL_KNOWN);
        record.push(1);
        record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    }
    record.push(RTD_URI);
    record.extend_from_slice(&payload);
    record
}

/// Wrap an NDEF message in its TLV and append the terminator TLV.
pub fn tlv(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 5);
    out.push(TLV_NDEF);
    if message.len() < 0xFF {
        out.push(message.len() as u8);
    } else {
        out.push(0xFF);
        out.extend_from_slice(&(message.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(message);
    out.push(TLV_TERMINATOR);
    out
}

/// Split `bytes` into zero-padded 4-byte pages.
pub fn pages(bytes: &[u8]) -> Vec<[u8; PAGE_SIZE]> {
    bytes
        .chunks(PAGE_SIZE)
        .map(|chunk| {
            let mut page = [0u8; PAGE_SIZE];
            page[..chunk.len()].copy_from_slice(chunk);
            page
        })
        .collect()
}

/// Everything that has to land in user memory to store `url`.
pub fn url_pages(url: &str) -> Vec<[u8; PAGE_SIZE]> {
    pages(&tlv(&uri_message(url)))
}
