//! One-byte-header RTP extension codec for the latency side channel.
//!
//! The side channel is six 8-byte fields, all under extension id 1 and
//! distinguished by occurrence order (RFC 5285 allows repeating an id):
//!
//! | nth | semantic                         |
//! |-----|----------------------------------|
//! | 0   | frame id                         |
//! | 1   | inter-frame capture period (us)  |
//! | 2   | capture -> convert delta (us)    |
//! | 3   | convert -> encode delta (us)     |
//! | 4   | encode -> payload delta (us)     |
//! | 5   | absolute payload timestamp (us)  |
//!
//! Field values are platform-native endian inside their slots; both ends of
//! the link run the same architecture. Readers must probe each field and
//! abort extraction when any is absent.

use thiserror::Error;

/// Fixed RTP header length before CSRCs.
const RTP_HEADER_LEN: usize = 12;

/// RFC 5285 one-byte-header extension profile.
const ONE_BYTE_PROFILE: u16 = 0xBEDE;

/// Extension element id shared by all latency fields.
const LATENCY_EXT_ID: u8 = 1;

/// Number of fields the producer packs.
pub const FIELD_COUNT: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtensionError {
    #[error("packet shorter than an RTP header")]
    TooShort,
    #[error("not an RTP v2 packet")]
    BadVersion,
    #[error("packet already carries a header extension")]
    ExtensionPresent,
}

/// Offset of the extension area: fixed header plus CSRC list.
fn extension_offset(packet: &[u8]) -> Result<usize, ExtensionError> {
    if packet.len() < RTP_HEADER_LEN {
        return Err(ExtensionError::TooShort);
    }
    if packet[0] >> 6 != 2 {
        return Err(ExtensionError::BadVersion);
    }
    let csrc_count = (packet[0] & 0x0F) as usize;
    let offset = RTP_HEADER_LEN + 4 * csrc_count;
    if packet.len() < offset {
        return Err(ExtensionError::TooShort);
    }
    Ok(offset)
}

fn has_extension(packet: &[u8]) -> bool {
    packet[0] & 0x10 != 0
}

/// Insert a one-byte-header extension block carrying `values` in occurrence
/// order. The packet must not already carry an extension.
pub fn append_extension_u64s(
    packet: &mut Vec<u8>,
    values: &[u64; FIELD_COUNT],
) -> Result<(), ExtensionError> {
    let at = extension_offset(packet)?;
    if has_extension(packet) {
        return Err(ExtensionError::ExtensionPresent);
    }

    // Each element: one header byte + 8 data bytes, padded to a word.
    let elements_len = FIELD_COUNT * 9;
    let padded_len = elements_len.div_ceil(4) * 4;
    let mut block = Vec::with_capacity(4 + padded_len);
    block.extend_from_slice(&ONE_BYTE_PROFILE.to_be_bytes());
    block.extend_from_slice(&((padded_len / 4) as u16).to_be_bytes());
    for value in values {
        block.push((LATENCY_EXT_ID << 4) | 0x07); // len - 1 = 7
        block.extend_from_slice(&value.to_ne_bytes());
    }
    block.resize(4 + padded_len, 0);

    packet.splice(at..at, block);
    packet[0] |= 0x10;
    Ok(())
}

/// Probe for the `nth` occurrence of a latency field. Returns `None` for
/// anything that is not a well-formed packet carrying that field.
pub fn read_extension_u64(packet: &[u8], nth: usize) -> Option<u64> {
    let at = extension_offset(packet).ok()?;
    if !has_extension(packet) {
        return None;
    }
    if packet.len() < at + 4 {
        return None;
    }
    let profile = u16::from_be_bytes([packet[at], packet[at + 1]]);
    if profile != ONE_BYTE_PROFILE {
        return None;
    }
    let words = u16::from_be_bytes([packet[at + 2], packet[at + 3]]) as usize;
    let data = packet.get(at + 4..at + 4 + words * 4)?;

    let mut seen = 0usize;
    let mut pos = 0usize;
    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            // Padding byte.
            pos += 1;
            continue;
        }
        let id = header >> 4;
        if id == 15 {
            break;
        }
        let len = (header & 0x0F) as usize + 1;
        let value = data.get(pos + 1..pos + 1 + len)?;
        if id == LATENCY_EXT_ID {
            if seen == nth {
                if len != 8 {
                    return None;
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(value);
                return Some(u64::from_ne_bytes(bytes));
            }
            seen += 1;
        }
        pos += 1 + len;
    }
    None
}

/// Minimal valid RTP packet for tests.
#[cfg(test)]
pub(crate) fn test_packet(payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; RTP_HEADER_LEN];
    packet[0] = 0x80; // version 2, no padding, no extension, no CSRCs
    packet[1] = 26; // JPEG payload type
    packet.extend_from_slice(payload);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALUES: [u64; FIELD_COUNT] = [7, 16_667, 1_200, 3_400, 150, 1_700_000_000_000_000];

    #[test]
    fn append_then_read_all_fields() {
        let mut packet = test_packet(&[0xAB; 32]);
        append_extension_u64s(&mut packet, &VALUES).unwrap();

        assert!(has_extension(&packet));
        for (nth, expected) in VALUES.iter().enumerate() {
            assert_eq!(read_extension_u64(&packet, nth), Some(*expected));
        }
        // Payload is preserved after the extension block.
        assert_eq!(&packet[packet.len() - 32..], &[0xAB; 32]);
    }

    #[test]
    fn missing_field_probes_as_none() {
        let mut packet = test_packet(&[]);
        append_extension_u64s(&mut packet, &VALUES).unwrap();
        assert_eq!(read_extension_u64(&packet, FIELD_COUNT), None);
    }

    #[test]
    fn untagged_packet_probes_as_none() {
        let packet = test_packet(&[1, 2, 3]);
        assert_eq!(read_extension_u64(&packet, 0), None);
    }

    #[test]
    fn garbage_never_panics() {
        assert_eq!(read_extension_u64(&[], 0), None);
        assert_eq!(read_extension_u64(&[0xFF; 7], 0), None);
        assert_eq!(read_extension_u64(&[0x90; 16], 0), None);
    }

    #[test]
    fn double_tagging_is_refused() {
        let mut packet = test_packet(&[]);
        append_extension_u64s(&mut packet, &VALUES).unwrap();
        assert_eq!(
            append_extension_u64s(&mut packet, &VALUES),
            Err(ExtensionError::ExtensionPresent)
        );
    }

    #[test]
    fn non_rtp_input_is_refused() {
        let mut short = vec![0u8; 4];
        assert_eq!(
            append_extension_u64s(&mut short, &VALUES),
            Err(ExtensionError::TooShort)
        );
        let mut wrong_version = vec![0u8; 16];
        assert_eq!(
            append_extension_u64s(&mut wrong_version, &VALUES),
            Err(ExtensionError::BadVersion)
        );
    }

    #[test]
    fn csrc_list_shifts_extension_area() {
        let mut packet = vec![0u8; RTP_HEADER_LEN + 8];
        packet[0] = 0x80 | 2; // two CSRCs
        append_extension_u64s(&mut packet, &VALUES).unwrap();
        assert_eq!(read_extension_u64(&packet, 0), Some(VALUES[0]));
    }
}
