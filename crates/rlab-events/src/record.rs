use std::path::Path;

use tracing::{debug, warn};

/// `u64 length` followed by the masked crc of those eight bytes.
pub(crate) const HEADER_LEN: usize = 12;
pub(crate) const FOOTER_LEN: usize = 4;

const CRC_MASK_DELTA: u32 = 0xa282_ead8;

pub(crate) fn masked_crc(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes).rotate_right(15).wrapping_add(CRC_MASK_DELTA)
}

pub(crate) fn frame(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + data.len() + FOOTER_LEN);
    let len = (data.len() as u64).to_le_bytes();
    out.extend_from_slice(&len);
    out.extend_from_slice(&masked_crc(&len).to_le_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(&masked_crc(data).to_le_bytes());
    out
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

/// Splits a TFRecord buffer into record payloads.
///
/// A file that is still being written can end mid-record; everything before
/// the incomplete record is returned. A checksum mismatch stops the scan as
/// well, since nothing after it can be trusted to be aligned.
pub(crate) fn split_records<'a>(buf: &'a [u8], path: &Path) -> Vec<&'a [u8]> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let rest = &buf[pos..];
        if rest.len() < HEADER_LEN {
            debug!(path = %path.display(), offset = pos, "partial record header at end of file");
            break;
        }
        let len_bytes = &rest[..8];
        if read_u32(&rest[8..12]) != masked_crc(len_bytes) {
            warn!(path = %path.display(), offset = pos, "record length checksum mismatch");
            break;
        }
        let mut len_buf = [0u8; 8];
        len_buf.copy_from_slice(len_bytes);
        let len = match usize::try_from(u64::from_le_bytes(len_buf)) {
            Ok(len) => len,
            Err(_) => {
                warn!(path = %path.display(), offset = pos, "record length overflows usize");
                break;
            }
        };
        let needed = HEADER_LEN
            .checked_add(len)
            .and_then(|n| n.checked_add(FOOTER_LEN));
        let needed = match needed {
            Some(n) if n <= rest.len() => n,
            _ => {
                debug!(path = %path.display(), offset = pos, len, "partial record body at end of file");
                break;
            }
        };
        let data = &rest[HEADER_LEN..HEADER_LEN + len];
        if read_u32(&rest[HEADER_LEN + len..needed]) != masked_crc(data) {
            warn!(path = %path.display(), offset = pos, "record data checksum mismatch");
            break;
        }
        records.push(data);
        pos += needed;
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> &'static Path {
        Path::new("events.out.tfevents.test")
    }

    #[test]
    fn masked_crc_matches_tensorflow_reference() {
        // crc32c("") == 0, masked value is just the delta.
        assert_eq!(masked_crc(b""), CRC_MASK_DELTA);
        // crc32c("123456789") == 0xe3069283
        let expected = 0xe306_9283u32.rotate_right(15).wrapping_add(CRC_MASK_DELTA);
        assert_eq!(masked_crc(b"123456789"), expected);
    }

    #[test]
    fn splits_consecutive_records() {
        let mut buf = frame(b"first");
        buf.extend(frame(b"second"));
        let records = split_records(&buf, path());
        assert_eq!(records, vec![&b"first"[..], &b"second"[..]]);
    }

    #[test]
    fn truncated_tail_keeps_complete_records() {
        let mut buf = frame(b"complete");
        let partial = frame(b"still being flushed");
        buf.extend_from_slice(&partial[..partial.len() - 6]);
        let records = split_records(&buf, path());
        assert_eq!(records, vec![&b"complete"[..]]);
    }

    #[test]
    fn corrupt_payload_stops_scan() {
        let mut buf = frame(b"good");
        let mut bad = frame(b"bad!");
        bad[HEADER_LEN] ^= 0xff;
        buf.extend(bad);
        buf.extend(frame(b"unreachable"));
        let records = split_records(&buf, path());
        assert_eq!(records, vec![&b"good"[..]]);
    }
}
