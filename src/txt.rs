//! DNS TXT record codec.
//!
//! A TXT blob is a run of length-prefixed character strings. Decoding is
//! total: segments that are empty, not UTF-8 or cut short are skipped.

use log::debug;

/// Longest character string a single TXT segment can carry.
pub const MAX_SEGMENT_LEN: usize = u8::MAX as usize;

/// Decodes a raw TXT blob into its entries, in wire order.
pub fn decode(blob: &[u8]) -> Vec<String> {
    let mut entries = Vec::new();
    let mut rest = blob;

    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if len > tail.len() {
            debug!("Dropping truncated TXT segment ({} of {} bytes)", tail.len(), len);
            break;
        }
        let (segment, tail) = tail.split_at(len);
        rest = tail;

        if segment.is_empty() {
            continue;
        }
        match std::str::from_utf8(segment) {
            Ok(entry) => entries.push(entry.to_string()),
            Err(e) => debug!("Dropping non UTF-8 TXT segment: {}", e),
        }
    }

    entries
}

/// Encodes entries into a TXT blob. Entries over 255 bytes cannot be
/// represented and are skipped.
pub fn encode<S: AsRef<str>>(entries: &[S]) -> Vec<u8> {
    let mut blob = Vec::new();
    for entry in entries {
        let bytes = entry.as_ref().as_bytes();
        if bytes.len() > MAX_SEGMENT_LEN {
            debug!("Skipping oversized TXT entry ({} bytes)", bytes.len());
            continue;
        }
        blob.push(bytes.len() as u8);
        blob.extend_from_slice(bytes);
    }
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_wire_order() {
        let blob = b"\x11service_year=1999\x0astandalone";
        assert_eq!(decode(blob), vec!["service_year=1999", "standalone"]);
    }

    #[test]
    fn test_decode_drops_bad_segments() {
        let mut blob = vec![0u8];
        blob.extend_from_slice(b"\x02\xff\xfe");
        blob.extend_from_slice(b"\x03a=b");
        blob.extend_from_slice(b"\x09trunc");
        assert_eq!(decode(&blob), vec!["a=b"]);
    }

    #[test]
    fn test_decode_empty() {
        assert!(decode(&[]).is_empty());
    }

    #[test]
    fn test_encode_skips_oversized() {
        let long = "x".repeat(300);
        let blob = encode(&["k=v".to_string(), long]);
        assert_eq!(blob, b"\x03k=v");
        assert_eq!(decode(&blob), vec!["k=v"]);
    }
}
