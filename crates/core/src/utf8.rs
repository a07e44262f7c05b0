//! UTF-8 code unit helpers.
//!
//! TEXT values are indexed by code point while the wire protocol and the
//! variable-size store address raw bytes; these helpers translate between
//! the two without allocating.

use crate::errors::CodecError;

/// Number of code units occupied by the character starting with `unit`,
/// or 0 if `unit` cannot start a sequence.
pub fn cu_count(unit: u8) -> usize {
    match unit {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => 0,
    }
}

/// Decode the code point starting at `buf[0]`; returns it with the number
/// of code units consumed.
pub fn load_cp(buf: &[u8]) -> Result<(char, usize), CodecError> {
    let units = cu_count(*buf.first().ok_or(CodecError::Truncated {
        needed: 1,
        left: 0,
    })?);
    if units == 0 || buf.len() < units {
        return Err(CodecError::BadUtf8(0));
    }
    let raw = match units {
        1 => u32::from(buf[0]),
        2 => (u32::from(buf[0] & 0x1F) << 6) | u32::from(buf[1] & 0x3F),
        3 => {
            (u32::from(buf[0] & 0x0F) << 12)
                | (u32::from(buf[1] & 0x3F) << 6)
                | u32::from(buf[2] & 0x3F)
        }
        _ => {
            (u32::from(buf[0] & 0x07) << 18)
                | (u32::from(buf[1] & 0x3F) << 12)
                | (u32::from(buf[2] & 0x3F) << 6)
                | u32::from(buf[3] & 0x3F)
        }
    };
    if buf[1..units].iter().any(|&b| b & 0xC0 != 0x80) {
        return Err(CodecError::BadUtf8(0));
    }
    let cp = char::from_u32(raw).ok_or(CodecError::BadUtf8(0))?;
    Ok((cp, units))
}

/// Code units required to store `cp`.
pub fn store_size(cp: char) -> usize {
    cp.len_utf8()
}

/// Encode `cp` at the start of `out`, returning the code units written.
pub fn store_cp(cp: char, out: &mut [u8]) -> usize {
    cp.encode_utf8(out).len()
}

/// Byte offset of the code point at position `index`, or the total length
/// when `index` equals the code point count.
pub fn byte_offset_of(text: &str, index: u64) -> Option<usize> {
    let mut seen = 0u64;
    for (off, _) in text.char_indices() {
        if seen == index {
            return Some(off);
        }
        seen += 1;
    }
    (seen == index).then_some(text.len())
}

/// Count of code points in `text`.
pub fn cp_count(text: &str) -> u64 {
    text.chars().count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_counts_match_encoding() {
        for cp in ['a', 'Ș', '€', '𐍈'] {
            let mut buf = [0u8; 4];
            let written = store_cp(cp, &mut buf);
            assert_eq!(written, store_size(cp));
            assert_eq!(cu_count(buf[0]), written);
            assert_eq!(load_cp(&buf[..written]).unwrap(), (cp, written));
        }
    }

    #[test]
    fn continuation_byte_cannot_start_a_character() {
        assert_eq!(cu_count(0x80), 0);
        assert!(load_cp(&[0x80]).is_err());
    }

    #[test]
    fn byte_offsets_follow_code_points() {
        let text = "aȘ€𐍈z";
        assert_eq!(byte_offset_of(text, 0), Some(0));
        assert_eq!(byte_offset_of(text, 1), Some(1));
        assert_eq!(byte_offset_of(text, 2), Some(3));
        assert_eq!(byte_offset_of(text, 3), Some(6));
        assert_eq!(byte_offset_of(text, 4), Some(10));
        assert_eq!(byte_offset_of(text, 5), Some(text.len()));
        assert_eq!(byte_offset_of(text, 6), None);
    }

    #[test]
    fn truncated_sequence_rejected() {
        let mut buf = [0u8; 4];
        let written = store_cp('€', &mut buf);
        assert!(load_cp(&buf[..written - 1]).is_err());
    }
}
