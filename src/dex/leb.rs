use crate::dex::error::DexError;

/// 32-bit values never need more than five groups of seven bits.
pub(crate) const LEB128_MAX_BYTES: usize = 5;

#[cfg(test)]
pub(crate) fn encode_uleb128(value: u32) -> Vec<u8> {
    let mut result = Vec::new();
    let mut remaining = value;

    if remaining == 0 {
        result.push(0);
        return result;
    }

    while remaining != 0 {
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;

        if remaining != 0 {
            byte |= 0x80;
        }

        result.push(byte);
    }

    result
}

/// Decodes an unsigned LEB128 value, returning it along with the number of
/// bytes consumed. Encodings that run past five bytes or past the end of the
/// input are rejected; the error offset is relative to `encoded`.
pub(crate) fn decode_uleb128(encoded: &[u8]) -> Result<(u32, usize), DexError> {
    let mut value: u32 = 0;

    for (count, &byte) in encoded.iter().enumerate().take(LEB128_MAX_BYTES) {
        value |= ((byte & 0x7F) as u32).wrapping_shl(7 * count as u32);
        if byte & 0x80 == 0 {
            return Ok((value, count + 1));
        }
    }

    if encoded.len() < LEB128_MAX_BYTES {
        Err(DexError::new("Truncated uleb128").at(encoded.len()))
    } else {
        Err(DexError::new("uleb128 exceeds 5 byte budget").at(LEB128_MAX_BYTES - 1))
    }
}

#[cfg(test)]
pub(crate) fn encode_sleb128(value: i32) -> Vec<u8> {
    let mut result = Vec::new();
    let mut remaining = value;

    loop {
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;

        let is_more =
            !((remaining == 0 && (byte & 0x40) == 0) || (remaining == -1 && (byte & 0x40) != 0));
        if is_more {
            byte |= 0x80;
        }

        result.push(byte);

        if !is_more {
            break;
        }
    }

    result
}

pub(crate) fn decode_sleb128(encoded: &[u8]) -> Result<(i32, usize), DexError> {
    let mut value: i32 = 0;

    for (count, &byte) in encoded.iter().enumerate().take(LEB128_MAX_BYTES) {
        let shift = 7 * count as u32;
        value |= ((byte & 0x7F) as i32).wrapping_shl(shift);
        if byte & 0x80 == 0 {
            // sign-extend from the last group unless all 32 bits are already filled
            let width = shift + 7;
            if (byte & 0x40) != 0 && width < 32 {
                value |= (-1i32).wrapping_shl(width);
            }
            return Ok((value, count + 1));
        }
    }

    if encoded.len() < LEB128_MAX_BYTES {
        Err(DexError::new("Truncated sleb128").at(encoded.len()))
    } else {
        Err(DexError::new("sleb128 exceeds 5 byte budget").at(LEB128_MAX_BYTES - 1))
    }
}

#[cfg(test)]
pub(crate) fn encode_uleb128p1(value: i32) -> Vec<u8> {
    encode_uleb128((value + 1) as u32)
}

pub(crate) fn decode_uleb128p1(encoded: &[u8]) -> Result<(i32, usize), DexError> {
    let (v, c) = decode_uleb128(encoded)?;
    Ok((v.wrapping_sub(1) as i32, c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_uleb128() {
        let cases = vec![
            (0, vec![0x00]),
            (1, vec![0x01]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16256, vec![0x80, 0x7F]),
            (624485, vec![0xE5, 0x8E, 0x26]),
        ];

        for (value, expected) in cases {
            assert_eq!(encode_uleb128(value), expected);
        }
    }

    #[test]
    fn test_decode_uleb128() {
        let cases = vec![
            (vec![0x00], 0, 1),
            (vec![0x7F], 127, 1),
            (vec![0x80, 0x01], 128, 2),
            (vec![0xE5, 0x8E, 0x26, 0xAA], 624485, 3),
            (vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F], u32::MAX, 5),
        ];

        for (encoded, expected, size) in cases {
            assert_eq!(decode_uleb128(&encoded).unwrap(), (expected, size));
        }
    }

    #[test]
    fn test_uleb128_budget() {
        let too_long = [0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        let e = decode_uleb128(&too_long).unwrap_err();
        assert_eq!(e.offset(), Some(4));

        let truncated = [0x80, 0x80];
        let e = decode_uleb128(&truncated).unwrap_err();
        assert_eq!(e.offset(), Some(2));
    }

    #[test]
    fn test_encode_sleb128() {
        let cases = vec![
            (0, vec![0x00]),
            (1, vec![0x01]),
            (-1, vec![0x7F]),
            (-123456, vec![0xC0, 0xBB, 0x78]),
            (-128, vec![0x80, 0x7F]),
        ];

        for (value, expected) in cases {
            assert_eq!(encode_sleb128(value), expected);
        }
    }

    #[test]
    fn test_decode_sleb128() {
        let cases = vec![
            (vec![0x00], 0),
            (vec![0x01], 1),
            (vec![0x7F], -1),
            (vec![0xFF, 0x00], 127),
            (vec![0x80, 0x7F], -128),
            (vec![0xC0, 0xBB, 0x78], -123456),
            (vec![0x80, 0x80, 0x80, 0x80, 0x78], i32::MIN),
        ];

        for (encoded, expected) in cases {
            let (v, _) = decode_sleb128(&encoded).unwrap();
            assert_eq!(v, expected);
        }
    }

    #[test]
    fn test_uleb128p1() {
        assert_eq!(decode_uleb128p1(&[0x00]).unwrap(), (-1, 1));
        assert_eq!(decode_uleb128p1(&encode_uleb128p1(41)).unwrap(), (41, 1));
    }
}
