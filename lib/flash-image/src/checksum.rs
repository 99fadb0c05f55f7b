// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checksum primitives and the little-endian integer codec the target
//! hardware uses for every multi-byte field.

use byteorder::{ByteOrder, LittleEndian};

use crate::{region, Result};

/// CRC-32/ISO-HDLC: reflected polynomial 0xEDB88320, initial value and final
/// XOR of 0xFFFFFFFF. This is the CRC that zlib, U-Boot and most
/// bootloaders call "crc32".
static CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Sums byte values. With `width` of `Some(n)` the result is reduced modulo
/// `2^n`; with `None` it is the plain sum.
pub fn additive_sum(bytes: &[u8], width: Option<u32>) -> u64 {
    let sum = bytes.iter().map(|&b| u64::from(b)).sum::<u64>();
    match width {
        Some(w) if w < 64 => sum & ((1u64 << w) - 1),
        _ => sum,
    }
}

pub fn pack_u32_le(value: u32) -> [u8; 4] {
    let mut out = [0; 4];
    LittleEndian::write_u32(&mut out, value);
    out
}

/// Reads a little-endian `u32` from the start of `bytes`.
pub fn unpack_u32_le(bytes: &[u8]) -> Result<u32> {
    Ok(LittleEndian::read_u32(region::read(bytes, 0, 4)?))
}

/// Reads a little-endian `u64` at `offset`.
pub fn read_u64_le(bytes: &[u8], offset: usize) -> Result<u64> {
    Ok(LittleEndian::read_u64(region::read(bytes, offset, 8)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_check_value() {
        // The catalogue check value for CRC-32/ISO-HDLC.
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn additive_sum_widths() {
        let mac = [0x00, 0x11, 0x32, 0xa3, 0x67, 0xef];
        assert_eq!(additive_sum(&mac, None), 0x23c);
        assert_eq!(additive_sum(&mac, Some(8)), 0x3c);
        assert_eq!(additive_sum(&mac, Some(64)), 0x23c);
        assert_eq!(additive_sum(&[], Some(8)), 0);
    }

    #[test]
    fn u32_is_little_endian() {
        assert_eq!(pack_u32_le(0x1234_5678), [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(
            unpack_u32_le(&[0x78, 0x56, 0x34, 0x12, 0xff]).unwrap(),
            0x1234_5678
        );
        assert!(unpack_u32_le(&[1, 2, 3]).is_err());
    }

    #[test]
    fn u64_read() {
        let buf = [0, 1, 0, 0, 0, 0, 0, 0, 0x80];
        assert_eq!(read_u64_le(&buf, 1).unwrap(), 0x8000_0000_0000_0001);
        assert!(read_u64_le(&buf, 2).is_err());
    }
}
