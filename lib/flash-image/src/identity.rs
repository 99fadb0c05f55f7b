// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device identity in the vendor region.
//!
//! The vendor region holds the MAC address as 6 raw bytes followed by a
//! one-byte checksum (the low byte of the sum of the MAC bytes), and,
//! somewhere further in, a fixed-size slot containing the NUL-terminated
//! ASCII string `SN=<serial>,CHK=<sum>`, where `<sum>` is the decimal sum
//! of the serial's character codes with no modulus applied.
//!
//! Both checksums are plain sums, so different inputs can produce the same
//! value. That is the device's format; nothing here tries to do better.

use std::fmt;
use std::str::FromStr;

use crate::checksum::additive_sum;
use crate::region::{self, Image, Region, RegionMap};
use crate::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub fn checksum(&self) -> u8 {
        mac_checksum(&self.0)
    }
}

impl TryFrom<&[u8]> for MacAddress {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        bytes.try_into().map(MacAddress).map_err(|_| {
            Error::InvalidMac(format!("expected 6 bytes, got {}", bytes.len()))
        })
    }
}

/// Accepts `00:11:32:a3:67:ef`, `00-11-32-A3-67-EF` and `001132A367EF`.
impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidMac(format!("'{s}'"));
        let digits: Vec<&str> = if s.contains(':') || s.contains('-') {
            s.split([':', '-']).collect()
        } else {
            if s.len() != 12 || !s.is_ascii() {
                return Err(bad());
            }
            (0..12).step_by(2).map(|i| &s[i..i + 2]).collect()
        };
        if digits.len() != 6 {
            return Err(bad());
        }
        let mut out = [0; 6];
        for (o, d) in out.iter_mut().zip(digits) {
            if d.len() != 2 || !d.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(bad());
            }
            *o = u8::from_str_radix(d, 16).map_err(|_| bad())?;
        }
        Ok(MacAddress(out))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

pub fn mac_checksum(mac: &[u8]) -> u8 {
    additive_sum(mac, Some(8)) as u8
}

pub fn serial_checksum(serial: &str) -> u64 {
    additive_sum(serial.as_bytes(), None)
}

/// Where identity fields live. `serial_offset` is relative to `offset`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VendorLayout {
    pub offset: usize,
    pub serial_offset: usize,
    pub serial_slot: usize,
}

impl VendorLayout {
    const MAC_LEN: usize = 6;

    /// The three fields, for an image of `size` bytes. Offsets that don't
    /// fit in a `usize` are out of bounds rather than wrapped.
    fn regions(&self, size: usize) -> Result<[Region; 3]> {
        let at = |rel: usize, len: usize| {
            self.offset.checked_add(rel).ok_or(Error::OutOfBounds {
                offset: self.offset,
                len: rel.saturating_add(len),
                size,
            })
        };
        Ok([
            Region::new("mac", self.offset, Self::MAC_LEN),
            Region::new("mac-checksum", at(Self::MAC_LEN, 1)?, 1),
            Region::new(
                "serial",
                at(self.serial_offset, self.serial_slot)?,
                self.serial_slot,
            ),
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityRecord {
    pub mac: MacAddress,
    pub mac_checksum: u8,
    pub serial: String,
    pub serial_checksum: u64,
}

impl IdentityRecord {
    pub fn new(mac: MacAddress, serial: &str) -> Result<Self> {
        if !serial.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
            return Err(Error::InvalidSerial);
        }
        Ok(Self {
            mac,
            mac_checksum: mac.checksum(),
            serial: serial.to_string(),
            serial_checksum: serial_checksum(serial),
        })
    }

    /// The string stored in the serial slot, without its terminator.
    pub fn encoding(&self) -> String {
        format!("SN={},CHK={}", self.serial, self.serial_checksum)
    }

    /// Whether both stored checksums match the values they protect.
    pub fn is_consistent(&self) -> bool {
        self.mac_checksum == self.mac.checksum()
            && self.serial_checksum == serial_checksum(&self.serial)
    }
}

/// Writes `mac` and `serial` with their checksums into the vendor region.
///
/// The serial slot is zeroed before the string is written so that nothing
/// of a longer previous string survives behind the new terminator. If any
/// check fails the image is left untouched.
pub fn write_identity(
    image: &mut Image,
    layout: &VendorLayout,
    mac: &[u8],
    serial: &str,
) -> Result<IdentityRecord> {
    let record = IdentityRecord::new(MacAddress::try_from(mac)?, serial)?;
    let mut encoded = record.encoding().into_bytes();
    encoded.push(0);
    if encoded.len() > layout.serial_slot {
        return Err(Error::IdentityOverflow {
            needed: encoded.len(),
            slot: layout.serial_slot,
        });
    }

    let [mac, sum, slot] = layout.regions(image.len())?;
    let mut map = RegionMap::new(image.len());
    for r in [&mac, &sum, &slot] {
        map.claim(r.clone(), false)?;
    }

    image.write(mac.offset, &record.mac.0)?;
    image.write(sum.offset, &[record.mac_checksum])?;
    image.zero_fill(slot.offset, slot.len)?;
    image.write(slot.offset, &encoded)?;

    log::debug!(
        "identity at {:#x}: mac {} (checksum {:#04x}), {}",
        layout.offset,
        record.mac,
        record.mac_checksum,
        record.encoding(),
    );
    Ok(record)
}

/// Reads back what [`write_identity`] stored. The returned checksums are
/// the stored ones; use [`IdentityRecord::is_consistent`] to check them.
pub fn read_identity(
    image: &[u8],
    layout: &VendorLayout,
) -> Result<IdentityRecord> {
    let [mac, sum, slot] = layout
        .regions(image.len())?
        .map(|r| region::read(image, r.offset, r.len));
    let mac = MacAddress::try_from(mac?)?;
    let mac_checksum = sum?[0];

    let slot = slot?;
    let text = slot
        .iter()
        .position(|&b| b == 0)
        .map(|n| &slot[..n])
        .ok_or(Error::MalformedIdentity("serial slot is not terminated"))?;
    let text = std::str::from_utf8(text)
        .map_err(|_| Error::MalformedIdentity("serial slot is not text"))?;
    let (serial, chk) = text
        .strip_prefix("SN=")
        .and_then(|rest| rest.rsplit_once(",CHK="))
        .ok_or(Error::MalformedIdentity("expected SN=...,CHK=..."))?;
    let serial_checksum = chk
        .parse()
        .map_err(|_| Error::MalformedIdentity("CHK is not a number"))?;

    Ok(IdentityRecord {
        mac,
        mac_checksum,
        serial: serial.to_string(),
        serial_checksum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: VendorLayout = VendorLayout {
        offset: 0x100,
        serial_offset: 0x20,
        serial_slot: 128,
    };

    #[test]
    fn parse_mac_forms() {
        let want = MacAddress([0x00, 0x11, 0x32, 0xa3, 0x67, 0xef]);
        for s in ["00:11:32:A3:67:EF", "00-11-32-a3-67-ef", "001132A367EF"] {
            assert_eq!(s.parse::<MacAddress>().unwrap(), want, "{s}");
        }
        assert_eq!(want.to_string(), "00:11:32:A3:67:EF");
        for s in [
            "00:11:32:A3:67",
            "0:11:32:A3:67:EF0",
            "zz:11:32:A3:67:EF",
            "",
        ] {
            assert!(s.parse::<MacAddress>().is_err(), "{s}");
        }
    }

    #[test]
    fn known_identity() {
        let mut image = Image::filled(0x400, 0xff);
        let mac = [0x00, 0x11, 0x32, 0xa3, 0x67, 0xef];
        let rec =
            write_identity(&mut image, &LAYOUT, &mac, "1910Q2N321313").unwrap();
        assert_eq!(rec.mac_checksum, 0x3c);
        assert_eq!(rec.serial_checksum, 713);
        assert_eq!(rec.encoding(), "SN=1910Q2N321313,CHK=713");

        assert_eq!(
            image.read(0x100, 7).unwrap(),
            &[0, 0x11, 0x32, 0xa3, 0x67, 0xef, 0x3c]
        );
        let slot = image.read(0x120, 128).unwrap();
        assert_eq!(&slot[..25], b"SN=1910Q2N321313,CHK=713\0");
        assert!(slot[25..].iter().all(|&b| b == 0));

        let back = read_identity(image.as_bytes(), &LAYOUT).unwrap();
        assert_eq!(back, rec);
        assert!(back.is_consistent());
    }

    #[test]
    fn shorter_serial_leaves_no_garbage() {
        let mut image = Image::filled(0x400, 0);
        let mac = [1; 6];
        write_identity(&mut image, &LAYOUT, &mac, "A-VERY-LONG-SERIAL-NUMBER")
            .unwrap();
        write_identity(&mut image, &LAYOUT, &mac, "S1").unwrap();
        let slot = image.read(0x120, 128).unwrap();
        let text_len = "SN=S1,CHK=132".len();
        assert_eq!(&slot[..text_len], b"SN=S1,CHK=132");
        assert!(slot[text_len..].iter().all(|&b| b == 0));
    }

    #[test]
    fn bad_mac_length() {
        let mut image = Image::filled(0x400, 0xff);
        assert!(matches!(
            write_identity(&mut image, &LAYOUT, &[1, 2, 3, 4, 5], "S"),
            Err(Error::InvalidMac(_))
        ));
        assert_eq!(image.as_bytes(), &[0xff; 0x400][..]);
    }

    #[test]
    fn overflowing_slot() {
        let mut image = Image::filled(0x400, 0xff);
        let small = VendorLayout {
            serial_slot: 16,
            ..LAYOUT
        };
        // "SN=ABCDEFG,CHK=" + 3 digits + NUL = 19
        assert_eq!(
            write_identity(&mut image, &small, &[0; 6], "ABCDEFG"),
            Err(Error::IdentityOverflow {
                needed: 19,
                slot: 16
            })
        );
        assert_eq!(image.as_bytes(), &[0xff; 0x400][..]);
    }

    #[test]
    fn slot_must_not_cover_mac() {
        let mut image = Image::filled(0x400, 0xff);
        let clash = VendorLayout {
            serial_offset: 4,
            ..LAYOUT
        };
        assert!(matches!(
            write_identity(&mut image, &clash, &[0; 6], "S"),
            Err(Error::PlanOverlap { .. })
        ));
        let outside = VendorLayout {
            offset: 0x3f0,
            ..LAYOUT
        };
        assert!(matches!(
            write_identity(&mut image, &outside, &[0; 6], "S"),
            Err(Error::OutOfBounds { .. })
        ));
        assert_eq!(image.as_bytes(), &[0xff; 0x400][..]);
    }

    #[test]
    fn huge_offsets_do_not_wrap() {
        let mut image = Image::filled(0x400, 0xff);
        // offset + serial_offset would wrap around to 0x20
        let wrapping = VendorLayout {
            serial_offset: usize::MAX - 0xff + 0x20,
            ..LAYOUT
        };
        assert!(matches!(
            write_identity(&mut image, &wrapping, &[0; 6], "S"),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            read_identity(image.as_bytes(), &wrapping),
            Err(Error::OutOfBounds { .. })
        ));
        let at_end = VendorLayout {
            offset: usize::MAX - 2,
            ..LAYOUT
        };
        assert!(matches!(
            write_identity(&mut image, &at_end, &[0; 6], "S"),
            Err(Error::OutOfBounds { .. })
        ));
        assert_eq!(image.as_bytes(), &[0xff; 0x400][..]);
    }

    #[test]
    fn serial_must_be_printable() {
        let mut image = Image::filled(0x400, 0);
        assert_eq!(
            write_identity(&mut image, &LAYOUT, &[0; 6], "bad\nserial"),
            Err(Error::InvalidSerial)
        );
        assert_eq!(
            write_identity(&mut image, &LAYOUT, &[0; 6], "séri"),
            Err(Error::InvalidSerial)
        );
    }

    #[test]
    fn read_rejects_garbage() {
        let image = Image::filled(0x400, 0xff);
        assert!(matches!(
            read_identity(image.as_bytes(), &LAYOUT),
            Err(Error::MalformedIdentity(_))
        ));
    }
}
