// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bootloader environment blocks.
//!
//! On flash, an environment block is a fixed-size area laid out as
//!
//! ```text
//!   plain:    [crc32 LE: 4][data ...........................]
//!   flagged:  [crc32 LE: 4][flag: 1][data ..................]
//! ```
//!
//! where `data` is a sequence of `key=value\0` entries, followed by one more
//! `\0`, then zero padding out to the end of the block. The flagged layout
//! is the one U-Boot uses for redundant environments.
//!
//! Which bytes the CRC covers is not fixed. Most bootloaders checksum
//! everything after the CRC field, but some builds were found to check only
//! the data, and some check a whole erase sector that extends past the end
//! of the environment into whatever follows it. [`ChecksumScope`] makes the
//! choice explicit.

use std::ops::Range;

use indexmap::IndexMap;

use crate::checksum::{crc32, pack_u32_le, unpack_u32_le};
use crate::region::{self, Image};
use crate::{Error, Result};

/// Flag byte value marking a redundant copy as the active one.
pub const FLAG_ACTIVE: u8 = 0x01;

const CRC_LEN: usize = 4;

/// What to do when the same key shows up twice in input.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Duplicates {
    /// Fail with [`Error::DuplicateKey`].
    #[default]
    Reject,
    /// Keep the last value, at the position of the first occurrence.
    LastWins,
}

/// An ordered set of environment variables.
///
/// Keys are unique. Setting a key that already exists replaces its value
/// but keeps its original position, so re-serializing a parsed environment
/// with one variable changed only changes that one entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvEntries {
    map: IndexMap<Vec<u8>, Vec<u8>>,
}

impl EnvEntries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(
        pairs: impl IntoIterator<Item = (K, V)>,
        duplicates: Duplicates,
    ) -> Result<Self>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut out = Self::new();
        for (k, v) in pairs {
            let (k, v) = (k.as_ref(), v.as_ref());
            if out.set(k, v)?.is_some() && duplicates == Duplicates::Reject {
                return Err(Error::DuplicateKey(
                    String::from_utf8_lossy(k).into_owned(),
                ));
            }
        }
        Ok(out)
    }

    /// Sets `key` to `value`, returning the previous value if there was one.
    ///
    /// Keys must be non-empty and free of `=` and NUL; values must be free
    /// of NUL. An empty value is fine.
    pub fn set(
        &mut self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        let (key, value) = (key.as_ref(), value.as_ref());
        if key.is_empty()
            || key.iter().any(|&b| b == b'=' || b == 0)
            || value.contains(&0)
        {
            let mut shown = key.to_vec();
            shown.push(b'=');
            shown.extend_from_slice(value);
            return Err(Error::InvalidEntry(
                String::from_utf8_lossy(&shown).escape_debug().to_string(),
            ));
        }
        Ok(self.map.insert(key.to_vec(), value.to_vec()))
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<&[u8]> {
        self.map.get(key.as_ref()).map(Vec::as_slice)
    }

    pub fn remove(&mut self, key: impl AsRef<[u8]>) -> Option<Vec<u8>> {
        self.map.shift_remove(key.as_ref())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.map.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Number of bytes [`EnvEntries::serialize`] produces, terminator
    /// included.
    pub fn serialized_len(&self) -> usize {
        if self.map.is_empty() {
            return 2;
        }
        self.map.iter().map(|(k, v)| k.len() + v.len() + 2).sum::<usize>()
            + 1
    }

    /// `key=value\0` for every entry, then a final `\0`. An empty set
    /// serializes as two NULs so that the end marker is always a double
    /// NUL.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());
        for (k, v) in &self.map {
            out.extend_from_slice(k);
            out.push(b'=');
            out.extend_from_slice(v);
            out.push(0);
        }
        if self.map.is_empty() {
            out.push(0);
        }
        out.push(0);
        out
    }

    /// Parses serialized entries, stopping at the first empty entry (the
    /// double NUL). Anything after that is ignored, so zero padding and
    /// erased flash both parse fine. Repeated keys follow
    /// [`Duplicates::LastWins`], which is how bootloaders import them too.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut out = Self::new();
        let mut rest = data;
        loop {
            let Some(nul) = rest.iter().position(|&b| b == 0) else {
                return Err(Error::MalformedEnv("missing terminator"));
            };
            let entry = &rest[..nul];
            rest = &rest[nul + 1..];
            if entry.is_empty() {
                return Ok(out);
            }
            let Some(eq) = entry.iter().position(|&b| b == b'=') else {
                return Err(Error::InvalidEntry(
                    String::from_utf8_lossy(entry).into_owned(),
                ));
            };
            out.set(&entry[..eq], &entry[eq + 1..])?;
        }
    }
}

/// Which bytes the block CRC is computed over.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ChecksumScope {
    /// Everything after the CRC field to the end of the block, flag byte
    /// included.
    #[default]
    Block,
    /// Only the data area; the flag byte of a flagged block is left out.
    Data,
    /// Everything after the CRC field up to `end` bytes from the start of
    /// the block, which may be past the end of the block. The extra bytes
    /// come from whatever the surrounding image holds there, so this scope
    /// can only be used through [`write_env`] and [`read_env`].
    Extended { end: usize },
}

/// Size and layout of an environment block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EnvFormat {
    pub size: usize,
    pub flagged: bool,
    pub scope: ChecksumScope,
}

impl EnvFormat {
    pub fn plain(size: usize) -> Self {
        Self {
            size,
            flagged: false,
            scope: ChecksumScope::Block,
        }
    }

    pub fn flagged(size: usize) -> Self {
        Self {
            flagged: true,
            ..Self::plain(size)
        }
    }

    pub fn with_scope(self, scope: ChecksumScope) -> Self {
        Self { scope, ..self }
    }

    /// Bytes in front of the data area.
    pub fn header_len(&self) -> usize {
        CRC_LEN + usize::from(self.flagged)
    }

    /// Room for serialized entries, terminator included.
    pub fn capacity(&self) -> usize {
        self.size.saturating_sub(self.header_len())
    }

    /// The checksummed range, relative to the start of the block.
    pub fn scope_range(&self) -> Result<Range<usize>> {
        if self.size < self.header_len() {
            return Err(Error::InvalidScope(format!(
                "block of {:#x} bytes has no room for its header",
                self.size
            )));
        }
        match self.scope {
            ChecksumScope::Block => Ok(CRC_LEN..self.size),
            ChecksumScope::Data => Ok(self.header_len()..self.size),
            ChecksumScope::Extended { end } if end >= self.size => {
                Ok(CRC_LEN..end)
            }
            ChecksumScope::Extended { end } => Err(Error::InvalidScope(
                format!(
                    "ends at {end:#x}, before the end of the {:#x} byte block",
                    self.size
                ),
            )),
        }
    }

    fn is_extended(&self) -> bool {
        matches!(self.scope, ChecksumScope::Extended { .. })
    }
}

/// Builds a complete block with its CRC filled in.
///
/// Fails with [`Error::EnvOverflow`] if the entries don't fit, and with
/// [`Error::InvalidScope`] for an [`ChecksumScope::Extended`] scope, which
/// needs the surrounding image.
pub fn encode(entries: &EnvEntries, format: &EnvFormat) -> Result<Vec<u8>> {
    if format.is_extended() {
        return Err(Error::InvalidScope(
            "reaches outside the block; write it into an image instead"
                .to_string(),
        ));
    }
    let scope = format.scope_range()?;
    let mut block = vec![0; format.size];
    fill_block(&mut block, entries, format)?;
    let crc = crc32(&block[scope]);
    block[..CRC_LEN].copy_from_slice(&pack_u32_le(crc));
    Ok(block)
}

/// Writes flag and serialized entries into `block`, which must be zeroed
/// and exactly `format.size` long. The CRC field is left alone.
fn fill_block(
    block: &mut [u8],
    entries: &EnvEntries,
    format: &EnvFormat,
) -> Result<()> {
    let needed = entries.serialized_len();
    let available = format.capacity();
    if needed > available {
        return Err(Error::EnvOverflow { needed, available });
    }
    if format.flagged {
        block[CRC_LEN] = FLAG_ACTIVE;
    }
    let start = format.header_len();
    block[start..start + needed].copy_from_slice(&entries.serialize());
    Ok(())
}

/// Parses the entries out of a block, ignoring its CRC.
pub fn decode(block: &[u8], format: &EnvFormat) -> Result<EnvEntries> {
    if block.len() < format.header_len() {
        return Err(Error::MalformedEnv("shorter than its header"));
    }
    EnvEntries::parse(&block[format.header_len()..])
}

/// An environment block as found on flash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvBlock {
    /// CRC stored in the block.
    pub checksum: u32,
    /// CRC recomputed over the configured scope.
    pub computed: u32,
    pub flag: Option<u8>,
    pub entries: EnvEntries,
    pub total_size: usize,
}

impl EnvBlock {
    pub fn checksum_ok(&self) -> bool {
        self.checksum == self.computed
    }
}

fn scope_in_image(
    image_len: usize,
    offset: usize,
    format: &EnvFormat,
) -> Result<Range<usize>> {
    region::checked_range(offset, format.size, image_len)?;
    let scope = format.scope_range()?;
    let start = offset + scope.start;
    region::checked_range(start, scope.len(), image_len).map_err(|_| {
        Error::InvalidScope(format!(
            "{start:#x}..{:#x} runs past the end of the image",
            offset.saturating_add(scope.end)
        ))
    })
}

/// Writes a block for `entries` into `image` at `offset` and returns the
/// CRC that was stored.
///
/// Everything is checked before the image is touched. For an
/// [`ChecksumScope::Extended`] scope the CRC covers the freshly written
/// block plus the image bytes after it, as they are at the time of the
/// call; write anything that should be covered before writing the
/// environment.
pub fn write_env(
    image: &mut Image,
    offset: usize,
    entries: &EnvEntries,
    format: &EnvFormat,
) -> Result<u32> {
    let scope = scope_in_image(image.len(), offset, format)?;
    let mut block = vec![0; format.size];
    fill_block(&mut block, entries, format)?;

    image.write(offset, &block)?;
    let crc = crc32(image.read(scope.start, scope.len())?);
    image
        .slice_mut(offset, CRC_LEN)?
        .copy_from_slice(&pack_u32_le(crc));

    log::debug!(
        "env at {offset:#x}: {} entries, {:#x} of {:#x} bytes used, \
         crc {crc:#010x} over {:#x}..{:#x}",
        entries.len(),
        entries.serialized_len(),
        format.capacity(),
        scope.start,
        scope.end,
    );
    Ok(crc)
}

/// Reads the block at `offset` out of `image`, recomputing its CRC over
/// the configured scope.
pub fn read_env(
    image: &[u8],
    offset: usize,
    format: &EnvFormat,
) -> Result<EnvBlock> {
    let scope = scope_in_image(image.len(), offset, format)?;
    let block = region::read(image, offset, format.size)?;
    Ok(EnvBlock {
        checksum: unpack_u32_le(block)?,
        computed: crc32(&image[scope]),
        flag: format.flagged.then(|| block[CRC_LEN]),
        entries: decode(block, format)?,
        total_size: format.size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-at-a-time CRC-32, to check against something that isn't the
    /// table-driven implementation under test.
    fn reference_crc32(data: &[u8]) -> u32 {
        let mut crc = 0xffff_ffffu32;
        for &b in data {
            crc ^= u32::from(b);
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xedb8_8320
                } else {
                    crc >> 1
                };
            }
        }
        !crc
    }

    fn sample() -> EnvEntries {
        EnvEntries::from_pairs(
            [("bootcmd", "run x"), ("ethaddr", "00:11:32:A3:67:EF")],
            Duplicates::Reject,
        )
        .unwrap()
    }

    #[test]
    fn serialize_layout() {
        assert_eq!(
            sample().serialize(),
            b"bootcmd=run x\0ethaddr=00:11:32:A3:67:EF\0\0"
        );
        assert_eq!(EnvEntries::new().serialize(), b"\0\0");
        assert_eq!(sample().serialized_len(), sample().serialize().len());
    }

    #[test]
    fn four_kib_block_crc() {
        let block = encode(&sample(), &EnvFormat::plain(0x1000)).unwrap();
        assert_eq!(block.len(), 0x1000);

        let mut payload =
            b"bootcmd=run x\0ethaddr=00:11:32:A3:67:EF\0\0".to_vec();
        payload.resize(0x1000 - 4, 0);
        assert_eq!(&block[4..], &payload[..]);
        assert_eq!(
            unpack_u32_le(&block).unwrap(),
            reference_crc32(&payload)
        );
    }

    #[test]
    fn flagged_layout() {
        let block = encode(&sample(), &EnvFormat::flagged(0x100)).unwrap();
        assert_eq!(block[4], FLAG_ACTIVE);
        assert_eq!(&block[5..12], b"bootcmd");
        // default scope covers the flag
        assert_eq!(unpack_u32_le(&block).unwrap(), crc32(&block[4..]));

        let data_only =
            EnvFormat::flagged(0x100).with_scope(ChecksumScope::Data);
        let block = encode(&sample(), &data_only).unwrap();
        assert_eq!(unpack_u32_le(&block).unwrap(), crc32(&block[5..]));
        assert_eq!(decode(&block, &data_only).unwrap(), sample());
    }

    #[test]
    fn exact_fit_and_one_over() {
        let format = EnvFormat::plain(0x20);
        // "k=" + value + NUL + final NUL must total 0x1c
        let fits = EnvEntries::from_pairs(
            [("k", "v".repeat(0x1c - 4))],
            Duplicates::Reject,
        )
        .unwrap();
        assert_eq!(fits.serialized_len(), format.capacity());
        assert!(encode(&fits, &format).is_ok());

        let over = EnvEntries::from_pairs(
            [("k", "v".repeat(0x1c - 3))],
            Duplicates::Reject,
        )
        .unwrap();
        assert_eq!(
            encode(&over, &format),
            Err(Error::EnvOverflow {
                needed: 0x1d,
                available: 0x1c
            })
        );
    }

    #[test]
    fn duplicates() {
        assert_eq!(
            EnvEntries::from_pairs(
                [("a", "1"), ("b", "2"), ("a", "3")],
                Duplicates::Reject
            ),
            Err(Error::DuplicateKey("a".into()))
        );
        let e = EnvEntries::from_pairs(
            [("a", "1"), ("b", "2"), ("a", "3")],
            Duplicates::LastWins,
        )
        .unwrap();
        assert_eq!(e.serialize(), b"a=3\0b=2\0\0");
    }

    #[test]
    fn invalid_entries() {
        let mut e = EnvEntries::new();
        assert!(e.set("a=b", "c").is_err());
        assert!(e.set("", "c").is_err());
        assert!(e.set("a", "c\0d").is_err());
        assert!(e.set("empty", "").is_ok());
        assert_eq!(e.get("empty"), Some(&b""[..]));
    }

    #[test]
    fn parse_tolerates_padding_and_repeats() {
        let e = EnvEntries::parse(b"a=1\0b=\0a=2\0\0\0\0junk\xff").unwrap();
        assert_eq!(e.get("a"), Some(&b"2"[..]));
        assert_eq!(e.get("b"), Some(&b""[..]));
        assert_eq!(e.iter().next().unwrap().0, b"a");

        assert_eq!(
            EnvEntries::parse(b"a=1\xff\xff"),
            Err(Error::MalformedEnv("missing terminator"))
        );
        assert!(EnvEntries::parse(b"noequals\0\0").is_err());
    }

    #[test]
    fn extended_scope_covers_neighbours() {
        let mut image = Image::filled(0x400, 0);
        image.write(0x180, b"\xd0\x0d\xfe\xed").unwrap();

        let format = EnvFormat::plain(0x100)
            .with_scope(ChecksumScope::Extended { end: 0x200 });
        assert!(encode(&sample(), &format).is_err());

        let crc = write_env(&mut image, 0x80, &sample(), &format).unwrap();
        assert_eq!(crc, crc32(&image.as_bytes()[0x84..0x280]));
        assert_eq!(image.read(0x180, 4).unwrap(), b"\xd0\x0d\xfe\xed");

        let read = read_env(image.as_bytes(), 0x80, &format).unwrap();
        assert!(read.checksum_ok());
        assert_eq!(read.entries, sample());

        // changing covered neighbour data invalidates the block
        image.write(0x1ff, &[1]).unwrap();
        assert!(!read_env(image.as_bytes(), 0x80, &format)
            .unwrap()
            .checksum_ok());
    }

    #[test]
    fn scope_must_fit() {
        let mut image = Image::filled(0x200, 0xff);
        let format = EnvFormat::plain(0x100)
            .with_scope(ChecksumScope::Extended { end: 0x180 });
        assert!(matches!(
            write_env(&mut image, 0x100, &sample(), &format),
            Err(Error::InvalidScope(_))
        ));
        let short = EnvFormat::plain(0x100)
            .with_scope(ChecksumScope::Extended { end: 0x80 });
        assert!(matches!(
            write_env(&mut image, 0, &sample(), &short),
            Err(Error::InvalidScope(_))
        ));
        assert_eq!(image.as_bytes(), &[0xff; 0x200][..]);
    }

    #[test]
    fn rewrite_preserves_order() {
        let mut image = Image::filled(0x2000, 0xff);
        let format = EnvFormat::plain(0x1000);
        write_env(&mut image, 0x1000, &sample(), &format).unwrap();

        let mut block = read_env(image.as_bytes(), 0x1000, &format).unwrap();
        assert!(block.checksum_ok());
        assert_eq!(block.flag, None);
        block.entries.set("bootcmd", "boot").unwrap();
        write_env(&mut image, 0x1000, &block.entries, &format).unwrap();

        let again = read_env(image.as_bytes(), 0x1000, &format).unwrap();
        let keys: Vec<_> = again.entries.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, [&b"bootcmd"[..], &b"ethaddr"[..]]);
        assert!(again.checksum_ok());
    }

    #[test]
    fn flagged_block_reads_back() {
        let mut image = Image::filled(0x400, 0xff);
        let format = EnvFormat::flagged(0x100).with_scope(ChecksumScope::Data);
        let crc = write_env(&mut image, 0x100, &sample(), &format).unwrap();
        assert_eq!(crc, crc32(&image.as_bytes()[0x105..0x200]));

        let block = read_env(image.as_bytes(), 0x100, &format).unwrap();
        assert_eq!(block.flag, Some(FLAG_ACTIVE));
        assert_eq!(block.checksum, crc);
        assert!(block.checksum_ok());
        assert_eq!(block.entries, sample());
        assert_eq!(block.total_size, 0x100);

        // The flag sits outside a data-only scope.
        let mut bytes = image.into_vec();
        bytes[0x104] = 0;
        let block = read_env(&bytes, 0x100, &format).unwrap();
        assert_eq!(block.flag, Some(0));
        assert!(block.checksum_ok());

        let whole = EnvFormat::flagged(0x100);
        assert!(!read_env(&bytes, 0x100, &whole).unwrap().checksum_ok());
    }
}
