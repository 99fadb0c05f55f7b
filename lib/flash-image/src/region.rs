// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-size images and bookkeeping for the regions carved out of them.
//!
//! An [`Image`] never changes length after construction. Every accessor is
//! bounds-checked and returns [`Error::OutOfBounds`] instead of panicking or
//! growing the buffer.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::{Error, Result};

/// Checks that `offset..offset + len` lies within a buffer of `size` bytes,
/// returning it as a `Range` if so.
pub fn checked_range(
    offset: usize,
    len: usize,
    size: usize,
) -> Result<Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(Error::OutOfBounds { offset, len, size }),
    }
}

/// Reads `len` bytes at `offset` out of any byte slice.
pub fn read(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    Ok(&buf[checked_range(offset, len, buf.len())?])
}

/// An owned flash image of fixed length.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("len", &format_args!("{:#x}", self.bytes.len()))
            .finish()
    }
}

impl Image {
    /// Allocates an image of `len` bytes, all set to `fill`.
    ///
    /// Erased NOR flash reads back as `0xff`, so that is usually the right
    /// fill for anything that will be written to a part; some vendor tools
    /// pad with zeroes instead.
    pub fn filled(len: usize, fill: u8) -> Self {
        Self {
            bytes: vec![fill; len],
        }
    }

    /// Takes ownership of `bytes`, which must be exactly `expected` long.
    pub fn from_vec(bytes: Vec<u8>, expected: usize) -> Result<Self> {
        if bytes.len() != expected {
            return Err(Error::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        read(&self.bytes, offset, len)
    }

    /// Overwrites `data.len()` bytes starting at `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let range = checked_range(offset, data.len(), self.bytes.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&mut self, offset: usize, len: usize, value: u8) -> Result<()> {
        let range = checked_range(offset, len, self.bytes.len())?;
        self.bytes[range].fill(value);
        Ok(())
    }

    /// Zeroes `len` bytes at `offset`. Used to clear a fixed slot before a
    /// shorter string goes into it, so nothing of the old one survives.
    pub fn zero_fill(&mut self, offset: usize, len: usize) -> Result<()> {
        self.fill(offset, len, 0)
    }

    /// Copies `len` bytes from `src` at `src_offset` into this image at
    /// `dst_offset`. Both ends are checked before anything is written.
    pub fn copy_from(
        &mut self,
        src: &[u8],
        src_offset: usize,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        let from = checked_range(src_offset, len, src.len())?;
        let to = checked_range(dst_offset, len, self.bytes.len())?;
        self.bytes[to].copy_from_slice(&src[from]);
        Ok(())
    }

    /// Mutable access to a checked sub-range, for codecs that build their
    /// output in place.
    pub(crate) fn slice_mut(
        &mut self,
        offset: usize,
        len: usize,
    ) -> Result<&mut [u8]> {
        let range = checked_range(offset, len, self.bytes.len())?;
        Ok(&mut self.bytes[range])
    }
}

impl AsRef<[u8]> for Image {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Copies a range between two images. See [`Image::copy_from`].
pub fn copy_range(
    src: &Image,
    src_offset: usize,
    dst: &mut Image,
    dst_offset: usize,
    len: usize,
) -> Result<()> {
    dst.copy_from(src.as_bytes(), src_offset, dst_offset, len)
}

/// A named sub-range of an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub name: String,
    pub offset: usize,
    pub len: usize,
}

impl Region {
    pub fn new(name: impl Into<String>, offset: usize, len: usize) -> Self {
        Self {
            name: name.into(),
            offset,
            len,
        }
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }
}

/// Tracks the regions claimed during a single operation and refuses
/// overlapping claims.
///
/// Empty regions are accepted and never overlap anything.
#[derive(Clone, Debug)]
pub struct RegionMap {
    size: usize,
    // keyed by start offset
    claimed: BTreeMap<usize, Region>,
}

impl RegionMap {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            claimed: BTreeMap::new(),
        }
    }

    /// Claims `region`. Fails if it does not fit in the image, or if it
    /// overlaps an earlier claim and `overwrite` is not set.
    ///
    /// An overwriting claim replaces the bookkeeping for whatever it covers
    /// completely and truncates whatever it covers partially, so that later
    /// claims are checked against what the image will actually contain.
    pub fn claim(&mut self, region: Region, overwrite: bool) -> Result<()> {
        checked_range(region.offset, region.len, self.size)?;
        if region.len == 0 {
            return Ok(());
        }

        let overlapping = self.overlapping(&region.range());
        if !overlapping.is_empty() && !overwrite {
            return Err(Error::PlanOverlap {
                first: self.claimed[&overlapping[0]].name.clone(),
                second: region.name,
            });
        }

        for start in overlapping {
            let Some(old) = self.claimed.remove(&start) else {
                continue;
            };
            if old.offset < region.offset {
                self.claimed.insert(
                    old.offset,
                    Region::new(
                        old.name.clone(),
                        old.offset,
                        region.offset - old.offset,
                    ),
                );
            }
            if old.end() > region.end() {
                let tail = old.end() - region.end();
                self.claimed.insert(
                    region.end(),
                    Region::new(old.name, region.end(), tail),
                );
            }
        }
        self.claimed.insert(region.offset, region);
        Ok(())
    }

    /// Start offsets of every claimed region that intersects `range`.
    fn overlapping(&self, range: &Range<usize>) -> Vec<usize> {
        let mut out = vec![];
        // The claim starting at or before `range.start` may extend into it.
        if let Some((&start, r)) =
            self.claimed.range(..=range.start).next_back()
        {
            if r.end() > range.start {
                out.push(start);
            }
        }
        out.extend(
            self.claimed
                .range(range.start + 1..range.end)
                .map(|(&start, _)| start),
        );
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.claimed.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_stays_in_bounds() {
        let mut img = Image::filled(16, 0xff);
        img.write(12, &[1, 2, 3, 4]).unwrap();
        assert_eq!(img.read(12, 4).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(
            img.write(13, &[1, 2, 3, 4]),
            Err(Error::OutOfBounds {
                offset: 13,
                len: 4,
                size: 16
            })
        );
        // failed write must not have touched anything
        assert_eq!(img.read(12, 4).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(img.len(), 16);
    }

    #[test]
    fn offset_overflow_is_out_of_bounds() {
        let img = Image::filled(16, 0);
        assert!(matches!(
            img.read(usize::MAX, 2),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn from_vec_checks_length() {
        assert_eq!(
            Image::from_vec(vec![0; 10], 16),
            Err(Error::SizeMismatch {
                expected: 16,
                actual: 10
            })
        );
        assert!(Image::from_vec(vec![0; 16], 16).is_ok());
    }

    #[test]
    fn zero_fill_erases_stale_bytes() {
        let mut img = Image::filled(8, 0xaa);
        img.zero_fill(2, 4).unwrap();
        assert_eq!(img.as_bytes(), &[0xaa, 0xaa, 0, 0, 0, 0, 0xaa, 0xaa]);
    }

    #[test]
    fn copy_checks_both_ends() {
        let src = Image::filled(4, 7);
        let mut dst = Image::filled(8, 0);
        assert!(copy_range(&src, 2, &mut dst, 0, 4).is_err());
        assert!(copy_range(&src, 0, &mut dst, 6, 4).is_err());
        assert_eq!(dst.as_bytes(), &[0; 8]);
        copy_range(&src, 0, &mut dst, 4, 4).unwrap();
        assert_eq!(dst.as_bytes(), &[0, 0, 0, 0, 7, 7, 7, 7]);
    }

    #[test]
    fn region_map_rejects_overlap() {
        let mut map = RegionMap::new(0x100);
        map.claim(Region::new("a", 0x10, 0x10), false).unwrap();
        map.claim(Region::new("b", 0x20, 0x10), false).unwrap();
        assert_eq!(
            map.claim(Region::new("c", 0x1f, 2), false),
            Err(Error::PlanOverlap {
                first: "a".into(),
                second: "c".into()
            })
        );
        // a region that swallows another entirely
        assert!(map.claim(Region::new("d", 0x0, 0x40), false).is_err());
        assert!(map.claim(Region::new("e", 0x0, 0x10), false).is_ok());
        assert!(map.claim(Region::new("f", 0xf8, 0x10), false).is_err());
    }

    #[test]
    fn region_map_overwrite_splits() {
        let mut map = RegionMap::new(0x100);
        map.claim(Region::new("base", 0x0, 0x100), false).unwrap();
        map.claim(Region::new("patch", 0x40, 0x10), true).unwrap();
        let got: Vec<_> = map.iter().cloned().collect();
        assert_eq!(
            got,
            vec![
                Region::new("base", 0x0, 0x40),
                Region::new("patch", 0x40, 0x10),
                Region::new("base", 0x50, 0xb0),
            ]
        );
    }

    #[test]
    fn empty_regions_never_overlap() {
        let mut map = RegionMap::new(0x10);
        map.claim(Region::new("a", 0, 0x10), false).unwrap();
        map.claim(Region::new("nothing", 4, 0), false).unwrap();
    }
}
