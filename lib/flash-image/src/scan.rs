// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Finding code that refers to a known location.
//!
//! Given the offset of something interesting in an image (typically an
//! error string), [`scan_references`] walks the 4-byte aligned words of an
//! AArch64 code area looking for the three ways compiled code usually takes
//! the address of data:
//!
//! - `ADR Xd, label`: PC plus a signed 21-bit byte offset.
//! - `ADRP Xd, label`: the PC's 4 KiB page plus a signed 21-bit page
//!   offset; the low 12 bits are added by a later `ADD` that we don't track.
//! - `LDR Xt, label`: a 64-bit load from PC plus a signed 19-bit word
//!   offset. The loaded value is a pointer, so we read it out of the image
//!   and compare that instead.
//!
//! Only those three encodings are decoded; everything else is
//! [`InstructionKind::Other`]. The image is assumed to be loaded at address
//! zero, which doesn't matter for `ADR` and `LDR`, matters for `ADRP` only
//! if the real load address isn't page aligned, and is corrected for
//! literal pool pointers by [`ScanParams::load_bias`].
//!
//! The result is a set of candidates, not a proof. References built up
//! arithmetically, or through `ADRP`/`ADD` pairs whose page differs from the
//! target's, are missed; data words that happen to decode as one of these
//! instructions can show up as false hits. Callers should report candidates
//! as such.

use std::num::NonZeroUsize;
use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian};

use crate::checksum::read_u64_le;
use crate::{Error, Result};

/// Returns the offset of the first occurrence of `pattern` in `buf`. An
/// empty pattern matches nothing.
pub fn find_signature(buf: &[u8], pattern: &[u8]) -> Option<usize> {
    find_signature_from(buf, pattern, 0)
}

/// Like [`find_signature`], but only considers matches starting at or after
/// `start`.
pub fn find_signature_from(
    buf: &[u8],
    pattern: &[u8],
    start: usize,
) -> Option<usize> {
    if pattern.is_empty() || start > buf.len() {
        return None;
    }
    memchr::memmem::find(&buf[start..], pattern).map(|n| n + start)
}

const WORD: usize = 4;
const PAGE_SHIFT: u32 = 12;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    PcRelativeAddress,
    PcRelativeAddressPage,
    PcRelativeLoad,
    Other,
}

impl std::fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            InstructionKind::PcRelativeAddress => "adr",
            InstructionKind::PcRelativeAddressPage => "adrp",
            InstructionKind::PcRelativeLoad => "ldr",
            InstructionKind::Other => "-",
        })
    }
}

/// A run of bits in an instruction word that holds part of an immediate.
#[derive(Copy, Clone, Debug)]
struct ImmField {
    /// Lowest bit of the field in the instruction word.
    lsb: u32,
    width: u32,
    /// Where the field's lowest bit goes in the assembled immediate.
    dest: u32,
}

/// Describes one instruction encoding we recognize.
#[derive(Copy, Clone, Debug)]
struct Matcher {
    kind: InstructionKind,
    mask: u32,
    value: u32,
    fields: &'static [ImmField],
    /// Width of the assembled immediate; its top bit is the sign.
    imm_width: u32,
    /// Left shift turning the immediate into a byte offset.
    shift: u32,
}

const ADR_FIELDS: &[ImmField] = &[
    // immlo
    ImmField {
        lsb: 29,
        width: 2,
        dest: 0,
    },
    // immhi
    ImmField {
        lsb: 5,
        width: 19,
        dest: 2,
    },
];

const MATCHERS: [Matcher; 3] = [
    Matcher {
        kind: InstructionKind::PcRelativeAddress,
        mask: 0x9f00_0000,
        value: 0x1000_0000,
        fields: ADR_FIELDS,
        imm_width: 21,
        shift: 0,
    },
    Matcher {
        kind: InstructionKind::PcRelativeAddressPage,
        mask: 0x9f00_0000,
        value: 0x9000_0000,
        fields: ADR_FIELDS,
        imm_width: 21,
        shift: PAGE_SHIFT,
    },
    // 64-bit general purpose register form only; the 32-bit, SIMD and
    // LDRSW forms don't load a pointer.
    Matcher {
        kind: InstructionKind::PcRelativeLoad,
        mask: 0xff00_0000,
        value: 0x5800_0000,
        fields: &[ImmField {
            lsb: 5,
            width: 19,
            dest: 0,
        }],
        imm_width: 19,
        shift: 2,
    },
];

impl Matcher {
    fn immediate(&self, word: u32) -> i64 {
        let raw = self.fields.iter().fold(0u64, |acc, f| {
            let bits = (word >> f.lsb) & ((1 << f.width) - 1);
            acc | (u64::from(bits) << f.dest)
        });
        // sign-extend from imm_width bits
        let unused = 64 - self.imm_width;
        ((raw << unused) as i64) >> unused
    }
}

/// One decoded instruction word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InstructionWord {
    pub address: usize,
    pub word: u32,
    pub kind: InstructionKind,
    /// Destination register for the recognized kinds.
    pub register: u8,
    /// Sign-extended immediate, before scaling.
    pub immediate: i64,
    /// What the instruction refers to: the byte address for `ADR`, the page
    /// base for `ADRP`, the literal's address for `LDR`. `None` for other
    /// instructions, and for targets below address zero.
    pub target: Option<u64>,
}

impl InstructionWord {
    pub fn decode(address: usize, word: u32) -> Self {
        let Some(m) = MATCHERS.iter().find(|m| word & m.mask == m.value) else {
            return Self {
                address,
                word,
                kind: InstructionKind::Other,
                register: 0,
                immediate: 0,
                target: None,
            };
        };
        let immediate = m.immediate(word);
        let base = match m.kind {
            InstructionKind::PcRelativeAddressPage => {
                address as i64 & !((1 << PAGE_SHIFT) - 1)
            }
            _ => address as i64,
        };
        let target = base.checked_add(immediate << m.shift);
        Self {
            address,
            word,
            kind: m.kind,
            register: (word & 0x1f) as u8,
            immediate,
            target: target.and_then(|t| u64::try_from(t).ok()),
        }
    }
}

/// What to look for and how far.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScanParams {
    /// Offset of the referenced item in the image.
    pub target_offset: u64,
    /// Words at addresses at or past this are not examined.
    pub search_limit: usize,
    /// Largest distance between a computed target and `target_offset` that
    /// still counts. For `ADRP` both sides are compared as page bases.
    pub tolerance: u64,
    /// Subtracted from pointers loaded out of literal pools to turn them
    /// into image offsets, i.e. the image's load address.
    pub load_bias: u64,
}

/// A candidate reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub address: usize,
    pub kind: InstructionKind,
    /// See [`InstructionWord::target`].
    pub computed_target: u64,
    /// For loads, the pointer found at `computed_target`, bias removed.
    pub pointer: Option<u64>,
}

impl ScanParams {
    fn matches(&self, buf: &[u8], insn: &InstructionWord) -> Option<Reference> {
        let target = insn.target?;
        let close =
            |value: u64| value.abs_diff(self.target_offset) <= self.tolerance;
        let pointer = match insn.kind {
            InstructionKind::PcRelativeAddress => {
                close(target).then_some(None)?
            }
            InstructionKind::PcRelativeAddressPage => {
                let page_mask = !((1u64 << PAGE_SHIFT) - 1);
                let want = self.target_offset & page_mask;
                (target.abs_diff(want) <= self.tolerance).then_some(None)?
            }
            InstructionKind::PcRelativeLoad => {
                let slot = usize::try_from(target).ok()?;
                let value = read_u64_le(buf, slot)
                    .ok()?
                    .wrapping_sub(self.load_bias);
                close(value).then_some(Some(value))?
            }
            InstructionKind::Other => return None,
        };
        Some(Reference {
            address: insn.address,
            kind: insn.kind,
            computed_target: target,
            pointer,
        })
    }
}

/// Iterator returned by [`scan_references`]. A clone carries on
/// independently from the point it was cloned at.
#[derive(Clone, Debug)]
pub struct References<'a> {
    buf: &'a [u8],
    params: ScanParams,
    next: usize,
    end: usize,
}

impl Iterator for References<'_> {
    type Item = Reference;

    fn next(&mut self) -> Option<Reference> {
        while self.next + WORD <= self.end {
            let address = self.next;
            self.next += WORD;
            let word = LittleEndian::read_u32(&self.buf[address..]);
            let insn = InstructionWord::decode(address, word);
            if let Some(r) = self.params.matches(self.buf, &insn) {
                return Some(r);
            }
        }
        None
    }
}

fn scan_end(buf: &[u8], params: &ScanParams) -> Result<usize> {
    if buf.len() % WORD != 0 {
        return Err(Error::MisalignedBuffer(buf.len()));
    }
    Ok(params.search_limit.min(buf.len()))
}

/// Scans the words of `buf` below `params.search_limit` for references to
/// `params.target_offset`.
///
/// Finding nothing is not an error. Every call starts a fresh scan.
pub fn scan_references<'a>(
    buf: &'a [u8],
    params: &ScanParams,
) -> Result<References<'a>> {
    let end = scan_end(buf, params)?;
    Ok(References {
        buf,
        params: *params,
        next: 0,
        end,
    })
}

/// Same results as [`scan_references`], collected, with the address range
/// split across `workers` threads.
pub fn scan_references_parallel(
    buf: &[u8],
    params: &ScanParams,
    workers: NonZeroUsize,
) -> Result<Vec<Reference>> {
    let end = scan_end(buf, params)?;
    let words = end / WORD;
    let per_worker = words.div_ceil(workers.get()).max(1) * WORD;

    let mut out: Vec<Reference> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..end)
            .step_by(per_worker)
            .map(|start| {
                let chunk = References {
                    buf,
                    params: *params,
                    next: start,
                    end: (start + per_worker).min(end),
                };
                s.spawn(move || chunk.collect::<Vec<_>>())
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| {
                h.join().unwrap_or_else(|e| std::panic::resume_unwind(e))
            })
            .collect()
    });
    out.sort_by_key(|r| r.address);
    log::debug!(
        "scanned {words} words with {} workers: {} candidates",
        workers,
        out.len()
    );
    Ok(out)
}

/// Decodes the aligned words within `radius` bytes of `center`, clipped to
/// the buffer, for showing the code around a hit.
pub fn decode_window(
    buf: &[u8],
    center: usize,
    radius: usize,
) -> Vec<InstructionWord> {
    let aligned = center & !(WORD - 1);
    let start = aligned.saturating_sub(radius) & !(WORD - 1);
    let end = aligned.saturating_add(radius).min(buf.len());
    let range: Range<usize> = start..end;
    range
        .step_by(WORD)
        .take_while(|&a| a + WORD <= buf.len())
        .map(|a| InstructionWord::decode(a, LittleEndian::read_u32(&buf[a..])))
        .collect()
}
