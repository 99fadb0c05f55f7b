// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Post-build checks on a finished image.
//!
//! None of these prove an image will boot. They catch the mistakes that
//! are cheap to catch: wrong size, a bootloader that no longer matches the
//! one known to work, a component that isn't where the layout says, and
//! stored checksums that don't match what they cover.

use std::fmt;

use crate::env::{self, EnvFormat};
use crate::identity::{self, VendorLayout};
use crate::region;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Check {
    /// The image is exactly this many bytes.
    Size(usize),
    /// A range is byte-identical to the same range of the reference image.
    Preserved {
        name: String,
        offset: usize,
        len: usize,
    },
    /// `magic` appears at `offset`.
    Magic {
        name: String,
        offset: usize,
        magic: Vec<u8>,
    },
    /// The environment block at `offset` has a matching CRC and parses.
    Env { offset: usize, format: EnvFormat },
    /// The identity fields parse and both checksums match.
    Identity(VendorLayout),
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Size(size) => write!(f, "size is {size:#x}"),
            Check::Preserved { name, offset, len } => write!(
                f,
                "{name} ({offset:#x}..{:#x}) matches reference",
                offset.saturating_add(*len)
            ),
            Check::Magic { name, offset, .. } => {
                write!(f, "{name} magic at {offset:#x}")
            }
            Check::Env { offset, .. } => write!(f, "env block at {offset:#x}"),
            Check::Identity(layout) => {
                write!(f, "identity at {:#x}", layout.offset)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finding {
    pub check: Check,
    pub passed: bool,
    pub detail: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub findings: Vec<Finding>,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.findings.iter().all(|f| f.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| !f.passed)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for finding in &self.findings {
            let mark = if finding.passed { "ok" } else { "FAIL" };
            write!(f, "{mark:>4}  {}", finding.check)?;
            if !finding.detail.is_empty() {
                write!(f, ": {}", finding.detail)?;
            }
            writeln!(f)?;
        }
        let failed = self.failures().count();
        write!(f, "{} checks, {failed} failed", self.findings.len())
    }
}

fn run(
    image: &[u8],
    reference: Option<&[u8]>,
    check: &Check,
) -> (bool, String) {
    match check {
        Check::Size(size) => {
            (image.len() == *size, format!("image is {:#x}", image.len()))
        }
        Check::Preserved { offset, len, .. } => {
            let Some(reference) = reference else {
                return (false, "no reference image given".into());
            };
            let ours = region::read(image, *offset, *len);
            let theirs = region::read(reference, *offset, *len);
            match (ours, theirs) {
                (Ok(a), Ok(b)) => {
                    match a.iter().zip(b).position(|(x, y)| x != y) {
                        None => (true, String::new()),
                        Some(n) => (
                            false,
                            format!("first difference at {:#x}", offset + n),
                        ),
                    }
                }
                (Err(e), _) => (false, e.to_string()),
                (_, Err(e)) => (false, format!("reference: {e}")),
            }
        }
        Check::Magic { offset, magic, .. } => {
            match region::read(image, *offset, magic.len()) {
                Ok(found) if found == magic.as_slice() => (true, String::new()),
                Ok(found) => (false, format!("found {found:02x?}")),
                Err(e) => (false, e.to_string()),
            }
        }
        Check::Env { offset, format } => {
            match env::read_env(image, *offset, format) {
                Ok(block) if block.checksum_ok() => (
                    true,
                    format!(
                        "crc {:#010x}, {} entries",
                        block.checksum,
                        block.entries.len()
                    ),
                ),
                Ok(block) => (
                    false,
                    format!(
                        "stored crc {:#010x}, computed {:#010x}",
                        block.checksum, block.computed
                    ),
                ),
                Err(e) => (false, e.to_string()),
            }
        }
        Check::Identity(layout) => {
            match identity::read_identity(image, layout) {
                Ok(rec) if rec.is_consistent() => {
                    (true, format!("{}, {}", rec.mac, rec.serial))
                }
                Ok(rec) => (
                    false,
                    format!(
                        "checksums don't match: mac {:#04x} (want {:#04x}), \
                         serial {} (want {})",
                        rec.mac_checksum,
                        rec.mac.checksum(),
                        rec.serial_checksum,
                        identity::serial_checksum(&rec.serial),
                    ),
                ),
                Err(e) => (false, e.to_string()),
            }
        }
    }
}

/// Runs every check against `image`, in order. `reference` is needed only
/// by [`Check::Preserved`], which fails without it.
///
/// A failing check doesn't stop the rest from running.
pub fn verify(
    image: &[u8],
    reference: Option<&[u8]>,
    checks: &[Check],
) -> Report {
    let findings = checks
        .iter()
        .map(|check| {
            let (passed, detail) = run(image, reference, check);
            log::debug!("{check}: {}", if passed { "ok" } else { "failed" });
            Finding {
                check: check.clone(),
                passed,
                detail,
            }
        })
        .collect();
    Report { findings }
}
