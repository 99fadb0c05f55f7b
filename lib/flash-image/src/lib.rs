// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Engineering raw flash images.
//!
//! This crate composes whole-device flash images out of pieces of other
//! images, patches vendor identity fields along with the checksums the
//! device expects next to them, writes bootloader environment blocks with a
//! correct CRC, and scans AArch64 code for PC-relative references to a known
//! byte offset.
//!
//! Nothing in here knows about a particular device. Every offset, size, and
//! magic value is handed in by the caller; see the `fwtool` device profiles
//! for where those numbers come from in practice.
//!
//! All operations work on in-memory buffers and either succeed completely or
//! leave their output untouched: an [`Error`] means nothing was written.

pub mod checksum;
pub mod compose;
pub mod env;
pub mod identity;
pub mod region;
pub mod scan;
pub mod verify;

pub use compose::{compose, Plan, PlanStep};
pub use env::{
    read_env, write_env, ChecksumScope, Duplicates, EnvBlock, EnvEntries,
    EnvFormat,
};
pub use identity::{
    read_identity, write_identity, IdentityRecord, MacAddress, VendorLayout,
};
pub use region::{Image, Region, RegionMap};
pub use scan::{
    decode_window, find_signature, find_signature_from, scan_references,
    scan_references_parallel, InstructionKind, InstructionWord, Reference,
    ScanParams,
};
pub use verify::{verify, Check, Finding, Report};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error(
        "range {offset:#x}+{len:#x} is outside of a {size:#x} byte buffer"
    )]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("region '{second}' overlaps region '{first}'")]
    PlanOverlap { first: String, second: String },

    #[error(
        "environment needs {needed:#x} bytes but only {available:#x} fit"
    )]
    EnvOverflow { needed: usize, available: usize },

    #[error("environment variable '{0}' is defined more than once")]
    DuplicateKey(String),

    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("identity string needs {needed} bytes but the slot is {slot}")]
    IdentityOverflow { needed: usize, slot: usize },

    #[error(
        "step {step}: source '{name}' range {offset:#x}+{len:#x} \
         exceeds its {size:#x} bytes"
    )]
    SourceOutOfBounds {
        step: usize,
        name: String,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error(
        "step {step}: destination range {offset:#x}+{len:#x} exceeds \
         the {size:#x} byte image"
    )]
    DestOutOfBounds {
        step: usize,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("image is {actual:#x} bytes, expected {expected:#x}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("buffer length {0:#x} is not a multiple of 4")]
    MisalignedBuffer(usize),

    #[error("step {step}: no source image named '{name}'")]
    UnknownSource { step: usize, name: String },

    #[error("invalid environment entry '{0}'")]
    InvalidEntry(String),

    #[error("serial number must be printable ASCII")]
    InvalidSerial,

    #[error("checksum scope {0}")]
    InvalidScope(String),

    #[error("malformed environment block: {0}")]
    MalformedEnv(&'static str),

    #[error("malformed identity record: {0}")]
    MalformedIdentity(&'static str),
}
