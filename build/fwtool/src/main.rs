// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use flash_image::MacAddress;

mod compose;
mod config;
mod files;
mod patch;
mod scan;
mod verify;

use patch::Identity;

#[derive(Debug, Parser)]
#[clap(max_term_width = 80, about = "build and patch raw flash images")]
struct Args {
    #[clap(subcommand)]
    cmd: Fwtool,
}

#[derive(Debug, Subcommand)]
enum Fwtool {
    /// Assembles a new image from the sources and plan in a device profile,
    /// then writes its environment block and, if given, the device identity.
    Compose {
        /// Path to the device profile, in TOML.
        profile: PathBuf,
        /// Where to write the image.
        #[clap(short, long)]
        out: PathBuf,
        /// MAC address to store in the vendor region.
        #[clap(long, requires = "serial")]
        mac: Option<MacAddress>,
        /// Serial number to store in the vendor region.
        #[clap(long, requires = "mac")]
        serial: Option<String>,
    },

    /// Writes the MAC address and serial number into an existing image,
    /// updating `ethaddr` in its environment block.
    Identity {
        /// Path to the device profile, in TOML.
        profile: PathBuf,
        /// Image to patch.
        image: PathBuf,
        #[clap(long)]
        mac: MacAddress,
        #[clap(long)]
        serial: String,
        /// Where to write the patched image.
        #[clap(short, long)]
        out: PathBuf,
    },

    /// Rewrites the environment block of an existing image from the
    /// profile's variables plus any overrides.
    Env {
        /// Path to the device profile, in TOML.
        profile: PathBuf,
        /// Image to patch.
        image: PathBuf,
        /// Sets a variable, as `key=value`. May be repeated.
        #[clap(long = "set")]
        set: Vec<String>,
        /// Ignore the block already in the image instead of updating it.
        #[clap(long)]
        fresh: bool,
        /// Where to write the patched image.
        #[clap(short, long)]
        out: PathBuf,
    },

    /// Finds a byte pattern in an image and lists code that appears to
    /// refer to it.
    Scan {
        /// Image to scan; its length must be a multiple of 4.
        image: PathBuf,
        /// Device profile supplying `[scan]` defaults.
        #[clap(long)]
        profile: Option<PathBuf>,
        /// Text to look for.
        #[clap(long)]
        pattern: Option<String>,
        /// Largest distance from the pattern that still counts as a hit.
        #[clap(long, parse(try_from_str = parse_int::parse))]
        tolerance: Option<u64>,
        /// Don't look at code at or past this offset.
        #[clap(long, parse(try_from_str = parse_int::parse))]
        limit: Option<u64>,
        /// Load address of the image, for pointers in literal pools.
        #[clap(long, parse(try_from_str = parse_int::parse))]
        load_bias: Option<u64>,
        /// Number of threads; defaults to the available parallelism.
        #[clap(short, long)]
        jobs: Option<NonZeroUsize>,
        /// Also decode this many bytes either side of each hit.
        #[clap(long, default_value_t = 0)]
        context: usize,
    },

    /// Checks an image against its profile, exiting with an error if any
    /// check fails.
    Verify {
        /// Path to the device profile, in TOML.
        profile: PathBuf,
        /// Image to check.
        image: PathBuf,
        /// Known-good image for the profile's preserved ranges.
        #[clap(long)]
        reference: Option<PathBuf>,
    },

    /// Prints a device profile after loading and checking it.
    Print {
        /// Path to the device profile, in TOML.
        profile: PathBuf,
    },
}

fn main() -> Result<()> {
    let env = env_logger::Env::default().filter_or("RUST_LOG", "info");

    env_logger::init_from_env(env);

    match Args::parse().cmd {
        Fwtool::Compose {
            profile,
            out,
            mac,
            serial,
        } => {
            let identity = mac.zip(serial).map(|(mac, serial)| Identity {
                mac,
                serial,
            });
            compose::run(&profile, &out, identity)?;
        }
        Fwtool::Identity {
            profile,
            image,
            mac,
            serial,
            out,
        } => {
            patch::identity(&profile, &image, Identity { mac, serial }, &out)?;
        }
        Fwtool::Env {
            profile,
            image,
            set,
            fresh,
            out,
        } => {
            patch::env(&profile, &image, &set, fresh, &out)?;
        }
        Fwtool::Scan {
            image,
            profile,
            pattern,
            tolerance,
            limit,
            load_bias,
            jobs,
            context,
        } => {
            scan::run(&scan::ScanArgs {
                image,
                profile,
                pattern,
                tolerance,
                limit: limit.map(|l| usize::try_from(l).unwrap_or(usize::MAX)),
                load_bias,
                jobs,
                context,
            })?;
        }
        Fwtool::Verify {
            profile,
            image,
            reference,
        } => {
            verify::run(&profile, &image, reference.as_deref())?;
        }
        Fwtool::Print { profile } => {
            let profile = config::Profile::from_file(&profile)?;
            println!("{profile:#?}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers() {
        let args = Args::try_parse_from([
            "fwtool",
            "scan",
            "fw.bin",
            "--tolerance",
            "0b10_0000",
            "--limit",
            "0x10_0000",
            "--load-bias",
            "0o20",
        ])
        .unwrap();
        let Fwtool::Scan {
            tolerance,
            limit,
            load_bias,
            ..
        } = args.cmd
        else {
            panic!("parsed as the wrong subcommand");
        };
        assert_eq!(tolerance, Some(32));
        assert_eq!(limit, Some(0x10_0000));
        assert_eq!(load_bias, Some(0o20));

        for bad in ["0x", "ten"] {
            let args = Args::try_parse_from([
                "fwtool",
                "scan",
                "fw.bin",
                "--tolerance",
                bad,
            ]);
            assert!(args.is_err(), "{bad}");
        }
    }

    #[test]
    fn identity_flags_go_together() {
        let args = Args::try_parse_from([
            "fwtool", "compose", "p.toml", "-o", "out.bin", "--mac",
            "00:11:32:A3:67:EF",
        ]);
        assert!(args.is_err());

        let args = Args::try_parse_from([
            "fwtool",
            "compose",
            "p.toml",
            "-o",
            "out.bin",
            "--mac",
            "00:11:32:A3:67:EF",
            "--serial",
            "1910Q2N321313",
        ])
        .unwrap();
        let Fwtool::Compose { mac, serial, .. } = args.cmd else {
            panic!("parsed as the wrong subcommand");
        };
        assert_eq!(mac.unwrap().checksum(), 0x3c);
        assert_eq!(serial.as_deref(), Some("1910Q2N321313"));
    }

    #[test]
    fn repeated_set() {
        let args = Args::try_parse_from([
            "fwtool", "env", "p.toml", "in.bin", "--set", "a=1", "--set",
            "b=2", "--fresh", "-o", "out.bin",
        ])
        .unwrap();
        let Fwtool::Env { set, fresh, .. } = args.cmd else {
            panic!("parsed as the wrong subcommand");
        };
        assert_eq!(set, ["a=1", "b=2"]);
        assert!(fresh);
    }
}
