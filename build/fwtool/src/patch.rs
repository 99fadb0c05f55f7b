// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Changing an existing image in place: identity and environment.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use flash_image::{EnvEntries, Image, MacAddress};

use crate::config::{Env, Profile};
use crate::files;

/// Environment variable holding the MAC address.
pub const ETHADDR: &str = "ethaddr";

#[derive(Clone, Debug)]
pub struct Identity {
    pub mac: MacAddress,
    pub serial: String,
}

pub fn write_identity(
    image: &mut Image,
    profile: &Profile,
    id: &Identity,
) -> Result<()> {
    let layout = profile
        .vendor
        .as_ref()
        .ok_or_else(|| anyhow!("profile has no [vendor] section"))?;
    let record =
        flash_image::write_identity(image, layout, &id.mac.0, &id.serial)
            .context("writing identity")?;
    log::info!(
        "identity: mac {} (checksum {:#04x}), {}",
        record.mac,
        record.mac_checksum,
        record.encoding()
    );
    Ok(())
}

/// Returns the entries of the block already in `image`.
///
/// A stored CRC that doesn't match is only a warning, since rewriting the
/// block is the usual way to fix one. A block that can't be parsed at all
/// is an error.
pub fn existing_env(image: &Image, env: &Env) -> Result<EnvEntries> {
    let block =
        flash_image::read_env(image.as_bytes(), env.offset, &env.format)
            .with_context(|| {
                format!("reading the env block at {:#x}", env.offset)
            })?;
    if !block.checksum_ok() {
        log::warn!(
            "env block at {:#x} has crc {:#010x} but its contents give \
             {:#010x}; keeping its entries anyway",
            env.offset,
            block.checksum,
            block.computed,
        );
    }
    Ok(block.entries)
}

/// The entries `fwtool env` starts from: none with `--fresh`, otherwise
/// whatever the image already holds.
fn base_env(image: &Image, env: &Env, fresh: bool) -> Result<EnvEntries> {
    if fresh {
        return Ok(EnvEntries::new());
    }
    existing_env(image, env).context("pass --fresh to replace it")
}

/// Layers the profile's `[env.vars]` and then `overrides` on top of `base`.
///
/// The profile's duplicate policy decides what happens when a key appears
/// more than once among the vars and overrides; keys already in `base` are
/// always replaced in place.
pub fn merge_vars(
    env: &Env,
    mut base: EnvEntries,
    overrides: &[(String, String)],
) -> Result<EnvEntries> {
    let layered = EnvEntries::from_pairs(
        env.vars.iter().chain(overrides.iter().map(|(k, v)| (k, v))),
        env.duplicates,
    )
    .context("combining [env.vars] with --set")?;
    for (k, v) in layered.iter() {
        base.set(k, v)?;
    }
    Ok(base)
}

pub fn store_env(
    image: &mut Image,
    env: &Env,
    entries: &EnvEntries,
) -> Result<()> {
    let crc = flash_image::write_env(image, env.offset, entries, &env.format)
        .with_context(|| {
            format!("writing the env block at {:#x}", env.offset)
        })?;
    log::info!(
        "env: {} variables at {:#x}, crc {crc:#010x}",
        entries.len(),
        env.offset
    );
    Ok(())
}

/// Parses a `--set` argument of the form `key=value`.
pub fn parse_assignment(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => bail!("expected key=value, got '{s}'"),
    }
}

/// Patches the identity into an existing image, updating `ethaddr` in its
/// env block if the profile has one.
pub fn identity(
    profile_path: &Path,
    image_path: &Path,
    id: Identity,
    out: &Path,
) -> Result<()> {
    let profile = Profile::from_file(profile_path)?;
    let mut image = files::read_image(image_path, &profile)?;

    write_identity(&mut image, &profile, &id)?;
    if let Some(env) = &profile.env {
        let mut entries = existing_env(&image, env)?;
        entries.set(ETHADDR, id.mac.to_string())?;
        store_env(&mut image, env, &entries)?;
    }

    files::write_image(out, &image)
}

/// Rewrites the env block of an existing image.
pub fn env(
    profile_path: &Path,
    image_path: &Path,
    set: &[String],
    fresh: bool,
    out: &Path,
) -> Result<()> {
    let profile = Profile::from_file(profile_path)?;
    let Some(env) = &profile.env else {
        bail!("{} has no [env] section", profile_path.display());
    };
    let overrides = set
        .iter()
        .map(|s| parse_assignment(s))
        .collect::<Result<Vec<_>>>()?;

    let mut image = files::read_image(image_path, &profile)?;
    let base = base_env(&image, env, fresh)?;
    let entries = merge_vars(env, base, &overrides)?;
    store_env(&mut image, env, &entries)?;

    files::write_image(out, &image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flash_image::env::Duplicates;
    use flash_image::EnvFormat;
    use indexmap::IndexMap;

    fn env(duplicates: Duplicates) -> Env {
        let mut vars = IndexMap::new();
        vars.insert("bootcmd".to_string(), "run x".to_string());
        vars.insert("bootdelay".to_string(), "3".to_string());
        Env {
            offset: 0x100,
            format: EnvFormat::plain(0x100),
            duplicates,
            vars,
        }
    }

    fn pairs(e: &EnvEntries) -> Vec<String> {
        e.iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    String::from_utf8_lossy(k),
                    String::from_utf8_lossy(v)
                )
            })
            .collect()
    }

    #[test]
    fn assignments() {
        assert_eq!(
            parse_assignment("bootargs=console=ttyS0").unwrap(),
            ("bootargs".to_string(), "console=ttyS0".to_string())
        );
        assert_eq!(parse_assignment("empty=").unwrap().1, "");
        assert!(parse_assignment("=x").is_err());
        assert!(parse_assignment("novalue").is_err());
    }

    #[test]
    fn vars_layer_over_existing_in_place() {
        let base = EnvEntries::from_pairs(
            [("ethaddr", "aa"), ("bootcmd", "old")],
            Duplicates::Reject,
        )
        .unwrap();
        let merged = merge_vars(
            &env(Duplicates::LastWins),
            base,
            &[("bootdelay".into(), "0".into())],
        )
        .unwrap();
        assert_eq!(
            pairs(&merged),
            ["ethaddr=aa", "bootcmd=run x", "bootdelay=0"]
        );
    }

    #[test]
    fn reject_policy_catches_repeated_override() {
        let err = merge_vars(
            &env(Duplicates::Reject),
            EnvEntries::new(),
            &[("bootcmd".into(), "boot".into())],
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("'bootcmd'"), "{err:#}");
    }

    #[test]
    fn rewrite_keeps_unrelated_entries() {
        let e = env(Duplicates::LastWins);
        let mut image = Image::filled(0x400, 0xff);
        let first = merge_vars(
            &e,
            EnvEntries::new(),
            &[("serial#".into(), "S1".into())],
        )
        .unwrap();
        store_env(&mut image, &e, &first).unwrap();

        let mut again = existing_env(&image, &e).unwrap();
        assert_eq!(again, first);
        again.set(ETHADDR, "00:11:32:A3:67:EF").unwrap();
        store_env(&mut image, &e, &again).unwrap();

        let block =
            flash_image::read_env(image.as_bytes(), 0x100, &e.format).unwrap();
        assert!(block.checksum_ok());
        assert_eq!(block.entries.get("serial#"), Some(&b"S1"[..]));
        assert_eq!(
            pairs(&block.entries).last().unwrap(),
            "ethaddr=00:11:32:A3:67:EF"
        );
    }

    #[test]
    fn erased_flash_is_not_an_env() {
        let image = Image::filled(0x400, 0xff);
        let e = env(Duplicates::LastWins);

        // Shared with `fwtool identity`, which has no --fresh.
        let err = format!("{:#}", existing_env(&image, &e).unwrap_err());
        assert!(err.contains("env block at 0x100"), "{err}");
        assert!(!err.contains("--fresh"), "{err}");

        let err = format!("{:#}", base_env(&image, &e, false).unwrap_err());
        assert!(err.starts_with("pass --fresh"), "{err}");
        assert!(base_env(&image, &e, true).unwrap().is_empty());
    }
}
