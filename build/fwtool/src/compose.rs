// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use anyhow::{bail, Context, Result};
use flash_image::EnvEntries;

use crate::config::Profile;
use crate::files;
use crate::patch::{self, Identity};

/// Builds a new image from the profile's sources and plan, then writes the
/// environment block and, if given, the device identity into it.
pub fn run(
    profile_path: &Path,
    out: &Path,
    identity: Option<Identity>,
) -> Result<()> {
    let profile = Profile::from_file(profile_path)?;
    if profile.plan.is_empty() {
        bail!("{} has no [[plan]] steps", profile_path.display());
    }
    if identity.is_some() && profile.vendor.is_none() {
        bail!("--mac/--serial given, but the profile has no [vendor]");
    }

    let sources = files::read_sources(&profile)?;
    let plan = profile.resolve_plan(&sources)?;
    let mut image = flash_image::compose(
        &sources,
        &plan,
        profile.flash_size,
        profile.fill,
    )
    .context("composing image")?;

    // Identity goes first so that an env checksum reaching past the block
    // covers its final contents.
    if let Some(id) = &identity {
        patch::write_identity(&mut image, &profile, id)?;
    } else if profile.vendor.is_some() {
        log::info!("no identity given; vendor region left as composed");
    }

    if let Some(env) = &profile.env {
        let mut entries = patch::merge_vars(env, EnvEntries::new(), &[])?;
        if let Some(id) = &identity {
            entries.set(patch::ETHADDR, id.mac.to_string())?;
        }
        patch::store_env(&mut image, env, &entries)?;
    }

    files::write_image(out, &image)
}
