// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use anyhow::{bail, Result};

use crate::config::Profile;
use crate::files;

pub fn run(
    profile_path: &Path,
    image_path: &Path,
    reference: Option<&Path>,
) -> Result<()> {
    let profile = Profile::from_file(profile_path)?;
    // Size is one of the checks, so don't insist on it while loading.
    let image = files::read(image_path)?;
    let reference = match reference.or(profile.verify.reference.as_deref()) {
        Some(path) => Some(files::read(path)?),
        None => None,
    };

    let report = flash_image::verify(
        &image,
        reference.as_deref(),
        &profile.checks(),
    );
    println!("{}: {}", image_path.display(), profile.name);
    println!("{report}");

    let failed = report.failures().count();
    if failed != 0 {
        bail!("{failed} check(s) failed");
    }
    Ok(())
}
