// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flash_image::Image;

use crate::config::Profile;

pub fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Reads a whole-flash image, which must be exactly the profile's flash
/// size.
pub fn read_image(path: &Path, profile: &Profile) -> Result<Image> {
    Image::from_vec(read(path)?, profile.flash_size)
        .with_context(|| format!("loading image {}", path.display()))
}

/// Reads every source the profile names, keyed by name.
pub fn read_sources(profile: &Profile) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut out = BTreeMap::new();
    for (name, path) in &profile.sources {
        let bytes = read(path)?;
        log::info!(
            "source {name}: {} ({:#x} bytes)",
            path.display(),
            bytes.len()
        );
        out.insert(name.clone(), bytes);
    }
    Ok(out)
}

/// An output file being written.
///
/// Contents go to a `.partial` file next to the destination, which is only
/// renamed into place by [`Output::finish`]. Anything that fails before
/// then leaves the destination as it was.
pub struct Output {
    final_path: PathBuf,
    tmp_path: PathBuf,
    file: File,
}

impl Output {
    pub fn create(dest: impl AsRef<Path>) -> Result<Self> {
        let final_path = PathBuf::from(dest.as_ref());

        let mut tmp_name =
            final_path.file_name().unwrap_or_default().to_owned();
        tmp_name.push(".partial");
        let tmp_path = final_path.with_file_name(tmp_name);

        let file = File::create(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        Ok(Self {
            final_path,
            tmp_path,
            file,
        })
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .with_context(|| format!("writing {}", self.tmp_path.display()))
    }

    /// Flushes the temporary file and moves it to its final location.
    pub fn finish(self) -> Result<()> {
        let Self {
            final_path,
            tmp_path,
            file,
        } = self;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "renaming {} to {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;
        Ok(())
    }
}

/// Writes `image` to `dest` through an [`Output`].
pub fn write_image(dest: &Path, image: &Image) -> Result<()> {
    let mut out = Output::create(dest)?;
    out.write(image.as_bytes())?;
    out.finish()?;
    log::info!("wrote {} ({:#x} bytes)", dest.display(), image.len());
    Ok(())
}
