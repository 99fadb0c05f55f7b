// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Building an image out of pieces of other images.
//!
//! A [`Plan`] is an ordered list of copies. Destination ranges of different
//! steps may not overlap unless the later step says it means to overwrite;
//! two pieces laid out from different source maps landing on top of each
//! other is the usual way a hand-assembled image ends up bricking a board.

use std::collections::BTreeMap;

use crate::region::{self, Image, Region, RegionMap};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanStep {
    /// Name of the source image to copy from.
    pub source: String,
    pub source_offset: usize,
    pub length: usize,
    pub dest_offset: usize,
    /// Allow this step to land on top of earlier ones.
    pub overwrite: bool,
}

impl PlanStep {
    fn region(&self, index: usize) -> Region {
        Region::new(
            format!("step {index} ({})", self.source),
            self.dest_offset,
            self.length,
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a copy that must not overlap anything before it.
    pub fn copy(
        mut self,
        source: impl Into<String>,
        source_offset: usize,
        length: usize,
        dest_offset: usize,
    ) -> Self {
        self.steps.push(PlanStep {
            source: source.into(),
            source_offset,
            length,
            dest_offset,
            overwrite: false,
        });
        self
    }

    /// Appends a copy that is allowed to replace earlier steps' bytes.
    pub fn overwrite(
        mut self,
        source: impl Into<String>,
        source_offset: usize,
        length: usize,
        dest_offset: usize,
    ) -> Self {
        self = self.copy(source, source_offset, length, dest_offset);
        if let Some(last) = self.steps.last_mut() {
            last.overwrite = true;
        }
        self
    }

    /// Checks every step against `sources` and an output of `output_size`
    /// bytes without copying anything, returning the final layout of the
    /// output.
    pub fn check<S: AsRef<[u8]>>(
        &self,
        sources: &BTreeMap<String, S>,
        output_size: usize,
    ) -> Result<RegionMap> {
        let mut layout = RegionMap::new(output_size);
        for (i, step) in self.steps.iter().enumerate() {
            let src = sources
                .get(&step.source)
                .ok_or_else(|| Error::UnknownSource {
                    step: i,
                    name: step.source.clone(),
                })?
                .as_ref();

            region::checked_range(step.source_offset, step.length, src.len())
                .map_err(|_| Error::SourceOutOfBounds {
                    step: i,
                    name: step.source.clone(),
                    offset: step.source_offset,
                    len: step.length,
                    size: src.len(),
                })?;
            region::checked_range(step.dest_offset, step.length, output_size)
                .map_err(|_| Error::DestOutOfBounds {
                    step: i,
                    offset: step.dest_offset,
                    len: step.length,
                    size: output_size,
                })?;

            layout.claim(step.region(i), step.overwrite)?;
        }
        Ok(layout)
    }
}

/// Assembles a new `output_size` byte image, initially all `fill`, by
/// running `plan` against `sources`.
///
/// The whole plan is validated before the output is allocated, so on error
/// nothing has been built.
pub fn compose<S: AsRef<[u8]>>(
    sources: &BTreeMap<String, S>,
    plan: &Plan,
    output_size: usize,
    fill: u8,
) -> Result<Image> {
    plan.check(sources, output_size)?;

    let mut out = Image::filled(output_size, fill);
    for (i, step) in plan.steps.iter().enumerate() {
        // Presence and bounds were established by `check`.
        let src = sources[&step.source].as_ref();
        out.copy_from(src, step.source_offset, step.dest_offset, step.length)?;
        log::debug!(
            "step {i}: {}[{:#x}..{:#x}] -> {:#x}..{:#x}{}",
            step.source,
            step.source_offset,
            step.source_offset + step.length,
            step.dest_offset,
            step.dest_offset + step.length,
            if step.overwrite { " (overwrite)" } else { "" },
        );
    }
    Ok(out)
}
