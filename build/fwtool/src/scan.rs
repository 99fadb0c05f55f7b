// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::Write;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use flash_image::{InstructionWord, Reference};

use crate::config::Profile;
use crate::files;

/// Everything `fwtool scan` accepts. Command-line values win over the
/// profile's `[scan]` section.
#[derive(Clone, Debug)]
pub struct ScanArgs {
    pub image: PathBuf,
    pub profile: Option<PathBuf>,
    pub pattern: Option<String>,
    pub tolerance: Option<u64>,
    pub limit: Option<usize>,
    pub load_bias: Option<u64>,
    pub jobs: Option<NonZeroUsize>,
    pub context: usize,
}

pub fn run(args: &ScanArgs) -> Result<()> {
    let profile = args
        .profile
        .as_deref()
        .map(Profile::from_file)
        .transpose()?;
    let scan = profile.as_ref().and_then(|p| p.scan.as_ref());
    let pattern = args
        .pattern
        .clone()
        .or_else(|| scan.map(|s| s.pattern.clone()))
        .ok_or_else(|| anyhow!("no --pattern given and no [scan] profile"))?;

    let buf = files::read(&args.image)?;
    let Some(target) = flash_image::find_signature(&buf, pattern.as_bytes())
    else {
        println!("pattern {pattern:?} not found in {}", args.image.display());
        return Ok(());
    };
    println!("pattern {pattern:?} at {target:#010x}");

    let mut params = match &profile {
        Some(p) => p.scan_params(target as u64),
        None => flash_image::ScanParams {
            target_offset: target as u64,
            search_limit: usize::MAX,
            tolerance: 0,
            load_bias: 0,
        },
    };
    if let Some(t) = args.tolerance {
        params.tolerance = t;
    }
    if let Some(l) = args.limit {
        params.search_limit = l;
    }
    if let Some(b) = args.load_bias {
        params.load_bias = b;
    }
    let jobs = args
        .jobs
        .or_else(|| std::thread::available_parallelism().ok())
        .unwrap_or(NonZeroUsize::MIN);
    log::info!(
        "scanning up to {:#x} with tolerance {} on {jobs} threads",
        params.search_limit.min(buf.len()),
        params.tolerance,
    );

    let hits = flash_image::scan_references_parallel(&buf, &params, jobs)
        .with_context(|| format!("scanning {}", args.image.display()))?;
    print!("{}", render(&buf, &hits, args.context));
    Ok(())
}

fn render(buf: &[u8], hits: &[Reference], context: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} candidate reference{} (heuristic: may miss some, may include \
         data that looks like code)",
        hits.len(),
        if hits.len() == 1 { "" } else { "s" },
    );
    for hit in hits {
        let _ = write!(
            out,
            "  {:#010x}  {:<4} -> {:#010x}",
            hit.address, hit.kind, hit.computed_target
        );
        if let Some(p) = hit.pointer {
            let _ = write!(out, " => {p:#010x}");
        }
        out.push('\n');

        if context > 0 {
            for insn in flash_image::decode_window(buf, hit.address, context) {
                let _ = writeln!(out, "{}", line(&insn, hit.address));
            }
            out.push('\n');
        }
    }
    out
}

fn line(insn: &InstructionWord, hit: usize) -> String {
    let mark = if insn.address == hit { ">" } else { " " };
    let bytes = insn.word.to_le_bytes();
    let mut s = format!(
        "    {mark} {:#010x}: {:02x} {:02x} {:02x} {:02x}  {:<4}",
        insn.address, bytes[0], bytes[1], bytes[2], bytes[3], insn.kind,
    );
    if let Some(t) = insn.target {
        let _ = write!(s, " x{}, {t:#x}", insn.register);
    }
    s
}
