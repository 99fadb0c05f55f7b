// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use flash_image::env::Duplicates;
use flash_image::{
    Check, ChecksumScope, EnvFormat, Plan, PlanStep, ScanParams, VendorLayout,
};
use indexmap::IndexMap;
use serde::Deserialize;

/// A `RawProfile` is a device profile TOML file that has been deserialized
/// but not checked. Magic names are still names, and source paths are still
/// relative to the profile.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawProfile {
    name: String,
    flash_size: usize,
    #[serde(default = "erased")]
    fill: u8,
    #[serde(default)]
    sources: IndexMap<String, PathBuf>,
    #[serde(default)]
    plan: Vec<RawStep>,
    #[serde(default)]
    magic: IndexMap<String, String>,
    env: Option<RawEnv>,
    vendor: Option<RawVendor>,
    #[serde(default)]
    verify: RawVerify,
    scan: Option<RawScan>,
}

fn erased() -> u8 {
    0xff
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawStep {
    source: String,
    source_offset: Option<usize>,
    source_magic: Option<String>,
    search_from: Option<usize>,
    length: Option<usize>,
    until_magic: Option<String>,
    until_skip: Option<usize>,
    dest_offset: usize,
    #[serde(default)]
    overwrite: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawEnv {
    offset: usize,
    size: usize,
    #[serde(default)]
    flagged: bool,
    #[serde(default)]
    scope: RawScope,
    #[serde(default)]
    duplicates: RawDuplicates,
    #[serde(default)]
    vars: IndexMap<String, String>,
}

/// Either `scope = "block"`, `scope = "data"`, or `scope = { end = N }`.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum RawScope {
    Named(ScopeName),
    Extended { end: usize },
}

impl Default for RawScope {
    fn default() -> Self {
        RawScope::Named(ScopeName::Block)
    }
}

#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ScopeName {
    Block,
    Data,
}

#[derive(Copy, Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum RawDuplicates {
    Reject,
    #[default]
    LastWins,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawVendor {
    offset: usize,
    serial_offset: usize,
    serial_slot: usize,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawVerify {
    reference: Option<PathBuf>,
    #[serde(default)]
    preserve: Vec<Preserve>,
    #[serde(default)]
    magic: Vec<RawMagicCheck>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Preserve {
    pub name: String,
    pub offset: usize,
    pub length: usize,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawMagicCheck {
    name: String,
    offset: usize,
    magic: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawScan {
    pattern: String,
    search_limit: Option<usize>,
    #[serde(default)]
    tolerance: u64,
    #[serde(default)]
    load_bias: u64,
}

/// A device profile that has been checked for internal consistency and is
/// ready to drive the core.
#[derive(Clone, Debug)]
pub struct Profile {
    pub name: String,
    pub flash_size: usize,
    pub fill: u8,
    pub sources: IndexMap<String, PathBuf>,
    pub plan: Vec<Step>,
    pub magic: IndexMap<String, Vec<u8>>,
    pub env: Option<Env>,
    pub vendor: Option<VendorLayout>,
    pub verify: Verify,
    pub scan: Option<Scan>,
    pub profile_path: PathBuf,
}

/// Where a plan step starts reading its source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Start {
    Offset(usize),
    /// At the first occurrence of a magic at or after `search_from`.
    Magic {
        name: String,
        bytes: Vec<u8>,
        search_from: usize,
    },
}

/// How much a plan step copies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Extent {
    Length(usize),
    /// Up to the next occurrence of a magic, searching from `skip` bytes past
    /// the start.
    UntilMagic {
        name: String,
        bytes: Vec<u8>,
        skip: usize,
    },
    ToEnd,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    pub source: String,
    pub start: Start,
    pub extent: Extent,
    pub dest_offset: usize,
    pub overwrite: bool,
}

#[derive(Clone, Debug)]
pub struct Env {
    pub offset: usize,
    pub format: EnvFormat,
    pub duplicates: Duplicates,
    pub vars: IndexMap<String, String>,
}

#[derive(Clone, Debug, Default)]
pub struct Verify {
    pub reference: Option<PathBuf>,
    pub preserve: Vec<Preserve>,
    pub magic: Vec<MagicCheck>,
}

#[derive(Clone, Debug)]
pub struct MagicCheck {
    pub name: String,
    pub offset: usize,
    pub magic: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct Scan {
    pub pattern: String,
    pub search_limit: Option<usize>,
    pub tolerance: u64,
    pub load_bias: u64,
}

impl Profile {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_text(&text, path)
            .with_context(|| format!("loading profile {}", path.display()))
    }

    /// Parses profile text. Relative paths inside it are taken relative to
    /// the directory containing `path`.
    pub fn from_text(text: &str, path: &Path) -> Result<Self> {
        let raw: RawProfile = toml::from_str(text)?;
        let dir = path.parent().unwrap_or_else(|| Path::new(""));

        let mut magic = IndexMap::new();
        for (name, hex) in &raw.magic {
            let bytes = parse_hex(hex)
                .with_context(|| format!("magic '{name}' = \"{hex}\""))?;
            magic.insert(name.clone(), bytes);
        }
        let lookup = |name: &str| -> Result<Vec<u8>> {
            magic
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!(suggestion("magic", name, magic.keys())))
        };

        let mut plan = vec![];
        for (i, s) in raw.plan.iter().enumerate() {
            let step = resolve_step(s, &raw.sources, &lookup)
                .with_context(|| format!("plan step {i}"))?;
            plan.push(step);
        }

        let env = raw.env.map(|e| {
            let scope = match e.scope {
                RawScope::Named(ScopeName::Block) => ChecksumScope::Block,
                RawScope::Named(ScopeName::Data) => ChecksumScope::Data,
                RawScope::Extended { end } => ChecksumScope::Extended { end },
            };
            Env {
                offset: e.offset,
                format: EnvFormat {
                    size: e.size,
                    flagged: e.flagged,
                    scope,
                },
                duplicates: match e.duplicates {
                    RawDuplicates::Reject => Duplicates::Reject,
                    RawDuplicates::LastWins => Duplicates::LastWins,
                },
                vars: e.vars,
            }
        });
        if let Some(env) = &env {
            env.format.scope_range().context("[env] scope")?;
        }

        let verify = Verify {
            reference: raw.verify.reference.map(|p| dir.join(p)),
            preserve: raw.verify.preserve,
            magic: raw
                .verify
                .magic
                .into_iter()
                .map(|m| {
                    Ok(MagicCheck {
                        bytes: lookup(&m.magic)
                            .with_context(|| format!("verify '{}'", m.name))?,
                        name: m.name,
                        offset: m.offset,
                        magic: m.magic,
                    })
                })
                .collect::<Result<_>>()?,
        };

        Ok(Profile {
            name: raw.name,
            flash_size: raw.flash_size,
            fill: raw.fill,
            sources: raw
                .sources
                .into_iter()
                .map(|(name, p)| (name, dir.join(p)))
                .collect(),
            plan,
            magic,
            env,
            vendor: raw.vendor.map(|v| VendorLayout {
                offset: v.offset,
                serial_offset: v.serial_offset,
                serial_slot: v.serial_slot,
            }),
            verify,
            scan: raw.scan.map(|s| Scan {
                pattern: s.pattern,
                search_limit: s.search_limit,
                tolerance: s.tolerance,
                load_bias: s.load_bias,
            }),
            profile_path: path.to_owned(),
        })
    }

    /// Turns the plan into the purely numeric form the core wants, locating
    /// magic-relative starts and ends in the loaded `sources`.
    pub fn resolve_plan(
        &self,
        sources: &BTreeMap<String, Vec<u8>>,
    ) -> Result<Plan> {
        let mut plan = Plan::new();
        for (i, step) in self.plan.iter().enumerate() {
            let resolved = step
                .resolve(sources)
                .with_context(|| format!("plan step {i} ({})", step.source))?;
            log::info!(
                "step {i}: {} {:#x}+{:#x} -> {:#x}",
                resolved.source,
                resolved.source_offset,
                resolved.length,
                resolved.dest_offset,
            );
            plan.steps.push(resolved);
        }
        Ok(plan)
    }

    /// Checks implied by the profile: image size always, then whatever the
    /// `[verify]`, `[env]` and `[vendor]` sections describe.
    pub fn checks(&self) -> Vec<Check> {
        let mut out = vec![Check::Size(self.flash_size)];
        out.extend(self.verify.preserve.iter().map(|p| Check::Preserved {
            name: p.name.clone(),
            offset: p.offset,
            len: p.length,
        }));
        out.extend(self.verify.magic.iter().map(|m| Check::Magic {
            name: m.name.clone(),
            offset: m.offset,
            magic: m.bytes.clone(),
        }));
        if let Some(env) = &self.env {
            out.push(Check::Env {
                offset: env.offset,
                format: env.format,
            });
        }
        if let Some(vendor) = self.vendor {
            out.push(Check::Identity(vendor));
        }
        out
    }

    pub fn scan_params(&self, target_offset: u64) -> ScanParams {
        let scan = self.scan.as_ref();
        ScanParams {
            target_offset,
            search_limit: scan
                .and_then(|s| s.search_limit)
                .unwrap_or(usize::MAX),
            tolerance: scan.map_or(0, |s| s.tolerance),
            load_bias: scan.map_or(0, |s| s.load_bias),
        }
    }
}

fn resolve_step(
    raw: &RawStep,
    sources: &IndexMap<String, PathBuf>,
    lookup: &dyn Fn(&str) -> Result<Vec<u8>>,
) -> Result<Step> {
    if !sources.contains_key(&raw.source) {
        bail!(suggestion("source", &raw.source, sources.keys()));
    }

    let start = match (&raw.source_offset, &raw.source_magic) {
        (Some(off), None) => {
            if raw.search_from.is_some() {
                bail!("search-from only applies to source-magic");
            }
            Start::Offset(*off)
        }
        (None, Some(name)) => Start::Magic {
            name: name.clone(),
            bytes: lookup(name)?,
            search_from: raw.search_from.unwrap_or(0),
        },
        _ => bail!("exactly one of source-offset and source-magic is needed"),
    };

    let extent = match (raw.length, &raw.until_magic) {
        (Some(_), Some(_)) => {
            bail!("length and until-magic can't both be given")
        }
        (Some(len), None) => Extent::Length(len),
        (None, Some(name)) => Extent::UntilMagic {
            name: name.clone(),
            bytes: lookup(name)?,
            skip: raw.until_skip.unwrap_or(0),
        },
        (None, None) => Extent::ToEnd,
    };
    if raw.until_skip.is_some() && raw.until_magic.is_none() {
        bail!("until-skip only applies to until-magic");
    }

    Ok(Step {
        source: raw.source.clone(),
        start,
        extent,
        dest_offset: raw.dest_offset,
        overwrite: raw.overwrite,
    })
}

impl Step {
    fn resolve(
        &self,
        sources: &BTreeMap<String, Vec<u8>>,
    ) -> Result<PlanStep> {
        let src = sources.get(&self.source).ok_or_else(|| {
            anyhow!("source '{}' was not loaded", self.source)
        })?;

        let source_offset = match &self.start {
            Start::Offset(off) => *off,
            Start::Magic {
                name,
                bytes,
                search_from,
            } => flash_image::find_signature_from(src, bytes, *search_from)
                .ok_or_else(|| {
                    anyhow!("magic '{name}' not found after {search_from:#x}")
                })?,
        };

        let length = match &self.extent {
            Extent::Length(len) => *len,
            Extent::ToEnd => src.len().checked_sub(source_offset).ok_or_else(
                || anyhow!("start {source_offset:#x} is past the end"),
            )?,
            Extent::UntilMagic { name, bytes, skip } => {
                let from = source_offset.saturating_add(*skip);
                let end = flash_image::find_signature_from(src, bytes, from)
                    .ok_or_else(|| {
                        anyhow!("magic '{name}' not found after {from:#x}")
                    })?;
                end - source_offset
            }
        };

        Ok(PlanStep {
            source: self.source.clone(),
            source_offset,
            length,
            dest_offset: self.dest_offset,
            overwrite: self.overwrite,
        })
    }
}

/// Builds an "unknown name" message, suggesting the closest known name if
/// one is close enough.
pub fn suggestion<'a>(
    what: &str,
    name: &str,
    known: impl IntoIterator<Item = &'a String>,
) -> String {
    // Suggest only for very small differences; larger ones give silly
    // suggestions for short names.
    const MAX_DISTANCE: usize = 3;

    let mut scored: Vec<_> = known
        .into_iter()
        .filter_map(|s| {
            let distance = strsim::damerau_levenshtein(name, s);
            (distance <= MAX_DISTANCE).then_some((distance, s))
        })
        .collect();
    scored.sort();
    let mut out = format!("'{name}' is not a known {what}.");
    if let Some((_, s)) = scored.first() {
        out.push_str(&format!(" Did you mean '{s}'?"));
    }
    out
}

/// Parses a magic written as hex digits, e.g. `"d00dfeed"` or
/// `"0x27051956"`. Underscores and spaces are ignored.
pub fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let digits: String = s
        .trim_start_matches("0x")
        .chars()
        .filter(|c| *c != '_' && *c != ' ')
        .collect();
    if digits.is_empty() {
        bail!("no hex digits");
    }
    hex::decode(&digits).context("not a hex string")
}
