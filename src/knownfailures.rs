//! Known-failure catalogue and the skip oracle.
//!
//! `knownfailures.json` is a declarative list of rules, each binding a
//! set of tests to the variant combinations under which they must not
//! run. A rule looks like:
//!
//! ```json
//! {
//!   "tests": ["004-ThreadStress", "130-hprof"],
//!   "test_patterns": ["6\\d\\d-checker-.*"],
//!   "variant": "gcstress | jit & debuggable",
//!   "devices": "aosp_cf_x86_64_phone",
//!   "env_vars": {"SANITIZE_HOST": "address"},
//!   "description": "Flaky under gc stress.",
//!   "bug": "b/123456789"
//! }
//! ```
//!
//! The variant expression grammar is `clause ('|' clause)*` with
//! `clause = tag ('&' tag)*`; it parses once into a disjunction of
//! conjunctive tag sets, and a combination is disabled when any
//! conjunction is a subset of its tags. A missing expression matches
//! every combination. `description` and `bug` are human metadata; any
//! unknown key is a validation error.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::variant::{self, Tag, Target};

#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed known-failures catalogue: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{tag:?} is not a valid variant (in the rule for {rule})")]
    UnknownVariant { tag: String, rule: String },

    #[error("{test:?} is not a valid run-test (in the rule for {rule})")]
    UnknownTest { test: String, rule: String },

    #[error("invalid test pattern {pattern:?} (in the rule for {rule}): {source}")]
    BadPattern {
        pattern: String,
        rule: String,
        #[source]
        source: regex::Error,
    },
}

/// A JSON field that may be written as one string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

/// One catalogue entry as authored. Unknown keys are rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    #[serde(default)]
    tests: OneOrMany,
    #[serde(default)]
    test_patterns: Vec<String>,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    devices: Option<OneOrMany>,
    #[serde(default)]
    env_vars: Option<BTreeMap<String, String>>,
    // Human metadata, type-checked and otherwise ignored.
    #[serde(default)]
    description: Option<OneOrMany>,
    #[serde(default)]
    bug: Option<String>,
}

impl RawRule {
    /// A short label to pinpoint the rule in error messages.
    fn label(&self, index: usize) -> String {
        let hint = match (&self.tests, &self.description) {
            (OneOrMany::One(t), _) => Some(t.clone()),
            (OneOrMany::Many(ts), _) if !ts.is_empty() => Some(ts[0].clone()),
            (_, Some(OneOrMany::One(d))) => Some(d.clone()),
            _ => None,
        };
        match hint {
            Some(hint) => format!("entry #{index} ({hint})"),
            None => format!("entry #{index}"),
        }
    }
}

/// Facts the loader needs about the current run.
pub struct SkipContext<'a> {
    /// The discovered run-test set; rule tests must be members.
    pub tests: &'a BTreeSet<String>,
    /// Product name of the connected device, when a device is in play.
    pub device: Option<String>,
    /// Under the build system only a shard of the tests is visible, so
    /// unknown test names are ignored rather than fatal.
    pub run_from_build: bool,
    /// Snapshot of the environment for `env_vars` gating.
    pub env: BTreeMap<String, String>,
}

/// Per-test disjunctions of conjunctive tag sets.
#[derive(Debug, Default)]
pub struct SkipTable(BTreeMap<String, BTreeSet<BTreeSet<Tag>>>);

impl SkipTable {
    fn matches(&self, test: &str, tags: &BTreeSet<Tag>) -> bool {
        self.0
            .get(test)
            .is_some_and(|sets| sets.iter().any(|conj| conj.is_subset(tags)))
    }

    #[cfg(test)]
    fn entry_count(&self, test: &str) -> usize {
        self.0.get(test).map_or(0, |sets| sets.len())
    }
}

/// Loads and resolves the catalogue file into a skip table.
pub fn load_skip_table(path: &Path, ctx: &SkipContext<'_>) -> Result<SkipTable, CatalogueError> {
    let content = std::fs::read_to_string(path).map_err(|source| CatalogueError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_skip_table(&content, ctx)
}

/// Resolves catalogue JSON into a skip table, applying device and
/// environment gating.
pub fn parse_skip_table(json: &str, ctx: &SkipContext<'_>) -> Result<SkipTable, CatalogueError> {
    let rules: Vec<RawRule> = serde_json::from_str(json)?;
    let mut table: BTreeMap<String, BTreeSet<BTreeSet<Tag>>> = BTreeMap::new();

    for (index, rule) in rules.into_iter().enumerate() {
        let label = rule.label(index);

        let mut tests = rule.tests.into_vec();
        for pattern in &rule.test_patterns {
            let matcher = Regex::new(pattern).map_err(|source| CatalogueError::BadPattern {
                pattern: pattern.clone(),
                rule: label.clone(),
                source,
            })?;
            tests.extend(ctx.tests.iter().filter(|t| matcher.is_match(t)).cloned());
        }

        let mut variants = parse_variant_expression(rule.variant.as_deref()).map_err(|tag| {
            CatalogueError::UnknownVariant {
                tag,
                rule: label.clone(),
            }
        })?;

        // A "devices" list makes the rule equivalent to an extra `target`
        // conjunct, active only when the current device is listed.
        if let Some(devices) = rule.devices {
            let devices = devices.into_vec();
            if !devices.is_empty() {
                let on_listed_device = ctx
                    .device
                    .as_deref()
                    .is_some_and(|current| devices.iter().any(|d| d == current));
                if !on_listed_device {
                    continue;
                }
                let target = Tag::resolve(Target::Device.tag()).ok_or_else(|| {
                    CatalogueError::UnknownVariant {
                        tag: Target::Device.tag().to_string(),
                        rule: label.clone(),
                    }
                })?;
                variants = variants
                    .into_iter()
                    .map(|mut conj| {
                        conj.insert(target);
                        conj
                    })
                    .collect();
            }
        }

        if let Some(required) = &rule.env_vars {
            let satisfied = required
                .iter()
                .all(|(key, value)| ctx.env.get(key) == Some(value));
            if !satisfied {
                continue;
            }
        }

        for test in tests {
            if !ctx.tests.contains(&test) {
                if ctx.run_from_build {
                    // The build system shards the suite; this shard
                    // simply doesn't contain the test.
                    continue;
                }
                return Err(CatalogueError::UnknownTest {
                    test,
                    rule: label.clone(),
                });
            }
            table.entry(test).or_default().extend(variants.clone());
        }
    }

    Ok(SkipTable(table))
}

/// Parses a variant expression into a disjunction of conjunctive tag
/// sets. A missing or empty expression matches everything; the error
/// value is the offending tag.
pub fn parse_variant_expression(
    expr: Option<&str>,
) -> Result<BTreeSet<BTreeSet<Tag>>, String> {
    let expr = expr.unwrap_or_default().trim();
    if expr.is_empty() {
        return Ok(Tag::all().map(|tag| BTreeSet::from([tag])).collect());
    }

    let mut disjunction = BTreeSet::new();
    for clause in expr.split('|') {
        let mut conjunction = BTreeSet::new();
        for tag in clause.split('&') {
            let tag = tag.trim();
            conjunction.insert(Tag::resolve(tag).ok_or_else(|| tag.to_string())?);
        }
        disjunction.insert(conjunction);
    }
    Ok(disjunction)
}

/// Decides whether a (test, variant set) combination runs.
pub struct SkipOracle {
    table: SkipTable,
    nonfunctional: BTreeSet<BTreeSet<Tag>>,
    forced: BTreeSet<String>,
    dry_run: bool,
    ignore_skips: bool,
}

impl SkipOracle {
    pub fn new(
        table: SkipTable,
        forced: BTreeSet<String>,
        dry_run: bool,
        ignore_skips: bool,
    ) -> SkipOracle {
        SkipOracle {
            table,
            nonfunctional: variant::nonfunctional_variant_sets(),
            forced,
            dry_run,
            ignore_skips,
        }
    }

    /// True when the combination must not launch.
    ///
    /// Dry-run mode disables everything (the orchestrator prints the
    /// planned names and launches nothing); `--no-skips` bypasses the
    /// forced-skip set and the catalogue but never the nonfunctional
    /// combinations.
    pub fn is_disabled(&self, test: &str, tags: &BTreeSet<Tag>) -> bool {
        if self.dry_run {
            return true;
        }
        if !self.ignore_skips
            && (self.forced.contains(test) || self.table.matches(test, tags))
        {
            return true;
        }
        self.nonfunctional.iter().any(|conj| conj.is_subset(tags))
    }
}
