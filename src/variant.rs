//! Variant axes, tags, and test combinations.
//!
//! A run-test executes under one value from each of twelve orthogonal
//! *axes* (compiler backend, garbage collector, image mode, ...). This
//! module is the catalogue of those axes and the home of [`Combination`],
//! the full assignment of one tag per axis plus a test name.
//!
//! # Axes
//!
//! | Axis | Tags |
//! |------|------|
//! | `run` | `ndebug`, `debug` |
//! | `target` | `target`, `host`, `jvm` |
//! | `trace` | `trace`, `ntrace`, `stream` |
//! | `image` | `picimage`, `no-image` |
//! | `debuggable` | `ndebuggable`, `debuggable` |
//! | `gc` | `gcstress`, `gcverify`, `cms` |
//! | `prebuild` | `no-prebuild`, `prebuild` |
//! | `relocate` | `relocate`, `no-relocate` |
//! | `jni` | `jni`, `forcecopy`, `checkjni` |
//! | `address_sizes` | `64`, `32` |
//! | `jvmti` | `no-jvmti`, `jvmti-stress`, `redefine-stress`, `trace-stress`, `field-stress`, `step-stress` |
//! | `compiler` | `interp-ac`, `interpreter`, `jit`, `jit-on-first-use`, `optimizing`, `speed-profile`, `baseline` |
//!
//! Tags are unique across all axes; [`verify_catalogue`] enforces that at
//! startup so a tag string alone identifies its axis.
//!
//! The `jvm` target is segregated: it combines with no other axis and its
//! combinations carry no address-size suffix, so [`Combination`] is a sum
//! of the full matrix form and the bare jvm form.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;

/// Defines one axis as a copyable enum with its tag table.
macro_rules! axis {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $tag:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every value of this axis, in catalogue order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The tag strings of this axis, in catalogue order.
            pub const TAGS: &'static [&'static str] = &[$($tag),+];

            /// The tag string identifying this value.
            pub fn tag(self) -> &'static str {
                match self {
                    $($name::$variant => $tag),+
                }
            }

            /// Looks a value up by its tag string.
            pub fn from_tag(tag: &str) -> Option<Self> {
                match tag {
                    $($tag => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.tag())
            }
        }
    };
}

axis! {
    /// Whether the runtime asserts are compiled in.
    Run { Ndebug => "ndebug", Debug => "debug" }
}

axis! {
    /// Where the test executes: the connected device, the host runtime,
    /// or a plain JVM.
    Target { Device => "target", Host => "host", Jvm => "jvm" }
}

axis! {
    /// Method tracing mode.
    Trace { Trace => "trace", Ntrace => "ntrace", Stream => "stream" }
}

axis! {
    /// Boot-image mode.
    Image { Picimage => "picimage", NoImage => "no-image" }
}

axis! {
    /// Whether the code is compiled debuggable.
    Debuggable { Ndebuggable => "ndebuggable", Debuggable => "debuggable" }
}

axis! {
    /// Garbage-collector stress mode.
    Gc { Gcstress => "gcstress", Gcverify => "gcverify", Cms => "cms" }
}

axis! {
    /// Whether dex files are compiled ahead of the run.
    Prebuild { NoPrebuild => "no-prebuild", Prebuild => "prebuild" }
}

axis! {
    /// Image relocation mode.
    Relocate { Relocate => "relocate", NoRelocate => "no-relocate" }
}

axis! {
    /// JNI checking mode.
    Jni { Jni => "jni", Forcecopy => "forcecopy", Checkjni => "checkjni" }
}

axis! {
    /// Pointer width of the runtime under test.
    AddressSize { Bits64 => "64", Bits32 => "32" }
}

axis! {
    /// JVMTI stress mode.
    Jvmti {
        NoJvmti => "no-jvmti",
        JvmtiStress => "jvmti-stress",
        RedefineStress => "redefine-stress",
        TraceStress => "trace-stress",
        FieldStress => "field-stress",
        StepStress => "step-stress",
    }
}

axis! {
    /// Compiler backend selection.
    Compiler {
        InterpAc => "interp-ac",
        Interpreter => "interpreter",
        Jit => "jit",
        JitOnFirstUse => "jit-on-first-use",
        Optimizing => "optimizing",
        SpeedProfile => "speed-profile",
        Baseline => "baseline",
    }
}

/// Name and tag table of one axis, for code that iterates the catalogue
/// (CLI flag generation, the recogniser, validation).
pub struct AxisInfo {
    pub name: &'static str,
    pub tags: &'static [&'static str],
}

/// All axes, in catalogue order.
pub const AXES: &[AxisInfo] = &[
    AxisInfo { name: "run", tags: Run::TAGS },
    AxisInfo { name: "target", tags: Target::TAGS },
    AxisInfo { name: "trace", tags: Trace::TAGS },
    AxisInfo { name: "image", tags: Image::TAGS },
    AxisInfo { name: "debuggable", tags: Debuggable::TAGS },
    AxisInfo { name: "gc", tags: Gc::TAGS },
    AxisInfo { name: "prebuild", tags: Prebuild::TAGS },
    AxisInfo { name: "relocate", tags: Relocate::TAGS },
    AxisInfo { name: "jni", tags: Jni::TAGS },
    AxisInfo { name: "address_sizes", tags: AddressSize::TAGS },
    AxisInfo { name: "jvmti", tags: Jvmti::TAGS },
    AxisInfo { name: "compiler", tags: Compiler::TAGS },
];

/// A single variant tag, interned against the axis catalogue.
///
/// Known-failure rules and skip-table conjunctions are sets of `Tag`s;
/// interning makes the subset tests cheap pointer-free string compares
/// over `&'static str`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(&'static str);

impl Tag {
    /// Resolves an arbitrary string against the catalogue.
    ///
    /// Returns `None` for anything that is not a known tag of some axis.
    pub fn resolve(s: &str) -> Option<Tag> {
        AXES.iter()
            .flat_map(|axis| axis.tags.iter().copied())
            .find(|tag| *tag == s)
            .map(Tag)
    }

    pub fn as_str(self) -> &'static str {
        self.0
    }

    /// Every tag of every axis, in catalogue order.
    pub fn all() -> impl Iterator<Item = Tag> {
        AXES.iter()
            .flat_map(|axis| axis.tags.iter().copied())
            .map(Tag)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self.0)
    }
}

/// Checks the startup invariant that every tag is unique across axes.
pub fn verify_catalogue() -> Result<()> {
    let mut seen = BTreeSet::new();
    for axis in AXES {
        for tag in axis.tags {
            if !seen.insert(*tag) {
                bail!("variant tag {tag:?} appears in more than one axis");
            }
        }
    }
    Ok(())
}

/// Variant sets that are never executable, regardless of the catalogue.
///
/// The schema matches per-test skip entries (disjunction of conjunctions)
/// and the oracle always consults it; the set itself ships empty and is
/// populated from the known-failures catalogue when contradictions are
/// identified.
pub fn nonfunctional_variant_sets() -> BTreeSet<BTreeSet<Tag>> {
    BTreeSet::new()
}

/// One full assignment of tags to all variant axes, plus a test name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Combination {
    /// A host or device combination carrying every axis.
    Matrix(MatrixCombination),
    /// A jvm combination; the jvm target combines with nothing else.
    Jvm(JvmCombination),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatrixCombination {
    pub test: String,
    /// `Target::Device` or `Target::Host`; the expander and the parser
    /// never put `Jvm` here.
    pub target: Target,
    pub run: Run,
    pub prebuild: Prebuild,
    pub compiler: Compiler,
    pub relocate: Relocate,
    pub trace: Trace,
    pub gc: Gc,
    pub jni: Jni,
    pub image: Image,
    pub debuggable: Debuggable,
    pub jvmti: Jvmti,
    pub address_size: AddressSize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JvmCombination {
    pub test: String,
}

impl Combination {
    pub fn test(&self) -> &str {
        match self {
            Combination::Matrix(m) => &m.test,
            Combination::Jvm(j) => &j.test,
        }
    }

    pub fn target(&self) -> Target {
        match self {
            Combination::Matrix(m) => m.target,
            Combination::Jvm(_) => Target::Jvm,
        }
    }

    /// Renders the canonical dashed name.
    ///
    /// The component order here is the parse-canonical order and must
    /// match [`CanonicalParser`]. Jvm combinations render empty axis
    /// segments and no address suffix.
    pub fn canonical(&self) -> String {
        let (target, s, test, address) = match self {
            Combination::Matrix(m) => (
                m.target.tag(),
                [
                    m.run.tag(),
                    m.prebuild.tag(),
                    m.compiler.tag(),
                    m.relocate.tag(),
                    m.trace.tag(),
                    m.gc.tag(),
                    m.jni.tag(),
                    m.image.tag(),
                    m.debuggable.tag(),
                    m.jvmti.tag(),
                ],
                m.test.as_str(),
                m.address_size.tag(),
            ),
            Combination::Jvm(j) => (Target::Jvm.tag(), [""; 10], j.test.as_str(), ""),
        };
        let [run, prebuild, compiler, relocate, trace, gc, jni, image, debuggable, jvmti] = s;
        format!(
            "test-art-{target}-run-test-{run}-{prebuild}-{compiler}-{relocate}-{trace}-{gc}-\
             {jni}-{image}-{debuggable}-{jvmti}-{test}{address}"
        )
    }

    /// The tag set of this combination, used by the skip oracle.
    ///
    /// Matrix combinations contribute one tag per axis including the
    /// address size; jvm combinations contribute only `jvm`.
    pub fn tags(&self) -> BTreeSet<Tag> {
        match self {
            Combination::Matrix(m) => [
                Tag(m.target.tag()),
                Tag(m.run.tag()),
                Tag(m.prebuild.tag()),
                Tag(m.compiler.tag()),
                Tag(m.relocate.tag()),
                Tag(m.trace.tag()),
                Tag(m.gc.tag()),
                Tag(m.jni.tag()),
                Tag(m.image.tag()),
                Tag(m.debuggable.tag()),
                Tag(m.jvmti.tag()),
                Tag(m.address_size.tag()),
            ]
            .into_iter()
            .collect(),
            Combination::Jvm(_) => [Tag(Target::Jvm.tag())].into_iter().collect(),
        }
    }

    /// The run-test flags implied by the axis values of this combination.
    ///
    /// Environment-dependent flags (chroot and root overrides for device
    /// runs) are appended by the runner, not here.
    pub fn child_flags(&self) -> Vec<String> {
        let m = match self {
            Combination::Jvm(_) => return vec!["--jvm".to_string()],
            Combination::Matrix(m) => m,
        };

        let mut args: Vec<&str> = Vec::new();
        if m.target == Target::Host {
            args.push("--host");
        }
        if m.run == Run::Ndebug {
            args.push("-O");
        }
        match m.prebuild {
            Prebuild::Prebuild => args.push("--prebuild"),
            Prebuild::NoPrebuild => args.push("--no-prebuild"),
        }
        match m.compiler {
            Compiler::Optimizing => args.push("--optimizing"),
            Compiler::Interpreter => args.push("--interpreter"),
            Compiler::InterpAc => args.extend(["--switch-interpreter", "--verify-soft-fail"]),
            Compiler::Jit => args.push("--jit"),
            Compiler::JitOnFirstUse => {
                args.extend(["--jit", "--runtime-option", "-Xjitthreshold:0"]);
            }
            Compiler::SpeedProfile => args.push("--random-profile"),
            Compiler::Baseline => args.push("--baseline"),
        }
        match m.relocate {
            Relocate::Relocate => args.push("--relocate"),
            Relocate::NoRelocate => args.push("--no-relocate"),
        }
        match m.trace {
            Trace::Trace => args.push("--trace"),
            Trace::Stream => args.extend(["--trace", "--stream"]),
            Trace::Ntrace => {}
        }
        match m.gc {
            Gc::Gcverify => args.push("--gcverify"),
            Gc::Gcstress => args.push("--gcstress"),
            Gc::Cms => {}
        }
        match m.jni {
            Jni::Forcecopy => args.extend(["--runtime-option", "-Xjniopts:forcecopy"]),
            Jni::Checkjni => args.extend(["--runtime-option", "-Xcheck:jni"]),
            Jni::Jni => {}
        }
        if m.image == Image::NoImage {
            args.push("--no-image");
        }
        if m.debuggable == Debuggable::Debuggable {
            args.extend(["--debuggable", "--runtime-option", "-Xopaque-jni-ids:true"]);
        }
        match m.jvmti {
            Jvmti::JvmtiStress => args.extend([
                "--jvmti-trace-stress",
                "--jvmti-redefine-stress",
                "--jvmti-field-stress",
            ]),
            Jvmti::FieldStress => args.push("--jvmti-field-stress"),
            Jvmti::TraceStress => args.push("--jvmti-trace-stress"),
            Jvmti::RedefineStress => args.push("--jvmti-redefine-stress"),
            Jvmti::StepStress => args.push("--jvmti-step-stress"),
            Jvmti::NoJvmti => {}
        }
        if m.address_size == AddressSize::Bits64 {
            args.push("--64");
        }

        args.into_iter().map(String::from).collect()
    }

    /// Row fields for the CSV result sink:
    /// `target, run, prebuild, compiler, relocate, trace, gc, jni, image,
    /// debuggable, jvmti, test, address_size`.
    pub fn csv_fields(&self) -> [&str; 13] {
        match self {
            Combination::Matrix(m) => [
                m.target.tag(),
                m.run.tag(),
                m.prebuild.tag(),
                m.compiler.tag(),
                m.relocate.tag(),
                m.trace.tag(),
                m.gc.tag(),
                m.jni.tag(),
                m.image.tag(),
                m.debuggable.tag(),
                m.jvmti.tag(),
                &m.test,
                m.address_size.tag(),
            ],
            Combination::Jvm(j) => {
                let mut fields = [""; 13];
                fields[0] = Target::Jvm.tag();
                fields[11] = &j.test;
                fields
            }
        }
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Parses canonical combination names back into [`Combination`]s.
///
/// The matcher is built once from the axis catalogue plus the discovered
/// test set, so parsing also validates that the embedded test exists.
pub struct CanonicalParser {
    matrix: Regex,
    jvm_prefix: String,
    tests: BTreeSet<String>,
}

impl CanonicalParser {
    pub fn new(tests: &BTreeSet<String>) -> Result<Self> {
        // Longest-first alternation so a test name that is a prefix of
        // another can never shadow it under leftmost-first matching.
        let mut by_length: Vec<&String> = tests.iter().collect();
        by_length.sort_by_key(|t| std::cmp::Reverse(t.len()));
        let test_alt = by_length
            .iter()
            .map(|t| regex::escape(t))
            .collect::<Vec<_>>()
            .join("|");

        let alt = |tags: &[&str]| tags.join("|");
        let pattern = format!(
            "^test-art-({target})-run-test-({run})-({prebuild})-({compiler})-({relocate})-\
             ({trace})-({gc})-({jni})-({image})-({debuggable})-({jvmti})-({test})({address})$",
            target = alt(&["target", "host"]),
            run = alt(Run::TAGS),
            prebuild = alt(Prebuild::TAGS),
            compiler = alt(Compiler::TAGS),
            relocate = alt(Relocate::TAGS),
            trace = alt(Trace::TAGS),
            gc = alt(Gc::TAGS),
            jni = alt(Jni::TAGS),
            image = alt(Image::TAGS),
            debuggable = alt(Debuggable::TAGS),
            jvmti = alt(Jvmti::TAGS),
            test = test_alt,
            address = alt(AddressSize::TAGS),
        );

        Ok(Self {
            matrix: Regex::new(&pattern).context("building the canonical-name matcher")?,
            jvm_prefix: Combination::Jvm(JvmCombination {
                test: String::new(),
            })
            .canonical(),
            tests: tests.clone(),
        })
    }

    pub fn parse(&self, name: &str) -> Result<Combination> {
        if let Some(test) = name.strip_prefix(&self.jvm_prefix) {
            if self.tests.contains(test) {
                return Ok(Combination::Jvm(JvmCombination {
                    test: test.to_string(),
                }));
            }
            bail!("{name} is not a valid test");
        }

        let caps = self
            .matrix
            .captures(name)
            .ok_or_else(|| anyhow!("{name} is not a valid test"))?;
        let group = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();
        let invalid = || anyhow!("{name} is not a valid test");

        Ok(Combination::Matrix(MatrixCombination {
            target: Target::from_tag(group(1)).ok_or_else(invalid)?,
            run: Run::from_tag(group(2)).ok_or_else(invalid)?,
            prebuild: Prebuild::from_tag(group(3)).ok_or_else(invalid)?,
            compiler: Compiler::from_tag(group(4)).ok_or_else(invalid)?,
            relocate: Relocate::from_tag(group(5)).ok_or_else(invalid)?,
            trace: Trace::from_tag(group(6)).ok_or_else(invalid)?,
            gc: Gc::from_tag(group(7)).ok_or_else(invalid)?,
            jni: Jni::from_tag(group(8)).ok_or_else(invalid)?,
            image: Image::from_tag(group(9)).ok_or_else(invalid)?,
            debuggable: Debuggable::from_tag(group(10)).ok_or_else(invalid)?,
            jvmti: Jvmti::from_tag(group(11)).ok_or_else(invalid)?,
            test: group(12).to_string(),
            address_size: AddressSize::from_tag(group(13)).ok_or_else(invalid)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MatrixCombination {
        MatrixCombination {
            test: "001-Hello".to_string(),
            target: Target::Host,
            run: Run::Debug,
            prebuild: Prebuild::Prebuild,
            compiler: Compiler::Optimizing,
            relocate: Relocate::NoRelocate,
            trace: Trace::Ntrace,
            gc: Gc::Cms,
            jni: Jni::Checkjni,
            image: Image::Picimage,
            debuggable: Debuggable::Ndebuggable,
            jvmti: Jvmti::NoJvmti,
            address_size: AddressSize::Bits64,
        }
    }

    fn test_set() -> BTreeSet<String> {
        ["001-Hello", "002-Goodbye", "052-verifier-fun"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn tags_are_globally_unique() {
        verify_catalogue().unwrap();
    }

    #[test]
    fn tag_resolution_round_trips() {
        for tag in Tag::all() {
            assert_eq!(Tag::resolve(tag.as_str()), Some(tag));
        }
        assert_eq!(Tag::resolve("no-such-variant"), None);
        assert_eq!(Tag::all().count(), 37);
    }

    #[test]
    fn canonical_name_layout() {
        let combination = Combination::Matrix(sample());
        assert_eq!(
            combination.canonical(),
            "test-art-host-run-test-debug-prebuild-optimizing-no-relocate-ntrace-cms-checkjni-\
             picimage-ndebuggable-no-jvmti-001-Hello64"
        );
    }

    #[test]
    fn jvm_canonical_name_has_empty_segments() {
        let combination = Combination::Jvm(JvmCombination {
            test: "001-Hello".to_string(),
        });
        assert_eq!(
            combination.canonical(),
            "test-art-jvm-run-test-----------001-Hello"
        );
    }

    #[test]
    fn canonical_round_trip() {
        let parser = CanonicalParser::new(&test_set()).unwrap();
        let combination = Combination::Matrix(sample());
        assert_eq!(parser.parse(&combination.canonical()).unwrap(), combination);
    }

    #[test]
    fn jvm_canonical_round_trip() {
        let parser = CanonicalParser::new(&test_set()).unwrap();
        let combination = Combination::Jvm(JvmCombination {
            test: "052-verifier-fun".to_string(),
        });
        assert_eq!(parser.parse(&combination.canonical()).unwrap(), combination);
    }

    #[test]
    fn parse_rejects_unknown_test() {
        let parser = CanonicalParser::new(&test_set()).unwrap();
        let err = parser
            .parse(
                "test-art-host-run-test-debug-prebuild-optimizing-no-relocate-ntrace-cms-\
                 checkjni-picimage-ndebuggable-no-jvmti-999-Missing64",
            )
            .unwrap_err();
        assert!(err.to_string().contains("not a valid test"));
    }

    #[test]
    fn parse_rejects_garbage() {
        let parser = CanonicalParser::new(&test_set()).unwrap();
        assert!(parser.parse("001-Hello").is_err());
        assert!(parser.parse("test-art-moon-run-test-001-Hello64").is_err());
    }

    #[test]
    fn child_flags_for_default_host_combination() {
        let combination = Combination::Matrix(sample());
        assert_eq!(
            combination.child_flags(),
            vec![
                "--host",
                "--prebuild",
                "--optimizing",
                "--no-relocate",
                "--runtime-option",
                "-Xcheck:jni",
                "--64",
            ]
        );
    }

    #[test]
    fn child_flags_for_stress_device_combination() {
        let combination = Combination::Matrix(MatrixCombination {
            target: Target::Device,
            run: Run::Ndebug,
            compiler: Compiler::JitOnFirstUse,
            trace: Trace::Stream,
            gc: Gc::Gcstress,
            jni: Jni::Forcecopy,
            image: Image::NoImage,
            debuggable: Debuggable::Debuggable,
            jvmti: Jvmti::JvmtiStress,
            address_size: AddressSize::Bits32,
            ..sample()
        });
        assert_eq!(
            combination.child_flags(),
            vec![
                "-O",
                "--prebuild",
                "--jit",
                "--runtime-option",
                "-Xjitthreshold:0",
                "--no-relocate",
                "--trace",
                "--stream",
                "--gcstress",
                "--runtime-option",
                "-Xjniopts:forcecopy",
                "--no-image",
                "--debuggable",
                "--runtime-option",
                "-Xopaque-jni-ids:true",
                "--jvmti-trace-stress",
                "--jvmti-redefine-stress",
                "--jvmti-field-stress",
            ]
        );
    }

    #[test]
    fn jvm_child_flags() {
        let combination = Combination::Jvm(JvmCombination {
            test: "001-Hello".to_string(),
        });
        assert_eq!(combination.child_flags(), vec!["--jvm"]);
    }

    #[test]
    fn csv_fields_for_jvm_are_mostly_empty() {
        let combination = Combination::Jvm(JvmCombination {
            test: "001-Hello".to_string(),
        });
        let fields = combination.csv_fields();
        assert_eq!(fields[0], "jvm");
        assert_eq!(fields[11], "001-Hello");
        assert!(fields[12].is_empty());
    }
}
