//! Test discovery and variant expansion.
//!
//! Discovery enumerates the test directory and keeps entries whose names
//! start with a digit. Expansion takes the user's per-axis selections and
//! produces the cartesian product of combinations for every discovered
//! test, with two wrinkles:
//!
//! - the `jvm` target is segregated: it combines with nothing and yields
//!   exactly one combination per test;
//! - the address-size set depends on the target (host and device
//!   architectures differ), so the product is per `(target, test)` pair.
//!
//! The expansion is lazy and its order is deterministic for identical
//! inputs: tests outermost, then targets, then the ordinary axes in
//! catalogue order, then address size innermost. [`Expansion::count`]
//! computes the exact number of combinations up front from the axis
//! cardinalities; it is the denominator of the progress display.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::config::Config;
use crate::variant::{
    AddressSize, Combination, Compiler, Debuggable, Gc, Image, Jni, JvmCombination, Jvmti,
    MatrixCombination, Prebuild, Relocate, Run, Target, Trace,
};

/// Enumerates the test directory: every entry starting with a digit is a
/// run-test.
pub fn discover_tests(dir: &Path) -> std::io::Result<BTreeSet<String>> {
    let mut tests = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str()
            && name.chars().next().is_some_and(|c| c.is_ascii_digit())
        {
            tests.insert(name.to_string());
        }
    }
    Ok(tests)
}

/// Raw per-axis tag selections accumulated from the command line.
///
/// Empty sets mean "no explicit choice"; [`VariantSelection::finalize`]
/// fills in the documented defaults.
#[derive(Debug, Clone, Default)]
pub struct VariantSelection {
    pub target: BTreeSet<Target>,
    pub run: BTreeSet<Run>,
    pub trace: BTreeSet<Trace>,
    pub image: BTreeSet<Image>,
    pub debuggable: BTreeSet<Debuggable>,
    pub gc: BTreeSet<Gc>,
    pub prebuild: BTreeSet<Prebuild>,
    pub relocate: BTreeSet<Relocate>,
    pub jni: BTreeSet<Jni>,
    pub jvmti: BTreeSet<Jvmti>,
    pub compiler: BTreeSet<Compiler>,
    pub address_sizes: BTreeSet<AddressSize>,
}

impl VariantSelection {
    /// Routes a tag string into the set of its axis.
    ///
    /// Returns false for unknown tags; the caller decides whether that is
    /// an error.
    pub fn insert_tag(&mut self, tag: &str) -> bool {
        if let Some(v) = Target::from_tag(tag) {
            self.target.insert(v);
        } else if let Some(v) = Run::from_tag(tag) {
            self.run.insert(v);
        } else if let Some(v) = Trace::from_tag(tag) {
            self.trace.insert(v);
        } else if let Some(v) = Image::from_tag(tag) {
            self.image.insert(v);
        } else if let Some(v) = Debuggable::from_tag(tag) {
            self.debuggable.insert(v);
        } else if let Some(v) = Gc::from_tag(tag) {
            self.gc.insert(v);
        } else if let Some(v) = Prebuild::from_tag(tag) {
            self.prebuild.insert(v);
        } else if let Some(v) = Relocate::from_tag(tag) {
            self.relocate.insert(v);
        } else if let Some(v) = Jni::from_tag(tag) {
            self.jni.insert(v);
        } else if let Some(v) = Jvmti::from_tag(tag) {
            self.jvmti.insert(v);
        } else if let Some(v) = Compiler::from_tag(tag) {
            self.compiler.insert(v);
        } else if let Some(v) = AddressSize::from_tag(tag) {
            self.address_sizes.insert(v);
        } else {
            return false;
        }
        true
    }

    /// Applies defaults and resolves the per-target address-size sets.
    ///
    /// An axis the user left empty gets its documented default, or the
    /// whole axis under `--all`. Address sizes never default to the whole
    /// axis: without an explicit `--64`/`--32` they follow the probed
    /// architecture suffixes of each target.
    pub fn finalize(self, run_all: bool, config: &Config) -> Selection {
        fn pick<T: Ord + Copy>(user: BTreeSet<T>, default: T, all: &[T], run_all: bool) -> BTreeSet<T> {
            if !user.is_empty() {
                user
            } else if run_all {
                all.iter().copied().collect()
            } else {
                BTreeSet::from([default])
            }
        }

        let mut address_sizes = BTreeMap::new();
        for target in [Target::Device, Target::Host] {
            let sizes = if !self.address_sizes.is_empty() {
                self.address_sizes.clone()
            } else {
                let (primary, second) = match target {
                    Target::Device => config.target_suffixes,
                    _ => config.host_suffixes,
                };
                let mut sizes = BTreeSet::new();
                sizes.extend(primary);
                if config.second_arch {
                    sizes.extend(second);
                }
                sizes
            };
            address_sizes.insert(target, sizes);
        }

        Selection {
            target: pick(self.target, Target::Host, Target::ALL, run_all),
            run: pick(self.run, Run::Debug, Run::ALL, run_all),
            trace: pick(self.trace, Trace::Ntrace, Trace::ALL, run_all),
            image: pick(self.image, Image::Picimage, Image::ALL, run_all),
            debuggable: pick(self.debuggable, Debuggable::Ndebuggable, Debuggable::ALL, run_all),
            gc: pick(self.gc, Gc::Cms, Gc::ALL, run_all),
            prebuild: pick(self.prebuild, Prebuild::Prebuild, Prebuild::ALL, run_all),
            relocate: pick(self.relocate, Relocate::NoRelocate, Relocate::ALL, run_all),
            jni: pick(self.jni, Jni::Checkjni, Jni::ALL, run_all),
            jvmti: pick(self.jvmti, Jvmti::NoJvmti, Jvmti::ALL, run_all),
            compiler: pick(self.compiler, Compiler::Optimizing, Compiler::ALL, run_all),
            address_sizes,
        }
    }
}

/// Final per-axis selections, defaults applied; frozen after setup.
#[derive(Debug, Clone)]
pub struct Selection {
    pub target: BTreeSet<Target>,
    pub run: BTreeSet<Run>,
    pub trace: BTreeSet<Trace>,
    pub image: BTreeSet<Image>,
    pub debuggable: BTreeSet<Debuggable>,
    pub gc: BTreeSet<Gc>,
    pub prebuild: BTreeSet<Prebuild>,
    pub relocate: BTreeSet<Relocate>,
    pub jni: BTreeSet<Jni>,
    pub jvmti: BTreeSet<Jvmti>,
    pub compiler: BTreeSet<Compiler>,
    /// Address sizes per combining target (host and device only).
    pub address_sizes: BTreeMap<Target, BTreeSet<AddressSize>>,
}

impl Selection {
    /// True when a device combination will be dispatched, which decides
    /// the worker-count policy and whether device probes run.
    pub fn wants_device(&self) -> bool {
        self.target.contains(&Target::Device)
    }

    fn address_sizes_for(&self, target: Target) -> &BTreeSet<AddressSize> {
        static EMPTY: BTreeSet<AddressSize> = BTreeSet::new();
        self.address_sizes.get(&target).unwrap_or(&EMPTY)
    }
}

/// One row of the ordinary-axis product (everything except test, target
/// and address size).
#[derive(Clone, Copy)]
struct Body {
    run: Run,
    trace: Trace,
    image: Image,
    debuggable: Debuggable,
    gc: Gc,
    prebuild: Prebuild,
    relocate: Relocate,
    jni: Jni,
    jvmti: Jvmti,
    compiler: Compiler,
}

/// The lazy cartesian expansion of a test set against a selection.
pub struct Expansion {
    tests: Vec<String>,
    selection: Selection,
    body: Vec<Body>,
}

impl Expansion {
    pub fn new(tests: &BTreeSet<String>, selection: Selection) -> Expansion {
        // The ordinary-axis product is shared by every (test, target)
        // pair; materializing it once keeps the full expansion lazy while
        // bounding the working set to one row per ordinary combination.
        let mut body = Vec::new();
        for &run in &selection.run {
            for &trace in &selection.trace {
                for &image in &selection.image {
                    for &debuggable in &selection.debuggable {
                        for &gc in &selection.gc {
                            for &prebuild in &selection.prebuild {
                                for &relocate in &selection.relocate {
                                    for &jni in &selection.jni {
                                        for &jvmti in &selection.jvmti {
                                            for &compiler in &selection.compiler {
                                                body.push(Body {
                                                    run,
                                                    trace,
                                                    image,
                                                    debuggable,
                                                    gc,
                                                    prebuild,
                                                    relocate,
                                                    jni,
                                                    jvmti,
                                                    compiler,
                                                });
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        Expansion {
            tests: tests.iter().cloned().collect(),
            selection,
            body,
        }
    }

    /// Exact number of combinations, computed from the axis
    /// cardinalities without expanding:
    /// `|tests| x ordinary-product x sum(address sizes per combining
    /// target) + [jvm selected] x |tests|`.
    pub fn count(&self) -> usize {
        let sel = &self.selection;
        let ordinary = sel.run.len()
            * sel.trace.len()
            * sel.image.len()
            * sel.debuggable.len()
            * sel.gc.len()
            * sel.prebuild.len()
            * sel.relocate.len()
            * sel.jni.len()
            * sel.jvmti.len()
            * sel.compiler.len();
        let addresses: usize = sel
            .target
            .iter()
            .filter(|&&t| t != Target::Jvm)
            .map(|&t| self.selection.address_sizes_for(t).len())
            .sum();
        let jvm = usize::from(sel.target.contains(&Target::Jvm));
        self.tests.len() * ordinary * addresses + jvm * self.tests.len()
    }

    /// Iterates the combinations in dispatch order.
    ///
    /// The iterator is `Send`: the worker pool pulls from it behind a
    /// mutex.
    pub fn iter<'s>(&'s self) -> impl Iterator<Item = Combination> + Send + 's {
        self.tests.iter().flat_map(move |test: &'s String| {
            self.selection.target.iter().flat_map(
                move |&target| -> Box<dyn Iterator<Item = Combination> + Send + 's> {
                    if target == Target::Jvm {
                        return Box::new(std::iter::once(Combination::Jvm(JvmCombination {
                            test: test.clone(),
                        })));
                    }
                    Box::new(self.body.iter().flat_map(move |&body| {
                        self.selection
                            .address_sizes_for(target)
                            .iter()
                            .map(move |&address_size| {
                                Combination::Matrix(MatrixCombination {
                                    test: test.clone(),
                                    target,
                                    run: body.run,
                                    prebuild: body.prebuild,
                                    compiler: body.compiler,
                                    relocate: body.relocate,
                                    trace: body.trace,
                                    gc: body.gc,
                                    jni: body.jni,
                                    image: body.image,
                                    debuggable: body.debuggable,
                                    jvmti: body.jvmti,
                                    address_size,
                                })
                            })
                    }))
                },
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            build_top: "/top".into(),
            run_from_build: false,
            on_vm: false,
            on_fvp: false,
            keep_going: true,
            always_clean: true,
            strace: false,
            build_by_default: false,
            second_arch: true,
            chroot: None,
            android_root: None,
            android_art_root: None,
            android_i18n_root: None,
            android_tzdata_root: None,
            extra_disabled_tests: BTreeSet::new(),
            ssh_cmd: vec![],
            target_suffixes: (Some(AddressSize::Bits64), Some(AddressSize::Bits32)),
            host_suffixes: (Some(AddressSize::Bits64), None),
        }
    }

    fn tests_named(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn discovery_keeps_digit_prefixed_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["001-Hello", "2000-virtual-list", "etc", "run-test", ".git"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        let tests = discover_tests(dir.path()).unwrap();
        assert_eq!(tests, tests_named(&["001-Hello", "2000-virtual-list"]));
    }

    #[test]
    fn defaults_are_single_element_subsets() {
        let selection = VariantSelection::default().finalize(false, &config());
        assert_eq!(selection.target, BTreeSet::from([Target::Host]));
        assert_eq!(selection.compiler, BTreeSet::from([Compiler::Optimizing]));
        assert_eq!(selection.gc, BTreeSet::from([Gc::Cms]));
        assert_eq!(selection.run, BTreeSet::from([Run::Debug]));
    }

    #[test]
    fn all_substitutes_the_full_axis_except_address_sizes() {
        let selection = VariantSelection::default().finalize(true, &config());
        assert_eq!(selection.compiler.len(), Compiler::ALL.len());
        assert_eq!(selection.jvmti.len(), Jvmti::ALL.len());
        // Address sizes still follow the probed suffixes.
        assert_eq!(
            selection.address_sizes[&Target::Host],
            BTreeSet::from([AddressSize::Bits64])
        );
        assert_eq!(
            selection.address_sizes[&Target::Device],
            BTreeSet::from([AddressSize::Bits32, AddressSize::Bits64])
        );
    }

    #[test]
    fn explicit_tags_override_the_defaults() {
        let mut raw = VariantSelection::default();
        assert!(raw.insert_tag("jit"));
        assert!(raw.insert_tag("interpreter"));
        assert!(raw.insert_tag("gcstress"));
        assert!(raw.insert_tag("64"));
        assert!(!raw.insert_tag("warp-drive"));
        let selection = raw.finalize(false, &config());
        assert_eq!(
            selection.compiler,
            BTreeSet::from([Compiler::Interpreter, Compiler::Jit])
        );
        assert_eq!(selection.gc, BTreeSet::from([Gc::Gcstress]));
        assert_eq!(
            selection.address_sizes[&Target::Device],
            BTreeSet::from([AddressSize::Bits64])
        );
    }

    #[test]
    fn expansion_cardinality_matches_the_pre_count() {
        let mut raw = VariantSelection::default();
        for tag in ["host", "target", "jit", "interpreter", "debug", "ndebug"] {
            raw.insert_tag(tag);
        }
        let selection = raw.finalize(false, &config());
        let expansion = Expansion::new(&tests_named(&["001-A", "002-B", "003-C"]), selection);
        // 3 tests x (2 run x 2 compiler) x (2 device sizes + 1 host size).
        assert_eq!(expansion.count(), 3 * 4 * 3);
        assert_eq!(expansion.iter().count(), expansion.count());
    }

    #[test]
    fn jvm_is_segregated_from_the_matrix() {
        let mut raw = VariantSelection::default();
        for tag in ["host", "jvm", "jit", "interpreter"] {
            raw.insert_tag(tag);
        }
        let selection = raw.finalize(false, &config());
        let expansion = Expansion::new(&tests_named(&["001-A", "002-B"]), selection);
        // 2 tests x 2 compilers x 1 host size + 2 jvm combinations.
        assert_eq!(expansion.count(), 2 * 2 + 2);
        assert_eq!(expansion.iter().count(), expansion.count());

        let jvm: Vec<Combination> = expansion
            .iter()
            .filter(|c| matches!(c, Combination::Jvm(_)))
            .collect();
        assert_eq!(jvm.len(), 2);
        assert!(jvm.iter().all(|c| c.child_flags() == vec!["--jvm"]));
    }

    #[test]
    fn dispatch_order_is_deterministic() {
        let mut raw = VariantSelection::default();
        for tag in ["host", "jvm", "jit", "optimizing"] {
            raw.insert_tag(tag);
        }
        let selection = raw.finalize(false, &config());
        let expansion = Expansion::new(&tests_named(&["001-A", "002-B"]), selection);
        let names: Vec<String> = expansion.iter().map(|c| c.canonical()).collect();
        // Tests outermost, targets in axis order (jvm last), compiler in
        // catalogue order (jit before optimizing), address innermost.
        assert_eq!(
            names,
            vec![
                "test-art-host-run-test-debug-prebuild-jit-no-relocate-ntrace-cms-checkjni-\
                 picimage-ndebuggable-no-jvmti-001-A64",
                "test-art-host-run-test-debug-prebuild-optimizing-no-relocate-ntrace-cms-\
                 checkjni-picimage-ndebuggable-no-jvmti-001-A64",
                "test-art-jvm-run-test-----------001-A",
                "test-art-host-run-test-debug-prebuild-jit-no-relocate-ntrace-cms-checkjni-\
                 picimage-ndebuggable-no-jvmti-002-B64",
                "test-art-host-run-test-debug-prebuild-optimizing-no-relocate-ntrace-cms-\
                 checkjni-picimage-ndebuggable-no-jvmti-002-B64",
                "test-art-jvm-run-test-----------002-B",
            ]
        );
        // Determinism: a second pass yields the same sequence.
        let again: Vec<String> = expansion.iter().map(|c| c.canonical()).collect();
        assert_eq!(names, again);
    }

    #[test]
    fn address_sizes_expand_innermost_per_target() {
        let mut raw = VariantSelection::default();
        raw.insert_tag("target");
        let selection = raw.finalize(false, &config());
        let expansion = Expansion::new(&tests_named(&["001-A"]), selection);
        let names: Vec<String> = expansion.iter().map(|c| c.canonical()).collect();
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with("001-A64"));
        assert!(names[1].ends_with("001-A32"));
    }
}
