//! Command-line surface.
//!
//! The global options are declared by hand; the per-variant flags are
//! generated from the axis catalogue, one `--<tag>` switch per tag plus
//! one `--all-<axis>` switch per axis, so the surface always matches the
//! catalogue.
//!
//! Positional arguments take two forms:
//!
//! - a plain name like `001-Hello` (or any prefix of one), selecting the
//!   discovered tests it prefixes;
//! - a fully-decorated canonical combination name, which selects the
//!   embedded test *and* narrows every axis to the embedded tags.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};

use crate::config::Config;
use crate::expand::VariantSelection;
use crate::variant::{AXES, CanonicalParser};

/// Parsed command-line options.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Raw positional test names, resolved later against discovery.
    pub tests: Vec<String>,
    pub n_workers: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub verbose: bool,
    pub dry_run: bool,
    pub skips: Vec<String>,
    pub no_skips: bool,
    /// Tri-state: `-b` forces on, `--no-build-dependencies` forces off,
    /// unset falls back to the environment default.
    pub build: Option<bool>,
    pub dist: bool,
    pub gdb: bool,
    pub gdb_arg: Option<String>,
    pub dump_cfg: Option<String>,
    pub gdb_dex2oat: bool,
    pub gdb_dex2oat_args: Option<String>,
    pub run_test_options: Vec<String>,
    pub runtime_options: Vec<String>,
    pub with_agents: Vec<String>,
    pub dex2oat_jobs: Option<u32>,
    pub run_all: bool,
    pub csv_results: Option<PathBuf>,
    /// Tag selections from the per-variant flags (and later narrowed by
    /// canonical positionals).
    pub selection: VariantSelection,
}

impl Options {
    /// Parses the process arguments, exiting on `--help` or a usage
    /// error.
    pub fn parse() -> Options {
        Options::from_matches(command().get_matches())
    }

    /// Fallible parse for tests.
    pub fn try_parse_from<I, T>(args: I) -> Result<Options, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Options::from_matches(command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: ArgMatches) -> Options {
        let mut selection = VariantSelection::default();
        for axis in AXES {
            if matches.get_flag(&format!("all-{}", axis.name)) {
                for tag in axis.tags {
                    selection.insert_tag(tag);
                }
            }
            for tag in axis.tags {
                if matches.get_flag(tag) {
                    selection.insert_tag(tag);
                }
            }
        }

        let strings = |id: &str| -> Vec<String> {
            matches
                .get_many::<String>(id)
                .map(|v| v.cloned().collect())
                .unwrap_or_default()
        };

        let mut tests = strings("tests");
        tests.extend(strings("test"));

        let build = if matches.get_flag("no-build-dependencies") {
            Some(false)
        } else if matches.get_flag("build-dependencies") {
            Some(true)
        } else {
            None
        };

        Options {
            tests,
            n_workers: matches.get_one::<usize>("jobs").copied(),
            timeout_secs: matches.get_one::<u64>("timeout").copied(),
            verbose: matches.get_flag("verbose"),
            dry_run: matches.get_flag("dry-run"),
            skips: strings("skip"),
            no_skips: matches.get_flag("no-skips"),
            build,
            dist: matches.get_flag("dist"),
            gdb: matches.get_flag("gdb"),
            gdb_arg: matches.get_one::<String>("gdb-arg").cloned(),
            dump_cfg: matches.get_one::<String>("dump-cfg").cloned(),
            gdb_dex2oat: matches.get_flag("gdb-dex2oat"),
            gdb_dex2oat_args: matches.get_one::<String>("gdb-dex2oat-args").cloned(),
            run_test_options: strings("run-test-option"),
            runtime_options: strings("runtime-option"),
            with_agents: strings("with-agent"),
            dex2oat_jobs: matches.get_one::<u32>("dex2oat-jobs").copied(),
            run_all: matches.get_flag("all"),
            csv_results: matches.get_one::<PathBuf>("csv-results").cloned(),
            selection,
        }
    }

    /// True when a child should share the orchestrator's terminal.
    pub fn interactive_debug(&self) -> bool {
        self.gdb || self.gdb_dex2oat
    }

    /// The options passed to every run-test child, ahead of the
    /// per-variant flags.
    pub fn global_child_args(&self, config: &Config) -> Result<Vec<String>> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |s: &str| args.push(s.to_string());

        if config.strace {
            push("--strace");
        }
        if config.always_clean {
            push("--always-clean");
        }
        if self.gdb {
            push("--gdb");
            if let Some(arg) = &self.gdb_arg {
                push("--gdb-arg");
                push(arg);
            }
        }
        if let Some(path) = &self.dump_cfg {
            push("--dump-cfg");
            push(path);
        }
        if self.gdb_dex2oat {
            push("--gdb-dex2oat");
            if let Some(arg) = &self.gdb_dex2oat_args {
                push("--gdb-dex2oat-args");
                push(arg);
            }
        }
        drop(push);

        for option in &self.run_test_options {
            let split = shell_words::split(option)
                .with_context(|| format!("cannot split --run-test-option {option:?}"))?;
            args.extend(split);
        }
        for option in &self.runtime_options {
            args.push("--runtime-option".to_string());
            args.push(option.clone());
        }
        for agent in &self.with_agents {
            args.push("--with-agent".to_string());
            args.push(agent.clone());
        }
        if let Some(jobs) = self.dex2oat_jobs {
            args.push("--dex2oat-jobs".to_string());
            args.push(jobs.to_string());
        }
        Ok(args)
    }
}

/// Builds the clap command, global options plus the generated variant
/// flags.
pub fn command() -> Command {
    let mut cmd = Command::new("testrunner")
        .about("Runs all or a subset of the ART run-test suite")
        .arg(
            Arg::new("tests")
                .value_name("TEST")
                .num_args(0..)
                .help("Name(s) of the test(s): plain prefixes or canonical combination names"),
        )
        .arg(
            Arg::new("test")
                .short('t')
                .long("test")
                .action(ArgAction::Append)
                .value_name("TEST")
                .help("Name of a test (deprecated: use positional arguments instead)"),
        )
        .arg(
            Arg::new("jobs")
                .short('j')
                .value_name("N")
                .value_parser(value_parser!(usize))
                .help("Number of workers; defaults to the host CPU count, or 3/4 of the device CPUs"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECONDS")
                .value_parser(value_parser!(u64))
                .help("Per-test wall-clock timeout"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Print the planned combinations without launching anything"),
        )
        .arg(
            Arg::new("skip")
                .long("skip")
                .action(ArgAction::Append)
                .value_name("TEST")
                .help("Skip the given test in all circumstances"),
        )
        .arg(
            Arg::new("no-skips")
                .long("no-skips")
                .action(ArgAction::SetTrue)
                .help("Don't skip any run-test configuration listed in knownfailures.json"),
        )
        .arg(
            Arg::new("build-dependencies")
                .short('b')
                .long("build-dependencies")
                .visible_alias("build")
                .action(ArgAction::SetTrue)
                .help("Build test dependencies before running"),
        )
        .arg(
            Arg::new("no-build-dependencies")
                .long("no-build-dependencies")
                .action(ArgAction::SetTrue)
                .help("Don't build test dependencies under any circumstances"),
        )
        .arg(
            Arg::new("dist")
                .long("dist")
                .action(ArgAction::SetTrue)
                .help("Pass dist to the build command when building dependencies"),
        )
        .arg(Arg::new("gdb").long("gdb").action(ArgAction::SetTrue))
        .arg(Arg::new("gdb-arg").long("gdb-arg").value_name("ARG"))
        .arg(
            Arg::new("dump-cfg")
                .long("dump-cfg")
                .value_name("PATH")
                .help("Dump the CFG to the specified host path"),
        )
        .arg(
            Arg::new("gdb-dex2oat")
                .long("gdb-dex2oat")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("gdb-dex2oat-args")
                .long("gdb-dex2oat-args")
                .value_name("ARGS"),
        )
        .arg(
            Arg::new("run-test-option")
                .long("run-test-option")
                .action(ArgAction::Append)
                .value_name("OPTION")
                .help("Pass an option, unaltered, to the run-test script (quoted; split on spaces)"),
        )
        .arg(
            Arg::new("with-agent")
                .long("with-agent")
                .action(ArgAction::Append)
                .value_name("AGENT")
                .help("Pass an agent to be attached to the runtime"),
        )
        .arg(
            Arg::new("runtime-option")
                .long("runtime-option")
                .action(ArgAction::Append)
                .value_name("OPTION")
                .allow_hyphen_values(true)
                .help("Pass an option to the runtime"),
        )
        .arg(
            Arg::new("dex2oat-jobs")
                .long("dex2oat-jobs")
                .value_name("N")
                .value_parser(value_parser!(u32))
                .help("Number of dex2oat jobs"),
        )
        .arg(
            Arg::new("all")
                .short('a')
                .long("all")
                .action(ArgAction::SetTrue)
                .help("Run all the possible configurations for the input test set"),
        )
        .arg(
            Arg::new("csv-results")
                .long("csv-results")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Store a CSV record of all results"),
        );

    for axis in AXES {
        cmd = cmd.arg(
            Arg::new(format!("all-{}", axis.name))
                .long(format!("all-{}", axis.name))
                .action(ArgAction::SetTrue)
                .help(format!("Enable all variants of {}", axis.name)),
        );
        for tag in axis.tags {
            cmd = cmd.arg(Arg::new(*tag).long(*tag).action(ArgAction::SetTrue));
        }
    }

    cmd
}

/// Resolves the positional test arguments against the discovered set.
///
/// Plain names select every discovered test they prefix; canonical
/// combination names additionally narrow `selection` to the embedded
/// tags. With no positionals, every discovered test runs.
pub fn resolve_tests(
    positionals: &[String],
    discovered: &BTreeSet<String>,
    selection: &mut VariantSelection,
) -> Result<BTreeSet<String>> {
    if positionals.is_empty() {
        return Ok(discovered.clone());
    }

    let parser = CanonicalParser::new(discovered)?;
    let mut tests = BTreeSet::new();
    for name in positionals {
        let prefixed: Vec<&String> = discovered.iter().filter(|t| t.starts_with(name)).collect();
        if !prefixed.is_empty() {
            tests.extend(prefixed.into_iter().cloned());
            continue;
        }

        let combination = parser.parse(name)?;
        for tag in combination.tags() {
            selection.insert_tag(tag.as_str());
        }
        tests.insert(combination.test().to_string());
    }
    Ok(tests)
}
