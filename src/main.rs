//! testrunner CLI - parallel matrix orchestrator for the ART run-test
//! suite.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use testrunner::cli::{self, Options};
use testrunner::config::Config;
use testrunner::executor::{self, Orchestrator, RunOptions};
use testrunner::expand::{Expansion, Selection, discover_tests};
use testrunner::knownfailures::{self, SkipContext, SkipOracle};
use testrunner::report::{self, CsvSink, Progress};
use testrunner::variant::{self, Target};

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();
    // Dry-run prints one line per planned combination, which is the
    // verbose renderer.
    let verbose = options.verbose || options.dry_run;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if verbose { Level::DEBUG } else { Level::WARN })
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    variant::verify_catalogue()?;
    let config = Config::probe().context("probing the build environment")?;
    let discovered = discover_tests(&config.test_dir())
        .with_context(|| format!("listing {}", config.test_dir().display()))?;

    let mut raw_selection = options.selection.clone();
    let tests = cli::resolve_tests(&options.tests, &discovered, &mut raw_selection)?;
    let selection = raw_selection.finalize(options.run_all, &config);

    let mut progress = Progress::auto(verbose, config.run_from_build);

    let device = if selection.wants_device() {
        Some(config.device_name().await)
    } else {
        None
    };
    let n_workers = executor::worker_count(
        &config,
        selection.wants_device(),
        options.n_workers,
        options.interactive_debug(),
    )
    .await?;
    progress.text(&format!(
        "Concurrency: {n_workers} ({})\n",
        device.as_deref().unwrap_or("host")
    ));

    let ctx = SkipContext {
        tests: &discovered,
        device,
        run_from_build: config.run_from_build,
        env: std::env::vars().collect(),
    };
    let skip_table = knownfailures::load_skip_table(&config.knownfailures_path(), &ctx)
        .context("loading the known-failures catalogue")?;
    let mut forced: BTreeSet<String> = config.extra_disabled_tests.clone();
    forced.extend(options.skips.iter().cloned());
    let oracle = SkipOracle::new(skip_table, forced, options.dry_run, options.no_skips);

    if options.build.unwrap_or(config.build_by_default) {
        build_dependencies(&config, &tests, &selection, options.dist, &progress)?;
    }

    let run_options = RunOptions {
        n_workers,
        timeout: Duration::from_secs(
            options
                .timeout_secs
                .unwrap_or_else(|| config.default_timeout_secs()),
        ),
        dry_run: options.dry_run,
        keep_going: config.keep_going,
        interactive_debug: options.interactive_debug(),
        global_args: options.global_child_args(&config)?,
    };

    let expansion = Expansion::new(&tests, selection);
    let mut csv = match &options.csv_results {
        Some(path) => {
            Some(CsvSink::create(path).with_context(|| format!("creating {}", path.display()))?)
        }
        None => None,
    };

    let orchestrator = Orchestrator::new(&config, &oracle, run_options);
    let summary = orchestrator
        .run(&expansion, &mut progress, csv.as_mut())
        .await;

    report::print_summary(&progress, &summary);
    if let Some(csv) = csv {
        csv.finish().context("closing the CSV results")?;
    }

    std::process::exit(summary.exit_code());
}

/// Builds the run-test dependencies for the selected tests.
///
/// Only the shards covering the selected tests are built (each test's
/// leading two digits name its data shard), unless so many shards are
/// touched that building the whole suite is cheaper.
fn build_dependencies(
    config: &Config,
    tests: &BTreeSet<String>,
    selection: &Selection,
    dist: bool,
    progress: &Progress,
) -> Result<()> {
    let shard_of = Regex::new(r"(\d\d)-").context("building the shard pattern")?;
    let mut shards: BTreeSet<String> = tests
        .iter()
        .filter_map(|t| shard_of.captures(t).map(|c| c[1].to_string()))
        .collect();
    if tests.iter().any(|t| t.contains("hiddenapi")) {
        shards.insert("HiddenApi".to_string());
    }

    let mut build_targets = Vec::new();
    for (mode, target) in [
        ("host", Target::Host),
        ("target", Target::Device),
        ("jvm", Target::Jvm),
    ] {
        if !selection.target.contains(&target) {
            continue;
        }
        build_targets.push(format!("test-art-{mode}-run-test-dependencies"));
        if shards.len() >= 100 {
            build_targets.push(format!("art-run-test-{mode}-data"));
        } else {
            build_targets.extend(
                shards
                    .iter()
                    .map(|shard| format!("art-run-test-{mode}-data-shard{shard}")),
            );
        }
    }

    let soong_ui = config.soong_ui_path();
    let mut command = std::process::Command::new(&soong_ui);
    command.arg("--make-mode").arg("D8=");
    if dist {
        command.arg("dist");
    }
    command.args(&build_targets);

    progress.text(&format!(
        "Build command: {} --make-mode D8={} {}\n",
        soong_ui.display(),
        if dist { " dist" } else { "" },
        build_targets.join(" ")
    ));
    let status = command
        .status()
        .with_context(|| format!("running {}", soong_ui.display()))?;
    if !status.success() {
        bail!("building the test dependencies failed ({status})");
    }
    Ok(())
}
