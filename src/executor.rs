//! The bounded-parallel execution engine.
//!
//! # Architecture
//!
//! ```text
//!   Expansion ──► shared queue ──► worker 1..n ──► run-test child
//!                                      │               (own process group,
//!                                      │                tracked for group-kill)
//!                                      ▼
//!                              completion channel
//!                                      │
//!                                      ▼
//!                              completion loop ──► Progress + CsvSink
//!                                      │
//!                         first failure / SIGINT:
//!                         cancel token + tracker.kill_all()
//! ```
//!
//! Workers pull combinations from a mutex-guarded iterator, so dispatch
//! order equals expansion order and a single-worker run executes in
//! exactly that order. Completions flow over an unbounded channel into
//! one loop that owns the renderer, the CSV sink, and the failed/skipped
//! accumulators; nothing else touches them.
//!
//! Cancellation is cooperative. Both triggers (SIGINT, and the first
//! failure when keep-going is off) cancel the token so no worker pulls
//! new work, and seal the [`ChildTracker`] so every running subtree is
//! group-killed, including a child whose registration races with the
//! cancellation. The pool then drains.

pub mod runner;
pub mod tracker;

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{Config, ProbeError};
use crate::expand::Expansion;
use crate::knownfailures::SkipOracle;
use crate::report::{CsvSink, Progress};
use crate::variant::Combination;

pub use tracker::ChildTracker;

/// Outcome of one combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
    Timeout,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Pass => "PASS",
            TestStatus::Fail => "FAIL",
            TestStatus::Skip => "SKIP",
            TestStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, TestStatus::Fail | TestStatus::Timeout)
    }
}

/// One completion, as surfaced to the progress renderer and the sink.
#[derive(Debug)]
pub struct TestEvent {
    pub combination: Combination,
    pub status: TestStatus,
    /// Failure detail: the command line plus the captured transcript.
    pub detail: Option<String>,
    pub elapsed: Duration,
}

/// Knobs of one run, frozen before the pool starts.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub n_workers: usize,
    pub timeout: Duration,
    pub dry_run: bool,
    pub keep_going: bool,
    /// `--gdb`/`--gdb-dex2oat`: children inherit stdio and run one at a
    /// time.
    pub interactive_debug: bool,
    /// Options passed to every run-test child ahead of the per-variant
    /// flags.
    pub global_args: Vec<String>,
}

/// Aggregated results of an entire run.
#[derive(Debug)]
pub struct RunSummary {
    /// The progress denominator: every planned combination.
    pub total: usize,
    /// Combinations that produced a result (skips included).
    pub completed: usize,
    /// Canonical name plus failure detail, in completion order.
    pub failed: Vec<(String, String)>,
    /// Canonical names of skipped combinations.
    pub skipped: Vec<String>,
    /// An external interrupt ended the run early.
    pub interrupted: bool,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && !self.interrupted
    }

    /// 0 iff no failure, else 1.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Picks the worker-pool size.
///
/// Explicit `-j` wins (floored at 1); interactive debugging forces a
/// single worker. Otherwise host-only runs use every host CPU, and
/// device runs use three quarters of the device CPUs (all of them on a
/// VM target), since fully loading real hardware tends to end in
/// timeouts.
pub async fn worker_count(
    config: &Config,
    wants_device: bool,
    requested: Option<usize>,
    interactive_debug: bool,
) -> Result<usize, ProbeError> {
    if interactive_debug {
        return Ok(1);
    }
    if let Some(n) = requested {
        return Ok(n.max(1));
    }
    if wants_device {
        let count = config.target_cpu_count().await?;
        let fraction = if config.on_vm { 1.0 } else { 0.75 };
        Ok(((count as f64 * fraction) as usize).max(1))
    } else {
        Ok(config.host_cpu_count().max(1))
    }
}

/// Drives one run: expansion in, summary out.
pub struct Orchestrator<'a> {
    config: &'a Config,
    oracle: &'a SkipOracle,
    opts: RunOptions,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a Config, oracle: &'a SkipOracle, opts: RunOptions) -> Orchestrator<'a> {
        Orchestrator {
            config,
            oracle,
            opts,
        }
    }

    /// Runs every combination of the expansion through the worker pool.
    pub async fn run(
        &self,
        expansion: &Expansion,
        progress: &mut Progress,
        mut csv: Option<&mut CsvSink>,
    ) -> RunSummary {
        let total = expansion.count();
        let tracker = ChildTracker::new();
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<TestEvent>();
        let queue = Mutex::new(expansion.iter());
        let result: Mutex<Option<RunSummary>> = Mutex::new(None);

        tokio_scoped::scope(|scope| {
            for _ in 0..self.opts.n_workers.max(1) {
                let tx = tx.clone();
                let token = token.clone();
                let queue = &queue;
                let tracker = &tracker;
                scope.spawn(async move {
                    loop {
                        if token.is_cancelled() {
                            break;
                        }
                        let next = queue.lock().unwrap_or_else(|e| e.into_inner()).next();
                        let Some(combination) = next else { break };
                        let event = runner::run_combination(
                            self.config,
                            &self.opts,
                            self.oracle,
                            tracker,
                            combination,
                        )
                        .await;
                        if let Some(event) = event
                            && tx.send(event).is_err()
                        {
                            break;
                        }
                    }
                });
            }
            // Workers hold the only remaining senders; the completion
            // loop ends when the last of them exits.
            drop(tx);

            let token = token.clone();
            let tracker = &tracker;
            let result = &result;
            let progress = &mut *progress;
            let csv = &mut csv;
            scope.spawn(async move {
                let mut completed = 0usize;
                let mut failed: Vec<(String, String)> = Vec::new();
                let mut skipped: Vec<String> = Vec::new();
                let mut interrupted = false;

                loop {
                    tokio::select! {
                        event = rx.recv() => {
                            let Some(event) = event else { break };
                            completed += 1;
                            let name = event.combination.canonical();
                            progress.test_done(
                                completed,
                                total,
                                &name,
                                event.status,
                                event.detail.as_deref(),
                                event.elapsed,
                            );
                            if let Some(csv) = csv.as_mut()
                                && let Err(e) = csv.row(&event.combination, event.status.as_str())
                            {
                                warn!("cannot append to the CSV results: {e}");
                            }
                            match event.status {
                                TestStatus::Pass => {}
                                TestStatus::Skip => {
                                    // Dry-run prints every plan as SKIP but
                                    // keeps the summary list for real skips.
                                    if !self.opts.dry_run {
                                        skipped.push(name);
                                    }
                                }
                                TestStatus::Fail | TestStatus::Timeout => {
                                    failed.push((name, event.detail.unwrap_or_default()));
                                    if !self.opts.keep_going {
                                        token.cancel();
                                        tracker.kill_all();
                                    }
                                }
                            }
                        }
                        _ = tokio::signal::ctrl_c() => {
                            interrupted = true;
                            token.cancel();
                            tracker.kill_all();
                            // Keep draining: workers surface the deaths of
                            // their killed children and then exit.
                        }
                    }
                }

                let summary = RunSummary {
                    total,
                    completed,
                    failed,
                    skipped,
                    interrupted,
                };
                *result.lock().unwrap_or_else(|e| e.into_inner()) = Some(summary);
            });
        });

        result
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or(RunSummary {
                total,
                completed: 0,
                failed: Vec::new(),
                skipped: Vec::new(),
                interrupted: true,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::os::unix::fs::PermissionsExt;

    use crate::expand::{Expansion, VariantSelection, discover_tests};
    use crate::knownfailures::{SkipOracle, SkipTable};
    use crate::variant::AddressSize;

    /// A throwaway source tree with a scripted run-test child.
    fn fake_tree(script: &str, tests: &[&str]) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let test_dir = dir.path().join("art/test");
        std::fs::create_dir_all(&test_dir).unwrap();
        std::fs::create_dir_all(dir.path().join("build")).unwrap();
        std::fs::write(dir.path().join("build/envsetup.sh"), "").unwrap();
        for test in tests {
            std::fs::create_dir(test_dir.join(test)).unwrap();
        }
        let run_test = test_dir.join("run-test");
        std::fs::write(&run_test, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&run_test, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = Config {
            build_top: dir.path().to_path_buf(),
            run_from_build: false,
            on_vm: false,
            on_fvp: false,
            keep_going: true,
            always_clean: true,
            strace: false,
            build_by_default: false,
            second_arch: false,
            chroot: None,
            android_root: None,
            android_art_root: None,
            android_i18n_root: None,
            android_tzdata_root: None,
            extra_disabled_tests: BTreeSet::new(),
            ssh_cmd: vec![],
            target_suffixes: (Some(AddressSize::Bits64), None),
            host_suffixes: (Some(AddressSize::Bits64), None),
        };
        (dir, config)
    }

    fn host_expansion(config: &Config, test_dir: &std::path::Path) -> Expansion {
        let tests = discover_tests(test_dir).unwrap();
        let mut raw = VariantSelection::default();
        raw.insert_tag("host");
        Expansion::new(&tests, raw.finalize(false, config))
    }

    fn options(timeout_secs: u64, keep_going: bool, dry_run: bool) -> RunOptions {
        RunOptions {
            n_workers: 1,
            timeout: Duration::from_secs(timeout_secs),
            dry_run,
            keep_going,
            interactive_debug: false,
            global_args: Vec::new(),
        }
    }

    fn quiet_progress() -> Progress {
        Progress::with_width(false, true, false, Box::new(|| 100))
    }

    fn oracle(dry_run: bool) -> SkipOracle {
        SkipOracle::new(SkipTable::default(), BTreeSet::new(), dry_run, false)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn passing_children_yield_a_clean_summary() {
        let (dir, config) = fake_tree("exit 0", &["001-A", "002-B"]);
        let expansion = host_expansion(&config, &dir.path().join("art/test"));
        let oracle = oracle(false);
        let orchestrator = Orchestrator::new(&config, &oracle, options(30, true, false));

        let summary = orchestrator
            .run(&expansion, &mut quiet_progress(), None)
            .await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 2);
        assert!(summary.success());
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failure_detail_carries_the_command_and_transcript() {
        let (dir, config) = fake_tree("echo boom; exit 3", &["001-A"]);
        let expansion = host_expansion(&config, &dir.path().join("art/test"));
        let oracle = oracle(false);
        let orchestrator = Orchestrator::new(&config, &oracle, options(30, true, false));

        let summary = orchestrator
            .run(&expansion, &mut quiet_progress(), None)
            .await;
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.failed.len(), 1);
        let (name, detail) = &summary.failed[0];
        assert!(name.starts_with("test-art-host-run-test-"));
        assert!(detail.contains("run-test"));
        assert!(detail.contains("--host"));
        assert!(detail.contains("boom"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_failure_cancels_the_rest_when_not_keep_going() {
        // The sleep keeps a child in flight while the completion loop
        // reacts to the first failure, so cancellation has something to
        // cancel; a child already running when the run is cancelled may
        // still surface its (killed) result.
        let (dir, config) = fake_tree("sleep 0.2; exit 1", &["001-A", "002-B", "003-C"]);
        let expansion = host_expansion(&config, &dir.path().join("art/test"));
        let oracle = oracle(false);
        let orchestrator = Orchestrator::new(&config, &oracle, options(30, false, false));

        let summary = orchestrator
            .run(&expansion, &mut quiet_progress(), None)
            .await;
        assert!(!summary.failed.is_empty());
        assert!(summary.completed < summary.total);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_going_runs_everything() {
        let (dir, config) = fake_tree("exit 1", &["001-A", "002-B", "003-C"]);
        let expansion = host_expansion(&config, &dir.path().join("art/test"));
        let oracle = oracle(false);
        let orchestrator = Orchestrator::new(&config, &oracle, options(30, true, false));

        let summary = orchestrator
            .run(&expansion, &mut quiet_progress(), None)
            .await;
        assert_eq!(summary.completed, 3);
        assert_eq!(summary.failed.len(), 3);
    }

    /// Replaces the scripted run-test body, e.g. to embed absolute paths.
    fn rewrite_script(dir: &tempfile::TempDir, script: &str) {
        let run_test = dir.path().join("art/test/run-test");
        std::fs::write(&run_test, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&run_test, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dry_run_launches_nothing_and_succeeds() {
        let (dir, config) = fake_tree("exit 0", &["001-A", "002-B"]);
        let marker = dir.path().join("launched");
        rewrite_script(&dir, &format!("touch {}; exit 0", marker.display()));
        let expansion = host_expansion(&config, &dir.path().join("art/test"));
        let oracle = oracle(true);
        let orchestrator = Orchestrator::new(&config, &oracle, options(30, true, true));

        let summary = orchestrator
            .run(&expansion, &mut quiet_progress(), None)
            .await;
        assert_eq!(summary.completed, 2);
        assert!(summary.success());
        assert!(summary.skipped.is_empty());
        assert!(!marker.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeouts_are_failures_with_the_documented_detail() {
        let (dir, config) = fake_tree("sleep 30", &["001-A"]);
        let expansion = host_expansion(&config, &dir.path().join("art/test"));
        let oracle = oracle(false);
        let orchestrator = Orchestrator::new(&config, &oracle, options(1, true, false));

        let summary = orchestrator
            .run(&expansion, &mut quiet_progress(), None)
            .await;
        assert_eq!(summary.failed.len(), 1);
        assert!(summary.failed[0].1.starts_with("Timed out in 1 seconds"));
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn forced_skips_are_recorded() {
        let (dir, config) = fake_tree("exit 0", &["001-A", "002-B"]);
        let expansion = host_expansion(&config, &dir.path().join("art/test"));
        let oracle = SkipOracle::new(
            SkipTable::default(),
            BTreeSet::from(["001-A".to_string()]),
            false,
            false,
        );
        let orchestrator = Orchestrator::new(&config, &oracle, options(30, true, false));

        let summary = orchestrator
            .run(&expansion, &mut quiet_progress(), None)
            .await;
        assert!(summary.success());
        assert_eq!(summary.skipped.len(), 1);
        assert!(summary.skipped[0].contains("001-A"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_worker_dispatch_follows_expansion_order() {
        let (dir, config) = fake_tree("exit 0", &["001-A", "002-B"]);
        let log = dir.path().join("order.log");
        rewrite_script(
            &dir,
            &format!("echo \"$FULL_TEST_NAME\" >> {}; exit 0", log.display()),
        );
        let expansion = host_expansion(&config, &dir.path().join("art/test"));
        let oracle = oracle(false);
        let orchestrator = Orchestrator::new(&config, &oracle, options(30, true, false));

        orchestrator
            .run(&expansion, &mut quiet_progress(), None)
            .await;
        let expected: Vec<String> = expansion.iter().map(|c| c.canonical()).collect();
        let log = std::fs::read_to_string(log).unwrap();
        let seen: Vec<&str> = log.lines().collect();
        assert_eq!(
            seen,
            expected.iter().map(String::as_str).collect::<Vec<_>>()
        );
    }
}
