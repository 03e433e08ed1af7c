//! Launches one combination as a run-test child and classifies the result.
//!
//! The child contract:
//!
//! - it starts in a new process group so its whole subtree can be killed,
//! - stderr is folded into the captured stdout transcript,
//! - `FULL_TEST_NAME` carries the canonical combination name,
//! - a wall-clock deadline bounds the run; exceeding it is a `TIMEOUT`
//!   failure, not a skip.
//!
//! Under `--gdb`/`--gdb-dex2oat` the child inherits the orchestrator's
//! stdio so a human can drive the debugger; nothing is captured.

use std::process::Stdio;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{self, Config};
use crate::executor::tracker::{self, ChildTracker};
use crate::executor::{RunOptions, TestEvent, TestStatus};
use crate::knownfailures::SkipOracle;
use crate::variant::{Combination, Target};

/// Runs one combination to completion.
///
/// Returns `None` when the run was cancelled between dispatch and launch
/// (the tracker was sealed); such a child is killed, not reported.
pub async fn run_combination(
    config: &Config,
    opts: &RunOptions,
    oracle: &SkipOracle,
    tracker: &ChildTracker,
    combination: Combination,
) -> Option<TestEvent> {
    let name = combination.canonical();

    if oracle.is_disabled(combination.test(), &combination.tags()) {
        return Some(TestEvent {
            combination,
            status: TestStatus::Skip,
            detail: None,
            elapsed: Duration::ZERO,
        });
    }

    let program = config.run_test_path();
    let args = compose_args(config, opts, &combination);
    let command_line = std::iter::once(program.display().to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");

    debug!("starting {name}");
    let start = Instant::now();
    let deadline = start + opts.timeout;

    let mut command = tokio::process::Command::new(&program);
    command
        .args(&args)
        .env("FULL_TEST_NAME", &name)
        .process_group(0);
    if opts.interactive_debug {
        command.stdin(Stdio::inherit());
        command.stdout(Stdio::inherit());
        command.stderr(Stdio::inherit());
    } else {
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return Some(TestEvent {
                combination,
                status: TestStatus::Fail,
                detail: Some(format!("{command_line}\n{e}")),
                elapsed: start.elapsed(),
            });
        }
    };

    // With process_group(0) the child's pid is its process-group id.
    let Some(pgid) = child.id() else {
        let _ = child.wait().await;
        return Some(TestEvent {
            combination,
            status: TestStatus::Fail,
            detail: Some(format!("{command_line}\nchild exited before tracking")),
            elapsed: start.elapsed(),
        });
    };

    if !tracker.register(pgid) {
        // Cancellation won the race; the group is already signalled.
        let _ = child.wait().await;
        return None;
    }

    let mut output = String::new();
    let mut transcript = if opts.interactive_debug {
        None
    } else {
        transcript_stream(&mut child)
    };
    let timed_out = match transcript.as_mut() {
        Some(lines) => collect_transcript(lines, deadline, &mut output).await,
        None => wait_interactive(&mut child, deadline).await,
    };
    let elapsed = start.elapsed();

    if timed_out {
        debug!("timeout of {name}");
        diagnose_timeout(config, &combination).await;
        tracker::kill_group(pgid);
        // Collect whatever the group managed to write before the kill;
        // the pipes close once every group member is gone.
        if let Some(lines) = transcript.as_mut() {
            while let Some(line) = lines.next().await {
                output.push_str(&line);
                output.push('\n');
            }
        }
        let _ = child.wait().await;
        tracker.deregister(pgid);
        return Some(TestEvent {
            combination,
            status: TestStatus::Timeout,
            detail: Some(format!(
                "Timed out in {} seconds\n{command_line}",
                opts.timeout.as_secs()
            )),
            elapsed,
        });
    }

    let status = child.wait().await;
    tracker.deregister(pgid);

    match status {
        Ok(status) if status.success() => Some(TestEvent {
            combination,
            status: TestStatus::Pass,
            detail: None,
            elapsed,
        }),
        Ok(_) => Some(TestEvent {
            combination,
            status: TestStatus::Fail,
            detail: Some(format!("{command_line}\n{output}")),
            elapsed,
        }),
        Err(e) => Some(TestEvent {
            combination,
            status: TestStatus::Fail,
            detail: Some(format!("{command_line}\n{e}")),
            elapsed,
        }),
    }
}

/// The full run-test argument vector for one combination.
fn compose_args(config: &Config, opts: &RunOptions, combination: &Combination) -> Vec<String> {
    let mut args = opts.global_args.clone();

    // Chroot and root overrides apply to device runs only.
    if combination.target() == Target::Device {
        for (flag, value) in [
            ("--chroot", &config.chroot),
            ("--android-root", &config.android_root),
            ("--android-i18n-root", &config.android_i18n_root),
            ("--android-art-root", &config.android_art_root),
            ("--android-tzdata-root", &config.android_tzdata_root),
        ] {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value.clone());
            }
        }
    }

    args.extend(combination.child_flags());
    args.push(combination.test().to_string());
    args
}

/// Merges the child's stdout and stderr into one line stream, the
/// captured-transcript equivalent of `stderr=STDOUT`.
fn transcript_stream(
    child: &mut tokio::process::Child,
) -> Option<futures::stream::BoxStream<'static, String>> {
    let stdout = child.stdout.take()?;
    let stderr = child.stderr.take()?;
    let stdout_lines = tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
        .map(|line| line.unwrap_or_default());
    let stderr_lines = tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
        .map(|line| line.unwrap_or_default());
    Some(stream::select(stdout_lines, stderr_lines).boxed())
}

/// Appends transcript lines to `output` until EOF or the deadline.
/// Returns true on timeout.
async fn collect_transcript(
    lines: &mut futures::stream::BoxStream<'static, String>,
    deadline: Instant,
    output: &mut String,
) -> bool {
    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(line) => {
                    output.push_str(&line);
                    output.push('\n');
                }
                None => return false,
            },
            _ = tokio::time::sleep_until(deadline) => return true,
        }
    }
}

/// Waits for an interactively-debugged child (nothing captured).
/// Returns true on timeout.
async fn wait_interactive(child: &mut tokio::process::Child, deadline: Instant) -> bool {
    tokio::select! {
        _ = child.wait() => false,
        _ = tokio::time::sleep_until(deadline) => true,
    }
}

/// On-device post-mortem for a timed-out combination.
///
/// Eight rounds: locate the runtime processes by name, dump every
/// thread's `stat` and `status` from `/proc`, and from the fifth round
/// also trigger the device's backtrace tool. The 10 s/60 s cadence gives
/// a wedged runtime several chances to show movement between dumps.
async fn diagnose_timeout(config: &Config, combination: &Combination) {
    let Combination::Matrix(m) = combination else {
        return;
    };
    if m.target != Target::Device || config.on_vm {
        return;
    }

    let process = format!("dalvikvm{}", m.address_size.tag());
    for round in 0..8 {
        let pids = config::run_capture(&config.device_shell(&["pidof", &process]), None)
            .await
            .unwrap_or_default();
        for pid in pids.split_whitespace() {
            if round >= 4 {
                warn!("requesting a backtrace of {pid}");
                config::run_capture(&config.device_shell(&["debuggerd", pid]), None).await;
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            let task_dir = format!("/proc/{pid}/task");
            let tids = config::run_capture(&config.device_shell(&["ls", &task_dir]), None)
                .await
                .unwrap_or_default();
            for tid in tids.split_whitespace() {
                for file in ["stat", "status"] {
                    let path = format!("{task_dir}/{tid}/{file}");
                    if let Some(content) =
                        config::run_capture(&config.device_shell(&["cat", &path]), None).await
                    {
                        warn!("{path}:\n{content}");
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
}
