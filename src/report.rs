//! Progress rendering, the CSV result sink, and the final summary.
//!
//! Two rendering strategies, selected automatically:
//!
//! - **Interactive** (stdout is a terminal and `--verbose` is off): each
//!   completion overwrites the previous status line; only failures and
//!   timeouts leave a permanent line. Long canonical names are elided
//!   from the left with a `...` prefix so the line fits the terminal.
//! - **Plain** (verbose or redirected output): every completion is a
//!   permanent line, with the elapsed time in verbose mode.
//!
//! The status words are styled bright red/green/yellow; `console` drops
//! the escapes automatically when stdout is not a terminal. Under the
//! build system all progress output is suppressed; failures still print
//! in the final summary so the build log keeps the evidence.
//!
//! The terminal-width function is injected so the elision logic is
//! testable without a tty.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use console::style;

use crate::executor::{RunSummary, TestStatus};
use crate::variant::Combination;

/// Live progress renderer.
pub struct Progress {
    interactive: bool,
    verbose: bool,
    quiet: bool,
    width: Box<dyn Fn() -> usize + Send + Sync>,
}

impl Progress {
    /// Picks the strategy from the tty state and the verbosity flag.
    pub fn auto(verbose: bool, quiet: bool) -> Progress {
        let term = console::Term::stdout();
        let interactive = term.is_term() && !verbose;
        Progress {
            interactive,
            verbose,
            quiet,
            width: Box::new(move || term.size().1 as usize),
        }
    }

    /// Fully explicit constructor, used by tests to pin the strategy and
    /// the terminal width.
    pub fn with_width(
        verbose: bool,
        quiet: bool,
        interactive: bool,
        width: Box<dyn Fn() -> usize + Send + Sync>,
    ) -> Progress {
        Progress {
            interactive,
            verbose,
            quiet,
            width,
        }
    }

    /// Renders one completion.
    pub fn test_done(
        &mut self,
        done: usize,
        total: usize,
        name: &str,
        status: TestStatus,
        detail: Option<&str>,
        elapsed: Duration,
    ) {
        if self.quiet {
            return;
        }
        let line = self.completion_line(done, total, name, status, elapsed);
        if self.interactive {
            self.erase_line();
            if status.is_failure() {
                println!("{line}");
            } else {
                print!("{line}");
            }
        } else {
            println!("{line}");
            if status.is_failure()
                && self.verbose
                && let Some(detail) = detail
            {
                println!("{detail}");
            }
        }
        let _ = io::stdout().flush();
    }

    /// Overwrites the transient status line with blanks.
    pub fn erase_line(&self) {
        if self.interactive && !self.quiet {
            print!("\r{}\r", " ".repeat((self.width)()));
            let _ = io::stdout().flush();
        }
    }

    /// Writes free-form text, honouring build-system quiet mode.
    pub fn text(&self, msg: &str) {
        if !self.quiet {
            print!("{msg}");
            let _ = io::stdout().flush();
        }
    }

    fn completion_line(
        &self,
        done: usize,
        total: usize,
        name: &str,
        status: TestStatus,
        elapsed: Duration,
    ) -> String {
        let progress = format!("[ {}% {}/{} ]", done * 100 / total.max(1), done, total);
        let status_text = styled_status(status);

        if self.interactive && !status.is_failure() {
            let allowed = (self.width)()
                .saturating_sub(2 + progress.len() + status.as_str().len());
            return format!("{progress} {} {status_text}", elide_left(name, allowed));
        }

        let timing = if self.verbose && !elapsed.is_zero() {
            format!("({}) ", format_elapsed(elapsed))
        } else {
            String::new()
        };
        format!("{timing}{progress} {name} {status_text}")
    }
}

/// Prints the end-of-run analysis.
///
/// Failures bypass quiet mode: when running under the build system the
/// summary is the only place the evidence survives.
pub fn print_summary(progress: &Progress, summary: &RunSummary) {
    progress.erase_line();

    let total = summary.total;
    let passed = summary
        .completed
        .saturating_sub(summary.skipped.len() + summary.failed.len());
    let percent = passed * 100 / total.max(1);
    let noun = if passed == 1 { "test" } else { "tests" };
    progress.text(&format!("{passed}/{total} ({percent}%) {noun} passed.\n"));

    if !summary.skipped.is_empty() {
        let mut names = summary.skipped.clone();
        names.sort();
        progress.text(&format!(
            "{}\n",
            style("SKIPPED TESTS:").yellow().bright()
        ));
        for name in &names {
            progress.text(&format!("{name}\n"));
        }
        progress.text("\n");
    }

    if !summary.failed.is_empty() {
        println!("{}", style("FAILED:").red().bright());
        for (name, detail) in &summary.failed {
            println!("{name}\n{detail}");
        }
        println!("{}", style("----------").red().bright());
        let mut names: Vec<&str> = summary.failed.iter().map(|(n, _)| n.as_str()).collect();
        names.sort();
        for name in names {
            println!("{name}");
        }
    }
    let _ = io::stdout().flush();
}

fn styled_status(status: TestStatus) -> String {
    let word = status.as_str();
    match status {
        TestStatus::Pass => style(word).green().bright().to_string(),
        TestStatus::Skip => style(word).yellow().bright().to_string(),
        TestStatus::Fail | TestStatus::Timeout => style(word).red().bright().to_string(),
    }
}

/// Keeps the tail of an over-long name, `...`-prefixed, within `allowed`
/// columns.
fn elide_left(name: &str, allowed: usize) -> String {
    if name.len() <= allowed {
        return name.to_string();
    }
    if allowed <= 3 {
        return "...".to_string();
    }
    format!("...{}", &name[name.len() - (allowed - 3)..])
}

fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.1}s", elapsed.as_secs_f64())
}

/// Streaming tabular result sink for `--csv-results`.
pub struct CsvSink {
    out: BufWriter<File>,
}

impl CsvSink {
    const HEADER: &'static str = "target,run,prebuild,compiler,relocate,trace,gc,jni,image,\
                                  debuggable,jvmti,test,address_size,result";

    pub fn create(path: &Path) -> io::Result<CsvSink> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{}", Self::HEADER)?;
        Ok(CsvSink { out })
    }

    /// Appends one row; rows are written as completions arrive.
    pub fn row(&mut self, combination: &Combination, result: &str) -> io::Result<()> {
        writeln!(self.out, "{},{result}", combination.csv_fields().join(","))
    }

    /// Flushes and closes the sink.
    pub fn finish(mut self) -> io::Result<()> {
        self.out.flush()
    }
}
