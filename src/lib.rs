//! # testrunner
//!
//! Parallel matrix orchestrator for the ART run-test suite: it expands
//! every selected test across the variant matrix (compiler, garbage
//! collector, image mode, address size, ...), filters the expansion
//! against the declarative known-failures catalogue, and launches the
//! surviving combinations against a bounded worker pool with per-test
//! timeouts and group-kill cancellation.
//!
//! ## Architecture
//!
//! The engine is three stages wired leaf-first:
//!
//! 1. **Expansion** ([`expand`]): the cartesian product of the
//!    user-selected axis subsets over every discovered test, with the
//!    segregated `jvm` target and per-target address sizes.
//! 2. **Skip resolution** ([`knownfailures`]): `knownfailures.json`
//!    rules parsed into per-test disjunctions of conjunctive tag sets,
//!    consulted per combination by the [`SkipOracle`].
//! 3. **Execution** ([`executor`]): a worker pool that launches each
//!    surviving combination as a `run-test` child in its own process
//!    group, enforces wall-clock timeouts, and streams completions to
//!    the progress renderer and the CSV sink ([`report`]).
//!
//! Around the engine sit the environment probe ([`config`]), the axis
//! catalogue and canonical combination names ([`variant`]), and the
//! generated command-line surface ([`cli`]).
//!
//! ```text
//!   Config ──► VariantSelection ──► Expansion ──► Orchestrator ──► Progress
//!                 (cli)              (expand)         │              CsvSink
//!                                                     ▼
//!   knownfailures.json ──► SkipTable ──────────► SkipOracle
//! ```
//!
//! Everything upstream of the orchestrator is frozen before the pool
//! starts; the only shared mutable state during a run is the child
//! tracker and the completion loop's accumulators.

pub mod cli;
pub mod config;
pub mod executor;
pub mod expand;
pub mod knownfailures;
pub mod report;
pub mod variant;

// Re-export the types a driver needs to assemble a run.

pub use config::Config;
pub use executor::{ChildTracker, Orchestrator, RunOptions, RunSummary, TestStatus};
pub use expand::{Expansion, Selection, VariantSelection, discover_tests};
pub use knownfailures::{SkipOracle, SkipTable};
pub use report::{CsvSink, Progress, print_summary};
pub use variant::{Combination, Tag};
