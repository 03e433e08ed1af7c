//! Environment probe and immutable run configuration.
//!
//! [`Config`] collects every fact the orchestrator needs about the host
//! and target machines: the source-tree root, CPU counts, the connected
//! device, chroot/root overrides, and the remote-execution command
//! templates. It is built once at startup and passed by reference; no
//! component mutates it afterwards.
//!
//! Three kinds of input feed the probe:
//!
//! - ambient environment variables (`ART_TEST_*`, `ANDROID_BUILD_TOP`),
//! - the build-variable oracle (`soong_ui.bash --dumpvars-mode`, invoked
//!   once; plain environment lookup when running from the build system),
//! - device probes over `adb shell` or the configured SSH command.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::variant::AddressSize;

/// Name the device probe reports when the product name cannot be read.
pub const UNKNOWN_TARGET: &str = "UNKNOWN_TARGET";

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The resolved build-top directory is missing the source-tree marker.
    #[error("{0} does not look like a source tree (missing build/envsetup.sh)")]
    BuildTopNotFound(PathBuf),

    /// The orchestrator's own location could not be determined.
    #[error("cannot locate the orchestrator binary: {0}")]
    NoSelfPath(#[source] std::io::Error),

    /// The device CPU probe failed; without it the target concurrency
    /// cannot be chosen.
    #[error("unable to read the target CPU count ({0}); is a device connected?")]
    UnavailableDevice(String),
}

/// Immutable machine and environment facts, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the source tree containing `art/test`.
    pub build_top: PathBuf,
    /// Running as a shard inside the build system: only a subset of the
    /// tests is visible and non-error output is suppressed.
    pub run_from_build: bool,
    /// The target is a VM reached over SSH rather than an adb device.
    pub on_vm: bool,
    /// The target runs under the FVP emulator; timeouts are scaled up.
    pub on_fvp: bool,
    /// Keep running after the first failure.
    pub keep_going: bool,
    /// Ask run-test to clean up test artefacts even on failure.
    pub always_clean: bool,
    /// Run children under strace.
    pub strace: bool,
    /// Build test dependencies before running unless overridden.
    pub build_by_default: bool,
    /// Also expand combinations for the secondary architecture.
    pub second_arch: bool,
    pub chroot: Option<String>,
    pub android_root: Option<String>,
    pub android_art_root: Option<String>,
    pub android_i18n_root: Option<String>,
    pub android_tzdata_root: Option<String>,
    /// Tests the environment forces into the skip set.
    pub extra_disabled_tests: BTreeSet<String>,
    /// Tokenized remote-execution command for VM targets.
    pub ssh_cmd: Vec<String>,
    /// Primary and secondary address-size suffixes for device runs.
    pub target_suffixes: (Option<AddressSize>, Option<AddressSize>),
    /// Primary and secondary address-size suffixes for host runs.
    pub host_suffixes: (Option<AddressSize>, Option<AddressSize>),
}

impl Config {
    /// Probes the environment and the build-variable oracle.
    ///
    /// Fails fast when the build top cannot be located; everything else
    /// degrades with a warning or a default.
    pub fn probe() -> Result<Config, ProbeError> {
        let run_from_build = env::var_os("ART_TEST_RUN_FROM_SOONG").is_some();
        let build_top = resolve_build_top(
            env::var_os("ANDROID_BUILD_TOP").map(PathBuf::from),
            run_from_build,
        )?;

        let vars = BuildVars::load(&build_top, run_from_build);
        let target_arch = vars.get("TARGET_ARCH").unwrap_or_default();
        let target_2nd = !vars.get("TARGET_2ND_ARCH").unwrap_or_default().is_empty();
        let prefer_32 = vars.get("HOST_PREFER_32_BIT").unwrap_or_default() == "true";

        let on_vm = env::var_os("ART_TEST_ON_VM").is_some();
        let ssh_user = env::var("ART_TEST_SSH_USER").unwrap_or_else(|_| "ubuntu".to_string());
        let ssh_host = env::var("ART_TEST_SSH_HOST").unwrap_or_else(|_| "localhost".to_string());
        let ssh_port = env::var("ART_TEST_SSH_PORT").unwrap_or_else(|_| "10001".to_string());
        let ssh_config = build_top.join("art/test/testrunner/ssh_config");
        let ssh_cmd = env::var("ART_SSH_CMD").unwrap_or_else(|_| {
            format!(
                "ssh -q -F {} -p {ssh_port} {ssh_user}@{ssh_host}",
                ssh_config.display()
            )
        });

        let chroot = env::var("ART_TEST_CHROOT")
            .ok()
            .or_else(|| on_vm.then(|| format!("/home/{ssh_user}/art-test-chroot")));

        let extra_disabled_tests = env::var("ART_TEST_RUN_TEST_SKIP")
            .unwrap_or_default()
            .split_whitespace()
            .map(String::from)
            .collect();

        Ok(Config {
            build_top,
            run_from_build,
            on_vm,
            on_fvp: env_bool(env::var("ART_TEST_RUN_ON_ARM_FVP").ok().as_deref(), false),
            keep_going: env_bool(env::var("ART_TEST_KEEP_GOING").ok().as_deref(), true),
            always_clean: env_bool(
                env::var("ART_TEST_RUN_TEST_ALWAYS_CLEAN").ok().as_deref(),
                true,
            ),
            strace: env_bool(env::var("ART_TEST_DEBUG_GC").ok().as_deref(), false),
            build_by_default: env_bool(env::var("ART_TEST_RUN_TEST_BUILD").ok().as_deref(), false),
            second_arch: env_bool(
                env::var("ART_TEST_RUN_TEST_2ND_ARCH").ok().as_deref(),
                true,
            ),
            chroot,
            android_root: env::var("ART_TEST_ANDROID_ROOT").ok(),
            android_art_root: env::var("ART_TEST_ANDROID_ART_ROOT").ok(),
            android_i18n_root: env::var("ART_TEST_ANDROID_I18N_ROOT").ok(),
            android_tzdata_root: env::var("ART_TEST_ANDROID_TZDATA_ROOT").ok(),
            extra_disabled_tests,
            ssh_cmd: ssh_cmd.split_whitespace().map(String::from).collect(),
            target_suffixes: target_suffixes(&target_arch, target_2nd),
            host_suffixes: host_suffixes(prefer_32),
        })
    }

    /// `$build_top/art/test`, the directory holding the numbered tests.
    pub fn test_dir(&self) -> PathBuf {
        self.build_top.join("art/test")
    }

    pub fn run_test_path(&self) -> PathBuf {
        self.test_dir().join("run-test")
    }

    pub fn knownfailures_path(&self) -> PathBuf {
        self.test_dir().join("knownfailures.json")
    }

    pub fn soong_ui_path(&self) -> PathBuf {
        self.build_top.join("build/soong/soong_ui.bash")
    }

    /// Per-child wall-clock timeout in seconds, before any `--timeout`
    /// override. The FVP emulator is roughly an order of magnitude
    /// slower than hardware.
    pub fn default_timeout_secs(&self) -> u64 {
        if self.on_fvp { 36000 } else { 3600 }
    }

    /// Command tokens that run `args` on the target machine.
    pub fn device_shell(&self, args: &[&str]) -> Vec<String> {
        let mut cmd: Vec<String> = if self.on_vm {
            self.ssh_cmd.clone()
        } else {
            vec!["adb".to_string(), "shell".to_string()]
        };
        cmd.extend(args.iter().map(|a| a.to_string()));
        cmd
    }

    pub fn host_cpu_count(&self) -> usize {
        num_cpus::get()
    }

    /// Reads the target's CPU count from `/sys/devices/system/cpu/present`.
    pub async fn target_cpu_count(&self) -> Result<usize, ProbeError> {
        let cmd = self.device_shell(&["cat", "/sys/devices/system/cpu/present"]);
        let (program, rest) = cmd
            .split_first()
            .ok_or_else(|| ProbeError::UnavailableDevice("empty remote command".to_string()))?;
        let output = tokio::process::Command::new(program)
            .args(rest)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| ProbeError::UnavailableDevice(e.to_string()))?;
        if !output.status.success() {
            return Err(ProbeError::UnavailableDevice(format!(
                "probe exited with {}",
                output.status
            )));
        }
        let present = String::from_utf8_lossy(&output.stdout);
        parse_cpu_present(&present).ok_or_else(|| {
            ProbeError::UnavailableDevice(format!("unexpected CPU range {:?}", present.trim()))
        })
    }

    /// The product name of the connected device.
    ///
    /// Failure is non-fatal: the name only keys device-gated catalogue
    /// rules, so an unreachable device degrades to [`UNKNOWN_TARGET`].
    pub async fn device_name(&self) -> String {
        if self.run_from_build {
            // adb is unavailable during the build.
            return "target".to_string();
        }
        if self.on_vm {
            let cmd = self.device_shell(&["uname", "-a"]);
            return match run_capture(&cmd, None).await {
                Some(name) => name,
                None => {
                    warn!("unable to determine the VM type, continuing anyway");
                    UNKNOWN_TARGET.to_string()
                }
            };
        }

        let deadline = if self.on_fvp {
            Duration::from_secs(200)
        } else {
            Duration::from_secs(2)
        };
        let cmd = ["adb", "shell", "getprop", "ro.product.name"]
            .map(String::from)
            .to_vec();
        match run_capture(&cmd, Some(deadline)).await {
            Some(name) if !name.is_empty() => name,
            _ => {
                warn!("unable to determine the device type, continuing anyway");
                UNKNOWN_TARGET.to_string()
            }
        }
    }
}

/// Runs a command and returns its trimmed stdout, `None` on any failure.
pub(crate) async fn run_capture(cmd: &[String], deadline: Option<Duration>) -> Option<String> {
    let (program, rest) = cmd.split_first()?;
    let mut command = tokio::process::Command::new(program);
    command
        .args(rest)
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    let output = match deadline {
        Some(limit) => tokio::time::timeout(limit, command.output()).await.ok()?,
        None => command.output().await,
    }
    .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Locates the source-tree root.
///
/// Explicit override wins; otherwise the tree is assumed to sit three
/// directories above the orchestrator binary. The `build/envsetup.sh`
/// marker must exist except under the build system, which runs the
/// orchestrator from an isolated sandbox.
fn resolve_build_top(
    override_path: Option<PathBuf>,
    run_from_build: bool,
) -> Result<PathBuf, ProbeError> {
    let top = match override_path {
        Some(path) => path,
        None => {
            let exe = std::env::current_exe().map_err(ProbeError::NoSelfPath)?;
            let mut path = exe;
            for _ in 0..4 {
                path.pop();
            }
            path
        }
    };
    if !run_from_build && !top.join("build/envsetup.sh").exists() {
        return Err(ProbeError::BuildTopNotFound(top));
    }
    Ok(top)
}

/// Parses `true|True|false|False`; anything else yields the default.
fn env_bool(value: Option<&str>, default: bool) -> bool {
    match value {
        Some("true") | Some("True") => true,
        Some("false") | Some("False") => false,
        _ => default,
    }
}

/// Parses the kernel's `N-M` CPU range into a count (`M + 1`).
fn parse_cpu_present(s: &str) -> Option<usize> {
    let (_, last) = s.trim().split_once('-')?;
    last.parse::<usize>().ok().map(|n| n + 1)
}

/// Address-size suffixes for device runs.
fn target_suffixes(
    target_arch: &str,
    second_arch_set: bool,
) -> (Option<AddressSize>, Option<AddressSize>) {
    if target_arch.contains("64") {
        let second = second_arch_set.then_some(AddressSize::Bits32);
        (Some(AddressSize::Bits64), second)
    } else {
        (Some(AddressSize::Bits32), None)
    }
}

/// Address-size suffixes for host runs.
fn host_suffixes(prefer_32: bool) -> (Option<AddressSize>, Option<AddressSize>) {
    if prefer_32 {
        (Some(AddressSize::Bits32), None)
    } else {
        (Some(AddressSize::Bits64), Some(AddressSize::Bits32))
    }
}

/// The build-variable oracle.
///
/// Outside the build system the variables come from one invocation of
/// `soong_ui.bash --dumpvars-mode`; inside it they are exported into the
/// environment directly.
struct BuildVars {
    vars: BTreeMap<String, String>,
    from_env: bool,
}

impl BuildVars {
    const NAMES: &'static [&'static str] =
        &["TARGET_ARCH", "TARGET_2ND_ARCH", "HOST_PREFER_32_BIT"];

    fn load(build_top: &std::path::Path, run_from_build: bool) -> BuildVars {
        if run_from_build {
            return BuildVars {
                vars: BTreeMap::new(),
                from_env: true,
            };
        }
        let soong_ui = build_top.join("build/soong/soong_ui.bash");
        let output = std::process::Command::new(&soong_ui)
            .arg("--dumpvars-mode")
            .arg(format!("--vars={}", Self::NAMES.join(" ")))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output();
        match output {
            Ok(out) if out.status.success() => BuildVars {
                vars: parse_dumpvars(&String::from_utf8_lossy(&out.stdout)),
                from_env: false,
            },
            _ => {
                warn!(
                    "build-variable dump via {} failed, falling back to the environment",
                    soong_ui.display()
                );
                BuildVars {
                    vars: BTreeMap::new(),
                    from_env: true,
                }
            }
        }
    }

    fn get(&self, name: &str) -> Option<String> {
        if self.from_env {
            env::var(name).ok()
        } else {
            let value = self.vars.get(name).cloned();
            debug!("build var {name} = {value:?}");
            value
        }
    }
}

/// Parses `--dumpvars-mode` output lines of the form `NAME='value'`.
fn parse_dumpvars(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once('=')?;
            Some((
                name.trim().to_string(),
                value.trim().trim_matches('\'').to_string(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_accepts_only_the_boolean_literals() {
        assert!(env_bool(Some("true"), false));
        assert!(env_bool(Some("True"), false));
        assert!(!env_bool(Some("false"), true));
        assert!(!env_bool(Some("False"), true));
        assert!(env_bool(Some("yes"), true));
        assert!(!env_bool(Some("1"), false));
        assert!(env_bool(None, true));
        assert!(!env_bool(Some(""), false));
    }

    #[test]
    fn cpu_present_range_parses_to_a_count() {
        assert_eq!(parse_cpu_present("0-7\n"), Some(8));
        assert_eq!(parse_cpu_present("0-0"), Some(1));
        assert_eq!(parse_cpu_present("4"), None);
        assert_eq!(parse_cpu_present("garbage"), None);
    }

    #[test]
    fn target_suffix_table() {
        use AddressSize::{Bits32, Bits64};
        assert_eq!(target_suffixes("arm64", true), (Some(Bits64), Some(Bits32)));
        assert_eq!(target_suffixes("arm", true), (Some(Bits32), None));
        assert_eq!(target_suffixes("riscv64", false), (Some(Bits64), None));
        assert_eq!(target_suffixes("x86", false), (Some(Bits32), None));
    }

    #[test]
    fn host_suffix_table() {
        use AddressSize::{Bits32, Bits64};
        assert_eq!(host_suffixes(false), (Some(Bits64), Some(Bits32)));
        assert_eq!(host_suffixes(true), (Some(Bits32), None));
    }

    #[test]
    fn build_top_requires_the_marker() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_build_top(Some(dir.path().to_path_buf()), false).unwrap_err();
        assert!(matches!(err, ProbeError::BuildTopNotFound(_)));

        std::fs::create_dir_all(dir.path().join("build")).unwrap();
        std::fs::write(dir.path().join("build/envsetup.sh"), "").unwrap();
        let top = resolve_build_top(Some(dir.path().to_path_buf()), false).unwrap();
        assert_eq!(top, dir.path());
    }

    #[test]
    fn build_top_marker_is_waived_under_the_build_system() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_build_top(Some(dir.path().to_path_buf()), true).is_ok());
    }

    #[test]
    fn dumpvars_output_parses() {
        let vars = parse_dumpvars("TARGET_ARCH='arm64'\nTARGET_2ND_ARCH=''\n");
        assert_eq!(vars.get("TARGET_ARCH").map(String::as_str), Some("arm64"));
        assert_eq!(vars.get("TARGET_2ND_ARCH").map(String::as_str), Some(""));
    }
}
