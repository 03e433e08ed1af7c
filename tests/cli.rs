//! End-to-end checks of the binary against a scripted source tree.

use std::os::unix::fs::PermissionsExt;

use assert_cmd::Command;
use predicates::prelude::*;

/// A throwaway source tree: marker file, two tests, a scripted run-test
/// child, and an empty known-failures catalogue.
fn fake_tree(script: &str, knownfailures: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let test_dir = dir.path().join("art/test");
    std::fs::create_dir_all(&test_dir).unwrap();
    std::fs::create_dir_all(dir.path().join("build")).unwrap();
    std::fs::write(dir.path().join("build/envsetup.sh"), "").unwrap();
    for test in ["001-Hello", "002-World"] {
        std::fs::create_dir(test_dir.join(test)).unwrap();
    }
    std::fs::write(test_dir.join("knownfailures.json"), knownfailures).unwrap();
    let run_test = test_dir.join("run-test");
    std::fs::write(&run_test, format!("#!/bin/sh\n{script}\n")).unwrap();
    std::fs::set_permissions(&run_test, std::fs::Permissions::from_mode(0o755)).unwrap();
    dir
}

fn testrunner(tree: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("testrunner").unwrap();
    cmd.env("ANDROID_BUILD_TOP", tree.path());
    // One address size per test keeps the expected totals stable.
    cmd.env("ART_TEST_RUN_TEST_2ND_ARCH", "false");
    for var in [
        "ART_TEST_RUN_FROM_SOONG",
        "ART_TEST_RUN_TEST_BUILD",
        "ART_TEST_RUN_TEST_SKIP",
        "ART_TEST_KEEP_GOING",
        "ART_TEST_ON_VM",
        "ART_TEST_RUN_ON_ARM_FVP",
        "ART_TEST_CHROOT",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn dry_run_prints_every_plan_and_exits_zero() {
    let tree = fake_tree("exit 0", "[]");
    testrunner(&tree)
        .args(["--dry-run", "-j", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("SKIP"))
        .stdout(predicate::str::contains("001-Hello"))
        .stdout(predicate::str::contains("002-World"));
}

#[test]
fn passing_run_reports_full_marks() {
    let tree = fake_tree("exit 0", "[]");
    testrunner(&tree)
        .args(["-j", "1", "--verbose"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2/2 (100%) tests passed."));
}

#[test]
fn failing_child_fails_the_run() {
    let tree = fake_tree("echo kaboom; exit 1", "[]");
    testrunner(&tree)
        .args(["-j", "1"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("FAILED:"))
        .stdout(predicate::str::contains("kaboom"));
}

#[test]
fn catalogue_entries_skip_their_tests() {
    let tree = fake_tree("exit 0", r#"[{"tests": "001-Hello"}]"#);
    testrunner(&tree)
        .args(["-j", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("SKIPPED TESTS:"))
        .stdout(predicate::str::contains("001-Hello"));
}

#[test]
fn malformed_catalogue_is_fatal_at_startup() {
    let tree = fake_tree("exit 0", r#"[{"tests": "001-Hello", "variant": "warp-drive"}]"#);
    testrunner(&tree).args(["-j", "1"]).assert().failure();
}

#[test]
fn positional_prefixes_narrow_the_run() {
    let tree = fake_tree("exit 0", "[]");
    testrunner(&tree)
        .args(["-j", "1", "--verbose", "002"])
        .assert()
        .success()
        .stdout(predicate::str::contains("002-World"))
        .stdout(predicate::str::contains("001-Hello").not());
}
