//! End-to-end apply/revert behavior against a real working tree.
//!
//! These tests shell out to `git apply` the same way the loop does, so they
//! are skipped when git is not on PATH.

use std::fs;
use std::process::Command;

use hillclimb::apply::Patcher;
use tempfile::TempDir;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

const ORIGINAL: &str = "let speed = 1;\nexport { speed };\n";

const SPEED_DIFF: &str = "\
--- a/src/game.js
+++ b/src/game.js
@@ -1,2 +1,2 @@
-let speed = 1;
+let speed = 2;
 export { speed };
";

fn setup_tree() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    fs::create_dir_all(dir.path().join("src")).expect("mkdir");
    fs::write(dir.path().join("src/game.js"), ORIGINAL).expect("write");
    dir
}

#[test]
fn apply_then_revert_restores_bytes() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let dir = setup_tree();
    let patcher = Patcher::new(dir.path());

    patcher.apply(SPEED_DIFF).expect("apply");
    let patched = fs::read_to_string(dir.path().join("src/game.js")).expect("read");
    assert!(patched.contains("let speed = 2;"));

    patcher.revert(SPEED_DIFF).expect("revert");
    let restored = fs::read_to_string(dir.path().join("src/game.js")).expect("read");
    assert_eq!(restored, ORIGINAL, "revert must restore the exact bytes");
}

#[test]
fn check_rejects_stale_diff_without_touching_tree() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let dir = setup_tree();
    let patcher = Patcher::new(dir.path());

    // The diff's old lines don't match the file on disk.
    let stale = "\
--- a/src/game.js
+++ b/src/game.js
@@ -1,2 +1,2 @@
-let velocity = 9;
+let velocity = 10;
 export { speed };
";
    let err = patcher.check(stale).expect_err("stale diff must fail dry run");
    assert!(!err.to_string().is_empty());

    let content = fs::read_to_string(dir.path().join("src/game.js")).expect("read");
    assert_eq!(content, ORIGINAL, "dry run must not modify the tree");
}

#[test]
fn apply_is_transactional_on_failure() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let dir = setup_tree();
    let patcher = Patcher::new(dir.path());

    // Second hunk targets a file that doesn't exist; nothing may land.
    let partial = "\
--- a/src/game.js
+++ b/src/game.js
@@ -1,2 +1,2 @@
-let speed = 1;
+let speed = 2;
 export { speed };
--- a/src/missing.js
+++ b/src/missing.js
@@ -1 +1 @@
-old
+new
";
    assert!(patcher.apply(partial).is_err());
    let content = fs::read_to_string(dir.path().join("src/game.js")).expect("read");
    assert_eq!(content, ORIGINAL, "failed apply must leave the tree untouched");
}

#[test]
fn revert_of_unapplied_diff_reports_inconsistency() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let dir = setup_tree();
    let patcher = Patcher::new(dir.path());

    // Nothing was applied, so reverse-applying cannot succeed.
    let reverse_only = "\
--- a/src/game.js
+++ b/src/game.js
@@ -1,2 +1,2 @@
-let speed = 2;
+let speed = 1;
 export { speed };
";
    let err = patcher
        .revert(reverse_only)
        .expect_err("reverting an unapplied diff must fail");
    assert!(err.to_string().contains("revert"));
}
