//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use agent_hub::config::{Profile, SessionDef};
use agent_hub::Config;

/// Runs git in `dir`, panicking with stderr on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git is installed");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Creates a repository with one commit on `main` at `<tmp>/<name>`.
pub fn init_repo(tmp: &Path, name: &str) -> PathBuf {
    let repo = tmp.join(name);
    std::fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "-q", "-b", "main"]);
    git(&repo, &["config", "user.email", "test@example.com"]);
    git(&repo, &["config", "user.name", "Test User"]);
    std::fs::write(repo.join("README.md"), "# Test\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-q", "-m", "Initial commit"]);
    repo
}

/// Whether `branch` exists in `repo`.
pub fn branch_exists(repo: &Path, branch: &str) -> bool {
    !git(repo, &["branch", "--list", branch]).trim().is_empty()
}

/// Single-session profile running `command`.
pub fn profile(command: &str) -> Profile {
    Profile {
        sessions: vec![SessionDef {
            name: "main".to_string(),
            command: command.to_string(),
            init_commands: Vec::new(),
        }],
    }
}

/// Config with worktrees under `<tmp>/worktrees` and a default profile
/// running `command`.
pub fn config(tmp: &Path, command: &str) -> Config {
    let mut config = Config::default();
    config.worktree_base = tmp.join("worktrees");
    config.profiles = BTreeMap::from([("default".to_string(), profile(command))]);
    config
}

/// Polls `check` every 20ms until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}
