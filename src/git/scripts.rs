//! Running worktree init/teardown commands with a time budget.

use std::collections::BTreeMap;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use crate::constants::{PROCESS_POLL_INTERVAL, SCRIPT_OUTPUT_GRACE};

/// Environment describing the agent a script runs for.
#[derive(Debug, Clone, Default)]
pub struct ScriptEnv {
    /// Repository name.
    pub repo: String,
    /// Branch name.
    pub branch: String,
    /// Worktree path.
    pub worktree_path: PathBuf,
    /// Issue or task number.
    pub issue_number: Option<u64>,
    /// Agent key.
    pub agent_key: Option<String>,
}

impl ScriptEnv {
    /// Variables injected into every script command.
    pub fn vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("AGENT_HUB_REPO".to_string(), self.repo.clone());
        vars.insert("AGENT_HUB_BRANCH_NAME".to_string(), self.branch.clone());
        vars.insert(
            "AGENT_HUB_WORKTREE_PATH".to_string(),
            self.worktree_path.to_string_lossy().to_string(),
        );
        if let Some(issue) = self.issue_number {
            vars.insert("AGENT_HUB_ISSUE_NUMBER".to_string(), issue.to_string());
        }
        if let Some(key) = &self.agent_key {
            vars.insert("AGENT_HUB_AGENT_KEY".to_string(), key.clone());
        }
        let bin = std::env::current_exe()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| "agent-hub".to_string());
        vars.insert("AGENT_HUB_BIN".to_string(), bin);
        vars
    }
}

/// Runs `commands` one after another through `sh -c` in `cwd`.
///
/// Stops at the first failing command. The whole list shares one budget;
/// a command still running when it runs out is killed. Output is collected
/// within the same budget: processes a command left in the background may
/// keep its pipes open, and are not waited for.
pub fn run_commands(
    label: &str,
    commands: &[String],
    cwd: &Path,
    env: &BTreeMap<String, String>,
    budget: Duration,
) -> Result<()> {
    let deadline = Instant::now() + budget;

    for cmd in commands {
        log::info!("[Worktree] {label}: {cmd}");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to start {label} command '{cmd}'"))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if Instant::now() >= deadline {
                kill_group(child.id());
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            thread::sleep(PROCESS_POLL_INTERVAL);
        };

        let Some(status) = status else {
            bail!("{label} command '{cmd}' timed out after {}ms", budget.as_millis());
        };

        let collect_until = deadline.min(Instant::now() + SCRIPT_OUTPUT_GRACE);
        let out = collect(&stdout, collect_until);
        let err = collect(&stderr, collect_until);
        if out.is_none() || err.is_none() {
            log::debug!("[Worktree] {label} command '{cmd}' left processes holding its output");
        }
        let (out, err) = (out.unwrap_or_default(), err.unwrap_or_default());
        if !out.trim().is_empty() {
            log::debug!("[Worktree] {label} stdout: {}", out.trim());
        }
        if !status.success() {
            bail!("{label} command '{cmd}' failed ({status}): {}", err.trim());
        }
    }

    Ok(())
}

/// Kills the command's process group so children of `sh` go with it.
fn kill_group(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal to the group created for this
    // command by `process_group(0)`.
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
}

/// Reads `pipe` to EOF on a detached thread.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

/// Output of a drained pipe, or `None` if it is still open at `until`.
fn collect(rx: &Receiver<String>, until: Instant) -> Option<String> {
    rx.recv_timeout(until.saturating_duration_since(Instant::now())).ok()
}
