//! Git worktree management.
//!
//! Every agent works in its own secondary checkout ("worktree") created
//! under a single manager-owned base directory:
//!
//! ```text
//! <base>/<repo>/<branch>/
//!   .git                  file pointing at <repo>/.git/worktrees/<name>
//!   .agent_hub_worktree   marker written by create()
//! ```
//!
//! Deletion is guarded: before anything destructive happens the path must
//! be under the base directory, must be a secondary checkout (its `.git` is
//! a file, not a directory) and must carry the marker. Each refusal is a
//! [`WorktreeSafetyError`].

pub mod dotfiles;
pub mod scripts;

pub use scripts::ScriptEnv;

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_INIT_TIMEOUT, DEFAULT_TEARDOWN_TIMEOUT};

/// Marker file written into every worktree this manager creates.
pub const MARKER_FILE: &str = ".agent_hub_worktree";

/// Hard refusals from [`WorktreeManager::delete`].
#[derive(Debug, thiserror::Error)]
pub enum WorktreeSafetyError {
    /// The path is not strictly inside the base directory.
    #[error("refusing to delete {path}: outside managed base directory {base}")]
    OutsideBase {
        /// Requested path.
        path: PathBuf,
        /// Manager base directory.
        base: PathBuf,
    },
    /// The path is a primary repository (its `.git` is a directory) or not a
    /// git checkout at all.
    #[error("refusing to delete {path}: not a secondary worktree")]
    NotAWorktree {
        /// Requested path.
        path: PathBuf,
    },
    /// The marker written by `create` is missing.
    #[error("refusing to delete {path}: missing {MARKER_FILE} marker")]
    MissingMarker {
        /// Requested path.
        path: PathBuf,
    },
}

/// Contents of the marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeMarker {
    /// Repository name.
    pub repo: String,
    /// Primary checkout the worktree belongs to.
    pub repo_path: PathBuf,
    /// Branch checked out.
    pub branch: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// One entry of `git worktree list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    /// Checkout path.
    pub path: PathBuf,
    /// Branch, or `None` for a detached HEAD.
    pub branch: Option<String>,
    /// Whether the checkout lives under the base directory and has a marker.
    pub managed: bool,
}

/// Result of [`WorktreeManager::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedWorktree {
    /// Checkout path.
    pub path: PathBuf,
    /// True when an existing checkout of the branch was reused.
    pub reused: bool,
}

/// Creates and destroys isolated checkouts under one base directory.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    base_dir: PathBuf,
    init_timeout: Duration,
    teardown_timeout: Duration,
}

impl WorktreeManager {
    /// Manager rooted at `base_dir` with default script budgets.
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }

    /// Overrides the init and teardown script budgets.
    pub fn with_timeouts(mut self, init: Duration, teardown: Duration) -> Self {
        self.init_timeout = init;
        self.teardown_timeout = teardown;
        self
    }

    /// Base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Deterministic checkout location for a repo/branch pair.
    pub fn worktree_dir(&self, repo_name: &str, branch: &str) -> PathBuf {
        self.base_dir
            .join(sanitize_component(repo_name))
            .join(sanitize_component(branch))
    }

    /// Creates (or reuses) a checkout of `branch`.
    ///
    /// An existing secondary checkout of the branch under the base directory
    /// is reused as-is. Otherwise a new worktree is added at
    /// [`worktree_dir`](Self::worktree_dir), creating the branch from
    /// `base_ref` (default `HEAD`) if it does not exist. New checkouts get
    /// the repo's copy patterns applied and its init script run; script
    /// failures are logged, never returned.
    pub fn create(
        &self,
        repo_path: &Path,
        branch: &str,
        base_ref: Option<&str>,
        env: &ScriptEnv,
    ) -> Result<CreatedWorktree> {
        validate_branch(branch)?;
        let repo_name = repo_name(repo_path)?;

        if let Some(existing) = self.find_checkout(repo_path, branch)? {
            if !self.is_under_base(&existing) {
                bail!(
                    "Branch '{branch}' is already checked out at {} outside {}",
                    existing.display(),
                    self.base_dir.display()
                );
            }
            log::info!("[Worktree] reusing {} for {branch}", existing.display());
            if !existing.join(MARKER_FILE).exists() {
                write_marker(&existing, &repo_name, repo_path, branch)?;
            }
            return Ok(CreatedWorktree {
                path: existing,
                reused: true,
            });
        }

        let path = self.worktree_dir(&repo_name, branch);
        if path.exists() {
            bail!(
                "{} already exists and is not a checkout of '{branch}'",
                path.display()
            );
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let path_str = path.to_str().context("Worktree path is not valid UTF-8")?;
        if branch_exists(repo_path, branch)? {
            git_ok(repo_path, &["worktree", "add", path_str, branch])?;
        } else {
            let base = base_ref.unwrap_or("HEAD");
            git_ok(repo_path, &["worktree", "add", "-b", branch, path_str, base])?;
        }
        log::info!("[Worktree] created {} for {branch}", path.display());

        write_marker(&path, &repo_name, repo_path, branch)?;

        if let Err(e) = dotfiles::copy_matching_files(repo_path, &path) {
            log::warn!("[Worktree] copy patterns failed for {}: {e:#}", path.display());
        }

        let init = dotfiles::read_entries(repo_path, dotfiles::INIT_FILE).unwrap_or_else(|e| {
            log::warn!("[Worktree] cannot read init script: {e:#}");
            Vec::new()
        });
        if !init.is_empty() {
            let mut env = env.clone();
            env.worktree_path.clone_from(&path);
            if let Err(e) = scripts::run_commands("init", &init, &path, &env.vars(), self.init_timeout) {
                log::warn!("[Worktree] init script failed for {}: {e:#}", path.display());
            }
        }

        Ok(CreatedWorktree {
            path,
            reused: false,
        })
    }

    /// Checks every deletion precondition without touching the filesystem.
    ///
    /// Returns the canonical path on success.
    pub fn check_deletable(&self, path: &Path) -> Result<PathBuf, WorktreeSafetyError> {
        let outside = || WorktreeSafetyError::OutsideBase {
            path: path.to_path_buf(),
            base: self.base_dir.clone(),
        };

        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(outside());
        }
        let canonical = path.canonicalize().map_err(|_| outside())?;
        let base = self.base_dir.canonicalize().map_err(|_| outside())?;
        if canonical == base || !canonical.starts_with(&base) {
            return Err(outside());
        }

        let dot_git = canonical.join(".git");
        let is_secondary = fs::symlink_metadata(&dot_git).is_ok_and(|m| m.is_file());
        if !is_secondary {
            return Err(WorktreeSafetyError::NotAWorktree { path: canonical });
        }

        if !canonical.join(MARKER_FILE).is_file() {
            return Err(WorktreeSafetyError::MissingMarker { path: canonical });
        }

        Ok(canonical)
    }

    /// Deletes a checkout created by this manager.
    ///
    /// All safety checks run first; any refusal returns a
    /// [`WorktreeSafetyError`] (inside the `anyhow::Error`) before anything
    /// is modified. Then the teardown script runs within its budget
    /// (failures logged), the checkout is removed, and the branch is
    /// deleted best-effort.
    pub fn delete(&self, path: &Path, branch: &str, env: &ScriptEnv) -> Result<()> {
        let canonical = self.check_deletable(path)?;
        let repo_path = main_repo_of(&canonical)?;

        let teardown = dotfiles::read_entries(&repo_path, dotfiles::TEARDOWN_FILE)
            .unwrap_or_else(|e| {
                log::warn!("[Worktree] cannot read teardown script: {e:#}");
                Vec::new()
            });
        if !teardown.is_empty() {
            let mut env = env.clone();
            env.worktree_path.clone_from(&canonical);
            if env.branch.is_empty() {
                env.branch = branch.to_string();
            }
            if let Err(e) = scripts::run_commands(
                "teardown",
                &teardown,
                &canonical,
                &env.vars(),
                self.teardown_timeout,
            ) {
                log::warn!("[Worktree] teardown failed for {}: {e:#}", canonical.display());
            }
        }

        let path_str = canonical.to_str().context("Worktree path is not valid UTF-8")?;
        let removed = git(&repo_path, &["worktree", "remove", "--force", path_str])?;
        if !removed.status.success() {
            log::warn!(
                "[Worktree] git worktree remove failed ({}), removing directory",
                String::from_utf8_lossy(&removed.stderr).trim()
            );
            fs::remove_dir_all(&canonical)
                .with_context(|| format!("Failed to remove {}", canonical.display()))?;
            let _ = git(&repo_path, &["worktree", "prune"]);
        }

        if !branch.is_empty() {
            let output = git(&repo_path, &["branch", "-D", branch])?;
            if !output.status.success() {
                log::warn!(
                    "[Worktree] failed to delete branch {branch}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }

        log::info!("[Worktree] deleted {}", canonical.display());
        Ok(())
    }

    /// Secondary checkouts of `repo_path`.
    pub fn list(&self, repo_path: &Path) -> Result<Vec<WorktreeInfo>> {
        let primary = repo_path
            .canonicalize()
            .with_context(|| format!("Repository {} not found", repo_path.display()))?;
        let stdout = git_ok(repo_path, &["worktree", "list", "--porcelain"])?;

        Ok(parse_porcelain(&stdout)
            .into_iter()
            .filter(|(path, _)| path.canonicalize().map_or(true, |p| p != primary))
            .map(|(path, branch)| WorktreeInfo {
                managed: self.is_under_base(&path) && path.join(MARKER_FILE).is_file(),
                path,
                branch,
            })
            .collect())
    }

    fn find_checkout(&self, repo_path: &Path, branch: &str) -> Result<Option<PathBuf>> {
        let primary = repo_path.canonicalize()?;
        let stdout = git_ok(repo_path, &["worktree", "list", "--porcelain"])?;
        for (path, b) in parse_porcelain(&stdout) {
            if b.as_deref() != Some(branch) {
                continue;
            }
            if path.canonicalize().is_ok_and(|p| p == primary) {
                bail!("Branch '{branch}' is checked out in the primary repository");
            }
            return Ok(Some(path));
        }
        Ok(None)
    }

    fn is_under_base(&self, path: &Path) -> bool {
        match (path.canonicalize(), self.base_dir.canonicalize()) {
            (Ok(p), Ok(base)) => p != base && p.starts_with(base),
            _ => false,
        }
    }
}

/// Finds the primary checkout of the repository containing `start`.
///
/// Returns the repo root and a display name (`owner/repo` from the origin
/// remote when available, else the directory name).
pub fn detect_repo(start: &Path) -> Result<(PathBuf, String)> {
    let toplevel = git_ok(start, &["rev-parse", "--show-toplevel"])
        .with_context(|| format!("{} is not inside a git repository", start.display()))?;
    let toplevel = PathBuf::from(toplevel.trim());
    let root = if toplevel.join(".git").is_file() {
        main_repo_of(&toplevel)?
    } else {
        toplevel
    };
    let name = repo_name(&root)?;
    Ok((root, name))
}

/// Display name of a repository.
pub fn repo_name(repo_path: &Path) -> Result<String> {
    if let Ok(output) = git(repo_path, &["remote", "get-url", "origin"]) {
        if output.status.success() {
            let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if let Some(name) = name_from_remote(&url) {
                return Ok(name);
            }
        }
    }
    let canonical = repo_path.canonicalize().unwrap_or_else(|_| repo_path.to_path_buf());
    Ok(canonical
        .file_name()
        .context("Repository path has no name")?
        .to_string_lossy()
        .to_string())
}

fn name_from_remote(url: &str) -> Option<String> {
    let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
    let mut parts = trimmed.rsplit(['/', ':']);
    let repo = parts.next().filter(|s| !s.is_empty())?;
    match parts.next().filter(|s| !s.is_empty() && !s.contains('@')) {
        Some(owner) => Some(format!("{owner}/{repo}")),
        None => Some(repo.to_string()),
    }
}

/// Resolves the primary checkout from a worktree's `.git` file.
///
/// The file reads `gitdir: <repo>/.git/worktrees/<name>`; that directory's
/// `commondir` points back at `<repo>/.git`.
fn main_repo_of(worktree: &Path) -> Result<PathBuf> {
    let content = fs::read_to_string(worktree.join(".git"))
        .with_context(|| format!("Failed to read {}/.git", worktree.display()))?;
    let gitdir = content
        .lines()
        .find_map(|l| l.strip_prefix("gitdir:"))
        .map(|s| PathBuf::from(s.trim()))
        .context("Malformed .git file")?;
    let gitdir = if gitdir.is_absolute() {
        gitdir
    } else {
        worktree.join(gitdir)
    };

    let common = match fs::read_to_string(gitdir.join("commondir")) {
        Ok(rel) => gitdir.join(rel.trim()),
        Err(_) => gitdir
            .parent()
            .and_then(Path::parent)
            .context("Cannot locate common git dir")?
            .to_path_buf(),
    };
    let common = common.canonicalize().context("Common git dir does not exist")?;
    Ok(common
        .parent()
        .context("Common git dir has no parent")?
        .to_path_buf())
}

fn parse_porcelain(stdout: &str) -> Vec<(PathBuf, Option<String>)> {
    let mut entries = Vec::new();
    let mut current: Option<(PathBuf, Option<String>)> = None;

    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some((PathBuf::from(path), None));
        } else if let Some(branch) = line.strip_prefix("branch ") {
            if let Some((_, b)) = current.as_mut() {
                *b = Some(branch.trim_start_matches("refs/heads/").to_string());
            }
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

fn write_marker(path: &Path, repo: &str, repo_path: &Path, branch: &str) -> Result<()> {
    let marker = WorktreeMarker {
        repo: repo.to_string(),
        repo_path: repo_path.canonicalize().unwrap_or_else(|_| repo_path.to_path_buf()),
        branch: branch.to_string(),
        created_at: Utc::now(),
    };
    fs::write(path.join(MARKER_FILE), serde_json::to_string_pretty(&marker)?)
        .with_context(|| format!("Failed to write marker in {}", path.display()))
}

fn sanitize_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

fn validate_branch(branch: &str) -> Result<()> {
    if branch.is_empty()
        || branch.starts_with('-')
        || branch.contains("..")
        || branch.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        bail!("Invalid branch name '{branch}'");
    }
    Ok(())
}

fn branch_exists(repo_path: &Path, branch: &str) -> Result<bool> {
    let refname = format!("refs/heads/{branch}");
    Ok(git(repo_path, &["rev-parse", "--verify", "--quiet", &refname])?
        .status
        .success())
}

fn git(cwd: &Path, args: &[&str]) -> Result<Output> {
    Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .with_context(|| format!("Failed to run git {}", args.join(" ")))
}

fn git_ok(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = git(cwd, args)?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_porcelain() {
        let out = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\n\
                   worktree /wt/feature\nHEAD def\nbranch refs/heads/feature/x\n\n\
                   worktree /wt/detached\nHEAD 123\ndetached\n";
        let entries = parse_porcelain(out);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], (PathBuf::from("/repo"), Some("main".into())));
        assert_eq!(entries[1].1.as_deref(), Some("feature/x"));
        assert_eq!(entries[2], (PathBuf::from("/wt/detached"), None));
    }

    #[test]
    fn test_name_from_remote() {
        assert_eq!(
            name_from_remote("https://github.com/owner/repo.git").as_deref(),
            Some("owner/repo")
        );
        assert_eq!(
            name_from_remote("git@github.com:owner/repo.git").as_deref(),
            Some("owner/repo")
        );
        assert_eq!(name_from_remote("/srv/git/repo").as_deref(), Some("git/repo"));
    }

    #[test]
    fn test_worktree_dir_is_deterministic_and_contained() {
        let manager = WorktreeManager::new(PathBuf::from("/base"));
        let a = manager.worktree_dir("owner/repo", "feature/login");
        assert_eq!(a, PathBuf::from("/base/owner-repo/feature-login"));
        assert_eq!(a, manager.worktree_dir("owner/repo", "feature/login"));
        assert_eq!(manager.worktree_dir("..", ".."), PathBuf::from("/base/_/_"));
    }

    #[test]
    fn test_validate_branch() {
        assert!(validate_branch("feature-1").is_ok());
        assert!(validate_branch("feature/x").is_ok());
        assert!(validate_branch("").is_err());
        assert!(validate_branch("-rf").is_err());
        assert!(validate_branch("a..b").is_err());
        assert!(validate_branch("has space").is_err());
    }

    #[test]
    fn test_check_deletable_rejects_parent_components() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorktreeManager::new(dir.path().join("base"));
        fs::create_dir_all(dir.path().join("base")).unwrap();
        fs::create_dir_all(dir.path().join("other")).unwrap();

        let err = manager
            .check_deletable(&dir.path().join("base/../other"))
            .unwrap_err();
        assert!(matches!(err, WorktreeSafetyError::OutsideBase { .. }));
    }

    #[test]
    fn test_check_deletable_rejects_base_itself() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorktreeManager::new(dir.path().to_path_buf());
        assert!(matches!(
            manager.check_deletable(dir.path()),
            Err(WorktreeSafetyError::OutsideBase { .. })
        ));
    }

    #[test]
    fn test_check_deletable_requires_git_file_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorktreeManager::new(dir.path().to_path_buf());

        let clone = dir.path().join("clone");
        fs::create_dir_all(clone.join(".git")).unwrap();
        fs::write(clone.join(MARKER_FILE), "{}").unwrap();
        assert!(matches!(
            manager.check_deletable(&clone),
            Err(WorktreeSafetyError::NotAWorktree { .. })
        ));

        let unmarked = dir.path().join("unmarked");
        fs::create_dir_all(&unmarked).unwrap();
        fs::write(unmarked.join(".git"), "gitdir: /nowhere").unwrap();
        assert!(matches!(
            manager.check_deletable(&unmarked),
            Err(WorktreeSafetyError::MissingMarker { .. })
        ));

        fs::write(unmarked.join(MARKER_FILE), "{}").unwrap();
        assert!(manager.check_deletable(&unmarked).is_ok());
    }
}
