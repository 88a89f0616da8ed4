//! Git worktree management commands.
//!
//! # Examples
//!
//! ```bash
//! # List worktrees for the current repository
//! agent-hub worktree list
//!
//! # Delete a managed worktree and its branch
//! agent-hub worktree delete ~/agent-hub-worktrees/owner-repo/feature-1 feature-1
//! ```

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::Config;
use crate::git::{self, ScriptEnv, WorktreeInfo, WorktreeManager};

/// Column width for path display.
const PATH_COLUMN_WIDTH: usize = 56;

/// Total table width including separator.
const TABLE_WIDTH: usize = 90;

fn manager(config: &Config) -> WorktreeManager {
    WorktreeManager::new(config.worktree_base.clone())
        .with_timeouts(config.init_timeout(), config.teardown_timeout())
}

/// Lists secondary checkouts of the repository containing `repo` (or the
/// current directory).
///
/// # Errors
///
/// Returns an error if no repository is found or git fails.
pub fn list(repo: Option<PathBuf>) -> Result<()> {
    let start = match repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let (repo_path, repo_name) = git::detect_repo(&start)?;
    let config = Config::load()?;
    let worktrees = manager(&config).list(&repo_path)?;

    println!("Worktrees for repository: {repo_name}");
    println!();
    if worktrees.is_empty() {
        println!("No worktrees found");
    } else {
        print!("{}", format_table(&worktrees));
    }
    Ok(())
}

/// Deletes a managed worktree after every safety check passes.
///
/// # Errors
///
/// Returns an error if the path is not a deletable managed worktree or git
/// fails.
pub fn delete(path: &Path, branch: &str) -> Result<()> {
    let config = Config::load()?;
    let env = ScriptEnv {
        branch: branch.to_string(),
        worktree_path: path.to_path_buf(),
        ..ScriptEnv::default()
    };
    manager(&config).delete(path, branch, &env)?;
    println!("Deleted worktree {}", path.display());
    Ok(())
}

fn format_table(worktrees: &[WorktreeInfo]) -> String {
    let mut out = format!("{:<PATH_COLUMN_WIDTH$} {}\n", "Path", "Branch");
    out.push_str(&"-".repeat(TABLE_WIDTH));
    out.push('\n');
    for wt in worktrees {
        let marker = if wt.managed { "" } else { "  (unmanaged)" };
        out.push_str(&format!(
            "{:<PATH_COLUMN_WIDTH$} {}{marker}\n",
            wt.path.display(),
            format_branch_name(wt.branch.as_deref())
        ));
    }
    out
}

/// Returns "(detached)" when there is no branch.
fn format_branch_name(branch: Option<&str>) -> &str {
    branch.unwrap_or("(detached)")
}
