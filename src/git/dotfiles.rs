//! Repository-provided worktree dotfiles.
//!
//! Three optional plain-text files at the root of the source repository:
//!
//! - `.agent_hub_copy`: glob patterns (relative to the repo root) of files
//!   mirrored into every new worktree, e.g. `.env` or `config/*.local.yml`
//! - `.agent_hub_init`: shell commands run once in a new worktree
//! - `.agent_hub_teardown`: shell commands run once before a worktree is
//!   deleted
//!
//! One entry per line. Blank lines and lines starting with `#` are skipped.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Copy-pattern list file name.
pub const COPY_FILE: &str = ".agent_hub_copy";
/// Init script file name.
pub const INIT_FILE: &str = ".agent_hub_init";
/// Teardown script file name.
pub const TEARDOWN_FILE: &str = ".agent_hub_teardown";

/// Reads the entries of a dotfile; a missing file yields no entries.
pub fn read_entries(repo_path: &Path, file_name: &str) -> Result<Vec<String>> {
    let path = repo_path.join(file_name);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(parse_entries(&content))
}

fn parse_entries(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => log::warn!("[Worktree] invalid copy pattern '{pattern}': {e}"),
        }
    }
    Ok(builder.build()?)
}

/// Copies files matching the repo's copy patterns into `dest`.
///
/// Individual copy failures are logged and skipped. Returns the relative
/// paths that were copied.
pub fn copy_matching_files(source_repo: &Path, dest: &Path) -> Result<Vec<String>> {
    let patterns = read_entries(source_repo, COPY_FILE)?;
    if patterns.is_empty() {
        return Ok(Vec::new());
    }
    let globset = build_globset(&patterns)?;
    let mut copied = Vec::new();
    walk(source_repo, source_repo, dest, &globset, &mut copied);
    log::info!("[Worktree] copied {} file(s) into {}", copied.len(), dest.display());
    Ok(copied)
}

fn walk(root: &Path, dir: &Path, dest: &Path, globset: &GlobSet, copied: &mut Vec<String>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("[Worktree] cannot read {}: {e}", dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.file_name().is_some_and(|n| n == ".git") {
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };

        if path.is_dir() {
            walk(root, &path, dest, globset, copied);
        } else if globset.is_match(rel) {
            let target = dest.join(rel);
            if let Some(parent) = target.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    log::warn!("[Worktree] cannot create {}: {e}", parent.display());
                    continue;
                }
            }
            match fs::copy(&path, &target) {
                Ok(_) => copied.push(rel.to_string_lossy().to_string()),
                Err(e) => log::warn!("[Worktree] failed to copy {}: {e}", rel.display()),
            }
        }
    }
}
