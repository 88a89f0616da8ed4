mod common;

use std::time::Duration;

use agent_hub::git::{ScriptEnv, WorktreeManager, WorktreeSafetyError, MARKER_FILE};
use common::{branch_exists, git, init_repo};
use tempfile::TempDir;

fn manager(tmp: &TempDir) -> WorktreeManager {
    WorktreeManager::new(tmp.path().join("worktrees"))
        .with_timeouts(Duration::from_secs(10), Duration::from_secs(10))
}

fn env_for(branch: &str) -> ScriptEnv {
    ScriptEnv {
        repo: "repo".to_string(),
        branch: branch.to_string(),
        ..ScriptEnv::default()
    }
}

#[test]
fn test_create_then_reuse_with_real_git() {
    let tmp = TempDir::new().unwrap();
    let repo = init_repo(tmp.path(), "repo");
    let manager = manager(&tmp);

    let created = manager
        .create(&repo, "feature-1", None, &env_for("feature-1"))
        .unwrap();
    assert!(!created.reused);
    assert_eq!(created.path, manager.worktree_dir("repo", "feature-1"));
    assert!(created.path.join("README.md").is_file());
    assert!(created.path.join(MARKER_FILE).is_file());
    assert!(created.path.join(".git").is_file());
    assert!(branch_exists(&repo, "feature-1"));

    let again = manager
        .create(&repo, "feature-1", None, &env_for("feature-1"))
        .unwrap();
    assert!(again.reused);
    assert_eq!(
        again.path.canonicalize().unwrap(),
        created.path.canonicalize().unwrap()
    );
}

#[test]
fn test_branch_of_primary_checkout_is_refused() {
    let tmp = TempDir::new().unwrap();
    let repo = init_repo(tmp.path(), "repo");

    let err = manager(&tmp)
        .create(&repo, "main", None, &env_for("main"))
        .unwrap_err();
    assert!(err.to_string().contains("primary repository"));
}

#[test]
fn test_copy_patterns_and_init_script_apply_to_new_worktree() {
    let tmp = TempDir::new().unwrap();
    let repo = init_repo(tmp.path(), "repo");
    std::fs::write(repo.join(".env"), "SECRET=1\n").unwrap();
    std::fs::write(repo.join(".agent_hub_copy"), "# local files\n.env\n").unwrap();
    std::fs::write(
        repo.join(".agent_hub_init"),
        "echo \"$AGENT_HUB_BRANCH_NAME\" > init_ran.txt\n",
    )
    .unwrap();

    let created = manager(&tmp)
        .create(&repo, "feat-copy", None, &env_for("feat-copy"))
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(created.path.join(".env")).unwrap(),
        "SECRET=1\n"
    );
    assert_eq!(
        std::fs::read_to_string(created.path.join("init_ran.txt")).unwrap(),
        "feat-copy\n"
    );
}

#[test]
fn test_failing_init_script_does_not_fail_create() {
    let tmp = TempDir::new().unwrap();
    let repo = init_repo(tmp.path(), "repo");
    std::fs::write(repo.join(".agent_hub_init"), "exit 3\n").unwrap();

    let created = manager(&tmp)
        .create(&repo, "feat-init-fails", None, &env_for("feat-init-fails"))
        .unwrap();
    assert!(created.path.is_dir());
}

#[test]
fn test_delete_runs_teardown_and_removes_branch() {
    let tmp = TempDir::new().unwrap();
    let repo = init_repo(tmp.path(), "repo");
    let record = tmp.path().join("teardown.txt");
    std::fs::write(
        repo.join(".agent_hub_teardown"),
        format!("echo \"$AGENT_HUB_BRANCH_NAME\" > {}\n", record.display()),
    )
    .unwrap();
    let manager = manager(&tmp);
    let created = manager
        .create(&repo, "feature-2", None, &env_for("feature-2"))
        .unwrap();
    std::fs::write(created.path.join("scratch.txt"), "untracked").unwrap();

    manager
        .delete(&created.path, "feature-2", &env_for("feature-2"))
        .unwrap();

    assert!(!created.path.exists());
    assert!(!branch_exists(&repo, "feature-2"));
    assert_eq!(std::fs::read_to_string(&record).unwrap(), "feature-2\n");
    assert!(repo.join("README.md").is_file());
}

#[test]
fn test_delete_refuses_primary_repository() {
    let tmp = TempDir::new().unwrap();
    let repo = init_repo(tmp.path(), "repo");
    std::fs::create_dir_all(tmp.path().join("worktrees")).unwrap();

    let err = manager(&tmp).delete(&repo, "main", &ScriptEnv::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorktreeSafetyError>(),
        Some(WorktreeSafetyError::OutsideBase { .. })
    ));
    assert!(repo.join(".git").is_dir());
}

#[test]
fn test_delete_refuses_repository_nested_in_base() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("worktrees");
    std::fs::create_dir_all(&base).unwrap();
    let nested = init_repo(&base, "nested");

    let err = manager(&tmp)
        .delete(&nested, "main", &ScriptEnv::default())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorktreeSafetyError>(),
        Some(WorktreeSafetyError::NotAWorktree { .. })
    ));
    assert!(nested.join("README.md").is_file());
}

#[test]
fn test_delete_refuses_unmarked_worktree_and_list_reports_it() {
    let tmp = TempDir::new().unwrap();
    let repo = init_repo(tmp.path(), "repo");
    let manager = manager(&tmp);
    let managed = manager
        .create(&repo, "managed", None, &env_for("managed"))
        .unwrap();

    let manual = tmp.path().join("worktrees").join("manual");
    git(
        &repo,
        &["worktree", "add", "-q", "-b", "manual", manual.to_str().unwrap()],
    );

    let err = manager.delete(&manual, "manual", &ScriptEnv::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorktreeSafetyError>(),
        Some(WorktreeSafetyError::MissingMarker { .. })
    ));
    assert!(manual.join("README.md").is_file());
    assert!(branch_exists(&repo, "manual"));

    let listed = manager.list(&repo).unwrap();
    assert_eq!(listed.len(), 2);
    let by_branch = |b: &str| {
        listed
            .iter()
            .find(|w| w.branch.as_deref() == Some(b))
            .unwrap()
            .clone()
    };
    assert!(by_branch("managed").managed);
    assert_eq!(
        by_branch("managed").path.canonicalize().unwrap(),
        managed.path.canonicalize().unwrap()
    );
    assert!(!by_branch("manual").managed);
}

#[test]
fn test_detect_repo_from_worktree_finds_primary() {
    let tmp = TempDir::new().unwrap();
    let repo = init_repo(tmp.path(), "repo");
    let created = manager(&tmp)
        .create(&repo, "feature-3", None, &env_for("feature-3"))
        .unwrap();

    let (root, name) = agent_hub::git::detect_repo(&created.path).unwrap();
    assert_eq!(root.canonicalize().unwrap(), repo.canonicalize().unwrap());
    assert_eq!(name, "repo");
}
