//! Trust tiers and capability objects for extension code.
//!
//! A module never reaches the host directly. It is handed a
//! [`Capabilities`] value built for its [`TrustTier`], and every primitive
//! exposed to it (see `lua::primitives`) is implemented in terms of that value.
//!
//! | Tier    | Filesystem                       | Spawn | Network | Load modules | Actions | Intercept |
//! |---------|----------------------------------|-------|---------|--------------|---------|-----------|
//! | `core`  | full                             | yes   | yes     | yes          | yes     | yes       |
//! | `user`  | full                             | yes   | yes     | yes          | yes     | yes       |
//! | `agent` | read-only, scoped to one dir     | no    | no      | no           | no      | no        |
//!
//! Anything added to the `agent` column widens the sandbox and needs the
//! same scrutiny as an escape.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Capability level of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    /// Built into the hub.
    Core,
    /// Installed by the user.
    User,
    /// Written by an agent.
    Agent,
}

impl TrustTier {
    /// Whether this tier gets unrestricted primitives.
    pub fn is_trusted(self) -> bool {
        matches!(self, Self::Core | Self::User)
    }
}

impl std::fmt::Display for TrustTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Core => "core",
            Self::User => "user",
            Self::Agent => "agent",
        })
    }
}

impl std::str::FromStr for TrustTier {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "core" => Ok(Self::Core),
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            other => Err(SandboxError::UnknownTier(other.to_string())),
        }
    }
}

/// Refusals raised by capability checks.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SandboxError {
    /// Path contains a `..` component.
    #[error("path '{0}' contains parent-directory traversal")]
    Traversal(String),
    /// Path resolves outside the scoped directory.
    #[error("path '{path}' is outside {root}")]
    OutsideScope {
        /// Requested path.
        path: String,
        /// Scope root.
        root: PathBuf,
    },
    /// Path contains a NUL byte or is otherwise unusable.
    #[error("invalid path '{0}'")]
    InvalidPath(String),
    /// Write attempted through a read-only view.
    #[error("filesystem is read-only for this module")]
    ReadOnly,
    /// Capability not granted to this tier.
    #[error("capability '{capability}' is not available to {tier} modules")]
    Denied {
        /// Capability name.
        capability: Capability,
        /// Tier of the caller.
        tier: TrustTier,
    },
    /// Unknown tier name.
    #[error("unknown trust tier '{0}'")]
    UnknownTier(String),
    /// Underlying I/O error on an allowed path.
    #[error("{0}")]
    Io(String),
}

/// Individually grantable capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Writing files.
    FsWrite,
    /// Spawning processes.
    ProcessSpawn,
    /// Network access.
    Network,
    /// Loading other modules or code strings.
    ModuleLoading,
    /// Registering actions.
    RegisterActions,
    /// Registering interceptors.
    Intercept,
    /// Reloading modules.
    Reload,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::FsWrite => "fs.write",
            Self::ProcessSpawn => "process.spawn",
            Self::Network => "network",
            Self::ModuleLoading => "module_loading",
            Self::RegisterActions => "actions.register",
            Self::Intercept => "hooks.intercept",
            Self::Reload => "modules.reload",
        })
    }
}

/// Read-only view of one directory tree.
#[derive(Debug, Clone)]
pub struct ScopedFs {
    root: PathBuf,
    canonical_root: PathBuf,
}

impl ScopedFs {
    /// View rooted at `root`, which must exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let root = root.into();
        let canonical_root = root
            .canonicalize()
            .map_err(|e| SandboxError::Io(format!("{}: {e}", root.display())))?;
        Ok(Self {
            root,
            canonical_root,
        })
    }

    /// Scope root (canonical).
    pub fn root(&self) -> &Path {
        &self.canonical_root
    }

    /// Maps a requested path to a host path inside the scope.
    ///
    /// Relative paths are taken from the root. Absolute paths must already
    /// be inside it. Any `..` component is rejected outright, and existing
    /// paths are canonicalized so a symlink cannot lead outside.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, SandboxError> {
        if requested.contains('\0') {
            return Err(SandboxError::InvalidPath(requested.escape_default().to_string()));
        }
        let path = Path::new(requested);
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(SandboxError::Traversal(requested.to_string()));
        }

        let outside = || SandboxError::OutsideScope {
            path: requested.to_string(),
            root: self.canonical_root.clone(),
        };

        let relative = if path.is_absolute() {
            path.strip_prefix(&self.canonical_root)
                .or_else(|_| path.strip_prefix(&self.root))
                .map_err(|_| outside())?
        } else {
            path
        };
        let candidate = self.canonical_root.join(relative);

        match candidate.canonicalize() {
            Ok(real) if real.starts_with(&self.canonical_root) => Ok(real),
            Ok(_) => Err(outside()),
            Err(_) => Ok(candidate),
        }
    }

    /// Reads a file as UTF-8.
    pub fn read_to_string(&self, requested: &str) -> Result<String, SandboxError> {
        let path = self.resolve(requested)?;
        fs::read_to_string(&path).map_err(|e| SandboxError::Io(format!("{requested}: {e}")))
    }

    /// Whether a path exists inside the scope. Out-of-scope paths report false.
    pub fn exists(&self, requested: &str) -> bool {
        self.resolve(requested).is_ok_and(|p| p.exists())
    }

    /// Sorted entry names of a directory.
    pub fn list(&self, requested: &str) -> Result<Vec<String>, SandboxError> {
        let path = self.resolve(requested)?;
        let entries = fs::read_dir(&path).map_err(|e| SandboxError::Io(format!("{requested}: {e}")))?;
        let mut names: Vec<String> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Always refused; paths are still validated first so escapes report as such.
    pub fn write(&self, requested: &str, _content: &str) -> Result<(), SandboxError> {
        self.resolve(requested)?;
        Err(SandboxError::ReadOnly)
    }
}

/// Filesystem access granted to a module.
#[derive(Debug, Clone)]
pub enum FsCapability {
    /// Unrestricted host filesystem.
    Full,
    /// Read-only view of one directory.
    Scoped(ScopedFs),
    /// No filesystem access.
    Denied,
}

impl FsCapability {
    /// Reads a file.
    pub fn read_to_string(&self, path: &str) -> Result<String, SandboxError> {
        match self {
            Self::Full => fs::read_to_string(path).map_err(|e| SandboxError::Io(format!("{path}: {e}"))),
            Self::Scoped(scoped) => scoped.read_to_string(path),
            Self::Denied => Err(SandboxError::OutsideScope {
                path: path.to_string(),
                root: PathBuf::new(),
            }),
        }
    }

    /// Writes a file, creating parent directories.
    pub fn write(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        match self {
            Self::Full => {
                let target = Path::new(path);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| SandboxError::Io(e.to_string()))?;
                }
                fs::write(target, content).map_err(|e| SandboxError::Io(format!("{path}: {e}")))
            }
            Self::Scoped(scoped) => scoped.write(path, content),
            Self::Denied => Err(SandboxError::ReadOnly),
        }
    }

    /// Whether a path exists.
    pub fn exists(&self, path: &str) -> bool {
        match self {
            Self::Full => Path::new(path).exists(),
            Self::Scoped(scoped) => scoped.exists(path),
            Self::Denied => false,
        }
    }

    /// Directory listing.
    pub fn list(&self, path: &str) -> Result<Vec<String>, SandboxError> {
        match self {
            Self::Full => {
                let mut names: Vec<String> = fs::read_dir(path)
                    .map_err(|e| SandboxError::Io(format!("{path}: {e}")))?
                    .flatten()
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect();
                names.sort();
                Ok(names)
            }
            Self::Scoped(scoped) => scoped.list(path),
            Self::Denied => Err(SandboxError::ReadOnly),
        }
    }
}

/// Capability set handed to a module's execution environment.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Tier the set was built for.
    pub tier: TrustTier,
    /// Filesystem access.
    pub fs: FsCapability,
    process_spawn: bool,
    network: bool,
    module_loading: bool,
    register_actions: bool,
    intercept: bool,
    reload: bool,
}

impl Capabilities {
    /// Capability set for `tier`.
    ///
    /// `agent_scope` is the single directory an `agent` module may read;
    /// without one the agent tier gets no filesystem at all.
    pub fn for_tier(tier: TrustTier, agent_scope: Option<&Path>) -> Result<Self, SandboxError> {
        if tier.is_trusted() {
            return Ok(Self {
                tier,
                fs: FsCapability::Full,
                process_spawn: true,
                network: true,
                module_loading: true,
                register_actions: true,
                intercept: true,
                reload: true,
            });
        }

        let fs = match agent_scope {
            Some(dir) => FsCapability::Scoped(ScopedFs::new(dir)?),
            None => FsCapability::Denied,
        };
        Ok(Self {
            tier,
            fs,
            process_spawn: false,
            network: false,
            module_loading: false,
            register_actions: false,
            intercept: false,
            reload: false,
        })
    }

    /// Whether `capability` is granted.
    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::FsWrite => matches!(self.fs, FsCapability::Full),
            Capability::ProcessSpawn => self.process_spawn,
            Capability::Network => self.network,
            Capability::ModuleLoading => self.module_loading,
            Capability::RegisterActions => self.register_actions,
            Capability::Intercept => self.intercept,
            Capability::Reload => self.reload,
        }
    }

    /// Errors with [`SandboxError::Denied`] unless `capability` is granted.
    pub fn require(&self, capability: Capability) -> Result<(), SandboxError> {
        if self.allows(capability) {
            Ok(())
        } else {
            Err(SandboxError::Denied {
                capability,
                tier: self.tier,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scoped() -> (tempfile::TempDir, ScopedFs) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("x/sub")).unwrap();
        fs::create_dir_all(dir.path().join("y")).unwrap();
        fs::write(dir.path().join("x/notes.txt"), "inside").unwrap();
        fs::write(dir.path().join("y/secret.txt"), "outside").unwrap();
        let scoped = ScopedFs::new(dir.path().join("x")).unwrap();
        (dir, scoped)
    }

    #[test]
    fn test_reads_inside_scope() {
        let (_dir, fs) = scoped();
        assert_eq!(fs.read_to_string("notes.txt").unwrap(), "inside");
        let abs = fs.root().join("notes.txt");
        assert_eq!(fs.read_to_string(abs.to_str().unwrap()).unwrap(), "inside");
        assert!(fs.exists("sub"));
        assert_eq!(fs.list(".").unwrap(), vec!["notes.txt", "sub"]);
    }

    #[test]
    fn test_parent_traversal_rejected_for_read_and_write() {
        let (dir, fs) = scoped();
        let escape = format!("{}/x/../y/secret.txt", dir.path().display());

        assert!(matches!(fs.read_to_string(&escape), Err(SandboxError::Traversal(_))));
        assert!(matches!(fs.write(&escape, "x"), Err(SandboxError::Traversal(_))));
        assert!(matches!(
            fs.read_to_string("../y/secret.txt"),
            Err(SandboxError::Traversal(_))
        ));
        assert!(matches!(fs.read_to_string("sub/../notes.txt"), Err(SandboxError::Traversal(_))));
        assert!(!fs.exists("../y"));
    }

    #[test]
    fn test_absolute_outside_scope_rejected() {
        let (dir, fs) = scoped();
        let outside = dir.path().join("y/secret.txt");

        assert!(matches!(
            fs.read_to_string(outside.to_str().unwrap()),
            Err(SandboxError::OutsideScope { .. })
        ));
        assert!(matches!(
            fs.write(outside.to_str().unwrap(), "x"),
            Err(SandboxError::OutsideScope { .. })
        ));
        assert!(matches!(fs.read_to_string("/etc/passwd"), Err(SandboxError::OutsideScope { .. })));
    }

    #[test]
    fn test_sibling_with_common_prefix_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("x")).unwrap();
        fs::create_dir_all(dir.path().join("xy")).unwrap();
        fs::write(dir.path().join("xy/f"), "no").unwrap();
        let fs = ScopedFs::new(dir.path().join("x")).unwrap();

        let sibling = fs.root().parent().unwrap().join("xy/f");
        assert!(fs.read_to_string(sibling.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_symlink_escape_rejected() {
        let (dir, fs) = scoped();
        std::os::unix::fs::symlink(dir.path().join("y"), fs.root().join("link")).unwrap();
        assert!(matches!(
            fs.read_to_string("link/secret.txt"),
            Err(SandboxError::OutsideScope { .. })
        ));
    }

    #[test]
    fn test_write_inside_scope_is_read_only() {
        let (_dir, fs) = scoped();
        assert_eq!(fs.write("new.txt", "data"), Err(SandboxError::ReadOnly));
        assert!(!fs.exists("new.txt"));
    }

    #[test]
    fn test_nul_rejected() {
        let (_dir, fs) = scoped();
        assert!(matches!(fs.read_to_string("a\0b"), Err(SandboxError::InvalidPath(_))));
    }

    #[test]
    fn test_tier_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let user = Capabilities::for_tier(TrustTier::User, None).unwrap();
        assert!(user.allows(Capability::ProcessSpawn));
        assert!(user.allows(Capability::FsWrite));

        let agent = Capabilities::for_tier(TrustTier::Agent, Some(dir.path())).unwrap();
        for cap in [
            Capability::FsWrite,
            Capability::ProcessSpawn,
            Capability::Network,
            Capability::ModuleLoading,
            Capability::RegisterActions,
            Capability::Intercept,
            Capability::Reload,
        ] {
            assert!(!agent.allows(cap), "agent tier must not get {cap}");
        }
        assert_eq!(
            agent.require(Capability::Network),
            Err(SandboxError::Denied {
                capability: Capability::Network,
                tier: TrustTier::Agent
            })
        );
        assert!(matches!(agent.fs, FsCapability::Scoped(_)));
    }

    #[test]
    fn test_agent_without_scope_has_no_fs() {
        let agent = Capabilities::for_tier(TrustTier::Agent, None).unwrap();
        assert!(agent.fs.read_to_string("/etc/hostname").is_err());
        assert!(!agent.fs.exists("/"));
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("agent".parse::<TrustTier>().unwrap(), TrustTier::Agent);
        assert!("root".parse::<TrustTier>().is_err());
    }
}
