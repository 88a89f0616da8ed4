//! `agent-hub status`: configuration and whether a Hub is listening.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;

use crate::config::Config;
use crate::env::Environment;

/// Prints the status report for the current configuration.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded.
pub fn run() -> Result<()> {
    let config = Config::load()?;
    let socket = Config::socket_path()?;
    print!("{}", report(&config, &socket, socket_alive(&socket)));
    Ok(())
}

fn socket_alive(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

fn report(config: &Config, socket: &Path, alive: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "agent-hub {}", super::VERSION);
    let _ = writeln!(out, "environment:    {}", Environment::current());
    let _ = writeln!(
        out,
        "socket:         {} ({})",
        socket.display(),
        if alive { "listening" } else { "not running" }
    );
    let _ = writeln!(out, "worktree base:  {}", config.worktree_base.display());
    let _ = writeln!(
        out,
        "modules:        {}",
        config
            .modules_dir
            .as_ref()
            .map_or_else(|| "(none)".to_string(), |d| d.display().to_string())
    );
    let _ = writeln!(out, "profiles:       {}", config.profile_names().join(", "));
    let _ = writeln!(
        out,
        "control-plane:  {}",
        if config.has_control_plane() {
            config.server_url.as_str()
        } else {
            "(disabled)"
        }
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_lists_settings() {
        let mut config = Config::default();
        config.worktree_base = "/wt".into();
        let text = report(&config, Path::new("/tmp/hub.sock"), false);
        assert!(text.contains("/tmp/hub.sock (not running)"));
        assert!(text.contains("worktree base:  /wt"));
        assert!(text.contains("profiles:       default"));
        assert!(text.contains("control-plane:  (disabled)"));
    }
}
