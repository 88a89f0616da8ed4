//! Agent Hub CLI - runs coding agents in isolated git worktrees.
//!
//! This is the main binary entry point. See the `agent_hub` library for the
//! core functionality.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use agent_hub::commands::{self, VERSION};
use agent_hub::hub::server_comms::load_or_create_hub_id;
use agent_hub::server::ApiClient;
use agent_hub::{git, Config, Hub};
use anyhow::Result;
use clap::{Parser, Subcommand};

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

fn register_signals() -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;
    Ok(())
}

/// Runs the Hub for the repository containing the current directory until
/// a signal or a `quit` action stops it.
fn run_hub(cleanup: bool) -> Result<()> {
    register_signals()?;

    let (repo_path, repo_name) = git::detect_repo(&std::env::current_dir()?)?;
    let config = Config::load()?;
    let has_modules = config.modules_dir.is_some();
    let has_control_plane = config.has_control_plane();

    println!("Starting Agent Hub v{VERSION} for {repo_name}...");
    let mut hub = Hub::new(config, repo_path)?;
    let hub_id = load_or_create_hub_id(&Config::config_dir()?)?;
    hub.set_hub_id(hub_id.clone());

    if has_modules {
        let loaded = hub.load_modules();
        log::info!("Loaded {loaded} module(s)");
    }
    let _watcher = if has_modules {
        match hub.watch_modules() {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("Module hot reload disabled: {e:#}");
                None
            }
        }
    } else {
        None
    };

    if has_control_plane && !agent_hub::env::is_test_mode() {
        let client = ApiClient::new(
            &hub.config.server_url,
            &hub.config.token,
            &hub_id,
            hub.repo_name(),
        )?;
        hub.attach_control_plane(Box::new(client));
    }

    let socket = Config::socket_path()?;
    hub.start_socket_server(&socket)?;
    hub.set_cleanup_on_shutdown(cleanup);

    println!("Hub ready. Listening on {}", socket.display());
    log::info!("Agent Hub v{VERSION} started for {repo_name}");

    hub.run(&SHUTDOWN_FLAG)?;
    println!("Shutting down...");
    Ok(())
}

#[derive(Parser)]
#[command(name = "agent-hub")]
#[command(version = VERSION)]
#[command(about = "Local hub for coding-agent sessions in isolated git worktrees")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub for the repository containing the current directory
    Start {
        /// Delete every agent's worktree on shutdown
        #[arg(long)]
        cleanup: bool,
    },
    /// Show configuration and whether a hub is running
    Status,
    /// Print the effective configuration as JSON
    Config,
    /// Manage git worktrees
    Worktree {
        #[command(subcommand)]
        command: WorktreeCommand,
    },
    /// Submit an action to the running hub and print the resulting events
    Action {
        /// Action name (e.g. "spawn_agent", "close_agent")
        name: String,
        /// Action payload as JSON
        #[arg(long)]
        payload: Option<String>,
        /// Stop after this many milliseconds without events
        #[arg(long, default_value_t = 500)]
        idle_ms: u64,
        /// Also print the snapshot sent on connect
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum WorktreeCommand {
    /// List worktrees of the repository
    List {
        /// Repository path (defaults to the current directory)
        #[arg(long)]
        repo: Option<PathBuf>,
    },
    /// Delete a managed worktree and its branch
    Delete {
        /// Path of the worktree
        path: PathBuf,
        /// Branch checked out in the worktree
        branch: String,
    },
}

fn init_logging() {
    // AGENT_HUB_LOG_FILE or <config dir>/agent-hub.log; stderr if neither works
    let log_path = std::env::var("AGENT_HUB_LOG_FILE")
        .map(PathBuf::from)
        .ok()
        .or_else(|| Config::config_dir().ok().map(|d| d.join("agent-hub.log")));

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Some(file) = log_path.and_then(|p| std::fs::File::create(p).ok()) {
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
}

fn main() -> Result<()> {
    init_logging();

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {panic_info:?}");
        default_hook(panic_info);
    }));

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { cleanup } => run_hub(cleanup)?,
        Commands::Status => commands::status::run()?,
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Worktree { command } => match command {
            WorktreeCommand::List { repo } => commands::worktree::list(repo)?,
            WorktreeCommand::Delete { path, branch } => {
                commands::worktree::delete(&path, &branch)?;
            }
        },
        Commands::Action {
            name,
            payload,
            idle_ms,
            all,
        } => {
            let payload = commands::action::parse_payload(payload.as_deref())?;
            commands::action::run(
                &Config::socket_path()?,
                &name,
                payload,
                Duration::from_millis(idle_ms),
                all,
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_action_with_payload() {
        let cli = Cli::parse_from([
            "agent-hub",
            "action",
            "spawn_agent",
            "--payload",
            r#"{"branch":"x"}"#,
        ]);
        match cli.command {
            Commands::Action {
                name,
                payload,
                idle_ms,
                all,
            } => {
                assert_eq!(name, "spawn_agent");
                assert_eq!(payload.as_deref(), Some(r#"{"branch":"x"}"#));
                assert_eq!(idle_ms, 500);
                assert!(!all);
            }
            _ => panic!("expected action"),
        }
    }

    #[test]
    fn test_parse_start_cleanup() {
        let cli = Cli::parse_from(["agent-hub", "start", "--cleanup"]);
        assert!(matches!(cli.command, Commands::Start { cleanup: true }));
    }
}
