//! Application-wide constants for agent-hub.
//!
//! Timing values and limits are grouped by domain so the control loop,
//! the worktree scripts and the control-plane worker agree on them.

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for control-plane calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default budget for a worktree init script.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default budget for a worktree teardown script.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Default soft budget for a single interceptor call, in milliseconds.
pub const DEFAULT_INTERCEPTOR_TIMEOUT_MS: u64 = 50;

/// Undelivered control-plane acknowledgements and notifications kept for
/// retry. The oldest are dropped beyond this.
pub const MAX_PENDING_DELIVERIES: usize = 256;

/// How long closing a session waits for its reader thread before giving up.
pub const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a finished script command's output is collected before any
/// background processes still holding its pipes are left behind.
pub const SCRIPT_OUTPUT_GRACE: Duration = Duration::from_millis(200);

/// Interval used when polling child processes and threads for completion.
pub const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Polling & Heartbeat
// ============================================================================

/// Hub control loop wake-up interval when no input arrives.
pub const HUB_TICK: Duration = Duration::from_millis(50);

/// Control-plane worker command poll interval.
pub const WORKER_TICK: Duration = Duration::from_millis(100);

/// Heartbeat interval to the control-plane.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// First retry delay after a failed control-plane call.
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Upper bound for control-plane retry delay.
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);

// ============================================================================
// Terminal
// ============================================================================

/// Scrollback ring length kept by each session's screen parser.
pub const SCROLLBACK_LINES: usize = 5000;

/// Default terminal rows for sessions spawned without client dimensions.
pub const DEFAULT_ROWS: u16 = 24;

/// Default terminal columns for sessions spawned without client dimensions.
pub const DEFAULT_COLS: u16 = 80;

/// Capacity of each session's event broadcast channel.
pub const PTY_EVENT_CAPACITY: usize = 256;

// ============================================================================
// Sandbox
// ============================================================================

/// Memory ceiling for an `agent` tier Lua state.
pub const AGENT_TIER_MEMORY_LIMIT: usize = 32 * 1024 * 1024;

/// Maximum socket path length accepted by `bind` (macOS limit, Linux is 108).
pub const MAX_SOCKET_PATH: usize = 104;
