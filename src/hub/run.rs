//! Hub control loop.
//!
//! The loop runs on the thread that owns the [`Hub`]. It ticks until a
//! `quit` op, a `Shutdown` input or the external shutdown flag (set by the
//! signal handler) stops it, then runs the shutdown sequence once.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::Result;

use crate::constants::HUB_TICK;
use crate::hub::Hub;

/// Runs the control loop until the Hub quits or `shutdown_flag` is set.
///
/// # Errors
///
/// Currently infallible; the `Result` leaves room for startup checks.
pub fn run_loop(hub: &mut Hub, shutdown_flag: &AtomicBool) -> Result<()> {
    log::info!("Hub control loop starting");

    while !hub.quit && !shutdown_flag.load(Ordering::SeqCst) {
        hub.tick();
        thread::sleep(HUB_TICK);
    }

    hub.shutdown();
    log::info!("Hub control loop exited");
    Ok(())
}

impl Hub {
    /// Runs the control loop. See [`run_loop`].
    ///
    /// # Errors
    ///
    /// Propagates errors from [`run_loop`].
    pub fn run(&mut self, shutdown_flag: &AtomicBool) -> Result<()> {
        run_loop(self, shutdown_flag)
    }
}
