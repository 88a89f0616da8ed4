//! Session events for pub/sub broadcasting.
//!
//! Sessions publish on a `tokio::sync::broadcast` channel so the session
//! emits without knowing who listens. The Hub drains one receiver per
//! session on its control loop; other observers may subscribe freely.

use crate::agent::notification::SessionNotification;

/// Events broadcast by a terminal session.
#[derive(Debug, Clone)]
pub enum PtyEvent {
    /// Raw output bytes, already fed to the session's screen parser.
    Output(Vec<u8>),

    /// Session was resized; PTY and parser agree on these dimensions.
    Resized {
        /// New height in rows.
        rows: u16,
        /// New width in columns.
        cols: u16,
    },

    /// A desktop-notification sequence was found in the output.
    Notification(SessionNotification),

    /// The reading loop observed end-of-stream and stopped.
    ProcessExited {
        /// Exit code if the child has been reaped by then.
        exit_code: Option<i32>,
    },
}

impl PtyEvent {
    /// Create an output event from bytes.
    #[must_use]
    pub fn output(data: impl Into<Vec<u8>>) -> Self {
        Self::Output(data.into())
    }

    /// Create a resized event.
    #[must_use]
    pub fn resized(rows: u16, cols: u16) -> Self {
        Self::Resized { rows, cols }
    }

    /// Create a notification event.
    #[must_use]
    pub fn notification(notification: SessionNotification) -> Self {
        Self::Notification(notification)
    }

    /// Create a process exited event.
    #[must_use]
    pub fn process_exited(exit_code: Option<i32>) -> Self {
        Self::ProcessExited { exit_code }
    }

    /// Returns true for output events.
    #[must_use]
    pub fn is_output(&self) -> bool {
        matches!(self, Self::Output(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        assert!(PtyEvent::output(b"hi".to_vec()).is_output());
        assert!(matches!(
            PtyEvent::resized(30, 100),
            PtyEvent::Resized { rows: 30, cols: 100 }
        ));
        assert!(matches!(
            PtyEvent::process_exited(Some(0)),
            PtyEvent::ProcessExited { exit_code: Some(0) }
        ));
        assert!(!PtyEvent::process_exited(None).is_output());
    }
}
