// src/models.rs

use crate::constants;
use std::time::Duration;

/// Per-session protocol configuration.
///
/// Both values used to be process-wide constants in older designs; carrying
/// them per session means independent sessions (and their tests) can never
/// interfere with each other.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Boundary token inserted into every command trailer.
    pub token: String,
    /// Timeout applied to commands that do not set their own.
    pub default_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token: constants::DEFAULT_TOKEN.to_string(),
            default_timeout: constants::DEFAULT_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Replaces the boundary token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Replaces the session-wide default command timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Lifecycle of a single command. The state only ever moves forward:
/// `Pending` → `Running` → one terminal state. A command is never re-queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandState {
    /// Enqueued, not yet sent to the interpreter.
    Pending,
    /// Sent to the interpreter, trailer not seen yet.
    Running,
    /// Trailer observed; carries the command's exit code.
    Completed(i32),
    /// The caller's deadline elapsed before the trailer arrived.
    TimedOut,
    /// The session ended before the command could complete.
    Terminated(String),
}

impl CommandState {
    /// Whether the command has reached a state it can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed(_) | Self::TimedOut | Self::Terminated(_)
        )
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Accepting new commands, workers running.
    Open,
    /// No new commands accepted; the writer drains the queue and exits.
    Closing,
    /// Process reaped, every queued command resolved.
    Closed,
}

/// Actions understood by `Toolbox::reboot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootAction {
    /// Restart the userland by killing the system server process.
    HotReboot,
    /// Full reboot.
    Reboot,
    /// Power off.
    Shutdown,
    /// Reboot into the recovery system.
    Recovery,
}
