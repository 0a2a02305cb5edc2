// src/core/command.rs

use super::lock;
use super::session::{SessionError, SessionInner};
use crate::constants;
use crate::models::CommandState;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::{Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

lazy_static! {
    /// Extracts the pid out of one `ps` line, example:
    /// `root 2611 0.0 0.0 19408 2104 pts/2 S 13:41 0:00 bash`
    ///
    /// The "id in the second whitespace-separated field" rule matches the
    /// common toolbox/procps layouts but is environment-dependent, not
    /// guaranteed portable.
    static ref PS_PATTERN: Regex = Regex::new(r"^\S+\s+([0-9]+).*$").unwrap();
}

/// The built-in command family. The session never inspects the variant; it
/// only drives the `on_output_line`/`on_completion` hook pair.
#[derive(Debug)]
enum CommandKind {
    /// Collects every output line verbatim, plus the exit code.
    Simple { output: String },
    /// Accumulates pids of listing lines that mention the target process.
    PidList {
        process_name: String,
        pids: Vec<String>,
    },
    /// Exact-match existence probe over `ls <path>` output.
    FileExists { path: String, found: bool },
}

impl CommandKind {
    fn on_output_line(&mut self, id: usize, line: &str) {
        match self {
            Self::Simple { output } => {
                log::debug!("ID: {}, Output: {}", id, line);
                output.push_str(line);
                output.push('\n');
            }
            Self::PidList { process_name, pids } => {
                if !line.contains(process_name.as_str()) {
                    return;
                }
                match PS_PATTERN.captures(line).and_then(|c| c.get(1)) {
                    Some(pid) => {
                        log::debug!("Found pid: {}", pid.as_str());
                        pids.push(pid.as_str().to_string());
                    }
                    None => log::debug!("Matching in ps output failed: {}", line),
                }
            }
            Self::FileExists { path, found } => {
                if line.trim() == path {
                    *found = true;
                }
            }
        }
    }

    fn on_completion(&mut self, id: usize, exit_code: i32) {
        log::debug!("ID: {}, ExitCode: {}", id, exit_code);
    }
}

#[derive(Debug)]
struct CommandInner {
    /// Queue index, assigned by the session at enqueue time.
    id: usize,
    state: CommandState,
    kind: CommandKind,
    /// Back-reference to the owning session, used only to request teardown.
    session: Weak<SessionInner>,
    default_timeout: Duration,
    /// The completion hook fires at most once, on the first successful wait.
    completion_delivered: bool,
}

/// One unit of work for a [`super::session::Session`]: raw text lines to
/// send, a timeout, and a forward-only state machine observed through a
/// per-command completion signal.
///
/// A command is constructed by the caller, handed to
/// [`super::session::Session::enqueue`] (which takes ownership and returns a
/// shared handle), and queried through its accessors once
/// [`Self::wait_for`] returns.
#[derive(Debug)]
pub struct Command {
    lines: Vec<String>,
    timeout: Option<Duration>,
    inner: Mutex<CommandInner>,
    completed: Condvar,
}

impl Command {
    fn new(lines: Vec<String>, kind: CommandKind) -> Self {
        Self {
            lines,
            timeout: None,
            inner: Mutex::new(CommandInner {
                id: 0,
                state: CommandState::Pending,
                kind,
                session: Weak::new(),
                default_timeout: constants::DEFAULT_TIMEOUT,
                completion_delivered: false,
            }),
            completed: Condvar::new(),
        }
    }

    /// A generic output-collecting command. Each element of `lines` is sent
    /// as one raw input line, verbatim.
    pub fn simple<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            lines.into_iter().map(Into::into).collect(),
            CommandKind::Simple {
                output: String::new(),
            },
        )
    }

    /// A process-listing command that collects the pids of every `ps` line
    /// mentioning `process_name`.
    pub fn pid_list(process_name: impl Into<String>) -> Self {
        Self::new(
            vec!["ps".to_string()],
            CommandKind::PidList {
                process_name: process_name.into(),
                pids: Vec::new(),
            },
        )
    }

    /// A file-existence probe: lists the exact path and succeeds iff one
    /// returned line, trimmed, equals it.
    pub fn file_exists(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(
            vec![format!("ls {}", path)],
            CommandKind::FileExists { path, found: false },
        )
    }

    /// Overrides the session-wide default timeout for this command.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The raw input lines this command sends to the interpreter.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Queue index assigned at enqueue time.
    pub fn id(&self) -> usize {
        lock(&self.inner).id
    }

    /// A snapshot of the command's current state.
    pub fn state(&self) -> CommandState {
        lock(&self.inner).state.clone()
    }

    /// Collected output of a [`Self::simple`] command; `None` for other
    /// variants.
    pub fn output(&self) -> Option<String> {
        match &lock(&self.inner).kind {
            CommandKind::Simple { output } => Some(output.clone()),
            _ => None,
        }
    }

    /// Pids collected by a [`Self::pid_list`] command, in discovery order.
    pub fn pids(&self) -> Vec<String> {
        match &lock(&self.inner).kind {
            CommandKind::PidList { pids, .. } => pids.clone(),
            _ => Vec::new(),
        }
    }

    /// Whether a [`Self::file_exists`] probe matched its path.
    pub fn found(&self) -> bool {
        match &lock(&self.inner).kind {
            CommandKind::FileExists { found, .. } => *found,
            _ => false,
        }
    }

    /// Blocks until the command reaches a terminal state or its timeout
    /// elapses, and returns the exit code on normal completion.
    ///
    /// A timeout is fatal to the whole session: the interpreter process is
    /// destroyed, every other outstanding command resolves shortly after,
    /// and `CommandTimeout` is returned here. On the first successful wait
    /// the completion hook fires before control returns to the caller.
    pub fn wait_for(&self) -> Result<i32, SessionError> {
        let timeout = self.effective_timeout();
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.inner);
        loop {
            match inner.state.clone() {
                CommandState::Completed(exit_code) => {
                    if !inner.completion_delivered {
                        inner.completion_delivered = true;
                        let id = inner.id;
                        inner.kind.on_completion(id, exit_code);
                    }
                    return Ok(exit_code);
                }
                CommandState::TimedOut => return Err(SessionError::CommandTimeout(timeout)),
                CommandState::Terminated(reason) => {
                    return Err(SessionError::UnexpectedTermination(reason));
                }
                CommandState::Pending | CommandState::Running => {
                    let now = Instant::now();
                    if now >= deadline {
                        let id = inner.id;
                        inner.state = CommandState::TimedOut;
                        let session = inner.session.clone();
                        drop(inner);
                        self.completed.notify_all();
                        log::debug!("Command {} did not finish, because of Timeout", id);
                        if let Some(session) = session.upgrade() {
                            session.teardown("command timeout");
                        }
                        return Err(SessionError::CommandTimeout(timeout));
                    }
                    let (guard, _) = self
                        .completed
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    inner = guard;
                }
            }
        }
    }

    fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(lock(&self.inner).default_timeout)
    }

    /// Binds the command to its session slot. Called once, under the queue
    /// lock, when the command enters the queue.
    pub(crate) fn attach(&self, id: usize, session: Weak<SessionInner>, default_timeout: Duration) {
        let mut inner = lock(&self.inner);
        inner.id = id;
        inner.session = session;
        inner.default_timeout = default_timeout;
    }

    /// Marks the command as sent to the interpreter.
    pub(crate) fn mark_running(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == CommandState::Pending {
            inner.state = CommandState::Running;
        }
    }

    /// Forwards one demultiplexed output line to the variant hook.
    pub(crate) fn handle_output_line(&self, line: &str) {
        let mut inner = lock(&self.inner);
        let id = inner.id;
        inner.kind.on_output_line(id, line);
    }

    /// Resolves the command with its exit code and signals every waiter.
    /// A no-op if the command already reached a terminal state.
    pub(crate) fn resolve_completed(&self, exit_code: i32) {
        let mut inner = lock(&self.inner);
        if inner.state.is_terminal() {
            return;
        }
        inner.state = CommandState::Completed(exit_code);
        drop(inner);
        self.completed.notify_all();
    }

    /// Resolves the command as terminated without an exit status. A no-op if
    /// the command already reached a terminal state.
    pub(crate) fn resolve_terminated(&self, reason: &str) {
        let mut inner = lock(&self.inner);
        if inner.state.is_terminal() {
            return;
        }
        log::debug!("Command {} did not finish, because of {}", inner.id, reason);
        inner.state = CommandState::Terminated(reason.to_string());
        drop(inner);
        self.completed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_command_collects_output_and_exit_code() {
        let command = Command::simple(["echo X"]);
        command.handle_output_line("X");
        command.resolve_completed(0);

        assert_eq!(command.wait_for().unwrap(), 0);
        assert_eq!(command.output().unwrap(), "X\n");
    }

    #[test]
    fn test_nonzero_exit_code_is_reported() {
        let command = Command::simple(["exit 7"]);
        command.resolve_completed(7);
        assert_eq!(command.wait_for().unwrap(), 7);
    }

    #[test]
    fn test_pid_list_extracts_pids_in_discovery_order() {
        let command = Command::pid_list("myd");
        command.handle_output_line("root 100 0.0 0.0 19408 2104 pts/2 S 13:41 0:00 myd");
        command.handle_output_line("root 9999 0.0 0.0 19408 2104 pts/2 S 13:41 0:00 other");
        command.handle_output_line("user 205 0.1 0.0 20000 3000 pts/3 S 13:42 0:00 myd --flag");
        command.resolve_completed(0);

        assert_eq!(command.pids(), vec!["100", "205"]);
    }

    #[test]
    fn test_pid_list_ignores_unparseable_lines() {
        let command = Command::pid_list("myd");
        command.handle_output_line("myd"); // name only, no pid column
        assert!(command.pids().is_empty());
    }

    #[test]
    fn test_file_exists_requires_exact_trimmed_match() {
        let command = Command::file_exists("/tmp/probe");
        command.handle_output_line("/tmp/probe.bak");
        assert!(!command.found());
        command.handle_output_line("  /tmp/probe  ");
        assert!(command.found());
    }

    #[test]
    fn test_state_only_moves_forward() {
        let command = Command::simple(["true"]);
        command.resolve_completed(0);
        command.resolve_terminated("too late");
        assert_eq!(command.state(), CommandState::Completed(0));
    }

    #[test]
    fn test_wait_for_times_out_without_resolution() {
        let command = Command::simple(["sleep 60"]).timeout(Duration::from_millis(50));
        let started = Instant::now();
        let result = command.wait_for();
        assert!(matches!(result, Err(SessionError::CommandTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(command.state(), CommandState::TimedOut);
    }

    #[test]
    fn test_completion_hook_fires_once() {
        let command = Command::simple(["true"]);
        command.resolve_completed(0);
        assert_eq!(command.wait_for().unwrap(), 0);
        // Second wait returns immediately with the same result.
        assert_eq!(command.wait_for().unwrap(), 0);
    }
}
