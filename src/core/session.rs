// src/core/session.rs

use super::command::Command;
use super::lock;
use crate::constants;
use crate::models::{SessionConfig, SessionStatus};
use crate::system::process::{self, ProcessError};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session could not be started: {0}")]
    Process(#[from] ProcessError),
    #[error(
        "Interpreter produced no output during the handshake. This is probably no shell, or access was denied."
    )]
    StartupFailed,
    #[error("Unable to start session, unexpected output during handshake: \"{0}\"")]
    UnexpectedOutput(String),
    #[error("Unable to add commands to a closed session.")]
    Closed,
    #[error("Command did not complete within {0:?}. The session has been torn down.")]
    CommandTimeout(Duration),
    #[error("Command terminated unexpectedly: {0}")]
    UnexpectedTermination(String),
    #[error("I/O error on the session streams: {0}")]
    Io(#[from] io::Error),
}

/// Queue state shared between enqueueing callers and the writer worker.
/// Length, lifecycle flag and waiters all live under one lock so every wake
/// predicate is checked under the lock it waits on.
#[derive(Debug)]
struct QueueState {
    commands: Vec<Arc<Command>>,
    status: SessionStatus,
}

/// Shared core of a session: configuration, the command queue, and the
/// interpreter process handle. Worker threads and commands hold references
/// to this; the public [`Session`] wraps it with the thread handles.
#[derive(Debug)]
pub(crate) struct SessionInner {
    config: SessionConfig,
    queue: Mutex<QueueState>,
    queue_cond: Condvar,
    child: Mutex<Option<Child>>,
}

impl SessionInner {
    /// Stops accepting commands, destroys the interpreter process and
    /// resolves every non-terminal command, so no waiter is left blocked.
    ///
    /// Resolution happens here rather than waiting for the reader's EOF:
    /// a grandchild of the interpreter can keep the output pipe open long
    /// after the interpreter itself is dead.
    pub(crate) fn teardown(&self, reason: &str) {
        {
            let mut queue = lock(&self.queue);
            if queue.status == SessionStatus::Open {
                queue.status = SessionStatus::Closing;
            }
        }
        self.queue_cond.notify_all();
        self.destroy_process();

        let commands: Vec<Arc<Command>> = lock(&self.queue).commands.clone();
        for command in commands {
            command.resolve_terminated("unexpected termination");
        }
        log::debug!("Session torn down: {}", reason);
    }

    /// Kills the interpreter if it is still running. The child handle stays
    /// in place; the reader reaps it at EOF.
    fn destroy_process(&self) {
        let mut child = lock(&self.child);
        if let Some(child) = child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => log::debug!("Interpreter already exited: {}", status),
                _ => {
                    if let Err(e) = child.kill() {
                        log::warn!("Failed to kill interpreter process: {}", e);
                    }
                }
            }
        }
    }

    /// Waits for the interpreter to exit and releases the OS handle.
    fn reap_process(&self) {
        let child = lock(&self.child).take();
        if let Some(mut child) = child {
            match child.wait() {
                Ok(status) => log::debug!("Interpreter exited: {}", status),
                Err(e) => log::warn!("Failed to reap interpreter process: {}", e),
            }
        }
    }
}

/// One persistent interpreter process plus its command queue and worker pair.
///
/// Commands submitted through [`Self::enqueue`] execute strictly in FIFO
/// order on the shared interpreter; their output and exit codes are
/// demultiplexed back per command by the token protocol.
#[derive(Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    stderr_drain: Option<JoinHandle<()>>,
}

impl Session {
    /// Starts a plain `sh` session.
    pub fn start_shell(config: SessionConfig) -> Result<Self, SessionError> {
        log::debug!("Starting shell");
        Self::start_custom("sh", config, &[], None)
    }

    /// Starts a root session by piping commands into `su`.
    ///
    /// The parent's `LD_LIBRARY_PATH` is carried into the overlay because
    /// some su implementations clear it, which breaks child commands.
    pub fn start_root_shell(
        config: SessionConfig,
        custom_env: &[String],
        working_dir: Option<&Path>,
    ) -> Result<Self, SessionError> {
        log::debug!("Starting root shell");
        let su = process::find_su()?;
        let mut env = custom_env.to_vec();
        if let Ok(ld_library_path) = std::env::var("LD_LIBRARY_PATH") {
            env.push(format!("LD_LIBRARY_PATH={}", ld_library_path));
        }
        Self::start_custom(&su.to_string_lossy(), config, &env, working_dir)
    }

    /// Starts a session on an arbitrary interpreter.
    ///
    /// Spawns the process, performs the startup handshake, and launches the
    /// writer/reader worker pair. The handshake writes a harmless
    /// `echo <sentinel>` line and then reads output until the sentinel comes
    /// back; EOF first means the interpreter never came up (missing binary
    /// behind a wrapper, or denied elevation), and any other non-empty line
    /// means the interpreter is incompatible, in which case the process is
    /// destroyed before the error is raised.
    pub fn start_custom(
        interpreter: &str,
        config: SessionConfig,
        custom_env: &[String],
        working_dir: Option<&Path>,
    ) -> Result<Self, SessionError> {
        log::debug!("Starting session on interpreter: {}", interpreter);
        let mut child = process::spawn_interpreter(interpreter, custom_env, working_dir)?;

        // All three pipes were requested at spawn, so take() cannot fail.
        let mut stdin = child.stdin.take().ok_or(SessionError::StartupFailed)?;
        let mut stdout =
            BufReader::new(child.stdout.take().ok_or(SessionError::StartupFailed)?);
        let stderr = BufReader::new(child.stderr.take().ok_or(SessionError::StartupFailed)?);

        writeln!(stdin, "echo {}", constants::HANDSHAKE_SENTINEL)?;
        stdin.flush()?;

        let mut line = String::new();
        loop {
            line.clear();
            if stdout.read_line(&mut line)? == 0 {
                // EOF before the sentinel: not a shell, or access denied.
                let _ = child.kill();
                let _ = child.wait();
                return Err(SessionError::StartupFailed);
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }
            if trimmed == constants::HANDSHAKE_SENTINEL {
                break;
            }
            let foreign = trimmed.to_string();
            let _ = child.kill();
            let _ = child.wait();
            return Err(SessionError::UnexpectedOutput(foreign));
        }

        let inner = Arc::new(SessionInner {
            config,
            queue: Mutex::new(QueueState {
                commands: Vec::new(),
                status: SessionStatus::Open,
            }),
            queue_cond: Condvar::new(),
            child: Mutex::new(Some(child)),
        });

        let writer = thread::Builder::new().name("shellmux-writer".to_string()).spawn({
            let inner = Arc::clone(&inner);
            move || write_commands(&inner, stdin)
        })?;
        let reader = thread::Builder::new().name("shellmux-reader".to_string()).spawn({
            let inner = Arc::clone(&inner);
            move || read_output(&inner, stdout)
        })?;
        let stderr_drain = thread::Builder::new()
            .name("shellmux-stderr".to_string())
            .spawn(move || drain_stderr(stderr))?;

        Ok(Self {
            inner,
            writer: Some(writer),
            reader: Some(reader),
            stderr_drain: Some(stderr_drain),
        })
    }

    /// Adds a command to the session queue and wakes the writer worker.
    ///
    /// The command's queue index is assigned here, under the queue lock, so
    /// indices are unique and strictly ordered even across racing callers.
    /// Returns the shared handle the caller later waits on.
    pub fn enqueue(&self, command: Command) -> Result<Arc<Command>, SessionError> {
        let mut queue = lock(&self.inner.queue);
        if queue.status != SessionStatus::Open {
            return Err(SessionError::Closed);
        }
        let id = queue.commands.len();
        command.attach(
            id,
            Arc::downgrade(&self.inner),
            self.inner.config.default_timeout,
        );
        let command = Arc::new(command);
        queue.commands.push(Arc::clone(&command));
        drop(queue);
        self.queue_cond_notify();
        Ok(command)
    }

    /// Requests close: no new commands are accepted, the writer drains the
    /// remaining queue and emits `exit`. Does not block; the session finishes
    /// asynchronously once the reader observes EOF.
    pub fn close(&self) {
        {
            let mut queue = lock(&self.inner.queue);
            if queue.status == SessionStatus::Open {
                log::debug!("Closing session");
                queue.status = SessionStatus::Closing;
            }
        }
        self.queue_cond_notify();
    }

    /// Requests close and blocks until both workers have finished, i.e. the
    /// queue is drained and the interpreter process is reaped.
    pub fn close_and_join(mut self) {
        self.close();
        self.join_workers();
    }

    /// Number of commands ever enqueued on this session.
    pub fn queue_len(&self) -> usize {
        lock(&self.inner.queue).commands.len()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SessionStatus {
        lock(&self.inner.queue).status
    }

    /// OS pid of the interpreter process, while it has not been reaped.
    pub fn interpreter_pid(&self) -> Option<u32> {
        lock(&self.inner.child).as_ref().map(Child::id)
    }

    fn queue_cond_notify(&self) {
        self.inner.queue_cond.notify_all();
    }

    fn join_workers(&mut self) {
        for handle in [
            self.writer.take(),
            self.reader.take(),
            self.stderr_drain.take(),
        ]
        .into_iter()
        .flatten()
        {
            if handle.join().is_err() {
                log::warn!("Session worker panicked");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Make sure an abandoned session does not leave the interpreter
        // running forever. Workers are detached, not joined; close() never
        // blocks.
        self.close();
    }
}

/// Writer worker: serializes queued commands onto the interpreter's input
/// stream in FIFO order, each followed by the token trailer.
fn write_commands(inner: &SessionInner, mut stdin: ChildStdin) {
    if let Err(e) = write_loop(inner, &mut stdin) {
        // Expected when the session is torn down while commands are queued.
        log::debug!("Writer worker stopped: {}", e);
    }
}

fn write_loop(inner: &SessionInner, stdin: &mut ChildStdin) -> io::Result<()> {
    let token = inner.config.token.as_str();
    let mut write = 0usize;
    loop {
        let next = {
            let mut queue = lock(&inner.queue);
            loop {
                if let Some(command) = queue.commands.get(write) {
                    break Some(Arc::clone(command));
                }
                if queue.status != SessionStatus::Open {
                    break None;
                }
                queue = inner
                    .queue_cond
                    .wait(queue)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };
        match next {
            Some(command) => {
                for line in command.lines() {
                    log::debug!("Sending command: {}", line);
                    stdin.write_all(line.as_bytes())?;
                    stdin.write_all(b"\n")?;
                }
                // The trailer is the only boundary marker the reader gets:
                // it echoes the token, the queue index and the interpreter's
                // last exit status.
                write!(stdin, "\necho {} {} $?\n", token, write)?;
                stdin.flush()?;
                command.mark_running();
                write += 1;
            }
            None => {
                stdin.write_all(b"\nexit 0\n")?;
                stdin.flush()?;
                log::debug!("Session input closed after {} commands", write);
                return Ok(());
            }
        }
    }
}

/// Reader worker: demultiplexes interpreter output back to the originating
/// commands by scanning each line for the boundary token, then reaps the
/// process and resolves stragglers once the stream hits EOF.
fn read_output(inner: &SessionInner, mut stdout: BufReader<ChildStdout>) {
    let token = inner.config.token.as_str();
    let mut read = 0usize;
    let mut current: Option<Arc<Command>> = None;
    let mut buf = String::new();

    loop {
        buf.clear();
        match stdout.read_line(&mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("Error reading session output: {}", e);
                break;
            }
        }
        let line = buf.trim_end_matches(['\r', '\n']);

        if current.is_none() {
            let queue = lock(&inner.queue);
            match queue.commands.get(read) {
                Some(command) => current = Some(Arc::clone(command)),
                None => {
                    if queue.status != SessionStatus::Open {
                        break;
                    }
                    // Pre-handshake noise or trailing output after the last
                    // command: nothing to attribute it to.
                    continue;
                }
            }
        }
        let Some(command) = current.clone() else {
            continue;
        };

        match line.find(token) {
            Some(pos) => {
                if pos > 0 {
                    command.handle_output_line(&line[..pos]);
                }
                let trailer = &line[pos..];
                if let Some((index, exit_code)) = parse_trailer(trailer, token) {
                    if index == read {
                        command.resolve_completed(exit_code);
                        log::debug!("Command {} finished with exit code {}", read, exit_code);
                        read += 1;
                        current = None;
                        continue;
                    }
                }
                // A trailer whose index does not match the read cursor (or
                // that does not parse at all) is stray interpreter echo, not
                // a protocol violation: forward it as ordinary output.
                command.handle_output_line(trailer);
            }
            None => command.handle_output_line(line),
        }
    }

    log::debug!("Read all output");
    inner.reap_process();

    // Everything the interpreter never answered resolves here, so no caller
    // stays blocked after the process is gone.
    let unresolved: Vec<Arc<Command>> = {
        let mut queue = lock(&inner.queue);
        queue.status = SessionStatus::Closed;
        queue.commands.iter().skip(read).cloned().collect()
    };
    // Wake the writer in case it is still waiting on an open queue.
    inner.queue_cond.notify_all();
    for command in unresolved {
        command.resolve_terminated("unexpected termination");
    }
}

/// Parses `<token> <index> <exitCode>` out of a trailer candidate.
fn parse_trailer(trailer: &str, token: &str) -> Option<(usize, i32)> {
    let mut fields = trailer.split(' ');
    if fields.next() != Some(token) {
        return None;
    }
    let index = fields.next()?.parse().ok()?;
    let exit_code = fields.next()?.parse().ok()?;
    Some((index, exit_code))
}

/// Drains the interpreter's error stream so the pipe can never fill up and
/// stall the process. Stderr is not part of the demux protocol; lines are
/// only logged.
fn drain_stderr(stderr: BufReader<ChildStderr>) {
    for line in stderr.lines() {
        match line {
            Ok(line) => log::debug!("Stderr: {}", line),
            Err(e) => {
                log::warn!("Error reading session stderr: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CommandState;
    use std::time::Instant;

    fn open_session() -> Session {
        Session::start_shell(SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_echo_round_trip() {
        let session = open_session();
        let command = session.enqueue(Command::simple(["echo X"])).unwrap();
        assert_eq!(command.wait_for().unwrap(), 0);
        assert_eq!(command.output().unwrap(), "X\n");
        session.close_and_join();
    }

    #[test]
    fn test_nonzero_exit_code_round_trip() {
        let session = open_session();
        // Subshell, so the session interpreter itself stays alive.
        let command = session.enqueue(Command::simple(["(exit 7)"])).unwrap();
        assert_eq!(command.wait_for().unwrap(), 7);
        session.close_and_join();
    }

    #[test]
    fn test_commands_complete_in_fifo_order() {
        let session = open_session();
        let commands: Vec<_> = (0..5)
            .map(|i| {
                session
                    .enqueue(Command::simple([format!("echo line-{}", i)]))
                    .unwrap()
            })
            .collect();
        session.close();

        for (i, command) in commands.iter().enumerate() {
            assert_eq!(command.wait_for().unwrap(), 0);
            assert_eq!(command.id(), i);
            assert_eq!(command.output().unwrap(), format!("line-{}\n", i));
        }
    }

    #[test]
    fn test_session_survives_failing_command() {
        let session = open_session();
        let failing = session.enqueue(Command::simple(["false"])).unwrap();
        let after = session.enqueue(Command::simple(["echo after"])).unwrap();
        assert_eq!(failing.wait_for().unwrap(), 1);
        assert_eq!(after.wait_for().unwrap(), 0);
        assert_eq!(after.output().unwrap(), "after\n");
        session.close_and_join();
    }

    #[test]
    fn test_multiline_command_output() {
        let session = open_session();
        let command = session
            .enqueue(Command::simple(["echo one", "echo two"]))
            .unwrap();
        assert_eq!(command.wait_for().unwrap(), 0);
        assert_eq!(command.output().unwrap(), "one\ntwo\n");
        session.close_and_join();
    }

    #[test]
    fn test_enqueue_after_close_is_rejected() {
        let session = open_session();
        session.close();
        let result = session.enqueue(Command::simple(["echo never"]));
        assert!(matches!(result, Err(SessionError::Closed)));
    }

    #[test]
    fn test_unexpected_handshake_output_fails_startup() {
        // `cat` echoes the handshake line itself back instead of executing it.
        let result = Session::start_custom("cat", SessionConfig::default(), &[], None);
        assert!(matches!(result, Err(SessionError::UnexpectedOutput(_))));
    }

    #[test]
    fn test_missing_interpreter_fails_startup() {
        let result = Session::start_custom(
            "/definitely/not/a/shell",
            SessionConfig::default(),
            &[],
            None,
        );
        assert!(matches!(
            result,
            Err(SessionError::Process(ProcessError::Spawn(_, _)))
        ));
    }

    #[test]
    fn test_interpreter_death_terminates_outstanding_commands() {
        let session = open_session();
        let dying = session.enqueue(Command::simple(["kill -9 $$"])).unwrap();
        let queued = session.enqueue(Command::simple(["echo never"])).unwrap();

        let started = Instant::now();
        assert!(matches!(
            dying.wait_for(),
            Err(SessionError::UnexpectedTermination(_))
        ));
        assert!(matches!(
            queued.wait_for(),
            Err(SessionError::UnexpectedTermination(_))
        ));
        // Both resolve well before any timeout could fire.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_command_timeout_tears_down_the_session() {
        let session = open_session();
        let slow = session
            .enqueue(Command::simple(["sleep 5"]).timeout(Duration::from_millis(100)))
            .unwrap();
        let queued = session.enqueue(Command::simple(["echo never"])).unwrap();

        assert!(matches!(
            slow.wait_for(),
            Err(SessionError::CommandTimeout(_))
        ));
        assert_eq!(slow.state(), CommandState::TimedOut);

        // The teardown cascades: the queued command resolves within a
        // bounded delay instead of waiting out its own timeout.
        let started = Instant::now();
        assert!(matches!(
            queued.wait_for(),
            Err(SessionError::UnexpectedTermination(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_sessions_with_distinct_tokens_are_independent() {
        let first = Session::start_shell(SessionConfig::default().with_token("TOK-A#1")).unwrap();
        let second = Session::start_shell(SessionConfig::default().with_token("TOK-B#2")).unwrap();

        let on_first = first.enqueue(Command::simple(["echo from-first"])).unwrap();
        let on_second = second
            .enqueue(Command::simple(["echo from-second"]))
            .unwrap();

        assert_eq!(on_first.wait_for().unwrap(), 0);
        assert_eq!(on_second.wait_for().unwrap(), 0);
        assert_eq!(on_first.output().unwrap(), "from-first\n");
        assert_eq!(on_second.output().unwrap(), "from-second\n");

        first.close_and_join();
        second.close_and_join();
    }

    #[test]
    fn test_close_and_join_reaps_the_interpreter() {
        let session = open_session();
        let command = session.enqueue(Command::simple(["echo done"])).unwrap();
        assert_eq!(command.wait_for().unwrap(), 0);

        let inner = Arc::clone(&session.inner);
        session.close_and_join();
        assert_eq!(lock(&inner.queue).status, SessionStatus::Closed);
        assert!(lock(&inner.child).is_none());
    }

    #[test]
    fn test_token_inside_output_line_truncates_at_boundary() {
        // Known protocol limitation: the first occurrence of the token in a
        // line is treated as the boundary. The echoed prefix survives as
        // output and the colliding remainder is consumed as the trailer.
        let session =
            Session::start_shell(SessionConfig::default().with_token("BOUNDARY")).unwrap();
        let command = session
            .enqueue(Command::simple(["echo prefix-BOUNDARY 0 0"]))
            .unwrap();
        assert_eq!(command.wait_for().unwrap(), 0);
        assert_eq!(command.output().unwrap(), "prefix-\n");
        session.close_and_join();
    }
}
