// src/core/toolbox.rs

use super::command::Command;
use super::session::{Session, SessionError};
use crate::constants;
use crate::models::RebootAction;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolboxError {
    #[error("'{0}' is not a file. Block copy works on plain files only.")]
    NotAFile(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Higher-level operations expressed purely as commands submitted to one
/// [`Session`]. Nothing here touches the wire protocol directly.
#[derive(Debug)]
pub struct Toolbox<'a> {
    session: &'a Session,
}

impl<'a> Toolbox<'a> {
    /// Binds the toolbox to the session its commands will run on.
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Checks whether the interpreter runs with root privileges.
    ///
    /// (commands: id)
    pub fn is_root_access_given(&self) -> Result<bool, ToolboxError> {
        let id = self.session.enqueue(Command::simple(["id"]))?;
        id.wait_for()?;
        Ok(id
            .output()
            .unwrap_or_default()
            .contains(constants::ROOT_UID_MARKER))
    }

    /// Checks whether at least one process with the given name is running.
    ///
    /// (commands: ps)
    pub fn is_process_running(&self, process_name: &str) -> Result<bool, ToolboxError> {
        let listing = self.session.enqueue(Command::pid_list(process_name))?;
        listing.wait_for()?;
        Ok(!listing.pids().is_empty())
    }

    /// Kills every running process with the given name. Returns `true` iff
    /// at least one matching process was found and the kill exited zero.
    ///
    /// (commands: ps, kill)
    pub fn kill_all(&self, process_name: &str) -> Result<bool, ToolboxError> {
        log::debug!("Killing process {}", process_name);
        let listing = self.session.enqueue(Command::pid_list(process_name))?;
        listing.wait_for()?;

        let pids = listing.pids();
        if pids.is_empty() {
            return Ok(false);
        }
        let kill = self
            .session
            .enqueue(Command::simple([kill_command_text(&pids)]))?;
        Ok(kill.wait_for()? == 0)
    }

    /// Checks whether a file exists on the interpreter's filesystem.
    ///
    /// (commands: ls)
    pub fn file_exists(&self, path: &str) -> Result<bool, ToolboxError> {
        let probe = self.session.enqueue(Command::file_exists(path))?;
        probe.wait_for()?;
        Ok(probe.found())
    }

    /// Copies a file with `dd`, falling back to a `cat` redirection when the
    /// block copy fails. Returns `true` iff either command exited zero.
    ///
    /// (commands: dd, cat)
    pub fn copy_file(&self, source: &str, destination: &str) -> Result<bool, ToolboxError> {
        // dd only copies plain files, and without issuing commands of our
        // own the best available check is a trailing path separator.
        if source.ends_with('/') {
            return Err(ToolboxError::NotAFile(source.to_string()));
        }
        if destination.ends_with('/') {
            return Err(ToolboxError::NotAFile(destination.to_string()));
        }

        let dd = self
            .session
            .enqueue(Command::simple([format!(
                "dd if={} of={}",
                source, destination
            )]))?;
        if dd.wait_for()? == 0 {
            return Ok(true);
        }

        log::debug!("dd failed, falling back to cat");
        let cat = self
            .session
            .enqueue(Command::simple([format!(
                "cat {} > {}",
                source, destination
            )]))?;
        Ok(cat.wait_for()? == 0)
    }

    /// Reboots or shuts down the device. `HotReboot` restarts userland by
    /// killing the system server instead of issuing a reboot command.
    ///
    /// (commands: reboot, or ps + kill for `HotReboot`)
    pub fn reboot(&self, action: RebootAction) -> Result<bool, ToolboxError> {
        if action == RebootAction::HotReboot {
            return self.kill_all("system_server");
        }
        let command = match action {
            RebootAction::Shutdown => "reboot -p",
            RebootAction::Recovery => "reboot recovery",
            RebootAction::Reboot | RebootAction::HotReboot => "reboot",
        };
        let reboot = self.session.enqueue(Command::simple([command]))?;
        Ok(reboot.wait_for()? == 0)
    }
}

/// Builds the kill command for a set of pids, space-joined in discovery
/// order. Example: `kill -9 1234 1222 5343`.
fn kill_command_text(pids: &[String]) -> String {
    format!("kill -9 {}", pids.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionConfig;
    use std::io::Write;

    fn open_session() -> Session {
        Session::start_shell(SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_root_marker_matches_only_uid_zero() {
        assert!("uid=0(root) gid=0(root) groups=0(root)".contains(constants::ROOT_UID_MARKER));
        assert!(!"uid=1000(user) gid=1000(user)".contains(constants::ROOT_UID_MARKER));
    }

    #[test]
    fn test_kill_command_text_joins_pids_in_order() {
        let pids = vec!["100".to_string(), "205".to_string()];
        assert_eq!(kill_command_text(&pids), "kill -9 100 205");
    }

    #[test]
    fn test_root_check_matches_actual_uid() {
        let session = open_session();
        let toolbox = Toolbox::new(&session);

        let reported = toolbox.is_root_access_given().unwrap();
        let expected = std::process::Command::new("id")
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains("uid=0"))
            .unwrap_or(false);
        assert_eq!(reported, expected);
        session.close_and_join();
    }

    #[test]
    fn test_file_exists_for_real_and_missing_paths() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"probe").unwrap();
        file.flush().unwrap();
        let path = file.path().to_string_lossy().to_string();

        let session = open_session();
        let toolbox = Toolbox::new(&session);
        assert!(toolbox.file_exists(&path).unwrap());
        assert!(!toolbox.file_exists("/definitely/not/there").unwrap());
        session.close_and_join();
    }

    #[test]
    fn test_copy_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let destination = dir.path().join("copy.bin");
        std::fs::write(&source, b"payload bytes").unwrap();

        let session = open_session();
        let toolbox = Toolbox::new(&session);
        let copied = toolbox
            .copy_file(
                &source.to_string_lossy(),
                &destination.to_string_lossy(),
            )
            .unwrap();
        session.close_and_join();

        assert!(copied);
        assert_eq!(std::fs::read(&destination).unwrap(), b"payload bytes");
    }

    #[test]
    fn test_copy_rejects_directories_before_sending_anything() {
        let session = open_session();
        let toolbox = Toolbox::new(&session);

        let result = toolbox.copy_file("/tmp/dir/", "/tmp/file");
        assert!(matches!(result, Err(ToolboxError::NotAFile(_))));
        let result = toolbox.copy_file("/tmp/file", "/tmp/dir/");
        assert!(matches!(result, Err(ToolboxError::NotAFile(_))));

        // The rejection happens before any command reaches the queue.
        assert_eq!(session.queue_len(), 0);
        session.close_and_join();
    }

    #[test]
    fn test_kill_all_without_matches_issues_no_kill() {
        let session = open_session();
        let toolbox = Toolbox::new(&session);
        let killed = toolbox.kill_all("no-such-process-xyzzy").unwrap();
        assert!(!killed);
        // Only the listing command ran; no kill was composed.
        assert_eq!(session.queue_len(), 1);
        session.close_and_join();
    }
}
