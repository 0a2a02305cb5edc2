// src/system/process.rs

use crate::constants;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command as StdCommand, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Interpreter '{0}' could not be spawned: {1}")]
    Spawn(String, #[source] io::Error),
    #[error("Malformed environment entry '{0}', expected KEY=VALUE.")]
    MalformedEnvEntry(String),
    #[error("No su binary found on this system.")]
    SuNotFound,
}

/// Spawns an interpreter process with all three standard streams piped.
///
/// `custom_env` is an overlay of `KEY=VALUE` entries applied on top of the
/// inherited environment, and `working_dir` overrides the inherited working
/// directory when given. The returned child is the raw OS handle; the
/// session layer owns its lifecycle from here on.
pub fn spawn_interpreter(
    interpreter: &str,
    custom_env: &[String],
    working_dir: Option<&Path>,
) -> Result<Child, ProcessError> {
    let mut command = StdCommand::new(interpreter);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    for entry in custom_env {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| ProcessError::MalformedEnvEntry(entry.clone()))?;
        command.env(key, value);
    }

    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    log::debug!("Spawning interpreter: {}", interpreter);
    command
        .spawn()
        .map_err(|e| ProcessError::Spawn(interpreter.to_string(), e))
}

/// Locates an `su` binary, checking well-known locations before scanning
/// `PATH`.
pub fn find_su() -> Result<PathBuf, ProcessError> {
    for candidate in constants::SU_SEARCH_PATHS {
        let path = Path::new(candidate);
        if path.is_file() {
            log::debug!("Found su at {}", path.display());
            return Ok(path.to_path_buf());
        }
    }
    if let Ok(path_var) = env::var("PATH") {
        for dir in env::split_paths(&path_var) {
            let candidate = dir.join("su");
            if candidate.is_file() {
                log::debug!("Found su on PATH at {}", candidate.display());
                return Ok(candidate);
            }
        }
    }
    Err(ProcessError::SuNotFound)
}
