// src/constants.rs

use std::time::Duration;

/// Default boundary token echoed after every command.
///
/// The value is inherited from the original wire protocol and was picked to
/// be unlikely to appear in legitimate command output. Sessions can override
/// it through `SessionConfig`, which also lets tests run several independent
/// sessions with distinct tokens.
pub const DEFAULT_TOKEN: &str = "F*D^W@#FGF";

/// Sentinel echoed back by a healthy interpreter during the startup handshake.
pub const HANDSHAKE_SENTINEL: &str = "Started";

/// Default per-command timeout, overridable per session and per command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Substring of `id` output that identifies a root shell.
pub const ROOT_UID_MARKER: &str = "uid=0";

/// Well-known `su` locations, probed before falling back to a `PATH` scan.
/// Some systems keep `su` in places that are not on the default `PATH`.
pub const SU_SEARCH_PATHS: &[&str] = &[
    "/sbin/su",
    "/system/bin/su",
    "/system/xbin/su",
    "/usr/bin/su",
    "/bin/su",
];
