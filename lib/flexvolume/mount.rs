use std::{
    ffi::OsString,
    io::Read as _,
    path::PathBuf,
    process::{Command, Stdio},
};

use tracing::{debug, error, info, instrument};

use super::Outcome;

/// At most this much of the session's stderr makes it into a failure reply.
const STDERR_LIMIT: u64 = 1023;

/// Arguments of `mount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Directory to mount on.
    pub mount_point: PathBuf,
    /// The orchestrator's JSON options blob. Logged, otherwise unused.
    pub options: String,
}

/// How to start the filesystem session: `<program> [args...] serve -o <options> <mount-point>`.
#[derive(Debug, Clone)]
pub struct SessionCommand {
    /// Usually the driver's own executable.
    pub program: OsString,
    /// Placed before `serve`.
    pub args: Vec<OsString>,
    /// Joined with commas after `-o`. Omitted when empty.
    pub mount_options: Vec<String>,
}

impl SessionCommand {
    fn command(&self, request: &MountRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg("serve");
        if !self.mount_options.is_empty() {
            cmd.arg("-o").arg(self.mount_options.join(","));
        }
        cmd.arg(&request.mount_point);
        cmd
    }
}

/// Start the filesystem session and wait until it has either mounted and detached, or failed.
///
/// The session reports mount errors on its stderr before detaching, so whatever it wrote there
/// becomes the failure message.
#[instrument(skip(session))]
pub fn mount(request: &MountRequest, session: &SessionCommand) -> Outcome {
    debug!(options = %request.options, "mount options from orchestrator");

    let mut child = match session
        .command(request)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!("Failed to spawn the filesystem session: {e}");
            return Outcome::failure(format!("failed to start filesystem session: {e}"));
        }
    };

    let mut stderr = Vec::new();
    if let Some(pipe) = child.stderr.take() {
        if let Err(e) = pipe.take(STDERR_LIMIT).read_to_end(&mut stderr) {
            error!("Failed to read filesystem session stderr: {e}");
        }
        // Dropping the pipe here means a session that keeps writing gets EPIPE instead of
        // blocking us forever.
    }

    let status = match child.wait() {
        Ok(status) => status,
        Err(e) => {
            error!("Failed to wait for the filesystem session: {e}");
            return Outcome::failure(format!("failed to wait for filesystem session: {e}"));
        }
    };

    if status.success() {
        info!(mount_point = %request.mount_point.display(), "Mounted.");
        Outcome::success()
    } else {
        let message = String::from_utf8_lossy(&stderr).trim_end().to_owned();
        error!(%status, %message, "Filesystem session failed.");
        Outcome::failure(message)
    }
}
