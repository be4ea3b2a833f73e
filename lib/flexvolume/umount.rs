use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use tracing::{info, instrument, warn};

use super::Outcome;

/// Arguments of `umount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UmountRequest {
    /// Directory to unmount and remove.
    pub mount_point: PathBuf,
}

/// Force-unmount the mount point with `<program> -f <mount-point>`, then remove the now empty
/// mount point directory.
#[instrument]
pub fn umount(request: &UmountRequest, program: &Path) -> Outcome {
    let result = Command::new(program)
        .arg("-f")
        .arg(&request.mount_point)
        .stdin(Stdio::null())
        .output();

    match result {
        Ok(output) if output.status.success() => {
            info!(mount_point = %request.mount_point.display(), "Unmounted.");
        }
        Ok(output) => {
            warn!(
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                "Unmount utility failed."
            );
            return Outcome::failure("umount failed");
        }
        Err(e) => {
            warn!(program = %program.display(), "Failed to run unmount utility: {e}");
            return Outcome::failure("umount failed");
        }
    }

    if let Err(e) = std::fs::remove_dir(&request.mount_point) {
        // The volume is gone either way; the orchestrator cleans up leftovers.
        warn!(mount_point = %request.mount_point.display(), "Failed to remove mount point: {e}");
    }

    Outcome::success()
}
