//! The filesystem session: the long-lived process that serves the mount.
//!
//! `mount` waits for this process to exit, so it mounts first (reporting failures on stderr,
//! which `mount` relays to the orchestrator) and only then detaches into the background to
//! serve requests until the mount point is unmounted.

use std::path::Path;

use daemonize::Daemonize;
use secret_fs::{
    app_config::Config,
    cache::ContentCache,
    fs::{
        fuser::{FuserAdapter, mount_options},
        secret::SecretFs,
    },
};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Mount point '{0}' already exists and is not empty.")]
    MountPointNotEmpty(String),

    #[error("Failed to prepare mount point: {0}")]
    MountPoint(#[source] std::io::Error),

    #[error("Failed to mount filesystem: {0}")]
    Mount(#[source] std::io::Error),

    #[error("Failed to open log file: {0}")]
    LogFile(#[source] std::io::Error),

    #[error("Failed to detach from the mount process: {0}")]
    Daemonize(#[from] daemonize::Error),

    #[error("Filesystem session ended with an error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents) and logs an info message.
/// - If the directory exists and is empty, does nothing.
fn prepare_mount_point(mount_point: &Path) -> Result<(), SessionError> {
    match std::fs::read_dir(mount_point) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(SessionError::MountPointNotEmpty(
                    mount_point.display().to_string(),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(mount_point).map_err(SessionError::MountPoint)?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(SessionError::MountPoint(e)),
    }
}

fn daemonize(config: &Config) -> Result<(), SessionError> {
    let mut daemonize = Daemonize::new().working_directory("/");

    if let Some(path) = &config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(SessionError::LogFile)?;
        let clone = file.try_clone().map_err(SessionError::LogFile)?;
        daemonize = daemonize.stdout(file).stderr(clone);
    }

    // The calling process exits here with the status of the intermediate child, which is
    // what unblocks `mount`.
    daemonize.start()?;
    Ok(())
}

/// Mount the secret filesystem at `mount_point` and serve it until unmounted.
pub fn serve(config: &Config, mount_point: &Path, options: &[String]) -> Result<(), SessionError> {
    prepare_mount_point(mount_point)?;

    let fs = SecretFs::new(ContentCache::new(config.command_source()))
        .with_directories(config.directories.iter().cloned());
    let adapter = FuserAdapter::new(fs);
    let mount_opts = mount_options(&config.fs_name, options);

    info!(mount_point = %mount_point.display(), ?mount_opts, "Mounting filesystem.");
    let mut session =
        fuser::Session::new(adapter, mount_point, &mount_opts).map_err(SessionError::Mount)?;

    daemonize(config)?;
    info!(pid = std::process::id(), "Serving filesystem.");

    session.run().map_err(|e| {
        error!("Filesystem session failed: {e}");
        SessionError::Serve(e)
    })?;

    info!(mount_point = %mount_point.display(), "Filesystem unmounted, exiting.");
    Ok(())
}
