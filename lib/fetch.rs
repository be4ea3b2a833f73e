//! Retrieval of secret content from an external command.
//!
//! The command is treated as an opaque subprocess: it is invoked as `<command> get <path>`,
//! whatever it writes to stdout is the content, and its exit status alone decides whether the
//! fetch succeeded.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncReadExt as _;
use tracing::{debug, instrument, warn};

/// Why a secret could not be fetched.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The command could not be started at all. This is what a shell would report as exit
    /// status 127.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// The program that was asked for.
        program: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Reading the command's stdout or waiting for it failed.
    #[error("io error while reading command output: {0}")]
    Io(#[from] std::io::Error),

    /// The command ran, but did not exit cleanly. Any output it produced is discarded.
    #[error("command exited unsuccessfully ({status}) after writing {discarded} bytes")]
    Exit {
        /// How the command ended. `code()` is `None` if a signal killed it.
        status: ExitStatus,
        /// Bytes of stdout read before the failure was known.
        discarded: usize,
    },
}

/// A place secret content can be fetched from, keyed by absolute path.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// The full content stored under `path`.
    async fn fetch(&self, path: &str) -> Result<Bytes, FetchError>;
}

/// Fetches secrets by running `<program> [args...] get <path>`.
#[derive(Debug, Clone)]
pub struct CommandSource {
    program: OsString,
    args: Vec<OsString>,
    log_file: Option<PathBuf>,
}

impl CommandSource {
    /// Run `program` with no extra arguments, discarding its stderr.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            log_file: None,
        }
    }

    /// Arguments placed between the program and `get <path>`.
    #[must_use]
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Append the command's stderr to this file instead of discarding it.
    #[must_use]
    pub fn with_log_file(mut self, path: impl AsRef<Path>) -> Self {
        self.log_file = Some(path.as_ref().to_path_buf());
        self
    }

    fn stderr(&self) -> Stdio {
        let Some(path) = &self.log_file else {
            return Stdio::null();
        };

        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot open log file for command stderr.");
                Stdio::null()
            }
        }
    }
}

#[async_trait]
impl SecretSource for CommandSource {
    #[instrument(name = "CommandSource::fetch", skip(self))]
    async fn fetch(&self, path: &str) -> Result<Bytes, FetchError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg("get")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(self.stderr())
            .spawn()
            .map_err(|source| FetchError::Spawn {
                program: self.program.to_string_lossy().into_owned(),
                source,
            })?;

        let mut buffer = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            // Drain fully before waiting, otherwise a large payload deadlocks on a full pipe.
            if let Err(e) = stdout.read_to_end(&mut buffer).await {
                _ = child.wait().await;
                return Err(FetchError::Io(e));
            }
        }
        debug!(length = buffer.len(), "read command output");

        let status = child.wait().await?;
        if !status.success() {
            warn!(%status, "secret command failed");
            return Err(FetchError::Exit {
                status,
                discarded: buffer.len(),
            });
        }

        Ok(Bytes::from(buffer))
    }
}
