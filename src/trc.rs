//! Tracing configuration and initialization.
//!
//! stdout belongs to the flexVolume protocol and the `mount` parent captures stderr of the
//! session, so logs never go to either. They are appended to the configured log file, or
//! dropped.

use std::{fs::File, path::Path, sync::Mutex};

use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

#[derive(Debug, thiserror::Error)]
pub enum TrcError {
    #[error("Failed to open log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to install subscriber: {0}")]
    Init(Box<dyn std::error::Error + Send + Sync>),
}

enum TrcMode {
    File(File),
    Discard,
}

pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        let env_filter = EnvFilter::try_from_env("SECRET_FS_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("info"));

        Self {
            mode: TrcMode::Discard,
            env_filter,
        }
    }
}

impl Trc {
    /// Append to `path` instead of discarding. `None` keeps the current mode.
    pub fn with_log_file(mut self, path: Option<&Path>) -> Result<Self, TrcError> {
        if let Some(path) = path {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            self.mode = TrcMode::File(file);
        }
        Ok(self)
    }

    pub fn init(self) -> Result<(), TrcError> {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(self.env_filter)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false);

        match self.mode {
            TrcMode::File(file) => builder.with_writer(Mutex::new(file)).try_init(),
            TrcMode::Discard => builder.with_writer(std::io::sink).try_init(),
        }
        .map_err(TrcError::Init)
    }
}
