//! Driver configuration.
//!
//! The orchestrator invokes the driver with a fixed argv, so settings come from a TOML file:
//! the one named by `SECRET_FS_CONFIG`, otherwise `/etc/secret-fs/config.toml`. A missing file
//! means defaults; a malformed one is an error.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    fetch::CommandSource,
    flexvolume::SessionCommand,
    fs::ROOT,
};

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "SECRET_FS_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "/etc/secret-fs/config.toml";

fn default_command() -> String {
    "custodia-cli".to_owned()
}

fn default_umount_program() -> PathBuf {
    PathBuf::from("/usr/bin/umount")
}

fn default_mount_options() -> Vec<String> {
    vec!["allow_other".to_owned()]
}

fn default_fs_name() -> String {
    "secret-fs".to_owned()
}

fn default_directories() -> Vec<String> {
    vec!["/certs".to_owned(), "/certs/HTTP".to_owned()]
}

/// Why the configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Every problem [`Config::validate`] found.
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    /// Not valid TOML, or an unknown key.
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    /// The file could not be read.
    #[error("I/O error reading {path}: {source}")]
    IoError {
        /// The file that was being read.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// The secret retrieval program, invoked as `<command> [command-args...] get <path>`.
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments placed between the command and `get <path>`.
    #[serde(default)]
    pub command_args: Vec<String>,

    /// Where logs and the secret command's stderr go. Discarded if unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// The unmount utility, invoked as `<umount-program> -f <mount-point>`.
    #[serde(default = "default_umount_program")]
    pub umount_program: PathBuf,

    /// Options the filesystem is mounted with.
    #[serde(default = "default_mount_options")]
    pub mount_options: Vec<String>,

    /// The `fsname` shown in the mount table.
    #[serde(default = "default_fs_name")]
    pub fs_name: String,

    /// Paths that stat as directories so nested secret names can be reached.
    #[serde(default = "default_directories")]
    pub directories: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: default_command(),
            command_args: Vec::new(),
            log_file: None,
            umount_program: default_umount_program(),
            mount_options: default_mount_options(),
            fs_name: default_fs_name(),
            directories: default_directories(),
        }
    }
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns every problem found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.command.trim().is_empty() {
            errors.push("command must not be empty.".to_owned());
        }

        if self.umount_program.as_os_str().is_empty() {
            errors.push("umount-program must not be empty.".to_owned());
        }

        for dir in &self.directories {
            if !dir.starts_with('/') || dir == ROOT {
                errors.push(format!(
                    "directory '{dir}' must be an absolute path other than the root."
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Parse and validate a configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    /// Loads config from a single TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Loads the configuration from `SECRET_FS_CONFIG` if set, otherwise from the default
    /// location if it exists, otherwise returns the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load_from_file(Path::new(&path));
        }

        let path = Path::new(DEFAULT_CONFIG_PATH);
        if path.exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// The secret source described by this configuration.
    #[must_use]
    pub fn command_source(&self) -> CommandSource {
        let source = CommandSource::new(&self.command).with_args(&self.command_args);
        match &self.log_file {
            Some(log_file) => source.with_log_file(log_file),
            None => source,
        }
    }

    /// How `mount` should re-execute `program` to serve the filesystem.
    #[must_use]
    pub fn session_command(&self, program: impl Into<OsString>) -> SessionCommand {
        SessionCommand {
            program: program.into(),
            args: Vec::new(),
            mount_options: self.mount_options.clone(),
        }
    }
}
