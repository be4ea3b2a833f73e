//! The flexVolume driver protocol.
//!
//! The orchestrator runs the driver binary once per operation (`init`, `mount`, `umount`)
//! and expects exactly one JSON object on stdout in return, with the exit code signalling the
//! broad category of the outcome.

/// Starting the filesystem session for `mount`.
pub mod mount;
/// Tearing a mount down for `umount`.
pub mod umount;

use std::{ffi::OsString, io::Write as _, path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand, error::ErrorKind};
use serde::Serialize;

pub use mount::{MountRequest, SessionCommand};
pub use umount::UmountRequest;

/// Exit code for a `Failure` reply, or a `Not supported` reply caused by bad arguments.
pub const EXIT_FAILURE: u8 = 1;
/// Exit code reserved for commands the driver does not know.
pub const EXIT_UNKNOWN_COMMAND: u8 = 2;

/// The `status` field of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    /// The operation succeeded.
    Success,
    /// The operation was attempted and failed.
    Failure,
    /// Bad arguments or an unknown command.
    #[serde(rename = "Not supported")]
    NotSupported,
}

/// What the driver can do besides mount/unmount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Whether the driver implements attach/detach.
    pub attach: bool,
    /// Whether the orchestrator may relabel the volume for SELinux.
    pub selinux_relabel: bool,
}

/// The JSON object written to stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverResult {
    /// Outcome category.
    pub status: Status,
    /// Human readable detail, omitted on plain success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Only present in the `init` reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
}

impl DriverResult {
    /// Serialize as a single JSON line.
    #[must_use]
    pub fn to_json(&self) -> String {
        // Serializing plain strings, bools and unit enum variants cannot fail.
        serde_json::to_string(self).unwrap_or_else(|e| unreachable!("DriverResult serializes: {e}"))
    }
}

/// A reply together with the exit code the process should end with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// What to print.
    pub result: DriverResult,
    /// What to exit with.
    pub exit_code: u8,
}

impl Outcome {
    /// The reply to `init`. This driver has no attach/detach phase and does not relabel.
    #[must_use]
    pub fn init() -> Self {
        Self {
            result: DriverResult {
                status: Status::Success,
                message: None,
                capabilities: Some(Capabilities {
                    attach: false,
                    selinux_relabel: false,
                }),
            },
            exit_code: 0,
        }
    }

    /// `Success`, exit 0.
    #[must_use]
    pub fn success() -> Self {
        Self {
            result: DriverResult {
                status: Status::Success,
                message: None,
                capabilities: None,
            },
            exit_code: 0,
        }
    }

    /// `Failure` with `message`, exit 1.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            result: DriverResult {
                status: Status::Failure,
                message: Some(message.into()),
                capabilities: None,
            },
            exit_code: EXIT_FAILURE,
        }
    }

    /// `Not supported` with `message`, exit 1.
    #[must_use]
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self {
            result: DriverResult {
                status: Status::NotSupported,
                message: Some(message.into()),
                capabilities: None,
            },
            exit_code: EXIT_FAILURE,
        }
    }

    /// `Not supported`, exit 2.
    #[must_use]
    pub fn unknown_command() -> Self {
        Self {
            exit_code: EXIT_UNKNOWN_COMMAND,
            ..Self::not_supported("unknown command")
        }
    }

    /// Write the reply as the single line of stdout and hand back the exit code.
    pub fn emit(&self) -> ExitCode {
        let mut stdout = std::io::stdout().lock();
        if writeln!(stdout, "{}", self.result.to_json())
            .and_then(|()| stdout.flush())
            .is_err()
        {
            return ExitCode::from(EXIT_FAILURE);
        }
        ExitCode::from(self.exit_code)
    }
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "flexVolume driver exposing the output of a secret command as files.",
    disable_help_subcommand = true
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the driver and report its capabilities.
    #[command(disable_help_flag = true)]
    Init {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
        rest: Vec<OsString>,
    },

    /// Mount the secret filesystem: `mount <mount-dir> <json-options>`.
    #[command(disable_help_flag = true)]
    Mount {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },

    /// Unmount the secret filesystem: `umount <mount-dir>`.
    #[command(disable_help_flag = true)]
    Umount {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },

    /// Serve the filesystem at a mount point. Spawned by `mount`.
    #[command(hide = true)]
    Serve {
        /// Comma separated mount options.
        #[arg(short = 'o', value_delimiter = ',')]
        options: Vec<String>,

        mount_point: PathBuf,
    },
}

/// One parsed driver invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// `init`, with any arguments.
    Init,
    /// `mount <dir> <json>`.
    Mount(MountRequest),
    /// `umount <dir>`.
    Umount(UmountRequest),
    /// The hidden filesystem session.
    Serve {
        /// Where to mount.
        mount_point: PathBuf,
        /// Mount options, already split on commas.
        options: Vec<String>,
    },
}

/// Why an invocation could not be turned into an [`Invocation`].
#[derive(Debug)]
pub enum ParseFailure {
    /// Answer the orchestrator with this reply without doing anything.
    Reply(Outcome),
    /// Top-level `--help` or `--version`: let clap print it. Subcommands take no help flag,
    /// so the orchestrator always gets JSON back.
    Display(clap::Error),
}

impl Invocation {
    /// Parse a full argv, program name included.
    pub fn parse_from<I, T>(args: I) -> Result<Self, ParseFailure>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let args = match Args::try_parse_from(args) {
            Ok(args) => args,
            Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
                return Err(ParseFailure::Display(e));
            }
            Err(_) => return Err(ParseFailure::Reply(Outcome::unknown_command())),
        };

        match args.command {
            None => Err(ParseFailure::Reply(Outcome::not_supported(
                "at least one parameter expected",
            ))),
            Some(Command::Init { .. }) => Ok(Self::Init),
            Some(Command::Mount { args }) => match <[OsString; 2]>::try_from(args) {
                Ok([mount_point, options]) => Ok(Self::Mount(MountRequest {
                    mount_point: mount_point.into(),
                    options: options.to_string_lossy().into_owned(),
                })),
                Err(_) => Err(ParseFailure::Reply(Outcome::not_supported(
                    "mount expects two additional parameters",
                ))),
            },
            Some(Command::Umount { args }) => match <[OsString; 1]>::try_from(args) {
                Ok([mount_point]) => Ok(Self::Umount(UmountRequest {
                    mount_point: mount_point.into(),
                })),
                Err(_) => Err(ParseFailure::Reply(Outcome::not_supported(
                    "umount expects one additional parameter",
                ))),
            },
            Some(Command::Serve {
                options,
                mount_point,
            }) => Ok(Self::Serve {
                mount_point,
                options,
            }),
        }
    }
}
