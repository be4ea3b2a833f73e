//! flexVolume driver that mounts the output of a secret command as a filesystem.
use std::process::ExitCode;

use secret_fs::{
    app_config::Config,
    flexvolume::{Invocation, Outcome, ParseFailure, mount, umount},
};
use tracing::{error, info};

mod session;
mod trc;

use crate::trc::Trc;

/// Main entry point for the application.
fn main() -> ExitCode {
    let argv: Vec<_> = std::env::args_os().collect();

    // A broken config must not stop `init` from answering, so hold on to the error until we
    // know what was asked for.
    let config = Config::load();

    let log_file = config.as_ref().ok().and_then(|c| c.log_file.as_deref());
    // Nowhere to report a logging failure: stdout is the protocol channel.
    if let Ok(trc) = Trc::default().with_log_file(log_file) {
        _ = trc.init();
    }
    info!(args = ?argv, "Invoked.");

    let invocation = match Invocation::parse_from(&argv) {
        Ok(invocation) => invocation,
        Err(ParseFailure::Reply(outcome)) => return outcome.emit(),
        Err(ParseFailure::Display(e)) => e.exit(),
    };

    if invocation == Invocation::Init {
        return Outcome::init().emit();
    }

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            if matches!(invocation, Invocation::Serve { .. }) {
                eprintln!("Failed to load configuration: {e}");
                return ExitCode::FAILURE;
            }
            return Outcome::failure(format!("failed to load configuration: {e}")).emit();
        }
    };

    match invocation {
        Invocation::Init => Outcome::init().emit(),
        Invocation::Mount(request) => {
            let program = match std::env::current_exe() {
                Ok(program) => program,
                Err(e) => {
                    error!("Failed to locate own executable: {e}");
                    return Outcome::failure(format!("cannot locate driver executable: {e}"))
                        .emit();
                }
            };
            mount::mount(&request, &config.session_command(program)).emit()
        }
        Invocation::Umount(request) => umount::umount(&request, &config.umount_program).emit(),
        Invocation::Serve {
            mount_point,
            options,
        } => match session::serve(&config, &mount_point, &options) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e}");
                // Before detaching, stderr is the pipe `mount` reads its failure message from.
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        },
    }
}
