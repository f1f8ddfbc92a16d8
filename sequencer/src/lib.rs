//! Mount and CCD execution for INDI devices
//!
//! [`MountExecution`] runs one mount command (slews, parking, syncs, pointing
//! model maintenance) and [`CcdFrameExecution`] runs a series of exposures,
//! annotates the downloaded frames and stores them. Both are single-flight:
//! a second `perform` while one is running is rejected. Progress is reported
//! through an [`ExecutionObserver`]; cancellation goes through the client's
//! abort token and triggers a best-effort device-side abort. The token is
//! process-wide per client: aborting one execution cancels the others
//! waiting on the same client, and each `perform` resets it on start.

mod ccd;
mod error;
mod events;
pub mod file_template;
mod guard;
mod mount;
pub mod plate_solver;

pub use ccd::{
    CcdFrameExecution, CcdFrameOutputs, CcdFrameParameters, EphemerisService, FrameType,
    TelescopeSelection, UploadMode,
};
pub use error::{ExecutionError, ExecutionResult};
pub use events::{ChannelObserver, ExecutionEvent, ExecutionObserver, LogObserver};
pub use mount::{
    AlignmentMethod, MountCommand, MountExecution, MountParameters, MountState, SlewRate,
};
pub use plate_solver::{CommandPlateSolver, PlateSolver, PlateSolverParameters};

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` wins over `verbosity`
/// (0 warn, 1 info, 2 debug). Returns false when a subscriber was already
/// installed.
pub fn init_logging(verbosity: u8) -> bool {
    let fallback = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

/// The executions take no command-line arguments
pub fn process_command_line(_args: &[String]) -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_logging_init_is_harmless() {
        init_logging(2);
        assert!(!init_logging(0));
    }

    #[test]
    fn test_command_line_is_ignored() {
        assert_eq!(process_command_line(&["--device".to_string(), "x".to_string()]), 0);
        assert_eq!(process_command_line(&[]), 0);
    }
}
