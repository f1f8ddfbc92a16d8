//! Execution errors

use std::path::PathBuf;
use thiserror::Error;

use skybridge_alignment::AlignmentError;
use skybridge_imaging::ImagingError;
use skybridge_indi::IndiError;

#[derive(Error, Debug)]
pub enum ExecutionError {
    // =========================================================================
    // Device selection
    // =========================================================================

    #[error("No device has been specified")]
    NoDevice,

    #[error("No INDI device has been connected")]
    NoDevicesConnected,

    #[error("INDI device not available: '{0}'")]
    DeviceUnavailable(String),

    #[error("'{0}' does not seem to be a valid INDI CCD device")]
    NotACamera(String),

    #[error("'{0}' does not seem to be a valid INDI mount device")]
    NotAMount(String),

    #[error("Telescope selection failed: {0}")]
    TelescopeSelection(String),

    // =========================================================================
    // Execution
    // =========================================================================

    #[error("Recursive call to perform() detected")]
    Recursive,

    #[error("Process aborted")]
    Aborted,

    #[error("Property {device}.{property}.{element} is not available")]
    MissingProperty {
        device: String,
        property: String,
        element: String,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Plate solver failed: {0}")]
    PlateSolver(String),

    // =========================================================================
    // Lower layers
    // =========================================================================

    #[error(transparent)]
    Indi(#[from] IndiError),

    #[error(transparent)]
    Alignment(#[from] AlignmentError),

    #[error(transparent)]
    Imaging(#[from] ImagingError),
}

impl ExecutionError {
    pub(crate) fn missing(device: &str, property: &str, element: &str) -> Self {
        ExecutionError::MissingProperty {
            device: device.to_string(),
            property: property.to_string(),
            element: element.to_string(),
        }
    }

    /// True for user cancellation, including an abort seen by a blocking send
    pub fn is_aborted(&self) -> bool {
        match self {
            ExecutionError::Aborted => true,
            ExecutionError::Indi(e) => e.is_aborted(),
            _ => false,
        }
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;
