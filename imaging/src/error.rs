//! Image file errors

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImagingError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid FITS file: {0}")]
    InvalidFits(String),

    #[error("Missing required keyword: {0}")]
    MissingKeyword(String),

    #[error("Invalid sexagesimal value '{0}'")]
    Sexagesimal(String),
}

pub type ImagingResult<T> = Result<T, ImagingError>;
