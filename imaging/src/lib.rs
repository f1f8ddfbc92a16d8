//! Image file handling for frames downloaded from INDI cameras
//!
//! FITS header records are read and rewritten; the data unit is carried
//! through byte for byte.

mod error;
pub mod fits;
pub mod metadata;
pub mod sexagesimal;

pub use error::{ImagingError, ImagingResult};
pub use fits::{FitsHeader, FitsImage, FitsKeyword, FitsValue, PixelFormat};
pub use metadata::{image_properties, ImageMetadata, ImageProperty, PropertyValue};
