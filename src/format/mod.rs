//! Slide file formats.
//!
//! TIFF-based slides (Aperio SVS and generic tiled TIFF) are parsed here;
//! the same TIFF layer writes the pyramidal output image.
//!
//! # Format Detection
//!
//! Use [`detect::detect_format`] to identify a slide file:
//!
//! - **Aperio SVS**: Identified by "Aperio" marker in ImageDescription
//! - **Generic TIFF**: Any other TIFF or BigTIFF
//! - **Raster**: Everything else, decoded by the `image` crate

pub mod detect;
pub mod jpeg;
pub mod tiff;

pub use detect::{aperio_mpp, detect_format, is_tiff_header, read_first_description, SlideFormat};
