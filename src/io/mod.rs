//! I/O layer for slide access.
//!
//! Slides are read through the [`RangeReader`] trait so the TIFF parser and
//! region extraction only ever touch the bytes they need.

mod file_reader;
mod range_reader;

pub use file_reader::FileRangeReader;
pub use range_reader::RangeReader;
