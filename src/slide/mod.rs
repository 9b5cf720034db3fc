//! Slide jobs and source image access.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Tile Generator / Class Reassembler    │
//! └────────────────────┬────────────────────┘
//!                      │ read_region(x, y, w, h)
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │          RegionSource Trait             │
//! └────────────────────┬────────────────────┘
//!          ┌───────────┴───────────┐
//!          ▼                       ▼
//! ┌─────────────────┐    ┌─────────────────────┐
//! │ TiledTiffSource │    │    RasterSource     │
//! │ (SVS, tiled TIFF│    │ (whole-image decode │
//! │  + tile LRU)    │    │  fallback)          │
//! └─────────────────┘    └─────────────────────┘
//! ```

mod job;
mod source;

pub use job::{slide_id_from_path, SlideJob, OUTPUT_SUFFIX};
pub use source::{
    open_slide, RasterSource, RegionSource, TiledTiffSource, DEFAULT_SOURCE_TILE_CACHE,
};
pub(crate) use source::blit;
