//! Tiling stage.
//!
//! The slide is cut into a grid of fixed-size tiles which are written to a
//! per-slide cache as PNG files. The tile file name carries the tile's
//! position, so later stages relocate predictions without any side table.
//!
//! ```text
//! ┌─────────────────┐     ┌───────────────┐     ┌─────────────────┐
//! │  RegionSource   │────▶│ TileGenerator │────▶│    TileStore    │
//! │ (slide pixels)  │     │  (grid sweep) │     │ (cache dir/mem) │
//! └─────────────────┘     └───────┬───────┘     └─────────────────┘
//!                                 │
//!                          codec::encode
//!                     {slide}_{x:06}_{y:06}.png
//! ```
//!
//! # Components
//!
//! - [`TileName`], [`encode`], [`decode`]: the coordinate codec
//! - [`TileGrid`]: grid geometry with clipped edge cells
//! - [`TileStore`]: the resume checkpoint, backed by [`FsTileStore`] or [`MemoryTileStore`]
//! - [`TileGenerator`]: concurrent extraction of missing tiles

pub mod codec;
mod encoder;
mod generator;
mod grid;
mod store;

pub use codec::{decode, encode, TileName, MAX_COORDINATE, TILE_EXTENSION};
pub use encoder::{decode_png, encode_png};
pub use generator::{GenerationReport, TileGenerator};
pub use grid::{TileCell, TileGrid};
pub use store::{FsTileStore, MemoryTileStore, TileStore};
