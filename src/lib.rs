//! # wsi-gleason
//!
//! Gleason grading maps for Whole Slide Images (WSI) that do not fit in memory.
//!
//! Each slide is cut into a grid of fixed-size tiles, every tile is
//! classified by an external model into one of six classes, and the
//! predictions are reassembled into a color-coded pyramidal TIFF at full
//! resolution, optionally blended over the slide.
//!
//! ## Features
//!
//! - **Streaming access**: only the source tiles a region overlaps are read and decoded
//! - **Resumable**: tiles and predictions are cached on disk; a restart redoes only what is missing
//! - **Bounded memory**: the output pyramid is written one tile at a time
//! - **Format support**: Aperio SVS and tiled pyramidal TIFF, any `image` format as fallback
//!
//! ## Architecture
//!
//! - [`io`] - Range-based file access
//! - [`mod@format`] - TIFF/SVS parsing, JPEG tables and the pyramidal TIFF writer
//! - [`slide`] - Slide jobs and region sources
//! - [`tile`] - Tile naming, grid sweep and the tile cache
//! - [`inference`] - Preprocessing, the model collaborator and prediction tables
//! - [`render`] - Class grid validation and output streaming
//! - [`pipeline`] - Per-slide state machine and batch driver
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use wsi_gleason::{
//!     CommandClassifier, Config, Device, ModelFamily, ModelLaunch, ModelManifest,
//!     PreprocessChain, SlideController,
//! };
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::parse_from(["wsi-gleason", "--input", "slide.svs"]);
//!     let launch = ModelLaunch {
//!         program: PathBuf::from("gleason-model"),
//!         args: Vec::new(),
//!         family: ModelFamily::DenseNet121,
//!         device: Device::Gpu(0),
//!         manifest: ModelManifest::load(&config.model).unwrap(),
//!     };
//!     let classifier = Arc::new(CommandClassifier::spawn(&launch).unwrap());
//!     let chain = PreprocessChain::standard(None, ModelFamily::DenseNet121.input_size());
//!
//!     let controller =
//!         SlideController::new(config.pipeline_config("/tmp/cache".as_ref()), classifier, chain);
//!     let report = controller.run_batch(&config.input).await;
//!     for slide in &report.slides {
//!         println!("{}", slide);
//!     }
//! }
//! ```

pub mod config;
pub mod error;
pub mod format;
pub mod inference;
pub mod io;
pub mod pipeline;
pub mod render;
pub mod slide;
pub mod tile;

// Re-export commonly used types
pub use config::Config;
pub use error::{
    CodecError, ExtractionError, FormatError, IoError, ModelError, OutputError, PipelineError,
    ReassemblyError, TableError, TiffError,
};
pub use format::tiff::{
    level_dimensions, OutputCompression, PyramidTiffWriter, Resolution, TiffPyramid,
    WriterOptions,
};
pub use format::{detect_format, SlideFormat};
pub use inference::{
    ColorMap, CommandClassifier, Device, GleasonLabel, InferenceOrchestrator, ModelFamily,
    ModelLaunch, ModelManifest, PredictionRecord, PreprocessChain, StainNormalization,
    TileClassifier,
};
pub use io::{FileRangeReader, RangeReader};
pub use pipeline::{
    expand_inputs, BatchReport, PipelineConfig, SlideController, SlideOutcome, SlideReport,
    SlideState,
};
pub use render::{ClassGrid, MemorySink, Overlay, Reassembler, StagedOutput, TileSink};
pub use slide::{open_slide, RasterSource, RegionSource, SlideJob, TiledTiffSource};
pub use tile::{
    FsTileStore, GenerationReport, MemoryTileStore, TileGenerator, TileGrid, TileName, TileStore,
};
