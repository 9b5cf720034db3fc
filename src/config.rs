//! Configuration management for wsi-gleason.
//!
//! Every option can be given on the command line or through an environment
//! variable with the `GLEASON_` prefix:
//!
//! - `GLEASON_INPUT` - Input slides or directories (comma-separated)
//! - `GLEASON_OUTPUT` - Output directory (default: .)
//! - `GLEASON_CACHE` - Tile cache root (default: temporary directory)
//! - `GLEASON_MODEL` - Model weights or manifest
//! - `GLEASON_MODEL_FAMILY` - densenet121 or resnext101
//! - `GLEASON_MODEL_COMMAND` - Program serving the model
//! - `GLEASON_DEVICE` - cpu or GPU index (default: 0)
//! - `GLEASON_PREDICTIONS` - CSV all predictions are appended to
//! - `GLEASON_TILE_SIZE` - Classification tile edge (default: 1024)
//! - `GLEASON_BATCH_SIZE` - Tiles per model call (default: 32)
//! - `GLEASON_JPEG_QUALITY` - Output JPEG quality (default: 80)

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::format::tiff::{OutputCompression, WriterOptions};
use crate::inference::{ColorMap, Device, ModelFamily, DEFAULT_BATCH_SIZE};
use crate::pipeline::PipelineConfig;
use crate::render::DEFAULT_BLEND_WEIGHT;
use crate::slide::DEFAULT_SOURCE_TILE_CACHE;

// =============================================================================
// Default Values
// =============================================================================

/// Default classification tile edge in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 1024;

/// Default output tile edge in pixels.
pub const DEFAULT_OUTPUT_TILE_SIZE: u32 = 1024;

/// Default JPEG quality of the output image.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Default file all predictions are appended to.
pub const DEFAULT_PREDICTIONS: &str = "predictions.csv";

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// wsi-gleason - Gleason grading maps for Whole Slide Images.
///
/// Cuts each slide into tiles, classifies every tile with an external
/// model and writes a color-coded pyramidal TIFF per slide. Interrupted
/// runs resume from the tile cache.
#[derive(Parser, Debug, Clone)]
#[command(name = "wsi-gleason")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    // =========================================================================
    // Inputs and Outputs
    // =========================================================================
    /// Input slide; repeat for several. Directories expand to their files.
    #[arg(short, long, required = true, env = "GLEASON_INPUT", value_delimiter = ',')]
    pub input: Vec<PathBuf>,

    /// Directory receiving `<slide>_gleason.tiff`.
    #[arg(short, long, default_value = ".", env = "GLEASON_OUTPUT")]
    pub output: PathBuf,

    /// Root of the per-slide tile caches.
    ///
    /// If not specified, a temporary directory is used and removed at exit.
    #[arg(long, env = "GLEASON_CACHE")]
    pub cache: Option<PathBuf>,

    /// CSV every slide's predictions are appended to.
    #[arg(short, long, default_value = DEFAULT_PREDICTIONS, env = "GLEASON_PREDICTIONS")]
    pub predictions: PathBuf,

    // =========================================================================
    // Model Configuration
    // =========================================================================
    /// Model weights, or a JSON manifest with weights and layer configuration.
    #[arg(long, default_value = "model.hdf5", env = "GLEASON_MODEL")]
    pub model: PathBuf,

    /// Architecture of the model.
    #[arg(long, value_enum, default_value_t = ModelFamily::DenseNet121, env = "GLEASON_MODEL_FAMILY")]
    pub model_family: ModelFamily,

    /// Program that serves the model over stdin/stdout.
    #[arg(long, default_value = "gleason-model", env = "GLEASON_MODEL_COMMAND")]
    pub model_command: PathBuf,

    /// Extra arguments for the model program.
    #[arg(long, env = "GLEASON_MODEL_ARGS", value_delimiter = ' ', allow_hyphen_values = true)]
    pub model_args: Vec<String>,

    /// Device for the model: `cpu` or a GPU index.
    #[arg(short = 'g', long, default_value = "0", env = "GLEASON_DEVICE")]
    pub device: Device,

    /// Reference image for stain normalization.
    #[arg(long, env = "GLEASON_STAIN_REFERENCE")]
    pub stain_reference: Option<PathBuf>,

    /// Tiles per model invocation.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, env = "GLEASON_BATCH_SIZE")]
    pub batch_size: usize,

    // =========================================================================
    // Tiling Configuration
    // =========================================================================
    /// Classification tile edge in pixels.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE, env = "GLEASON_TILE_SIZE")]
    pub tile_size: u32,

    /// Tiles extracted concurrently (default: twice the CPU count).
    #[arg(long, env = "GLEASON_TILE_CONCURRENCY")]
    pub tile_concurrency: Option<usize>,

    /// Decoded source tiles kept in memory per slide.
    #[arg(long, default_value_t = DEFAULT_SOURCE_TILE_CACHE, env = "GLEASON_SOURCE_TILE_CACHE")]
    pub source_tile_cache: usize,

    // =========================================================================
    // Output Configuration
    // =========================================================================
    /// Blend the class colors over the slide instead of writing a plain map.
    #[arg(long, default_value_t = false, env = "GLEASON_GENERATE_OVERLAY")]
    pub generate_overlay: bool,

    /// Weight of the class colors in an overlay (0-1).
    #[arg(long, default_value_t = DEFAULT_BLEND_WEIGHT, env = "GLEASON_BLEND_WEIGHT")]
    pub blend_weight: f32,

    /// Output tile edge in pixels (multiple of 16).
    #[arg(long, default_value_t = DEFAULT_OUTPUT_TILE_SIZE, env = "GLEASON_OUTPUT_TILE_SIZE")]
    pub output_tile_size: u32,

    /// JPEG quality of the output tiles (1-100).
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY, env = "GLEASON_JPEG_QUALITY")]
    pub jpeg_quality: u8,

    /// Store output tiles without compression.
    #[arg(long, default_value_t = false, env = "GLEASON_UNCOMPRESSED_OUTPUT")]
    pub uncompressed_output: bool,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.input.is_empty() {
            return Err("At least one input is required. Set --input or GLEASON_INPUT".to_string());
        }

        if self.tile_size == 0 {
            return Err("tile_size must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".to_string());
        }
        if self.tile_concurrency == Some(0) {
            return Err("tile_concurrency must be greater than 0".to_string());
        }
        if self.source_tile_cache == 0 {
            return Err("source_tile_cache must be greater than 0".to_string());
        }

        if self.output_tile_size == 0 || self.output_tile_size % 16 != 0 {
            return Err("output_tile_size must be a positive multiple of 16".to_string());
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err("jpeg_quality must be between 1 and 100".to_string());
        }
        if !(0.0..=1.0).contains(&self.blend_weight) {
            return Err("blend_weight must be between 0 and 1".to_string());
        }

        Ok(())
    }

    pub fn tile_concurrency(&self) -> usize {
        self.tile_concurrency.unwrap_or_else(default_concurrency)
    }

    pub fn output_compression(&self) -> OutputCompression {
        if self.uncompressed_output {
            OutputCompression::None
        } else {
            OutputCompression::Jpeg {
                quality: self.jpeg_quality,
            }
        }
    }

    /// Build the read-only run configuration around a resolved cache root.
    pub fn pipeline_config(&self, cache_root: &Path) -> PipelineConfig {
        PipelineConfig {
            output_root: self.output.clone(),
            cache_root: cache_root.to_path_buf(),
            predictions: Some(self.predictions.clone()),
            tile_size: self.tile_size,
            tile_concurrency: self.tile_concurrency(),
            batch_size: self.batch_size,
            source_tile_cache: self.source_tile_cache,
            overlay: self.generate_overlay.then_some(self.blend_weight),
            writer: WriterOptions {
                tile_size: self.output_tile_size,
                compression: self.output_compression(),
                resolution: None,
                description: None,
            },
            colors: ColorMap::default(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
