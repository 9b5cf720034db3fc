//! Test utilities for integration tests.
//!
//! Provides a deterministic mock classifier and helpers that write small
//! slides as PNG or as tiled pyramidal TIFF files.

use image::{imageops, Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use wsi_gleason::render::blend_tile;
use wsi_gleason::{
    ColorMap, GleasonLabel, ModelError, ModelFamily, OutputCompression, PipelineConfig,
    PreprocessChain, PyramidTiffWriter, SlideController, TileClassifier, WriterOptions,
};

// =============================================================================
// Mock Classifier
// =============================================================================

/// Red channel step that separates the six classes in test slides.
pub const LABEL_STEP: u8 = 40;

/// A classifier that reads the label from a tile's top-left red channel.
///
/// A tile whose first pixel has red value `k * LABEL_STEP` is classified as
/// label `k` with full confidence. Calls and classified tiles are counted.
pub struct PixelClassifier {
    calls: AtomicUsize,
    tiles: AtomicUsize,
    failing: AtomicBool,
}

impl PixelClassifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            tiles: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    /// Make every following call fail with an invocation error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn tiles(&self) -> usize {
        self.tiles.load(Ordering::SeqCst)
    }
}

impl TileClassifier for PixelClassifier {
    fn family(&self) -> ModelFamily {
        ModelFamily::DenseNet121
    }

    fn predict(&self, batch: &[RgbImage]) -> Result<Vec<Vec<f32>>, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ModelError::Invocation("mock model is down".to_string()));
        }
        self.tiles.fetch_add(batch.len(), Ordering::SeqCst);

        Ok(batch
            .iter()
            .map(|tile| {
                let index = ((tile.get_pixel(0, 0)[0] / LABEL_STEP) as usize).min(5);
                let mut probabilities = vec![0.0; 6];
                probabilities[index] = 1.0;
                probabilities
            })
            .collect())
    }
}

// =============================================================================
// Slide Builders
// =============================================================================

/// Slide whose `tile` x `tile` cells carry the labels of `labels` (row-major).
///
/// Cells are filled with a red value of `label.index() * LABEL_STEP`, so a
/// [`PixelClassifier`] recovers the label from any cell.
pub fn labelled_slide(
    width: u32,
    height: u32,
    tile: u32,
    labels: &[GleasonLabel],
) -> RgbImage {
    let cols = width.div_ceil(tile);
    RgbImage::from_fn(width, height, |x, y| {
        let cell = ((y / tile) * cols + x / tile) as usize;
        let label = labels[cell % labels.len()];
        Rgb([label.index() as u8 * LABEL_STEP, 100, 150])
    })
}

/// Write `image` as a PNG slide.
pub fn write_png_slide(path: &Path, image: &RgbImage) {
    image.save(path).unwrap();
}

/// Write `image` as an uncompressed tiled pyramidal TIFF slide.
pub fn write_tiled_slide(path: &Path, image: &RgbImage, tile: u32) {
    let options = WriterOptions {
        tile_size: tile,
        compression: OutputCompression::None,
        resolution: None,
        description: Some("test slide".to_string()),
    };
    let mut writer =
        PyramidTiffWriter::create(path, image.width(), image.height(), options).unwrap();
    let (tiles_x, tiles_y) = writer.grid();
    for row in 0..tiles_y {
        for col in 0..tiles_x {
            let x = col * tile;
            let y = row * tile;
            let w = (image.width() - x).min(tile);
            let h = (image.height() - y).min(tile);
            let part = imageops::crop_imm(image, x, y, w, h).to_image();
            writer.write_tile(col, row, &part).unwrap();
        }
    }
    writer.finish().unwrap();
}

/// The expected class map of a slide built by [`labelled_slide`].
pub fn expected_class_map(
    width: u32,
    height: u32,
    tile: u32,
    labels: &[GleasonLabel],
) -> RgbImage {
    let cols = width.div_ceil(tile);
    RgbImage::from_fn(width, height, |x, y| {
        let cell = ((y / tile) * cols + x / tile) as usize;
        ColorMap::GLEASON.rgb8(labels[cell % labels.len()])
    })
}

/// The expected overlay of [`labelled_slide`] class colors over `slide`.
pub fn expected_overlay(
    slide: &RgbImage,
    tile: u32,
    labels: &[GleasonLabel],
    weight: f32,
) -> RgbImage {
    let cols = slide.width().div_ceil(tile);
    blend_tile(slide, weight, |x, y| {
        let cell = ((y / tile) * cols + x / tile) as usize;
        ColorMap::GLEASON.color(labels[cell % labels.len()])
    })
}

// =============================================================================
// Pipeline Fixtures
// =============================================================================

/// Output, cache and input directories of one test run.
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["input", "output", "cache"] {
            std::fs::create_dir(dir.path().join(sub)).unwrap();
        }
        Self { dir }
    }

    pub fn input(&self, name: &str) -> PathBuf {
        self.dir.path().join("input").join(name)
    }

    pub fn output_root(&self) -> PathBuf {
        self.dir.path().join("output")
    }

    pub fn cache_root(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn predictions(&self) -> PathBuf {
        self.dir.path().join("predictions.csv")
    }

    /// Lossless settings with small classification and output tiles.
    pub fn config(&self, tile_size: u32) -> PipelineConfig {
        PipelineConfig {
            output_root: self.output_root(),
            cache_root: self.cache_root(),
            predictions: Some(self.predictions()),
            tile_size,
            tile_concurrency: 4,
            batch_size: 4,
            source_tile_cache: 8,
            overlay: None,
            writer: WriterOptions {
                tile_size: 16,
                compression: OutputCompression::None,
                resolution: None,
                description: None,
            },
            colors: ColorMap::GLEASON,
        }
    }

    pub fn controller(
        &self,
        config: PipelineConfig,
        classifier: Arc<PixelClassifier>,
    ) -> SlideController {
        SlideController::new(config, classifier, PreprocessChain::new())
    }
}

/// Read a whole image written by the pipeline back into memory.
pub async fn read_output(path: &Path) -> RgbImage {
    let source = wsi_gleason::open_slide(path, 16).await.unwrap();
    let (width, height) = source.dimensions();
    source.read_region(0, 0, width, height).await.unwrap()
}

/// Read level 0 of an output with the `tiff` crate, converting YCbCr samples.
pub fn read_with_tiff_decoder(path: &Path) -> RgbImage {
    let file = std::io::BufReader::new(std::fs::File::open(path).unwrap());
    let mut decoder = tiff::decoder::Decoder::new(file).unwrap();
    let (width, height) = decoder.dimensions().unwrap();
    let colortype = decoder.colortype().unwrap();
    let tiff::decoder::DecodingResult::U8(samples) = decoder.read_image().unwrap() else {
        panic!("expected 8-bit samples");
    };

    let pixels = samples.chunks_exact(3).map(|px| match colortype {
        tiff::ColorType::RGB(8) => [px[0], px[1], px[2]],
        tiff::ColorType::YCbCr(8) => {
            let [y, cb, cr] = [px[0], px[1], px[2]].map(|v| v as f32);
            [
                y + 1.402 * (cr - 128.0),
                y - 0.344_136 * (cb - 128.0) - 0.714_136 * (cr - 128.0),
                y + 1.772 * (cb - 128.0),
            ]
            .map(|v| v.round().clamp(0.0, 255.0) as u8)
        }
        other => panic!("unexpected color type {:?}", other),
    });
    RgbImage::from_raw(width, height, pixels.flatten().collect()).unwrap()
}

/// Assert two images are pixel-identical, reporting the first difference.
pub fn assert_same_pixels(actual: &RgbImage, expected: &RgbImage) {
    assert_eq!(actual.dimensions(), expected.dimensions());
    for (x, y, px) in actual.enumerate_pixels() {
        assert_eq!(px, expected.get_pixel(x, y), "pixel ({}, {})", x, y);
    }
}
