//! Prediction reassembly into a full-resolution class map.
//!
//! Records are first validated into a [`ClassGrid`], one label per tile
//! cell. The map is then rendered one output tile at a time in row-major
//! order and streamed through a bounded queue to a single writer task that
//! owns the [`TileSink`]:
//!
//! ```text
//!  ClassGrid ──▶ render tile (x, y) ──▶ [queue: RENDER_QUEUE_DEPTH] ──▶ writer ──▶ TileSink
//!                    ▲
//!      overlay: RegionSource::read_region
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{OutputError, ReassemblyError};
use crate::format::tiff::{PyramidTiffWriter, WriterOptions};
use crate::inference::{ColorMap, GleasonLabel, PredictionRecord, LABEL_COUNT};
use crate::slide::RegionSource;
use crate::tile::{TileGrid, TileName};

use super::blend::blend_tile;
use super::sink::TileSink;

/// Rendered tiles that may wait for the writer.
pub const RENDER_QUEUE_DEPTH: usize = 4;

// =============================================================================
// ClassGrid
// =============================================================================

/// One label per cell of a slide's tile grid.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassGrid {
    grid: TileGrid,
    labels: Vec<GleasonLabel>,
}

impl ClassGrid {
    /// Validate records against the slide grid.
    ///
    /// Every record must decode, belong to `slide_id`, lie inside the slide
    /// on a multiple of `tile_size`, and every cell must be covered exactly
    /// once.
    pub fn from_records(
        slide_id: &str,
        width: u32,
        height: u32,
        tile_size: u32,
        records: &[PredictionRecord],
    ) -> Result<Self, ReassemblyError> {
        let grid = TileGrid::new(width, height, tile_size);
        let tile_size = grid.tile_size();
        let mut cells: Vec<Option<GleasonLabel>> = vec![None; grid.len()];

        for record in records {
            let name = TileName::parse(&record.tile)?;
            if name.slide_id != slide_id {
                return Err(ReassemblyError::SlideMismatch {
                    tile: record.tile.clone(),
                    expected: slide_id.to_string(),
                });
            }
            if name.x >= width || name.y >= height {
                return Err(ReassemblyError::CoordinateOutOfRange {
                    tile: record.tile.clone(),
                    x: name.x,
                    y: name.y,
                    width,
                    height,
                });
            }
            if name.x % tile_size != 0 || name.y % tile_size != 0 {
                return Err(ReassemblyError::MisalignedTile {
                    tile: record.tile.clone(),
                    x: name.x,
                    y: name.y,
                    tile_size,
                });
            }

            let index = grid.index(name.x / tile_size, name.y / tile_size);
            if cells[index].replace(record.label).is_some() {
                return Err(ReassemblyError::DuplicateTile {
                    tile: record.tile.clone(),
                    x: name.x,
                    y: name.y,
                });
            }
        }

        let missing = cells.iter().filter(|c| c.is_none()).count();
        if let Some(first) = cells.iter().position(|c| c.is_none()) {
            let columns = grid.columns() as usize;
            return Err(ReassemblyError::IncompleteReassembly {
                missing,
                expected: grid.len(),
                first_x: (first % columns) as u32 * tile_size,
                first_y: (first / columns) as u32 * tile_size,
            });
        }

        Ok(Self {
            grid,
            labels: cells.into_iter().flatten().collect(),
        })
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.grid.width(), self.grid.height())
    }

    pub fn label(&self, col: u32, row: u32) -> GleasonLabel {
        self.labels[self.grid.index(col, row)]
    }

    /// Number of cells per label, in label order.
    pub fn histogram(&self) -> [usize; LABEL_COUNT] {
        let mut counts = [0; LABEL_COUNT];
        for label in &self.labels {
            counts[label.index()] += 1;
        }
        counts
    }

    /// Paint the class colors of the rectangle at (`x`, `y`).
    pub fn render(&self, colors: &ColorMap, x: u32, y: u32, width: u32, height: u32) -> RgbImage {
        let t = self.grid.tile_size();
        let palette = GleasonLabel::ALL.map(|label| colors.rgb8(label));
        let cols: Vec<u32> = (x..x + width).map(|px| px / t).collect();

        let mut tile = RgbImage::new(width, height);
        for py in 0..height {
            let row = (y + py) / t;
            for (px, col) in cols.iter().enumerate() {
                let label = self.label(*col, row);
                tile.put_pixel(px as u32, py, palette[label.index()]);
            }
        }
        tile
    }

    /// Blend the class colors of the rectangle at (`x`, `y`) over `source`,
    /// which covers the same rectangle.
    pub fn render_overlay(
        &self,
        colors: &ColorMap,
        source: &RgbImage,
        weight: f32,
        x: u32,
        y: u32,
    ) -> RgbImage {
        let t = self.grid.tile_size();
        let palette = GleasonLabel::ALL.map(|label| colors.color(label));
        blend_tile(source, weight, |px, py| {
            palette[self.label((x + px) / t, (y + py) / t).index()]
        })
    }
}

// =============================================================================
// Reassembler
// =============================================================================

/// Source pixels to blend under the class colors.
#[derive(Clone)]
pub struct Overlay {
    pub source: Arc<dyn RegionSource>,
    /// Weight of the class color, in `[0, 1]`
    pub weight: f32,
}

/// A finished output image still under its `.part` name.
#[derive(Debug)]
pub struct StagedOutput {
    partial: PathBuf,
    path: PathBuf,
}

impl StagedOutput {
    /// Final path the image is published to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rename the image into place.
    pub async fn publish(self) -> Result<PathBuf, OutputError> {
        tokio::fs::rename(&self.partial, &self.path).await?;
        info!(path = %self.path.display(), "Wrote class map");
        Ok(self.path)
    }

    /// Delete the staged image.
    pub async fn discard(self) {
        if let Err(e) = tokio::fs::remove_file(&self.partial).await {
            debug!(path = %self.partial.display(), error = %e, "Could not remove staged output");
        }
    }
}

struct RenderedTile {
    col: u32,
    row: u32,
    image: RgbImage,
}

/// Streams a class map, or an overlay, into a tile sink.
#[derive(Clone, Default)]
pub struct Reassembler {
    colors: ColorMap,
    overlay: Option<Overlay>,
}

impl Reassembler {
    pub fn new(colors: ColorMap) -> Self {
        Self {
            colors,
            overlay: None,
        }
    }

    pub fn with_overlay(mut self, overlay: Overlay) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// Render `classes` into `sink` and finish it.
    ///
    /// The sink must have the slide's dimensions. Its tile size is chosen
    /// independently of the class grid.
    pub async fn render<S: TileSink>(
        &self,
        classes: Arc<ClassGrid>,
        sink: S,
    ) -> Result<S::Output, ReassemblyError> {
        if sink.dimensions() != classes.dimensions() {
            let (w, h) = sink.dimensions();
            let (cw, ch) = classes.dimensions();
            return Err(OutputError::Geometry(format!(
                "output is {}x{} but the slide is {}x{}",
                w, h, cw, ch
            ))
            .into());
        }
        if let Some(overlay) = &self.overlay {
            if overlay.source.dimensions() != classes.dimensions() {
                return Err(OutputError::Geometry(
                    "overlay source does not match the slide".to_string(),
                )
                .into());
            }
        }

        let (width, height) = classes.dimensions();
        let layout = TileGrid::new(width, height, sink.tile_size());
        info!(
            tiles = layout.len(),
            tile_size = layout.tile_size(),
            overlay = self.overlay.is_some(),
            "Rendering class map"
        );

        let (tx, mut rx) = mpsc::channel::<RenderedTile>(RENDER_QUEUE_DEPTH);
        let writer = tokio::task::spawn_blocking(move || {
            let mut sink = sink;
            while let Some(tile) = rx.blocking_recv() {
                sink.write_tile(tile.col, tile.row, &tile.image)?;
            }
            sink.finish()
        });

        let produced = self.produce(&classes, &layout, tx).await;
        let written = writer.await.map_err(|_| OutputError::WriterGone);

        // A render failure is the root cause even when the writer then
        // reports the stream as incomplete
        produced?;
        Ok(written??)
    }

    /// Render into a pyramidal TIFF at `path`.
    ///
    /// The file is written under a `.part` name and renamed once complete,
    /// so `path` only ever exists as a finished image.
    pub async fn render_to_tiff(
        &self,
        classes: Arc<ClassGrid>,
        path: &Path,
        options: WriterOptions,
    ) -> Result<PathBuf, ReassemblyError> {
        let staged = self.stage_tiff(classes, path, options).await?;
        Ok(staged.publish().await?)
    }

    /// Render a complete pyramidal TIFF for `path` without publishing it.
    ///
    /// Nothing is left behind on failure.
    pub async fn stage_tiff(
        &self,
        classes: Arc<ClassGrid>,
        path: &Path,
        options: WriterOptions,
    ) -> Result<StagedOutput, ReassemblyError> {
        let mut partial = path.as_os_str().to_owned();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        let (width, height) = classes.dimensions();
        let writer = PyramidTiffWriter::create(&partial, width, height, options)?;
        debug!(
            path = %partial.display(),
            levels = writer.level_count(),
            "Created output pyramid"
        );
        match self.render(classes, writer).await {
            Ok(partial) => Ok(StagedOutput {
                partial,
                path: path.to_path_buf(),
            }),
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn produce(
        &self,
        classes: &Arc<ClassGrid>,
        layout: &TileGrid,
        tx: mpsc::Sender<RenderedTile>,
    ) -> Result<(), ReassemblyError> {
        for cell in layout.cells() {
            let source = match &self.overlay {
                Some(overlay) => Some(
                    overlay
                        .source
                        .read_region(cell.x, cell.y, cell.width, cell.height)
                        .await?,
                ),
                None => None,
            };

            let classes = classes.clone();
            let colors = self.colors;
            let weight = self.overlay.as_ref().map_or(0.0, |o| o.weight);
            let image = tokio::task::spawn_blocking(move || match source {
                Some(source) => classes.render_overlay(&colors, &source, weight, cell.x, cell.y),
                None => classes.render(&colors, cell.x, cell.y, cell.width, cell.height),
            })
            .await
            .map_err(|e| OutputError::Encode(format!("render task failed: {}", e)))?;

            if tx
                .send(RenderedTile {
                    col: cell.col,
                    row: cell.row,
                    image,
                })
                .await
                .is_err()
            {
                // Writer stopped early; its error is reported by the caller
                debug!(col = cell.col, row = cell.row, "Writer closed the render queue");
                return Ok(());
            }
        }
        Ok(())
    }
}
