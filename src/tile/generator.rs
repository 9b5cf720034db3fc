//! Tile grid extraction into the slide cache.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::error::{CodecError, ExtractionError};
use crate::slide::RegionSource;

use super::codec::TileName;
use super::encoder::encode_png;
use super::grid::{TileCell, TileGrid};
use super::store::TileStore;

/// Outcome of a grid sweep.
#[derive(Debug, Default)]
pub struct GenerationReport {
    /// Tiles extracted and stored by this sweep
    pub written: usize,
    /// Tiles already present in the store
    pub skipped: usize,
    /// Tiles that could not be extracted, with the reason
    pub failed: Vec<(String, ExtractionError)>,
}

impl GenerationReport {
    pub fn total(&self) -> usize {
        self.written + self.skipped + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

enum TileOutcome {
    Written,
    Skipped,
    Failed(String, ExtractionError),
}

/// Sweeps a slide's tile grid and writes every missing tile to a store.
#[derive(Debug, Clone)]
pub struct TileGenerator {
    tile_size: u32,
    concurrency: usize,
}

impl TileGenerator {
    pub fn new(tile_size: u32, concurrency: usize) -> Self {
        Self {
            tile_size,
            concurrency: concurrency.max(1),
        }
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Extract every grid cell of `source` that `store` does not hold yet.
    ///
    /// Per-tile failures are collected in the report and do not stop the
    /// sweep. A codec error means a tile name cannot be formed at all and
    /// aborts before anything is read.
    pub async fn generate(
        &self,
        slide_id: &str,
        source: Arc<dyn RegionSource>,
        store: &dyn TileStore,
    ) -> Result<GenerationReport, CodecError> {
        let (width, height) = source.dimensions();
        let grid = TileGrid::new(width, height, self.tile_size);

        let cells = grid
            .cells()
            .map(|cell| Ok((TileName::new(slide_id, cell.x, cell.y)?.to_string(), cell)))
            .collect::<Result<Vec<(String, TileCell)>, CodecError>>()?;

        info!(
            slide = slide_id,
            width,
            height,
            tile_size = self.tile_size,
            tiles = cells.len(),
            concurrency = self.concurrency,
            "Generating tiles"
        );

        let outcomes: Vec<TileOutcome> = stream::iter(cells)
            .map(|(name, cell)| {
                let source = source.clone();
                async move { extract_tile(name, cell, source, store).await }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = GenerationReport::default();
        for outcome in outcomes {
            match outcome {
                TileOutcome::Written => report.written += 1,
                TileOutcome::Skipped => report.skipped += 1,
                TileOutcome::Failed(name, err) => {
                    warn!(slide = slide_id, tile = %name, error = %err, "Tile extraction failed");
                    report.failed.push((name, err));
                }
            }
        }
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));

        info!(
            slide = slide_id,
            written = report.written,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Tile generation finished"
        );
        Ok(report)
    }
}

async fn extract_tile(
    name: String,
    cell: TileCell,
    source: Arc<dyn RegionSource>,
    store: &dyn TileStore,
) -> TileOutcome {
    match store.contains(&name).await {
        Ok(true) => return TileOutcome::Skipped,
        Ok(false) => {}
        Err(e) => return TileOutcome::Failed(name, ExtractionError::Write(e.to_string())),
    }

    let pixels = match source.read_region(cell.x, cell.y, cell.width, cell.height).await {
        Ok(pixels) => pixels,
        Err(e) => return TileOutcome::Failed(name, ExtractionError::Read(e)),
    };

    let encoded = match tokio::task::spawn_blocking(move || encode_png(&pixels)).await {
        Ok(Ok(data)) => data,
        Ok(Err(e)) => return TileOutcome::Failed(name, e),
        Err(e) => return TileOutcome::Failed(name, ExtractionError::Encode(e.to_string())),
    };

    if let Err(e) = store.insert(&name, encoded).await {
        return TileOutcome::Failed(name, ExtractionError::Write(e.to_string()));
    }

    debug!(tile = %name, "Wrote tile");
    TileOutcome::Written
}
