//! Batched classification of a slide's cached tiles.

use std::sync::Arc;

use image::RgbImage;
use tracing::{debug, info};

use crate::error::{CodecError, ModelError, PipelineError};
use crate::tile::{decode_png, TileName, TileStore};

use super::model::TileClassifier;
use super::preprocess::PreprocessChain;
use super::record::PredictionRecord;

/// Default number of tiles per model invocation.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Runs every cached tile of a slide through preprocessing and the model.
#[derive(Clone)]
pub struct InferenceOrchestrator {
    classifier: Arc<dyn TileClassifier>,
    chain: Arc<PreprocessChain>,
    batch_size: usize,
}

impl InferenceOrchestrator {
    pub fn new(
        classifier: Arc<dyn TileClassifier>,
        chain: Arc<PreprocessChain>,
        batch_size: usize,
    ) -> Self {
        Self {
            classifier,
            chain,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Classify all tiles in `store`, in name order.
    ///
    /// Every tile name must decode and belong to `slide_id`. Any model
    /// failure or invalid output vector aborts the whole slide.
    pub async fn run(
        &self,
        slide_id: &str,
        store: &dyn TileStore,
    ) -> Result<Vec<PredictionRecord>, PipelineError> {
        let names = store
            .names()
            .await
            .map_err(|e| PipelineError::Io(e.to_string()))?;

        let mut tiles = Vec::with_capacity(names.len());
        for name in names {
            let decoded = TileName::parse(&name)?;
            if decoded.slide_id != slide_id {
                return Err(CodecError::MalformedTileName {
                    name,
                    reason: "tile belongs to a different slide",
                }
                .into());
            }
            tiles.push(name);
        }

        let batches = tiles.len().div_ceil(self.batch_size);
        info!(
            slide = slide_id,
            tiles = tiles.len(),
            batches,
            batch_size = self.batch_size,
            family = %self.classifier.family(),
            "Running inference"
        );

        let mut records = Vec::with_capacity(tiles.len());
        for (index, batch) in tiles.chunks(self.batch_size).enumerate() {
            let mut encoded = Vec::with_capacity(batch.len());
            for name in batch {
                let data = store
                    .read(name)
                    .await
                    .map_err(|e| PipelineError::Io(format!("read tile {}: {}", name, e)))?;
                encoded.push((name.clone(), data));
            }

            let classifier = self.classifier.clone();
            let chain = self.chain.clone();
            let (names, vectors) = tokio::task::spawn_blocking(move || {
                classify_batch(encoded, classifier.as_ref(), chain.as_ref())
            })
            .await
            .map_err(|e| ModelError::Invocation(format!("inference task failed: {}", e)))??;

            for (name, vector) in names.into_iter().zip(vectors) {
                records.push(PredictionRecord::new(name, &vector)?);
            }
            debug!(slide = slide_id, batch = index + 1, of = batches, "Batch classified");
        }

        info!(slide = slide_id, records = records.len(), "Inference finished");
        Ok(records)
    }
}

type EncodedTile = (String, bytes::Bytes);

/// Decode, preprocess and classify one batch on the blocking pool.
fn classify_batch(
    encoded: Vec<EncodedTile>,
    classifier: &dyn TileClassifier,
    chain: &PreprocessChain,
) -> Result<(Vec<String>, Vec<Vec<f32>>), PipelineError> {
    let mut names = Vec::with_capacity(encoded.len());
    let mut pixels: Vec<RgbImage> = Vec::with_capacity(encoded.len());
    for (name, data) in encoded {
        let image = decode_png(&data)
            .map_err(|e| PipelineError::Io(format!("decode tile {}: {}", name, e)))?;
        pixels.push(chain.apply(image));
        names.push(name);
    }

    let vectors = classifier.predict(&pixels)?;
    if vectors.len() != names.len() {
        return Err(ModelError::BatchSizeMismatch {
            expected: names.len(),
            actual: vectors.len(),
        }
        .into());
    }
    Ok((names, vectors))
}
