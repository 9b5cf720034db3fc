//! Per-slide state machine and batch driver.
//!
//! ```text
//! Pending ──▶ Tiling ──▶ Inferring ──▶ Reassembling ──▶ Done
//!    │           │            │              │
//!    │           └────────────┴──────────────┴──────▶ Error
//!    └── output exists ──────────────────────────────▶ Done (skipped)
//! ```
//!
//! The output image is the skip checkpoint, the tile cache is the tiling
//! checkpoint and the cached prediction table is the inference checkpoint.
//! A failed slide keeps its cache so the next run resumes it.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::format::tiff::WriterOptions;
use crate::inference::{
    append_table, read_table, write_table, ColorMap, GleasonLabel, InferenceOrchestrator,
    PredictionRecord, PreprocessChain, TileClassifier,
};
use crate::render::{ClassGrid, Overlay, Reassembler, StagedOutput};
use crate::slide::{open_slide, RegionSource, SlideJob};
use crate::tile::{FsTileStore, TileGenerator, TileGrid, TileStore};

/// Name of the prediction table kept in a slide's cache.
pub const CACHED_PREDICTIONS: &str = "predictions.csv";

// =============================================================================
// Configuration
// =============================================================================

/// Read-only settings for one run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_root: PathBuf,
    pub cache_root: PathBuf,
    /// Table every slide's predictions are appended to
    pub predictions: Option<PathBuf>,
    /// Classification tile edge in pixels
    pub tile_size: u32,
    pub tile_concurrency: usize,
    pub batch_size: usize,
    /// Decoded source tiles kept per slide
    pub source_tile_cache: usize,
    /// Blend weight of the class colors, when an overlay is requested
    pub overlay: Option<f32>,
    pub writer: WriterOptions,
    pub colors: ColorMap,
}

// =============================================================================
// States and reports
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideState {
    Pending,
    Tiling,
    Inferring,
    Reassembling,
    Done,
    Error,
}

impl fmt::Display for SlideState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlideState::Pending => "pending",
            SlideState::Tiling => "tiling",
            SlideState::Inferring => "inferring",
            SlideState::Reassembling => "reassembling",
            SlideState::Done => "done",
            SlideState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum SlideOutcome {
    /// The class map was written
    Written(PathBuf),
    /// The output already existed
    Skipped(PathBuf),
    Failed {
        /// State the slide was in when it failed
        stage: SlideState,
        error: PipelineError,
    },
}

#[derive(Debug)]
pub struct SlideReport {
    pub id: String,
    pub source: PathBuf,
    pub outcome: SlideOutcome,
}

impl SlideReport {
    pub fn state(&self) -> SlideState {
        match self.outcome {
            SlideOutcome::Written(_) | SlideOutcome::Skipped(_) => SlideState::Done,
            SlideOutcome::Failed { .. } => SlideState::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state() == SlideState::Done
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match &self.outcome {
            SlideOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for SlideReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            SlideOutcome::Written(path) => write!(f, "{}: done, {}", self.id, path.display()),
            SlideOutcome::Skipped(path) => {
                write!(f, "{}: skipped, {} exists", self.id, path.display())
            }
            SlideOutcome::Failed { stage, error } => write!(
                f,
                "{}: {} during {}: {}",
                self.id,
                error.kind(),
                stage,
                error
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub slides: Vec<SlideReport>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.slides.iter().filter(|s| s.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.slides.len() - self.succeeded()
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Drives slides through tiling, inference and reassembly.
pub struct SlideController {
    config: PipelineConfig,
    generator: TileGenerator,
    inference: InferenceOrchestrator,
}

/// Tracks a slide's current state and logs every transition.
struct Progress<'a> {
    slide: &'a str,
    state: SlideState,
}

impl<'a> Progress<'a> {
    fn new(slide: &'a str) -> Self {
        Self {
            slide,
            state: SlideState::Pending,
        }
    }

    fn advance(&mut self, next: SlideState) {
        info!(slide = self.slide, from = %self.state, to = %next, "Slide state changed");
        self.state = next;
    }
}

impl SlideController {
    pub fn new(
        config: PipelineConfig,
        classifier: Arc<dyn TileClassifier>,
        chain: PreprocessChain,
    ) -> Self {
        let generator = TileGenerator::new(config.tile_size, config.tile_concurrency);
        let inference = InferenceOrchestrator::new(classifier, Arc::new(chain), config.batch_size);
        Self {
            config,
            generator,
            inference,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process every input in order; a failing slide does not stop the batch.
    pub async fn run_batch(&self, inputs: &[PathBuf]) -> BatchReport {
        let mut report = BatchReport::default();
        let mut seen = HashSet::new();

        for (index, input) in inputs.iter().enumerate() {
            info!(
                slide = index + 1,
                of = inputs.len(),
                input = %input.display(),
                "Processing input"
            );

            let job = match SlideJob::new(
                input.clone(),
                &self.config.output_root,
                &self.config.cache_root,
            ) {
                Ok(job) => job,
                Err(error) => {
                    report.slides.push(failed(input, String::new(), SlideState::Pending, error));
                    continue;
                }
            };
            if !seen.insert(job.id.clone()) {
                let error = PipelineError::DuplicateSlideId(job.id.clone());
                report.slides.push(failed(input, job.id, SlideState::Pending, error));
                continue;
            }

            report.slides.push(self.run_slide(&job).await);
        }

        info!(
            slides = report.slides.len(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Batch finished"
        );
        report
    }

    /// Process one slide to completion or failure.
    pub async fn run_slide(&self, job: &SlideJob) -> SlideReport {
        let mut progress = Progress::new(&job.id);
        let outcome = match self.process(job, &mut progress).await {
            Ok(outcome) => outcome,
            Err(error) => {
                let stage = progress.state;
                progress.advance(SlideState::Error);
                error!(
                    slide = %job.id,
                    kind = error.kind(),
                    stage = %stage,
                    error = %error,
                    cache = %job.cache_dir.display(),
                    "Slide failed, cache kept for resume"
                );
                SlideOutcome::Failed { stage, error }
            }
        };

        SlideReport {
            id: job.id.clone(),
            source: job.source.clone(),
            outcome,
        }
    }

    async fn process(
        &self,
        job: &SlideJob,
        progress: &mut Progress<'_>,
    ) -> Result<SlideOutcome, PipelineError> {
        if tokio::fs::try_exists(&job.output).await? {
            info!(slide = %job.id, output = %job.output.display(), "Output exists, skipping");
            remove_cache(job).await?;
            progress.advance(SlideState::Done);
            return Ok(SlideOutcome::Skipped(job.output.clone()));
        }

        let source = open_slide(&job.source, self.config.source_tile_cache).await?;
        let (width, height) = source.dimensions();
        let grid = TileGrid::new(width, height, self.config.tile_size);
        if grid.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "{} has no pixels",
                job.source.display()
            )));
        }
        if !grid.is_encodable() {
            return Err(PipelineError::SlideTooLarge { width, height });
        }

        progress.advance(SlideState::Tiling);
        let store = FsTileStore::open(&job.cache_dir)
            .await
            .map_err(|e| PipelineError::Io(e.to_string()))?;
        let generated = self.generator.generate(&job.id, source.clone(), &store).await?;
        if let Some((first, _)) = generated.failed.first() {
            return Err(PipelineError::TileExtraction {
                failed: generated.failed.len(),
                first: first.clone(),
            });
        }

        progress.advance(SlideState::Inferring);
        let records = self.predictions(job, &store).await?;

        progress.advance(SlideState::Reassembling);
        let staged = self.reassemble(job, source, width, height, &records).await?;

        // A published output always has its rows in the table
        if let Some(table) = self.config.predictions.clone() {
            if let Err(e) = blocking(move || append_table(&table, &records)).await {
                staged.discard().await;
                return Err(e);
            }
        }
        let output = staged.publish().await?;

        remove_cache(job).await?;
        progress.advance(SlideState::Done);
        Ok(SlideOutcome::Written(output))
    }

    /// Cached predictions when they cover exactly the cached tiles, fresh ones otherwise.
    async fn predictions(
        &self,
        job: &SlideJob,
        store: &FsTileStore,
    ) -> Result<Vec<PredictionRecord>, PipelineError> {
        let table = job.cache_dir.join(CACHED_PREDICTIONS);

        if tokio::fs::try_exists(&table).await? {
            let path = table.clone();
            match blocking(move || read_table(&path)).await {
                Ok(records) => {
                    let names: BTreeSet<String> = store
                        .names()
                        .await
                        .map_err(|e| PipelineError::Io(e.to_string()))?
                        .into_iter()
                        .collect();
                    let predicted: BTreeSet<String> =
                        records.iter().map(|r| r.tile.clone()).collect();
                    if predicted == names && records.len() == names.len() {
                        info!(slide = %job.id, records = records.len(), "Reusing cached predictions");
                        return Ok(records);
                    }
                    debug!(slide = %job.id, "Cached predictions are stale");
                }
                Err(e) => warn!(slide = %job.id, error = %e, "Ignoring invalid cached predictions"),
            }
        }

        let records = self.inference.run(&job.id, store).await?;
        let stored = records.clone();
        blocking(move || write_table(&table, &stored)).await?;
        Ok(records)
    }

    async fn reassemble(
        &self,
        job: &SlideJob,
        source: Arc<dyn RegionSource>,
        width: u32,
        height: u32,
        records: &[PredictionRecord],
    ) -> Result<StagedOutput, PipelineError> {
        let classes = Arc::new(ClassGrid::from_records(
            &job.id,
            width,
            height,
            self.config.tile_size,
            records,
        )?);
        let histogram: Vec<String> = GleasonLabel::ALL
            .iter()
            .zip(classes.histogram())
            .map(|(label, count)| format!("{}={}", label, count))
            .collect();
        info!(slide = %job.id, classes = %histogram.join(" "), "Classified tiles");

        let mut reassembler = Reassembler::new(self.config.colors);
        if let Some(weight) = self.config.overlay {
            reassembler = reassembler.with_overlay(Overlay {
                source: source.clone(),
                weight,
            });
        }

        let mut options = self.config.writer.clone();
        options.resolution = options.resolution.or(source.resolution());
        options.description.get_or_insert_with(|| {
            format!(
                "Gleason {} of {}",
                if self.config.overlay.is_some() { "overlay" } else { "class map" },
                job.id
            )
        });

        if let Some(parent) = job.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(reassembler
            .stage_tiff(classes, &job.output, options)
            .await?)
    }
}

fn failed(input: &Path, id: String, stage: SlideState, error: PipelineError) -> SlideReport {
    error!(input = %input.display(), kind = error.kind(), error = %error, "Input rejected");
    SlideReport {
        id,
        source: input.to_path_buf(),
        outcome: SlideOutcome::Failed { stage, error },
    }
}

async fn remove_cache(job: &SlideJob) -> Result<(), PipelineError> {
    if tokio::fs::try_exists(&job.cache_dir).await? {
        tokio::fs::remove_dir_all(&job.cache_dir).await?;
        debug!(slide = %job.id, cache = %job.cache_dir.display(), "Removed slide cache");
    }
    Ok(())
}

async fn blocking<T, E, F>(f: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<PipelineError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Io(format!("background task failed: {}", e)))?
        .map_err(Into::into)
}

/// Expand directories among `inputs` into their files, sorted by name.
///
/// Hidden files are ignored.
pub fn expand_inputs(inputs: &[PathBuf]) -> std::io::Result<Vec<PathBuf>> {
    let mut expanded = Vec::new();
    for input in inputs {
        if !input.is_dir() {
            expanded.push(input.clone());
            continue;
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(input)? {
            let entry = entry?;
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if entry.file_type()?.is_file() && !hidden {
                files.push(entry.path());
            }
        }
        files.sort();
        expanded.extend(files);
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_inputs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.svs"), b"").unwrap();
        std::fs::write(dir.path().join("a.svs"), b"").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), b"").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let single = dir.path().join("x.tiff");
        let expanded = expand_inputs(&[dir.path().to_path_buf(), single.clone()]).unwrap();
        assert_eq!(
            expanded,
            vec![dir.path().join("a.svs"), dir.path().join("b.svs"), single]
        );
    }

    #[test]
    fn test_report_display() {
        let report = SlideReport {
            id: "s".to_string(),
            source: PathBuf::from("s.svs"),
            outcome: SlideOutcome::Failed {
                stage: SlideState::Tiling,
                error: PipelineError::SlideTooLarge {
                    width: 2_000_000,
                    height: 10,
                },
            },
        };
        assert_eq!(report.state(), SlideState::Error);
        assert!(report.to_string().starts_with("s: SlideTooLarge during tiling"));
    }
}
