//! Inference stage.
//!
//! Cached tiles are decoded, run through a [`PreprocessChain`] and classified
//! in batches by a [`TileClassifier`]. Each returned vector is validated and
//! becomes a [`PredictionRecord`] keyed by the tile's file name.

mod labels;
mod model;
mod orchestrator;
mod preprocess;
mod record;

pub use labels::{ColorMap, GleasonLabel, LABEL_COUNT};
pub use model::{
    sanitize_layer_name, sanitize_model_config, CommandClassifier, Device, ModelFamily,
    ModelLaunch, ModelManifest, TileClassifier,
};
pub use orchestrator::{InferenceOrchestrator, DEFAULT_BATCH_SIZE};
pub use preprocess::{
    LabStatistics, PreprocessChain, Preprocessor, Resize, SquarePadding, StainNormalization,
};
pub use record::{
    append_table, argmax, read_table, write_table, PredictionRecord, PROBABILITY_TOLERANCE,
};
