//! Per-tile predictions and the prediction table.
//!
//! The table is a CSV with one row per tile:
//!
//! ```text
//! A_S,A_D,R,G3,G4,G5,sample,class
//! 0.01,0.9,0.05,0.02,0.01,0.01,slide_000000_000000,A_D
//! ```
//!
//! `sample` is the tile name without its extension.

use std::fs::{File, OpenOptions};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, TableError};
use crate::tile::TILE_EXTENSION;

use super::labels::{GleasonLabel, LABEL_COUNT};

/// Allowed deviation of a probability vector's sum from one.
pub const PROBABILITY_TOLERANCE: f32 = 1e-3;

/// Model output for one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    /// Tile file name
    pub tile: String,
    pub probabilities: [f32; LABEL_COUNT],
    /// Argmax of `probabilities`
    pub label: GleasonLabel,
}

impl PredictionRecord {
    /// Validate a model output vector and derive its label.
    pub fn new(tile: impl Into<String>, probabilities: &[f32]) -> Result<Self, ModelError> {
        let tile = tile.into();
        let invalid = |reason: String| ModelError::InvalidProbabilityVector {
            tile: tile.clone(),
            reason,
        };

        let probabilities: [f32; LABEL_COUNT] = probabilities.try_into().map_err(|_| {
            invalid(format!(
                "expected {} values, got {}",
                LABEL_COUNT,
                probabilities.len()
            ))
        })?;

        if let Some(p) = probabilities.iter().find(|p| !p.is_finite()) {
            return Err(invalid(format!("non-finite value {}", p)));
        }
        if let Some(p) = probabilities.iter().find(|p| **p < 0.0) {
            return Err(invalid(format!("negative value {}", p)));
        }
        let sum: f32 = probabilities.iter().sum();
        if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(invalid(format!("values sum to {}", sum)));
        }

        let label = argmax(&probabilities);
        Ok(Self {
            tile,
            probabilities,
            label,
        })
    }

    pub fn probability(&self, label: GleasonLabel) -> f32 {
        self.probabilities[label.index()]
    }
}

/// Label of the largest probability; the first one wins on ties.
pub fn argmax(probabilities: &[f32; LABEL_COUNT]) -> GleasonLabel {
    let mut best = 0;
    for (i, p) in probabilities.iter().enumerate().skip(1) {
        if *p > probabilities[best] {
            best = i;
        }
    }
    GleasonLabel::ALL[best]
}

// =============================================================================
// Prediction table
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct PredictionRow {
    #[serde(rename = "A_S")]
    artefact_sponge: f32,
    #[serde(rename = "A_D")]
    artefact_empty: f32,
    #[serde(rename = "R")]
    regular: f32,
    #[serde(rename = "G3")]
    grade3: f32,
    #[serde(rename = "G4")]
    grade4: f32,
    #[serde(rename = "G5")]
    grade5: f32,
    sample: String,
    class: String,
}

impl From<&PredictionRecord> for PredictionRow {
    fn from(record: &PredictionRecord) -> Self {
        let [a_s, a_d, r, g3, g4, g5] = record.probabilities;
        let suffix = format!(".{}", TILE_EXTENSION);
        let sample = record
            .tile
            .strip_suffix(&suffix)
            .unwrap_or(&record.tile)
            .to_string();
        Self {
            artefact_sponge: a_s,
            artefact_empty: a_d,
            regular: r,
            grade3: g3,
            grade4: g4,
            grade5: g5,
            sample,
            class: record.label.code().to_string(),
        }
    }
}

impl TryFrom<PredictionRow> for PredictionRecord {
    type Error = TableError;

    fn try_from(row: PredictionRow) -> Result<Self, Self::Error> {
        let class: GleasonLabel = row.class.parse()?;
        let record = PredictionRecord::new(
            format!("{}.{}", row.sample, TILE_EXTENSION),
            &[
                row.artefact_sponge,
                row.artefact_empty,
                row.regular,
                row.grade3,
                row.grade4,
                row.grade5,
            ],
        )?;
        if record.label != class {
            return Err(TableError::ClassMismatch {
                sample: row.sample,
                class: class.to_string(),
                argmax: record.label.to_string(),
            });
        }
        Ok(record)
    }
}

/// Write a complete table, replacing any existing file.
///
/// The table is written next to `path` and renamed into place, so a reader
/// never sees a partial table.
pub fn write_table(path: &Path, records: &[PredictionRecord]) -> Result<(), TableError> {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = std::path::PathBuf::from(partial);

    let mut writer = csv::Writer::from_path(&partial)?;
    for record in records {
        writer.serialize(PredictionRow::from(record))?;
    }
    writer.flush()?;
    drop(writer);

    std::fs::rename(&partial, path)?;
    Ok(())
}

/// Append rows to a table, writing the header only when the file is new or empty.
pub fn append_table(path: &Path, records: &[PredictionRecord]) -> Result<(), TableError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let has_header = file.metadata()?.len() > 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(!has_header)
        .from_writer(file);
    for record in records {
        writer.serialize(PredictionRow::from(record))?;
    }
    writer.flush()?;
    Ok(())
}

/// Read every row of a table.
pub fn read_table(path: &Path) -> Result<Vec<PredictionRecord>, TableError> {
    let mut reader = csv::Reader::from_reader(File::open(path)?);
    reader
        .deserialize::<PredictionRow>()
        .map(|row| PredictionRecord::try_from(row?))
        .collect()
}
