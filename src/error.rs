use thiserror::Error;

/// I/O errors that can occur when reading slide files
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Error reported by the operating system
    #[error("I/O error: {0}")]
    Os(String),

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// File not found
    #[error("File not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => IoError::NotFound(err.to_string()),
            _ => IoError::Os(err.to_string()),
        }
    }
}

/// Errors related to format detection and region decoding
#[derive(Debug, Clone, Error)]
pub enum FormatError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// TIFF parsing error
    #[error("TIFF error: {0}")]
    Tiff(#[from] TiffError),

    /// File format is not supported
    #[error("Unsupported format: {reason}")]
    UnsupportedFormat { reason: String },

    /// Pixel data could not be decoded
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Requested region lies outside the image
    #[error("Region {x},{y} {width}x{height} outside image of {image_width}x{image_height}")]
    RegionOutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    },
}

/// Errors that can occur when parsing TIFF files
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42 (TIFF) or 43 (BigTIFF), got {0}")]
    InvalidVersion(u16),

    /// Invalid BigTIFF offset byte size (must be 8)
    #[error("Invalid BigTIFF offset byte size: expected 8, got {0}")]
    InvalidBigTiffOffsetSize(u16),

    /// File is too small to contain a valid TIFF header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside file or to invalid location)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// Required tag is missing from IFD
    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    /// Tag has unexpected type or count
    #[error("Invalid tag value for {tag}: {message}")]
    InvalidTagValue { tag: &'static str, message: String },

    /// Unsupported compression scheme
    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),

    /// Unknown field type in IFD entry
    #[error("Unknown field type: {0}")]
    UnknownFieldType(u16),
}

/// Errors from the tile coordinate codec
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The file name does not follow `{slide}_{x:06}_{y:06}.png`
    #[error("Malformed tile name '{name}': {reason}")]
    MalformedTileName { name: String, reason: &'static str },

    /// A coordinate does not fit in the six-digit field
    #[error("Tile coordinate ({x}, {y}) exceeds the 6-digit limit of 999999")]
    CoordinateTooLarge { x: u32, y: u32 },
}

/// Failure to extract a single tile from the source slide.
///
/// These are recoverable during the grid sweep and aggregated per slide.
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    /// The source region could not be read or decoded
    #[error("region read failed: {0}")]
    Read(#[from] FormatError),

    /// The tile could not be encoded as PNG
    #[error("tile encoding failed: {0}")]
    Encode(String),

    /// The tile could not be written to the cache
    #[error("tile write failed: {0}")]
    Write(String),
}

/// Errors raised by the model collaborator or while checking its output
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// The model could not be loaded or started
    #[error("Model load failed: {0}")]
    Load(String),

    /// A batch invocation failed
    #[error("Model invocation failed: {0}")]
    Invocation(String),

    /// The model returned a different number of vectors than tiles sent
    #[error("Model returned {actual} predictions for a batch of {expected} tiles")]
    BatchSizeMismatch { expected: usize, actual: usize },

    /// A returned probability vector is not a valid distribution
    #[error("Invalid probability vector for {tile}: {reason}")]
    InvalidProbabilityVector { tile: String, reason: String },
}

/// Invariant violations detected while reassembling predictions
#[derive(Debug, Clone, Error)]
pub enum ReassemblyError {
    /// A record's tile name could not be decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A record belongs to a different slide
    #[error("Tile {tile} does not belong to slide {expected}")]
    SlideMismatch { tile: String, expected: String },

    /// A record's coordinates are not on the tile grid
    #[error("Tile {tile} at ({x}, {y}) is not aligned to the {tile_size}px grid")]
    MisalignedTile {
        tile: String,
        x: u32,
        y: u32,
        tile_size: u32,
    },

    /// A record's coordinates fall outside the slide
    #[error("Tile {tile} at ({x}, {y}) lies outside the {width}x{height} slide")]
    CoordinateOutOfRange {
        tile: String,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    /// Two records map to the same grid cell
    #[error("Duplicate prediction for cell ({x}, {y}) from {tile}")]
    DuplicateTile { tile: String, x: u32, y: u32 },

    /// Some grid cells have no record
    #[error("{missing} of {expected} grid cells have no prediction (first missing at ({first_x}, {first_y}))")]
    IncompleteReassembly {
        missing: usize,
        expected: usize,
        first_x: u32,
        first_y: u32,
    },

    /// The source could not be read for overlay blending
    #[error("Overlay source read failed: {0}")]
    Source(#[from] FormatError),

    /// The output stream failed
    #[error(transparent)]
    Output(#[from] OutputError),
}

/// Errors from the pyramidal output writer
#[derive(Debug, Clone, Error)]
pub enum OutputError {
    /// Underlying file I/O failed
    #[error("Output I/O error: {0}")]
    Io(String),

    /// Tile compression or decompression failed
    #[error("Output encoding error: {0}")]
    Encode(String),

    /// Tiles must be written in row-major order
    #[error("Tile ({col}, {row}) written out of order, expected ({expected_col}, {expected_row})")]
    OutOfOrder {
        col: u32,
        row: u32,
        expected_col: u32,
        expected_row: u32,
    },

    /// A tile has the wrong pixel dimensions
    #[error("Tile ({col}, {row}) is {width}x{height}, expected {expected_width}x{expected_height}")]
    TileSize {
        col: u32,
        row: u32,
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },

    /// Invalid output geometry
    #[error("Invalid output geometry: {0}")]
    Geometry(String),

    /// Fewer tiles than the grid requires were written
    #[error("Output closed after {written} of {expected} tiles")]
    Incomplete { written: u64, expected: u64 },

    /// The writer thread went away
    #[error("Output writer stopped unexpectedly")]
    WriterGone,
}

impl From<std::io::Error> for OutputError {
    fn from(err: std::io::Error) -> Self {
        OutputError::Io(err.to_string())
    }
}

/// Errors reading or writing prediction tables
#[derive(Debug, Clone, Error)]
pub enum TableError {
    /// CSV parse or write failure
    #[error("CSV error: {0}")]
    Csv(String),

    /// Underlying file I/O failed
    #[error("Table I/O error: {0}")]
    Io(String),

    /// The class column holds a label outside the fixed label set
    #[error("Unknown class label '{0}'")]
    UnknownLabel(String),

    /// A row's probabilities are not a valid distribution
    #[error(transparent)]
    InvalidRow(#[from] ModelError),

    /// The class column disagrees with the row's largest probability
    #[error("Row '{sample}' is labelled {class} but its largest probability is {argmax}")]
    ClassMismatch {
        sample: String,
        class: String,
        argmax: String,
    },
}

impl From<csv::Error> for TableError {
    fn from(err: csv::Error) -> Self {
        TableError::Csv(err.to_string())
    }
}

impl From<std::io::Error> for TableError {
    fn from(err: std::io::Error) -> Self {
        TableError::Io(err.to_string())
    }
}

/// Errors that move a slide job into the `Error` state
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Tile cache held a malformed or foreign file name
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// One or more tiles failed to extract
    #[error("{failed} tile(s) failed to extract, first: {first}")]
    TileExtraction { failed: usize, first: String },

    /// Model collaborator failure
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Reassembly invariant violation or output failure
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),

    /// Source slide could not be opened
    #[error(transparent)]
    Format(#[from] FormatError),

    /// Prediction table failure
    #[error(transparent)]
    Table(#[from] TableError),

    /// Two inputs in one batch map to the same slide identifier
    #[error("Slide identifier '{0}' is used by more than one input")]
    DuplicateSlideId(String),

    /// An input path cannot be turned into a slide job
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Slide dimensions cannot be expressed in tile names
    #[error("Slide of {width}x{height} exceeds the 6-digit tile coordinate limit")]
    SlideTooLarge { width: u32, height: u32 },

    /// Cache or output directory handling failed
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

impl From<OutputError> for PipelineError {
    fn from(err: OutputError) -> Self {
        PipelineError::Reassembly(ReassemblyError::Output(err))
    }
}

impl PipelineError {
    /// Short, stable name of the error kind for user-facing reports.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Codec(CodecError::MalformedTileName { .. }) => "MalformedTileName",
            PipelineError::Codec(CodecError::CoordinateTooLarge { .. }) => "CoordinateTooLarge",
            PipelineError::TileExtraction { .. } => "TileExtractionFailure",
            PipelineError::Model(ModelError::InvalidProbabilityVector { .. }) => {
                "InvalidProbabilityVector"
            }
            PipelineError::Model(_) => "ModelInvocationFailure",
            PipelineError::Reassembly(err) => match err {
                ReassemblyError::Codec(_) => "MalformedTileName",
                ReassemblyError::SlideMismatch { .. } => "SlideMismatch",
                ReassemblyError::MisalignedTile { .. } => "MisalignedTile",
                ReassemblyError::CoordinateOutOfRange { .. } => "CoordinateOutOfRange",
                ReassemblyError::DuplicateTile { .. } => "DuplicateTile",
                ReassemblyError::IncompleteReassembly { .. } => "IncompleteReassembly",
                ReassemblyError::Source(_) => "SourceReadFailure",
                ReassemblyError::Output(_) => "OutputWriteFailure",
            },
            PipelineError::Format(_) => "UnsupportedSlide",
            PipelineError::Table(_) => "PredictionTableFailure",
            PipelineError::DuplicateSlideId(_) => "DuplicateSlideId",
            PipelineError::InvalidInput(_) => "InvalidInput",
            PipelineError::SlideTooLarge { .. } => "SlideTooLarge",
            PipelineError::Io(_) => "IoFailure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_from_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.svs");
        assert!(matches!(IoError::from(err), IoError::NotFound(_)));
    }

    #[test]
    fn test_kind_names() {
        let err = PipelineError::from(ReassemblyError::DuplicateTile {
            tile: "s_000000_000000.png".to_string(),
            x: 0,
            y: 0,
        });
        assert_eq!(err.kind(), "DuplicateTile");

        let err = PipelineError::from(ModelError::Invocation("boom".to_string()));
        assert_eq!(err.kind(), "ModelInvocationFailure");

        let err = PipelineError::TileExtraction {
            failed: 2,
            first: "a".to_string(),
        };
        assert_eq!(err.kind(), "TileExtractionFailure");
    }

    #[test]
    fn test_output_error_wraps_into_reassembly() {
        let err = PipelineError::from(OutputError::WriterGone);
        assert_eq!(err.kind(), "OutputWriteFailure");
    }
}
