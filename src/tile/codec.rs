//! Tile file names.
//!
//! A cached tile is named `{slide_id}_{x:06}_{y:06}.png`, where `(x, y)` is
//! the top-left pixel of the tile in the full-resolution slide. The name is
//! the tile's only durable identity: inference and reassembly relocate a
//! prediction purely by decoding it.
//!
//! Slide identifiers may contain `_`; the last two fields are always the
//! coordinates.

use std::fmt;

use crate::error::CodecError;

/// Largest coordinate that fits in the six-digit field.
pub const MAX_COORDINATE: u32 = 999_999;

/// Extension of tile files, without the dot.
pub const TILE_EXTENSION: &str = "png";

const COORDINATE_WIDTH: usize = 6;

/// Decoded tile name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileName {
    pub slide_id: String,
    pub x: u32,
    pub y: u32,
}

impl TileName {
    /// Validate and build a tile name.
    pub fn new(slide_id: impl Into<String>, x: u32, y: u32) -> Result<Self, CodecError> {
        let slide_id = slide_id.into();
        if x > MAX_COORDINATE || y > MAX_COORDINATE {
            return Err(CodecError::CoordinateTooLarge { x, y });
        }
        if slide_id.is_empty() {
            return Err(CodecError::MalformedTileName {
                name: format!("_{:06}_{:06}.{}", x, y, TILE_EXTENSION),
                reason: "empty slide identifier",
            });
        }
        Ok(Self { slide_id, x, y })
    }

    /// Parse a tile file name.
    pub fn parse(name: &str) -> Result<Self, CodecError> {
        let malformed = |reason: &'static str| CodecError::MalformedTileName {
            name: name.to_string(),
            reason,
        };

        let stem = name
            .strip_suffix(TILE_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(|| malformed("missing .png extension"))?;

        let mut fields = stem.rsplitn(3, '_');
        let (Some(y), Some(x), Some(slide_id)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed("expected {slide}_{x}_{y}"));
        };

        if slide_id.is_empty() {
            return Err(malformed("empty slide identifier"));
        }
        let x = parse_coordinate(x).ok_or_else(|| malformed("x is not a six-digit number"))?;
        let y = parse_coordinate(y).ok_or_else(|| malformed("y is not a six-digit number"))?;

        Ok(Self {
            slide_id: slide_id.to_string(),
            x,
            y,
        })
    }
}

impl fmt::Display for TileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{:06}_{:06}.{}",
            self.slide_id, self.x, self.y, TILE_EXTENSION
        )
    }
}

fn parse_coordinate(field: &str) -> Option<u32> {
    if field.len() != COORDINATE_WIDTH || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

/// Encode `(slide_id, x, y)` as a tile file name.
pub fn encode(slide_id: &str, x: u32, y: u32) -> Result<String, CodecError> {
    TileName::new(slide_id, x, y).map(|name| name.to_string())
}

/// Decode a tile file name into `(slide_id, x, y)`.
pub fn decode(name: &str) -> Result<(String, u32, u32), CodecError> {
    TileName::parse(name).map(|t| (t.slide_id, t.x, t.y))
}
