//! TIFF pyramid level identification.
//!
//! WSI files contain several IFDs, and not all of them are pyramid levels:
//! label, macro and thumbnail pages sit alongside the resolution levels.
//!
//! # Identification Heuristics
//!
//! 1. A level must be tiled and carry TileOffsets/TileByteCounts
//! 2. The largest tiled image is level 0
//! 3. Further levels must sit at a near power-of-2 downsample of level 0
//!
//! Stripped pages (labels, macros, thumbnails in SVS files) are kept aside
//! in `other_ifds`.

use bytes::Bytes;

use crate::error::TiffError;
use crate::io::RangeReader;

use super::parser::{ByteOrder, Ifd, IfdEntry, TiffHeader, BIGTIFF_HEADER_SIZE, TIFF_HEADER_SIZE};
use super::tags::TiffTag;
use super::values::ValueReader;

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of IFDs to parse (safety limit)
const MAX_IFDS: usize = 100;

// =============================================================================
// PyramidLevel
// =============================================================================

/// A single tiled level in the image pyramid.
#[derive(Debug, Clone)]
pub struct PyramidLevel {
    /// Index of this level in the pyramid (0 = highest resolution)
    pub level_index: usize,

    /// Index of the IFD in the file's IFD chain
    pub ifd_index: usize,

    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,

    /// Number of tiles in X direction
    pub tiles_x: u32,

    /// Number of tiles in Y direction
    pub tiles_y: u32,

    /// Downsample factor relative to level 0 (1.0 for level 0)
    pub downsample: f64,

    /// Raw Compression tag value
    pub compression: u16,

    pub samples_per_pixel: u16,
    pub planar_configuration: u16,

    /// The parsed IFD for this level
    pub ifd: Ifd,
}

impl PyramidLevel {
    /// Create a PyramidLevel from a parsed IFD.
    ///
    /// Returns None if the IFD is not tiled or lacks dimensions.
    fn from_ifd(ifd: Ifd, ifd_index: usize, byte_order: ByteOrder) -> Option<Self> {
        if !ifd.is_tiled() || ifd.get_entry_by_tag(TiffTag::TileByteCounts).is_none() {
            return None;
        }

        let tile_width = ifd.tile_width(byte_order)?;
        let tile_height = ifd.tile_height(byte_order)?;
        let width = ifd.image_width(byte_order)?;
        let height = ifd.image_height(byte_order)?;
        if tile_width == 0 || tile_height == 0 || width == 0 || height == 0 {
            return None;
        }

        Some(PyramidLevel {
            level_index: 0,
            ifd_index,
            width,
            height,
            tile_width,
            tile_height,
            tiles_x: width.div_ceil(tile_width),
            tiles_y: height.div_ceil(tile_height),
            downsample: 1.0,
            compression: ifd.compression(byte_order),
            samples_per_pixel: ifd.samples_per_pixel(byte_order),
            planar_configuration: ifd.planar_configuration(byte_order),
            ifd,
        })
    }

    /// Total number of tiles in this level.
    pub fn tile_count(&self) -> u32 {
        self.tiles_x * self.tiles_y
    }

    /// Get the tile index for a given tile coordinate.
    ///
    /// Returns None if the coordinates are out of bounds.
    pub fn tile_index(&self, tile_x: u32, tile_y: u32) -> Option<u32> {
        if tile_x >= self.tiles_x || tile_y >= self.tiles_y {
            return None;
        }
        Some(tile_y * self.tiles_x + tile_x)
    }

    /// Pixel dimensions of the image area covered by a tile.
    ///
    /// Edge tiles cover less than tile_width/tile_height; their stored data
    /// is still padded to full tile size.
    pub fn tile_dimensions(&self, tile_x: u32, tile_y: u32) -> Option<(u32, u32)> {
        if tile_x >= self.tiles_x || tile_y >= self.tiles_y {
            return None;
        }
        let w = (self.width - tile_x * self.tile_width).min(self.tile_width);
        let h = (self.height - tile_y * self.tile_height).min(self.tile_height);
        Some((w, h))
    }
}

// =============================================================================
// TiffPyramid
// =============================================================================

/// A parsed TIFF image pyramid, sorted by resolution (level 0 = highest).
#[derive(Debug, Clone)]
pub struct TiffPyramid {
    pub header: TiffHeader,
    pub levels: Vec<PyramidLevel>,

    /// IFDs that are not pyramid levels (label, macro, stripped pages)
    pub other_ifds: Vec<(usize, Ifd)>,
}

impl TiffPyramid {
    /// Parse a TIFF file and identify pyramid levels.
    pub async fn parse<R: RangeReader + ?Sized>(reader: &R) -> Result<Self, TiffError> {
        let header_len = (BIGTIFF_HEADER_SIZE as u64).min(reader.size()) as usize;
        if header_len < TIFF_HEADER_SIZE {
            return Err(TiffError::FileTooSmall {
                required: TIFF_HEADER_SIZE as u64,
                actual: reader.size(),
            });
        }
        let header_bytes = reader.read_exact_at(0, header_len).await?;
        let header = TiffHeader::parse(&header_bytes, reader.size())?;

        let ifds = Self::parse_all_ifds(reader, &header).await?;
        Ok(Self::build_pyramid(header, ifds))
    }

    /// Parse all IFDs in the file following the next-IFD chain.
    async fn parse_all_ifds<R: RangeReader + ?Sized>(
        reader: &R,
        header: &TiffHeader,
    ) -> Result<Vec<Ifd>, TiffError> {
        let mut ifds = Vec::new();
        let mut offset = header.first_ifd_offset;

        while offset != 0 && ifds.len() < MAX_IFDS {
            if offset >= reader.size() {
                return Err(TiffError::InvalidIfdOffset(offset));
            }

            let count_size = header.ifd_count_size();
            let count_bytes = reader.read_exact_at(offset, count_size).await?;
            let entry_count = if header.is_bigtiff {
                header.byte_order.read_u64(&count_bytes)
            } else {
                header.byte_order.read_u16(&count_bytes) as u64
            };

            let ifd_size = Ifd::calculate_size(entry_count, header);
            let ifd_bytes = reader.read_exact_at(offset, ifd_size).await?;
            let ifd = Ifd::parse(&ifd_bytes, header)?;

            offset = ifd.next_ifd_offset;
            ifds.push(ifd);
        }

        Ok(ifds)
    }

    fn build_pyramid(header: TiffHeader, ifds: Vec<Ifd>) -> Self {
        let byte_order = header.byte_order;
        let mut candidates: Vec<PyramidLevel> = Vec::new();
        let mut other_ifds: Vec<(usize, Ifd)> = Vec::new();

        for (ifd_index, ifd) in ifds.into_iter().enumerate() {
            match PyramidLevel::from_ifd(ifd.clone(), ifd_index, byte_order) {
                Some(level) => candidates.push(level),
                None => other_ifds.push((ifd_index, ifd)),
            }
        }

        // Largest first = level 0
        candidates.sort_by(|a, b| {
            let area_a = a.width as u64 * a.height as u64;
            let area_b = b.width as u64 * b.height as u64;
            area_b.cmp(&area_a)
        });

        let levels = Self::filter_pyramid_levels(candidates, &mut other_ifds);
        TiffPyramid {
            header,
            levels,
            other_ifds,
        }
    }

    /// Keep only levels that form a consistent pyramid.
    fn filter_pyramid_levels(
        candidates: Vec<PyramidLevel>,
        other_ifds: &mut Vec<(usize, Ifd)>,
    ) -> Vec<PyramidLevel> {
        let Some(base) = candidates.first() else {
            return Vec::new();
        };
        let base_width = base.width as f64;
        let base_height = base.height as f64;

        let mut levels = Vec::new();
        for (idx, mut level) in candidates.into_iter().enumerate() {
            let downsample_x = base_width / level.width as f64;
            let downsample_y = base_height / level.height as f64;
            let downsample = (downsample_x + downsample_y) / 2.0;

            if Self::is_valid_downsample(downsample, idx) {
                level.level_index = levels.len();
                level.downsample = downsample;
                levels.push(level);
            } else {
                other_ifds.push((level.ifd_index, level.ifd));
            }
        }
        levels
    }

    /// Check if a downsample factor is valid for a pyramid level.
    fn is_valid_downsample(downsample: f64, level_idx: usize) -> bool {
        if level_idx == 0 {
            return (downsample - 1.0).abs() < 0.1;
        }

        let rounded = downsample.log2().round();
        if rounded < 1.0 {
            return false;
        }

        // 20% tolerance around the nearest power of two
        let ratio = downsample / 2.0_f64.powf(rounded);
        ratio > 0.8 && ratio < 1.2
    }

    /// Get the base (highest resolution) level.
    pub fn base_level(&self) -> Option<&PyramidLevel> {
        self.levels.first()
    }

    /// Get dimensions of the base level.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.base_level().map(|l| (l.width, l.height))
    }

    /// Find an entry in the first IFD of the file, where SVS and generic
    /// TIFF writers put the ImageDescription and resolution tags.
    pub fn first_ifd_entry(&self, tag: TiffTag) -> Option<&IfdEntry> {
        let first = self
            .levels
            .iter()
            .map(|l| (l.ifd_index, &l.ifd))
            .chain(self.other_ifds.iter().map(|(i, ifd)| (*i, ifd)))
            .min_by_key(|(i, _)| *i)?;
        first.1.get_entry_by_tag(tag)
    }
}

// =============================================================================
// Tile Data Loading
// =============================================================================

/// Tile locations and shared JPEG tables for a pyramid level.
#[derive(Debug, Clone)]
pub struct TileData {
    /// Byte offset of each tile in the file
    pub offsets: Vec<u64>,

    /// Byte count (size) of each tile
    pub byte_counts: Vec<u64>,

    /// JPEGTables data (if present)
    pub jpeg_tables: Option<Bytes>,
}

impl TileData {
    /// Load tile data for a pyramid level.
    pub async fn load<R: RangeReader + ?Sized>(
        reader: &R,
        level: &PyramidLevel,
        header: &TiffHeader,
    ) -> Result<Self, TiffError> {
        let value_reader = ValueReader::new(reader, header);

        let offsets_entry = level
            .ifd
            .get_entry_by_tag(TiffTag::TileOffsets)
            .ok_or(TiffError::MissingTag("TileOffsets"))?;
        let counts_entry = level
            .ifd
            .get_entry_by_tag(TiffTag::TileByteCounts)
            .ok_or(TiffError::MissingTag("TileByteCounts"))?;

        let offsets = value_reader.read_u64_array(offsets_entry).await?;
        let byte_counts = value_reader.read_u64_array(counts_entry).await?;

        let expected = level.tile_count() as usize;
        if offsets.len() < expected || byte_counts.len() < expected {
            return Err(TiffError::InvalidTagValue {
                tag: "TileOffsets",
                message: format!(
                    "{} offsets and {} byte counts for {} tiles",
                    offsets.len(),
                    byte_counts.len(),
                    expected
                ),
            });
        }

        let jpeg_tables = match level.ifd.get_entry_by_tag(TiffTag::JpegTables) {
            Some(entry) => Some(value_reader.read_raw_bytes(entry).await?),
            None => None,
        };

        Ok(TileData {
            offsets,
            byte_counts,
            jpeg_tables,
        })
    }

    /// Get offset and size for a specific tile.
    pub fn get_tile_location(&self, tile_index: u32) -> Option<(u64, u64)> {
        let idx = tile_index as usize;
        Some((*self.offsets.get(idx)?, *self.byte_counts.get(idx)?))
    }
}

// =============================================================================
// Tests
// =============================================================================
