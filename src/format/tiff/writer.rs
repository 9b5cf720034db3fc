//! Streaming pyramidal BigTIFF writer.
//!
//! Full-resolution tiles are appended to the file in row-major order as they
//! arrive, so only one tile is held in memory at a time. On [`finish`], each
//! reduced level is built by reading back the four child tiles of every
//! output tile from the level above, halving them with a 2x2 box filter and
//! appending the result. Directories are written last and chained from the
//! header.
//!
//! # File Layout
//!
//! ```text
//! [header 16B][level 0 tiles...][level 1 tiles...]...[arrays + IFD 0][arrays + IFD 1]...
//! ```
//!
//! The file is always little-endian BigTIFF so slides larger than 4 GB of
//! compressed output need no special casing.
//!
//! [`finish`]: PyramidTiffWriter::finish

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ImageFormat, RgbImage};
use tracing::debug;

use crate::error::OutputError;

use super::tags::{Compression, FieldType, TiffTag, PHOTOMETRIC_RGB, PHOTOMETRIC_YCBCR};

// =============================================================================
// Options
// =============================================================================

/// Compression applied to every output tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCompression {
    /// Baseline JPEG at the given quality (1-100)
    Jpeg { quality: u8 },

    /// Raw interleaved RGB
    None,
}

impl OutputCompression {
    fn tag_value(self) -> u16 {
        match self {
            OutputCompression::Jpeg { .. } => Compression::Jpeg.as_u16(),
            OutputCompression::None => Compression::None.as_u16(),
        }
    }

    /// Colour space of the stored samples. The JPEG encoder writes JFIF
    /// YCbCr without chroma subsampling.
    fn photometric(self) -> u16 {
        match self {
            OutputCompression::Jpeg { .. } => PHOTOMETRIC_YCBCR,
            OutputCompression::None => PHOTOMETRIC_RGB,
        }
    }
}

/// Physical resolution of level 0, carried over from the source slide.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    /// Pixels per unit along X
    pub x: f64,
    /// Pixels per unit along Y
    pub y: f64,
    /// TIFF ResolutionUnit (2 = inch, 3 = centimeter)
    pub unit: u16,
}

/// Options for [`PyramidTiffWriter::create`].
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Edge length of every output tile; must be a positive multiple of 16
    pub tile_size: u32,
    pub compression: OutputCompression,
    pub resolution: Option<Resolution>,
    /// ImageDescription written on the full-resolution page
    pub description: Option<String>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            tile_size: 1024,
            compression: OutputCompression::Jpeg { quality: 80 },
            resolution: None,
            description: None,
        }
    }
}

// =============================================================================
// Level Layout
// =============================================================================

#[derive(Debug, Clone)]
struct LevelLayout {
    width: u32,
    height: u32,
    tiles_x: u32,
    tiles_y: u32,
    offsets: Vec<u64>,
    byte_counts: Vec<u64>,
}

impl LevelLayout {
    fn new(width: u32, height: u32, tile_size: u32) -> Self {
        let tiles_x = width.div_ceil(tile_size);
        let tiles_y = height.div_ceil(tile_size);
        let count = tiles_x as usize * tiles_y as usize;
        Self {
            width,
            height,
            tiles_x,
            tiles_y,
            offsets: Vec::with_capacity(count),
            byte_counts: Vec::with_capacity(count),
        }
    }

    fn tile_count(&self) -> u64 {
        self.tiles_x as u64 * self.tiles_y as u64
    }

    /// Image area covered by a tile; edge tiles are clipped.
    fn clipped(&self, col: u32, row: u32, tile_size: u32) -> (u32, u32) {
        (
            (self.width - col * tile_size).min(tile_size),
            (self.height - row * tile_size).min(tile_size),
        )
    }
}

/// Dimensions of every pyramid level, halving (rounding up) until the
/// level fits in a single tile.
pub fn level_dimensions(width: u32, height: u32, tile_size: u32) -> Vec<(u32, u32)> {
    let mut dims = vec![(width, height)];
    let (mut w, mut h) = (width, height);
    while w > tile_size || h > tile_size {
        w = w.div_ceil(2);
        h = h.div_ceil(2);
        dims.push((w, h));
    }
    dims
}

// =============================================================================
// PyramidTiffWriter
// =============================================================================

/// Writes a tiled, multi-resolution BigTIFF from a row-major tile stream.
pub struct PyramidTiffWriter {
    file: File,
    path: PathBuf,
    options: WriterOptions,
    levels: Vec<LevelLayout>,
    next_tile: u64,
    position: u64,
}

impl PyramidTiffWriter {
    /// Create the output file and write a placeholder header.
    pub fn create(
        path: impl AsRef<Path>,
        width: u32,
        height: u32,
        options: WriterOptions,
    ) -> Result<Self, OutputError> {
        let tile_size = options.tile_size;
        if tile_size == 0 || tile_size % 16 != 0 {
            return Err(OutputError::Geometry(format!(
                "tile size {} is not a positive multiple of 16",
                tile_size
            )));
        }
        if width == 0 || height == 0 {
            return Err(OutputError::Geometry(format!(
                "image of {}x{} has no pixels",
                width, height
            )));
        }
        if let OutputCompression::Jpeg { quality } = options.compression {
            if !(1..=100).contains(&quality) {
                return Err(OutputError::Geometry(format!(
                    "JPEG quality {} outside 1-100",
                    quality
                )));
            }
        }

        let path = path.as_ref().to_path_buf();
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        // "II", version 43, offset size 8, reserved, first IFD (patched later)
        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(b"II");
        header.extend_from_slice(&43u16.to_le_bytes());
        header.extend_from_slice(&8u16.to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes());
        file.write_all(&header)?;

        let levels = level_dimensions(width, height, tile_size)
            .into_iter()
            .map(|(w, h)| LevelLayout::new(w, h, tile_size))
            .collect::<Vec<_>>();

        debug!(
            path = %path.display(),
            width,
            height,
            tile_size,
            levels = levels.len(),
            "Created pyramid writer"
        );

        Ok(Self {
            file,
            path,
            options,
            levels,
            next_tile: 0,
            position: header.len() as u64,
        })
    }

    /// Dimensions of the full-resolution level.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.levels[0].width, self.levels[0].height)
    }

    pub fn tile_size(&self) -> u32 {
        self.options.tile_size
    }

    /// Number of tile columns and rows at full resolution.
    pub fn grid(&self) -> (u32, u32) {
        (self.levels[0].tiles_x, self.levels[0].tiles_y)
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append the next full-resolution tile.
    ///
    /// Tiles must arrive in row-major order and be clipped to the image:
    /// edge tiles are smaller than `tile_size` and are padded here.
    pub fn write_tile(&mut self, col: u32, row: u32, tile: &RgbImage) -> Result<(), OutputError> {
        let base = &self.levels[0];
        let expected_col = (self.next_tile % base.tiles_x as u64) as u32;
        let expected_row = (self.next_tile / base.tiles_x as u64) as u32;
        if self.next_tile >= base.tile_count() || (col, row) != (expected_col, expected_row) {
            return Err(OutputError::OutOfOrder {
                col,
                row,
                expected_col,
                expected_row,
            });
        }

        let (expected_width, expected_height) = base.clipped(col, row, self.options.tile_size);
        if tile.dimensions() != (expected_width, expected_height) {
            return Err(OutputError::TileSize {
                col,
                row,
                width: tile.width(),
                height: tile.height(),
                expected_width,
                expected_height,
            });
        }

        let data = self.encode_tile(tile)?;
        self.append_tile(0, &data)?;
        self.next_tile += 1;
        Ok(())
    }

    /// Build the reduced levels, write all directories and close the file.
    pub fn finish(mut self) -> Result<PathBuf, OutputError> {
        let expected = self.levels[0].tile_count();
        if self.next_tile != expected {
            return Err(OutputError::Incomplete {
                written: self.next_tile,
                expected,
            });
        }

        for level in 1..self.levels.len() {
            self.build_level(level)?;
        }
        self.write_directories()?;
        self.file.sync_all()?;

        debug!(path = %self.path.display(), bytes = self.position, "Finished pyramid");
        Ok(self.path)
    }

    // -------------------------------------------------------------------------
    // Tile data
    // -------------------------------------------------------------------------

    fn encode_tile(&self, tile: &RgbImage) -> Result<Vec<u8>, OutputError> {
        let size = self.options.tile_size;
        let padded = if tile.dimensions() == (size, size) {
            tile.clone()
        } else {
            let mut padded = RgbImage::new(size, size);
            imageops::replace(&mut padded, tile, 0, 0);
            padded
        };

        match self.options.compression {
            OutputCompression::None => Ok(padded.into_raw()),
            OutputCompression::Jpeg { quality } => {
                let mut buf = Vec::new();
                JpegEncoder::new_with_quality(&mut buf, quality)
                    .encode_image(&padded)
                    .map_err(|e| OutputError::Encode(e.to_string()))?;
                Ok(buf)
            }
        }
    }

    fn append_tile(&mut self, level: usize, data: &[u8]) -> Result<(), OutputError> {
        self.file.seek(SeekFrom::Start(self.position))?;
        self.file.write_all(data)?;

        let layout = &mut self.levels[level];
        layout.offsets.push(self.position);
        layout.byte_counts.push(data.len() as u64);
        self.position += data.len() as u64;
        Ok(())
    }

    fn read_tile(&mut self, level: usize, col: u32, row: u32) -> Result<RgbImage, OutputError> {
        let layout = &self.levels[level];
        let index = (row * layout.tiles_x + col) as usize;
        let offset = layout.offsets[index];
        let len = layout.byte_counts[index] as usize;

        let mut data = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut data)?;

        let size = self.options.tile_size;
        match self.options.compression {
            OutputCompression::None => RgbImage::from_raw(size, size, data)
                .ok_or_else(|| OutputError::Encode(format!("short raw tile at {}", offset))),
            OutputCompression::Jpeg { .. } => {
                image::load_from_memory_with_format(&data, ImageFormat::Jpeg)
                    .map(|img| img.to_rgb8())
                    .map_err(|e| OutputError::Encode(e.to_string()))
            }
        }
    }

    /// Build one reduced level from the level above it.
    fn build_level(&mut self, level: usize) -> Result<(), OutputError> {
        let (tiles_x, tiles_y) = (self.levels[level].tiles_x, self.levels[level].tiles_y);
        for row in 0..tiles_y {
            for col in 0..tiles_x {
                let tile = self.downsample_tile(level, col, row)?;
                let data = self.encode_tile(&tile)?;
                self.append_tile(level, &data)?;
            }
        }
        debug!(
            level,
            width = self.levels[level].width,
            height = self.levels[level].height,
            "Wrote reduced level"
        );
        Ok(())
    }

    /// Halve the (up to) four parent tiles covering an output tile.
    ///
    /// Only pixels inside the parent image contribute, so padding never
    /// bleeds into edge pixels.
    fn downsample_tile(&mut self, level: usize, col: u32, row: u32) -> Result<RgbImage, OutputError> {
        let size = self.options.tile_size;
        let half = size / 2;
        let (out_w, out_h) = self.levels[level].clipped(col, row, size);
        let mut out = RgbImage::new(out_w, out_h);

        for dy in 0..2u32 {
            for dx in 0..2u32 {
                let parent = &self.levels[level - 1];
                let (pc, pr) = (col * 2 + dx, row * 2 + dy);
                if pc >= parent.tiles_x || pr >= parent.tiles_y {
                    continue;
                }
                let (valid_w, valid_h) = parent.clipped(pc, pr, size);
                let child = self.read_tile(level - 1, pc, pr)?;

                let (x0, y0) = (dx * half, dy * half);
                for oy in y0..(y0 + half).min(out_h) {
                    for ox in x0..(x0 + half).min(out_w) {
                        let (cx, cy) = ((ox - x0) * 2, (oy - y0) * 2);
                        let mut sum = [0u32; 3];
                        let mut count = 0u32;
                        for sy in cy..(cy + 2).min(valid_h) {
                            for sx in cx..(cx + 2).min(valid_w) {
                                let p = child.get_pixel(sx, sy);
                                for c in 0..3 {
                                    sum[c] += p[c] as u32;
                                }
                                count += 1;
                            }
                        }
                        if count > 0 {
                            let px = out.get_pixel_mut(ox, oy);
                            for c in 0..3 {
                                px[c] = ((sum[c] + count / 2) / count) as u8;
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Directories
    // -------------------------------------------------------------------------

    fn write_directories(&mut self) -> Result<(), OutputError> {
        // Header field holding the first IFD offset
        let mut link_position = 8u64;

        for level in 0..self.levels.len() {
            let entries = self.directory_entries(level);

            // Out-of-line values first, each word aligned
            let mut fields = Vec::with_capacity(entries.len());
            for entry in &entries {
                if entry.data.len() > 8 {
                    self.align()?;
                    let offset = self.position;
                    self.file.seek(SeekFrom::Start(offset))?;
                    self.file.write_all(&entry.data)?;
                    self.position += entry.data.len() as u64;
                    fields.push(offset.to_le_bytes());
                } else {
                    let mut inline = [0u8; 8];
                    inline[..entry.data.len()].copy_from_slice(&entry.data);
                    fields.push(inline);
                }
            }

            self.align()?;
            let ifd_offset = self.position;
            let mut ifd = Vec::with_capacity(8 + entries.len() * 20 + 8);
            ifd.extend_from_slice(&(entries.len() as u64).to_le_bytes());
            for (entry, field) in entries.iter().zip(&fields) {
                ifd.extend_from_slice(&entry.tag.as_u16().to_le_bytes());
                ifd.extend_from_slice(&entry.field_type.as_u16().to_le_bytes());
                ifd.extend_from_slice(&entry.count.to_le_bytes());
                ifd.extend_from_slice(field);
            }
            ifd.extend_from_slice(&0u64.to_le_bytes());

            self.file.seek(SeekFrom::Start(ifd_offset))?;
            self.file.write_all(&ifd)?;
            self.position += ifd.len() as u64;

            self.file.seek(SeekFrom::Start(link_position))?;
            self.file.write_all(&ifd_offset.to_le_bytes())?;
            link_position = ifd_offset + ifd.len() as u64 - 8;
        }
        Ok(())
    }

    fn align(&mut self) -> Result<(), OutputError> {
        if self.position % 2 == 1 {
            self.file.seek(SeekFrom::Start(self.position))?;
            self.file.write_all(&[0])?;
            self.position += 1;
        }
        Ok(())
    }

    /// Entries for one level, sorted by tag.
    fn directory_entries(&self, level: usize) -> Vec<DirectoryEntry> {
        let layout = &self.levels[level];
        let base = &self.levels[0];
        let tile_size = self.options.tile_size;

        let mut entries = vec![
            DirectoryEntry::long(TiffTag::NewSubfileType, u32::from(level > 0)),
            DirectoryEntry::long(TiffTag::ImageWidth, layout.width),
            DirectoryEntry::long(TiffTag::ImageLength, layout.height),
            DirectoryEntry::shorts(TiffTag::BitsPerSample, &[8, 8, 8]),
            DirectoryEntry::shorts(TiffTag::Compression, &[self.options.compression.tag_value()]),
            DirectoryEntry::shorts(
                TiffTag::PhotometricInterpretation,
                &[self.options.compression.photometric()],
            ),
        ];
        if level == 0 {
            if let Some(description) = &self.options.description {
                entries.push(DirectoryEntry::ascii(TiffTag::ImageDescription, description));
            }
        }
        entries.push(DirectoryEntry::shorts(TiffTag::SamplesPerPixel, &[3]));
        if let Some(res) = self.options.resolution {
            let scale_x = layout.width as f64 / base.width as f64;
            let scale_y = layout.height as f64 / base.height as f64;
            entries.push(DirectoryEntry::rational(TiffTag::XResolution, res.x * scale_x));
            entries.push(DirectoryEntry::rational(TiffTag::YResolution, res.y * scale_y));
        }
        entries.push(DirectoryEntry::shorts(TiffTag::PlanarConfiguration, &[1]));
        if let Some(res) = self.options.resolution {
            entries.push(DirectoryEntry::shorts(TiffTag::ResolutionUnit, &[res.unit]));
        }
        entries.push(DirectoryEntry::ascii(
            TiffTag::Software,
            concat!("wsi-gleason ", env!("CARGO_PKG_VERSION")),
        ));
        entries.push(DirectoryEntry::long(TiffTag::TileWidth, tile_size));
        entries.push(DirectoryEntry::long(TiffTag::TileLength, tile_size));
        entries.push(DirectoryEntry::long8s(TiffTag::TileOffsets, &layout.offsets));
        entries.push(DirectoryEntry::long8s(TiffTag::TileByteCounts, &layout.byte_counts));
        if let OutputCompression::Jpeg { .. } = self.options.compression {
            entries.push(DirectoryEntry::shorts(TiffTag::YCbCrSubSampling, &[1, 1]));
            entries.push(DirectoryEntry::rationals(
                TiffTag::ReferenceBlackWhite,
                &[(0, 1), (255, 1), (128, 1), (255, 1), (128, 1), (255, 1)],
            ));
        }

        entries.sort_by_key(|e| e.tag.as_u16());
        entries
    }
}

/// One IFD entry with its little-endian value bytes.
struct DirectoryEntry {
    tag: TiffTag,
    field_type: FieldType,
    count: u64,
    data: Vec<u8>,
}

impl DirectoryEntry {
    fn long(tag: TiffTag, value: u32) -> Self {
        Self {
            tag,
            field_type: FieldType::Long,
            count: 1,
            data: value.to_le_bytes().to_vec(),
        }
    }

    fn shorts(tag: TiffTag, values: &[u16]) -> Self {
        Self {
            tag,
            field_type: FieldType::Short,
            count: values.len() as u64,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn long8s(tag: TiffTag, values: &[u64]) -> Self {
        Self {
            tag,
            field_type: FieldType::Long8,
            count: values.len() as u64,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn ascii(tag: TiffTag, value: &str) -> Self {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        Self {
            tag,
            field_type: FieldType::Ascii,
            count: data.len() as u64,
            data,
        }
    }

    fn rational(tag: TiffTag, value: f64) -> Self {
        let (numerator, denominator) = if value * 1000.0 < u32::MAX as f64 {
            ((value * 1000.0).round() as u32, 1000u32)
        } else {
            (value.round().min(u32::MAX as f64) as u32, 1)
        };
        let mut data = numerator.to_le_bytes().to_vec();
        data.extend_from_slice(&denominator.to_le_bytes());
        Self {
            tag,
            field_type: FieldType::Rational,
            count: 1,
            data,
        }
    }

    fn rationals(tag: TiffTag, values: &[(u32, u32)]) -> Self {
        Self {
            tag,
            field_type: FieldType::Rational,
            count: values.len() as u64,
            data: values
                .iter()
                .flat_map(|&(n, d)| n.to_le_bytes().into_iter().chain(d.to_le_bytes()))
                .collect(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
