//! Region access to source slides.
//!
//! Tile extraction and overlay rendering only ever need a rectangle of the
//! full-resolution image. [`TiledTiffSource`] serves such rectangles from
//! the tiled base level of a TIFF or SVS file, decoding only the source
//! tiles the rectangle overlaps and keeping recently decoded ones in an LRU
//! cache. [`RasterSource`] is the fallback for images without tiles: the
//! whole image is decoded once.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, RgbImage};
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::FormatError;
use crate::format::jpeg::prepare_tile_jpeg;
use crate::format::tiff::{
    Compression, PyramidLevel, Resolution, TiffPyramid, TiffTag, TileData, ValueReader,
    RESOLUTION_UNIT_CENTIMETER,
};
use crate::format::{aperio_mpp, detect_format, read_first_description, SlideFormat};
use crate::io::{FileRangeReader, RangeReader};

/// Default number of decoded source tiles kept per slide.
pub const DEFAULT_SOURCE_TILE_CACHE: usize = 64;

// =============================================================================
// RegionSource
// =============================================================================

/// Read access to the full-resolution pixels of a slide.
#[async_trait]
pub trait RegionSource: Send + Sync {
    /// Width and height of the full-resolution image.
    fn dimensions(&self) -> (u32, u32);

    /// Physical resolution of the full-resolution image, when known.
    fn resolution(&self) -> Option<Resolution> {
        None
    }

    /// Read a rectangle that lies entirely inside the image.
    async fn read_region(
        &self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<RgbImage, FormatError>;
}

/// Reject empty rectangles and rectangles that leave the image.
pub(crate) fn check_region(
    (image_width, image_height): (u32, u32),
    x: u32,
    y: u32,
    width: u32,
    height: u32,
) -> Result<(), FormatError> {
    let fits = width > 0
        && height > 0
        && x.checked_add(width).is_some_and(|r| r <= image_width)
        && y.checked_add(height).is_some_and(|b| b <= image_height);
    if fits {
        Ok(())
    } else {
        Err(FormatError::RegionOutOfBounds {
            x,
            y,
            width,
            height,
            image_width,
            image_height,
        })
    }
}

/// Copy a `width`×`height` block of `src` starting at (`src_x`, `src_y`)
/// into `dst` at (`dst_x`, `dst_y`).
#[allow(clippy::too_many_arguments)]
pub(crate) fn blit(
    dst: &mut RgbImage,
    dst_x: u32,
    dst_y: u32,
    src: &RgbImage,
    src_x: u32,
    src_y: u32,
    width: u32,
    height: u32,
) {
    let dst_stride = dst.width() as usize * 3;
    let src_stride = src.width() as usize * 3;
    let row_len = width as usize * 3;
    let src_buf: &[u8] = src;
    let dst_buf: &mut [u8] = dst;

    for row in 0..height as usize {
        let s = (src_y as usize + row) * src_stride + src_x as usize * 3;
        let d = (dst_y as usize + row) * dst_stride + dst_x as usize * 3;
        dst_buf[d..d + row_len].copy_from_slice(&src_buf[s..s + row_len]);
    }
}

/// Open a slide, picking the tiled reader when the file has tiled pages.
pub async fn open_slide(
    path: &Path,
    source_tile_cache: usize,
) -> Result<Arc<dyn RegionSource>, FormatError> {
    let reader = FileRangeReader::open(path).await?;
    let format = detect_format(&reader).await?;

    if format.is_tiff() {
        let pyramid = TiffPyramid::parse(&reader).await?;
        if pyramid.base_level().is_some() {
            let source = TiledTiffSource::new(reader, format, pyramid, source_tile_cache).await?;
            return Ok(Arc::new(source));
        }
        warn!(
            path = %path.display(),
            "No tiled pages found, decoding the whole image"
        );
    }

    Ok(Arc::new(RasterSource::open(path).await?))
}

// =============================================================================
// TiledTiffSource
// =============================================================================

/// Region reader over the tiled base level of a TIFF or SVS slide.
pub struct TiledTiffSource<R: RangeReader> {
    reader: R,
    format: SlideFormat,
    level: PyramidLevel,
    tiles: TileData,
    compression: Compression,
    resolution: Option<Resolution>,
    cache: Mutex<LruCache<u32, Arc<RgbImage>>>,
}

impl<R: RangeReader> TiledTiffSource<R> {
    /// Build a source from a parsed pyramid.
    ///
    /// Fails with `UnsupportedFormat` when the base level uses a compression,
    /// sample layout or bit depth that cannot be decoded.
    pub async fn new(
        reader: R,
        format: SlideFormat,
        pyramid: TiffPyramid,
        cache_capacity: usize,
    ) -> Result<Self, FormatError> {
        let level = pyramid
            .base_level()
            .cloned()
            .ok_or_else(|| FormatError::UnsupportedFormat {
                reason: "no tiled pyramid level".to_string(),
            })?;

        let compression = Compression::from_u16(level.compression)
            .filter(|c| c.is_decodable())
            .ok_or_else(|| FormatError::UnsupportedFormat {
                reason: format!("tile compression {} cannot be decoded", level.compression),
            })?;
        if level.planar_configuration != 1 {
            return Err(FormatError::UnsupportedFormat {
                reason: "planar (separate) sample layout".to_string(),
            });
        }
        if compression == Compression::None && !matches!(level.samples_per_pixel, 1 | 3 | 4) {
            return Err(FormatError::UnsupportedFormat {
                reason: format!("{} samples per pixel", level.samples_per_pixel),
            });
        }

        let values = ValueReader::new(&reader, &pyramid.header);
        if let Some(entry) = level.ifd.get_entry_by_tag(TiffTag::BitsPerSample) {
            let bits = values.read_u64_array(entry).await?;
            if bits.iter().any(|&b| b != 8) {
                return Err(FormatError::UnsupportedFormat {
                    reason: format!("{:?} bits per sample", bits),
                });
            }
        }

        let tiles = TileData::load(&reader, &level, &pyramid.header).await?;
        let resolution = read_resolution(&reader, &pyramid, &level, format).await;

        info!(
            slide = reader.identifier(),
            format = format.name(),
            width = level.width,
            height = level.height,
            tile_width = level.tile_width,
            tile_height = level.tile_height,
            compression = compression.name(),
            "Opened tiled slide"
        );

        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            reader,
            format,
            level,
            tiles,
            compression,
            resolution,
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn format(&self) -> SlideFormat {
        self.format
    }

    /// Fetch a decoded source tile, from the cache when possible.
    async fn source_tile(&self, tile_x: u32, tile_y: u32) -> Result<Arc<RgbImage>, FormatError> {
        let index = self
            .level
            .tile_index(tile_x, tile_y)
            .ok_or_else(|| FormatError::Decode {
                message: format!("source tile ({}, {}) outside grid", tile_x, tile_y),
            })?;

        if let Some(tile) = self.cache.lock().await.get(&index) {
            return Ok(tile.clone());
        }

        let (offset, len) = self
            .tiles
            .get_tile_location(index)
            .ok_or_else(|| FormatError::Decode {
                message: format!("no location for source tile {}", index),
            })?;
        let data = self.reader.read_exact_at(offset, len as usize).await?;

        let decoder = TileDecoder {
            compression: self.compression,
            width: self.level.tile_width,
            height: self.level.tile_height,
            samples_per_pixel: self.level.samples_per_pixel,
            jpeg_tables: self.tiles.jpeg_tables.clone(),
        };
        let tile = tokio::task::spawn_blocking(move || decoder.decode(&data))
            .await
            .map_err(|e| FormatError::Decode {
                message: format!("decode task failed: {}", e),
            })??;
        let tile = Arc::new(tile);

        debug!(tile_x, tile_y, "Decoded source tile");
        self.cache.lock().await.put(index, tile.clone());
        Ok(tile)
    }
}

#[async_trait]
impl<R: RangeReader> RegionSource for TiledTiffSource<R> {
    fn dimensions(&self) -> (u32, u32) {
        (self.level.width, self.level.height)
    }

    fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    async fn read_region(
        &self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<RgbImage, FormatError> {
        check_region(self.dimensions(), x, y, width, height)?;

        let (tw, th) = (self.level.tile_width, self.level.tile_height);
        let mut out = RgbImage::new(width, height);

        for tile_y in y / th..=(y + height - 1) / th {
            for tile_x in x / tw..=(x + width - 1) / tw {
                let tile = self.source_tile(tile_x, tile_y).await?;

                // Overlap of the request with this source tile, in image space
                let left = x.max(tile_x * tw);
                let top = y.max(tile_y * th);
                let right = (x + width).min((tile_x + 1) * tw);
                let bottom = (y + height).min((tile_y + 1) * th);

                blit(
                    &mut out,
                    left - x,
                    top - y,
                    &tile,
                    left - tile_x * tw,
                    top - tile_y * th,
                    right - left,
                    bottom - top,
                );
            }
        }

        Ok(out)
    }
}

/// Everything needed to decode one source tile off the async runtime.
struct TileDecoder {
    compression: Compression,
    width: u32,
    height: u32,
    samples_per_pixel: u16,
    jpeg_tables: Option<Bytes>,
}

impl TileDecoder {
    fn decode(&self, data: &[u8]) -> Result<RgbImage, FormatError> {
        let tile = match self.compression {
            Compression::Jpeg => {
                let jpeg = prepare_tile_jpeg(self.jpeg_tables.as_deref(), data);
                image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)
                    .map_err(|e| FormatError::Decode {
                        message: format!("JPEG tile: {}", e),
                    })?
                    .to_rgb8()
            }
            _ => self.decode_raw(data)?,
        };

        if tile.dimensions() != (self.width, self.height) {
            return Err(FormatError::Decode {
                message: format!(
                    "tile decoded to {}x{}, expected {}x{}",
                    tile.width(),
                    tile.height(),
                    self.width,
                    self.height
                ),
            });
        }
        Ok(tile)
    }

    /// Interleaved 8-bit gray, RGB or RGBA samples.
    fn decode_raw(&self, data: &[u8]) -> Result<RgbImage, FormatError> {
        let spp = self.samples_per_pixel as usize;
        let pixels = self.width as usize * self.height as usize;
        if data.len() < pixels * spp {
            return Err(FormatError::Decode {
                message: format!("raw tile holds {} bytes, need {}", data.len(), pixels * spp),
            });
        }

        let mut rgb = Vec::with_capacity(pixels * 3);
        for px in data[..pixels * spp].chunks_exact(spp) {
            match spp {
                1 => rgb.extend_from_slice(&[px[0], px[0], px[0]]),
                _ => rgb.extend_from_slice(&px[..3]),
            }
        }
        RgbImage::from_raw(self.width, self.height, rgb).ok_or_else(|| FormatError::Decode {
            message: "raw tile buffer size mismatch".to_string(),
        })
    }
}

/// Resolution from the TIFF resolution tags, or from the Aperio MPP field.
async fn read_resolution<R: RangeReader>(
    reader: &R,
    pyramid: &TiffPyramid,
    level: &PyramidLevel,
    format: SlideFormat,
) -> Option<Resolution> {
    let values = ValueReader::new(reader, &pyramid.header);
    let byte_order = pyramid.header.byte_order;

    let x = level.ifd.get_entry_by_tag(TiffTag::XResolution);
    let y = level.ifd.get_entry_by_tag(TiffTag::YResolution);
    let unit = level
        .ifd
        .get_u32(TiffTag::ResolutionUnit, byte_order)
        .map(|u| u as u16)
        .unwrap_or(2);
    if let (Some(x), Some(y)) = (x, y) {
        if let (Ok(x), Ok(y)) = (values.read_rational(x).await, values.read_rational(y).await) {
            if unit != 1 && x > 0.0 && y > 0.0 {
                return Some(Resolution { x, y, unit });
            }
        }
    }

    if format == SlideFormat::AperioSvs {
        let description = read_first_description(reader, &pyramid.header).await.ok()??;
        let mpp = aperio_mpp(&description)?;
        let per_cm = 10_000.0 / mpp;
        return Some(Resolution {
            x: per_cm,
            y: per_cm,
            unit: RESOLUTION_UNIT_CENTIMETER,
        });
    }
    None
}

// =============================================================================
// RasterSource
// =============================================================================

/// Fallback source that decodes the whole image into memory.
pub struct RasterSource {
    image: Arc<RgbImage>,
}

impl RasterSource {
    pub async fn open(path: &Path) -> Result<Self, FormatError> {
        let owned = path.to_path_buf();
        let image = tokio::task::spawn_blocking(move || image::open(&owned))
            .await
            .map_err(|e| FormatError::Decode {
                message: format!("decode task failed: {}", e),
            })?
            .map_err(|e| FormatError::UnsupportedFormat {
                reason: format!("{}: {}", path.display(), e),
            })?
            .to_rgb8();

        info!(
            path = %path.display(),
            width = image.width(),
            height = image.height(),
            "Opened raster slide"
        );
        Ok(Self::from_image(image))
    }

    pub fn from_image(image: RgbImage) -> Self {
        Self {
            image: Arc::new(image),
        }
    }
}

#[async_trait]
impl RegionSource for RasterSource {
    fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    async fn read_region(
        &self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<RgbImage, FormatError> {
        check_region(self.dimensions(), x, y, width, height)?;
        let mut out = RgbImage::new(width, height);
        blit(&mut out, 0, 0, &self.image, x, y, width, height);
        Ok(out)
    }
}

// =============================================================================
// Tests
// =============================================================================
