//! Destinations for rendered output tiles.

use std::path::PathBuf;

use image::RgbImage;

use crate::error::OutputError;
use crate::format::tiff::PyramidTiffWriter;
use crate::slide::blit;

/// Exclusive owner of an output image, fed one tile at a time.
///
/// Tiles arrive in row-major order, clipped to the image bounds.
pub trait TileSink: Send + 'static {
    type Output: Send + 'static;

    fn tile_size(&self) -> u32;

    fn dimensions(&self) -> (u32, u32);

    fn write_tile(&mut self, col: u32, row: u32, tile: &RgbImage) -> Result<(), OutputError>;

    fn finish(self) -> Result<Self::Output, OutputError>;
}

impl TileSink for PyramidTiffWriter {
    type Output = PathBuf;

    fn tile_size(&self) -> u32 {
        PyramidTiffWriter::tile_size(self)
    }

    fn dimensions(&self) -> (u32, u32) {
        PyramidTiffWriter::dimensions(self)
    }

    fn write_tile(&mut self, col: u32, row: u32, tile: &RgbImage) -> Result<(), OutputError> {
        PyramidTiffWriter::write_tile(self, col, row, tile)
    }

    fn finish(self) -> Result<PathBuf, OutputError> {
        PyramidTiffWriter::finish(self)
    }
}

/// Collects tiles into one in-memory image.
///
/// Holds the whole image, so it is only suitable for small outputs.
#[derive(Debug)]
pub struct MemorySink {
    image: RgbImage,
    tile_size: u32,
    columns: u32,
    next: u32,
}

impl MemorySink {
    pub fn new(width: u32, height: u32, tile_size: u32) -> Self {
        let tile_size = tile_size.max(1);
        Self {
            image: RgbImage::new(width, height),
            tile_size,
            columns: width.div_ceil(tile_size),
            next: 0,
        }
    }
}

impl TileSink for MemorySink {
    type Output = RgbImage;

    fn tile_size(&self) -> u32 {
        self.tile_size
    }

    fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn write_tile(&mut self, col: u32, row: u32, tile: &RgbImage) -> Result<(), OutputError> {
        let (expected_col, expected_row) = (self.next % self.columns, self.next / self.columns);
        if (col, row) != (expected_col, expected_row) {
            return Err(OutputError::OutOfOrder {
                col,
                row,
                expected_col,
                expected_row,
            });
        }

        let (x, y) = (col * self.tile_size, row * self.tile_size);
        let expected_width = (self.image.width() - x).min(self.tile_size);
        let expected_height = (self.image.height() - y).min(self.tile_size);
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

        blit(&mut self.image, x, y, tile, 0, 0, tile.width(), tile.height());
        self.next += 1;
        Ok(())
    }

    fn finish(self) -> Result<RgbImage, OutputError> {
        let expected = self.columns * self.image.height().div_ceil(self.tile_size);
        if self.next != expected {
            return Err(OutputError::Incomplete {
                written: self.next as u64,
                expected: expected as u64,
            });
        }
        Ok(self.image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_memory_sink_assembles_tiles() {
        let mut sink = MemorySink::new(15, 10, 10);
        sink.write_tile(0, 0, &RgbImage::from_pixel(10, 10, Rgb([1, 1, 1])))
            .unwrap();
        sink.write_tile(1, 0, &RgbImage::from_pixel(5, 10, Rgb([2, 2, 2])))
            .unwrap();
        let image = sink.finish().unwrap();
        assert_eq!(*image.get_pixel(9, 9), Rgb([1, 1, 1]));
        assert_eq!(*image.get_pixel(10, 0), Rgb([2, 2, 2]));
    }

    #[test]
    fn test_memory_sink_enforces_order_and_completeness() {
        let mut sink = MemorySink::new(20, 20, 10);
        assert!(matches!(
            sink.write_tile(1, 0, &RgbImage::new(10, 10)),
            Err(OutputError::OutOfOrder { .. })
        ));
        sink.write_tile(0, 0, &RgbImage::new(10, 10)).unwrap();
        assert!(matches!(
            sink.finish(),
            Err(OutputError::Incomplete {
                written: 1,
                expected: 4
            })
        ));
    }
}
