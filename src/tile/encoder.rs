//! Lossless tile encoding.
//!
//! Cached tiles are PNG so the model sees exactly the pixels read from the
//! slide, and a re-run can compare tiles byte for byte.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::png::PngEncoder;
use image::{ImageEncoder, ImageFormat, ImageReader, RgbImage};

use crate::error::ExtractionError;

/// Encode an RGB tile as PNG.
pub fn encode_png(tile: &RgbImage) -> Result<Bytes, ExtractionError> {
    let mut output = Vec::new();
    PngEncoder::new(&mut output)
        .write_image(
            tile.as_raw(),
            tile.width(),
            tile.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| ExtractionError::Encode(e.to_string()))?;
    Ok(Bytes::from(output))
}

/// Decode a PNG tile to RGB, dropping any alpha channel.
pub fn decode_png(data: &[u8]) -> Result<RgbImage, image::ImageError> {
    let reader = ImageReader::with_format(Cursor::new(data), ImageFormat::Png);
    Ok(reader.decode()?.to_rgb8())
}
