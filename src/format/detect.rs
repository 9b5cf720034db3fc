//! Format detection for slide files.
//!
//! - **Aperio SVS**: TIFF with "Aperio" in the first ImageDescription
//! - **Generic TIFF**: any other TIFF or BigTIFF
//! - **Raster**: anything else, handed to the `image` crate decoders

use crate::error::FormatError;
use crate::io::RangeReader;

use super::tiff::{ByteOrder, Ifd, TiffHeader, TiffTag, BIGTIFF_HEADER_SIZE, TIFF_HEADER_SIZE};

// =============================================================================
// SlideFormat
// =============================================================================

/// Detected slide format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideFormat {
    /// Aperio SVS format (TIFF-based with JPEGTables for abbreviated streams)
    AperioSvs,

    /// Any other TIFF or BigTIFF
    GenericTiff,

    /// Non-TIFF raster image (PNG, JPEG)
    Raster,
}

impl SlideFormat {
    pub const fn name(&self) -> &'static str {
        match self {
            SlideFormat::AperioSvs => "Aperio SVS",
            SlideFormat::GenericTiff => "Generic TIFF",
            SlideFormat::Raster => "Raster image",
        }
    }

    pub const fn is_tiff(&self) -> bool {
        !matches!(self, SlideFormat::Raster)
    }
}

// =============================================================================
// Format Detection
// =============================================================================

/// Maximum bytes read from ImageDescription.
const MAX_DESCRIPTION_BYTES: usize = 4096;

/// Marker string for Aperio SVS format.
const APERIO_MARKER: &[u8] = b"Aperio";

/// Detect the format of a slide file from its header and first IFD.
pub async fn detect_format<R: RangeReader + ?Sized>(
    reader: &R,
) -> Result<SlideFormat, FormatError> {
    let probe_len = (BIGTIFF_HEADER_SIZE as u64).min(reader.size()) as usize;
    let header_bytes = reader.read_exact_at(0, probe_len).await?;
    if !is_tiff_header(&header_bytes) {
        return Ok(SlideFormat::Raster);
    }

    let header = TiffHeader::parse(&header_bytes, reader.size())?;
    match read_first_description(reader, &header).await? {
        Some(description) if contains_aperio_marker(description.as_bytes()) => {
            Ok(SlideFormat::AperioSvs)
        }
        _ => Ok(SlideFormat::GenericTiff),
    }
}

/// Read the ImageDescription of the first IFD, truncated to a few KB.
pub async fn read_first_description<R: RangeReader + ?Sized>(
    reader: &R,
    header: &TiffHeader,
) -> Result<Option<String>, FormatError> {
    let count_size = header.ifd_count_size();
    let count_bytes = reader
        .read_exact_at(header.first_ifd_offset, count_size)
        .await?;
    let entry_count = if header.is_bigtiff {
        header.byte_order.read_u64(&count_bytes)
    } else {
        header.byte_order.read_u16(&count_bytes) as u64
    };

    let ifd_size = Ifd::calculate_size(entry_count, header);
    let ifd_bytes = reader
        .read_exact_at(header.first_ifd_offset, ifd_size)
        .await?;
    let ifd = Ifd::parse(&ifd_bytes, header)?;

    let Some(entry) = ifd.get_entry_by_tag(TiffTag::ImageDescription) else {
        return Ok(None);
    };
    let read_len = (entry.count as usize).min(MAX_DESCRIPTION_BYTES);
    if read_len == 0 {
        return Ok(None);
    }

    let bytes = if entry.is_inline {
        entry.value_offset_bytes[..read_len.min(entry.value_offset_bytes.len())].to_vec()
    } else {
        let offset = entry.value_offset(header.byte_order);
        reader.read_exact_at(offset, read_len).await?.to_vec()
    };

    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(Some(String::from_utf8_lossy(&bytes[..end]).into_owned()))
}

fn contains_aperio_marker(data: &[u8]) -> bool {
    data.windows(APERIO_MARKER.len())
        .any(|window| window == APERIO_MARKER)
}

/// Microns per pixel from an Aperio description (`... |MPP = 0.2520|...`).
pub fn aperio_mpp(description: &str) -> Option<f64> {
    description
        .split('|')
        .filter_map(|field| field.split_once('='))
        .find(|(key, _)| key.trim() == "MPP")
        .and_then(|(_, value)| value.trim().parse::<f64>().ok())
        .filter(|mpp| *mpp > 0.0)
}

/// Check if bytes start with a valid TIFF or BigTIFF header.
pub fn is_tiff_header(bytes: &[u8]) -> bool {
    if bytes.len() < TIFF_HEADER_SIZE {
        return false;
    }

    let byte_order = match [bytes[0], bytes[1]] {
        [0x49, 0x49] => ByteOrder::LittleEndian,
        [0x4D, 0x4D] => ByteOrder::BigEndian,
        _ => return false,
    };
    let version = byte_order.read_u16(&bytes[2..4]);
    version == 42 || version == 43
}

// =============================================================================
// Tests
// =============================================================================
