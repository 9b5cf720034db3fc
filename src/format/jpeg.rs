//! Abbreviated JPEG stream handling.
//!
//! Aperio SVS files (and some generic tiled TIFFs) store each tile as an
//! abbreviated JPEG stream without quantization (DQT) or Huffman (DHT)
//! tables. The tables live once in the page's `JPEGTables` tag and must be
//! spliced into every tile before it can be decoded:
//!
//! ```text
//! tables: SOI [DQT DHT ...] EOI
//! tile:   SOI [SOS scan data] EOI
//! merged: SOI [DQT DHT ...] [SOS scan data] EOI
//! ```

use bytes::{Bytes, BytesMut};

/// Start Of Image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// End Of Image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

const DHT: [u8; 2] = [0xFF, 0xC4];
const DQT: [u8; 2] = [0xFF, 0xDB];
const SOS: [u8; 2] = [0xFF, 0xDA];

/// Whether a stream reaches SOS before any DQT or DHT segment.
pub fn is_abbreviated_stream(data: &[u8]) -> bool {
    if data.len() < 4 || data[0..2] != SOI {
        return false;
    }

    let mut pos = 2;
    while pos + 1 < data.len() {
        if data[pos] != 0xFF {
            pos += 1;
            continue;
        }

        let marker = [data[pos], data[pos + 1]];
        if marker == DQT || marker == DHT {
            return false;
        }
        if marker == SOS {
            return true;
        }

        // Skip the segment body when the marker carries a length
        if pos + 3 < data.len() && !matches!(marker[1], 0x00 | 0xD8 | 0xD9) {
            let length = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            pos += 2 + length;
        } else {
            pos += 2;
        }
    }

    false
}

/// Whether a stream carries its own quantization tables.
pub fn is_complete_stream(data: &[u8]) -> bool {
    data.len() >= 4 && data[0..2] == SOI && data[2..].windows(2).any(|w| w == DQT)
}

/// Splice `JPEGTables` into an abbreviated tile stream.
pub fn merge_jpeg_tables(tables: &[u8], tile_data: &[u8]) -> Bytes {
    if tables.is_empty() {
        return Bytes::copy_from_slice(tile_data);
    }
    if tile_data.is_empty() {
        return Bytes::new();
    }

    let tables_end = if tables.ends_with(&EOI) {
        tables.len() - 2
    } else {
        tables.len()
    };
    let tile_start = if tile_data.starts_with(&SOI) { 2 } else { 0 };

    let mut result = BytesMut::with_capacity(tables_end + tile_data.len() - tile_start);
    result.extend_from_slice(&tables[..tables_end]);
    result.extend_from_slice(&tile_data[tile_start..]);
    result.freeze()
}

/// Produce a decodable JPEG for a tile, merging tables only when needed.
pub fn prepare_tile_jpeg(tables: Option<&[u8]>, tile_data: &[u8]) -> Bytes {
    if is_complete_stream(tile_data) {
        return Bytes::copy_from_slice(tile_data);
    }

    match tables {
        Some(tables) if is_abbreviated_stream(tile_data) => merge_jpeg_tables(tables, tile_data),
        _ => Bytes::copy_from_slice(tile_data),
    }
}
