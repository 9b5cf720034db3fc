//! TIFF tag value reading.
//!
//! Values are stored either inline in the IFD entry (small values) or at an
//! offset in the file (arrays, strings, rationals). Arrays such as
//! TileOffsets are fetched with a single range read.

use bytes::Bytes;

use crate::error::TiffError;
use crate::io::RangeReader;

use super::parser::{ByteOrder, IfdEntry, TiffHeader};
use super::tags::FieldType;

// =============================================================================
// ValueReader
// =============================================================================

/// Reads tag values from a TIFF file, respecting its byte order and layout.
pub struct ValueReader<'a, R: RangeReader + ?Sized> {
    reader: &'a R,
    header: &'a TiffHeader,
}

impl<'a, R: RangeReader + ?Sized> ValueReader<'a, R> {
    pub fn new(reader: &'a R, header: &'a TiffHeader) -> Self {
        Self { reader, header }
    }

    #[inline]
    pub fn byte_order(&self) -> ByteOrder {
        self.header.byte_order
    }

    /// Read raw bytes for an IFD entry's value.
    ///
    /// For inline values, returns the bytes from the entry.
    /// For offset values, fetches the bytes from the file.
    pub async fn read_bytes(&self, entry: &IfdEntry) -> Result<Bytes, TiffError> {
        let size = entry
            .value_byte_size()
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if entry.is_inline {
            Ok(Bytes::copy_from_slice(
                &entry.value_offset_bytes[..size as usize],
            ))
        } else {
            let offset = entry.value_offset(self.header.byte_order);
            let bytes = self.reader.read_exact_at(offset, size as usize).await?;
            Ok(bytes)
        }
    }

    /// Read an array of integers, widening Short, Long and Long8 to u64.
    ///
    /// This is the primary method for TileOffsets and TileByteCounts.
    pub async fn read_u64_array(&self, entry: &IfdEntry) -> Result<Vec<u64>, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if !matches!(
            field_type,
            FieldType::Short | FieldType::Long | FieldType::Long8
        ) {
            return Err(TiffError::InvalidTagValue {
                tag: "array",
                message: format!("expected Short, Long, or Long8, got {:?}", field_type),
            });
        }
        if entry.count == 0 {
            return Ok(Vec::new());
        }

        let bytes = self.read_bytes(entry).await?;
        Ok(parse_u64_array(
            &bytes,
            entry.count as usize,
            field_type,
            self.header.byte_order,
        ))
    }

    /// Read an ASCII value, stripping the null terminator.
    pub async fn read_string(&self, entry: &IfdEntry) -> Result<String, TiffError> {
        if entry.field_type != Some(FieldType::Ascii) {
            return Err(TiffError::InvalidTagValue {
                tag: "string",
                message: format!("expected Ascii, got type {}", entry.field_type_raw),
            });
        }

        let bytes = self.read_bytes(entry).await?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Read a single Rational value as a float.
    pub async fn read_rational(&self, entry: &IfdEntry) -> Result<f64, TiffError> {
        if entry.field_type != Some(FieldType::Rational) || entry.count != 1 {
            return Err(TiffError::InvalidTagValue {
                tag: "rational",
                message: format!(
                    "expected one Rational, got type {} x{}",
                    entry.field_type_raw, entry.count
                ),
            });
        }

        let bytes = self.read_bytes(entry).await?;
        let byte_order = self.header.byte_order;
        let numerator = byte_order.read_u32(&bytes[0..4]);
        let denominator = byte_order.read_u32(&bytes[4..8]);
        if denominator == 0 {
            return Err(TiffError::InvalidTagValue {
                tag: "rational",
                message: "zero denominator".to_string(),
            });
        }
        Ok(numerator as f64 / denominator as f64)
    }

    /// Read raw bytes from an entry (JPEGTables and other opaque data).
    pub async fn read_raw_bytes(&self, entry: &IfdEntry) -> Result<Bytes, TiffError> {
        self.read_bytes(entry).await
    }
}

/// Parse an array of integers from raw bytes, widening to u64.
///
/// Values that would read past the end of `bytes` are dropped.
pub fn parse_u64_array(
    bytes: &[u8],
    count: usize,
    field_type: FieldType,
    byte_order: ByteOrder,
) -> Vec<u64> {
    let width = field_type.size_in_bytes();
    bytes
        .chunks_exact(width)
        .take(count)
        .filter_map(|chunk| match field_type {
            FieldType::Short => Some(byte_order.read_u16(chunk) as u64),
            FieldType::Long => Some(byte_order.read_u32(chunk) as u64),
            FieldType::Long8 => Some(byte_order.read_u64(chunk)),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoError;
    use async_trait::async_trait;

    /// Mock reader for testing
    struct MockReader {
        data: Bytes,
    }

    impl MockReader {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data: Bytes::from(data),
            }
        }
    }

    #[async_trait]
    impl RangeReader for MockReader {
        async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
            let start = offset as usize;
            let end = start + len;
            if end > self.data.len() {
                return Err(IoError::RangeOutOfBounds {
                    offset,
                    requested: len as u64,
                    size: self.data.len() as u64,
                });
            }
            Ok(self.data.slice(start..end))
        }

        fn size(&self) -> u64 {
            self.data.len() as u64
        }

        fn identifier(&self) -> &str {
            "mock://values"
        }
    }

    fn header() -> TiffHeader {
        TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: false,
            first_ifd_offset: 8,
        }
    }

    fn entry(field_type: FieldType, count: u64, value: [u8; 4], is_inline: bool) -> IfdEntry {
        IfdEntry {
            tag_id: 0,
            field_type: Some(field_type),
            field_type_raw: field_type.as_u16(),
            count,
            value_offset_bytes: value.to_vec(),
            is_inline,
        }
    }

    #[test]
    fn test_parse_u64_array_widths() {
        let bytes = [1, 0, 2, 0, 3, 0];
        assert_eq!(
            parse_u64_array(&bytes, 3, FieldType::Short, ByteOrder::LittleEndian),
            vec![1, 2, 3]
        );

        let bytes = [0, 0, 0, 1, 0, 0, 0, 2];
        assert_eq!(
            parse_u64_array(&bytes, 2, FieldType::Long, ByteOrder::BigEndian),
            vec![1, 2]
        );

        // Truncated input drops the incomplete value
        let bytes = [1, 0, 0, 0, 0, 0, 0, 0, 9];
        assert_eq!(
            parse_u64_array(&bytes, 2, FieldType::Long8, ByteOrder::LittleEndian),
            vec![1]
        );
    }

    #[tokio::test]
    async fn test_read_u64_array_at_offset() {
        let mut data = vec![0u8; 64];
        for (i, v) in [100u32, 200, 300].iter().enumerate() {
            data[20 + i * 4..24 + i * 4].copy_from_slice(&v.to_le_bytes());
        }
        let reader = MockReader::new(data);
        let header = header();
        let values = ValueReader::new(&reader, &header);

        let e = entry(FieldType::Long, 3, 20u32.to_le_bytes(), false);
        assert_eq!(values.read_u64_array(&e).await.unwrap(), vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn test_read_inline_bytes() {
        let reader = MockReader::new(vec![0; 16]);
        let header = header();
        let values = ValueReader::new(&reader, &header);

        let e = entry(FieldType::Short, 2, [8, 0, 8, 0], true);
        assert_eq!(values.read_u64_array(&e).await.unwrap(), vec![8, 8]);
    }

    #[tokio::test]
    async fn test_read_string_and_rational() {
        let mut data = vec![0u8; 64];
        data[16..26].copy_from_slice(b"Aperio SVS");
        data[32..36].copy_from_slice(&40000u32.to_le_bytes());
        data[36..40].copy_from_slice(&10u32.to_le_bytes());
        let reader = MockReader::new(data);
        let header = header();
        let values = ValueReader::new(&reader, &header);

        let s = entry(FieldType::Ascii, 11, 16u32.to_le_bytes(), false);
        assert_eq!(values.read_string(&s).await.unwrap(), "Aperio SVS");

        let r = entry(FieldType::Rational, 1, 32u32.to_le_bytes(), false);
        assert!((values.read_rational(&r).await.unwrap() - 4000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_field_type() {
        let reader = MockReader::new(vec![0; 16]);
        let header = header();
        let values = ValueReader::new(&reader, &header);

        let e = IfdEntry {
            tag_id: 0,
            field_type: None,
            field_type_raw: 99,
            count: 1,
            value_offset_bytes: vec![0; 4],
            is_inline: false,
        };
        assert!(matches!(
            values.read_bytes(&e).await,
            Err(TiffError::UnknownFieldType(99))
        ));
    }
}
