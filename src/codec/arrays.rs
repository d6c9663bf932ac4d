//! Tag-40 multi-dimensional arrays and RFC 8746 typed arrays.
//!
//! A channel value is `40([[rows, cols], typed-array])` where the typed
//! array is one of the little-endian tags below. Its content is either a
//! packed byte string or a nested Dectris tag 56500 that expands through
//! [`super::compression`] first.

use crate::error::{AppResult, StxmError};

use super::compression;
use super::CborValue;

/// CBOR tag for a row-major multi-dimensional array.
pub const TAG_MULTI_DIM: u64 = 40;
/// RFC 8746 typed-array tags accepted by the stream.
pub const TAG_U8: u64 = 64;
pub const TAG_U16_LE: u64 = 69;
pub const TAG_U32_LE: u64 = 70;
pub const TAG_F32_LE: u64 = 85;
/// Dectris compressed-payload tag.
pub const TAG_DECTRIS: u64 = 56500;

/// Flat element storage for one decoded array, tagged by element type.
///
/// The variant is fixed once at decode time so the reducer can dispatch
/// statically per element type. `U64`/`I64`/`F64` never come off the wire
/// but the reducer supports them for synthetic inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelArray {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl PixelArray {
    pub fn len(&self) -> usize {
        match self {
            PixelArray::U8(v) => v.len(),
            PixelArray::U16(v) => v.len(),
            PixelArray::U32(v) => v.len(),
            PixelArray::U64(v) => v.len(),
            PixelArray::I64(v) => v.len(),
            PixelArray::F32(v) => v.len(),
            PixelArray::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One decoded 2-D channel image: row-major flat storage plus extents.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelGrid {
    pub rows: usize,
    pub cols: usize,
    pub pixels: PixelArray,
}

/// Decode a tag-40 value into a [`PixelGrid`].
pub fn decode_multi_dim(value: &CborValue) -> AppResult<PixelGrid> {
    let content = match value {
        CborValue::Tagged(TAG_MULTI_DIM, content) => content.as_ref(),
        CborValue::Tagged(tag, _) => {
            return Err(StxmError::CodecUnsupported(format!(
                "expected multidim tag {TAG_MULTI_DIM}, got {tag}"
            )))
        }
        other => {
            return Err(StxmError::CodecUnsupported(format!(
                "channel value is not tagged: {other:?}"
            )))
        }
    };

    let items = match content {
        CborValue::Array(items) if items.len() == 2 => items,
        _ => {
            return Err(StxmError::CodecDecode(
                "invalid multidim array content".into(),
            ))
        }
    };

    let dims = match &items[0] {
        CborValue::Array(dims) if dims.len() == 2 => dims,
        _ => return Err(StxmError::CodecDecode("invalid multidim dimensions".into())),
    };
    let rows = dims[0]
        .as_u64()
        .ok_or_else(|| StxmError::CodecDecode("non-integer row extent".into()))?
        as usize;
    let cols = dims[1]
        .as_u64()
        .ok_or_else(|| StxmError::CodecDecode("non-integer column extent".into()))?
        as usize;

    let pixels = decode_typed_array(&items[1])?;
    if rows.checked_mul(cols) != Some(pixels.len()) {
        return Err(StxmError::CodecShape {
            rows,
            cols,
            elems: pixels.len(),
        });
    }

    Ok(PixelGrid { rows, cols, pixels })
}

fn decode_typed_array(value: &CborValue) -> AppResult<PixelArray> {
    let (tag, content) = match value {
        CborValue::Tagged(tag, content) => (*tag, content.as_ref()),
        other => {
            return Err(StxmError::CodecUnsupported(format!(
                "expected typed array tag, got {other:?}"
            )))
        }
    };

    let bytes = extract_bytes(content)?;

    match tag {
        TAG_U8 => Ok(PixelArray::U8(bytes)),
        TAG_U16_LE => Ok(PixelArray::U16(bytes_to_u16(&bytes)?)),
        TAG_U32_LE => Ok(PixelArray::U32(bytes_to_u32(&bytes)?)),
        TAG_F32_LE => Ok(PixelArray::F32(bytes_to_f32(&bytes)?)),
        other => Err(StxmError::CodecUnsupported(format!(
            "unsupported typed array tag {other}"
        ))),
    }
}

/// Typed-array content: packed bytes, or a nested Dectris compression tag
/// `56500([algorithm, elem_size, payload])`.
fn extract_bytes(content: &CborValue) -> AppResult<Vec<u8>> {
    match content {
        CborValue::Bytes(bytes) => Ok(bytes.clone()),
        CborValue::Tagged(TAG_DECTRIS, inner) => {
            let items = match inner.as_ref() {
                CborValue::Array(items) if items.len() == 3 => items,
                _ => return Err(StxmError::CodecDecode("invalid dectris tag content".into())),
            };
            let algorithm = items[0]
                .as_str()
                .ok_or_else(|| StxmError::CodecDecode("invalid dectris algorithm".into()))?;
            let elem_size = items[1]
                .as_u64()
                .ok_or_else(|| StxmError::CodecDecode("invalid dectris element size".into()))?
                as usize;
            let payload = match &items[2] {
                CborValue::Bytes(payload) => payload,
                _ => return Err(StxmError::CodecDecode("invalid dectris payload".into())),
            };
            compression::decompress(algorithm, elem_size, payload)
        }
        CborValue::Tagged(tag, _) => Err(StxmError::CodecUnsupported(format!(
            "unsupported nested tag {tag}"
        ))),
        other => Err(StxmError::CodecUnsupported(format!(
            "unsupported typed array content {other:?}"
        ))),
    }
}

fn bytes_to_u16(data: &[u8]) -> AppResult<Vec<u16>> {
    if data.len() % 2 != 0 {
        return Err(StxmError::CodecDecode(format!(
            "u16 payload of {} bytes is not element-aligned",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

fn bytes_to_u32(data: &[u8]) -> AppResult<Vec<u32>> {
    if data.len() % 4 != 0 {
        return Err(StxmError::CodecDecode(format!(
            "u32 payload of {} bytes is not element-aligned",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn bytes_to_f32(data: &[u8]) -> AppResult<Vec<f32>> {
    if data.len() % 4 != 0 {
        return Err(StxmError::CodecDecode(format!(
            "f32 payload of {} bytes is not element-aligned",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multidim(rows: u64, cols: u64, tag: u64, payload: Vec<u8>) -> CborValue {
        CborValue::Tagged(
            TAG_MULTI_DIM,
            Box::new(CborValue::Array(vec![
                CborValue::Array(vec![CborValue::Unsigned(rows), CborValue::Unsigned(cols)]),
                CborValue::Tagged(tag, Box::new(CborValue::Bytes(payload))),
            ])),
        )
    }

    #[test]
    fn decodes_u8_grid() {
        let grid = decode_multi_dim(&multidim(2, 2, TAG_U8, vec![1, 2, 3, 4])).unwrap();
        assert_eq!((grid.rows, grid.cols), (2, 2));
        assert_eq!(grid.pixels, PixelArray::U8(vec![1, 2, 3, 4]));
    }

    #[test]
    fn decodes_u16_little_endian() {
        let grid = decode_multi_dim(&multidim(1, 2, TAG_U16_LE, vec![0x01, 0x00, 0xff, 0xff]))
            .unwrap();
        assert_eq!(grid.pixels, PixelArray::U16(vec![1, 0xffff]));
    }

    #[test]
    fn decodes_f32_little_endian() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1.5f32.to_le_bytes());
        payload.extend_from_slice(&(-2.0f32).to_le_bytes());
        let grid = decode_multi_dim(&multidim(2, 1, TAG_F32_LE, payload)).unwrap();
        assert_eq!(grid.pixels, PixelArray::F32(vec![1.5, -2.0]));
    }

    #[test]
    fn extent_mismatch_is_shape_error() {
        let err = decode_multi_dim(&multidim(3, 3, TAG_U8, vec![1, 2, 3, 4])).unwrap_err();
        assert!(matches!(err, StxmError::CodecShape { .. }));
    }

    #[test]
    fn unknown_typed_tag_is_unsupported() {
        let err = decode_multi_dim(&multidim(1, 1, 77, vec![0, 0])).unwrap_err();
        assert!(matches!(err, StxmError::CodecUnsupported(_)));
    }

    #[test]
    fn wrong_outer_tag_is_unsupported() {
        let value = CborValue::Tagged(1040, Box::new(CborValue::Null));
        assert!(matches!(
            decode_multi_dim(&value),
            Err(StxmError::CodecUnsupported(_))
        ));
    }
}
