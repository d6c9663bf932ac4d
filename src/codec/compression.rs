//! Dectris tag-56500 payload expansion.
//!
//! Payloads carry the HDF5 filter framing used by the Dectris compression
//! library: an 8-byte big-endian total uncompressed size, a 4-byte
//! big-endian block size, then one `[4-byte BE stored length][bytes]`
//! record per block. A block whose stored length equals its uncompressed
//! length is kept verbatim; anything else is an LZ4 raw block. For
//! `bslz4` each expanded block is additionally bit-unshuffled with the
//! declared element size.
//!
//! The C library answers a size query before filling the caller's buffer;
//! here the size header in the framing gives the same bound in one pass.

use crate::error::{AppResult, StxmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Bslz4,
    Lz4,
}

fn parse_algorithm(value: &str) -> AppResult<Algorithm> {
    match value.trim().to_ascii_lowercase().as_str() {
        "bslz4" | "bs-lz4" | "bitshuffle-lz4" => Ok(Algorithm::Bslz4),
        "lz4" => Ok(Algorithm::Lz4),
        other => Err(StxmError::CompressUnsupportedAlg(other.to_string())),
    }
}

/// Expand one compressed payload into the original element bytes.
pub fn decompress(algorithm: &str, elem_size: usize, payload: &[u8]) -> AppResult<Vec<u8>> {
    let alg = parse_algorithm(algorithm)?;
    if elem_size == 0 {
        return Err(StxmError::CompressInvalidSize("element size 0".into()));
    }
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    if payload.len() < 12 {
        return Err(StxmError::CompressInvalidSize(format!(
            "{}-byte payload is shorter than the 12-byte header",
            payload.len()
        )));
    }

    let total = u64::from_be_bytes(payload[..8].try_into().unwrap()) as usize;
    let mut block_size = u32::from_be_bytes(payload[8..12].try_into().unwrap()) as usize;
    if block_size == 0 {
        block_size = total;
    }
    if total == 0 {
        return Ok(Vec::new());
    }

    let mut out = Vec::with_capacity(total);
    let mut cursor = &payload[12..];
    while out.len() < total {
        let this_block = block_size.min(total - out.len());
        if cursor.len() < 4 {
            return Err(StxmError::CompressInvalidSize(
                "truncated block header".into(),
            ));
        }
        let stored = u32::from_be_bytes(cursor[..4].try_into().unwrap()) as usize;
        cursor = &cursor[4..];
        if cursor.len() < stored {
            return Err(StxmError::CompressInvalidSize(format!(
                "block claims {stored} bytes but only {} remain",
                cursor.len()
            )));
        }
        let block = if stored == this_block {
            cursor[..stored].to_vec()
        } else {
            lz4_flex::block::decompress(&cursor[..stored], this_block)
                .map_err(|e| StxmError::CompressFailed(e.to_string()))?
        };
        if block.len() != this_block {
            return Err(StxmError::CompressFailed(format!(
                "block expanded to {} bytes, expected {this_block}",
                block.len()
            )));
        }
        cursor = &cursor[stored..];
        match alg {
            Algorithm::Bslz4 => out.extend_from_slice(&bit_unshuffle(&block, elem_size)),
            Algorithm::Lz4 => out.extend_from_slice(&block),
        }
    }

    Ok(out)
}

/// Inverse bit transpose for one bitshuffled block.
///
/// The shuffled layout stores bit plane `b` of the first `8 * (count / 8)`
/// elements contiguously, LSB first within each plane byte. Elements beyond
/// the last full group of eight are stored unshuffled.
fn bit_unshuffle(src: &[u8], elem_size: usize) -> Vec<u8> {
    let count = src.len() / elem_size;
    let kept = count - (count % 8);
    let mut dst = vec![0u8; src.len()];
    let stride = kept / 8;
    let nbits = elem_size * 8;
    for bit in 0..nbits {
        let plane = &src[bit * stride..(bit + 1) * stride];
        for (plane_byte, &b) in plane.iter().enumerate() {
            if b == 0 {
                continue;
            }
            for k in 0..8 {
                if b & (1 << k) != 0 {
                    let elem = plane_byte * 8 + k;
                    dst[elem * elem_size + bit / 8] |= 1 << (bit % 8);
                }
            }
        }
    }
    let tail = kept * elem_size;
    dst[tail..].copy_from_slice(&src[tail..]);
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Forward transform of [`bit_unshuffle`], used to build test vectors.
    fn bit_shuffle(src: &[u8], elem_size: usize) -> Vec<u8> {
        let count = src.len() / elem_size;
        let kept = count - (count % 8);
        let mut dst = vec![0u8; src.len()];
        let stride = kept / 8;
        let nbits = elem_size * 8;
        for elem in 0..kept {
            for bit in 0..nbits {
                if src[elem * elem_size + bit / 8] & (1 << (bit % 8)) != 0 {
                    dst[bit * stride + elem / 8] |= 1 << (elem % 8);
                }
            }
        }
        let tail = kept * elem_size;
        dst[tail..].copy_from_slice(&src[tail..]);
        dst
    }

    /// Build a framed payload the way the detector firmware does.
    fn frame_payload(alg: Algorithm, elem_size: usize, data: &[u8], block_size: usize) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(data.len() as u64).to_be_bytes());
        payload.extend_from_slice(&(block_size as u32).to_be_bytes());
        for chunk in data.chunks(block_size.max(1)) {
            let block = match alg {
                Algorithm::Bslz4 => bit_shuffle(chunk, elem_size),
                Algorithm::Lz4 => chunk.to_vec(),
            };
            let compressed = lz4_flex::block::compress(&block);
            if compressed.len() < block.len() {
                payload.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
                payload.extend_from_slice(&compressed);
            } else {
                payload.extend_from_slice(&(block.len() as u32).to_be_bytes());
                payload.extend_from_slice(&block);
            }
        }
        payload
    }

    #[test]
    fn bit_shuffle_round_trips() {
        for elem_size in [1usize, 2, 4, 8] {
            let data: Vec<u8> = (0..elem_size * 37).map(|i| (i * 31 % 251) as u8).collect();
            let shuffled = bit_shuffle(&data, elem_size);
            assert_eq!(bit_unshuffle(&shuffled, elem_size), data, "elem {elem_size}");
        }
    }

    #[test]
    fn lz4_payload_round_trips() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 7) as u8).collect();
        let payload = frame_payload(Algorithm::Lz4, 1, &data, 8192);
        assert_eq!(decompress("lz4", 1, &payload).unwrap(), data);
    }

    #[test]
    fn bslz4_payload_round_trips() {
        let data: Vec<u8> = (0..4 * 600u32).map(|i| (i * 13 % 256) as u8).collect();
        let payload = frame_payload(Algorithm::Bslz4, 4, &data, 2048);
        assert_eq!(decompress("bslz4", 4, &payload).unwrap(), data);
        // algorithm aliases accepted
        assert_eq!(decompress("BS-LZ4", 4, &payload).unwrap(), data);
    }

    #[test]
    fn incompressible_blocks_are_stored_verbatim() {
        let data: Vec<u8> = (0..512u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let payload = frame_payload(Algorithm::Lz4, 1, &data, 128);
        assert_eq!(decompress("lz4", 1, &payload).unwrap(), data);
    }

    #[test]
    fn empty_payload_is_empty_buffer() {
        assert!(decompress("lz4", 2, &[]).unwrap().is_empty());
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        assert!(matches!(
            decompress("zstd", 2, &[0; 16]),
            Err(StxmError::CompressUnsupportedAlg(_))
        ));
    }

    #[test]
    fn zero_element_size_is_rejected() {
        assert!(matches!(
            decompress("lz4", 0, &[0; 16]),
            Err(StxmError::CompressInvalidSize(_))
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let data = vec![1u8; 64];
        let mut payload = frame_payload(Algorithm::Lz4, 1, &data, 64);
        payload.truncate(payload.len() - 3);
        assert!(decompress("lz4", 1, &payload).is_err());
    }
}
