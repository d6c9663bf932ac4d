//! Application error types.
//!
//! A single consolidated enum, [`StxmError`], covers every recoverable and
//! fatal failure in the pipeline. Data-path errors (codec, compression,
//! aggregation, output) are *recoverable*: the owning stage counts them,
//! logs a throttled message, and keeps going. Only transport bring-up with
//! fallback disabled and invalid configuration abort the process.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, StxmError>;

/// Consolidated error type for the acquisition pipeline.
#[derive(Error, Debug)]
pub enum StxmError {
    /// The CBOR payload could not be parsed at all, or a required envelope
    /// field (`type`, `image_id`, `start_time`, `data`) is missing or
    /// malformed. The message is dropped and the decode-failure counter is
    /// incremented.
    #[error("codec decode error: {0}")]
    CodecDecode(String),

    /// Declared array extents disagree with the decoded element count.
    /// Recoverable at the channel level.
    #[error("codec shape error: {rows}x{cols} extents do not match {elems} elements")]
    CodecShape {
        rows: usize,
        cols: usize,
        elems: usize,
    },

    /// A CBOR map used a non-string key where a string key is required.
    #[error("codec key error: {0}")]
    CodecKey(String),

    /// A tag or element type outside the supported set.
    #[error("codec unsupported: {0}")]
    CodecUnsupported(String),

    /// Compression algorithm outside {bslz4, lz4}.
    #[error("unsupported compression algorithm {0:?}")]
    CompressUnsupportedAlg(String),

    /// Element size or framing lengths that cannot describe a valid payload.
    #[error("invalid compressed payload size: {0}")]
    CompressInvalidSize(String),

    /// The LZ4 stream itself failed to expand.
    #[error("decompression failed: {0}")]
    CompressFailed(String),

    /// Frame carried an image id outside the current grid. Dropped, not
    /// counted toward completion.
    #[error("image id {image_id} outside grid of {total_pixels} pixels")]
    AggregatorOutOfRange { image_id: u64, total_pixels: usize },

    /// Writing a completed series failed. Counted and surfaced through the
    /// status board; the run continues.
    #[error("output write error: {0}")]
    OutputWrite(#[from] std::io::Error),

    /// Writing a metadata envelope failed. Counted and logged.
    #[error("metadata write error: {0}")]
    MetadataWrite(String),

    /// Rejected synchronously at the input surface (flags, REST sinks).
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Transport-level failure (socket bring-up, send, receive).
    #[error("transport error: {0}")]
    Transport(String),
}
