//! Detector wire format.
//!
//! A detector message is a CBOR map whose `type` key selects the kind:
//! `start` and `end` carry run metadata, `image` carries one compressed
//! 2-D array per threshold channel. Decoding happens in two layers:
//! this module parses the envelope into a [`RawMessage`], and
//! [`arrays`] / [`compression`] expand the tagged array payloads.
//!
//! The decoder never panics on malformed input. Envelope-level problems
//! yield an error (the message is dropped upstream); a failure inside a
//! single channel merely omits that channel from the resulting frame.

pub mod arrays;
pub mod compression;

use std::collections::{BTreeMap, HashMap};

use minicbor::data::Type;
use minicbor::Decoder;
use tracing::debug;

use crate::error::{AppResult, StxmError};
pub use arrays::{PixelArray, PixelGrid};

/// Metadata mapping carried by control messages, keys coerced to strings.
pub type MetaMap = BTreeMap<String, CborValue>;

/// One decoded transport message.
#[derive(Debug, Clone)]
pub enum RawMessage {
    /// `start`, `end`, or any other non-image kind, with its metadata.
    Control { kind: String, meta: MetaMap },
    /// An image frame with one decoded array per surviving channel.
    Image(RawFrame),
}

/// A decoded image message prior to reduction.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Scan-position index, row-major over the grid.
    pub image_id: u64,
    /// Acquisition start time in seconds.
    pub start_time: f64,
    /// Channel name to decoded 2-D array.
    pub data: HashMap<String, PixelGrid>,
}

/// Dynamic CBOR value tree, the decoded form of untyped metadata.
///
/// Indefinite-length items are rejected: the detector stream encodes
/// definite lengths only.
#[derive(Debug, Clone, PartialEq)]
pub enum CborValue {
    Null,
    Bool(bool),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<CborValue>),
    Map(Vec<(CborValue, CborValue)>),
    Tagged(u64, Box<CborValue>),
}

impl CborValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CborValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer coercion accepting unsigned, non-negative signed, and
    /// integral floats, mirroring the loose numeric typing of the stream.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            CborValue::Unsigned(n) => Some(n),
            CborValue::Signed(n) if n >= 0 => Some(n as u64),
            CborValue::Float(f) if f >= 0.0 && f.fract() == 0.0 => Some(f as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            CborValue::Unsigned(n) => Some(n as f64),
            CborValue::Signed(n) => Some(n as f64),
            CborValue::Float(f) => Some(f),
            _ => None,
        }
    }
}

/// A decode result together with the number of channels that failed.
///
/// Channel failures are recoverable (the frame ships without them) but are
/// still accounted against the decode-failure counter by the caller.
#[derive(Debug)]
pub struct Decoded {
    pub message: RawMessage,
    pub channel_failures: u64,
}

/// Parse one transport payload into a [`RawMessage`].
///
/// Errors cover the whole message (unparseable CBOR, missing `type`,
/// invalid `image_id`/`start_time`, no decodable channels). Channel-level
/// array failures are logged at debug level and skipped, with their count
/// reported in [`Decoded::channel_failures`].
pub fn decode_message(payload: &[u8]) -> AppResult<Decoded> {
    let mut dec = Decoder::new(payload);
    let top = decode_value(&mut dec, 0)
        .map_err(|e| StxmError::CodecDecode(format!("cbor parse: {e}")))?;

    let entries = match top {
        CborValue::Map(entries) => entries,
        other => {
            return Err(StxmError::CodecDecode(format!(
                "expected map envelope, got {}",
                kind_name(&other)
            )))
        }
    };

    let mut fields: BTreeMap<String, CborValue> = BTreeMap::new();
    for (key, value) in entries {
        match key {
            CborValue::Text(k) => {
                fields.insert(k, value);
            }
            other => {
                return Err(StxmError::CodecKey(format!(
                    "envelope key is {}, not a string",
                    kind_name(&other)
                )))
            }
        }
    }

    let kind = match fields.remove("type") {
        Some(CborValue::Text(kind)) => kind,
        Some(other) => {
            return Err(StxmError::CodecDecode(format!(
                "message type is {}, not a string",
                kind_name(&other)
            )))
        }
        None => return Err(StxmError::CodecDecode("missing message type".into())),
    };

    if kind != "image" {
        return Ok(Decoded {
            message: RawMessage::Control { kind, meta: fields },
            channel_failures: 0,
        });
    }

    let image_id = fields
        .get("image_id")
        .and_then(CborValue::as_u64)
        .ok_or_else(|| StxmError::CodecDecode("missing or invalid image_id".into()))?;
    let start_time = fields
        .get("start_time")
        .ok_or_else(|| StxmError::CodecDecode("missing start_time".into()))
        .and_then(parse_time_value)?;

    let data_entries = match fields.remove("data") {
        Some(CborValue::Map(entries)) => entries,
        Some(other) => {
            return Err(StxmError::CodecDecode(format!(
                "image data is {}, not a map",
                kind_name(&other)
            )))
        }
        None => return Err(StxmError::CodecDecode("missing image data".into())),
    };

    let mut data = HashMap::with_capacity(data_entries.len());
    let mut channel_failures = 0u64;
    for (key, value) in data_entries {
        let channel = match key {
            CborValue::Text(name) => name,
            other => {
                return Err(StxmError::CodecKey(format!(
                    "channel key is {}, not a string",
                    kind_name(&other)
                )))
            }
        };
        match arrays::decode_multi_dim(&value) {
            Ok(grid) => {
                data.insert(channel, grid);
            }
            Err(err) => {
                channel_failures += 1;
                debug!(channel = %channel, error = %err, "dropping undecodable channel");
            }
        }
    }
    if data.is_empty() {
        return Err(StxmError::CodecDecode(
            "image had no decodable channels".into(),
        ));
    }

    Ok(Decoded {
        message: RawMessage::Image(RawFrame {
            image_id,
            start_time,
            data,
        }),
        channel_failures,
    })
}

/// `start_time` is either a plain number of seconds or `[seconds, nanos]`.
fn parse_time_value(value: &CborValue) -> AppResult<f64> {
    match value {
        CborValue::Array(items) => {
            if items.len() != 2 {
                return Err(StxmError::CodecDecode(format!(
                    "invalid time array length {}",
                    items.len()
                )));
            }
            let sec = items[0]
                .as_f64()
                .ok_or_else(|| StxmError::CodecDecode("non-numeric time seconds".into()))?;
            let nsec = items[1]
                .as_f64()
                .ok_or_else(|| StxmError::CodecDecode("non-numeric time nanos".into()))?;
            Ok(sec + nsec * 1e-9)
        }
        other => other
            .as_f64()
            .ok_or_else(|| StxmError::CodecDecode("non-numeric start_time".into())),
    }
}

/// Parse one payload into the dynamic value tree without interpreting the
/// envelope (used by the raw-log inspection tool).
pub fn decode_raw(payload: &[u8]) -> AppResult<CborValue> {
    let mut dec = Decoder::new(payload);
    decode_value(&mut dec, 0).map_err(|e| StxmError::CodecDecode(format!("cbor parse: {e}")))
}

const MAX_NESTING: usize = 64;

/// Recursive CBOR walker producing a [`CborValue`] tree.
pub(crate) fn decode_value(
    dec: &mut Decoder<'_>,
    depth: usize,
) -> Result<CborValue, minicbor::decode::Error> {
    if depth > MAX_NESTING {
        return Err(minicbor::decode::Error::message("nesting too deep"));
    }
    match dec.datatype()? {
        Type::Null => {
            dec.null()?;
            Ok(CborValue::Null)
        }
        Type::Undefined => {
            dec.undefined()?;
            Ok(CborValue::Null)
        }
        Type::Bool => Ok(CborValue::Bool(dec.bool()?)),
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => Ok(CborValue::Unsigned(dec.u64()?)),
        Type::I8 | Type::I16 | Type::I32 | Type::I64 | Type::Int => {
            Ok(CborValue::Signed(dec.i64()?))
        }
        Type::F16 | Type::F32 | Type::F64 => Ok(CborValue::Float(dec.f64()?)),
        Type::String => Ok(CborValue::Text(dec.str()?.to_owned())),
        Type::Bytes => Ok(CborValue::Bytes(dec.bytes()?.to_vec())),
        Type::Array => {
            let len = dec
                .array()?
                .ok_or_else(|| minicbor::decode::Error::message("indefinite array"))?;
            let mut items = Vec::with_capacity(len.min(4096) as usize);
            for _ in 0..len {
                items.push(decode_value(dec, depth + 1)?);
            }
            Ok(CborValue::Array(items))
        }
        Type::Map => {
            let len = dec
                .map()?
                .ok_or_else(|| minicbor::decode::Error::message("indefinite map"))?;
            let mut entries = Vec::with_capacity(len.min(4096) as usize);
            for _ in 0..len {
                let key = decode_value(dec, depth + 1)?;
                let value = decode_value(dec, depth + 1)?;
                entries.push((key, value));
            }
            Ok(CborValue::Map(entries))
        }
        Type::Tag => {
            let tag = dec.tag()?;
            let content = decode_value(dec, depth + 1)?;
            Ok(CborValue::Tagged(tag.as_u64(), Box::new(content)))
        }
        Type::Simple => {
            let n = dec.simple()?;
            Ok(CborValue::Unsigned(n as u64))
        }
        ty => Err(minicbor::decode::Error::message(format!(
            "unsupported cbor item {ty}"
        ))),
    }
}

fn kind_name(value: &CborValue) -> &'static str {
    match value {
        CborValue::Null => "null",
        CborValue::Bool(_) => "bool",
        CborValue::Unsigned(_) | CborValue::Signed(_) => "integer",
        CborValue::Float(_) => "float",
        CborValue::Text(_) => "string",
        CborValue::Bytes(_) => "bytes",
        CborValue::Array(_) => "array",
        CborValue::Map(_) => "map",
        CborValue::Tagged(..) => "tag",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minicbor::data::Tag;
    use minicbor::Encoder;

    fn encode_image(image_id: u64, start_time: f64, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(4).unwrap();
        enc.str("type").unwrap().str("image").unwrap();
        enc.str("image_id").unwrap().u64(image_id).unwrap();
        enc.str("start_time").unwrap().f64(start_time).unwrap();
        enc.str("data").unwrap();
        enc.map(1).unwrap();
        enc.str("threshold_0").unwrap();
        enc.tag(Tag::new(arrays::TAG_MULTI_DIM)).unwrap();
        enc.array(2).unwrap();
        enc.array(2).unwrap().u64(1).unwrap().u64(2).unwrap();
        enc.tag(Tag::new(arrays::TAG_U8)).unwrap();
        enc.bytes(payload).unwrap();
        buf
    }

    #[test]
    fn decodes_image_envelope() {
        let payload = encode_image(7, 1.25, &[10, 20]);
        let decoded = decode_message(&payload).unwrap();
        assert_eq!(decoded.channel_failures, 0);
        let frame = match decoded.message {
            RawMessage::Image(frame) => frame,
            other => panic!("expected image, got {other:?}"),
        };
        assert_eq!(frame.image_id, 7);
        assert_eq!(frame.start_time, 1.25);
        let grid = &frame.data["threshold_0"];
        assert_eq!((grid.rows, grid.cols), (1, 2));
        assert_eq!(grid.pixels, PixelArray::U8(vec![10, 20]));
    }

    #[test]
    fn control_message_keeps_metadata_minus_type() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3).unwrap();
        enc.str("type").unwrap().str("start").unwrap();
        enc.str("number_of_images").unwrap().u64(16).unwrap();
        enc.str("channels").unwrap();
        enc.array(1).unwrap().str("threshold_0").unwrap();

        let decoded = decode_message(&buf).unwrap();
        match decoded.message {
            RawMessage::Control { kind, meta } => {
                assert_eq!(kind, "start");
                assert!(!meta.contains_key("type"));
                assert_eq!(meta["number_of_images"], CborValue::Unsigned(16));
            }
            other => panic!("expected control, got {other:?}"),
        }
    }

    #[test]
    fn missing_type_is_an_error() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(1).unwrap();
        enc.str("series").unwrap().u64(3).unwrap();
        assert!(matches!(
            decode_message(&buf),
            Err(StxmError::CodecDecode(_))
        ));
    }

    #[test]
    fn non_string_envelope_key_is_a_key_error() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("type").unwrap().str("start").unwrap();
        enc.u64(9).unwrap().str("value").unwrap();
        assert!(matches!(decode_message(&buf), Err(StxmError::CodecKey(_))));
    }

    #[test]
    fn start_time_pair_combines_nanos() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(4).unwrap();
        enc.str("type").unwrap().str("image").unwrap();
        enc.str("image_id").unwrap().u64(0).unwrap();
        enc.str("start_time").unwrap();
        enc.array(2).unwrap().u64(5).unwrap().u64(500_000_000).unwrap();
        enc.str("data").unwrap();
        enc.map(1).unwrap();
        enc.str("threshold_0").unwrap();
        enc.tag(Tag::new(arrays::TAG_MULTI_DIM)).unwrap();
        enc.array(2).unwrap();
        enc.array(2).unwrap().u64(1).unwrap().u64(1).unwrap();
        enc.tag(Tag::new(arrays::TAG_U8)).unwrap();
        enc.bytes(&[1]).unwrap();

        match decode_message(&buf).unwrap().message {
            RawMessage::Image(frame) => assert!((frame.start_time - 5.5).abs() < 1e-9),
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn partial_channel_failure_keeps_good_channel() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(4).unwrap();
        enc.str("type").unwrap().str("image").unwrap();
        enc.str("image_id").unwrap().u64(3).unwrap();
        enc.str("start_time").unwrap().f64(0.5).unwrap();
        enc.str("data").unwrap();
        enc.map(2).unwrap();
        // valid 1x2 u8 channel
        enc.str("threshold_0").unwrap();
        enc.tag(Tag::new(arrays::TAG_MULTI_DIM)).unwrap();
        enc.array(2).unwrap();
        enc.array(2).unwrap().u64(1).unwrap().u64(2).unwrap();
        enc.tag(Tag::new(arrays::TAG_U8)).unwrap();
        enc.bytes(&[1, 2]).unwrap();
        // mismatched extents on the second channel
        enc.str("threshold_1").unwrap();
        enc.tag(Tag::new(arrays::TAG_MULTI_DIM)).unwrap();
        enc.array(2).unwrap();
        enc.array(2).unwrap().u64(4).unwrap().u64(4).unwrap();
        enc.tag(Tag::new(arrays::TAG_U8)).unwrap();
        enc.bytes(&[1, 2]).unwrap();

        let decoded = decode_message(&buf).unwrap();
        assert_eq!(decoded.channel_failures, 1);
        match decoded.message {
            RawMessage::Image(frame) => {
                assert!(frame.data.contains_key("threshold_0"));
                assert!(!frame.data.contains_key("threshold_1"));
            }
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn image_with_only_bad_channels_is_dropped() {
        // extents 2x2 but only two bytes of payload
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(4).unwrap();
        enc.str("type").unwrap().str("image").unwrap();
        enc.str("image_id").unwrap().u64(0).unwrap();
        enc.str("start_time").unwrap().f64(0.0).unwrap();
        enc.str("data").unwrap();
        enc.map(1).unwrap();
        enc.str("threshold_0").unwrap();
        enc.tag(Tag::new(arrays::TAG_MULTI_DIM)).unwrap();
        enc.array(2).unwrap();
        enc.array(2).unwrap().u64(2).unwrap().u64(2).unwrap();
        enc.tag(Tag::new(arrays::TAG_U8)).unwrap();
        enc.bytes(&[1, 2]).unwrap();

        assert!(matches!(
            decode_message(&buf),
            Err(StxmError::CodecDecode(_))
        ));
    }
}
