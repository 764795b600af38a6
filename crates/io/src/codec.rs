// Blob framing: encoding tag, blake3 checksum, payload
//
// Every stored value is framed the same way so a reader can tell which
// serializer produced it and reject torn or bit-rotted payloads before
// handing them to serde. Both encodings are always readable; the writer
// picks one from settings.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

const TAG_JSON: u8 = b'J';
const TAG_COMPACT: u8 = b'C';
const TAG_RAW: u8 = b'R';

/// Tag byte plus 32-byte checksum.
pub const HEADER_LEN: usize = 1 + 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Self-describing; survives added fields.
    #[default]
    Json,
    /// Fixed binary schema; used for interchange (export/paste).
    Compact,
}

impl Encoding {
    fn tag(self) -> u8 {
        match self {
            Encoding::Json => TAG_JSON,
            Encoding::Compact => TAG_COMPACT,
        }
    }
}

fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(tag);
    out.extend_from_slice(blake3::hash(payload).as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a framed blob, verifying its checksum.
fn unframe<'a>(key: &str, bytes: &'a [u8]) -> Result<(u8, &'a [u8])> {
    if bytes.len() < HEADER_LEN {
        return Err(StoreError::Truncated { key: key.to_string(), len: bytes.len() });
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);
    if blake3::hash(payload).as_bytes() != &header[1..] {
        return Err(StoreError::Checksum { key: key.to_string() });
    }
    Ok((header[0], payload))
}

pub fn encode<T: Serialize>(key: &str, value: &T, encoding: Encoding) -> Result<Vec<u8>> {
    let payload = match encoding {
        Encoding::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
        Encoding::Compact => postcard::to_stdvec(value).map_err(|e| e.to_string()),
    }
    .map_err(|message| StoreError::Encode { key: key.to_string(), message })?;
    Ok(frame(encoding.tag(), &payload))
}

pub fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    let (tag, payload) = unframe(key, bytes)?;
    let decoded = match tag {
        TAG_JSON => serde_json::from_slice(payload).map_err(|e| e.to_string()),
        TAG_COMPACT => postcard::from_bytes(payload).map_err(|e| e.to_string()),
        tag => return Err(StoreError::UnknownEncoding { key: key.to_string(), tag }),
    };
    decoded.map_err(|message| StoreError::Decode { key: key.to_string(), message })
}

/// Frame opaque bytes (preview PNGs).
pub fn seal_raw(payload: &[u8]) -> Vec<u8> {
    frame(TAG_RAW, payload)
}

pub fn open_raw<'a>(key: &str, bytes: &'a [u8]) -> Result<&'a [u8]> {
    match unframe(key, bytes)? {
        (TAG_RAW, payload) => Ok(payload),
        (tag, _) => Err(StoreError::UnknownEncoding { key: key.to_string(), tag }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetfield_engine::content::{Point, SheetContent, TextBlock};

    fn sample() -> SheetContent {
        let mut content = SheetContent::new();
        content.texts.push(TextBlock::new(Point::new(1.0, 2.0), 200.0, "hello"));
        content
    }

    #[test]
    fn test_both_encodings_decode() {
        for encoding in [Encoding::Json, Encoding::Compact] {
            let bytes = encode("k", &sample(), encoding).unwrap();
            let back: SheetContent = decode("k", &bytes).unwrap();
            assert_eq!(back, sample());
        }
    }

    #[test]
    fn test_json_payload_is_readable_text() {
        let bytes = encode("k", &sample(), Encoding::Json).unwrap();
        let text = std::str::from_utf8(&bytes[HEADER_LEN..]).unwrap();
        assert!(text.contains("\"hello\""));
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let mut bytes = encode("k", &sample(), Encoding::Compact).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        assert!(matches!(decode::<SheetContent>("k", &bytes), Err(StoreError::Checksum { .. })));
    }

    #[test]
    fn test_short_blob_truncated() {
        assert!(matches!(
            decode::<SheetContent>("k", &[TAG_JSON, 1, 2]),
            Err(StoreError::Truncated { len: 3, .. })
        ));
    }

    #[test]
    fn test_raw_rejects_serde_blob() {
        let bytes = encode("k", &1u32, Encoding::Json).unwrap();
        assert!(open_raw("k", &bytes).is_err());
        assert_eq!(open_raw("k", &seal_raw(b"png")).unwrap(), b"png");
    }
}
