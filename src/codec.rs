//! JSON wire encoding.
//!
//! Bodies are plain JSON with three extras: the unknown-value sentinel,
//! normalised datetimes, and `</` escaping so a payload can be embedded in
//! HTML. Bodies of at least [`GZIP_MIN_LENGTH`] bytes are gzip compressed.

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::io::Write;

/// Wire representation of a value that is not known yet.
pub const UNKNOWN_STRING: &str = "<<undefined>>";

/// Bodies shorter than this are sent uncompressed.
pub const GZIP_MIN_LENGTH: usize = 1024;
const GZIP_LEVEL: u32 = 6;

pub const CONTENT_TYPE: &str = "Content-Type";
pub const JSON_CONTENT: &str = "application/json";

/// Marker for a value that cannot be resolved yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unknown;

impl Serialize for Unknown {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(UNKNOWN_STRING)
    }
}

/// Canonical wire form of a timestamp (microsecond precision, explicit offset).
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6f%:z").to_string()
}

/// Encode a value as wire JSON.
pub fn json_encode<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    Ok(serde_json::to_string(value)?.replace("</", "<\\/"))
}

/// Encode and compress when it pays off. Returns `(compressed, bytes)`.
pub fn gzipped_json<T: Serialize + ?Sized>(value: &T) -> std::io::Result<(bool, Vec<u8>)> {
    let encoded = json_encode(value).map_err(std::io::Error::other)?;
    if encoded.len() < GZIP_MIN_LENGTH {
        return Ok((false, encoded.into_bytes()));
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(GZIP_LEVEL));
    encoder.write_all(encoded.as_bytes())?;
    Ok((true, encoder.finish()?))
}

fn decode_json(bytes: &[u8]) -> serde_json::Result<Option<Value>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(bytes).map(Some)
}

/// Decode a response body according to its content type.
///
/// JSON (or no content type) is parsed, HTML is returned as text and anything
/// else is passed through lossily as a string.
pub fn decode_by_content_type(content_type: Option<&str>, bytes: &[u8]) -> serde_json::Result<Option<Value>> {
    match content_type {
        None => decode_json(bytes),
        Some(ct) if ct.starts_with(JSON_CONTENT) => decode_json(bytes),
        Some(_) => Ok(Some(Value::String(String::from_utf8_lossy(bytes).into_owned()))),
    }
}

/// Shorten a value for log output.
pub fn shorten(msg: &str, max_len: usize) -> String {
    if msg.chars().count() < max_len {
        return msg.to_string();
    }
    let kept: String = msg.chars().take(max_len.saturating_sub(3)).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use serde_json::json;

    #[test]
    fn test_unknown_sentinel() {
        #[derive(Serialize)]
        struct Attr {
            value: Unknown,
        }
        let encoded = json_encode(&Attr { value: Unknown }).unwrap();
        assert_eq!(encoded, format!(r#"{{"value":"{UNKNOWN_STRING}"}}"#));
    }

    #[test]
    fn test_escapes_closing_tags() {
        let encoded = json_encode(&json!({"html": "</script>"})).unwrap();
        assert!(encoded.contains(r"<\/script>"));
    }

    #[test]
    fn test_small_bodies_are_not_compressed() {
        let (zipped, bytes) = gzipped_json(&json!({"name": "demo"})).unwrap();
        assert!(!zipped);
        assert_eq!(bytes, br#"{"name":"demo"}"#);
    }

    #[test]
    fn test_large_bodies_are_compressed() {
        let body = json!({"blob": "x".repeat(4 * GZIP_MIN_LENGTH)});
        let (zipped, bytes) = gzipped_json(&body).unwrap();
        assert!(zipped);
        assert!(bytes.len() < GZIP_MIN_LENGTH);
        let mut raw = String::new();
        GzDecoder::new(bytes.as_slice()).read_to_string(&mut raw).unwrap();
        assert_eq!(serde_json::from_str::<Value>(&raw).unwrap(), body);
    }

    #[test]
    fn test_format_datetime() {
        let dt = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        assert_eq!(format_datetime(&dt), "2024-05-06T07:08:09.000000+00:00");
    }

    #[test]
    fn test_decode_by_content_type() {
        assert_eq!(decode_by_content_type(None, b"").unwrap(), None);
        assert_eq!(
            decode_by_content_type(Some("text/html"), b"<p>hi</p>").unwrap(),
            Some(json!("<p>hi</p>"))
        );
    }

    #[test]
    fn test_shorten() {
        assert_eq!(shorten("short", 10), "short");
        assert_eq!(shorten("a much longer value", 10), "a much ...");
    }
}
