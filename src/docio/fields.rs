//! Raw element access over framed documents
//!
//! The archive engine never interprets documents, with two narrow
//! exceptions: the small namespace/stream header documents it frames the
//! archive with, and the `ts` field of oplog entries when a replay time
//! limit is set. This module provides just enough element walking for
//! those two users: iterate name/type/payload triples, skip types it does
//! not read by their known sizes, and build flat documents of
//! string/bool/i32/i64 elements.
//!
//! Element layout: one type byte, a zero-terminated name, then a payload
//! whose extent depends on the type. The walker validates extents against
//! the document boundary and reports anything inconsistent as a
//! `BadElement` framing error.

use crate::error::{FramingError, FramingResult};

// Element type bytes (the subset with distinct extents; everything is
// skippable, only a few are readable).
const T_DOUBLE: u8 = 0x01;
const T_STRING: u8 = 0x02;
const T_DOCUMENT: u8 = 0x03;
const T_ARRAY: u8 = 0x04;
const T_BINARY: u8 = 0x05;
const T_UNDEFINED: u8 = 0x06;
const T_OBJECTID: u8 = 0x07;
const T_BOOL: u8 = 0x08;
const T_DATETIME: u8 = 0x09;
const T_NULL: u8 = 0x0A;
const T_REGEX: u8 = 0x0B;
const T_DBPOINTER: u8 = 0x0C;
const T_CODE: u8 = 0x0D;
const T_SYMBOL: u8 = 0x0E;
const T_CODE_W_SCOPE: u8 = 0x0F;
const T_INT32: u8 = 0x10;
const T_TIMESTAMP: u8 = 0x11;
const T_INT64: u8 = 0x12;
const T_DECIMAL128: u8 = 0x13;
const T_MINKEY: u8 = 0xFF;
const T_MAXKEY: u8 = 0x7F;

/// One decoded element value. Types the engine never reads are carried
/// as [`RawField::Other`] with their raw payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RawField<'a> {
    String(&'a str),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    /// Raw 8-byte internal timestamp (increment in the low word, seconds
    /// in the high word), kept as the orderable u64.
    Timestamp(u64),
    Other { kind: u8, payload: &'a [u8] },
}

impl<'a> RawField<'a> {
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            RawField::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RawField::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            RawField::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawField::Int64(v) => Some(*v),
            // Headers written by older tool versions carry small counters
            // as int32; widen transparently.
            RawField::Int32(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<u64> {
        match self {
            RawField::Timestamp(v) => Some(*v),
            _ => None,
        }
    }
}

fn bad(reason: impl Into<String>) -> FramingError {
    FramingError::BadElement {
        reason: reason.into(),
    }
}

fn read_i32(bytes: &[u8], at: usize) -> FramingResult<i32> {
    let end = at.checked_add(4).filter(|&e| e <= bytes.len());
    match end {
        Some(e) => Ok(i32::from_le_bytes(bytes[at..e].try_into().unwrap())),
        None => Err(bad("i32 payload runs past document end")),
    }
}

fn cstring_end(bytes: &[u8], from: usize) -> FramingResult<usize> {
    bytes[from..]
        .iter()
        .position(|&b| b == 0)
        .map(|nul| from + nul + 1)
        .ok_or_else(|| bad("unterminated cstring"))
}

/// Iterator over the elements of one framed document.
pub struct Fields<'a> {
    body: &'a [u8],
    pos: usize,
    failed: bool,
}

/// Walk the elements of a framed document. The document's outer framing
/// is validated up front; element extents are validated as the iterator
/// advances.
pub fn fields(doc: &[u8]) -> FramingResult<Fields<'_>> {
    crate::docio::validate_doc(doc)?;
    Ok(Fields {
        // Strip the length prefix and the trailing zero.
        body: &doc[4..doc.len() - 1],
        pos: 0,
        failed: false,
    })
}

/// Find one top-level element by name. `Ok(None)` if absent.
pub fn find_field<'a>(doc: &'a [u8], name: &str) -> FramingResult<Option<RawField<'a>>> {
    for item in fields(doc)? {
        let (field_name, value) = item?;
        if field_name == name {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

impl<'a> Fields<'a> {
    /// Payload length for an element of `kind` starting at `at`.
    fn payload_len(&self, kind: u8, at: usize) -> FramingResult<usize> {
        let body = self.body;
        match kind {
            T_DOUBLE | T_DATETIME | T_TIMESTAMP | T_INT64 => Ok(8),
            T_STRING | T_CODE | T_SYMBOL => {
                let len = read_i32(body, at)?;
                if len < 1 {
                    return Err(bad(format!("string length {len} below minimum")));
                }
                Ok(4 + len as usize)
            }
            T_DOCUMENT | T_ARRAY => {
                let len = read_i32(body, at)?;
                if len < 5 {
                    return Err(bad(format!("embedded document length {len} below minimum")));
                }
                Ok(len as usize)
            }
            T_BINARY => {
                let len = read_i32(body, at)?;
                if len < 0 {
                    return Err(bad("negative binary length"));
                }
                Ok(4 + 1 + len as usize)
            }
            T_CODE_W_SCOPE => {
                let len = read_i32(body, at)?;
                if len < 4 {
                    return Err(bad(format!("code-with-scope length {len} below minimum")));
                }
                Ok(len as usize)
            }
            T_OBJECTID => Ok(12),
            T_BOOL => Ok(1),
            T_INT32 => Ok(4),
            T_DECIMAL128 => Ok(16),
            T_UNDEFINED | T_NULL | T_MINKEY | T_MAXKEY => Ok(0),
            T_REGEX => {
                let pattern_end = cstring_end(body, at)?;
                let options_end = cstring_end(body, pattern_end)?;
                Ok(options_end - at)
            }
            T_DBPOINTER => {
                let len = read_i32(body, at)?;
                if len < 1 {
                    return Err(bad("dbpointer string length below minimum"));
                }
                Ok(4 + len as usize + 12)
            }
            other => Err(bad(format!("unknown element type {other:#04x}"))),
        }
    }

    fn decode(&self, kind: u8, payload: &'a [u8]) -> FramingResult<RawField<'a>> {
        let value = match kind {
            T_STRING => {
                // Payload: i32 length (including trailing nul), bytes, nul.
                let text = &payload[4..payload.len() - 1];
                if payload[payload.len() - 1] != 0 {
                    return Err(bad("string payload missing trailing nul"));
                }
                RawField::String(
                    std::str::from_utf8(text).map_err(|_| bad("string payload is not UTF-8"))?,
                )
            }
            T_BOOL => match payload[0] {
                0 => RawField::Bool(false),
                1 => RawField::Bool(true),
                other => return Err(bad(format!("boolean byte {other:#04x}"))),
            },
            T_INT32 => RawField::Int32(i32::from_le_bytes(payload.try_into().unwrap())),
            T_INT64 => RawField::Int64(i64::from_le_bytes(payload.try_into().unwrap())),
            T_TIMESTAMP => RawField::Timestamp(u64::from_le_bytes(payload.try_into().unwrap())),
            other => RawField::Other {
                kind: other,
                payload,
            },
        };
        Ok(value)
    }
}

impl<'a> Iterator for Fields<'a> {
    type Item = FramingResult<(&'a str, RawField<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.body.len() {
            return None;
        }
        let mut step = || -> FramingResult<(&'a str, RawField<'a>)> {
            let kind = self.body[self.pos];
            let name_end = cstring_end(self.body, self.pos + 1)?;
            let name = std::str::from_utf8(&self.body[self.pos + 1..name_end - 1])
                .map_err(|_| bad("element name is not UTF-8"))?;
            let len = self.payload_len(kind, name_end)?;
            let payload_end = name_end
                .checked_add(len)
                .filter(|&e| e <= self.body.len())
                .ok_or_else(|| bad(format!("element '{name}' runs past document end")))?;
            let payload = &self.body[name_end..payload_end];
            self.pos = payload_end;
            Ok((name, self.decode(kind, payload)?))
        };
        match step() {
            Ok(item) => Some(Ok(item)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Builder for flat documents of string/bool/i32/i64 elements, the only
/// shapes this tool ever writes (archive headers).
#[derive(Debug)]
pub struct DocBuilder {
    buf: Vec<u8>,
}

impl Default for DocBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DocBuilder {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; 4], // length patched in finish()
        }
    }

    fn append_name(&mut self, kind: u8, name: &str) {
        debug_assert!(!name.as_bytes().contains(&0), "element name contains nul");
        self.buf.push(kind);
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(0);
    }

    pub fn append_str(&mut self, name: &str, value: &str) -> &mut Self {
        self.append_name(T_STRING, name);
        self.buf
            .extend_from_slice(&((value.len() + 1) as i32).to_le_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn append_bool(&mut self, name: &str, value: bool) -> &mut Self {
        self.append_name(T_BOOL, name);
        self.buf.push(u8::from(value));
        self
    }

    pub fn append_i32(&mut self, name: &str, value: i32) -> &mut Self {
        self.append_name(T_INT32, name);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn append_i64(&mut self, name: &str, value: i64) -> &mut Self {
        self.append_name(T_INT64, name);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Terminate and length-patch the document.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(0);
        let len = self.buf.len() as i32;
        self.buf[..4].copy_from_slice(&len.to_le_bytes());
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_walk_flat_doc() {
        let mut b = DocBuilder::new();
        b.append_str("db", "sales")
            .append_bool("EOF", false)
            .append_i32("count", 42)
            .append_i64("crc", -7);
        let doc = b.finish();
        crate::docio::validate_doc(&doc).unwrap();

        let items: Vec<_> = fields(&doc).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0], ("db", RawField::String("sales")));
        assert_eq!(items[1], ("EOF", RawField::Bool(false)));
        assert_eq!(items[2], ("count", RawField::Int32(42)));
        assert_eq!(items[3], ("crc", RawField::Int64(-7)));
    }

    #[test]
    fn test_find_field() {
        let mut b = DocBuilder::new();
        b.append_str("collection", "users").append_bool("EOF", true);
        let doc = b.finish();

        let value = find_field(&doc, "EOF").unwrap().unwrap();
        assert_eq!(value.as_bool(), Some(true));
        assert!(find_field(&doc, "missing").unwrap().is_none());
    }

    #[test]
    fn test_skips_unread_types() {
        // Hand-assemble a doc with a double ("d") followed by an i32 ("n");
        // the walker must skip the double by size and still find "n".
        let mut body = Vec::new();
        body.push(T_DOUBLE);
        body.extend_from_slice(b"d\0");
        body.extend_from_slice(&1.5f64.to_le_bytes());
        body.push(T_INT32);
        body.extend_from_slice(b"n\0");
        body.extend_from_slice(&9i32.to_le_bytes());

        let mut doc = Vec::new();
        doc.extend_from_slice(&((body.len() + 5) as i32).to_le_bytes());
        doc.extend_from_slice(&body);
        doc.push(0);

        let value = find_field(&doc, "n").unwrap().unwrap();
        assert_eq!(value.as_i32(), Some(9));
        assert!(matches!(
            find_field(&doc, "d").unwrap().unwrap(),
            RawField::Other { kind: T_DOUBLE, .. }
        ));
    }

    #[test]
    fn test_timestamp_extraction() {
        let ts: u64 = (1700_000_000u64 << 32) | 3;
        let mut body = Vec::new();
        body.push(T_TIMESTAMP);
        body.extend_from_slice(b"ts\0");
        body.extend_from_slice(&ts.to_le_bytes());

        let mut doc = Vec::new();
        doc.extend_from_slice(&((body.len() + 5) as i32).to_le_bytes());
        doc.extend_from_slice(&body);
        doc.push(0);

        let value = find_field(&doc, "ts").unwrap().unwrap();
        assert_eq!(value.as_timestamp(), Some(ts));
    }

    #[test]
    fn test_element_running_past_end_is_bad() {
        // Claim a string longer than the document.
        let mut body = Vec::new();
        body.push(T_STRING);
        body.extend_from_slice(b"s\0");
        body.extend_from_slice(&100i32.to_le_bytes());
        body.extend_from_slice(b"hi\0");

        let mut doc = Vec::new();
        doc.extend_from_slice(&((body.len() + 5) as i32).to_le_bytes());
        doc.extend_from_slice(&body);
        doc.push(0);

        let err = find_field(&doc, "s").unwrap_err();
        assert!(matches!(err, FramingError::BadElement { .. }));
    }
}
