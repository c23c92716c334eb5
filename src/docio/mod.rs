//! Raw document framing
//!
//! Documents cross every boundary in this tool as opaque length-prefixed
//! byte slices: a 4-byte little-endian i32 total length, a body, and a
//! trailing zero byte. This module turns a byte stream into a sequence of
//! complete documents and back, and is careful about the one distinction
//! that matters everywhere downstream: a stream that ends exactly on a
//! document boundary is a clean end (`Ok(None)`), a stream that ends
//! mid-prefix or mid-body is corruption (`FramingError::Truncated`).
//!
//! Reads go through a fixed scratch buffer sized to [`MAX_DOC_SIZE`];
//! returned slices are invalidated by the next read, so callers that
//! retain bytes must copy them out.

pub mod fields;

use crate::error::{FramingError, FramingResult};
use std::io::{ErrorKind, Read};

/// Maximum size of a single document, shared by the framer and the
/// archive parser. Any declared length above this is corruption.
pub const MAX_DOC_SIZE: i32 = 16 * 1024 * 1024;

/// Minimum size of a single document: 4-byte length prefix plus the
/// trailing zero byte of an empty document.
pub const MIN_DOC_SIZE: i32 = 5;

/// Read a 4-byte little-endian length prefix.
///
/// Returns `Ok(None)` if the stream is at clean end-of-input (zero bytes
/// read). A partial prefix (1-3 bytes) is reported as truncation with
/// `declared: 4`.
pub fn read_length_prefix<R: Read>(source: &mut R) -> FramingResult<Option<[u8; 4]>> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        match source.read(&mut prefix[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(FramingError::Truncated {
                    declared: 4,
                    read: filled,
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(prefix))
}

/// Load the next complete document into `buf`.
///
/// Returns `Ok(None)` at clean end-of-input, `Ok(Some(size))` with the
/// total document size on success (the document occupies `buf[..size]`).
/// A declared length below [`MIN_DOC_SIZE`], above [`MAX_DOC_SIZE`], or
/// larger than `buf` fails with `InvalidSize`; a short body fails with
/// `Truncated`. The document is delivered all-or-nothing: on error the
/// buffer contents are unspecified.
pub fn load_doc<R: Read>(source: &mut R, buf: &mut [u8]) -> FramingResult<Option<usize>> {
    let Some(prefix) = read_length_prefix(source)? else {
        return Ok(None);
    };
    Ok(Some(load_doc_body(source, prefix, buf)?))
}

/// Load a document whose 4-byte length prefix has already been consumed
/// (the archive parser reads the prefix itself to detect terminators).
pub fn load_doc_body<R: Read>(
    source: &mut R,
    prefix: [u8; 4],
    buf: &mut [u8],
) -> FramingResult<usize> {
    let declared = i32::from_le_bytes(prefix);
    if declared < MIN_DOC_SIZE || declared > MAX_DOC_SIZE || declared as usize > buf.len() {
        return Err(FramingError::InvalidSize {
            size: declared,
            min: MIN_DOC_SIZE,
            max: MAX_DOC_SIZE.min(buf.len() as i32),
        });
    }
    let size = declared as usize;
    buf[..4].copy_from_slice(&prefix);

    let mut filled = 4;
    while filled < size {
        match source.read(&mut buf[filled..size]) {
            Ok(0) => {
                return Err(FramingError::Truncated {
                    declared,
                    read: filled,
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(size)
}

/// Check the raw-document invariant on an already-loaded slice: the
/// length prefix matches the slice length, the size is within bounds, and
/// the final byte is zero. This is the `--validate` (objcheck) path.
pub fn validate_doc(doc: &[u8]) -> FramingResult<()> {
    if doc.len() < MIN_DOC_SIZE as usize {
        return Err(FramingError::InvalidSize {
            size: doc.len() as i32,
            min: MIN_DOC_SIZE,
            max: MAX_DOC_SIZE,
        });
    }
    let declared = i32::from_le_bytes([doc[0], doc[1], doc[2], doc[3]]);
    if declared != doc.len() as i32 || declared > MAX_DOC_SIZE {
        return Err(FramingError::InvalidSize {
            size: declared,
            min: MIN_DOC_SIZE,
            max: MAX_DOC_SIZE,
        });
    }
    let last = doc[doc.len() - 1];
    if last != 0 {
        return Err(FramingError::Unterminated { found: last });
    }
    Ok(())
}

/// Streaming document source with uniform loop semantics.
///
/// `next()` returns `None` both at clean end-of-input and on any framing
/// error, so callers can loop without distinguishing the two mid-loop:
///
/// ```ignore
/// let mut source = DocSource::new(reader);
/// while let Some(doc) = source.next() {
///     // doc is valid until the next call
/// }
/// if let Some(err) = source.error() { /* post-loop inspection */ }
/// ```
pub struct DocSource<R> {
    source: R,
    buf: Box<[u8]>,
    err: Option<FramingError>,
}

impl<R: Read> DocSource<R> {
    /// Create a source with a scratch buffer sized to [`MAX_DOC_SIZE`].
    pub fn new(source: R) -> Self {
        Self {
            source,
            buf: vec![0u8; MAX_DOC_SIZE as usize].into_boxed_slice(),
            err: None,
        }
    }

    /// Load the next document. The returned slice borrows the internal
    /// scratch buffer and is invalidated by the next call.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&[u8]> {
        if self.err.is_some() {
            return None;
        }
        match load_doc(&mut self.source, &mut self.buf) {
            Ok(Some(size)) => Some(&self.buf[..size]),
            Ok(None) => None,
            Err(e) => {
                self.err = Some(e);
                None
            }
        }
    }

    /// The error that ended the loop, if it was not a clean end.
    pub fn error(&self) -> Option<&FramingError> {
        self.err.as_ref()
    }

    /// Consume the source, yielding the error if one occurred.
    pub fn into_error(self) -> Option<FramingError> {
        self.err
    }
}
