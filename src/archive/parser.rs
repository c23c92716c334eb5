//! Archive block parser
//!
//! Drives a byte source through the block grammar
//! `(header body* terminator)*`, dispatching each document to a
//! [`BlockConsumer`] without interpreting the bytes. All reads go through
//! one scratch buffer sized to the maximum document; consumers that keep
//! bytes past the callback must copy them out.
//!
//! Corruption taxonomy:
//! - a terminator where a header was expected (including two terminators
//!   in a row) is corruption, not an empty block;
//! - clean end-of-input is only valid where a new header would start;
//!   ending inside a block is corruption;
//! - every document must be within size bounds and zero-terminated.

use crate::archive::TERMINATOR_BYTES;
use crate::docio::{self, MAX_DOC_SIZE};
use crate::error::{ArchiveError, ArchiveResult, FramingError};
use std::io::Read;
use tracing::trace;

/// Receives the documents of each block as the parser encounters them.
pub trait BlockConsumer {
    /// Called with the block's namespace header document.
    fn header(&mut self, doc: &[u8]) -> ArchiveResult<()>;

    /// Called with each body document in the block, in stream order.
    fn body(&mut self, doc: &[u8]) -> ArchiveResult<()>;

    /// Called exactly once by [`BlockParser::read_all_blocks`] after the
    /// last block, whether or not parsing failed.
    fn end(&mut self) -> ArchiveResult<()>;
}

/// What one `read_block` call found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// A complete `header body* terminator` block was dispatched.
    Block,

    /// Clean end-of-input where a new block would have started.
    EndOfStream,
}

/// Pull-parser for the block grammar over any byte source.
pub struct BlockParser<R> {
    source: R,
    buf: Box<[u8]>,
}

impl<R: Read> BlockParser<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            buf: vec![0u8; MAX_DOC_SIZE as usize].into_boxed_slice(),
        }
    }

    /// Read the remainder of one document whose prefix is already in
    /// hand, enforcing bounds and the trailing zero byte.
    fn read_framed(&mut self, prefix: [u8; 4]) -> ArchiveResult<usize> {
        let size = docio::load_doc_body(&mut self.source, prefix, &mut self.buf)?;
        let last = self.buf[size - 1];
        if last != 0 {
            return Err(FramingError::Unterminated { found: last }.into());
        }
        Ok(size)
    }

    /// Read exactly one block, dispatching its documents to `consumer`.
    pub fn read_block(&mut self, consumer: &mut dyn BlockConsumer) -> ArchiveResult<BlockOutcome> {
        let Some(prefix) = docio::read_length_prefix(&mut self.source)? else {
            return Ok(BlockOutcome::EndOfStream);
        };
        if prefix == TERMINATOR_BYTES {
            return Err(ArchiveError::corrupt(
                "terminator where a namespace header was expected",
            ));
        }
        let size = self.read_framed(prefix)?;
        trace!(bytes = size, "block header");
        consumer.header(&self.buf[..size])?;

        loop {
            let Some(prefix) = docio::read_length_prefix(&mut self.source)? else {
                return Err(ArchiveError::corrupt(
                    "stream ended inside a block: no terminator",
                ));
            };
            if prefix == TERMINATOR_BYTES {
                return Ok(BlockOutcome::Block);
            }
            let size = self.read_framed(prefix)?;
            consumer.body(&self.buf[..size])?;
        }
    }

    /// Read blocks until clean end-of-input. `consumer.end()` is invoked
    /// exactly once afterwards; if both a block and `end()` fail, the
    /// block error wins.
    pub fn read_all_blocks(&mut self, consumer: &mut dyn BlockConsumer) -> ArchiveResult<()> {
        let block_err = loop {
            match self.read_block(consumer) {
                Ok(BlockOutcome::Block) => continue,
                Ok(BlockOutcome::EndOfStream) => break None,
                Err(e) => break Some(e),
            }
        };
        let end_result = consumer.end();
        match block_err {
            Some(e) => Err(e),
            None => end_result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Records every callback for assertions.
    #[derive(Default)]
    struct Recorder {
        headers: Vec<Vec<u8>>,
        bodies: Vec<Vec<u8>>,
        ended: usize,
    }

    impl BlockConsumer for Recorder {
        fn header(&mut self, doc: &[u8]) -> ArchiveResult<()> {
            self.headers.push(doc.to_vec());
            Ok(())
        }

        fn body(&mut self, doc: &[u8]) -> ArchiveResult<()> {
            self.bodies.push(doc.to_vec());
            Ok(())
        }

        fn end(&mut self) -> ArchiveResult<()> {
            self.ended += 1;
            Ok(())
        }
    }

    fn doc(size: usize) -> Vec<u8> {
        let mut d = vec![0u8; size];
        d[..4].copy_from_slice(&(size as i32).to_le_bytes());
        d
    }

    fn stream(blocks: &[(&[u8], Vec<Vec<u8>>)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (header, bodies) in blocks {
            out.extend_from_slice(header);
            for body in bodies {
                out.extend_from_slice(body);
            }
            out.extend_from_slice(&TERMINATOR_BYTES);
        }
        out
    }

    #[test]
    fn test_two_blocks_dispatch_in_order() {
        let h1 = doc(8);
        let h2 = doc(9);
        let bytes = stream(&[
            (&h1[..], vec![doc(16), doc(24)]),
            (&h2[..], vec![doc(5)]),
        ]);
        let mut rec = Recorder::default();
        BlockParser::new(Cursor::new(bytes))
            .read_all_blocks(&mut rec)
            .unwrap();
        assert_eq!(rec.headers, vec![h1, h2]);
        assert_eq!(rec.bodies.len(), 3);
        assert_eq!(rec.bodies[2], doc(5));
        assert_eq!(rec.ended, 1);
    }

    #[test]
    fn test_empty_stream_is_clean_end() {
        let mut rec = Recorder::default();
        BlockParser::new(Cursor::new(Vec::new()))
            .read_all_blocks(&mut rec)
            .unwrap();
        assert_eq!(rec.ended, 1);
        assert!(rec.headers.is_empty());
    }

    #[test]
    fn test_leading_terminator_is_corruption() {
        let mut rec = Recorder::default();
        let err = BlockParser::new(Cursor::new(TERMINATOR_BYTES.to_vec()))
            .read_all_blocks(&mut rec)
            .unwrap_err();
        assert!(err.to_string().contains("terminator where a namespace header"));
        // end() still ran exactly once.
        assert_eq!(rec.ended, 1);
    }

    #[test]
    fn test_doubled_terminator_is_corruption() {
        let h = doc(8);
        let mut bytes = stream(&[(&h[..], vec![])]);
        bytes.extend_from_slice(&TERMINATOR_BYTES);
        let mut rec = Recorder::default();
        let err = BlockParser::new(Cursor::new(bytes))
            .read_all_blocks(&mut rec)
            .unwrap_err();
        assert!(err.to_string().contains("terminator where a namespace header"));
    }

    #[test]
    fn test_stream_ending_inside_block_is_corruption() {
        let h = doc(8);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&h);
        bytes.extend_from_slice(&doc(12));
        // No terminator follows.
        let mut rec = Recorder::default();
        let err = BlockParser::new(Cursor::new(bytes))
            .read_all_blocks(&mut rec)
            .unwrap_err();
        assert!(err.to_string().contains("no terminator"));
    }

    #[test]
    fn test_truncated_body_is_framing_error() {
        let h = doc(8);
        let mut body = doc(64);
        body.truncate(20);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&h);
        bytes.extend_from_slice(&body);
        let mut rec = Recorder::default();
        let err = BlockParser::new(Cursor::new(bytes))
            .read_all_blocks(&mut rec)
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Framing(FramingError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unterminated_document_detected() {
        let mut h = doc(8);
        h[7] = 0x7F;
        let mut rec = Recorder::default();
        let err = BlockParser::new(Cursor::new(h))
            .read_all_blocks(&mut rec)
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Framing(FramingError::Unterminated { found: 0x7F })
        ));
    }

    #[test]
    fn test_undersized_length_detected() {
        let bytes = vec![3, 0, 0, 0];
        let mut rec = Recorder::default();
        let err = BlockParser::new(Cursor::new(bytes))
            .read_all_blocks(&mut rec)
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Framing(FramingError::InvalidSize { size: 3, .. })
        ));
    }
}
