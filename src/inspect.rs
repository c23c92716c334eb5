//! Archive inspection and verification
//!
//! A full read of the archive through the demultiplexer with discard
//! sinks: every byte is parsed, every checksum recomputed, nothing
//! written. `inspect` renders the result; `verify` only cares whether the
//! read succeeded under the strict policy.

use crate::archive::demux::{DiscardSink, NamespaceStats};
use crate::archive::{read_archive, ArchiveHeader, ChecksumPolicy, Demultiplexer, DemuxSink};
use crate::error::Result;
use crate::intent::Namespace;
use crate::progress::format_number;
use console::style;
use humansize::{format_size, BINARY};
use std::io::Read;

/// Everything a full pass over an archive learns.
#[derive(Debug)]
pub struct ArchiveReport {
    pub header: ArchiveHeader,
    pub namespaces: Vec<(Namespace, NamespaceStats)>,
    pub mismatches: u64,
}

impl ArchiveReport {
    pub fn total_docs(&self) -> u64 {
        self.namespaces.iter().map(|(_, s)| s.docs).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.namespaces.iter().map(|(_, s)| s.bytes).sum()
    }
}

/// Read an archive end to end, discarding the data.
pub fn scan_archive<R: Read>(source: &mut R, policy: ChecksumPolicy) -> Result<ArchiveReport> {
    let mut demux = Demultiplexer::new(
        policy,
        Box::new(|_| Ok(Box::new(DiscardSink) as Box<dyn DemuxSink>)),
    );
    let header = read_archive(source, &mut demux)?;
    Ok(ArchiveReport {
        header,
        namespaces: demux.finished().to_vec(),
        mismatches: demux.mismatches(),
    })
}

/// Render a report for `inspect`.
pub fn print_report(report: &ArchiveReport) {
    println!();
    println!(
        "{} format {} | server {} | tool {} | {} concurrent",
        style("archive").cyan().bold(),
        report.header.version,
        report.header.server_version,
        report.header.tool_version,
        report.header.concurrent_collections,
    );
    println!("{}", style("─".repeat(66)).dim());
    println!(
        "  {:<32} {:>12} {:>10}  {}",
        style("NAMESPACE").bold(),
        style("DOCS").bold(),
        style("SIZE").bold(),
        style("CRC").bold(),
    );
    for (ns, stats) in &report.namespaces {
        let crc = if stats.crc_ok() {
            style("ok").green()
        } else {
            style("MISMATCH").red().bold()
        };
        println!(
            "  {:<32} {:>12} {:>10}  {}",
            ns.to_string(),
            format_number(stats.docs),
            format_size(stats.bytes, BINARY),
            crc,
        );
    }
    println!("{}", style("─".repeat(66)).dim());
    println!(
        "  {} namespaces, {} documents, {}",
        report.namespaces.len(),
        format_number(report.total_docs()),
        format_size(report.total_bytes(), BINARY),
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::checksum::crc64;
    use crate::archive::{ArchiveHeader, NamespaceHeader, TERMINATOR_BYTES};
    use std::io::Cursor;

    fn doc(fill: u8, size: usize) -> Vec<u8> {
        let mut d = vec![fill; size];
        d[..4].copy_from_slice(&(size as i32).to_le_bytes());
        d[size - 1] = 0;
        d
    }

    fn archive_with_one_ns(crc: Option<u64>) -> Vec<u8> {
        let ns = Namespace::new("db", "coll");
        let body = doc(1, 40);
        let mut out = ArchiveHeader::new("test", 1).to_doc();
        out.extend_from_slice(&NamespaceHeader::open(ns.clone()).to_doc());
        out.extend_from_slice(&body);
        out.extend_from_slice(&TERMINATOR_BYTES);
        let crc = crc.unwrap_or_else(|| crc64(&body));
        out.extend_from_slice(&NamespaceHeader::eof(ns, crc).to_doc());
        out.extend_from_slice(&TERMINATOR_BYTES);
        out
    }

    #[test]
    fn test_scan_reports_totals() {
        let report = scan_archive(
            &mut Cursor::new(archive_with_one_ns(None)),
            ChecksumPolicy::Strict,
        )
        .unwrap();
        assert_eq!(report.namespaces.len(), 1);
        assert_eq!(report.total_docs(), 1);
        assert_eq!(report.total_bytes(), 40);
        assert_eq!(report.mismatches, 0);
    }

    #[test]
    fn test_scan_strict_fails_on_bad_crc() {
        let err = scan_archive(
            &mut Cursor::new(archive_with_one_ns(Some(0xBAD))),
            ChecksumPolicy::Strict,
        )
        .unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_scan_warn_counts_bad_crc() {
        let report = scan_archive(
            &mut Cursor::new(archive_with_one_ns(Some(0xBAD))),
            ChecksumPolicy::Warn,
        )
        .unwrap();
        assert_eq!(report.mismatches, 1);
    }
}
