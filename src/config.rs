//! Configuration types for docstash
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Validation of runtime bounds
//! - Stream helpers (`-` means stdin/stdout)

use crate::error::ConfigError;
use crate::intent::NsFilter;
use clap::Parser;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::PathBuf;

/// Maximum reasonable parallel job count
pub const MAX_JOBS: usize = 256;

/// Dump/restore toolchain for document databases
#[derive(Parser, Debug, Clone)]
#[command(
    name = "docstash",
    version,
    about = "Dump/restore toolchain for document databases",
    long_about = "Packs per-collection document streams into a single multiplexed archive\n\
                  and splits archives back into dump directories, verifying per-namespace\n\
                  CRC-64 checksums end to end.",
    after_help = "EXAMPLES:\n    \
        docstash pack dump/ -o backup.archive -j 8\n    \
        docstash pack dump/ | ssh backup-host 'cat > nightly.archive'\n    \
        docstash unpack backup.archive -o restored/\n    \
        docstash inspect backup.archive\n    \
        docstash verify - < backup.archive"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output (debug-level logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Subcommands
#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Pack a dump directory into an archive stream
    Pack {
        /// Dump directory to pack
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Output archive file, or '-' for standard output
        #[arg(short = 'o', long, default_value = "-", value_name = "FILE")]
        output: String,

        /// Number of parallel producers
        #[arg(short = 'j', long, default_value = "4", value_name = "NUM")]
        jobs: usize,

        /// Only this database
        #[arg(long, value_name = "DB")]
        db: Option<String>,

        /// Only this collection (requires --db)
        #[arg(long, value_name = "COLL", requires = "db")]
        collection: Option<String>,
    },

    /// Split an archive stream back into a dump directory
    Unpack {
        /// Input archive file, or '-' for standard input
        #[arg(value_name = "ARCHIVE")]
        archive: String,

        /// Output dump directory
        #[arg(short = 'o', long, value_name = "DIR")]
        output: PathBuf,

        /// Tolerate checksum mismatches (log instead of failing)
        #[arg(long)]
        lax_checksums: bool,

        /// Check the framing invariant on every document
        #[arg(long)]
        validate: bool,

        /// Only this database
        #[arg(long, value_name = "DB")]
        db: Option<String>,

        /// Only this collection (requires --db)
        #[arg(long, value_name = "COLL", requires = "db")]
        collection: Option<String>,
    },

    /// List an archive's namespaces, counts, and checksum status
    Inspect {
        /// Input archive file, or '-' for standard input
        #[arg(value_name = "ARCHIVE")]
        archive: String,
    },

    /// Read an archive end to end, failing on any corruption
    Verify {
        /// Input archive file, or '-' for standard input
        #[arg(value_name = "ARCHIVE")]
        archive: String,
    },
}

/// Bounds-check a job count.
pub fn validate_jobs(jobs: usize) -> Result<usize, ConfigError> {
    if jobs == 0 || jobs > MAX_JOBS {
        return Err(ConfigError::InvalidJobs {
            count: jobs,
            max: MAX_JOBS,
        });
    }
    Ok(jobs)
}

/// Build a namespace filter from CLI flags.
pub fn ns_filter(db: Option<String>, collection: Option<String>) -> NsFilter {
    NsFilter {
        db,
        coll: collection,
    }
}

/// Open an input stream; `-` is standard input.
pub fn open_input(path: &str) -> io::Result<Box<dyn Read>> {
    if path == "-" {
        Ok(Box::new(io::stdin().lock()))
    } else {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }
}

/// Open an output stream; `-` is standard output.
pub fn open_output(path: &str) -> io::Result<Box<dyn Write + Send>> {
    if path == "-" {
        Ok(Box::new(io::stdout()))
    } else {
        Ok(Box::new(File::create(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Namespace;

    #[test]
    fn test_validate_jobs() {
        assert_eq!(validate_jobs(1).unwrap(), 1);
        assert_eq!(validate_jobs(64).unwrap(), 64);
        assert!(validate_jobs(0).is_err());
        assert!(validate_jobs(MAX_JOBS + 1).is_err());
    }

    #[test]
    fn test_ns_filter_from_flags() {
        let filter = ns_filter(Some("sales".into()), None);
        assert!(filter.matches(&Namespace::new("sales", "anything")));
        assert!(!filter.matches(&Namespace::new("hr", "anything")));
    }

    #[test]
    fn test_cli_parses_pack() {
        let args =
            CliArgs::try_parse_from(["docstash", "pack", "dump", "-o", "out.archive", "-j", "8"])
                .unwrap();
        match args.command {
            Command::Pack { jobs, output, .. } => {
                assert_eq!(jobs, 8);
                assert_eq!(output, "out.archive");
            }
            other => panic!("parsed wrong command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_collection_requires_db() {
        let result = CliArgs::try_parse_from([
            "docstash", "unpack", "a.archive", "-o", "out", "--collection", "orders",
        ]);
        assert!(result.is_err());
    }
}
