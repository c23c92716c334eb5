//! docstash - dump/restore toolchain for document databases
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use docstash::archive::ChecksumPolicy;
use docstash::config::{self, CliArgs, Command};
use docstash::dump::{pack_directory, PackOptions};
use docstash::inspect::{print_report, scan_archive};
use docstash::progress::{print_header, print_summary, ProgressReporter, ProgressTracker};
use docstash::restore::{unpack_archive, RestoreOptions};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();
    setup_logging(args.verbose)?;

    match args.command.clone() {
        Command::Pack {
            dir,
            output,
            jobs,
            db,
            collection,
        } => {
            let jobs = config::validate_jobs(jobs).context("Invalid --jobs")?;
            let options = PackOptions {
                jobs,
                filter: config::ns_filter(db, collection),
                interrupt: interrupt_flag()?,
            };
            // Progress and summaries share stdout with '-' output; keep
            // the stream clean when the archive goes there.
            let show = !args.quiet && output != "-";
            if show {
                print_header("pack", &dir.display().to_string(), &output, jobs);
            }

            let out = config::open_output(&output)
                .with_context(|| format!("Cannot open output '{output}'"))?;
            let tracker = ProgressTracker::new();
            let reporter = show.then(|| ProgressReporter::new(Arc::clone(&tracker), "Packing"));

            let start = Instant::now();
            let result = pack_directory(&dir, out, &options, &tracker);
            if let Some(reporter) = reporter {
                reporter.finish(if result.is_ok() {
                    "Pack complete"
                } else {
                    "Pack failed"
                });
            }
            let summary = result.context("Pack failed")?;
            if show {
                print_summary(
                    "Pack",
                    summary.namespaces,
                    summary.docs,
                    summary.bytes,
                    start.elapsed(),
                );
            }
        }

        Command::Unpack {
            archive,
            output,
            lax_checksums,
            validate,
            db,
            collection,
        } => {
            let options = RestoreOptions {
                checksum_policy: if lax_checksums {
                    ChecksumPolicy::Warn
                } else {
                    ChecksumPolicy::Strict
                },
                validate_docs: validate,
                filter: config::ns_filter(db, collection),
                ..Default::default()
            };
            let show = !args.quiet;
            if show {
                print_header("unpack", &archive, &output.display().to_string(), 1);
            }

            let mut source = config::open_input(&archive)
                .with_context(|| format!("Cannot open archive '{archive}'"))?;
            let tracker = ProgressTracker::new();
            let reporter = show.then(|| ProgressReporter::new(Arc::clone(&tracker), "Unpacking"));

            let start = Instant::now();
            let result = unpack_archive(&mut source, &output, &options, &tracker);
            if let Some(reporter) = reporter {
                reporter.finish(if result.is_ok() {
                    "Unpack complete"
                } else {
                    "Unpack failed"
                });
            }
            let report = result.context("Unpack failed")?;
            if report.mismatches > 0 {
                eprintln!(
                    "Warning: {} namespace(s) had checksum mismatches",
                    report.mismatches
                );
            }
            if show {
                print_summary(
                    "Unpack",
                    report.namespaces.len() as u64,
                    tracker.docs(),
                    tracker.bytes(),
                    start.elapsed(),
                );
            }
        }

        Command::Inspect { archive } => {
            let mut source = config::open_input(&archive)
                .with_context(|| format!("Cannot open archive '{archive}'"))?;
            // Inspect tolerates bad checksums so it can show them.
            let report = scan_archive(&mut source, ChecksumPolicy::Warn)
                .context("Inspect failed")?;
            print_report(&report);
        }

        Command::Verify { archive } => {
            let mut source = config::open_input(&archive)
                .with_context(|| format!("Cannot open archive '{archive}'"))?;
            let report = scan_archive(&mut source, ChecksumPolicy::Strict)
                .context("Archive verification failed")?;
            if !args.quiet {
                println!(
                    "ok: {} namespaces, {} documents verified",
                    report.namespaces.len(),
                    report.total_docs(),
                );
            }
        }
    }

    Ok(())
}

/// Wire ctrl-c to a cooperative cancellation flag the workers poll.
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;
    Ok(flag)
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("docstash=debug,warn")
    } else {
        EnvFilter::new("docstash=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
