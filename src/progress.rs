//! Progress reporting
//!
//! Workers feed atomic counters; an optional indicatif spinner renders
//! them. The engine only ever *pushes* byte/doc counts - rendering is
//! fully detachable, so library users can ignore this module entirely.

use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Shared counters updated by workers.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    docs: AtomicU64,
    bytes: AtomicU64,
    namespaces: AtomicU64,
}

impl ProgressTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_docs(&self, n: u64) {
        self.docs.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_namespace(&self) {
        self.namespaces.fetch_add(1, Ordering::Relaxed);
    }

    pub fn docs(&self) -> u64 {
        self.docs.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn namespaces(&self) -> u64 {
        self.namespaces.load(Ordering::Relaxed)
    }
}

/// Spinner that renders a [`ProgressTracker`] until finished.
pub struct ProgressReporter {
    bar: ProgressBar,
    stop: Arc<AtomicBool>,
    ticker: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// Start rendering `tracker`. `verb` is the leading word, e.g.
    /// "Packing".
    pub fn new(tracker: Arc<ProgressTracker>, verb: &'static str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));

        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let bar_clone = bar.clone();
        let ticker = thread::Builder::new()
            .name("progress".into())
            .spawn(move || {
                while !stop_clone.load(Ordering::Relaxed) {
                    bar_clone.set_message(format!(
                        "{} | Namespaces: {} | Docs: {} | Size: {}",
                        verb,
                        tracker.namespaces(),
                        format_number(tracker.docs()),
                        format_size(tracker.bytes(), BINARY),
                    ));
                    thread::sleep(Duration::from_millis(200));
                }
            })
            .ok();

        Self { bar, stop, ticker }
    }

    /// Stop the ticker and leave a final message.
    pub fn finish(mut self, message: &str) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
        self.bar.finish_with_message(message.to_string());
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a styled run header.
pub fn print_header(operation: &str, source: &str, target: &str, jobs: usize) {
    println!();
    println!(
        "{} {}",
        style("docstash").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Operation:").bold(), operation);
    println!("  {} {}", style("Source:").bold(), source);
    println!("  {} {}", style("Target:").bold(), target);
    println!("  {} {}", style("Jobs:").bold(), jobs);
    println!();
}

/// Print a styled run summary.
pub fn print_summary(
    operation: &str,
    namespaces: u64,
    docs: u64,
    bytes: u64,
    duration: Duration,
) {
    let duration_secs = duration.as_secs_f64();
    let rate = if duration_secs > 0.0 {
        docs as f64 / duration_secs
    } else {
        0.0
    };

    println!();
    println!("{}", style(format!("{operation} Complete")).green().bold());
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {}",
        style("Namespaces:").bold(),
        format_number(namespaces)
    );
    println!("  {} {}", style("Documents:").bold(), format_number(docs));
    println!(
        "  {} {}",
        style("Total Size:").bold(),
        format_size(bytes, BINARY)
    );
    println!(
        "  {} {:.1}s ({:.0} docs/sec)",
        style("Duration:").bold(),
        duration_secs,
        rate
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567890), "1,234,567,890");
    }

    #[test]
    fn test_tracker_accumulates() {
        let tracker = ProgressTracker::new();
        tracker.add_docs(10);
        tracker.add_docs(5);
        tracker.add_bytes(4096);
        tracker.add_namespace();
        assert_eq!(tracker.docs(), 15);
        assert_eq!(tracker.bytes(), 4096);
        assert_eq!(tracker.namespaces(), 1);
    }
}
