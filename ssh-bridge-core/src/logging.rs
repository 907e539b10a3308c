//! `tracing` setup for the daemon, mirroring the corpus's verbosity-count-
//! to-level mapping and stderr/file split.

use std::path::Path;

use anyhow::Context;
use tracing_subscriber::fmt::format::FmtSpan;

pub fn level_for_verbosity(verbose: u8) -> tracing::Level {
    match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

/// Initializes the global subscriber. `log_file` wins over the stderr
/// default when provided. Call once, from the daemon entry point only —
/// a second call would panic on the already-set global subscriber.
pub fn init(verbose: u8, log_file: Option<&Path>) -> anyhow::Result<()> {
    let level = level_for_verbosity(verbose);
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("creating log file at {}", path.display()))?;
            builder.with_writer(std::sync::Mutex::new(file)).init();
        }
        None => {
            builder.with_writer(std::io::stderr).init();
        }
    }
    Ok(())
}
