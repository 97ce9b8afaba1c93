//! batched-io: read a file through the engine and report throughput
//!
//! Splits the file into `chunk_size` requests, pushes them through the engine
//! with `read_ranges`, and logs bytes per second for each pass. With
//! `--verify` the data is compared against a plain `std::fs::read`.
//!
//! Configuration via CLI arguments or TOML file.

use batched_io::config::Config;
use batched_io::{Engine, Outcome, Output};
use std::fs::File;
use std::ops::Range;
use std::os::unix::io::AsRawFd;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let file = File::open(&config.file)?;
    let file_len = file.metadata()?.len();

    info!(
        file = %config.file.display(),
        file_len,
        backend = ?config.engine.backend,
        ring_depth = config.engine.ring_depth,
        buffer_count = config.engine.buffer_count,
        buffer_size = config.engine.buffer_size,
        chunk_size = config.chunk_size,
        passes = config.passes,
        "Starting batched-io benchmark"
    );

    let ranges = chunk(file_len, config.chunk_size as u64);
    let expected = if config.verify {
        Some(std::fs::read(&config.file)?)
    } else {
        None
    };

    let engine = Engine::new(config.engine.clone())?;

    for pass in 1..=config.passes {
        let start = Instant::now();
        let outcomes = engine.read_ranges(file.as_raw_fd(), &ranges)?;
        let elapsed = start.elapsed();

        let mut bytes = 0u64;
        let mut failures = 0usize;
        let mut mismatches = 0usize;
        for (range, outcome) in ranges.iter().zip(outcomes) {
            match outcome {
                Outcome::Completed(Output::Read(data)) => {
                    bytes += data.len() as u64;
                    if let Some(expected) = &expected {
                        if data != &expected[range.start as usize..range.end as usize] {
                            mismatches += 1;
                        }
                    }
                }
                Outcome::Completed(Output::Written(_)) => {}
                Outcome::Failed(kind) => {
                    warn!(offset = range.start, error = %kind, "Read failed");
                    failures += 1;
                }
            }
        }

        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        info!(
            pass,
            requests = ranges.len(),
            bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            mib_per_sec = (bytes as f64 / secs / (1024.0 * 1024.0) * 10.0).round() / 10.0,
            failures,
            "Pass complete"
        );
        if mismatches > 0 {
            error!(pass, mismatches, "Data mismatch against std::fs::read");
        }
    }

    let report = engine.shutdown(config.engine.shutdown_timeout());
    let stats = report.stats;
    info!(
        submitted = stats.submitted,
        completed = stats.completed,
        failed = stats.failed,
        short_io_retries = stats.short_io_retries,
        in_flight_high_water = stats.in_flight_high_water,
        forced = report.forced,
        "Engine stopped"
    );

    Ok(())
}

/// Split `[0, len)` into consecutive ranges of at most `chunk` bytes.
fn chunk(len: u64, chunk: u64) -> Vec<Range<u64>> {
    (0..len)
        .step_by(chunk as usize)
        .map(|start| start..(start + chunk).min(len))
        .collect()
}
