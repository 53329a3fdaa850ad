//! Index build progress reporting.
//!
//! The index builder reports once per batch so callers can see how far a
//! long build has got. The server logs progress through `tracing`; the CLI
//! prints a human line on **stderr** so stdout stays parseable.

use std::io::{IsTerminal, Write};

use tracing::info;

/// A single progress event for an index build.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexProgressEvent {
    /// A batch was embedded and written. `inserted` counts segments so far.
    Batch {
        collection: String,
        batch: usize,
        inserted: usize,
        total: usize,
    },
    /// The build finished and the collection is searchable.
    Done { collection: String, segments: usize },
}

pub trait IndexProgress: Send + Sync {
    fn report(&self, event: IndexProgressEvent);
}

/// Structured progress through `tracing` at `info`.
pub struct LogProgress;

impl IndexProgress for LogProgress {
    fn report(&self, event: IndexProgressEvent) {
        match event {
            IndexProgressEvent::Batch {
                collection,
                batch,
                inserted,
                total,
            } => info!(%collection, batch, inserted, total, "index batch written"),
            IndexProgressEvent::Done {
                collection,
                segments,
            } => info!(%collection, segments, "index build complete"),
        }
    }
}

/// Human-friendly progress on stderr: "index documents  batch 4  12 / 40 segments".
pub struct StderrProgress;

impl IndexProgress for StderrProgress {
    fn report(&self, event: IndexProgressEvent) {
        let line = match &event {
            IndexProgressEvent::Batch {
                collection,
                batch,
                inserted,
                total,
            } => format!(
                "index {}  batch {}  {} / {} segments\n",
                collection,
                batch,
                format_number(*inserted as u64),
                format_number(*total as u64)
            ),
            IndexProgressEvent::Done {
                collection,
                segments,
            } => format!(
                "index {}  ready  {} segments\n",
                collection,
                format_number(*segments as u64)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IndexProgress for NoProgress {
    fn report(&self, _event: IndexProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off or human (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IndexProgress> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
