//! Ingestion progress reporting.
//!
//! The orchestrator and the parallel loader emit [`ProgressEvent`]s to a
//! [`ProgressReporter`]. Progress is written to **stderr** so stdout stays
//! parseable; it is a reporting concern only and never affects results.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Walking the source directory (total unknown).
    Discovering { database: String },
    /// `n` of `total` files parsed.
    Loading { n: u64, total: u64 },
    /// Splitting `documents` documents into chunks.
    Splitting { documents: u64 },
    /// Embedding and writing `chunks` chunks.
    Persisting { chunks: u64 },
}

/// Receives progress events. Called from the orchestrating task only.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "loading  1,234 / 5,000 files".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Discovering { database } => {
                format!("{}  discovering...\n", database)
            }
            ProgressEvent::Loading { n, total } => format!(
                "loading  {} / {} files\n",
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::Splitting { documents } => {
                format!("splitting  {} documents\n", format_number(*documents))
            }
            ProgressEvent::Persisting { chunks } => {
                format!("embedding  {} chunks (this may take a while)\n", format_number(*chunks))
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Discovering { database } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "database": database,
            }),
            ProgressEvent::Loading { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "loading",
                "n": n,
                "total": total,
            }),
            ProgressEvent::Splitting { documents } => serde_json::json!({
                "event": "progress",
                "phase": "splitting",
                "documents": documents,
            }),
            ProgressEvent::Persisting { chunks } => serde_json::json!({
                "event": "progress",
                "phase": "persisting",
                "chunks": chunks,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
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
        assert_eq!(format_number(123_456), "123,456");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
