use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. `RUST_LOG` wins over the
/// verbosity given on the command line.
pub fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Collects repeated warnings and reports them as periodic summaries, so a
/// misbehaving capture does not flood the log line by line.
#[derive(Debug, Default)]
pub struct AggregatedLog {
    messages: Mutex<HashMap<String, u64>>,
}

impl AggregatedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&self, message: impl Into<String>) {
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        *messages.entry(message.into()).or_insert(0) += 1;
    }

    /// How many times `message` was recorded since the last flush.
    pub fn count(&self, message: &str) -> u64 {
        let messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        messages.get(message).copied().unwrap_or(0)
    }

    /// Emit one summary line per distinct message and reset the counters.
    /// Returns the number of distinct messages reported.
    pub fn flush(&self) -> usize {
        let drained: Vec<(String, u64)> = {
            let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
            messages.drain().collect()
        };

        for (message, times) in &drained {
            warn!(times, "aggregated: {message}");
        }

        drained.len()
    }
}
