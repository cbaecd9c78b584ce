//! Named phase timers.

use std::collections::HashMap;
use std::time::Instant;

use tracing::info;

/// Wall-clock timers keyed by phase name.
#[derive(Debug, Default)]
pub struct Timer {
    running: HashMap<String, Instant>,
    elapsed: Vec<(String, f64)>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) the phase `tag`.
    pub fn start(&mut self, tag: &str) {
        self.running.insert(tag.to_owned(), Instant::now());
    }

    /// Stops the phase `tag` and returns its duration in seconds, or `None`
    /// if it was never started.
    pub fn stop(&mut self, tag: &str) -> Option<f64> {
        let seconds = self.running.remove(tag)?.elapsed().as_secs_f64();
        info!(phase = tag, seconds, "phase finished");
        self.elapsed.push((tag.to_owned(), seconds));
        Some(seconds)
    }

    /// Runs `f` as the phase `tag`.
    pub fn time<R>(&mut self, tag: &str, f: impl FnOnce() -> R) -> R {
        self.start(tag);
        let result = f();
        self.stop(tag);
        result
    }

    /// Finished phases in the order they stopped.
    pub fn phases(&self) -> &[(String, f64)] {
        &self.elapsed
    }
}
