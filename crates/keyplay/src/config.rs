use std::time::Duration;

use hotmacro::{Result, duration_ms};
use serde::{Deserialize, Serialize};

/// Hard ceiling on concurrent workers for a single macro
pub const THREAD_MAX: usize = 16;

/// Default time to wait for workers to drain before abandoning them
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default wait between checks while paused
pub const DEFAULT_PAUSE_INTERVAL: Duration = Duration::from_millis(20);

/// Default number of pause waits before playback resumes on its own
pub const DEFAULT_PAUSE_RETRIES: u32 = 50;

/// Playback settings for a [`Macro`](crate::Macro)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Maximum concurrent workers, clamped to `1..=THREAD_MAX`
    pub thread_max: usize,
    /// Keep a lone worker replaying until interrupted
    pub sticky: bool,
    /// Value returned from `trigger`, used to block the triggering signal
    pub blocking: bool,
    /// Bound on waiting for workers to finish
    #[serde(with = "duration_ms", rename = "drain_timeout_ms")]
    pub drain_timeout: Duration,
    /// Wait between pause checks
    #[serde(with = "duration_ms", rename = "pause_interval_ms")]
    pub pause_interval: Duration,
    pub pause_retries: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            thread_max: 1,
            sticky: false,
            blocking: false,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            pause_interval: DEFAULT_PAUSE_INTERVAL,
            pause_retries: DEFAULT_PAUSE_RETRIES,
        }
    }
}

impl PlaybackConfig {
    pub fn with_thread_max(mut self, thread_max: usize) -> Self {
        self.thread_max = thread_max;
        self
    }

    pub fn with_sticky(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }

    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set how long each pause wait lasts and how many happen before
    /// playback resumes on its own
    pub fn with_pause(mut self, interval: Duration, retries: u32) -> Self {
        self.pause_interval = interval;
        self.pause_retries = retries;
        self
    }

    /// The worker limit actually enforced
    pub fn effective_thread_max(&self) -> usize {
        self.thread_max.clamp(1, THREAD_MAX)
    }

    /// Parse a configuration from RON text. Missing fields take defaults.
    pub fn from_ron(text: &str) -> Result<Self> {
        Ok(ron::from_str(text)?)
    }
}
