//! Tunables for the session engine

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the session engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub stream: StreamConfig,
    pub history: HistoryConfig,
}

/// Timing and buffering of in-flight turns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Coalescing window for durable flushes of the in-memory buffer
    pub flush_interval_ms: u64,
    /// A stream state with no update for this long is abandoned
    pub staleness_window_ms: u64,
    /// How long a completion marker absorbs late terminal triggers
    pub completion_grace_ms: u64,
    /// A conversation actor with nothing in flight exits after this long
    pub idle_timeout_ms: u64,
    /// Capacity of each conversation actor's command queue
    pub command_buffer: usize,
    /// Capacity of each conversation's broadcast channel
    pub broadcast_capacity: usize,
    /// Stop a turn with reason `timeout` after this long (no limit when unset)
    pub turn_timeout_ms: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1_000,
            staleness_window_ms: 10 * 60 * 1_000,
            completion_grace_ms: 5_000,
            idle_timeout_ms: 5 * 60 * 1_000,
            command_buffer: 256,
            broadcast_capacity: 1_024,
            turn_timeout_ms: None,
        }
    }
}

impl StreamConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn turn_timeout(&self) -> Option<Duration> {
        self.turn_timeout_ms.map(Duration::from_millis)
    }
}

/// Context reconstruction and compaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Estimated tokens at which the replay window is summarized
    pub compaction_threshold: u64,
    /// Upper bound on the summary length
    pub summary_max_tokens: u32,
    /// Pruning applied to the replay window
    pub prune: PruneOptions,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 128_000,
            summary_max_tokens: 2_048,
            prune: PruneOptions::default(),
        }
    }
}

/// What to strip from old messages before they are replayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneOptions {
    /// Keep reasoning parts only on the final message
    pub reasoning_on_final_only: bool,
    /// Drop tool calls with no result anywhere later in the window,
    /// except on the final message
    pub drop_dangling_tool_calls: bool,
    /// Remove messages left with no content
    pub drop_empty_messages: bool,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            reasoning_on_final_only: true,
            drop_dangling_tool_calls: true,
            drop_empty_messages: true,
        }
    }
}

impl PruneOptions {
    /// Pruning disabled entirely
    pub fn none() -> Self {
        Self {
            reasoning_on_final_only: false,
            drop_dangling_tool_calls: false,
            drop_empty_messages: false,
        }
    }
}
