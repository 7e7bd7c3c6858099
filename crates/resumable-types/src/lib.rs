//! Shared types for resumable downloads
//!
//! This crate contains the data model shared by the download engine,
//! its persistence backends and the CLI.

use serde::{Deserialize, Serialize};

// ============================================================================
// Transfer Types
// ============================================================================

/// Logical state of a transfer, persisted as the source of truth for resume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    #[default]
    Start,
    InProgress,
    Complete,
    Failed,
}

impl TransferState {
    /// Textual form used by persistence backends
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Start => "start",
            TransferState::InProgress => "in_progress",
            TransferState::Complete => "complete",
            TransferState::Failed => "failed",
        }
    }

    /// Parse the textual form written by [`TransferState::as_str`]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(TransferState::Start),
            "in_progress" => Some(TransferState::InProgress),
            "complete" => Some(TransferState::Complete),
            "failed" => Some(TransferState::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inclusive byte window, as written in `Range` and `Content-Range` headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Returns `None` when `end < start`
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (end >= start).then_some(Self { start, end })
    }

    /// The window of `len` bytes beginning at `start` (`len` of zero is treated as one)
    pub fn window(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(len.max(1) - 1),
        }
    }

    /// Number of bytes covered by this range
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// A range always covers at least one byte
    pub fn is_empty(&self) -> bool {
        false
    }

    /// First byte after this range
    pub fn next_start(&self) -> u64 {
        self.end.saturating_add(1)
    }

    /// Value for an outgoing `Range` header
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Everything persisted about a transfer besides its state and payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Entity tag of the representation being fetched
    pub identity: Option<String>,
    pub total_size: Option<u64>,
    /// Last confirmed range
    pub last_range: Option<ByteRange>,
}

impl ProgressRecord {
    /// Bytes confirmed so far (ranges are contiguous from zero)
    pub fn received_bytes(&self) -> u64 {
        self.last_range.map(|r| r.next_start()).unwrap_or(0)
    }

    pub fn progress(&self) -> f64 {
        match self.total_size {
            Some(size) if size > 0 => (self.received_bytes() as f64 / size as f64) * 100.0,
            _ => 0.0,
        }
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Tunables for a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Size of the first request
    pub initial_window: u64,
    /// Size of every continuation request
    pub step_window: u64,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Give up on the whole transfer after this long (None = no limit)
    pub max_duration_secs: Option<u64>,
    pub retry: RetrySettings,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            initial_window: 1000,
            step_window: 500_000,
            user_agent: "resumable/0.1.0".to_string(),
            connect_timeout_secs: 30,
            request_timeout_secs: 120,
            max_duration_secs: None,
            retry: RetrySettings::default(),
        }
    }
}

/// Backoff configuration used by the default retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed, 0.0 to 1.0
    pub jitter: f64,
    /// Consecutive transient failures tolerated (None = retry forever)
    pub max_retries: Option<u32>,
    /// Consecutive fatal failures tolerated
    pub max_fatal_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_retries: Some(10),
            max_fatal_retries: 3,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// How a failure is treated by the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network hiccups and server-side errors; retried with backoff
    Transient,
    /// Protocol violations that will most likely repeat; retried a few times
    Fatal,
    /// Persisted progress is unusable; the transfer starts over
    RestartRequired,
}

/// Events emitted by a running transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TransferEvent {
    StateChanged {
        from: TransferState,
        to: TransferState,
    },
    ChunkReceived {
        range: Option<ByteRange>,
        total_size: Option<u64>,
        bytes: u64,
    },
    Restarted {
        reason: String,
    },
    RetryScheduled {
        attempt: u32,
        delay_ms: u64,
        kind: ErrorKind,
        error: String,
    },
    Completed {
        bytes: u64,
    },
    GaveUp {
        attempts: u32,
        error: String,
    },
}
