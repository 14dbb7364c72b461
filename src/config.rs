//! Coordinator configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Commit-order monitor usage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOrder {
    /// Drain and admit through the commit-order monitor.
    Strict,
    /// Skip the commit-order monitor entirely.
    Bypass,
}

/// What to do when the coordinator hits an unrecoverable, fail-stop error.
///
/// The engine relies on fail-stop semantics to preserve cluster consistency;
/// `Panic` exists so tests can observe marker state at the failure point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalAction {
    Abort,
    Panic,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// State-transfer request protocol version (0 cannot carry IST).
    pub proto_ver: u8,
    /// Fixed back-off between transient send retries.
    pub retry_interval_ms: u64,
    /// Bind address for the incremental-transfer listener.
    pub ist_bind_addr: String,
    /// Donor selection hint forwarded to the group layer.
    pub donor_hint: String,
    pub commit_order: CommitOrder,
    /// Local-order slots tolerated before a request is declared stuck.
    pub monitor_window: i64,
    /// Upper bound for a single incremental-transfer frame.
    pub max_frame_bytes: usize,
    /// Recovery marker location.
    pub marker_path: PathBuf,
    pub fatal_action: FatalAction,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            proto_ver: 2,
            retry_interval_ms: 1_000,
            ist_bind_addr: "127.0.0.1:0".to_string(),
            donor_hint: String::new(),
            commit_order: CommitOrder::Strict,
            monitor_window: 16_384,
            max_frame_bytes: 4 << 20,
            marker_path: PathBuf::from("recovery_marker.json"),
            fatal_action: FatalAction::Abort,
        }
    }
}

impl Config {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}
