use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often counters are flushed to disk. A crash loses at most this much
/// accounting.
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(300);

const BYTES_PER_GB: u64 = 1 << 30;

/// Per-user monthly usage counters.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct UsageRecord {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
    #[serde(default)]
    pub last_reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active_conns: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct UsageFile {
    month: String,
    users: HashMap<String, UsageRecord>,
}

/// Per-user monthly byte counters and active-connection counts, durable
/// across restarts.
///
/// One coarse lock guards the map; it is held only across map arithmetic.
/// Disk failures are logged and swallowed: the data plane must keep
/// relaying whether or not accounting can be persisted.
pub struct BandwidthTracker {
    path: PathBuf,
    state: Mutex<UsageFile>,
}

fn month_tag(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

impl BandwidthTracker {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: Mutex::new(UsageFile { month: month_tag(Utc::now()), users: HashMap::new() }),
        }
    }

    /// Start from the usage file if it exists and carries the current
    /// month's tag; otherwise start empty. `active_conns` never survives a
    /// restart.
    pub fn restore<P: AsRef<Path>>(path: P) -> Self {
        let tracker = Self::new(&path);
        match fs::read_to_string(&path) {
            Ok(txt) => match serde_json::from_str::<UsageFile>(&txt) {
                Ok(mut file) => {
                    let current = month_tag(Utc::now());
                    if file.month == current {
                        for record in file.users.values_mut() {
                            record.active_conns = 0;
                        }
                        info!(users = file.users.len(), month = %file.month, "bandwidth usage restored");
                        *tracker.state.lock().unwrap_or_else(|e| e.into_inner()) = file;
                    } else {
                        info!(stored = %file.month, current = %current, "usage file is from another month, discarding");
                    }
                }
                Err(e) => warn!(error = %e, "usage file is malformed, starting empty"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "failed to read usage file, starting empty"),
        }
        tracker
    }

    /// Zero everything when the wall-clock month has moved past the tag.
    /// Returns true when a rollover happened so the caller can persist.
    fn rollover_if_due(state: &mut UsageFile, now: DateTime<Utc>) -> bool {
        let current = month_tag(now);
        if state.month == current {
            return false;
        }
        info!(from = %state.month, to = %current, "bandwidth month rollover");
        state.month = current;
        for record in state.users.values_mut() {
            *record = UsageRecord {
                active_conns: record.active_conns,
                last_reset_at: Some(now),
                ..UsageRecord::default()
            };
        }
        true
    }

    /// Add transferred bytes to a user's counters.
    pub fn record(&self, username: &str, up: u64, down: u64) {
        let rolled = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let rolled = Self::rollover_if_due(&mut state, Utc::now());
            let record = state.users.entry(username.to_string()).or_default();
            record.bytes_up += up;
            record.bytes_down += down;
            record.total_bytes += up + down;
            rolled
        };
        if rolled {
            self.persist();
        }
    }

    /// True while the user is under their monthly cap. `limit_gb == 0`
    /// means unlimited.
    pub fn check_allowance(&self, username: &str, limit_gb: u64) -> bool {
        if limit_gb == 0 {
            return true;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::rollover_if_due(&mut state, Utc::now());
        let used = state.users.get(username).map_or(0, |r| r.total_bytes);
        used < limit_gb * BYTES_PER_GB
    }

    pub fn increment_conns(&self, username: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.users.entry(username.to_string()).or_default().active_conns += 1;
    }

    pub fn decrement_conns(&self, username: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = state.users.get_mut(username) {
            record.active_conns = record.active_conns.saturating_sub(1);
        }
    }

    /// True while the user is under their concurrent-connection cap.
    /// `max == 0` means unlimited.
    pub fn check_conn_limit(&self, username: &str, max: u32) -> bool {
        if max == 0 {
            return true;
        }
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.users.get(username).map_or(0, |r| r.active_conns) < max
    }

    pub fn usage(&self, username: &str) -> Option<UsageRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.users.get(username).cloned()
    }

    /// Write the current state atomically (temp file + rename). Failures
    /// are logged and ignored.
    pub fn persist(&self) {
        let serialized = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            serde_json::to_vec_pretty(&*state)
        };
        let bytes = match serialized {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to serialize usage state");
                return;
            }
        };
        let tmp = self.path.with_extension("tmp");
        if let Err(e) = fs::write(&tmp, &bytes).and_then(|()| fs::rename(&tmp, &self.path)) {
            warn!(error = %e, path = %self.path.display(), "failed to persist usage state");
        } else {
            debug!(path = %self.path.display(), "usage state persisted");
        }
    }

    /// Flush on an interval until cancelled, then flush once more on the
    /// way out.
    pub async fn run_persist_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(PERSIST_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.persist(),
                _ = cancel.cancelled() => {
                    self.persist();
                    return;
                }
            }
        }
    }
}
