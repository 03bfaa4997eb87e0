use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sigil_proxy_lib::bandwidth::BandwidthTracker;

fn tmp_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos();
    std::env::temp_dir().join(format!("sigil-usage-{nanos}-{name}.json"))
}

#[test]
fn totals_are_the_sum_of_directions() {
    let tracker = BandwidthTracker::new(tmp_path("totals"));
    tracker.record("alice", 100, 250);
    tracker.record("alice", 50, 0);

    let usage = tracker.usage("alice").unwrap();
    assert_eq!(usage.bytes_up, 150);
    assert_eq!(usage.bytes_down, 250);
    assert_eq!(usage.total_bytes, usage.bytes_up + usage.bytes_down);
}

#[test]
fn zero_limit_means_unlimited() {
    let tracker = BandwidthTracker::new(tmp_path("unlimited"));
    tracker.record("alice", u64::MAX / 4, 0);
    assert!(tracker.check_allowance("alice", 0));
    assert!(tracker.check_conn_limit("alice", 0));
}

#[test]
fn allowance_boundary_is_exact() {
    let tracker = BandwidthTracker::new(tmp_path("boundary"));
    tracker.record("bob", 1 << 29, (1 << 29) - 1);
    assert!(tracker.check_allowance("bob", 1));

    tracker.record("bob", 1, 0);
    assert!(!tracker.check_allowance("bob", 1));
}

#[test]
fn connection_counts_are_symmetric_and_never_negative() {
    let tracker = BandwidthTracker::new(tmp_path("conns"));
    tracker.increment_conns("alice");
    tracker.increment_conns("alice");
    assert!(!tracker.check_conn_limit("alice", 2));
    assert!(tracker.check_conn_limit("alice", 3));

    tracker.decrement_conns("alice");
    tracker.decrement_conns("alice");
    tracker.decrement_conns("alice");
    assert_eq!(tracker.usage("alice").unwrap().active_conns, 0);
}

#[test]
fn unknown_users_pass_checks() {
    let tracker = BandwidthTracker::new(tmp_path("unknown"));
    assert!(tracker.check_allowance("ghost", 1));
    assert!(tracker.check_conn_limit("ghost", 1));
}

#[test]
fn persist_restore_round_trip_preserves_counters() {
    let path = tmp_path("roundtrip");
    let tracker = BandwidthTracker::new(&path);
    tracker.record("alice", 123, 456);
    tracker.increment_conns("alice");
    tracker.persist();

    let restored = BandwidthTracker::restore(&path);
    let usage = restored.usage("alice").unwrap();
    assert_eq!(usage.bytes_up, 123);
    assert_eq!(usage.bytes_down, 456);
    assert_eq!(usage.total_bytes, 579);
    // Active connections never survive a restart.
    assert_eq!(usage.active_conns, 0);
}

#[test]
fn stale_month_is_discarded_on_restore() {
    let path = tmp_path("stale");
    fs::write(
        &path,
        r#"{"month": "1999-01", "users": {"alice": {"bytes_up": 7, "bytes_down": 9, "total_bytes": 16}}}"#,
    )
    .unwrap();

    let restored = BandwidthTracker::restore(&path);
    assert!(restored.usage("alice").is_none());
}

#[test]
fn malformed_usage_file_starts_empty() {
    let path = tmp_path("malformed");
    fs::write(&path, "{broken").unwrap();
    let restored = BandwidthTracker::restore(&path);
    assert!(restored.usage("alice").is_none());
}

#[test]
fn persist_failure_does_not_panic() {
    let tracker = BandwidthTracker::new("/nonexistent-dir/usage.json");
    tracker.record("alice", 1, 1);
    tracker.persist();
    assert_eq!(tracker.usage("alice").unwrap().total_bytes, 2);
}
