mod tracker;

pub use tracker::{BandwidthTracker, UsageRecord, PERSIST_INTERVAL};
