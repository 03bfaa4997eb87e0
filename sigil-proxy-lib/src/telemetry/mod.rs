pub mod metrics;

pub use metrics::{init_metrics, serve_metrics, Metrics};
