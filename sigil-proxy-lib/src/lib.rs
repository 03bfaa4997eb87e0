#![forbid(unsafe_code)]

pub mod auth;
pub mod bandwidth;
pub mod config;
pub mod engine;
pub mod error;
pub mod limit;
pub mod relay;
pub mod sni;
pub mod supervisor;
pub mod telemetry;
pub mod tls;

pub use auth::{Catalog, IdentityStore, Role, User};
pub use bandwidth::BandwidthTracker;
pub use config::{load_from_path, Config, ProxyMode, RuntimeEnv};
pub use error::{ProxyError, Result};
pub use limit::{RequestLimiter, ThrottledStream};
pub use relay::{relay, RelayCounts};
pub use sni::extract_sni;
pub use supervisor::Supervisor;
pub use telemetry::{init_metrics, Metrics};
