mod bucket;
mod throttle;

pub use bucket::{RequestLimiter, TokenBucket};
pub use throttle::ThrottledStream;
