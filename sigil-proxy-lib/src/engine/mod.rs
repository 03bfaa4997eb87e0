pub mod http;
pub mod pac;
pub mod signal;
pub mod socks5;
mod state;

pub use self::http::HttpProxyEngine;
pub use self::pac::PacResponder;
pub use self::signal::SignalEngine;
pub use self::socks5::Socks5Engine;
pub use self::state::{PolicyRejection, ProxyState, SessionCounter, SessionPermit, UserConnection};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Capability set every data-plane engine offers. The supervisor composes
/// the set selected by the proxy mode and spawns each one.
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Accept and serve connections until `shutdown` fires. Returning an
    /// error means the listener is gone; the supervisor does not attempt
    /// recovery.
    async fn run(&self, shutdown: CancellationToken) -> Result<()>;
}
