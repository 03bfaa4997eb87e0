use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::auth::{IdentityStore, User};
use crate::bandwidth::BandwidthTracker;
use crate::config::{Config, RuntimeEnv};
use crate::limit::RequestLimiter;
use crate::telemetry::Metrics;

/// Handle bundle shared by all engines. Owned by the supervisor; engines
/// and sessions only ever hold clones of the `Arc`s inside.
pub struct ProxyState {
    pub config: Arc<Config>,
    pub env: RuntimeEnv,
    pub identity: Arc<IdentityStore>,
    pub limiter: Arc<RequestLimiter>,
    pub tracker: Arc<BandwidthTracker>,
    pub metrics: Arc<Metrics>,
    pub admission: Arc<Semaphore>,
    pub sessions: Arc<SessionCounter>,
    /// Fires when in-flight sessions must stop (drain deadline passed).
    pub session_cancel: CancellationToken,
}

impl ProxyState {
    /// Reserve an admission slot without waiting. `None` means the proxy
    /// is at `max_conns`; the caller sheds the connection.
    pub fn try_admit(&self) -> Option<SessionPermit> {
        let permit = self.admission.clone().try_acquire_owned().ok()?;
        self.metrics.connections_total.add(1, &[]);
        self.metrics.connections_active.add(1, &[]);
        self.sessions.increment();
        Some(SessionPermit {
            _permit: permit,
            sessions: self.sessions.clone(),
            metrics: self.metrics.clone(),
        })
    }

    /// Per-user policy chain, in rejection-priority order. Super-admin
    /// users connecting from a super-admin range bypass everything.
    pub fn check_user_policy(&self, user: &User, client_ip: IpAddr) -> Option<PolicyRejection> {
        if user.is_super_admin() && self.identity.catalog().is_super_admin_ip(client_ip) {
            return None;
        }
        if !self.limiter.allow(&user.username, user.rate_limit_rpm) {
            return Some(PolicyRejection::RateLimited);
        }
        if user.is_expired(Utc::now()) {
            return Some(PolicyRejection::Expired);
        }
        if !self.tracker.check_allowance(&user.username, user.bandwidth_limit_gb) {
            return Some(PolicyRejection::BandwidthExceeded);
        }
        if !self.tracker.check_conn_limit(&user.username, user.max_connections) {
            return Some(PolicyRejection::TooManyConnections);
        }
        None
    }

    /// Account one active connection for a user; released on drop.
    pub fn begin_user_connection(&self, username: &str) -> UserConnection {
        self.tracker.increment_conns(username);
        UserConnection { tracker: self.tracker.clone(), username: username.to_string() }
    }
}

/// Why the policy chain refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyRejection {
    RateLimited,
    Expired,
    BandwidthExceeded,
    TooManyConnections,
}

/// Active-session counter with a notifier the supervisor watches during
/// drain.
pub struct SessionCounter {
    active: AtomicUsize,
    closed_tx: watch::Sender<()>,
}

impl SessionCounter {
    pub fn new() -> (Arc<Self>, watch::Receiver<()>) {
        let (closed_tx, closed_rx) = watch::channel(());
        (Arc::new(Self { active: AtomicUsize::new(0), closed_tx }), closed_rx)
    }

    fn increment(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    fn decrement(&self) {
        let remaining = self.active.fetch_sub(1, Ordering::Relaxed);
        if remaining == 1 {
            let _ = self.closed_tx.send(());
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// Holds one admission slot for the lifetime of a session. Dropping it
/// releases the semaphore permit, decrements the active gauge, and
/// notifies the drain watcher when the last session ends.
pub struct SessionPermit {
    _permit: OwnedSemaphorePermit,
    sessions: Arc<SessionCounter>,
    metrics: Arc<Metrics>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.metrics.connections_active.add(-1, &[]);
        self.sessions.decrement();
    }
}

/// Per-user active-connection accounting; symmetric decrement on drop.
pub struct UserConnection {
    tracker: Arc<BandwidthTracker>,
    username: String,
}

impl UserConnection {
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl Drop for UserConnection {
    fn drop(&mut self) {
        self.tracker.decrement_conns(&self.username);
    }
}
