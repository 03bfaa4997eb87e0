use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::IdentityStore;
use crate::bandwidth::BandwidthTracker;
use crate::config::{Config, ProxyMode, RuntimeEnv};
use crate::engine::{
    Engine, HttpProxyEngine, ProxyState, SessionCounter, SignalEngine, Socks5Engine,
};
use crate::error::{ProxyError, Result};
use crate::limit::RequestLimiter;
use crate::telemetry::{init_metrics, serve_metrics};
use crate::tls::ReloadingCertResolver;

const DRAIN_DEADLINE: Duration = Duration::from_secs(30);
const DEFAULT_USAGE_FILE: &str = "bandwidth_usage.json";

/// One-shot process lifecycle: build the shared state, start the engine
/// set for the configured mode, handle signals, drain, persist.
pub struct Supervisor {
    config: Arc<Config>,
    env: RuntimeEnv,
    usage_file: PathBuf,
}

impl Supervisor {
    pub fn new(config: Config, env: RuntimeEnv) -> Self {
        Self { config: Arc::new(config), env, usage_file: PathBuf::from(DEFAULT_USAGE_FILE) }
    }

    /// Override where bandwidth counters are persisted.
    pub fn with_usage_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.usage_file = path.into();
        self
    }

    pub async fn run(self) -> Result<()> {
        let (metrics, registry) =
            init_metrics().map_err(|e| ProxyError::Config(format!("metrics init failed: {e}")))?;

        info!(env = ?self.env.app_env, mode = ?self.env.proxy_mode, "supervisor starting");
        let identity = Arc::new(IdentityStore::load(&self.env.users_file)?);
        info!(users = identity.catalog().len(), path = %self.env.users_file.display(), "user catalog loaded");

        let tracker = Arc::new(BandwidthTracker::restore(&self.usage_file));

        let mode = self.env.proxy_mode;
        let wants_tls = match mode {
            ProxyMode::Signal => true,
            ProxyMode::Http => false,
            ProxyMode::Https | ProxyMode::General => self.env.http_proxy_tls,
        };
        let resolver = if wants_tls {
            let (Some(cert), Some(key)) = (&self.config.cert_file, &self.config.key_file) else {
                return Err(ProxyError::Config(
                    "cert_file and key_file are required for TLS listeners".to_string(),
                ));
            };
            Some(ReloadingCertResolver::from_files(cert, key)?)
        } else {
            None
        };

        let shutdown = CancellationToken::new();
        let session_cancel = CancellationToken::new();
        let (sessions, mut closed_rx) = SessionCounter::new();

        let state = Arc::new(ProxyState {
            config: self.config.clone(),
            env: self.env.clone(),
            identity: identity.clone(),
            limiter: Arc::new(RequestLimiter::new()),
            tracker: tracker.clone(),
            metrics,
            admission: Arc::new(Semaphore::new(self.config.max_conns)),
            sessions: sessions.clone(),
            session_cancel: session_cancel.clone(),
        });

        let engines: Vec<Arc<dyn Engine>> = match mode {
            ProxyMode::Signal => {
                let Some(resolver) = resolver.clone() else {
                    return Err(ProxyError::Config(
                        "cert_file and key_file are required for signal mode".to_string(),
                    ));
                };
                vec![Arc::new(SignalEngine::new(state.clone(), resolver))]
            }
            ProxyMode::Http => vec![Arc::new(HttpProxyEngine::new(state.clone(), None))],
            ProxyMode::Https => {
                vec![Arc::new(HttpProxyEngine::new(state.clone(), resolver.clone()))]
            }
            ProxyMode::General => vec![
                Arc::new(HttpProxyEngine::new(state.clone(), resolver.clone())),
                Arc::new(Socks5Engine::new(state.clone())),
            ],
        };

        let mut engine_set: JoinSet<Result<()>> = JoinSet::new();
        for engine in engines {
            let token = shutdown.child_token();
            info!(engine = engine.name(), mode = ?mode, "starting engine");
            engine_set.spawn(async move { engine.run(token).await });
        }

        let persist_tracker = tracker.clone();
        let persist_cancel = shutdown.child_token();
        let persist_task =
            tokio::spawn(async move { persist_tracker.run_persist_loop(persist_cancel).await });

        if let Some(addr) = self.config.metrics_listen {
            let cancel = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = serve_metrics(addr, registry, cancel).await {
                    warn!(error = %e, "metrics listener failed");
                }
            });
        }

        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| ProxyError::Config(format!("failed to install signal handler: {e}")))?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| ProxyError::Config(format!("failed to install signal handler: {e}")))?;
        let mut sighup = signal(SignalKind::hangup())
            .map_err(|e| ProxyError::Config(format!("failed to install signal handler: {e}")))?;

        let run_result = loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("interrupt received, draining");
                    break Ok(());
                }
                _ = sigterm.recv() => {
                    info!("terminate received, draining");
                    break Ok(());
                }
                _ = sighup.recv() => {
                    match &resolver {
                        Some(resolver) => {
                            if let Err(e) = resolver.reload() {
                                // Keep serving with the previous pair.
                                error!(error = %e, "certificate reload failed");
                            }
                        }
                        None => info!("hangup received but no TLS material is loaded"),
                    }
                }
                joined = engine_set.join_next() => {
                    match joined {
                        Some(Ok(Ok(()))) => continue,
                        Some(Ok(Err(e))) => {
                            error!(error = %e, "engine exited with error");
                            break Err(e);
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "engine task panicked");
                            break Err(ProxyError::Config(format!("engine task failed: {e}")));
                        }
                        None => break Ok(()),
                    }
                }
            }
        };

        // Drain: stop accepting immediately, give in-flight sessions up to
        // the deadline, then force-close whatever remains.
        shutdown.cancel();
        let deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;
        while sessions.active() > 0 {
            info!(active = sessions.active(), "waiting for sessions to finish");
            tokio::select! {
                _ = closed_rx.changed() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(active = sessions.active(), "drain deadline reached, force-closing sessions");
                    break;
                }
            }
        }
        session_cancel.cancel();

        while engine_set.join_next().await.is_some() {}
        let _ = persist_task.await;
        tracker.persist();
        info!("shutdown complete");

        run_result
    }
}
