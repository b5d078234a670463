//! DeskHub API server

use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::Result;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::api::{create_router, ApiState};
use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::flush::FlushScheduler;
use crate::limiter::LoginLimiter;
use crate::metrics::ApiMetrics;
use crate::presence::PresenceCache;
use crate::store::SqliteStore;

pub struct DeskHubServer {
    config: Arc<ServerConfig>,
    store: Arc<SqliteStore>,
    presence: Arc<PresenceCache>,
    limiter: Arc<LoginLimiter>,
    metrics: Arc<ApiMetrics>,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
}

impl DeskHubServer {
    /// Open the database and build the shared state
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(SqliteStore::new(&config.database_path).await?);
        if let Some(password) = &config.admin_password {
            store.bootstrap_admin(password).await?;
        }

        let presence = Arc::new(PresenceCache::new(store.clone()));
        let limiter = Arc::new(LoginLimiter::new(config.login_limit.clone()));
        let metrics = Arc::new(ApiMetrics::new()?);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            store,
            presence,
            limiter,
            metrics,
            clock: Arc::new(SystemClock),
            shutdown_tx,
        })
    }

    /// Serve until SIGTERM, ctrl-c or [`DeskHubServer::shutdown`], then write
    /// out whatever presence is still cached.
    pub async fn run(&self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr).await?;
        info!("deskhub-api listening on {}", self.config.listen_addr);

        let scheduler = Arc::new(FlushScheduler::new(
            self.presence.clone(),
            self.metrics.clone(),
            self.config.flush_interval(),
        ));
        let flush_task = scheduler.spawn(self.shutdown_tx.subscribe());

        let sweep_task = tokio::spawn(Self::sweep_task(
            self.limiter.clone(),
            self.metrics.clone(),
            self.clock.clone(),
            self.config.clone(),
            self.shutdown_tx.subscribe(),
        ));

        let state = ApiState {
            presence: self.presence.clone(),
            peers: self.store.clone(),
            limiter: self.limiter.clone(),
            authenticator: self.store.clone(),
            metrics: self.metrics.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
        };
        let app = create_router(state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

        let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(Self::shutdown_signal(self.shutdown_tx.subscribe()))
            .await;

        // Stop the background tasks whether the listener ended cleanly or not.
        self.shutdown();
        if let Err(e) = flush_task.await {
            warn!("Flush task ended abnormally: {}", e);
        }
        if let Err(e) = sweep_task.await {
            warn!("Sweep task ended abnormally: {}", e);
        }

        served?;
        info!("deskhub-api stopped");
        Ok(())
    }

    async fn sweep_task(
        limiter: Arc<LoginLimiter>,
        metrics: Arc<ApiMetrics>,
        clock: Arc<dyn Clock>,
        config: Arc<ServerConfig>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(config.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = limiter.sweep(clock.now());
                    metrics.limiter_windows.set(limiter.len() as f64);
                    if removed > 0 {
                        debug!("Swept {} login limiter windows", removed);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    match sigterm.as_mut() {
                        Some(sigterm) => {
                            sigterm.recv().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, starting graceful shutdown");
            }
            _ = shutdown.wait_for(|stop| *stop) => {
                info!("Shutdown requested");
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn presence(&self) -> &Arc<PresenceCache> {
        &self.presence
    }
}
