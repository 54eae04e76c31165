//! Process lifecycle: startup wiring, the accept loop, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use russh::keys::PrivateKey;
use russh::{MethodKind, MethodSet};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::audit::AuditLog;
use crate::configuration::Config;
use crate::error_handling::types::SupervisorError;
use crate::geo::GeoResolver;
use crate::proxy::{serve_connection, ProxyContext};
use crate::sandbox::{DockerRuntime, SandboxPool, SandboxRuntime};
use crate::tracker::CredentialTracker;

pub struct Supervisor {
    ctx: Arc<ProxyContext>,
    russh_config: Arc<russh::server::Config>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    /// Production wiring: host key (fatal on error), audit store, Docker
    /// daemon (pinged once), Tor list (best effort), warm pool.
    pub async fn start(
        config: Config,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, SupervisorError> {
        let host_key = russh::keys::load_secret_key(&config.host_key_path, None)
            .map_err(|e| SupervisorError::HostKey(e.to_string()))?;

        let audit = Arc::new(AuditLog::open(&config.database_path).await?);
        info!("audit log open at {}", config.database_path.display());

        let mut geo = GeoResolver::new(config.geo_api_key.clone());
        geo.load_tor_exits().await;

        let runtime: Arc<dyn SandboxRuntime> = Arc::new(DockerRuntime::connect().await?);

        Ok(Self::assemble(
            config,
            host_key,
            runtime,
            audit,
            Arc::new(geo),
            Arc::new(CredentialTracker::new()),
            shutdown,
        ))
    }

    /// Assembles a supervisor from parts. Used by [`start`](Self::start)
    /// and by tests that substitute the runtime, tracker, or audit store.
    pub fn assemble(
        config: Config,
        host_key: PrivateKey,
        runtime: Arc<dyn SandboxRuntime>,
        audit: Arc<AuditLog>,
        geo: Arc<GeoResolver>,
        tracker: Arc<CredentialTracker>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let pool = Arc::new(SandboxPool::start(
            runtime.clone(),
            config.pool_capacity,
            shutdown.clone(),
        ));

        let russh_config = Arc::new(russh::server::Config {
            methods: MethodSet::from(&[MethodKind::Password][..]),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: Some(Duration::from_secs(3600)),
            keys: vec![host_key],
            ..Default::default()
        });

        let ctx = Arc::new(ProxyContext {
            config,
            tracker,
            pool,
            runtime,
            audit,
            geo,
        });

        Self {
            ctx,
            russh_config,
            shutdown,
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), SupervisorError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_address)
            .await
            .map_err(SupervisorError::Bind)?;
        self.serve(listener).await
    }

    /// Accept loop. Each connection runs on its own task; the loop ends
    /// when the shutdown flag flips, after which the pool is drained.
    /// Sessions already in flight finish on their own.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SupervisorError> {
        if let Ok(addr) = listener.local_addr() {
            info!("listening for SSH on {}", addr);
        }

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("inbound connection from {}", peer);
                        tokio::spawn(serve_connection(
                            self.ctx.clone(),
                            self.russh_config.clone(),
                            stream,
                            peer,
                        ));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("shutdown requested, draining sandbox pool");
        self.ctx.pool.drain().await;
        Ok(())
    }
}
