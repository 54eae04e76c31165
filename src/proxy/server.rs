//! Inbound SSH handling: admission, session setup, channel dispatch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodKind, MethodSet, Pty};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audit::AuditLog;
use crate::capture::SessionTap;
use crate::configuration::Config;
use crate::error_handling::types::{ProxyError, SessionError};
use crate::geo::GeoResolver;
use crate::proxy::backend::{self, BackendHandle};
use crate::proxy::bridge::{self, ChannelOp};
use crate::sandbox::{wait_until_ready, SandboxPool, SandboxRuntime};
use crate::tracker::{CredentialTracker, Decision};

/// How long a reused (affine) sandbox gets to come back healthy before the
/// session falls through to the pool.
const AFFINITY_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-channel op queue depth between the handler and its bridge task.
const BRIDGE_QUEUE: usize = 64;

/// Everything a connection needs, shared across all connections.
pub struct ProxyContext {
    pub config: Config,
    pub tracker: Arc<CredentialTracker>,
    pub pool: Arc<SandboxPool>,
    pub runtime: Arc<dyn SandboxRuntime>,
    pub audit: Arc<AuditLog>,
    pub geo: Arc<GeoResolver>,
}

/// Lifecycle of one inbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Authenticating,
    Admitted,
    BackendDialing,
    Bridging,
}

/// State of an admitted session, shared between the handler and the
/// connection task so cleanup runs on every exit path.
pub struct SessionState {
    sandbox: String,
    session_id: i32,
    started_at: Instant,
    backend: Option<BackendHandle>,
    keepalive: Option<JoinHandle<()>>,
}

pub struct ProxyHandler {
    ctx: Arc<ProxyContext>,
    peer: SocketAddr,
    phase: Phase,
    state: Arc<Mutex<Option<SessionState>>>,
    channels: HashMap<ChannelId, mpsc::Sender<ChannelOp>>,
}

impl ProxyHandler {
    pub fn new(ctx: Arc<ProxyContext>, peer: SocketAddr) -> Self {
        Self {
            ctx,
            peer,
            phase: Phase::Authenticating,
            state: Arc::new(Mutex::new(None)),
            channels: HashMap::new(),
        }
    }

    pub fn session_state(&self) -> Arc<Mutex<Option<SessionState>>> {
        self.state.clone()
    }

    fn advance(&mut self, phase: Phase) {
        debug!("connection {}: {:?} -> {:?}", self.peer, self.phase, phase);
        self.phase = phase;
    }

    /// Picks the sandbox for this session: the host's most recent one if it
    /// can be brought back healthy, otherwise a fresh handle from the pool.
    async fn select_sandbox(&self) -> Result<String, SessionError> {
        let source_ip = self.peer.ip().to_string();

        match self.ctx.audit.last_sandbox_for(&source_ip).await {
            Ok(Some(previous)) => match self.ctx.runtime.start_existing(&previous).await {
                Ok(()) => {
                    if wait_until_ready(
                        self.ctx.runtime.as_ref(),
                        &previous,
                        AFFINITY_READY_TIMEOUT,
                    )
                    .await
                    {
                        info!("reusing sandbox {} for {}", previous, source_ip);
                        return Ok(previous);
                    }
                    debug!("previous sandbox {} never became ready", previous);
                }
                Err(e) => {
                    debug!("could not restart previous sandbox {}: {}", previous, e);
                }
            },
            Ok(None) => {}
            Err(e) => warn!("affinity lookup for {} failed: {}", source_ip, e),
        }

        self.ctx.pool.acquire().await.ok_or(SessionError::PoolClosed)
    }

    /// Opens a bridge for a freshly accepted inbound channel.
    async fn bridge_channel(
        &mut self,
        channel: &Channel<Msg>,
        session: &mut Session,
        backend_channel: Channel<russh::client::Msg>,
    ) {
        let guard = self.state.lock().await;
        let Some(state) = guard.as_ref() else {
            return;
        };
        let tap = SessionTap::new(state.session_id, self.ctx.audit.clone(), state.started_at);
        drop(guard);

        let (tx, rx) = mpsc::channel(BRIDGE_QUEUE);
        let id = channel.id();
        tokio::spawn(bridge::run(session.handle(), id, backend_channel, rx, tap));
        self.channels.insert(id, tx);
    }

    async fn relay(&mut self, channel: ChannelId, op: ChannelOp) {
        if let Some(tx) = self.channels.get(&channel) {
            if tx.send(op).await.is_err() {
                debug!("bridge for channel {} is gone", channel);
                self.channels.remove(&channel);
            }
        }
    }
}

impl Handler for ProxyHandler {
    type Error = ProxyError;

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<Auth, Self::Error> {
        debug!(
            "password attempt from {}: user={:?} password={:?}",
            self.peer, user, password
        );

        let decision = self.ctx.tracker.submit(self.peer, user, password);

        // A real sshd never answers instantly
        let delay = rand::rng().random_range(50..500);
        tokio::time::sleep(Duration::from_millis(delay)).await;

        match decision {
            Decision::Admit => {
                self.advance(Phase::Admitted);
                Ok(Auth::Accept)
            }
            Decision::Reject => Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::from(&[MethodKind::Password][..])),
                partial_success: false,
            }),
        }
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        let tried = self
            .ctx
            .tracker
            .take(&self.peer)
            .map(|s| s.tried)
            .unwrap_or_default();
        info!(
            "admitted {} after {} credential attempt(s)",
            self.peer,
            tried.len()
        );

        let sandbox = self.select_sandbox().await?;

        let geo = self.ctx.geo.lookup(&self.peer.ip().to_string()).await;
        if geo.tor_exit {
            info!("{} is a known Tor exit node", self.peer.ip());
        }

        let session_id = match self
            .ctx
            .audit
            .open_session(self.peer, &geo, &tried, &sandbox)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                // Without a session id nothing can be recorded safely.
                error!("could not open audit session for {}: {}", self.peer, e);
                self.ctx.runtime.stop(&sandbox).await;
                return Err(SessionError::from(e).into());
            }
        };
        let started_at = Instant::now();

        let keepalive = {
            let runtime = self.ctx.runtime.clone();
            let sandbox = sandbox.clone();
            let keep_alive = self.ctx.config.keep_alive();
            tokio::spawn(async move {
                tokio::time::sleep(keep_alive).await;
                info!("keep-alive expired, stopping sandbox {}", sandbox);
                runtime.stop(&sandbox).await;
            })
        };

        self.advance(Phase::BackendDialing);
        let backend = match self.ctx.runtime.reachable_address(&sandbox).await {
            Ok(addr) => {
                backend::dial(
                    &addr,
                    &self.ctx.config.sandbox_user,
                    &self.ctx.config.sandbox_password,
                )
                .await
            }
            Err(e) => Err(SessionError::Container(e)),
        };

        let backend = match backend {
            Ok(handle) => handle,
            Err(e) => {
                // The session row stays; it just carries no byte blocks.
                error!("backend dial for session {} failed: {}", session_id, e);
                keepalive.abort();
                self.ctx.runtime.stop(&sandbox).await;
                return Err(e.into());
            }
        };

        info!("session {} bridged {} -> {}", session_id, self.peer, sandbox);
        *self.state.lock().await = Some(SessionState {
            sandbox,
            session_id,
            started_at,
            backend: Some(backend),
            keepalive: Some(keepalive),
        });
        self.advance(Phase::Bridging);
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let backend_channel = {
            let guard = self.state.lock().await;
            let Some(state) = guard.as_ref() else {
                return Ok(false);
            };
            let Some(backend) = state.backend.as_ref() else {
                return Ok(false);
            };
            backend.channel_open_session().await
        };

        match backend_channel {
            Ok(backend_channel) => {
                self.bridge_channel(&channel, session, backend_channel).await;
                Ok(true)
            }
            Err(e) => {
                warn!("backend refused session channel: {}", e);
                Ok(false)
            }
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let backend_channel = {
            let guard = self.state.lock().await;
            let Some(state) = guard.as_ref() else {
                return Ok(false);
            };
            let Some(backend) = state.backend.as_ref() else {
                return Ok(false);
            };
            backend
                .channel_open_direct_tcpip(
                    host_to_connect,
                    port_to_connect,
                    originator_address,
                    originator_port,
                )
                .await
        };

        match backend_channel {
            Ok(backend_channel) => {
                self.bridge_channel(&channel, session, backend_channel).await;
                Ok(true)
            }
            Err(e) => {
                warn!("backend refused direct-tcpip channel: {}", e);
                Ok(false)
            }
        }
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(channel, ChannelOp::Data(data.to_vec())).await;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(
            channel,
            ChannelOp::Pty {
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
            },
        )
        .await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(channel, ChannelOp::Shell).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(channel, ChannelOp::Exec(data.to_vec())).await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(
            channel,
            ChannelOp::Env(variable_name.to_string(), variable_value.to_string()),
        )
        .await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(channel, ChannelOp::Subsystem(name.to_string()))
            .await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(
            channel,
            ChannelOp::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        )
        .await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(channel, ChannelOp::Eof).await;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the sender tells the bridge to wind the backend down.
        self.channels.remove(&channel);
        Ok(())
    }
}

/// Serves one inbound TCP connection end to end, then runs the cleanup
/// that must happen on every exit path: cancel the keep-alive timer,
/// disconnect the backend, stop the sandbox.
pub async fn serve_connection(
    ctx: Arc<ProxyContext>,
    russh_config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let handler = ProxyHandler::new(ctx.clone(), peer);
    let state = handler.session_state();

    match russh::server::run_stream(russh_config, stream, handler).await {
        Ok(session) => {
            if let Err(e) = session.await {
                debug!("SSH session from {} ended: {}", peer, e);
            }
        }
        Err(e) => {
            debug!("SSH handshake with {} failed: {}", peer, e);
        }
    }

    cleanup(&ctx, &state).await;
}

async fn cleanup(ctx: &ProxyContext, state: &Mutex<Option<SessionState>>) {
    let Some(state) = state.lock().await.take() else {
        return;
    };
    debug!("session {} draining", state.session_id);

    if let Some(keepalive) = state.keepalive {
        keepalive.abort();
    }
    if let Some(backend) = state.backend {
        let _ = backend
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await;
    }
    ctx.runtime.stop(&state.sandbox).await;
    info!("session {} closed", state.session_id);
}
