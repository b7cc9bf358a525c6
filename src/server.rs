use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::connection::ConnectionTracker;
use crate::credentials::CredentialManager;
use crate::error::{ProxyError, ProxyResult};
use crate::handler::RequestHandler;
use crate::net::tune_socket;
use crate::pool::ConnectionPool;
use crate::tunnel::TunnelClient;

/// Everything a request handler needs, shared by all connections.
pub struct ProxyServices {
    pub config: Arc<ProxyConfig>,
    pub credentials: Arc<CredentialManager>,
    pub pool: Arc<ConnectionPool>,
    pub tunnel: TunnelClient,
}

impl ProxyServices {
    pub fn new(
        config: Arc<ProxyConfig>,
        credentials: Arc<CredentialManager>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        let tunnel = TunnelClient::new(&config);
        Self {
            config,
            credentials,
            pool,
            tunnel,
        }
    }
}

enum State {
    Idle,
    Listening {
        local_addr: SocketAddr,
        shutdown: CancellationToken,
        accept_loop: JoinHandle<()>,
    },
    Stopped,
}

/// Accepts local connections and hands each to its own handler task.
pub struct ProxyServer {
    services: Arc<ProxyServices>,
    connections: ConnectionTracker,
    state: State,
}

impl ProxyServer {
    pub fn new(services: Arc<ProxyServices>) -> Self {
        Self {
            services,
            connections: ConnectionTracker::new(),
            state: State::Idle,
        }
    }

    /// Log in, bind the listener and start accepting. Returns the bound
    /// address.
    pub async fn start(&mut self) -> ProxyResult<SocketAddr> {
        if !matches!(self.state, State::Idle) {
            return Err(ProxyError::AlreadyStarted);
        }

        // fail fast on a bad identity before accepting anything
        self.services.credentials.authenticate().await?;

        let listener = TcpListener::bind(self.services.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.services),
            self.connections.clone(),
            shutdown.clone(),
        ));

        self.state = State::Listening {
            local_addr,
            shutdown,
            accept_loop,
        };
        Ok(local_addr)
    }

    /// Stop accepting and release the listener. Connections already being
    /// served run to completion.
    pub async fn stop(&mut self) {
        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Listening {
                local_addr,
                shutdown,
                accept_loop,
            } => {
                shutdown.cancel();
                if let Err(e) = accept_loop.await {
                    warn!("Accept loop ended abnormally: {}", e);
                }
                info!("Stopped listening on {}", local_addr);
            }
            State::Idle | State::Stopped => debug!("Server is not listening"),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connections.active_count()
    }
}

async fn accept_loop(
    listener: TcpListener,
    services: Arc<ProxyServices>,
    connections: ConnectionTracker,
    shutdown: CancellationToken,
) {
    let buffer_size = services.config.server_socket_buffer_size;
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Accept loop cancelled");
                return;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = tune_socket(&stream, buffer_size) {
                    debug!(%peer, "Socket tuning failed: {}", e);
                }

                let mut handler = RequestHandler::new(Arc::clone(&services));
                if let Err(e) = handler.bind(stream, peer) {
                    warn!(%peer, "Cannot bind handler: {}", e);
                    continue;
                }

                let guard = connections.guard();
                tokio::spawn(async move {
                    let _guard = guard;
                    handler.handle_request().await;
                });
            }
            Err(e) => {
                warn!("Accept error: {} (continuing)", e);
            }
        }
    }
}
