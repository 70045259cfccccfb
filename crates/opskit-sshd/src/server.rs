//! Test server lifecycle and accept loop

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handler::{ConnectionHandler, Login};

/// Lifecycle of a [`TestServer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Starting,
    Listening,
    Stopping,
    Stopped,
}

#[derive(Debug)]
struct Lifecycle {
    state: ServerState,
    local_addr: Option<SocketAddr>,
    cancel: Option<CancellationToken>,
    accept_task: Option<JoinHandle<()>>,
}

/// Minimal SSH server serving `exec` and `shell` against a fixed command table
///
/// Start and stop are serialized by an internal lock. `stop` is idempotent,
/// and a stopped server may be started again.
#[derive(Debug)]
pub struct TestServer {
    config: ServerConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl TestServer {
    /// Create a server; nothing is bound until [`TestServer::start`]
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::NotStarted,
                local_addr: None,
                cancel: None,
                accept_task: None,
            }),
        }
    }

    /// Bind the listening socket and start accepting connections
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 was requested.
    ///
    /// # Errors
    /// `AlreadyRunning` unless the server is `NotStarted` or `Stopped`;
    /// `HostKey` or `Bind` if setup fails, in which case the previous state
    /// is restored.
    #[instrument(skip(self), fields(bind = %self.config.bind_addr))]
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;

        let previous = lifecycle.state;
        if !matches!(previous, ServerState::NotStarted | ServerState::Stopped) {
            return Err(ServerError::AlreadyRunning(previous));
        }
        lifecycle.state = ServerState::Starting;

        let (listener, addr, russh_config) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                lifecycle.state = previous;
                return Err(e);
            }
        };

        let login = Arc::new(Login {
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        });
        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::new(russh_config),
            login,
            cancel.clone(),
        ));

        lifecycle.state = ServerState::Listening;
        lifecycle.local_addr = Some(addr);
        lifecycle.cancel = Some(cancel);
        lifecycle.accept_task = Some(accept_task);

        info!(addr = %addr, "test server listening");
        Ok(addr)
    }

    async fn bind(&self) -> Result<(TcpListener, SocketAddr, russh::server::Config), ServerError> {
        let russh_config = self.config.russh_config()?;

        let bind_error = |source| ServerError::Bind {
            addr: self.config.bind_addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(bind_error)?;
        let addr = listener.local_addr().map_err(bind_error)?;

        Ok((listener, addr, russh_config))
    }

    /// Stop accepting connections and release the listening socket
    ///
    /// Channels already in flight are left to finish. Calling this when no
    /// listener is active succeeds without changing anything.
    ///
    /// # Errors
    /// Currently infallible; the `Result` keeps the signature stable
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;

        let (Some(cancel), Some(accept_task)) =
            (lifecycle.cancel.take(), lifecycle.accept_task.take())
        else {
            debug!(state = ?lifecycle.state, "stop requested with no active listener");
            return Ok(());
        };

        lifecycle.state = ServerState::Stopping;
        cancel.cancel();

        if let Err(e) = accept_task.await {
            warn!(error = %e, "accept loop ended abnormally");
        }

        lifecycle.state = ServerState::Stopped;
        lifecycle.local_addr = None;
        info!("test server stopped");
        Ok(())
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ServerState {
        self.lifecycle.lock().await.state
    }

    /// Bound address while listening
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.local_addr
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(cancel) = self.lifecycle.get_mut().cancel.take() {
            cancel.cancel();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<russh::server::Config>,
    login: Arc<Login>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "accepted connection");
                    let handler = ConnectionHandler::new(peer, Arc::clone(&login), cancel.clone());
                    tokio::spawn(serve_connection(Arc::clone(&config), stream, peer, handler));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }

    drop(listener);
    debug!("accept loop exited, listener closed");
}

async fn serve_connection(
    config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
    handler: ConnectionHandler,
) {
    match russh::server::run_stream(config, stream, handler).await {
        Ok(session) => {
            if let Err(e) = session.await {
                debug!(peer = %peer, error = %e, "session ended with error");
            }
        }
        Err(e) => warn!(peer = %peer, error = %e, "SSH handshake failed"),
    }
    debug!(peer = %peer, "connection closed");
}
