//! Listening socket, accept loop, and per-socket upgrade workers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::connection::{ConnectionInit, Role, WsConnection};
use crate::stream::MaybeTlsStream;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::message::CloseCode;
use crate::params::WsParameters;
use crate::upgrade::server_upgrade;

struct ServerInner {
    local_addr: SocketAddr,
    secure: bool,
    params: WsParameters,
    handler: Arc<dyn Handler>,
    running: AtomicBool,
    shutdown: StdMutex<Option<oneshot::Sender<()>>>,
    connections: Arc<StdMutex<Vec<WsConnection>>>,
    servers: Arc<StdMutex<Vec<WsServer>>>,
}

/// A listening WebSocket server.
///
/// Cheaply cloneable handle. The accept loop runs in its own task; each
/// accepted socket gets a worker that performs the TLS accept (when
/// secure), the upgrade handshake, the capacity check, and then runs the
/// connection machine. A server that hits an accept error while running
/// reports it via `on_error(None, ..)` and stops; it does not restart.
#[derive(Clone)]
pub struct WsServer {
    inner: Arc<ServerInner>,
}

impl WsServer {
    pub(crate) async fn start(
        port: u16,
        handler: Arc<dyn Handler>,
        params: WsParameters,
        tls_config: Option<Arc<ServerConfig>>,
        servers: Arc<StdMutex<Vec<WsServer>>>,
    ) -> Result<Self> {
        let bind_ip = params
            .bind_address()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let bind_addr = SocketAddr::new(bind_ip, port);
        let socket = match bind_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(bind_addr)?;
        let listener = socket.listen(params.backlog())?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = Self {
            inner: Arc::new(ServerInner {
                local_addr,
                secure: tls_config.is_some(),
                params,
                handler,
                running: AtomicBool::new(true),
                shutdown: StdMutex::new(Some(shutdown_tx)),
                connections: Arc::new(StdMutex::new(Vec::new())),
                servers,
            }),
        };

        server
            .inner
            .servers
            .lock()
            .unwrap()
            .push(server.clone());

        let acceptor = tls_config.map(TlsAcceptor::from);
        tokio::spawn(server.clone().accept_loop(listener, acceptor, shutdown_rx));

        log::debug!(
            "{} server listening on {}",
            if server.inner.secure { "wss" } else { "ws" },
            local_addr
        );
        Ok(server)
    }

    /// The address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The bound port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// Whether this server terminates TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.inner.secure
    }

    /// Whether the accept loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Snapshot of this server's live connections.
    #[must_use]
    pub fn list_connections(&self) -> Vec<WsConnection> {
        self.inner.connections.lock().unwrap().clone()
    }

    /// Stop accepting and close every live child connection with
    /// `GOING_AWAY` and the given reason.
    pub async fn close(&self, reason: &str) {
        self.stop_accepting();
        let children = self.list_connections();
        for conn in children {
            if let Err(e) = conn.close(CloseCode::GoingAway, reason).await {
                log::trace!("{}: close during shutdown: {}", conn.peer_host(), e);
            }
        }
        self.deregister();
    }

    fn stop_accepting(&self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(tx) = self.inner.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    fn deregister(&self) {
        self.inner
            .servers
            .lock()
            .unwrap()
            .retain(|s| !Arc::ptr_eq(&s.inner, &self.inner));
    }

    async fn accept_loop(
        self,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => break,

                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            server.handle_socket(stream, peer, acceptor).await;
                        });
                    }
                    Err(e) => {
                        if self.is_running() {
                            let err = Error::from(e);
                            log::warn!("accept failed on {}: {}", self.inner.local_addr, err);
                            self.inner.handler.on_error(None, &err).await;
                            self.stop_accepting();
                            self.deregister();
                        }
                        break;
                    }
                },
            }
        }
    }

    async fn handle_socket(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: Option<TlsAcceptor>,
    ) {
        match self.upgrade_socket(stream, peer, acceptor).await {
            Ok(()) => {}
            Err(Error::Handshake(msg)) => {
                log::debug!("{peer}: handshake rejected: {msg}");
                self.inner
                    .handler
                    .on_error(None, &Error::Handshake(msg))
                    .await;
            }
            Err(e) => {
                log::debug!("{peer}: {e}");
                self.inner.handler.on_error(None, &e).await;
            }
        }
    }

    async fn upgrade_socket(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<()> {
        let params = self.inner.params.clone();

        let mut tls_protocol = None;
        let mut socket = match acceptor {
            Some(acceptor) => {
                let accepted = timeout(params.handshake_timeout(), acceptor.accept(stream))
                    .await
                    .map_err(|_| Error::Handshake("TLS accept timed out".into()))?
                    .map_err(|e| Error::Tls(e.to_string()))?;
                tls_protocol = accepted
                    .get_ref()
                    .1
                    .protocol_version()
                    .map(|v| format!("{v:?}"));
                MaybeTlsStream::ServerTls(Box::new(accepted))
            }
            None => MaybeTlsStream::Plain(stream),
        };

        let (request, protocol, leftover) =
            timeout(params.handshake_timeout(), server_upgrade(&mut socket, &params))
                .await
                .map_err(|_| Error::Handshake("handshake timed out".into()))??;

        let (conn, reader) = WsConnection::establish(
            socket,
            ConnectionInit {
                role: Role::Server,
                secure: self.inner.secure,
                peer_host: peer.to_string(),
                path: request.path.clone(),
                headers: request.headers.clone(),
                subprotocol: protocol,
                tls_protocol,
                params: params.clone(),
                leftover,
            },
        );

        let at_capacity = {
            let mut children = self.inner.connections.lock().unwrap();
            if children.len() >= params.max_connections() {
                true
            } else {
                children.push(conn.clone());
                false
            }
        };

        let handler = Arc::clone(&self.inner.handler);
        let registry = Arc::clone(&self.inner.connections);
        if at_capacity {
            log::debug!("{peer}: at capacity, refusing with 1013");
            let _ = conn.close(CloseCode::TryAgainLater, "try again later").await;
            tokio::spawn(conn.run(reader, handler, registry, false));
        } else {
            log::debug!("{peer}: connection open (path {})", request.path);
            tokio::spawn(conn.run(reader, handler, registry, true));
        }
        Ok(())
    }
}

impl std::fmt::Debug for WsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer")
            .field("local_addr", &self.inner.local_addr)
            .field("secure", &self.inner.secure)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
