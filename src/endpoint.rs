//! The process-wide endpoint: client connects, server factories, and the
//! registry of live connections and servers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use url::Url;

use crate::connection::{ConnectionInit, Role, WsConnection};
use crate::stream::MaybeTlsStream;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::message::CloseCode;
use crate::params::WsParameters;
use crate::server::WsServer;
use crate::tls;
use crate::upgrade::client_upgrade;

#[derive(Default)]
struct TlsMaterial {
    key_file: Option<(PathBuf, String)>,
    trust_file: Option<(PathBuf, String)>,
}

struct EndpointInner {
    connections: Arc<StdMutex<Vec<WsConnection>>>,
    servers: Arc<StdMutex<Vec<WsServer>>>,
    tls: StdMutex<TlsMaterial>,
}

/// The WebSocket endpoint: a factory for outbound connections and listening
/// servers, and the registry of everything it created that is still alive.
///
/// Connections deregister themselves when their handler chain finishes;
/// servers deregister on close. [`WebSocket::close_all`] drains servers
/// first (each closes its children with `GOING_AWAY`), then any outbound
/// connections.
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<EndpointInner>,
}

impl Default for WebSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocket {
    /// Create an endpoint with no TLS material configured.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                connections: Arc::new(StdMutex::new(Vec::new())),
                servers: Arc::new(StdMutex::new(Vec::new())),
                tls: StdMutex::new(TlsMaterial::default()),
            }),
        }
    }

    /// Configure the PEM file (certificate chain plus private key) used by
    /// secure servers. The passphrase is kept for keystore formats that
    /// need one; PEM files are read as-is.
    pub fn set_key_file(&self, path: impl Into<PathBuf>, passphrase: impl Into<String>) {
        self.inner.tls.lock().unwrap().key_file = Some((path.into(), passphrase.into()));
    }

    /// Forget the configured key file.
    pub fn reset_key_file(&self) {
        self.inner.tls.lock().unwrap().key_file = None;
    }

    /// Configure the PEM trust store used to verify peers. When unset,
    /// clients verify against the bundled webpki roots.
    pub fn set_trust_store(&self, path: impl Into<PathBuf>, passphrase: impl Into<String>) {
        self.inner.tls.lock().unwrap().trust_file = Some((path.into(), passphrase.into()));
    }

    /// Start a plaintext server on `port`.
    ///
    /// # Errors
    ///
    /// I/O errors from binding the listener.
    pub async fn server(
        &self,
        port: u16,
        handler: Arc<dyn Handler>,
        params: WsParameters,
    ) -> Result<WsServer> {
        WsServer::start(port, handler, params, None, Arc::clone(&self.inner.servers)).await
    }

    /// Start a TLS server on `port` using the configured key file.
    ///
    /// # Errors
    ///
    /// `Error::Tls` when no key file is configured or it cannot be loaded;
    /// I/O errors from binding the listener.
    pub async fn secure_server(
        &self,
        port: u16,
        handler: Arc<dyn Handler>,
        params: WsParameters,
    ) -> Result<WsServer> {
        let config = {
            let material = self.inner.tls.lock().unwrap();
            let (key_file, _) = material
                .key_file
                .as_ref()
                .ok_or_else(|| Error::Tls("no key file configured".into()))?;
            let trust = material.trust_file.as_ref().map(|(path, _)| path.as_path());
            tls::server_config(key_file, trust, params.tls_parameters())?
        };
        WsServer::start(
            port,
            handler,
            params,
            Some(config),
            Arc::clone(&self.inner.servers),
        )
        .await
    }

    /// Open a client connection to a `ws://` or `wss://` URI.
    ///
    /// The host component is IDN-encoded, the default port is 80 or 443 by
    /// scheme, and the handshake (TCP connect, TLS, HTTP upgrade) runs
    /// under the handshake timeout. On success the connection is open,
    /// registered, and its handler has been scheduled.
    ///
    /// # Errors
    ///
    /// `Error::InvalidUri` for unparseable URIs or foreign schemes,
    /// `Error::Handshake` when the upgrade fails or times out, and
    /// transport-level `Error::Io`/`Error::Tls` otherwise.
    pub async fn connect(
        &self,
        uri: &str,
        handler: Arc<dyn Handler>,
        params: WsParameters,
    ) -> Result<WsConnection> {
        let url = Url::parse(uri).map_err(|e| Error::InvalidUri(format!("{uri}: {e}")))?;
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => return Err(Error::InvalidUri(format!("unsupported scheme: {other}"))),
        };
        // Url::host_str yields the punycode (IDN-encoded) host.
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUri("host required".into()))?
            .to_string();
        let default_port = if secure { 443 } else { 80 };
        let port = url.port().unwrap_or(default_port);
        let host_header = if port == default_port {
            host.clone()
        } else {
            format!("{host}:{port}")
        };
        let path = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };

        let tcp = timeout(
            params.handshake_timeout(),
            self.open_tcp(&host, port, &params),
        )
        .await
        .map_err(|_| Error::Handshake("connect timed out".into()))??;

        let mut tls_protocol = None;
        let mut socket = if secure {
            let trust = {
                let material = self.inner.tls.lock().unwrap();
                material.trust_file.as_ref().map(|(path, _)| path.clone())
            };
            let config = tls::client_config(trust.as_deref())?;
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| Error::Tls(format!("invalid server name: {host}")))?;
            let stream = timeout(
                params.handshake_timeout(),
                TlsConnector::from(config).connect(server_name, tcp),
            )
            .await
            .map_err(|_| Error::Handshake("TLS handshake timed out".into()))?
            .map_err(|e| Error::Tls(e.to_string()))?;
            tls_protocol = stream
                .get_ref()
                .1
                .protocol_version()
                .map(|v| format!("{v:?}"));
            MaybeTlsStream::ClientTls(Box::new(stream))
        } else {
            MaybeTlsStream::Plain(tcp)
        };

        let (subprotocol, leftover) = timeout(
            params.handshake_timeout(),
            client_upgrade(&mut socket, &path, &host_header, &params),
        )
        .await
        .map_err(|_| Error::Handshake("handshake timed out".into()))??;

        let (conn, reader) = WsConnection::establish(
            socket,
            ConnectionInit {
                role: Role::Client,
                secure,
                peer_host: host_header,
                path,
                headers: Default::default(),
                subprotocol,
                tls_protocol,
                params,
                leftover,
            },
        );

        self.inner.connections.lock().unwrap().push(conn.clone());
        log::debug!("connected to {uri}");
        tokio::spawn(conn.clone().run(
            reader,
            handler,
            Arc::clone(&self.inner.connections),
            true,
        ));
        Ok(conn)
    }

    async fn open_tcp(&self, host: &str, port: u16, params: &WsParameters) -> Result<TcpStream> {
        let mut last_err = None;
        let addrs = tokio::net::lookup_host((host, port)).await?;
        for addr in addrs {
            let result = match params.bind_address() {
                Some(bind_ip) => {
                    let socket = match addr {
                        SocketAddr::V4(_) => TcpSocket::new_v4()?,
                        SocketAddr::V6(_) => TcpSocket::new_v6()?,
                    };
                    socket.set_reuseaddr(true)?;
                    socket.bind(SocketAddr::new(bind_ip, 0))?;
                    socket.connect(addr).await
                }
                None => TcpStream::connect(addr).await,
            };
            match result {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .map(Error::from)
            .unwrap_or_else(|| Error::Io(format!("no addresses resolved for {host}:{port}"))))
    }

    /// Snapshot of the outbound connections this endpoint opened and still
    /// has alive. Server-side connections live in their server's list.
    #[must_use]
    pub fn list_connections(&self) -> Vec<WsConnection> {
        self.inner.connections.lock().unwrap().clone()
    }

    /// Snapshot of the live servers.
    #[must_use]
    pub fn list_servers(&self) -> Vec<WsServer> {
        self.inner.servers.lock().unwrap().clone()
    }

    /// Shut everything down: each server stops accepting and closes its
    /// children with `GOING_AWAY`, then every outbound connection gets the
    /// same treatment. In-flight handler callbacks run to completion.
    pub async fn close_all(&self, reason: &str) {
        for server in self.list_servers() {
            server.close(reason).await;
        }
        for conn in self.list_connections() {
            if let Err(e) = conn.close(CloseCode::GoingAway, reason).await {
                log::trace!("{}: close during shutdown: {}", conn.peer_host(), e);
            }
        }
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("connections", &self.inner.connections.lock().unwrap().len())
            .field("servers", &self.inner.servers.lock().unwrap().len())
            .finish()
    }
}
