//! Connection and server parameters.

use std::net::IpAddr;
use std::time::Duration;

/// Smallest permitted outbound fragment size. A payload buffer below the
/// control-frame limit would produce pathological fragmentation.
pub const MIN_PAYLOAD_BUFFER_LENGTH: usize = 125;

/// Default maximum number of simultaneous server-side connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// TLS negotiation options applied to secure servers.
///
/// Client certificates are only verified when a trust store has been
/// configured on the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlsParameters {
    /// Require a client certificate; handshake fails without one.
    pub need_client_auth: bool,
    /// Request a client certificate but proceed without one.
    pub want_client_auth: bool,
}

/// Parameters governing handshakes, timeouts, limits, and the accept loop.
///
/// Cloneable value object; each connection and server takes its own copy at
/// creation time, so later mutation does not affect live connections.
#[derive(Debug, Clone)]
pub struct WsParameters {
    handshake_timeout: Duration,
    connection_timeout: Duration,
    ping: bool,
    max_message_length: u64,
    payload_buffer_length: usize,
    backlog: u32,
    max_connections: usize,
    subprotocols: Vec<String>,
    bind_address: Option<IpAddr>,
    tls: TlsParameters,
}

impl Default for WsParameters {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(60),
            ping: true,
            max_message_length: 1024 * 1024,
            payload_buffer_length: 16 * 1024,
            backlog: 20,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            subprotocols: Vec::new(),
            bind_address: None,
            tls: TlsParameters::default(),
        }
    }
}

impl WsParameters {
    /// Create parameters with the defaults above.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handshake read deadline.
    ///
    /// The `ping` argument exists for symmetry with
    /// [`set_connection_timeout`](Self::set_connection_timeout) and is not
    /// applied; the ping policy is governed solely by the connection
    /// timeout setter.
    pub fn set_handshake_timeout(&mut self, timeout: Duration, _ping: bool) -> &mut Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the per-read connection deadline and whether the deadline
    /// triggers the ping/pong liveness probe instead of tearing down.
    pub fn set_connection_timeout(&mut self, timeout: Duration, ping: bool) -> &mut Self {
        self.connection_timeout = timeout;
        self.ping = ping;
        self
    }

    /// Set the maximum reassembled inbound message length in bytes.
    pub fn set_max_message_length(&mut self, len: u64) -> &mut Self {
        self.max_message_length = len;
        self
    }

    /// Set the outbound fragmentation threshold in bytes. Values below
    /// [`MIN_PAYLOAD_BUFFER_LENGTH`] are clamped.
    pub fn set_payload_buffer_length(&mut self, len: usize) -> &mut Self {
        self.payload_buffer_length = len.max(MIN_PAYLOAD_BUFFER_LENGTH);
        self
    }

    /// Set the listen backlog for servers.
    pub fn set_backlog(&mut self, backlog: u32) -> &mut Self {
        self.backlog = backlog;
        self
    }

    /// Set the maximum number of simultaneous server-side connections.
    pub fn set_max_connections(&mut self, max: usize) -> &mut Self {
        self.max_connections = max.max(1);
        self
    }

    /// Set the subprotocols offered (client) or accepted (server).
    pub fn set_subprotocols<I, S>(&mut self, subprotocols: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    /// Bind listeners and outbound sockets to a specific local address.
    pub fn set_bind_address(&mut self, addr: Option<IpAddr>) -> &mut Self {
        self.bind_address = addr;
        self
    }

    /// Set TLS negotiation options for secure servers.
    pub fn set_tls_parameters(&mut self, tls: TlsParameters) -> &mut Self {
        self.tls = tls;
        self
    }

    /// The handshake read deadline.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// The per-read connection deadline.
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// Whether a read deadline triggers a ping probe.
    #[must_use]
    pub fn ping(&self) -> bool {
        self.ping
    }

    /// The maximum reassembled inbound message length.
    #[must_use]
    pub fn max_message_length(&self) -> u64 {
        self.max_message_length
    }

    /// The outbound fragmentation threshold.
    #[must_use]
    pub fn payload_buffer_length(&self) -> usize {
        self.payload_buffer_length
    }

    /// The listen backlog.
    #[must_use]
    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    /// The maximum number of simultaneous server-side connections.
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// The subprotocols offered or accepted.
    #[must_use]
    pub fn subprotocols(&self) -> &[String] {
        &self.subprotocols
    }

    /// The local bind address, if any.
    #[must_use]
    pub fn bind_address(&self) -> Option<IpAddr> {
        self.bind_address
    }

    /// The TLS negotiation options.
    #[must_use]
    pub fn tls_parameters(&self) -> TlsParameters {
        self.tls
    }
}
