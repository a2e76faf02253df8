//! HTTP upgrade handshake (RFC 6455 Section 4).

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// The GUID appended to the client key when deriving `Sec-WebSocket-Accept`.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only supported protocol version.
pub const WS_VERSION: u8 = 13;

/// Headers whose duplication would be a smuggling vector; requests carrying
/// more than one are rejected outright.
const SINGLETON_HEADERS: &[&str] = &[
    "host",
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
];

/// Compute `Sec-WebSocket-Accept` from a `Sec-WebSocket-Key`:
/// `base64(SHA1(key || GUID))`.
///
/// ```
/// use websock::protocol::handshake::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Generate a random 16-byte `Sec-WebSocket-Key`.
#[must_use]
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    BASE64.encode(nonce)
}

/// Whether a comma-separated token list contains `token` case-insensitively
/// (RFC 7230 list syntax, as used by the `Connection` header).
fn header_has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

fn parse_headers<'a, I>(lines: I, singletons: &[&str]) -> Result<HashMap<String, String>>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Handshake(format!("malformed header line: {line}")))?;
        let name = name.trim().to_ascii_lowercase();
        if singletons.contains(&name.as_str()) && headers.contains_key(&name) {
            return Err(Error::Handshake(format!("duplicate header: {name}")));
        }
        headers.insert(name, value.trim().to_string());
    }
    Ok(headers)
}

fn check_header_value(name: &str, value: &str) -> Result<()> {
    if value.contains('\r') || value.contains('\n') {
        return Err(Error::Handshake(format!("CR/LF in {name} value")));
    }
    Ok(())
}

/// A parsed client upgrade request, as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Request target from the request line.
    pub path: String,
    /// `Host` header value.
    pub host: String,
    /// `Sec-WebSocket-Key` header value.
    pub key: String,
    /// Subprotocols offered via `Sec-WebSocket-Protocol`.
    pub protocols: Vec<String>,
    /// All request headers, lowercase names.
    pub headers: HashMap<String, String>,
}

impl HandshakeRequest {
    /// Build the upgrade request a client sends.
    pub fn build(path: &str, host_header: &str, key: &str, protocols: &[String]) -> Result<Vec<u8>> {
        check_header_value("Host", host_header)?;
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("GET {path} HTTP/1.1\r\n").as_bytes());
        out.extend_from_slice(format!("Host: {host_header}\r\n").as_bytes());
        out.extend_from_slice(b"Upgrade: websocket\r\n");
        out.extend_from_slice(b"Connection: Upgrade\r\n");
        out.extend_from_slice(format!("Sec-WebSocket-Key: {key}\r\n").as_bytes());
        out.extend_from_slice(format!("Sec-WebSocket-Version: {WS_VERSION}\r\n").as_bytes());
        if !protocols.is_empty() {
            let csv = protocols.join(", ");
            check_header_value("Sec-WebSocket-Protocol", &csv)?;
            out.extend_from_slice(format!("Sec-WebSocket-Protocol: {csv}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        Ok(out)
    }

    /// Parse and validate a client upgrade request.
    ///
    /// # Errors
    ///
    /// Returns `Error::Handshake` when the request is not a well-formed
    /// HTTP/1.1 GET upgrade: wrong method or version, missing or invalid
    /// `Upgrade`/`Connection`/`Host`/`Sec-WebSocket-Key`/
    /// `Sec-WebSocket-Version` headers, a key that does not decode to 16
    /// bytes, or a non-empty `Sec-WebSocket-Extensions` offer (extensions
    /// are not negotiated).
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text =
            std::str::from_utf8(data).map_err(|_| Error::Handshake("request is not UTF-8".into()))?;
        let mut lines = text.lines();

        let request_line = lines
            .next()
            .ok_or_else(|| Error::Handshake("empty request".into()))?;
        let mut parts = request_line.split_whitespace();
        let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(p), Some(v), None) => (m, p, v),
            _ => return Err(Error::Handshake(format!("malformed request line: {request_line}"))),
        };
        if method != "GET" {
            return Err(Error::Handshake(format!("method {method} is not GET")));
        }
        if version != "HTTP/1.1" {
            return Err(Error::Handshake(format!("version {version} is not HTTP/1.1")));
        }

        let headers = parse_headers(lines, SINGLETON_HEADERS)?;

        let upgrade = headers
            .get("upgrade")
            .ok_or_else(|| Error::Handshake("missing Upgrade header".into()))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(Error::Handshake(format!("Upgrade is {upgrade}, not websocket")));
        }

        let connection = headers
            .get("connection")
            .ok_or_else(|| Error::Handshake("missing Connection header".into()))?;
        if !header_has_token(connection, "upgrade") {
            return Err(Error::Handshake(format!(
                "Connection header lacks upgrade token: {connection}"
            )));
        }

        let version = headers
            .get("sec-websocket-version")
            .ok_or_else(|| Error::Handshake("missing Sec-WebSocket-Version header".into()))?;
        if version.trim() != WS_VERSION.to_string() {
            return Err(Error::Handshake(format!(
                "unsupported WebSocket version: {version}"
            )));
        }

        let host = headers
            .get("host")
            .ok_or_else(|| Error::Handshake("missing Host header".into()))?
            .clone();
        if host.is_empty() {
            return Err(Error::Handshake("empty Host header".into()));
        }

        let key = headers
            .get("sec-websocket-key")
            .ok_or_else(|| Error::Handshake("missing Sec-WebSocket-Key header".into()))?
            .clone();
        match BASE64.decode(&key) {
            Ok(decoded) if decoded.len() == 16 => {}
            Ok(decoded) => {
                return Err(Error::Handshake(format!(
                    "Sec-WebSocket-Key decodes to {} bytes, not 16",
                    decoded.len()
                )))
            }
            Err(_) => return Err(Error::Handshake("Sec-WebSocket-Key is not base64".into())),
        }

        // No extension is supported; a non-empty offer must be refused
        // rather than silently ignored.
        if let Some(extensions) = headers.get("sec-websocket-extensions") {
            if !extensions.trim().is_empty() {
                return Err(Error::Handshake(format!(
                    "extensions not supported: {extensions}"
                )));
            }
        }

        let protocols = headers
            .get("sec-websocket-protocol")
            .map(|p| p.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        Ok(Self {
            path: path.to_string(),
            host,
            key,
            protocols,
            headers,
        })
    }

    /// Pick the subprotocol to echo back: the first client-offered protocol
    /// the server accepts, or none.
    #[must_use]
    pub fn select_protocol(&self, accepted: &[String]) -> Option<String> {
        self.protocols
            .iter()
            .find(|offered| accepted.iter().any(|a| a == *offered))
            .cloned()
    }
}

/// The server's upgrade response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// `Sec-WebSocket-Accept` value.
    pub accept: String,
    /// Selected subprotocol, echoed back when present.
    pub protocol: Option<String>,
}

impl HandshakeResponse {
    /// Build the `101 Switching Protocols` response for a validated request.
    #[must_use]
    pub fn accept(request: &HandshakeRequest, protocol: Option<String>) -> Self {
        Self {
            accept: compute_accept_key(&request.key),
            protocol,
        }
    }

    /// Serialize the response.
    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        out.extend_from_slice(b"Upgrade: websocket\r\n");
        out.extend_from_slice(b"Connection: Upgrade\r\n");
        out.extend_from_slice(format!("Sec-WebSocket-Accept: {}\r\n", self.accept).as_bytes());
        if let Some(ref protocol) = self.protocol {
            check_header_value("Sec-WebSocket-Protocol", protocol)?;
            out.extend_from_slice(format!("Sec-WebSocket-Protocol: {protocol}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// The response written for a rejected upgrade.
    #[must_use]
    pub fn bad_request() -> &'static [u8] {
        b"HTTP/1.1 400 Bad Request\r\n\r\n"
    }

    /// Parse and validate the server response on the client side.
    ///
    /// # Errors
    ///
    /// Returns `Error::Handshake` unless the response is a 101 with
    /// `Upgrade: websocket`, a `Connection` list containing `upgrade`, and
    /// a `Sec-WebSocket-Accept` exactly matching the derivation from
    /// `sent_key`.
    pub fn parse(data: &[u8], sent_key: &str) -> Result<Self> {
        let text =
            std::str::from_utf8(data).map_err(|_| Error::Handshake("response is not UTF-8".into()))?;
        let mut lines = text.lines();

        let status_line = lines
            .next()
            .ok_or_else(|| Error::Handshake("empty response".into()))?;
        let mut parts = status_line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("HTTP/1.1"), Some("101")) => {}
            _ => {
                return Err(Error::Handshake(format!(
                    "expected 101 Switching Protocols, got: {status_line}"
                )))
            }
        }

        let headers = parse_headers(lines, &[])?;

        let upgrade = headers
            .get("upgrade")
            .ok_or_else(|| Error::Handshake("missing Upgrade header in response".into()))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(Error::Handshake(format!("Upgrade is {upgrade}, not websocket")));
        }

        let connection = headers
            .get("connection")
            .ok_or_else(|| Error::Handshake("missing Connection header in response".into()))?;
        if !header_has_token(connection, "upgrade") {
            return Err(Error::Handshake(format!(
                "Connection header lacks upgrade token: {connection}"
            )));
        }

        let accept = headers
            .get("sec-websocket-accept")
            .ok_or_else(|| Error::Handshake("missing Sec-WebSocket-Accept header".into()))?
            .clone();
        if accept != compute_accept_key(sent_key) {
            return Err(Error::Handshake("Sec-WebSocket-Accept mismatch".into()));
        }

        if let Some(extensions) = headers.get("sec-websocket-extensions") {
            if !extensions.trim().is_empty() {
                return Err(Error::Handshake(format!(
                    "server negotiated unsupported extensions: {extensions}"
                )));
            }
        }

        Ok(Self {
            accept,
            protocol: headers.get("sec-websocket-protocol").cloned(),
        })
    }
}
