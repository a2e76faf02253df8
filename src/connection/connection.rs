use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncRead, AsyncReadExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;

use crate::codec::{FrameReader, FrameWriter};
use crate::connection::{Phase, Role};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::message::{CloseCode, WsStatus};
use crate::params::WsParameters;
use crate::protocol::{Frame, MessageAssembler, OpCode};
use crate::stream::MaybeTlsStream;

/// Payload carried by liveness pings.
const PING_PAYLOAD: &[u8] = b"keepalive";

/// Everything known about a connection at establishment time.
pub(crate) struct ConnectionInit {
    pub role: Role,
    pub secure: bool,
    pub peer_host: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub subprotocol: Option<String>,
    pub tls_protocol: Option<String>,
    pub params: WsParameters,
    /// Bytes read past the end of the handshake headers; they belong to the
    /// first frames.
    pub leftover: Vec<u8>,
}

struct Shared {
    phase: Phase,
    status: Option<WsStatus>,
    local_close: Option<(CloseCode, String)>,
}

struct Inner {
    role: Role,
    secure: bool,
    peer_host: String,
    path: String,
    headers: HashMap<String, String>,
    subprotocol: Option<String>,
    tls_protocol: Option<String>,
    params: WsParameters,
    shared: StdMutex<Shared>,
    writer: AsyncMutex<FrameWriter<WriteHalf<MaybeTlsStream>>>,
    /// Serializes outbound data messages so fragments of two messages never
    /// interleave. Control frames take only the writer lock and may slip
    /// between data frames.
    send_lock: AsyncMutex<()>,
}

/// A live WebSocket connection.
///
/// Cheaply cloneable handle; all clones refer to the same connection. The
/// inbound side runs in its own task and delivers events to the
/// [`Handler`]; the handle's send methods may be used concurrently from any
/// task while the connection is open.
#[derive(Clone)]
pub struct WsConnection {
    inner: Arc<Inner>,
}

impl WsConnection {
    /// Split the transport and build the connection handle plus the frame
    /// reader its inbound task will own. The handshake has already
    /// completed when this is called.
    pub(crate) fn establish(
        stream: MaybeTlsStream,
        init: ConnectionInit,
    ) -> (Self, FrameReader<ReadHalf<MaybeTlsStream>>) {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FrameReader::with_buffered(
            read_half,
            init.role,
            init.params.max_message_length(),
            init.leftover,
        );
        let writer = FrameWriter::new(write_half, init.role);
        let conn = Self {
            inner: Arc::new(Inner {
                role: init.role,
                secure: init.secure,
                peer_host: init.peer_host,
                path: init.path,
                headers: init.headers,
                subprotocol: init.subprotocol,
                tls_protocol: init.tls_protocol,
                params: init.params,
                shared: StdMutex::new(Shared {
                    phase: Phase::Open,
                    status: None,
                    local_close: None,
                }),
                writer: AsyncMutex::new(writer),
                send_lock: AsyncMutex::new(()),
            }),
        };
        (conn, reader)
    }

    /// The connection role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Whether the transport is TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.inner.secure
    }

    /// The peer host (client role: the host connected to; server role: the
    /// peer address).
    #[must_use]
    pub fn peer_host(&self) -> &str {
        &self.inner.peer_host
    }

    /// The request target: the path sent (client) or received (server).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// The upgrade request headers (server role; empty for clients).
    #[must_use]
    pub fn request_headers(&self) -> &HashMap<String, String> {
        &self.inner.headers
    }

    /// The negotiated subprotocol, if any.
    #[must_use]
    pub fn subprotocol(&self) -> Option<&str> {
        self.inner.subprotocol.as_deref()
    }

    /// The negotiated TLS protocol version, for secure transports.
    #[must_use]
    pub fn tls_protocol(&self) -> Option<&str> {
        self.inner.tls_protocol.as_deref()
    }

    /// The parameters this connection was created with.
    #[must_use]
    pub fn parameters(&self) -> &WsParameters {
        &self.inner.params
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.inner.shared.lock().unwrap().phase
    }

    /// Whether data can still be sent.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.phase() == Phase::Open
    }

    /// The terminal status, once the connection has closed.
    #[must_use]
    pub fn status(&self) -> Option<WsStatus> {
        self.inner.shared.lock().unwrap().status.clone()
    }

    /// Send a text message, fragmenting at the payload buffer length.
    ///
    /// # Errors
    ///
    /// `Error::NotOpen` unless the connection is open; otherwise transport
    /// errors.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_data(OpCode::Text, text.into().into_bytes()).await
    }

    /// Send a binary message, fragmenting at the payload buffer length.
    ///
    /// # Errors
    ///
    /// `Error::NotOpen` unless the connection is open; otherwise transport
    /// errors.
    pub async fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send_data(OpCode::Binary, data.into()).await
    }

    /// Send a message pulled from a streaming source. Frames are cut at the
    /// payload buffer length; the frame that observes end-of-stream carries
    /// the FIN flag.
    ///
    /// # Errors
    ///
    /// `Error::NotOpen` unless the connection is open; otherwise transport
    /// errors.
    pub async fn send_stream<R>(&self, is_text: bool, mut source: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let _guard = self.inner.send_lock.lock().await;
        if !self.phase().can_send() {
            return Err(Error::NotOpen);
        }

        let opcode = if is_text { OpCode::Text } else { OpCode::Binary };
        let chunk_len = self.inner.params.payload_buffer_length();

        let mut pending = read_chunk(&mut source, chunk_len).await?;
        let mut first = true;
        loop {
            let next = if pending.len() < chunk_len {
                Vec::new()
            } else {
                read_chunk(&mut source, chunk_len).await?
            };
            let fin = next.is_empty();
            let op = if first { opcode } else { OpCode::Continuation };
            first = false;
            self.write_data_frame(Frame::new(fin, op, pending)).await?;
            if fin {
                return Ok(());
            }
            pending = next;
        }
    }

    /// Send an unsolicited ping.
    ///
    /// # Errors
    ///
    /// `Error::NotOpen` unless the connection is open; otherwise transport
    /// errors.
    pub async fn ping(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        if !self.phase().can_send() {
            return Err(Error::NotOpen);
        }
        self.write_control(Frame::ping(payload.into())).await
    }

    /// Initiate the close handshake. Idempotent: only the first call sends
    /// a CLOSE frame; later calls (and calls on an already-closing
    /// connection) return `Ok` without effect. Use [`CloseCode::NoStatus`]
    /// to close without a status code on the wire.
    ///
    /// # Errors
    ///
    /// `Error::InvalidCloseCode` for codes that must not be sent
    /// (1004, 1006, 1015, or outside 1000-4999).
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        if code != CloseCode::NoStatus && !code.is_valid() {
            return Err(Error::InvalidCloseCode(code.as_u16()));
        }

        let initiate = {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.phase == Phase::Open {
                shared.phase = Phase::Closing;
                shared.local_close = Some((code, reason.to_string()));
                true
            } else {
                false
            }
        };
        if !initiate {
            return Ok(());
        }

        log::debug!("{} closing with {} \"{}\"", self.inner.peer_host, code, reason);
        let wire_code = match code {
            CloseCode::NoStatus => None,
            other => Some(other.as_u16()),
        };
        if let Err(e) = self.write_control(Frame::close(wire_code, reason)).await {
            log::warn!("{}: close frame not sent: {}", self.inner.peer_host, e);
        }
        Ok(())
    }

    async fn send_data(&self, opcode: OpCode, payload: Vec<u8>) -> Result<()> {
        let _guard = self.inner.send_lock.lock().await;
        if !self.phase().can_send() {
            return Err(Error::NotOpen);
        }

        let chunk_len = self.inner.params.payload_buffer_length();
        if payload.len() <= chunk_len {
            return self.write_data_frame(Frame::new(true, opcode, payload)).await;
        }

        let mut offset = 0;
        let mut first = true;
        while offset < payload.len() {
            let end = (offset + chunk_len).min(payload.len());
            let fin = end == payload.len();
            let op = if first { opcode } else { OpCode::Continuation };
            first = false;
            self.write_data_frame(Frame::new(fin, op, payload[offset..end].to_vec()))
                .await?;
            offset = end;
        }
        Ok(())
    }

    /// Write one data frame under the writer lock. The lock is released
    /// between fragments so control frames can interleave.
    async fn write_data_frame(&self, frame: Frame) -> Result<()> {
        if self.phase() == Phase::Closed {
            return Err(Error::NotOpen);
        }
        self.inner.writer.lock().await.write_frame(&frame).await
    }

    /// Write one control frame. Permitted while closing so pings received
    /// during the close handshake are still answered.
    async fn write_control(&self, frame: Frame) -> Result<()> {
        if self.phase() == Phase::Closed {
            return Err(Error::NotOpen);
        }
        self.inner.writer.lock().await.write_frame(&frame).await
    }

    fn local_close(&self) -> Option<(CloseCode, String)> {
        self.inner.shared.lock().unwrap().local_close.clone()
    }

    /// Inbound loop: owns the frame reader, drives the state machine, and
    /// delivers serialized handler events. `announce` is false for
    /// connections rejected at capacity, which skip `on_open`.
    pub(crate) async fn run(
        self,
        mut reader: FrameReader<ReadHalf<MaybeTlsStream>>,
        handler: Arc<dyn Handler>,
        registry: Arc<StdMutex<Vec<WsConnection>>>,
        announce: bool,
    ) {
        if announce {
            handler.on_open(&self).await;
        }

        let params = self.inner.params.clone();
        let mut assembler = MessageAssembler::new(params.max_message_length());
        let mut awaiting_pong = false;

        let status = loop {
            let frame = match timeout(params.connection_timeout(), reader.read_frame()).await {
                Err(_) => {
                    if params.ping() && !awaiting_pong && self.phase() == Phase::Open {
                        awaiting_pong = true;
                        if let Err(e) = self.write_control(Frame::ping(PING_PAYLOAD.to_vec())).await
                        {
                            break self.fail(&handler, e).await;
                        }
                        continue;
                    }
                    // Second silent deadline, or pings disabled: the peer is
                    // gone. GOING_AWAY goes out best-effort; the local record
                    // is ABNORMAL_CLOSURE, which never hits the wire.
                    log::debug!("{}: liveness timeout", self.inner.peer_host);
                    self.mark_closing();
                    let _ = self
                        .write_control(Frame::close(
                            Some(CloseCode::GoingAway.as_u16()),
                            "liveness timeout",
                        ))
                        .await;
                    break WsStatus::new(CloseCode::Abnormal, "liveness timeout", false, false);
                }
                Ok(Ok(frame)) => {
                    awaiting_pong = false;
                    frame
                }
                Ok(Err(e)) => break self.fail(&handler, e).await,
            };

            match frame.opcode {
                OpCode::Close => {
                    if let Err(e) = frame.validate() {
                        break self.fail(&handler, e).await;
                    }
                    match parse_close_payload(&frame.payload) {
                        Ok((peer_code, peer_reason)) => {
                            break self.on_close_frame(peer_code, peer_reason).await
                        }
                        Err(e) => break self.fail(&handler, e).await,
                    }
                }
                OpCode::Ping => {
                    if let Err(e) = frame.validate() {
                        break self.fail(&handler, e).await;
                    }
                    if let Err(e) = self.write_control(Frame::pong(frame.payload)).await {
                        break self.fail(&handler, e).await;
                    }
                }
                OpCode::Pong => {
                    if let Err(e) = frame.validate() {
                        break self.fail(&handler, e).await;
                    }
                    // Any inbound traffic already reset the liveness counter.
                }
                OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                    if self.phase() == Phase::Closing {
                        // Data arriving after the close handshake started is
                        // discarded; only control frames are honored.
                        continue;
                    }
                    match assembler.push(frame) {
                        Ok(Some(message)) => handler.on_message(&self, message).await,
                        Ok(None) => {}
                        Err(e) => break self.fail(&handler, e).await,
                    }
                }
            }
        };

        self.teardown(status, &handler, &registry).await;
    }

    /// Handle a CLOSE frame from the peer and produce the terminal status.
    async fn on_close_frame(
        &self,
        peer_code: Option<CloseCode>,
        peer_reason: String,
    ) -> WsStatus {
        let was_open = {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.phase == Phase::Open {
                shared.phase = Phase::Closing;
                true
            } else {
                false
            }
        };

        if was_open {
            // Peer initiated: echo its code (NORMAL_CLOSURE when it sent
            // none), then tear down.
            let echo = peer_code.unwrap_or(CloseCode::Normal);
            let _ = self
                .write_control(Frame::close(Some(echo.as_u16()), ""))
                .await;
            WsStatus::new(peer_code.unwrap_or(CloseCode::NoStatus), peer_reason, true, true)
        } else {
            // We initiated and this is the echo: our code is terminal.
            let (code, reason) = self
                .local_close()
                .unwrap_or((CloseCode::NoStatus, String::new()));
            WsStatus::new(code, reason, true, false)
        }
    }

    /// Error path: best-effort CLOSE for mappable errors, `on_error`
    /// notification, and the terminal status. Transport errors after the
    /// close handshake started are swallowed.
    async fn fail(&self, handler: &Arc<dyn Handler>, err: Error) -> WsStatus {
        let was_closing = self.phase() == Phase::Closing;
        let local = self.local_close();
        self.mark_closing();

        match err.close_code() {
            Some(code) => {
                let _ = self
                    .write_control(Frame::close(Some(code.as_u16()), &err.to_string()))
                    .await;
                handler.on_error(Some(self), &err).await;
                WsStatus::new(code, err.to_string(), false, false)
            }
            None => {
                // Transport-level failure: nothing goes on the wire.
                if was_closing {
                    // We sent CLOSE and the peer dropped the transport
                    // instead of echoing.
                    let (code, reason) =
                        local.unwrap_or((CloseCode::Abnormal, String::new()));
                    WsStatus::new(code, reason, false, false)
                } else {
                    handler.on_error(Some(self), &err).await;
                    WsStatus::new(CloseCode::Abnormal, err.to_string(), false, false)
                }
            }
        }
    }

    fn mark_closing(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        if shared.phase == Phase::Open {
            shared.phase = Phase::Closing;
        }
    }

    /// Release the transport, record the terminal status, deregister, and
    /// emit `on_close` exactly once.
    async fn teardown(
        &self,
        status: WsStatus,
        handler: &Arc<dyn Handler>,
        registry: &Arc<StdMutex<Vec<WsConnection>>>,
    ) {
        {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.phase == Phase::Closed {
                return;
            }
            shared.phase = Phase::Closed;
            shared.status = Some(status.clone());
        }

        if let Err(e) = self.inner.writer.lock().await.shutdown().await {
            log::trace!("{}: shutdown after close: {}", self.inner.peer_host, e);
        }

        registry
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(&c.inner, &self.inner));

        log::debug!("{} closed: {}", self.inner.peer_host, status);
        handler.on_close(self, status).await;
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("role", &self.inner.role)
            .field("peer_host", &self.inner.peer_host)
            .field("phase", &self.phase())
            .field("subprotocol", &self.inner.subprotocol)
            .finish_non_exhaustive()
    }
}

/// Read up to `len` bytes from a streaming source, short only at EOF.
async fn read_chunk<R: AsyncRead + Unpin>(source: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut chunk = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = source.read(&mut chunk[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    chunk.truncate(filled);
    Ok(chunk)
}

/// Parse a CLOSE payload into status code and reason.
fn parse_close_payload(payload: &[u8]) -> Result<(Option<CloseCode>, String)> {
    match payload.len() {
        0 => Ok((None, String::new())),
        1 => Err(Error::Protocol("close payload of one byte".into())),
        _ => {
            let raw = u16::from_be_bytes([payload[0], payload[1]]);
            let code = CloseCode::from_u16(raw);
            if !code.is_valid() {
                return Err(Error::InvalidCloseCode(raw));
            }
            let reason = std::str::from_utf8(&payload[2..])?.to_string();
            Ok((Some(code), reason))
        }
    }
}
