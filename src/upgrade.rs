//! Driving the HTTP upgrade over a live transport.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::params::WsParameters;
use crate::protocol::handshake::{generate_key, HandshakeRequest, HandshakeResponse};

/// Upper bound on the HTTP head of a handshake.
const MAX_HANDSHAKE: usize = 8192;

/// Read until the end of the HTTP header block (CRLF CRLF). Returns the
/// head including the terminator and any bytes read past it, which belong
/// to the first frames.
async fn read_http_head<S>(io: &mut S) -> Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HANDSHAKE {
            return Err(Error::Handshake("header block too large".into()));
        }
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Handshake("connection closed during handshake".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Run the server side of the upgrade: read and validate the request,
/// select a subprotocol, answer 101. A malformed request is answered with
/// 400 before the error is returned.
///
/// Returns the parsed request, the selected subprotocol, and leftover
/// frame bytes.
pub(crate) async fn server_upgrade<S>(
    io: &mut S,
    params: &WsParameters,
) -> Result<(HandshakeRequest, Option<String>, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, leftover) = read_http_head(io).await?;
    let request = match HandshakeRequest::parse(&head) {
        Ok(request) => request,
        Err(e) => {
            let _ = io.write_all(HandshakeResponse::bad_request()).await;
            let _ = io.flush().await;
            return Err(e);
        }
    };

    let protocol = request.select_protocol(params.subprotocols());
    let response = HandshakeResponse::accept(&request, protocol.clone());
    let mut out = Vec::with_capacity(192);
    response.write(&mut out)?;
    io.write_all(&out).await?;
    io.flush().await?;
    Ok((request, protocol, leftover))
}

/// Run the client side of the upgrade: send the request, validate the 101
/// response and its accept key.
///
/// Returns the subprotocol the server selected and leftover frame bytes.
pub(crate) async fn client_upgrade<S>(
    io: &mut S,
    path: &str,
    host_header: &str,
    params: &WsParameters,
) -> Result<(Option<String>, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let request = HandshakeRequest::build(path, host_header, &key, params.subprotocols())?;
    io.write_all(&request).await?;
    io.flush().await?;

    let (head, leftover) = read_http_head(io).await?;
    let response = HandshakeResponse::parse(&head, &key)?;

    if let Some(ref selected) = response.protocol {
        if !params.subprotocols().iter().any(|p| p == selected) {
            return Err(Error::Handshake(format!(
                "server selected unoffered subprotocol: {selected}"
            )));
        }
    }
    Ok((response.protocol, leftover))
}
