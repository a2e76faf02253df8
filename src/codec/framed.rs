use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::connection::Role;
use crate::error::{Error, Result};
use crate::protocol::Frame;

const READ_CHUNK: usize = 8192;

/// Reads whole frames from the inbound half of a connection.
///
/// Enforces the role's masking expectation (a server only accepts masked
/// frames, a client only unmasked ones) and caps the per-frame payload at
/// the connection's message limit before buffering it.
pub struct FrameReader<R> {
    io: R,
    buf: BytesMut,
    role: Role,
    max_payload_len: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader for the given role and payload cap.
    #[must_use]
    pub fn new(io: R, role: Role, max_payload_len: u64) -> Self {
        Self::with_buffered(io, role, max_payload_len, Vec::new())
    }

    /// Create a reader whose buffer starts with bytes already read from the
    /// transport, e.g. frame data that arrived in the same segment as the
    /// tail of the handshake.
    #[must_use]
    pub fn with_buffered(io: R, role: Role, max_payload_len: u64, buffered: Vec<u8>) -> Self {
        let mut buf = BytesMut::with_capacity(READ_CHUNK.max(buffered.len()));
        buf.extend_from_slice(&buffered);
        Self {
            io,
            buf,
            role,
            max_payload_len,
        }
    }

    /// Read the next frame, growing the buffer as needed.
    ///
    /// # Errors
    ///
    /// - `Error::ConnectionClosed` on EOF
    /// - `Error::UnmaskedFrame` / `Error::MaskedFrame` on a masking
    ///   direction violation
    /// - `Error::MessageTooBig` when a single frame exceeds the cap
    /// - frame-level errors from [`Frame::parse`]
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            match Frame::peek_len(&self.buf) {
                Ok((payload_len, _, masked)) => {
                    match self.role {
                        Role::Server if !masked => return Err(Error::UnmaskedFrame),
                        Role::Client if masked => return Err(Error::MaskedFrame),
                        _ => {}
                    }
                    if payload_len > self.max_payload_len {
                        return Err(Error::MessageTooBig {
                            size: payload_len,
                            max: self.max_payload_len,
                        });
                    }
                }
                Err(Error::IncompleteFrame { .. }) => {}
                Err(e) => return Err(e),
            }

            match Frame::parse(&self.buf) {
                Ok((frame, consumed, _)) => {
                    self.buf.advance(consumed);
                    return Ok(frame);
                }
                Err(Error::IncompleteFrame { .. }) => {}
                Err(e) => return Err(e),
            }

            let n = self.io.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }
}

/// Writes whole frames to the outbound half of a connection.
///
/// In the client role every frame is masked with a fresh random 4-byte key;
/// in the server role frames are never masked.
pub struct FrameWriter<W> {
    io: W,
    buf: Vec<u8>,
    role: Role,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Create a writer for the given role.
    #[must_use]
    pub fn new(io: W, role: Role) -> Self {
        Self {
            io,
            buf: Vec::with_capacity(READ_CHUNK),
            role,
        }
    }

    /// Serialize and send one frame, flushing it to the transport.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mask = if self.role.must_mask() {
            Some(rand::random::<[u8; 4]>())
        } else {
            None
        };

        self.buf.clear();
        frame.write(&mut self.buf, mask);
        self.io.write_all(&self.buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Shut down the outbound half of the transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}
