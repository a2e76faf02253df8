//! WebSocket frame parsing and serialization (RFC 6455 Section 5.2).

use crate::error::{Error, Result};
use crate::protocol::mask::apply_mask_fast;
use crate::protocol::OpCode;

/// Maximum payload size for control frames.
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

/// Maximum close-reason length: control frame limit minus the 2-byte code.
pub const MAX_CLOSE_REASON: usize = MAX_CONTROL_FRAME_PAYLOAD - 2;

/// A single WebSocket frame.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
/// |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
/// |N|V|V|V|       |S|             |   (if payload len==126/127)   |
/// | |1|2|3|       |K|             |                               |
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |                         Masking key (if present)              |
/// +---------------------------------------------------------------+
/// |                         Payload data                          |
/// +---------------------------------------------------------------+
/// ```
///
/// Reserved bits are rejected at parse time: this library negotiates no
/// extensions, so RSV1-3 must always be zero on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Unmasked payload data.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame.
    #[must_use]
    pub fn new(fin: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin,
            opcode,
            payload,
        }
    }

    /// Create a single-frame text message.
    #[must_use]
    pub fn text(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Text, data.into())
    }

    /// Create a single-frame binary message.
    #[must_use]
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Binary, data.into())
    }

    /// Create a close frame. `None` yields an empty payload (no status on
    /// the wire); the reason is truncated to fit the control-frame limit.
    #[must_use]
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let payload = match code {
            Some(code) => {
                let mut data = code.to_be_bytes().to_vec();
                let mut cut = reason.len().min(MAX_CLOSE_REASON);
                while !reason.is_char_boundary(cut) {
                    cut -= 1;
                }
                data.extend_from_slice(&reason.as_bytes()[..cut]);
                data
            }
            None => Vec::new(),
        };
        Self::new(true, OpCode::Close, payload)
    }

    /// Create a ping frame.
    #[must_use]
    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Ping, data.into())
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Pong, data.into())
    }

    /// Parse one frame from `buf`, returning the frame, the number of bytes
    /// consumed, and whether the wire frame was masked.
    ///
    /// Masked payloads are unmasked in the returned frame.
    ///
    /// # Errors
    ///
    /// - `Error::IncompleteFrame` when the buffer does not yet hold a whole
    ///   frame (the caller reads more and retries)
    /// - `Error::ReservedBitsSet` when RSV1-3 are nonzero
    /// - `Error::ReservedOpcode` for opcodes 0x3-0x7 and 0xB-0xF
    /// - `Error::Protocol` when a 64-bit length has the high bit set
    pub fn parse(buf: &[u8]) -> Result<(Self, usize, bool)> {
        if buf.len() < 2 {
            return Err(Error::IncompleteFrame {
                needed: 2 - buf.len(),
            });
        }

        let byte0 = buf[0];
        let byte1 = buf[1];

        let fin = (byte0 & 0x80) != 0;
        if byte0 & 0x70 != 0 {
            return Err(Error::ReservedBitsSet);
        }
        let opcode = OpCode::from_u8(byte0 & 0x0F)?;

        let masked = (byte1 & 0x80) != 0;
        let len7 = byte1 & 0x7F;

        let (payload_len, header_len) = match len7 {
            0..=125 => (u64::from(len7), 2),
            126 => {
                if buf.len() < 4 {
                    return Err(Error::IncompleteFrame {
                        needed: 4 - buf.len(),
                    });
                }
                (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Err(Error::IncompleteFrame {
                        needed: 10 - buf.len(),
                    });
                }
                let len = u64::from_be_bytes([
                    buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
                ]);
                if len & (1 << 63) != 0 {
                    return Err(Error::Protocol(
                        "64-bit payload length with high bit set".into(),
                    ));
                }
                (len, 10)
            }
            _ => unreachable!(),
        };

        let payload_len = usize::try_from(payload_len).map_err(|_| Error::MessageTooBig {
            size: payload_len,
            max: usize::MAX as u64,
        })?;

        let mask_len = if masked { 4 } else { 0 };
        let total = header_len + mask_len + payload_len;
        if buf.len() < total {
            return Err(Error::IncompleteFrame {
                needed: total - buf.len(),
            });
        }

        let payload_start = header_len + mask_len;
        let mut payload = buf[payload_start..total].to_vec();
        if masked {
            let key = [
                buf[header_len],
                buf[header_len + 1],
                buf[header_len + 2],
                buf[header_len + 3],
            ];
            apply_mask_fast(&mut payload, key);
        }

        Ok((
            Frame {
                fin,
                opcode,
                payload,
            },
            total,
            masked,
        ))
    }

    /// Peek at a buffer and report how large the complete frame will be,
    /// without copying the payload. Used by the streaming reader to enforce
    /// limits before buffering.
    ///
    /// Returns `(payload_len, total_len, masked)`.
    ///
    /// # Errors
    ///
    /// Same header-level errors as [`Frame::parse`].
    pub fn peek_len(buf: &[u8]) -> Result<(u64, u64, bool)> {
        if buf.len() < 2 {
            return Err(Error::IncompleteFrame {
                needed: 2 - buf.len(),
            });
        }
        if buf[0] & 0x70 != 0 {
            return Err(Error::ReservedBitsSet);
        }
        OpCode::from_u8(buf[0] & 0x0F)?;

        let masked = (buf[1] & 0x80) != 0;
        let len7 = buf[1] & 0x7F;
        let (payload_len, header_len) = match len7 {
            0..=125 => (u64::from(len7), 2u64),
            126 => {
                if buf.len() < 4 {
                    return Err(Error::IncompleteFrame {
                        needed: 4 - buf.len(),
                    });
                }
                (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
            }
            _ => {
                if buf.len() < 10 {
                    return Err(Error::IncompleteFrame {
                        needed: 10 - buf.len(),
                    });
                }
                let len = u64::from_be_bytes([
                    buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
                ]);
                if len & (1 << 63) != 0 {
                    return Err(Error::Protocol(
                        "64-bit payload length with high bit set".into(),
                    ));
                }
                (len, 10)
            }
        };

        let mask_len = if masked { 4 } else { 0 };
        Ok((payload_len, header_len + mask_len + payload_len, masked))
    }

    /// Enforce the control-frame constraints of RFC 6455 Section 5.5.
    ///
    /// # Errors
    ///
    /// - `Error::FragmentedControlFrame` for a control frame with FIN=0
    /// - `Error::ControlFrameTooLarge` for a control payload over 125 bytes
    pub fn validate(&self) -> Result<()> {
        if self.opcode.is_control() {
            if !self.fin {
                return Err(Error::FragmentedControlFrame);
            }
            if self.payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
                return Err(Error::ControlFrameTooLarge(self.payload.len()));
            }
        }
        Ok(())
    }

    /// Serialize the frame into `out`, masking the payload when a key is
    /// given (client role). Returns the number of bytes written.
    pub fn write(&self, out: &mut Vec<u8>, mask: Option<[u8; 4]>) -> usize {
        let payload_len = self.payload.len();
        let start = out.len();

        let mut byte0 = self.opcode.as_u8();
        if self.fin {
            byte0 |= 0x80;
        }
        out.push(byte0);

        let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
        if payload_len <= 125 {
            out.push(mask_bit | payload_len as u8);
        } else if payload_len <= u16::MAX as usize {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(payload_len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(payload_len as u64).to_be_bytes());
        }

        if let Some(key) = mask {
            out.extend_from_slice(&key);
            let payload_start = out.len();
            out.extend_from_slice(&self.payload);
            apply_mask_fast(&mut out[payload_start..], key);
        } else {
            out.extend_from_slice(&self.payload);
        }

        out.len() - start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unmasked_text_frame() {
        // FIN=1, opcode=1 (text), unmasked, payload "Hello"
        let data = &[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f];
        let (frame, len, masked) = Frame::parse(data).unwrap();
        assert_eq!(len, 7);
        assert!(!masked);
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn test_parse_masked_text_frame() {
        // RFC 6455 Section 5.7: masked "Hello", key 0x37fa213d
        let data = &[
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let (frame, len, masked) = Frame::parse(data).unwrap();
        assert_eq!(len, 11);
        assert!(masked);
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn test_parse_extended_length_126() {
        let mut data = vec![0x82, 0x7e, 0x01, 0x00]; // 256 bytes
        data.extend(vec![0xab; 256]);
        let (frame, len, _) = Frame::parse(&data).unwrap();
        assert_eq!(len, 4 + 256);
        assert_eq!(frame.payload.len(), 256);
    }

    #[test]
    fn test_parse_extended_length_127() {
        let mut data = vec![0x82, 0x7f];
        data.extend(65536u64.to_be_bytes());
        data.extend(vec![0xcd; 65536]);
        let (frame, len, _) = Frame::parse(&data).unwrap();
        assert_eq!(len, 10 + 65536);
        assert_eq!(frame.payload.len(), 65536);
    }

    #[test]
    fn test_parse_length_high_bit_rejected() {
        let mut data = vec![0x82, 0x7f];
        data.extend(u64::MAX.to_be_bytes());
        assert!(matches!(Frame::parse(&data), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_parse_reserved_bits_rejected() {
        // FIN=1, RSV1=1, opcode=1
        let data = &[0xc1, 0x00];
        assert!(matches!(Frame::parse(data), Err(Error::ReservedBitsSet)));
    }

    #[test]
    fn test_parse_reserved_opcode_rejected() {
        for b0 in [0x83, 0x87, 0x8b, 0x8f] {
            let data = &[b0, 0x00];
            assert!(matches!(
                Frame::parse(data),
                Err(Error::ReservedOpcode(_))
            ));
        }
    }

    #[test]
    fn test_parse_incomplete() {
        assert!(matches!(
            Frame::parse(&[0x81]),
            Err(Error::IncompleteFrame { needed: 1 })
        ));
        assert!(matches!(
            Frame::parse(&[0x81, 0x05, 0x48]),
            Err(Error::IncompleteFrame { needed: 4 })
        ));
        assert!(matches!(
            Frame::parse(&[0x82, 0x7e, 0x01]),
            Err(Error::IncompleteFrame { needed: 1 })
        ));
        // Masked frame missing half its key
        assert!(matches!(
            Frame::parse(&[0x81, 0x85, 0x37, 0xfa]),
            Err(Error::IncompleteFrame { .. })
        ));
    }

    #[test]
    fn test_peek_len() {
        let data = &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let (payload_len, total, masked) = Frame::peek_len(data).unwrap();
        assert_eq!(payload_len, 5);
        assert_eq!(total, 11);
        assert!(masked);

        // Header alone is enough to size a 64-bit-length frame
        let mut data = vec![0x82, 0x7f];
        data.extend(100_000u64.to_be_bytes());
        let (payload_len, total, masked) = Frame::peek_len(&data).unwrap();
        assert_eq!(payload_len, 100_000);
        assert_eq!(total, 10 + 100_000);
        assert!(!masked);
    }

    #[test]
    fn test_validate_control_constraints() {
        let mut ping = Frame::ping(b"probe".to_vec());
        assert!(ping.validate().is_ok());

        ping.fin = false;
        assert!(matches!(
            ping.validate(),
            Err(Error::FragmentedControlFrame)
        ));

        let big = Frame::pong(vec![0u8; 126]);
        assert!(matches!(
            big.validate(),
            Err(Error::ControlFrameTooLarge(126))
        ));

        let fragment = Frame::new(false, OpCode::Text, b"Hel".to_vec());
        assert!(fragment.validate().is_ok());
    }

    #[test]
    fn test_write_unmasked() {
        let frame = Frame::text(b"Hello".to_vec());
        let mut out = Vec::new();
        let len = frame.write(&mut out, None);
        assert_eq!(len, 7);
        assert_eq!(out, [0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]);
    }

    #[test]
    fn test_write_masked() {
        let frame = Frame::text(b"Hello".to_vec());
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let mut out = Vec::new();
        let len = frame.write(&mut out, Some(mask));
        assert_eq!(len, 11);
        assert_eq!(out[0], 0x81);
        assert_eq!(out[1], 0x85);
        assert_eq!(&out[2..6], &mask);
        assert_eq!(&out[6..11], &[0x7f, 0x9f, 0x4d, 0x51, 0x58]);
    }

    #[test]
    fn test_write_extended_lengths() {
        let mut out = Vec::new();
        Frame::binary(vec![0u8; 126]).write(&mut out, None);
        assert_eq!(out[1], 0x7e);
        assert_eq!(&out[2..4], &126u16.to_be_bytes());

        let mut out = Vec::new();
        Frame::binary(vec![0u8; 65536]).write(&mut out, None);
        assert_eq!(out[1], 0x7f);
        assert_eq!(&out[2..10], &65536u64.to_be_bytes());
    }

    #[test]
    fn test_round_trip_boundary_lengths() {
        for len in [0usize, 125, 126, 127, 65535, 65536] {
            let original = Frame::binary(vec![0x5a; len]);
            let mut wire = Vec::new();
            original.write(&mut wire, None);
            let (parsed, consumed, _) = Frame::parse(&wire).unwrap();
            assert_eq!(consumed, wire.len(), "length {len}");
            assert_eq!(parsed, original, "length {len}");
        }
    }

    #[test]
    fn test_round_trip_masked() {
        let original = Frame::text(b"masked round trip".to_vec());
        let mut wire = Vec::new();
        original.write(&mut wire, Some([0x12, 0x34, 0x56, 0x78]));
        let (parsed, consumed, masked) = Frame::parse(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert!(masked);
        assert_eq!(parsed.payload, original.payload);
    }

    #[test]
    fn test_close_frame_payload() {
        let frame = Frame::close(Some(1000), "done");
        assert_eq!(u16::from_be_bytes([frame.payload[0], frame.payload[1]]), 1000);
        assert_eq!(&frame.payload[2..], b"done");

        let empty = Frame::close(None, "ignored");
        assert!(empty.payload.is_empty());
    }

    #[test]
    fn test_close_reason_truncated_at_char_boundary() {
        // 200 x '€' (3 bytes each); payload must stay within 125 bytes and
        // never split a code point.
        let reason = "€".repeat(200);
        let frame = Frame::close(Some(1001), &reason);
        assert!(frame.payload.len() <= MAX_CONTROL_FRAME_PAYLOAD);
        assert!(std::str::from_utf8(&frame.payload[2..]).is_ok());
    }
}
