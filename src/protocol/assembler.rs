//! Reassembly of fragmented messages with ordering and size enforcement.

use crate::error::{Error, Result};
use crate::message::Message;
use crate::protocol::utf8::Utf8Validator;
use crate::protocol::{Frame, OpCode};

/// Reassembles data frames into complete messages.
///
/// Enforces the RFC 6455 fragmentation rules: a message starts with TEXT or
/// BINARY, every further fragment is CONTINUATION, and a new data message
/// may not start while one is in progress. Text payloads are UTF-8
/// validated incrementally, and the cumulative size is capped.
pub struct MessageAssembler {
    buffer: Vec<u8>,
    opcode: Option<OpCode>,
    utf8: Option<Utf8Validator>,
    max_message_length: u64,
}

impl MessageAssembler {
    /// Create an assembler with the given cumulative size cap.
    #[must_use]
    pub fn new(max_message_length: u64) -> Self {
        Self {
            buffer: Vec::new(),
            opcode: None,
            utf8: None,
            max_message_length,
        }
    }

    /// Feed one data frame. Returns the complete message when the frame has
    /// FIN set, `None` while the message is still in progress.
    ///
    /// # Errors
    ///
    /// - `Error::Protocol` on a fragmentation-order violation
    /// - `Error::MessageTooBig` when the cumulative size exceeds the cap
    /// - `Error::InvalidUtf8` for bad text payloads
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.opcode {
            OpCode::Continuation => {
                if self.opcode.is_none() {
                    return Err(Error::Protocol("continuation with no message in progress".into()));
                }
            }
            OpCode::Text | OpCode::Binary => {
                if self.opcode.is_some() {
                    return Err(Error::Protocol("new data frame while a message is in progress".into()));
                }
                self.opcode = Some(frame.opcode);
                if frame.opcode == OpCode::Text {
                    self.utf8 = Some(Utf8Validator::new());
                }
            }
            _ => {
                return Err(Error::Protocol(format!(
                    "{} frame fed to message assembler",
                    frame.opcode
                )))
            }
        }

        let new_size = self.buffer.len() as u64 + frame.payload.len() as u64;
        if new_size > self.max_message_length {
            return Err(Error::MessageTooBig {
                size: new_size,
                max: self.max_message_length,
            });
        }

        if let Some(ref mut validator) = self.utf8 {
            validator.validate(&frame.payload, frame.fin)?;
        }

        self.buffer.extend_from_slice(&frame.payload);

        if frame.fin {
            let payload = std::mem::take(&mut self.buffer);
            let opcode = self.opcode.take().unwrap();
            self.utf8 = None;
            let message = match opcode {
                OpCode::Text => {
                    // Already validated incrementally.
                    Message::Text(String::from_utf8(payload).map_err(|_| Error::InvalidUtf8)?)
                }
                _ => Message::Binary(payload),
            };
            Ok(Some(message))
        } else {
            Ok(None)
        }
    }

    /// Whether a message is partially assembled.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.opcode.is_some()
    }
}
