//! Incremental UTF-8 validation for fragmented text messages.

use crate::error::{Error, Result};

/// Streaming UTF-8 validator.
///
/// Text messages may be split across frames at arbitrary byte offsets, so a
/// multi-byte sequence can straddle a fragment boundary. The validator keeps
/// the incomplete tail of each fragment and prepends it to the next one; on
/// the final fragment every sequence must be complete.
#[derive(Debug, Clone, Default)]
pub struct Utf8Validator {
    incomplete: [u8; 4],
    incomplete_len: usize,
}

impl Utf8Validator {
    /// Create a new validator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate one fragment. `is_final` marks the frame with FIN set.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUtf8` on an invalid sequence, or on a
    /// truncated sequence in the final fragment.
    pub fn validate(&mut self, data: &[u8], is_final: bool) -> Result<()> {
        let check: Vec<u8> = if self.incomplete_len > 0 {
            let mut combined = Vec::with_capacity(self.incomplete_len + data.len());
            combined.extend_from_slice(&self.incomplete[..self.incomplete_len]);
            combined.extend_from_slice(data);
            combined
        } else {
            data.to_vec()
        };
        self.incomplete_len = 0;

        match std::str::from_utf8(&check) {
            Ok(_) => Ok(()),
            Err(e) => {
                // error_len() of None marks a sequence truncated at the end
                // of the input, which is fine mid-message.
                if !is_final && e.error_len().is_none() {
                    let tail = &check[e.valid_up_to()..];
                    if tail.len() <= 4 {
                        self.incomplete[..tail.len()].copy_from_slice(tail);
                        self.incomplete_len = tail.len();
                        return Ok(());
                    }
                }
                Err(Error::InvalidUtf8)
            }
        }
    }
}

/// Validate a complete byte slice as UTF-8.
///
/// # Errors
///
/// Returns `Error::InvalidUtf8` when the slice is not valid UTF-8.
pub fn validate_utf8(data: &[u8]) -> Result<()> {
    std::str::from_utf8(data).map(|_| ()).map_err(Error::from)
}
