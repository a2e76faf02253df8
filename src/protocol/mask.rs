//! XOR payload masking (RFC 6455 Section 5.3).

/// Byte-by-byte XOR masking: `data[i] ^= mask[i % 4]`.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// XOR masking processing four bytes at a time via u32 operations, with a
/// scalar tail. Masking is an involution, so the same call unmasks.
#[inline]
pub fn apply_mask_fast(data: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);
    let (head, tail) = data.split_at_mut(data.len() & !3);

    for chunk in head.chunks_exact_mut(4) {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        chunk.copy_from_slice(&(word ^ mask_u32).to_ne_bytes());
    }
    for (i, byte) in tail.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}
