//! Fixed-size bit arrays packed most-significant-bit first.
//!
//! Bit 0 is the high bit of byte 0, matching the on-disk cache bitmap. Indices past the
//! end of the slice panic, so callers clamp ranges before calling in.

/// Bits from position `i` (inclusive) to the end of a byte.
const LEFT_MASK: [u8; 8] = [0xFF, 0x7F, 0x3F, 0x1F, 0x0F, 0x07, 0x03, 0x01];
/// Bits from the start of a byte up to position `i` (inclusive).
const RIGHT_MASK: [u8; 8] = [0x80, 0xC0, 0xE0, 0xF0, 0xF8, 0xFC, 0xFE, 0xFF];

/// Number of bytes needed to hold `bit_count` bits.
pub fn byte_len(bit_count: u64) -> usize {
    bit_count.div_ceil(8) as usize
}

/// Allocate a zeroed bit array able to hold `bit_count` bits.
pub fn alloc(bit_count: u64) -> Vec<u8> {
    vec![0u8; byte_len(bit_count)]
}

fn one_bit(idx: u64) -> u8 {
    0x80 >> (idx % 8)
}

/// Return whether bit `idx` is set.
pub fn read_one(bits: &[u8], idx: u64) -> bool {
    bits[(idx / 8) as usize] & one_bit(idx) != 0
}

/// Apply `op` to every byte overlapping `[start, start + count)` with the mask of the bits
/// that fall inside the range.
fn for_each_masked(bits_len: usize, start: u64, count: u64, mut op: impl FnMut(usize, u8)) {
    if count == 0 {
        return;
    }
    let end = start + count - 1;
    let start_byte = (start / 8) as usize;
    let end_byte = (end / 8) as usize;
    debug_assert!(end_byte < bits_len, "bit range exceeds array");
    let start_bits = (start % 8) as usize;
    let end_bits = (end % 8) as usize;

    if start_byte == end_byte {
        op(start_byte, LEFT_MASK[start_bits] & RIGHT_MASK[end_bits]);
        return;
    }
    op(start_byte, LEFT_MASK[start_bits]);
    for byte in start_byte + 1..end_byte {
        op(byte, 0xFF);
    }
    op(end_byte, RIGHT_MASK[end_bits]);
}

/// Set `count` bits starting at `start`.
pub fn set_range(bits: &mut [u8], start: u64, count: u64) {
    let len = bits.len();
    for_each_masked(len, start, count, |byte, mask| bits[byte] |= mask);
}

/// Clear `count` bits starting at `start`.
pub fn clear_range(bits: &mut [u8], start: u64, count: u64) {
    let len = bits.len();
    for_each_masked(len, start, count, |byte, mask| bits[byte] &= !mask);
}

/// Count set bits in `[start, start + count)`.
pub fn count_range(bits: &[u8], start: u64, count: u64) -> u64 {
    let mut total = 0u64;
    for_each_masked(bits.len(), start, count, |byte, mask| {
        total += (bits[byte] & mask).count_ones() as u64;
    });
    total
}

fn find_bit(bits: &[u8], start: u64, limit: u64, want: bool) -> u64 {
    let skip = if want { 0x00 } else { 0xFF };
    let mut idx = start;

    while idx < limit && idx % 8 != 0 {
        if read_one(bits, idx) == want {
            return idx;
        }
        idx += 1;
    }
    while idx + 8 <= limit && bits[(idx / 8) as usize] == skip {
        idx += 8;
    }
    while idx < limit {
        if read_one(bits, idx) == want {
            return idx;
        }
        idx += 1;
    }
    limit
}

/// Index of the first set bit in `[start, limit)`, or `limit` if there is none.
pub fn find_set(bits: &[u8], start: u64, limit: u64) -> u64 {
    find_bit(bits, start, limit, true)
}

/// Index of the first clear bit in `[start, limit)`, or `limit` if there is none.
pub fn find_clear(bits: &[u8], start: u64, limit: u64) -> u64 {
    find_bit(bits, start, limit, false)
}
