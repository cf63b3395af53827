//! Integer to text conversion into caller-owned storage.
//!
//! `format!` and friends are off limits in the signal handler, so output
//! numbers are rendered by hand into fixed arrays.

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Length of a rendered hex number: `0x` plus 16 digits.
pub const HEX_LEN: usize = 18;

/// Minimum width of a rendered decimal number, zero padded.
pub const DEC_WIDTH: usize = 10;

/// Room for the widest u64 in decimal.
pub const DEC_MAX_LEN: usize = 20;

/// Renders `n` as `0x` followed by exactly 16 lowercase hex digits.
pub fn fmt_hex(n: u64, buf: &mut [u8; HEX_LEN]) -> &[u8] {
    buf[0] = b'0';
    buf[1] = b'x';
    for (i, slot) in buf[2..].iter_mut().enumerate() {
        let shift = 4 * (15 - i);
        *slot = HEX_DIGITS[((n >> shift) & 0xf) as usize];
    }
    &buf[..]
}

/// Renders `n` in decimal, zero padded to [`DEC_WIDTH`] digits. Wider values
/// keep all their digits.
pub fn fmt_dec(n: u64, buf: &mut [u8; DEC_MAX_LEN]) -> &[u8] {
    let mut i = DEC_MAX_LEN;
    let mut v = n;
    loop {
        i -= 1;
        buf[i] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    let start = i.min(DEC_MAX_LEN - DEC_WIDTH);
    buf[start..i].fill(b'0');
    &buf[start..]
}
